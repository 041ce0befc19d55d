use crate::core::model::value::Value;
use std::cmp::Ordering;
use std::fmt;
use std::fmt::{Display, Formatter};

/// KeyRange is a half-open interval `[start, end)` of the key space.
/// A missing start stands for −∞, a missing end for +∞.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct KeyRange {
    start: Option<Value>,
    end: Option<Value>,
}

/// Orders two range ends where `None` is +∞.
pub fn cmp_end(a: &Option<Value>, b: &Option<Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(x), Some(y)) => x.cmp(y),
    }
}

/// Orders two range starts where `None` is −∞.
pub fn cmp_start(a: &Option<Value>, b: &Option<Value>) -> Ordering {
    // Option's own ordering already puts None first.
    a.cmp(b)
}

impl KeyRange {
    pub fn new(start: Option<Value>, end: Option<Value>) -> KeyRange {
        KeyRange { start, end }
    }

    /// The whole key space.
    pub fn unbounded() -> KeyRange {
        KeyRange::default()
    }

    pub fn start(&self) -> Option<&Value> {
        self.start.as_ref()
    }

    pub fn end(&self) -> Option<&Value> {
        self.end.as_ref()
    }

    pub fn start_bound(&self) -> &Option<Value> {
        &self.start
    }

    pub fn end_bound(&self) -> &Option<Value> {
        &self.end
    }

    /// `start <= value < end`.
    pub fn contains(&self, value: &Value) -> bool {
        self.starts_at_or_before(value) && self.ends_after(value)
    }

    /// `start <= value`.
    pub fn starts_at_or_before(&self, value: &Value) -> bool {
        self.start.as_ref().is_none_or(|s| s <= value)
    }

    /// `value < end`.
    pub fn ends_after(&self, value: &Value) -> bool {
        self.end.as_ref().is_none_or(|e| value < e)
    }

    pub fn is_empty(&self) -> bool {
        match (&self.start, &self.end) {
            (Some(s), Some(e)) => s >= e,
            _ => false,
        }
    }

    /// True unless a gap separates the two ranges; adjacent ranges touch.
    pub fn touches_or_overlaps(&self, other: &KeyRange) -> bool {
        let gap = |end: &Option<Value>, start: &Option<Value>| match (end, start) {
            (Some(e), Some(s)) => e < s,
            _ => false,
        };
        !gap(&self.end, &other.start) && !gap(&other.end, &self.start)
    }

    /// Smallest range covering both; an open bound on either side absorbs the other.
    pub fn union(&self, other: &KeyRange) -> KeyRange {
        let start = match cmp_start(&self.start, &other.start) {
            Ordering::Greater => other.start.clone(),
            _ => self.start.clone(),
        };
        let end = match cmp_end(&self.end, &other.end) {
            Ordering::Less => other.end.clone(),
            _ => self.end.clone(),
        };
        KeyRange { start, end }
    }

    /// The common part of both ranges, if any.
    pub fn intersect(&self, other: &KeyRange) -> Option<KeyRange> {
        let start = match cmp_start(&self.start, &other.start) {
            Ordering::Less => other.start.clone(),
            _ => self.start.clone(),
        };
        let end = match cmp_end(&self.end, &other.end) {
            Ordering::Greater => other.end.clone(),
            _ => self.end.clone(),
        };
        let range = KeyRange { start, end };
        if range.is_empty() {
            None
        } else {
            Some(range)
        }
    }

    /// Cuts the range at `boundary` into `[start, boundary)` and `[boundary, end)`.
    pub fn split_at(&self, boundary: &Value) -> (KeyRange, KeyRange) {
        (
            KeyRange::new(self.start.clone(), Some(boundary.clone())),
            KeyRange::new(Some(boundary.clone()), self.end.clone()),
        )
    }

    pub fn size_bytes(&self) -> usize {
        2 + self.start.as_ref().map_or(0, Value::size_bytes) + self.end.as_ref().map_or(0, Value::size_bytes)
    }
}

impl Display for KeyRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.start {
            Some(s) => write!(f, "[{}, ", s)?,
            None => write!(f, "[-inf, ")?,
        }
        match &self.end {
            Some(e) => write!(f, "{})", e),
            None => write!(f, "+inf)"),
        }
    }
}
