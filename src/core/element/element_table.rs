use crate::core::model::element::Element;
use crate::core::model::peer_contact::PeerContact;
use crate::core::model::range::KeyRange;
use crate::core::model::time::Timestamp;
use crate::core::model::value::Value;
use anyhow::anyhow;
use std::collections::HashSet;
use std::fmt;
use std::fmt::{Debug, Formatter};
use std::time::Duration;

/// ElementTable is the bucket a skip graph node owns: the elements whose values fall in the
/// node's key range, together with that range.
///
/// Every stored element lies in `range`. Elements are kept in value order, so lookups and cuts
/// are binary searches.
#[derive(Clone)]
pub struct ElementTable {
    elements: Vec<Element>,
    range: KeyRange,
}

/// TableSplit is the outcome of cutting a table into a lower, a middle and an upper part.
/// The three ranges are contiguous and together cover the original range.
#[derive(Clone, Debug)]
pub struct TableSplit {
    pub prev: Option<ElementTable>,
    pub retained: ElementTable,
    pub next: Option<ElementTable>,
}

impl TableSplit {
    pub fn total_len(&self) -> usize {
        self.prev.as_ref().map_or(0, ElementTable::len)
            + self.retained.len()
            + self.next.as_ref().map_or(0, ElementTable::len)
    }
}

impl ElementTable {
    /// Create an empty table responsible for `range`.
    pub fn new(range: KeyRange) -> ElementTable {
        ElementTable {
            elements: Vec::new(),
            range,
        }
    }

    /// Create a table holding `elements`; every element must lie in `range`.
    pub fn with_elements(range: KeyRange, elements: Vec<Element>) -> anyhow::Result<ElementTable> {
        if let Some(outside) = elements.iter().find(|e| !range.contains(e.value())) {
            return Err(anyhow!("element {} lies outside of range {}", outside, range));
        }
        let mut table = ElementTable::new(range);
        for element in elements {
            table.insert_or_refresh(element);
        }
        Ok(table)
    }

    pub fn range(&self) -> &KeyRange {
        &self.range
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Elements in value order.
    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    pub fn iter(&self) -> impl Iterator<Item = &Element> {
        self.elements.iter()
    }

    pub fn contains(&self, element: &Element) -> bool {
        self.elements.binary_search(element).is_ok()
    }

    /// Adds one element. An element outside the range is refused. Adding an element the table
    /// already holds keeps the size unchanged and refreshes the stored timestamp.
    pub fn add(&mut self, element: Element) -> bool {
        if !self.range.contains(element.value()) {
            return false;
        }
        self.insert_or_refresh(element);
        true
    }

    /// Removes one element; reports whether it was present.
    pub fn remove(&mut self, element: &Element) -> bool {
        match self.elements.binary_search(element) {
            Ok(index) => {
                self.elements.remove(index);
                true
            }
            Err(_) => false,
        }
    }

    /// Adds every element, returning how many were accepted.
    pub fn add_all(&mut self, elements: impl IntoIterator<Item = Element>) -> usize {
        let mut added = 0;
        for element in elements {
            if self.add(element) {
                added += 1;
            }
        }
        added
    }

    /// Removes every element, returning how many were present.
    pub fn remove_all<'a>(&mut self, elements: impl IntoIterator<Item = &'a Element>) -> usize {
        let mut removed = 0;
        for element in elements {
            if self.remove(element) {
                removed += 1;
            }
        }
        removed
    }

    /// Drops elements not confirmed within `window` before `now`; returns how many were dropped.
    pub fn purge(&mut self, now: Timestamp, window: Duration) -> usize {
        let threshold = now.saturating_sub(window);
        let before = self.elements.len();
        self.elements.retain(|e| e.timestamp() >= threshold);
        before - self.elements.len()
    }

    /// Owners of the elements of `dimension` whose value is at least `start` and below `end`
    /// (at most `end` when `exclude_end` is false). Missing bounds are open. Stops once `limit`
    /// distinct owners were found; a limit of zero means no limit.
    pub fn get_contacts(
        &self,
        dimension: &str,
        start: Option<&Value>,
        end: Option<&Value>,
        limit: usize,
        exclude_end: bool,
    ) -> Vec<PeerContact> {
        let first = match start {
            Some(s) => self.elements.partition_point(|e| e.value() < s),
            None => 0,
        };

        let mut seen = HashSet::new();
        let mut contacts = Vec::new();
        for element in &self.elements[first..] {
            let past_end = match end {
                Some(e) if exclude_end => element.value() >= e,
                Some(e) => element.value() > e,
                None => false,
            };
            if past_end {
                break;
            }
            if element.dimension() != dimension {
                continue;
            }
            if seen.insert(*element.owner()) {
                contacts.push(*element.owner());
                if limit > 0 && contacts.len() >= limit {
                    break;
                }
            }
        }
        contacts
    }

    /// Cuts the table in two at `ratio` of its elements. The cut moves forward past equal values
    /// so no value is shared by both halves; the upper half starts at the first value it holds.
    pub fn split(&self, ratio: f64) -> anyhow::Result<(ElementTable, ElementTable)> {
        if !(0.0..=1.0).contains(&ratio) {
            return Err(anyhow!("split ratio {} must be within [0, 1]", ratio));
        }
        let len = self.len();
        if len < 2 {
            return Err(anyhow!("a table of {} elements cannot be split", len));
        }
        let index = ((len as f64 * ratio).round() as usize).clamp(1, len - 1);
        self.split_at(index)
    }

    /// Cuts the table after its first `index` elements, adjusted forward past equal values.
    pub fn split_at(&self, index: usize) -> anyhow::Result<(ElementTable, ElementTable)> {
        let cut = self.boundary_at(index);
        if cut == 0 || cut >= self.len() {
            return Err(anyhow!(
                "cannot split {} elements at {} without tearing a value",
                self.len(),
                index
            ));
        }
        let boundary = self.elements[cut].value().clone();
        let (lower_range, upper_range) = self.range.split_at(&boundary);
        Ok((
            self.sub_table(0, cut, lower_range),
            self.sub_table(cut, self.len(), upper_range),
        ))
    }

    /// Cuts the table into a lower part of the first `m` elements, an upper part of the last `n`
    /// elements and the retained middle. A part of zero elements is omitted, except the middle
    /// which always exists, possibly empty. Cuts move forward past equal values, so the lower part
    /// may grow and the upper part may shrink; the total number of elements never changes.
    pub fn split_counts(&self, m: usize, n: usize) -> anyhow::Result<TableSplit> {
        let len = self.len();
        if m + n > len {
            return Err(anyhow!(
                "cannot take {} + {} elements out of a table of {}",
                m,
                n,
                len
            ));
        }

        let lower_cut = if m > 0 { self.boundary_at(m) } else { 0 };
        if m > 0 && lower_cut >= len {
            return Err(anyhow!(
                "cannot cut the first {} of {} elements without tearing a value",
                m,
                len
            ));
        }
        let upper_cut = if n > 0 {
            self.boundary_at((len - n).max(lower_cut))
        } else {
            len
        };

        let mut remaining = self.range.clone();
        let prev = if lower_cut > 0 {
            let (lower_range, rest) = remaining.split_at(self.elements[lower_cut].value());
            remaining = rest;
            Some(self.sub_table(0, lower_cut, lower_range))
        } else {
            None
        };
        let next = if upper_cut < len {
            let (rest, upper_range) = remaining.split_at(self.elements[upper_cut].value());
            remaining = rest;
            Some(self.sub_table(upper_cut, len, upper_range))
        } else {
            None
        };
        let retained = self.sub_table(lower_cut, upper_cut, remaining);

        Ok(TableSplit {
            prev,
            retained,
            next,
        })
    }

    /// Merges two tables whose ranges overlap or touch into one covering both.
    /// Returns `None` when a gap separates the ranges. Elements present in both are kept once,
    /// with the later timestamp.
    pub fn merge(a: &ElementTable, b: &ElementTable) -> Option<ElementTable> {
        if !a.range.touches_or_overlaps(&b.range) {
            return None;
        }
        let mut merged = ElementTable::new(a.range.union(&b.range));
        merged.elements.reserve(a.len() + b.len());
        for element in a.elements.iter().chain(b.elements.iter()) {
            merged.insert_or_refresh(element.clone());
        }
        Some(merged)
    }

    pub fn size_bytes(&self) -> usize {
        self.range.size_bytes() + self.elements.iter().map(Element::size_bytes).sum::<usize>()
    }

    fn insert_or_refresh(&mut self, element: Element) {
        match self.elements.binary_search(&element) {
            Ok(index) => {
                let existing = &mut self.elements[index];
                if element.timestamp() > existing.timestamp() {
                    *existing = existing.refreshed(element.timestamp());
                }
            }
            Err(index) => self.elements.insert(index, element),
        }
    }

    /// First index at or after `index` where the value changes, so a cut there tears no value.
    fn boundary_at(&self, index: usize) -> usize {
        let mut cut = index.min(self.len());
        while cut > 0 && cut < self.len() && self.elements[cut].value() == self.elements[cut - 1].value()
        {
            cut += 1;
        }
        cut
    }

    fn sub_table(&self, from: usize, to: usize, range: KeyRange) -> ElementTable {
        ElementTable {
            elements: self.elements[from..to].to_vec(),
            range,
        }
    }
}

impl PartialEq for ElementTable {
    /// Tables are equal when they cover the same range and hold the same set of elements.
    fn eq(&self, other: &Self) -> bool {
        if self.range != other.range || self.len() != other.len() {
            return false;
        }
        let mine: HashSet<&Element> = self.elements.iter().collect();
        other.elements.iter().all(|e| mine.contains(e))
    }
}

impl Debug for ElementTable {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElementTable")
            .field("range", &self.range.to_string())
            .field("len", &self.elements.len())
            .finish()
    }
}
