use crate::core::model::peer_contact::PeerContact;
use crate::core::model::time::Timestamp;
use crate::core::model::value::Value;
use std::cmp::Ordering;
use std::fmt;
use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};

/// Element is one indexed record: the owner published `value` for `dimension` at `timestamp`.
///
/// Two elements are the same record iff dimension, owner and value match; the timestamp only
/// tells how fresh the record is. Elements sort by value, then by dimension and owner, so a
/// sorted table can be cut at value boundaries.
#[derive(Clone, Debug)]
pub struct Element {
    dimension: String,
    value: Value,
    owner: PeerContact,
    timestamp: Timestamp,
}

impl Element {
    pub fn new(dimension: &str, value: Value, owner: PeerContact, timestamp: Timestamp) -> Element {
        Element {
            dimension: dimension.to_string(),
            value,
            owner,
            timestamp,
        }
    }

    pub fn dimension(&self) -> &str {
        &self.dimension
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn owner(&self) -> &PeerContact {
        &self.owner
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// A copy of this element confirmed again at `timestamp`.
    pub fn refreshed(&self, timestamp: Timestamp) -> Element {
        Element {
            timestamp,
            ..self.clone()
        }
    }

    /// An element is well formed when every field carries a usable value.
    pub fn is_well_formed(&self) -> bool {
        !self.dimension.trim().is_empty()
    }

    pub fn size_bytes(&self) -> usize {
        self.dimension.len() + self.value.size_bytes() + self.owner.size_bytes() + 8
    }
}

impl PartialEq for Element {
    fn eq(&self, other: &Self) -> bool {
        self.dimension == other.dimension
            && self.owner.id() == other.owner.id()
            && self.value == other.value
    }
}

impl Eq for Element {}

impl Hash for Element {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.dimension.hash(state);
        self.owner.id().hash(state);
        self.value.hash(state);
    }
}

impl Ord for Element {
    fn cmp(&self, other: &Self) -> Ordering {
        self.value
            .cmp(&other.value)
            .then_with(|| self.dimension.cmp(&other.dimension))
            .then_with(|| self.owner.id().cmp(other.owner.id()))
    }
}

impl PartialOrd for Element {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Display for Element {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}={} ({})", self.dimension, self.value, self.owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testutil::fixtures::random_peer_contact;

    #[test]
    fn test_element_identity_ignores_timestamp() {
        let owner = random_peer_contact();
        let a = Element::new("cpu", Value::from(4), owner, Timestamp::from_millis(1));
        let b = a.refreshed(Timestamp::from_millis(99));
        assert_eq!(a, b);
        assert_eq!(b.timestamp(), Timestamp::from_millis(99));

        let other_owner = Element::new("cpu", Value::from(4), random_peer_contact(), Timestamp::ZERO);
        assert_ne!(a, other_owner);

        let other_dimension = Element::new("mem", Value::from(4), owner, Timestamp::ZERO);
        assert_ne!(a, other_dimension);
    }

    #[test]
    fn test_elements_order_by_value_first() {
        let owner = random_peer_contact();
        let low = Element::new("zzz", Value::from(1), owner, Timestamp::ZERO);
        let high = Element::new("aaa", Value::from(2), owner, Timestamp::ZERO);
        assert!(low < high);
    }

    #[test]
    fn test_well_formed_requires_dimension() {
        let owner = random_peer_contact();
        assert!(Element::new("cpu", Value::from(1), owner, Timestamp::ZERO).is_well_formed());
        assert!(!Element::new(" ", Value::from(1), owner, Timestamp::ZERO).is_well_formed());
    }
}
