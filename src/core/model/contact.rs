use crate::core::model::prefix::LevelPrefix;
use crate::core::model::range::KeyRange;
use crate::core::model::IDENTIFIER_SIZE_BYTES;
use crate::core::Identifier;
use std::fmt;
use std::fmt::{Display, Formatter};

/// SkipgraphContact is a value snapshot of a skip graph node as seen by another node:
/// its identifier, the key range it owned and its contact table prefix when the snapshot was taken.
/// Contacts are never live handles; a stale snapshot is refreshed by replacing it.
#[derive(Clone, Debug)]
pub struct SkipgraphContact {
    node_id: Identifier,
    range: KeyRange,
    prefix: LevelPrefix,
}

impl SkipgraphContact {
    pub fn new(node_id: Identifier, range: KeyRange, prefix: LevelPrefix) -> SkipgraphContact {
        SkipgraphContact {
            node_id,
            range,
            prefix,
        }
    }

    pub fn node_id(&self) -> &Identifier {
        &self.node_id
    }

    pub fn range(&self) -> &KeyRange {
        &self.range
    }

    pub fn prefix(&self) -> &LevelPrefix {
        &self.prefix
    }

    pub fn is(&self, node_id: &Identifier) -> bool {
        &self.node_id == node_id
    }

    /// Compares two snapshots; the prefix only counts when prefix optimization is on,
    /// since only then do peers route on the prefix they learned.
    pub fn matches(&self, other: &SkipgraphContact, prefix_aware: bool) -> bool {
        self == other && (!prefix_aware || self.prefix == other.prefix)
    }

    pub fn size_bytes(&self) -> usize {
        IDENTIFIER_SIZE_BYTES + self.range.size_bytes() + self.prefix.size_bytes()
    }
}

impl PartialEq for SkipgraphContact {
    fn eq(&self, other: &Self) -> bool {
        self.node_id == other.node_id && self.range == other.range
    }
}

impl Eq for SkipgraphContact {}

impl Display for SkipgraphContact {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.node_id.short(), self.range)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::value::Value;
    use crate::core::testutil::fixtures::random_identifier;

    #[test]
    fn test_equality_ignores_prefix_unless_asked() {
        let id = random_identifier();
        let range = KeyRange::new(Some(Value::from(1)), None);
        let a = SkipgraphContact::new(id, range.clone(), LevelPrefix::new());
        let b = SkipgraphContact::new(
            id,
            range,
            LevelPrefix::new().with_bit(1, true).unwrap(),
        );
        assert_eq!(a, b);
        assert!(a.matches(&b, false));
        assert!(!a.matches(&b, true));
    }

    #[test]
    fn test_equality_includes_range() {
        let id = random_identifier();
        let a = SkipgraphContact::new(id, KeyRange::unbounded(), LevelPrefix::new());
        let b = SkipgraphContact::new(
            id,
            KeyRange::new(None, Some(Value::from(3))),
            LevelPrefix::new(),
        );
        assert_ne!(a, b);
        assert!(a.is(b.node_id()));
    }
}
