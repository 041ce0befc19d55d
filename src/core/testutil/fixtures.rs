mod test_imports {
    pub use crate::core::element::ElementTable;
    pub use crate::core::model::address::Address;
    pub use crate::core::model::contact::SkipgraphContact;
    pub use crate::core::model::element::Element;
    pub use crate::core::model::peer_contact::PeerContact;
    pub use crate::core::model::prefix::LevelPrefix;
    pub use crate::core::model::range::KeyRange;
    pub use crate::core::model::time::Timestamp;
    pub use crate::core::model::value::Value;
    pub use crate::core::Identifier;
    pub use rand::Rng;
}

use std::time::Duration;
use test_imports::*;
use tracing::Span;

/// Root span for components under test.
pub fn span_fixture() -> Span {
    tracing::span!(tracing::Level::TRACE, "test")
}

/// Generate a random identifier.
pub fn random_identifier() -> Identifier {
    Identifier::random(&mut rand::rng())
}

/// Generate n random identifiers sorted in ascending order.
pub fn random_sorted_identifiers(n: usize) -> Vec<Identifier> {
    let mut ids = (0..n).map(|_| random_identifier()).collect::<Vec<_>>();
    ids.sort();
    ids
}

/// Generate a random port.
pub fn random_port() -> u16 {
    rand::rng().random_range(1024..=65535)
}

/// Generate a random address.
pub fn random_address() -> Address {
    Address::new("localhost", &random_port().to_string())
}

/// Generate a random element owner.
pub fn random_peer_contact() -> PeerContact {
    PeerContact::new(random_identifier(), random_address())
}

/// A range from optional integer bounds.
pub fn range(start: Option<i64>, end: Option<i64>) -> KeyRange {
    KeyRange::new(start.map(Value::from), end.map(Value::from))
}

/// An element of `dimension` at `value` owned by `owner`, stamped at time zero.
pub fn element(dimension: &str, value: i64, owner: PeerContact) -> Element {
    Element::new(dimension, Value::from(value), owner, Timestamp::ZERO)
}

/// Generate n elements of `dimension` with distinct values in `0..1000 * n`, each with its own owner.
pub fn random_elements(dimension: &str, n: usize) -> Vec<Element> {
    let mut values = std::collections::BTreeSet::new();
    let mut rng = rand::rng();
    while values.len() < n {
        values.insert(rng.random_range(0..(1000 * n.max(1)) as i64));
    }
    values
        .into_iter()
        .map(|v| element(dimension, v, random_peer_contact()))
        .collect()
}

/// A table over `range` holding one "cpu" element per value, each with its own owner.
pub fn table_with_values(range: KeyRange, values: &[i64]) -> ElementTable {
    let elements = values
        .iter()
        .map(|v| element("cpu", *v, random_peer_contact()))
        .collect();
    ElementTable::with_elements(range, elements).expect("values must lie in the range")
}

/// A contact snapshot with the given id and integer range bounds.
pub fn contact(id: Identifier, start: Option<i64>, end: Option<i64>) -> SkipgraphContact {
    SkipgraphContact::new(id, range(start, end), LevelPrefix::new())
}

/// A contact with a random id and the given integer range bounds.
pub fn random_contact(start: Option<i64>, end: Option<i64>) -> SkipgraphContact {
    contact(random_identifier(), start, end)
}

/// Polls `condition` until it holds or `timeout` elapses.
pub async fn wait_until<F>(mut condition: F, timeout: Duration) -> Result<(), String>
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    if condition() {
        Ok(())
    } else {
        Err("condition not met before timeout".to_string())
    }
}

mod test {
    use crate::core::element::ElementTable;

    /// Random elements carry distinct values, so a table built from them keeps all of them.
    #[test]
    fn test_random_elements_are_distinct() {
        let elements = super::random_elements("cpu", 100);
        let table =
            ElementTable::with_elements(super::KeyRange::unbounded(), elements).unwrap();
        assert_eq!(table.len(), 100);
    }
}
