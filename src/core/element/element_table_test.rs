use crate::core::element::ElementTable;
use crate::core::model::element::Element;
use crate::core::model::range::KeyRange;
use crate::core::model::time::Timestamp;
use crate::core::model::value::Value;
use crate::core::testutil::fixtures::{
    element, random_elements, random_peer_contact, range, table_with_values,
};
use std::collections::HashSet;
use std::time::Duration;

fn values_of(table: &ElementTable) -> Vec<i64> {
    table
        .elements()
        .iter()
        .map(|e| e.value().to_string().parse::<i64>().unwrap())
        .collect()
}

/// Asserts that the parts partition `original`: contiguous ranges covering it and the same elements.
fn assert_partition(original: &ElementTable, parts: &[&ElementTable]) {
    let total: usize = parts.iter().map(|p| p.len()).sum();
    assert_eq!(total, original.len());

    for pair in parts.windows(2) {
        assert_eq!(pair[0].range().end_bound(), pair[1].range().start_bound());
    }
    assert_eq!(parts[0].range().start_bound(), original.range().start_bound());
    assert_eq!(
        parts[parts.len() - 1].range().end_bound(),
        original.range().end_bound()
    );

    let mut seen: HashSet<Element> = HashSet::new();
    for part in parts {
        for e in part.iter() {
            assert!(part.range().contains(e.value()), "{} outside {}", e, part.range());
            assert!(seen.insert(e.clone()), "{} appears twice", e);
        }
    }
    for e in original.iter() {
        assert!(seen.contains(e));
    }
}

#[test]
fn test_add_rejects_out_of_range_elements() {
    let mut table = ElementTable::new(range(Some(0), Some(100)));
    let owner = random_peer_contact();
    assert!(table.add(element("cpu", 0, owner)));
    assert!(table.add(element("cpu", 99, owner)));
    assert!(!table.add(element("cpu", 100, owner)));
    assert!(!table.add(element("cpu", -1, owner)));
    assert_eq!(table.len(), 2);
}

/// Re-adding an element the table holds keeps the size and refreshes the timestamp.
#[test]
fn test_add_is_idempotent_and_refreshes() {
    let mut table = ElementTable::new(KeyRange::unbounded());
    let owner = random_peer_contact();
    let e = Element::new("cpu", Value::from(7), owner, Timestamp::from_millis(10));
    assert!(table.add(e.clone()));
    assert!(table.add(e.refreshed(Timestamp::from_millis(50))));
    assert_eq!(table.len(), 1);
    assert_eq!(table.iter().next().unwrap().timestamp(), Timestamp::from_millis(50));

    // an older confirmation never moves the timestamp back
    assert!(table.add(e.refreshed(Timestamp::from_millis(20))));
    assert_eq!(table.iter().next().unwrap().timestamp(), Timestamp::from_millis(50));
}

#[test]
fn test_remove_reports_presence() {
    let mut table = table_with_values(KeyRange::unbounded(), &[1, 2, 3]);
    let second = table.elements()[1].clone();
    assert!(table.remove(&second));
    assert!(!table.remove(&second));
    assert_eq!(values_of(&table), vec![1, 3]);
}

#[test]
fn test_add_all_and_remove_all() {
    let mut table = ElementTable::new(range(Some(0), None));
    let elements = random_elements("cpu", 20);
    assert_eq!(table.add_all(elements.clone()), 20);
    assert_eq!(table.remove_all(elements[..5].iter()), 5);
    assert_eq!(table.len(), 15);
}

#[test]
fn test_elements_stay_in_value_order() {
    let mut table = table_with_values(KeyRange::unbounded(), &[30, 10, 20, -5]);
    assert_eq!(values_of(&table), vec![-5, 10, 20, 30]);
    let owner = random_peer_contact();
    table.add(element("cpu", 15, owner));
    assert_eq!(values_of(&table), vec![-5, 10, 15, 20, 30]);
}

#[test]
fn test_purge_drops_expired_elements() {
    let mut table = ElementTable::new(KeyRange::unbounded());
    let owner = random_peer_contact();
    table.add(Element::new("cpu", Value::from(1), owner, Timestamp::from_millis(1_000)));
    table.add(Element::new("cpu", Value::from(2), owner, Timestamp::from_millis(9_000)));

    let purged = table.purge(Timestamp::from_millis(10_000), Duration::from_secs(5));
    assert_eq!(purged, 1);
    assert_eq!(values_of(&table), vec![2]);
}

/// Values 5, 10, 25, 50, 60; the query [10, 50] answers the owners of 10, 25 and 50.
#[test]
fn test_get_contacts_inclusive_end() {
    let owners: Vec<_> = (0..5).map(|_| random_peer_contact()).collect();
    let values = [5, 10, 25, 50, 60];
    let elements = values
        .iter()
        .zip(owners.iter())
        .map(|(v, o)| element("cpu", *v, *o))
        .collect();
    let table = ElementTable::with_elements(KeyRange::unbounded(), elements).unwrap();

    let result = table.get_contacts(
        "cpu",
        Some(&Value::from(10)),
        Some(&Value::from(50)),
        0,
        false,
    );
    assert_eq!(result, vec![owners[1], owners[2], owners[3]]);

    let result = table.get_contacts(
        "cpu",
        Some(&Value::from(10)),
        Some(&Value::from(50)),
        0,
        true,
    );
    assert_eq!(result, vec![owners[1], owners[2]]);
}

#[test]
fn test_get_contacts_filters_dimension_and_limit() {
    let owner_a = random_peer_contact();
    let owner_b = random_peer_contact();
    let elements = vec![
        element("cpu", 1, owner_a),
        element("mem", 2, owner_b),
        element("cpu", 3, owner_a),
        element("cpu", 4, owner_b),
    ];
    let table = ElementTable::with_elements(KeyRange::unbounded(), elements).unwrap();

    // owner_a is reported once even though it owns two matching elements
    assert_eq!(table.get_contacts("cpu", None, None, 0, false), vec![owner_a, owner_b]);
    assert_eq!(table.get_contacts("cpu", None, None, 1, false), vec![owner_a]);
    assert_eq!(table.get_contacts("mem", None, None, 0, false), vec![owner_b]);
    assert!(table.get_contacts("disk", None, None, 0, false).is_empty());
}

/// 60 elements in [0, +inf) split in half: sizes sum to 60 and the ranges meet.
#[test]
fn test_split_in_half_partitions_table() {
    let values: Vec<i64> = (0..60).collect();
    let table = table_with_values(range(Some(0), None), &values);
    let original = table.clone();

    let (lower, upper) = table.split(0.5).unwrap();
    assert_eq!(lower.len() + upper.len(), 60);
    assert_eq!(lower.len(), 30);
    assert_eq!(lower.range().start(), Some(&Value::from(0)));
    assert_partition(&original, &[&lower, &upper]);
}

#[test]
fn test_split_never_tears_duplicate_values() {
    let owners: Vec<_> = (0..6).map(|_| random_peer_contact()).collect();
    // three elements share the value 5
    let values = [1, 5, 5, 5, 8, 9];
    let elements = values
        .iter()
        .zip(owners.iter())
        .map(|(v, o)| element("cpu", *v, *o))
        .collect();
    let table = ElementTable::with_elements(KeyRange::unbounded(), elements).unwrap();
    let original = table.clone();

    let (lower, upper) = table.split_at(2).unwrap();
    assert_eq!(values_of(&lower), vec![1, 5, 5, 5]);
    assert_eq!(upper.range().start(), Some(&Value::from(8)));
    assert_partition(&original, &[&lower, &upper]);
}

#[test]
fn test_split_fails_when_all_values_equal() {
    let owners: Vec<_> = (0..3).map(|_| random_peer_contact()).collect();
    let elements = owners.iter().map(|o| element("cpu", 4, *o)).collect();
    let table = ElementTable::with_elements(KeyRange::unbounded(), elements).unwrap();
    assert!(table.split(0.5).is_err());
    assert!(ElementTable::new(KeyRange::unbounded()).split(0.5).is_err());
}

#[test]
fn test_split_counts_into_three_parts() {
    let values: Vec<i64> = (0..20).collect();
    let table = table_with_values(range(None, Some(100)), &values);
    let original = table.clone();

    let split = table.split_counts(4, 6).unwrap();
    let prev = split.prev.as_ref().unwrap();
    let next = split.next.as_ref().unwrap();
    assert_eq!(prev.len(), 4);
    assert_eq!(split.retained.len(), 10);
    assert_eq!(next.len(), 6);
    assert_eq!(split.total_len(), 20);
    assert_partition(&original, &[prev, &split.retained, next]);
}

#[test]
fn test_split_counts_omits_empty_outer_parts() {
    let values: Vec<i64> = (0..10).collect();
    let table = table_with_values(range(Some(0), Some(10)), &values);
    let original = table.clone();

    let split = table.split_counts(0, 3).unwrap();
    assert!(split.prev.is_none());
    let next = split.next.as_ref().unwrap();
    assert_eq!(next.len(), 3);
    assert_partition(&original, &[&split.retained, next]);

    let split = table.split_counts(3, 0).unwrap();
    assert!(split.next.is_none());
    assert_partition(&original, &[split.prev.as_ref().unwrap(), &split.retained]);
}

/// Handing every element to the neighbors leaves an empty middle with an empty range.
#[test]
fn test_split_counts_whole_table() {
    let values: Vec<i64> = (0..10).collect();
    let table = table_with_values(range(None, None), &values);
    let original = table.clone();

    let split = table.split_counts(4, 6).unwrap();
    assert!(split.retained.is_empty());
    assert!(split.retained.range().is_empty());
    assert_partition(
        &original,
        &[split.prev.as_ref().unwrap(), &split.retained, split.next.as_ref().unwrap()],
    );
    assert!(table.split_counts(6, 6).is_err());
}

#[test]
fn test_merge_adjacent_tables() {
    let a = table_with_values(range(None, Some(10)), &[1, 2, 3]);
    let b = table_with_values(range(Some(10), Some(20)), &[10, 15]);
    let merged = ElementTable::merge(&a, &b).unwrap();
    assert_eq!(merged.range(), &range(None, Some(20)));
    assert_eq!(values_of(&merged), vec![1, 2, 3, 10, 15]);

    // merge is symmetric
    let reverse = ElementTable::merge(&b, &a).unwrap();
    assert_eq!(reverse, merged);
    assert_eq!(values_of(&a), vec![1, 2, 3]);
}

#[test]
fn test_merge_overlapping_tables_deduplicates() {
    let owner = random_peer_contact();
    let shared = element("cpu", 5, owner);
    let a = ElementTable::with_elements(range(Some(0), Some(8)), vec![shared.clone()]).unwrap();
    let b = ElementTable::with_elements(range(Some(4), Some(12)), vec![shared]).unwrap();
    let merged = ElementTable::merge(&a, &b).unwrap();
    assert_eq!(merged.len(), 1);
    assert_eq!(merged.range(), &range(Some(0), Some(12)));
}

#[test]
fn test_merge_refuses_disjoint_tables() {
    let a = table_with_values(range(Some(0), Some(5)), &[1]);
    let b = table_with_values(range(Some(6), Some(9)), &[7]);
    assert!(ElementTable::merge(&a, &b).is_none());
}

/// Splitting and merging the parts back reconstructs the original table.
#[test]
fn test_merge_inverts_split() {
    for _ in 0..10 {
        let elements = random_elements("cpu", 40);
        let table = ElementTable::with_elements(range(Some(0), None), elements).unwrap();
        let original = table.clone();

        let split = table.split_counts(7, 11).unwrap();
        let prev = split.prev.unwrap();
        let next = split.next.unwrap();
        let lower = ElementTable::merge(&prev, &split.retained).unwrap();
        let whole = ElementTable::merge(&lower, &next).unwrap();
        assert_eq!(whole, original);
    }
}
