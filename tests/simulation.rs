use skipgraph_index::core::model::range::cmp_start;
use skipgraph_index::core::{
    Address, Config, Direction, Element, Identifier, NodeController, PeerContact, Timestamp,
    UpdateBatch, Value,
};
use skipgraph_index::network::sim::SimHub;
use skipgraph_index::protocol::SearchQuery;
use std::collections::HashSet;
use tracing::Span;

const PEERS: usize = 8;
const ELEMENTS: usize = 60;

fn span() -> Span {
    tracing::span!(tracing::Level::TRACE, "simulation")
}

/// The element at `10 * i`, owned by a peer of its own.
fn element(i: usize) -> Element {
    let owner = PeerContact::new(
        Identifier::from_u64(i as u64 + 1),
        Address::new("localhost", &(9000 + i).to_string()),
    );
    Element::new("cpu", Value::from_i64(10 * i as i64), owner, Timestamp::ZERO)
}

fn config(load_balancing: bool, parallel_search: bool) -> Config {
    Config::builder()
        .table_size(3, 10)
        .load_balancing(load_balancing)
        .parallel_search(parallel_search)
        .build()
        .unwrap()
}

/// Adds the peers first, so the root of every key is fixed, then bootstraps at the first peer
/// that finds an identifier it is root of.
fn bootstrapped_hub(config: Config, seed: u64) -> (SimHub, Identifier) {
    let mut hub = SimHub::new(&span(), config, seed).unwrap();
    for _ in 0..PEERS {
        hub.add_peer().unwrap();
    }
    for peer in hub.peer_ids() {
        if hub.bootstrap(&peer).is_ok() {
            return (hub, peer);
        }
    }
    panic!("no peer could bootstrap");
}

/// Publishes `ELEMENTS` elements at `peer` in batches of ten and lets the graph settle.
fn grown_hub(config: Config, seed: u64) -> (SimHub, Identifier) {
    let (mut hub, peer) = bootstrapped_hub(config, seed);
    for chunk in (0..ELEMENTS).collect::<Vec<_>>().chunks(10) {
        let batch = UpdateBatch::new(chunk.iter().map(|i| element(*i)).collect(), Vec::new());
        let outcome = hub.update(&peer, batch).unwrap();
        assert!(outcome.success);
    }
    hub.settle().unwrap();
    (hub, peer)
}

fn live_nodes(hub: &SimHub) -> Vec<&NodeController> {
    let mut nodes: Vec<&NodeController> = hub.nodes().filter(|n| !n.is_disabled()).collect();
    nodes.sort_by(|a, b| cmp_start(a.node().range().start_bound(), b.node().range().start_bound()));
    nodes
}

/// Level 0 is a sorted list whose ranges cover the key space without gaps or overlaps, and
/// every next pointer is mirrored by a prev pointer.
fn assert_level_zero_consistent(hub: &SimHub) {
    let nodes = live_nodes(hub);
    assert!(!nodes.is_empty());
    assert!(nodes[0].node().range().start_bound().is_none());
    assert!(nodes[nodes.len() - 1].node().range().end_bound().is_none());
    for pair in nodes.windows(2) {
        let (low, high) = (pair[0], pair[1]);
        assert_eq!(low.node().range().end_bound(), high.node().range().start_bound());

        let next = low
            .node()
            .contact_table()
            .neighbor(0, Direction::Next)
            .expect("inner node without successor");
        assert!(next.is(high.id()), "{} skips {}", low.id(), high.id());
        let prev = high
            .node()
            .contact_table()
            .neighbor(0, Direction::Prev)
            .expect("inner node without predecessor");
        assert!(prev.is(low.id()));
    }
}

fn stored_elements(hub: &SimHub) -> usize {
    live_nodes(hub).iter().map(|n| n.size()).sum()
}

fn owners(range: std::ops::RangeInclusive<usize>) -> HashSet<PeerContact> {
    range.map(|i| *element(i).owner()).collect()
}

#[test]
fn test_graph_grows_by_splitting() {
    let (hub, _) = grown_hub(config(false, false), 11);

    assert!(live_nodes(&hub).len() > 1);
    assert_eq!(stored_elements(&hub), ELEMENTS);
    assert_level_zero_consistent(&hub);
    assert_eq!(hub.pending_operations(), 0);
    assert_eq!(hub.busy_slots(), 0);
    for node in live_nodes(&hub) {
        assert!(!node.is_locked());
        assert!(hub.substrate().root_of(node.id()).is_some());
        assert!(hub.substrate().record(node.id()).is_some());
    }
}

#[test]
fn test_graph_grows_with_load_balancing() {
    let (hub, _) = grown_hub(config(true, false), 12);

    assert!(live_nodes(&hub).len() > 1);
    assert_eq!(stored_elements(&hub), ELEMENTS);
    assert_level_zero_consistent(&hub);
    assert_eq!(hub.busy_slots(), 0);
}

#[test]
fn test_search_serial_and_parallel() {
    for (seed, parallel) in [(21, false), (22, true)] {
        let (mut hub, peer) = grown_hub(config(false, parallel), seed);

        let everything = hub.search(&peer, SearchQuery::new("cpu", None, None)).unwrap();
        assert!(everything.success);
        let found: HashSet<PeerContact> = everything.contacts.iter().copied().collect();
        assert_eq!(found, owners(0..=ELEMENTS - 1));
        assert!(!everything.hops.is_empty());

        let query = SearchQuery::new("cpu", Some(Value::from_i64(100)), Some(Value::from_i64(290)));
        let slice = hub.search(&peer, query).unwrap();
        assert!(slice.success);
        let found: HashSet<PeerContact> = slice.contacts.iter().copied().collect();
        assert_eq!(found, owners(10..=29));

        let query = SearchQuery::new("cpu", Some(Value::from_i64(100)), Some(Value::from_i64(290)))
            .excluding_end()
            .with_limit(5);
        let capped = hub.search(&peer, query).unwrap();
        assert!(capped.success);
        assert_eq!(capped.contacts.len(), 5);
        assert!(capped.contacts.iter().all(|c| owners(10..=28).contains(c)));
    }
}

#[test]
fn test_peer_without_nodes_cannot_start_operations() {
    let (mut hub, peer) = bootstrapped_hub(config(false, false), 31);
    let idle = hub
        .peer_ids()
        .into_iter()
        .find(|p| *p != peer && hub.peer(p).is_some_and(|p| p.nodes().count() == 0))
        .unwrap();

    let searched = hub.search(&idle, SearchQuery::new("cpu", None, None)).unwrap();
    assert!(!searched.success);
    let updated = hub
        .update(&idle, UpdateBatch::new(vec![element(1)], Vec::new()))
        .unwrap();
    assert!(!updated.success);
}

#[test]
fn test_nodes_leave_after_deletes() {
    let (mut hub, peer) = grown_hub(config(true, false), 41);
    let before = live_nodes(&hub).len();

    let doomed: Vec<Element> = (0..ELEMENTS - 10).map(element).collect();
    let outcome = hub.update(&peer, UpdateBatch::new(Vec::new(), doomed)).unwrap();
    assert!(outcome.success);
    // neighbors leaving at the same time refuse each other; the announce rounds retry
    let announce = hub.config().announce_interval;
    hub.run_for(announce * 4);
    hub.settle().unwrap();

    assert!(live_nodes(&hub).len() < before);
    assert!(hub.nodes().all(|n| !n.is_disabled()));
    assert_eq!(stored_elements(&hub), 10);
    assert_level_zero_consistent(&hub);
    assert_eq!(hub.pending_operations(), 0);
    assert_eq!(hub.busy_slots(), 0);

    let everything = hub.search(&peer, SearchQuery::new("cpu", None, None)).unwrap();
    assert!(everything.success);
    let found: HashSet<PeerContact> = everything.contacts.iter().copied().collect();
    assert_eq!(found, owners(ELEMENTS - 10..=ELEMENTS - 1));
}

#[test]
fn test_search_times_out_when_peers_are_unreachable() {
    let (mut hub, peer) = grown_hub(config(false, false), 51);
    let others: Vec<Identifier> = hub.peer_ids().into_iter().filter(|p| *p != peer).collect();
    assert!(others
        .iter()
        .any(|p| hub.peer(p).is_some_and(|p| p.nodes().count() > 0)));

    for other in &others {
        hub.isolate(other);
    }
    let outcome = hub.search(&peer, SearchQuery::new("cpu", None, None)).unwrap();
    assert!(!outcome.success);

    for other in &others {
        hub.heal(other);
    }
    hub.settle().unwrap();
    assert_eq!(hub.pending_operations(), 0);
    let outcome = hub.search(&peer, SearchQuery::new("cpu", None, None)).unwrap();
    assert!(outcome.success);
}

#[test]
fn test_nodes_of_crashed_peer_are_rehydrated() {
    let (mut hub, peer) = grown_hub(config(false, false), 61);
    let victim = hub
        .peer_ids()
        .into_iter()
        .filter(|p| *p != peer)
        .max_by_key(|p| hub.peer(p).map_or(0, |p| p.nodes().count()))
        .unwrap();
    let orphans: Vec<Identifier> = hub
        .peer(&victim)
        .unwrap()
        .nodes()
        .map(|n| *n.id())
        .collect();
    assert!(!orphans.is_empty());

    hub.crash_peer(&victim).unwrap();
    assert!(orphans.iter().all(|id| hub.node(id).is_none()));

    let everything = hub.search(&peer, SearchQuery::new("cpu", None, None)).unwrap();
    assert!(everything.success);
    assert_eq!(everything.contacts.len(), ELEMENTS);
    assert!(orphans.iter().all(|id| hub.node(id).is_some()));
}

/// Every link above level 0 is mirrored, and both ends agree on their prefix up to that level.
fn assert_upper_levels_consistent(hub: &SimHub) {
    for node in live_nodes(hub) {
        let table = node.node().contact_table();
        for level in 1..table.height() {
            for direction in Direction::BOTH {
                let Some(neighbor) = table.neighbor(level, direction) else {
                    continue;
                };
                let other = hub
                    .node(neighbor.node_id())
                    .unwrap_or_else(|| panic!("{} links missing {}", node.id(), neighbor));
                let theirs = other.node().contact_table();
                let back = theirs.neighbor(level, direction.opposite());
                assert!(
                    back.is_some_and(|c| c.is(node.id())),
                    "level {} link {} -> {} is not mirrored",
                    level,
                    node.id(),
                    other.id()
                );
                assert_eq!(
                    table.prefix_up_to(level),
                    theirs.prefix_up_to(level),
                    "{} and {} disagree below level {}",
                    node.id(),
                    other.id(),
                    level
                );
            }
        }
    }
}

#[test]
fn test_upper_levels_share_prefixes() {
    for (seed, prefix_optimization) in [(81, false), (82, true)] {
        let config = Config::builder()
            .table_size(3, 10)
            .prefix_optimization(prefix_optimization)
            .build()
            .unwrap();
        let (hub, _) = grown_hub(config, seed);

        assert_level_zero_consistent(&hub);
        assert_upper_levels_consistent(&hub);
        assert_eq!(hub.busy_slots(), 0);
    }
}

/// The first live node of every peer, which is where the peer enters updates, paired with its
/// peer, when its level 0 successor lives on another peer.
fn entry_with_remote_successor(hub: &SimHub) -> Option<(Identifier, Identifier, Identifier)> {
    hub.peer_ids().into_iter().find_map(|peer| {
        let entry = hub.peer(&peer)?.nodes().find(|n| !n.is_disabled())?;
        let next = entry.node().contact_table().neighbor(0, Direction::Next)?;
        let host = hub.substrate().root_of(next.node_id())?;
        (host != peer).then_some((peer, *entry.id(), host))
    })
}

/// `count` fresh elements inside the range of `node`.
fn elements_within(hub: &SimHub, node: &Identifier, count: usize) -> Vec<Element> {
    let range = hub.node(node).unwrap().node().range();
    (1..=count)
        .map(|k| {
            let value = match range.start_bound() {
                Some(start) => Value::parse(&format!("{}.{:02}", start, k)).unwrap(),
                None => Value::parse(&format!("-1.{:02}", k)).unwrap(),
            };
            let owner = PeerContact::new(
                Identifier::from_u64(10_000 + k as u64),
                Address::new("localhost", "9999"),
            );
            Element::new("cpu", value, owner, Timestamp::ZERO)
        })
        .collect()
}

#[test]
fn test_load_balancing_gives_up_on_silent_neighbor() {
    for seed in 71..81 {
        let (mut hub, _) = grown_hub(config(true, false), seed);
        let Some((peer, node, silent)) = entry_with_remote_successor(&hub) else {
            continue;
        };
        let before = stored_elements(&hub);
        hub.isolate(&silent);

        let batch = UpdateBatch::new(elements_within(&hub, &node, 12), Vec::new());
        let outcome = hub.update(&peer, batch).unwrap();
        assert!(outcome.success);
        hub.settle().unwrap();

        // the remaining-size request to the silent neighbor timed out instead of hanging
        let controller = hub.node(&node).unwrap();
        assert!(!controller.is_locked());
        assert_eq!(hub.pending_operations(), 0);
        assert_eq!(hub.busy_slots(), 0);

        hub.heal(&silent);
        hub.settle().unwrap();
        assert_eq!(stored_elements(&hub), before + 12);
        return;
    }
    panic!("no seed placed a successor on another peer");
}
