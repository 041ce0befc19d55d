use crate::core::{Identifier, SkipgraphNode};
use crate::network::Substrate;
use anyhow::anyhow;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

#[derive(Default)]
struct Registry {
    peers: BTreeSet<Identifier>,
    records: HashMap<Identifier, SkipgraphNode>,
}

/// MemorySubstrate is an in-process stand-in for the key-based routing layer. The root of a key
/// is the participating peer closest to it clockwise on the identifier ring. Records outlive the
/// peer that stored them, so a crashed peer's nodes can be rehydrated by the next root.
#[derive(Clone, Default)]
pub struct MemorySubstrate {
    registry: Arc<RwLock<Registry>>,
}

impl MemorySubstrate {
    pub fn new() -> MemorySubstrate {
        MemorySubstrate::default()
    }

    pub fn join(&self, peer: Identifier) {
        self.registry.write().peers.insert(peer);
    }

    pub fn leave(&self, peer: &Identifier) {
        self.registry.write().peers.remove(peer);
    }

    pub fn contains(&self, peer: &Identifier) -> bool {
        self.registry.read().peers.contains(peer)
    }

    /// The peer responsible for `key`, if any peer participates.
    pub fn root_of(&self, key: &Identifier) -> Option<Identifier> {
        let registry = self.registry.read();
        registry
            .peers
            .iter()
            .min_by_key(|peer| key.ring_distance_to(peer))
            .copied()
    }

    /// The stored record of node `key`.
    pub fn record(&self, key: &Identifier) -> Option<SkipgraphNode> {
        self.registry.read().records.get(key).cloned()
    }

    /// Identifiers of every stored record.
    pub fn record_ids(&self) -> Vec<Identifier> {
        self.registry.read().records.keys().copied().collect()
    }

    /// The substrate as seen by `local`.
    pub fn view(&self, local: Identifier) -> SubstrateView {
        SubstrateView {
            local,
            substrate: self.clone(),
        }
    }
}

/// SubstrateView is the handle one peer holds on a shared MemorySubstrate.
pub struct SubstrateView {
    local: Identifier,
    substrate: MemorySubstrate,
}

impl Substrate for SubstrateView {
    fn is_root_of(&self, key: &Identifier) -> bool {
        self.substrate.root_of(key) == Some(self.local)
    }

    fn store(&self, key: &Identifier, node: SkipgraphNode) -> anyhow::Result<()> {
        if !self.is_root_of(key) {
            return Err(anyhow!(
                "peer {} is not root of {}",
                self.local.short(),
                key.short()
            ));
        }
        self.substrate.registry.write().records.insert(*key, node);
        Ok(())
    }

    fn remove(&self, key: &Identifier) -> anyhow::Result<()> {
        self.substrate
            .registry
            .write()
            .records
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| anyhow!("no record stored under {}", key.short()))
    }

    fn lookup(&self, key: &Identifier) -> Option<SkipgraphNode> {
        self.substrate.record(key)
    }

    fn peers(&self) -> Vec<Identifier> {
        self.substrate.registry.read().peers.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testutil::fixtures::{random_sorted_identifiers, span_fixture};

    #[test]
    fn test_root_is_closest_successor() {
        let substrate = MemorySubstrate::new();
        substrate.join(Identifier::from_u64(10));
        substrate.join(Identifier::from_u64(20));

        assert_eq!(substrate.root_of(&Identifier::from_u64(15)), Some(Identifier::from_u64(20)));
        assert_eq!(substrate.root_of(&Identifier::from_u64(10)), Some(Identifier::from_u64(10)));
        // past the last peer the ring wraps around to the first one
        assert_eq!(substrate.root_of(&Identifier::from_u64(25)), Some(Identifier::from_u64(10)));
    }

    #[test]
    fn test_every_peer_is_root_of_itself() {
        let substrate = MemorySubstrate::new();
        let peers = random_sorted_identifiers(10);
        for peer in &peers {
            substrate.join(*peer);
        }
        for peer in &peers {
            assert_eq!(substrate.root_of(peer), Some(*peer));
        }
        assert_eq!(substrate.view(peers[0]).peers(), peers);
    }

    #[test]
    fn test_only_root_stores() {
        let substrate = MemorySubstrate::new();
        substrate.join(Identifier::from_u64(10));
        substrate.join(Identifier::from_u64(20));
        let key = Identifier::from_u64(15);
        let node = SkipgraphNode::bootstrap(&span_fixture(), key);

        assert!(substrate.view(Identifier::from_u64(10)).store(&key, node.clone()).is_err());
        let root = substrate.view(Identifier::from_u64(20));
        assert!(root.store(&key, node).is_ok());
        assert!(root.lookup(&key).is_some());

        // the record survives its root
        substrate.leave(&Identifier::from_u64(20));
        let next = substrate.view(Identifier::from_u64(10));
        assert!(next.is_root_of(&key));
        assert!(next.lookup(&key).is_some());
        assert!(next.remove(&key).is_ok());
        assert!(next.remove(&key).is_err());
    }
}
