use crate::core::model::direction::LevelKey;
use crate::core::Identifier;
use crate::protocol::OperationId;
use std::collections::HashMap;

/// Which structural operation holds a level slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BusyKind {
    JoinLevel,
    Handshake,
}

/// BusyLocks serializes structural operations on the pointer slots of local nodes.
/// A slot is held by one operation at a time; a competing operation is refused, never queued.
#[derive(Debug, Default)]
pub struct BusyLocks {
    held: HashMap<(Identifier, BusyKind, LevelKey), OperationId>,
}

impl BusyLocks {
    pub fn new() -> BusyLocks {
        BusyLocks::default()
    }

    /// Takes the slot for `op`. Succeeds when the slot is free or already held by `op`.
    pub fn try_acquire(&mut self, node: Identifier, kind: BusyKind, key: LevelKey, op: OperationId) -> bool {
        match self.held.get(&(node, kind, key)) {
            Some(holder) => *holder == op,
            None => {
                self.held.insert((node, kind, key), op);
                true
            }
        }
    }

    /// Frees the slot if `op` holds it; returns whether it did.
    pub fn release(&mut self, node: Identifier, kind: BusyKind, key: LevelKey, op: OperationId) -> bool {
        if self.held.get(&(node, kind, key)) == Some(&op) {
            self.held.remove(&(node, kind, key));
            return true;
        }
        false
    }

    /// Frees every slot `op` holds; returns how many.
    pub fn release_all(&mut self, op: &OperationId) -> usize {
        let before = self.held.len();
        self.held.retain(|_, holder| holder != op);
        before - self.held.len()
    }

    /// Frees every slot of a node that is gone.
    pub fn release_node(&mut self, node: &Identifier) -> usize {
        let before = self.held.len();
        self.held.retain(|(n, _, _), _| n != node);
        before - self.held.len()
    }

    /// True when any kind of operation other than `op` holds the slot.
    pub fn is_held_by_other(&self, node: Identifier, key: LevelKey, op: &OperationId) -> bool {
        [BusyKind::JoinLevel, BusyKind::Handshake]
            .iter()
            .any(|kind| self.held.get(&(node, *kind, key)).is_some_and(|h| h != op))
    }

    /// True when any operation holds a slot of `node` on `level`, in either direction.
    pub fn is_level_busy(&self, node: &Identifier, level: usize) -> bool {
        self.held
            .keys()
            .any(|(n, _, key)| n == node && key.level == level)
    }

    /// The highest level on which `node` has a slot held.
    pub fn highest_busy_level(&self, node: &Identifier) -> Option<usize> {
        self.held
            .keys()
            .filter(|(n, _, _)| n == node)
            .map(|(_, _, key)| key.level)
            .max()
    }

    pub fn is_busy(&self, node: Identifier, kind: BusyKind, key: LevelKey) -> bool {
        self.held.contains_key(&(node, kind, key))
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}
