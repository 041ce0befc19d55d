use crate::core::model::contact::SkipgraphContact;
use crate::core::model::direction::Direction;
use crate::core::Identifier;
use std::fmt;
use std::fmt::{Debug, Formatter};

/// ContactLevel is one level of a contact table: the predecessor and successor a node links to on
/// that level, and the prefix bit the node drew for it.
/// A pointer holding the owner's own contact means there is no neighbor on that side.
#[derive(Clone, PartialEq)]
pub struct ContactLevel {
    prev: SkipgraphContact,
    next: SkipgraphContact,
    prefix: bool,
}

impl ContactLevel {
    pub fn new(prev: SkipgraphContact, next: SkipgraphContact, prefix: bool) -> ContactLevel {
        ContactLevel { prev, next, prefix }
    }

    /// A level linking only to `owner` on both sides.
    pub fn self_linked(owner: &SkipgraphContact, prefix: bool) -> ContactLevel {
        ContactLevel::new(owner.clone(), owner.clone(), prefix)
    }

    pub fn prefix(&self) -> bool {
        self.prefix
    }

    pub fn get(&self, direction: Direction) -> &SkipgraphContact {
        match direction {
            Direction::Prev => &self.prev,
            Direction::Next => &self.next,
        }
    }

    pub fn prev(&self) -> &SkipgraphContact {
        &self.prev
    }

    pub fn next(&self) -> &SkipgraphContact {
        &self.next
    }

    pub(crate) fn set(&mut self, direction: Direction, contact: SkipgraphContact) {
        match direction {
            Direction::Prev => self.prev = contact,
            Direction::Next => self.next = contact,
        }
    }

    /// True when the pointer on `direction` leads back to `owner`.
    pub fn points_to_self(&self, owner: &Identifier, direction: Direction) -> bool {
        self.get(direction).is(owner)
    }

    /// True when neither side of the level has a neighbor.
    pub fn is_self_linked(&self, owner: &Identifier) -> bool {
        self.prev.is(owner) && self.next.is(owner)
    }

    /// Directions whose pointer refers to `node_id`.
    pub fn directions_of(&self, node_id: &Identifier) -> Vec<Direction> {
        Direction::BOTH
            .into_iter()
            .filter(|d| self.get(*d).is(node_id))
            .collect()
    }

    pub fn size_bytes(&self) -> usize {
        1 + self.prev.size_bytes() + self.next.size_bytes()
    }
}

impl Debug for ContactLevel {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "prefix: {}, prev: {}, next: {}",
            self.prefix as u8, self.prev, self.next
        )
    }
}
