use crate::core::model::contact::SkipgraphContact;
use crate::core::model::direction::Direction;

/// Replacement tells a neighbor of a leaving node which pointer to swap and what to put there.
/// `level_prefix` is the prefix bit the level had at the leaving node, so a receiver whose level
/// was rebuilt in the meantime can tell the replacement no longer applies.
#[derive(Clone, Debug, PartialEq)]
pub struct Replacement {
    pub level: usize,
    pub level_prefix: bool,
    pub direction: Direction,
    pub contact: SkipgraphContact,
}

impl Replacement {
    pub fn new(
        level: usize,
        level_prefix: bool,
        direction: Direction,
        contact: SkipgraphContact,
    ) -> Replacement {
        Replacement {
            level,
            level_prefix,
            direction,
            contact,
        }
    }

    pub fn size_bytes(&self) -> usize {
        10 + self.contact.size_bytes()
    }
}
