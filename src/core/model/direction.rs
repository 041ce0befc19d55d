use std::fmt;
use std::fmt::{Display, Formatter};

/// Represents the side of a contact level a pointer or a route goes to.
/// `Prev` walks towards lower values, `Next` towards higher values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Direction {
    Prev,
    Next,
}

impl Direction {
    pub fn opposite(self) -> Direction {
        match self {
            Direction::Prev => Direction::Next,
            Direction::Next => Direction::Prev,
        }
    }

    pub const BOTH: [Direction; 2] = [Direction::Prev, Direction::Next];
}

impl Display for Direction {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Prev => write!(f, "prev"),
            Direction::Next => write!(f, "next"),
        }
    }
}

/// LevelKey names one pointer slot of a contact table: a level and the side of that level.
/// Busy locks are keyed by it so that structural operations on the same slot serialize.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LevelKey {
    pub level: usize,
    pub direction: Direction,
}

impl LevelKey {
    pub fn new(level: usize, direction: Direction) -> Self {
        LevelKey { level, direction }
    }
}

impl Display for LevelKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.level, self.direction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opposite_direction() {
        assert_eq!(Direction::Prev.opposite(), Direction::Next);
        assert_eq!(Direction::Next.opposite(), Direction::Prev);
    }

    #[test]
    fn test_level_keys_distinguish_direction() {
        let prev = LevelKey::new(3, Direction::Prev);
        let next = LevelKey::new(3, Direction::Next);
        assert_ne!(prev, next);
        assert_eq!(prev.to_string(), "3/prev");
    }
}
