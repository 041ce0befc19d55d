use crate::core::Identifier;
use std::fmt;
use std::fmt::{Debug, Display, Formatter};

/// OperationId names one operation across the network: the peer that originated it and a
/// sequence number unique at that peer. Replies are routed back to `origin`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId {
    origin: Identifier,
    seq: u64,
}

impl OperationId {
    pub fn new(origin: Identifier, seq: u64) -> OperationId {
        OperationId { origin, seq }
    }

    pub fn origin(&self) -> &Identifier {
        &self.origin
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }
}

impl Display for OperationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.origin.short(), self.seq)
    }
}

impl Debug for OperationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}
