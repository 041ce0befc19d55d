use crate::core::model::address::Address;
use crate::core::model::IDENTIFIER_SIZE_BYTES;
use crate::core::Identifier;
use std::fmt;
use std::fmt::{Display, Formatter};

/// PeerContact is an immutable description of a peer in the network (ID, Address).
/// Elements record the peer that published them as their owner; search answers with owners.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PeerContact {
    id: Identifier,
    address: Address,
}

impl PeerContact {
    /// Create a new PeerContact
    pub fn new(id: Identifier, address: Address) -> PeerContact {
        PeerContact { id, address }
    }

    /// Get the identifier of the peer
    pub fn id(&self) -> &Identifier {
        &self.id
    }

    /// Get the address of the peer
    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn size_bytes(&self) -> usize {
        IDENTIFIER_SIZE_BYTES + self.address.size_bytes()
    }
}

impl Display for PeerContact {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id.short(), self.address)
    }
}
