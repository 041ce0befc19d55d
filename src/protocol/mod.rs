pub mod busy;
mod caller;
pub mod message;
mod operation_id;
mod ops;
mod peer;
mod responder;
pub mod tracker;

pub use crate::protocol::caller::{OperationCaller, SearchOutcome, UpdateOutcome};
pub use crate::protocol::message::{
    AckPayload, Body, Destination, Envelope, NackReason, Reply, Request, SearchPiece, SearchQuery,
};
pub use crate::protocol::operation_id::OperationId;
pub use crate::protocol::peer::{Peer, PeerState};
pub use crate::protocol::responder::OperationResponder;
