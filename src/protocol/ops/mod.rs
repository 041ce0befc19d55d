//! One file per protocol. Each adds the originating half to `OperationCaller` and the
//! answering half to `OperationResponder`.

mod handshake;
mod join;
mod join_level;
mod load_balancing;
mod range_adjustment;
mod replace_contacts;
mod search;
mod update;

pub(crate) use handshake::{HandshakeOp, HandshakePurpose};
pub(crate) use join::{JoinConfirmOp, JoinHold, JoinOp};
pub(crate) use join_level::{JoinLevelOp, JoinLevelReplyOp};
pub(crate) use load_balancing::LoadBalancingOp;
pub(crate) use replace_contacts::ReplaceContactsOp;
pub(crate) use search::{cover_piece, SearchOp};
pub(crate) use update::{UpdateContext, UpdateLeg, UpdateOp};
