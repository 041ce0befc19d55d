use crate::core::Identifier;
use crate::protocol::caller::OperationCaller;
use crate::protocol::message::{NackReason, Reply, Request};
use crate::protocol::ops::cover_piece;
use crate::protocol::peer::PeerState;
use crate::protocol::OperationId;
use std::collections::HashMap;
use tracing::{Level, Span};

/// An offer a node made to a load balancing requester, waiting for its hand-over.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ArmedResponse {
    pub(crate) op_id: OperationId,
    pub(crate) requester: Identifier,
}

/// OperationResponder processes inbound requests and decides between an ack, a nack and a
/// forward. It never waits: whatever must happen later is registered as an operation of the
/// caller.
pub struct OperationResponder {
    /// Offers made by local nodes, one per node at most.
    pub(crate) armed: HashMap<Identifier, ArmedResponse>,
    handled: u64,
    pub(crate) span: Span,
}

impl OperationResponder {
    pub fn new(parent_span: &Span) -> OperationResponder {
        let span = tracing::span!(parent: parent_span, Level::INFO, "operation_responder");
        OperationResponder {
            armed: HashMap::new(),
            handled: 0,
            span,
        }
    }

    /// Number of requests processed so far.
    pub fn handled(&self) -> u64 {
        self.handled
    }

    /// Requests addressed to the peer itself or to an operation it runs.
    pub(crate) fn execute_peer_request(
        &mut self,
        state: &mut PeerState,
        caller: &mut OperationCaller,
        op_id: OperationId,
        request: Request,
    ) {
        self.handled += 1;
        match request {
            Request::Join { table, prev, next } => {
                self.execute_join(state, caller, op_id, table, prev, next)
            }
            Request::JoinConfirm { hold, node } => {
                self.execute_join_confirm(state, caller, op_id, hold, node)
            }
            Request::JoinLevelNotify { request, forwardee } => {
                caller.on_join_level_notify(state, request, forwardee)
            }
            Request::JoinLevelReply {
                request,
                accepting,
                former,
            } => caller.on_join_level_reply(state, op_id, request, accepting, former),
            Request::SearchResult {
                request,
                contacts,
                hops,
                delegated,
            } => caller.on_search_result(request, contacts, hops, delegated),
            other => {
                let _enter = self.span.enter();
                tracing::warn!("{} cannot be addressed to a peer", other.kind());
                if other.expects_reply() {
                    state.reply(None, op_id, Reply::Nack(NackReason::Unsupported));
                }
            }
        }
    }

    /// Requests addressed to a node hosted here.
    pub(crate) fn execute_node_request(
        &mut self,
        state: &mut PeerState,
        caller: &mut OperationCaller,
        node: Identifier,
        op_id: OperationId,
        request: Request,
    ) {
        {
            let _enter = self.span.enter();
            tracing::trace!("node {} handles {} of operation {}", node.short(), request.kind(), op_id);
        }
        match request {
            Request::JoinLevel {
                requester,
                level,
                direction,
                prefix,
                hops,
            } => {
                self.handled += 1;
                self.execute_join_level(
                    state, caller, node, op_id, requester, level, direction, prefix, hops,
                )
            }
            Request::Handshake {
                sender,
                level,
                direction,
                former,
            } => {
                self.handled += 1;
                self.execute_handshake(state, node, op_id, sender, level, direction, former)
            }
            Request::RemainingSize { requester, leaving } => {
                self.handled += 1;
                self.execute_remaining_size(state, caller, node, op_id, requester, leaving)
            }
            Request::LoadBalancing { sender, table } => {
                self.handled += 1;
                self.execute_load_balancing(state, caller, node, op_id, sender, table)
            }
            Request::LoadBalancingCancel { sender } => {
                self.handled += 1;
                self.execute_load_balancing_cancel(state, caller, node, sender)
            }
            Request::ReplaceContacts {
                leaving,
                replacements,
            } => {
                self.handled += 1;
                self.execute_replace_contacts(state, caller, node, op_id, leaving, replacements)
            }
            Request::RangeAdjustment { contact } => {
                self.handled += 1;
                self.execute_range_adjustment(state, node, contact)
            }
            Request::SearchForward {
                request,
                query,
                piece,
                hops,
            } => {
                self.handled += 1;
                cover_piece(state, &node, request, &query, piece, hops)
            }
            Request::UpdateForward { batch, hops } => {
                self.handled += 1;
                self.execute_update_forward(state, caller, node, op_id, batch, hops)
            }
            Request::Join { .. } => {
                let _enter = self.span.enter();
                tracing::warn!("join must be addressed to a peer, not to node {}", node.short());
                state.reply(Some(&node), op_id, Reply::Nack(NackReason::Unsupported));
            }
            other => self.execute_peer_request(state, caller, op_id, other),
        }
    }

    /// The offer armed for `node`, if it is still waited for. Offers whose operation already
    /// ended are dropped.
    pub(crate) fn armed_for(
        &mut self,
        caller: &OperationCaller,
        node: &Identifier,
    ) -> Option<ArmedResponse> {
        let armed = *self.armed.get(node)?;
        if caller.tracker.contains(&armed.op_id) {
            Some(armed)
        } else {
            self.armed.remove(node);
            None
        }
    }
}
