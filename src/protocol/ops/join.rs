use crate::core::element::ElementTable;
use crate::core::model::contact::SkipgraphContact;
use crate::core::model::direction::Direction;
use crate::core::node::SkipgraphNode;
use crate::core::Identifier;
use crate::protocol::caller::{OperationCaller, PendingOperation, Resolution};
use crate::protocol::message::{AckPayload, Destination, NackReason, Reply, Request};
use crate::protocol::ops::HandshakePurpose;
use crate::protocol::peer::PeerState;
use crate::protocol::responder::OperationResponder;
use crate::protocol::OperationId;
use rand::Rng;

/// A node splitting its table with a new node it asks a random peer to create.
/// The splitting node keeps its whole table until the new node is confirmed.
pub(crate) struct JoinOp {
    pub(crate) node: Identifier,
    pub(crate) retained: ElementTable,
    pub(crate) handed: ElementTable,
    pub(crate) attempt: usize,
}

/// A splitting node confirming the node a peer created for it.
pub(crate) struct JoinConfirmOp {
    pub(crate) join: JoinOp,
    pub(crate) joined: SkipgraphContact,
    pub(crate) hold: OperationId,
    pub(crate) confirms: usize,
}

/// A created node nobody links to yet. It is hosted only once its creator confirms, so a join
/// whose acknowledgement got lost leaves nothing behind.
pub(crate) struct JoinHold {
    pub(crate) node: SkipgraphNode,
    pub(crate) prev: SkipgraphContact,
    pub(crate) next: Option<SkipgraphContact>,
}

impl OperationCaller {
    /// Locks `node`, cuts its table in half and offers the upper half to a new node.
    /// Returns false when the node could not be locked or its table cannot be cut.
    pub(crate) fn start_join_split(&mut self, state: &mut PeerState, node: &Identifier) -> bool {
        let Some(controller) = state.controllers.get_mut(node) else {
            return false;
        };
        if !controller.lock() {
            return false;
        }
        let split = controller.element_table().cloned().map(|table| table.split(0.5));
        match split {
            Some(Ok((retained, handed))) => {
                {
                    let _enter = self.span.enter();
                    tracing::debug!(
                        "node {} splits, keeping {} and handing {} elements",
                        node.short(),
                        retained.len(),
                        handed.len()
                    );
                }
                self.send_join(
                    state,
                    JoinOp {
                        node: *node,
                        retained,
                        handed,
                        attempt: 1,
                    },
                );
                true
            }
            Some(Err(e)) => {
                {
                    let _enter = self.span.enter();
                    tracing::debug!("node {} cannot split: {:#}", node.short(), e);
                }
                self.unlock_node(state, node, None);
                false
            }
            None => false,
        }
    }

    fn send_join(&mut self, state: &mut PeerState, op: JoinOp) {
        let peers = state.substrate().peers();
        if peers.is_empty() {
            {
                let _enter = self.span.enter();
                tracing::warn!("no peer known to host a new node");
            }
            self.unlock_node(state, &op.node, None);
            return;
        }
        let peer = peers[state.rng.random_range(0..peers.len())];

        let Some(controller) = state.controller(&op.node) else {
            return;
        };
        let prev = SkipgraphContact::new(
            op.node,
            op.retained.range().clone(),
            *controller.contact().prefix(),
        );
        let next = controller
            .node()
            .contact_table()
            .neighbor(0, Direction::Next)
            .cloned();
        let request = Request::Join {
            table: op.handed.clone(),
            prev,
            next,
        };
        let node = op.node;
        let timeout = state.config().structural_timeout;
        self.send_tracked(
            state,
            &node,
            Destination::Peer(peer),
            request,
            PendingOperation::Join(op),
            timeout,
        );
    }

    pub(crate) fn on_join_resolved(&mut self, state: &mut PeerState, op: JoinOp, resolution: Resolution) {
        match resolution {
            Resolution::Ack(AckPayload::Joined { contact, hold }) => self.send_join_confirm(
                state,
                JoinConfirmOp {
                    join: op,
                    joined: contact,
                    hold,
                    confirms: 1,
                },
            ),
            other => self.retry_join(state, op, other),
        }
    }

    /// Tries the next peer, or unlocks `op.node` unchanged once the attempts are spent.
    fn retry_join(&mut self, state: &mut PeerState, op: JoinOp, cause: Resolution) {
        let node = op.node;
        if op.attempt < state.config().max_lookup_attempts {
            {
                let _enter = self.span.enter();
                tracing::debug!(
                    "join attempt {} of node {} failed: {}",
                    op.attempt,
                    node.short(),
                    cause
                );
            }
            self.send_join(
                state,
                JoinOp {
                    attempt: op.attempt + 1,
                    ..op
                },
            );
            return;
        }
        {
            let _enter = self.span.enter();
            tracing::warn!(
                "node {} gave up splitting after {} attempts: {}",
                node.short(),
                op.attempt,
                cause
            );
        }
        self.unlock_node(state, &node, None);
    }

    fn send_join_confirm(&mut self, state: &mut PeerState, op: JoinConfirmOp) {
        let request = Request::JoinConfirm {
            hold: op.hold,
            node: *op.joined.node_id(),
        };
        let node = op.join.node;
        let to = Destination::Peer(*op.hold.origin());
        let timeout = state.config().structural_timeout;
        self.send_tracked(
            state,
            &node,
            to,
            request,
            PendingOperation::JoinConfirm(op),
            timeout,
        );
    }

    /// Confirming is idempotent, so a lost confirmation is sent again. A hold that expired
    /// means the new node is gone and the join starts over elsewhere.
    pub(crate) fn on_join_confirm_resolved(
        &mut self,
        state: &mut PeerState,
        op: JoinConfirmOp,
        resolution: Resolution,
    ) {
        let node = op.join.node;
        match resolution {
            Resolution::Ack(AckPayload::Contact(joined)) => {
                if let Some(controller) = state.controllers.get_mut(&node) {
                    if let Err(e) = controller.install(0, Direction::Next, joined.clone()) {
                        let _enter = self.span.enter();
                        tracing::warn!("failed to link new node {}: {:#}", joined, e);
                    }
                }
                {
                    let _enter = self.span.enter();
                    tracing::info!(
                        "node {} split, new node {} took {} elements",
                        node.short(),
                        joined,
                        op.join.handed.len()
                    );
                }
                self.unlock_node(state, &node, Some(op.join.retained));
                self.broadcast_range_adjustment(state, &node);
            }
            Resolution::Nack(reason) => self.retry_join(state, op.join, Resolution::Nack(reason)),
            other if op.confirms < state.config().max_lookup_attempts => {
                {
                    let _enter = self.span.enter();
                    tracing::debug!(
                        "confirmation {} of node {} failed: {}",
                        op.confirms,
                        op.joined,
                        other
                    );
                }
                self.send_join_confirm(
                    state,
                    JoinConfirmOp {
                        confirms: op.confirms + 1,
                        ..op
                    },
                );
            }
            other => {
                {
                    let _enter = self.span.enter();
                    tracing::warn!(
                        "node {} could not confirm new node {}: {}",
                        node.short(),
                        op.joined,
                        other
                    );
                }
                self.unlock_node(state, &node, None);
            }
        }
    }

    pub(crate) fn on_join_hold_expired(&mut self, op_id: OperationId, hold: JoinHold) {
        let _enter = self.span.enter();
        tracing::debug!(
            "dropping node {} of join {}, never confirmed",
            hold.node.id().short(),
            op_id
        );
    }
}

impl OperationResponder {
    /// Creates a node from the handed table under an id the local peer is root of and holds it
    /// until the splitting node confirms.
    pub(crate) fn execute_join(
        &mut self,
        state: &mut PeerState,
        caller: &mut OperationCaller,
        op_id: OperationId,
        table: ElementTable,
        prev: SkipgraphContact,
        next: Option<SkipgraphContact>,
    ) {
        let attempts = state.config().max_lookup_attempts;
        let mut id = None;
        for _ in 0..attempts {
            let candidate = Identifier::random(&mut state.rng);
            if state.substrate().is_root_of(&candidate) && state.controller(&candidate).is_none() {
                id = Some(candidate);
                break;
            }
        }
        let Some(id) = id else {
            let _enter = self.span.enter();
            tracing::debug!("found no local identifier in {} attempts", attempts);
            state.reply(None, op_id, Reply::Nack(NackReason::NotRoot));
            return;
        };

        let node = SkipgraphNode::new(state.span(), id, table, Some(prev.clone()), next.clone());
        let contact = node.contact();
        let hold = state.next_op_id();
        let timeout = state.config().join_hold_window();
        let held = PendingOperation::JoinHold(JoinHold { node, prev, next });
        if !caller.track(state, hold, held, timeout) {
            state.reply(None, op_id, Reply::Nack(NackReason::Invalid));
            return;
        }
        {
            let _enter = self.span.enter();
            tracing::debug!("holding new node {} for join {}", contact, op_id);
        }
        state.reply(None, op_id, Reply::Ack(AckPayload::Joined { contact, hold }));
    }

    /// Hosts the held node and links it in. A node confirmed before is acknowledged again.
    pub(crate) fn execute_join_confirm(
        &mut self,
        state: &mut PeerState,
        caller: &mut OperationCaller,
        op_id: OperationId,
        hold: OperationId,
        node: Identifier,
    ) {
        let holds_node = matches!(
            caller.tracker.get(&hold),
            Some(PendingOperation::JoinHold(h)) if h.node.id() == &node
        );
        let held = if holds_node {
            caller.tracker.complete(&hold)
        } else {
            None
        };
        let Some(PendingOperation::JoinHold(JoinHold { node: held, prev, next })) = held else {
            let reply = match state.controller(&node) {
                Some(controller) => Reply::Ack(AckPayload::Contact(controller.contact())),
                None => Reply::Nack(NackReason::Stale),
            };
            state.reply(Some(&node), op_id, reply);
            return;
        };

        let id = state.host(held);
        let Some(contact) = state.controller(&id).map(|c| c.contact()) else {
            return;
        };
        {
            let _enter = self.span.enter();
            tracing::info!(
                "created node {} between {} and {:?}",
                contact,
                prev,
                next.as_ref().map(ToString::to_string)
            );
        }
        state.reply(Some(&id), op_id, Reply::Ack(AckPayload::Contact(contact)));

        match next {
            Some(next) => caller.start_handshake(
                state,
                &id,
                0,
                Direction::Next,
                next,
                prev,
                HandshakePurpose::Join,
            ),
            None => caller.advance_level_builder(state, &id, 1, None),
        }
    }
}
