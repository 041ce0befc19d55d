use crate::core::model::contact::SkipgraphContact;
use crate::core::model::direction::{Direction, LevelKey};
use crate::core::Identifier;
use crate::protocol::busy::BusyKind;
use crate::protocol::caller::{OperationCaller, PendingOperation, Resolution};
use crate::protocol::message::{AckPayload, Destination, NackReason, Reply, Request};
use crate::protocol::peer::PeerState;
use crate::protocol::responder::OperationResponder;
use crate::protocol::OperationId;

/// What the node does once its handshake ends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum HandshakePurpose {
    /// A freshly joined node linked its level 0 successor; next come the upper levels.
    Join,
    /// Completes a join-level acceptance: the accepting node waits for the ack of `reply_op`.
    JoinLevel {
        reply_op: OperationId,
        level: usize,
        route: Direction,
    },
}

/// A node asking `target` to point back at it on `level`.
pub(crate) struct HandshakeOp {
    pub(crate) node: Identifier,
    pub(crate) level: usize,
    /// The slot of `node` that now holds `target`.
    pub(crate) side: Direction,
    pub(crate) target: SkipgraphContact,
    /// What the slot held before, restored when the handshake fails.
    pub(crate) previous: SkipgraphContact,
    pub(crate) purpose: HandshakePurpose,
}

impl OperationCaller {
    /// Installs `target` on `level` and `side` of `node` and asks `target` to replace its
    /// pointer back, which must still hold `former`.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn start_handshake(
        &mut self,
        state: &mut PeerState,
        node: &Identifier,
        level: usize,
        side: Direction,
        target: SkipgraphContact,
        former: SkipgraphContact,
        purpose: HandshakePurpose,
    ) {
        let op_id = state.next_op_id();
        let key = LevelKey::new(level, side);
        let Some(controller) = state.controllers.get_mut(node) else {
            return;
        };
        let sender = controller.contact();
        let previous = match controller.node().contact_table().get(level, side) {
            Ok(previous) => previous.clone(),
            Err(e) => {
                {
                    let _enter = self.span.enter();
                    tracing::warn!("cannot handshake on {}: {:#}", key, e);
                }
                self.finish_handshake(state, node, purpose);
                return;
            }
        };
        if !state.busy.try_acquire(*node, BusyKind::Handshake, key, op_id) {
            {
                let _enter = self.span.enter();
                tracing::debug!("slot {} of node {} is busy, skipping handshake", key, node.short());
            }
            self.finish_handshake(state, node, purpose);
            return;
        }
        if let Some(controller) = state.controllers.get_mut(node) {
            if let Err(e) = controller.install(level, side, target.clone()) {
                state.busy.release(*node, BusyKind::Handshake, key, op_id);
                {
                    let _enter = self.span.enter();
                    tracing::debug!("cannot install {} on {}: {:#}", target, key, e);
                }
                self.finish_handshake(state, node, purpose);
                return;
            }
        }

        let request = Request::Handshake {
            sender,
            level,
            direction: side.opposite(),
            former,
        };
        let timeout = state.config().structural_timeout;
        let to = Destination::Node(*target.node_id());
        let op = HandshakeOp {
            node: *node,
            level,
            side,
            target,
            previous,
            purpose,
        };
        self.send_tracked_as(
            state,
            op_id,
            node,
            to,
            request,
            PendingOperation::Handshake(op),
            timeout,
        );
    }

    pub(crate) fn on_handshake_resolved(
        &mut self,
        state: &mut PeerState,
        op_id: OperationId,
        op: HandshakeOp,
        resolution: Resolution,
    ) {
        let key = LevelKey::new(op.level, op.side);
        state.busy.release(op.node, BusyKind::Handshake, key, op_id);

        if let Some(controller) = state.controllers.get_mut(&op.node) {
            let holds_target = controller
                .node()
                .contact_table()
                .get(op.level, op.side)
                .is_ok_and(|c| c.is(op.target.node_id()));
            match resolution {
                Resolution::Ack(AckPayload::Contact(fresh)) if holds_target => {
                    if let Err(e) = controller.install(op.level, op.side, fresh) {
                        let _enter = self.span.enter();
                        tracing::debug!(
                            "node {} could not install handshake contact on {}: {:#}",
                            op.node.short(),
                            key,
                            e
                        );
                    }
                }
                Resolution::Ack(_) => {}
                other if holds_target => {
                    let restored = if op.previous.is(&op.node)
                        || controller.is_deprecated(op.previous.node_id())
                    {
                        controller.self_link(op.level, op.side)
                    } else {
                        controller.install(op.level, op.side, op.previous.clone())
                    };
                    let _enter = self.span.enter();
                    tracing::debug!(
                        "handshake of node {} with {} on {} failed ({}), restored: {}",
                        op.node.short(),
                        op.target,
                        key,
                        other,
                        restored.is_ok()
                    );
                }
                _ => {}
            }
        }
        state.persist(&op.node);
        self.finish_handshake(state, &op.node, op.purpose);
    }

    fn finish_handshake(&mut self, state: &mut PeerState, node: &Identifier, purpose: HandshakePurpose) {
        match purpose {
            HandshakePurpose::Join => self.advance_level_builder(state, node, 1, None),
            HandshakePurpose::JoinLevel {
                reply_op,
                level,
                route,
            } => {
                let reply = match state.controller(node) {
                    Some(controller) => Reply::Ack(AckPayload::Contact(controller.contact())),
                    None => Reply::Nack(NackReason::UnknownNode),
                };
                state.reply(Some(node), reply_op, reply);
                state.persist(node);
                self.advance_level_builder(state, node, level, Some(route));
            }
        }
    }
}

impl OperationResponder {
    /// Points `level` and `direction` of `node` at `sender` if the slot still holds `former`,
    /// or nothing yet.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn execute_handshake(
        &mut self,
        state: &mut PeerState,
        node: Identifier,
        op_id: OperationId,
        sender: SkipgraphContact,
        level: usize,
        direction: Direction,
        former: SkipgraphContact,
    ) {
        let key = LevelKey::new(level, direction);
        let Some(controller) = state.controllers.get_mut(&node) else {
            return;
        };
        let reply = if controller.is_disabled() {
            Reply::Nack(NackReason::Disabled)
        } else if state.busy.is_held_by_other(node, key, &op_id) {
            Reply::Nack(NackReason::Busy)
        } else {
            let current = controller.node().contact_table().get(level, direction).ok();
            let expected = current.is_some_and(|c| {
                c.is(former.node_id()) || c.is(&node) || c.is(sender.node_id())
            });
            if !expected {
                Reply::Nack(NackReason::Stale)
            } else {
                match controller.install(level, direction, sender.clone()) {
                    Ok(()) => Reply::Ack(AckPayload::Contact(controller.contact())),
                    Err(e) => {
                        let _enter = self.span.enter();
                        tracing::debug!("refused handshake of {}: {:#}", sender, e);
                        Reply::Nack(NackReason::Stale)
                    }
                }
            }
        };

        if reply.is_ack() {
            state.persist(&node);
        } else {
            let _enter = self.span.enter();
            tracing::debug!(
                "node {} refused handshake of {} on {}: {:?}",
                node.short(),
                sender,
                key,
                reply
            );
        }
        state.reply(Some(&node), op_id, reply);
    }
}
