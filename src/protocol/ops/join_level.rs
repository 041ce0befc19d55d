use crate::core::model::contact::SkipgraphContact;
use crate::core::model::direction::{Direction, LevelKey};
use crate::core::model::prefix::LevelPrefix;
use crate::core::Identifier;
use crate::protocol::busy::BusyKind;
use crate::protocol::caller::{OperationCaller, PendingOperation, Resolution};
use crate::protocol::message::{AckPayload, Destination, NackReason, Reply, Request};
use crate::protocol::ops::HandshakePurpose;
use crate::protocol::peer::PeerState;
use crate::protocol::responder::OperationResponder;
use crate::protocol::OperationId;

/// A node looking for a partner on `level` by walking `route` along the level below.
#[derive(Clone, Debug)]
pub(crate) struct JoinLevelOp {
    pub(crate) node: Identifier,
    pub(crate) level: usize,
    pub(crate) route: Direction,
    /// The neighbor on the level below the walk started at.
    pub(crate) below: SkipgraphContact,
    /// The node currently holding the request.
    pub(crate) target: SkipgraphContact,
    pub(crate) busy_retries: usize,
    pub(crate) optimized: bool,
}

/// An accepting node waiting for the requester to confirm the link on `level` and `side`.
pub(crate) struct JoinLevelReplyOp {
    pub(crate) node: Identifier,
    pub(crate) level: usize,
    pub(crate) side: Direction,
    pub(crate) requester: SkipgraphContact,
}

impl OperationCaller {
    /// Links `node` into its levels, starting at `level`. `after` is the route already tried on
    /// that level. Each level is tried towards `Prev` first, then towards `Next`; the builder
    /// climbs as long as the level it finished has a neighbor.
    pub(crate) fn advance_level_builder(
        &mut self,
        state: &mut PeerState,
        node: &Identifier,
        mut level: usize,
        mut after: Option<Direction>,
    ) {
        let max_levels = state.config().max_levels;
        loop {
            let Some(controller) = state.controllers.get_mut(node) else {
                return;
            };
            if controller.is_disabled() || level == 0 || level >= max_levels {
                break;
            }
            if controller.node().contact_table().height() <= level
                && !controller.add_default_top_level(&mut state.rng)
            {
                break;
            }

            let routes: &[Direction] = match after {
                None => &Direction::BOTH,
                Some(Direction::Prev) => &[Direction::Next],
                Some(Direction::Next) => &[],
            };
            let table = controller.node().contact_table();
            let candidate = routes.iter().find_map(|route| {
                let open = table
                    .level(level)
                    .is_some_and(|l| l.points_to_self(node, *route));
                let below = table.neighbor(level - 1, *route).cloned();
                below.filter(|_| open).map(|b| (*route, b))
            });
            let finished = table.is_self_linked(level);

            if let Some((route, below)) = candidate {
                self.dispatch_join_level(
                    state,
                    JoinLevelOp {
                        node: *node,
                        level,
                        route,
                        target: below.clone(),
                        below,
                        busy_retries: 0,
                        optimized: false,
                    },
                );
                return;
            }
            if finished {
                break;
            }
            level += 1;
            after = None;
        }

        // levels an operation still holds a slot on stay until it finishes
        let floor = state.busy.highest_busy_level(node).unwrap_or(0);
        if let Some(controller) = state.controllers.get_mut(node) {
            let deleted = controller.delete_redundant_levels(floor);
            let _enter = self.span.enter();
            tracing::debug!(
                "node {} finished building levels, height {}, {} redundant levels deleted",
                node.short(),
                controller.node().contact_table().height(),
                deleted
            );
        }
        state.persist(node);
    }

    /// Sends the join-level request of `op`, or backs off when its slot is busy.
    pub(crate) fn dispatch_join_level(&mut self, state: &mut PeerState, op: JoinLevelOp) {
        let op_id = state.next_op_id();
        let key = LevelKey::new(op.level, op.route);
        if !state.busy.try_acquire(op.node, BusyKind::JoinLevel, key, op_id) {
            self.back_off_join_level(state, op_id, op);
            return;
        }
        let Some(controller) = state.controller(&op.node) else {
            state.busy.release(op.node, BusyKind::JoinLevel, key, op_id);
            return;
        };
        let Some(prefix) = controller.node().contact_table().prefix_up_to(op.level) else {
            state.busy.release(op.node, BusyKind::JoinLevel, key, op_id);
            return;
        };
        let request = Request::JoinLevel {
            requester: controller.contact(),
            level: op.level,
            direction: op.route,
            prefix,
            hops: 0,
        };
        let node = op.node;
        let to = Destination::Node(*op.target.node_id());
        let timeout = state.config().structural_timeout;
        self.send_tracked_as(
            state,
            op_id,
            &node,
            to,
            request,
            PendingOperation::JoinLevel(op),
            timeout,
        );
    }

    /// Parks `op` until the busy back-off elapses, or gives up on its route.
    fn back_off_join_level(&mut self, state: &mut PeerState, op_id: OperationId, mut op: JoinLevelOp) {
        if op.busy_retries >= state.config().max_busy_retries {
            {
                let _enter = self.span.enter();
                tracing::debug!(
                    "node {} gave up level {} towards {} after {} busy refusals",
                    op.node.short(),
                    op.level,
                    op.route,
                    op.busy_retries
                );
            }
            self.advance_level_builder(state, &op.node, op.level, Some(op.route));
            return;
        }
        op.busy_retries += 1;
        let delay = state.config().busy_retry_delay;
        if let Err(e) = self.tracker.register(op_id, PendingOperation::JoinLevel(op)) {
            let _enter = self.span.enter();
            tracing::error!("failed to park join-level request: {:#}", e);
            return;
        }
        state.schedule_wake(op_id, delay);
    }

    pub(crate) fn on_join_level_resolved(
        &mut self,
        state: &mut PeerState,
        op_id: OperationId,
        mut op: JoinLevelOp,
        resolution: Resolution,
    ) {
        let key = LevelKey::new(op.level, op.route);
        state.busy.release(op.node, BusyKind::JoinLevel, key, op_id);

        match resolution {
            Resolution::Nack(NackReason::Busy) => {
                op.target = op.below.clone();
                let retry = state.next_op_id();
                self.back_off_join_level(state, retry, op);
            }
            Resolution::Nack(NackReason::NoCandidate) if !op.optimized => {
                // only the level being built may flip, and only while nobody is linked on it
                let settled = !state.busy.is_level_busy(&op.node, op.level);
                let flipped = settled
                    && state.controllers.get_mut(&op.node).is_some_and(|c| {
                        c.node().contact_table().top_level() == op.level
                            && c.optimize_top_level_prefix(op.below.node_id(), op.route)
                    });
                if flipped {
                    op.optimized = true;
                    op.busy_retries = 0;
                    op.target = op.below.clone();
                    self.dispatch_join_level(state, op);
                } else {
                    self.advance_level_builder(state, &op.node, op.level, Some(op.route));
                }
            }
            other => {
                {
                    let _enter = self.span.enter();
                    tracing::debug!(
                        "node {} found no partner on level {} towards {}: {}",
                        op.node.short(),
                        op.level,
                        op.route,
                        other
                    );
                }
                self.advance_level_builder(state, &op.node, op.level, Some(op.route));
            }
        }
    }

    /// The request `request` moved on to `forwardee`; its deadline restarts.
    pub(crate) fn on_join_level_notify(
        &mut self,
        state: &mut PeerState,
        request: OperationId,
        forwardee: SkipgraphContact,
    ) {
        let Some(PendingOperation::JoinLevel(op)) = self.tracker.get_mut(&request) else {
            let _enter = self.span.enter();
            tracing::trace!("notify for finished join-level request {}", request);
            return;
        };
        op.target = forwardee;
        if let Some(generation) = self.tracker.extend(&request) {
            state.schedule_timeout(request, generation, state.config().structural_timeout);
        }
    }

    /// `accepting` takes the requester of `request` on its level. The requester links it, then
    /// completes the other side with `former` before confirming `reply_op`.
    pub(crate) fn on_join_level_reply(
        &mut self,
        state: &mut PeerState,
        reply_op: OperationId,
        request: OperationId,
        accepting: SkipgraphContact,
        former: SkipgraphContact,
    ) {
        let op = match self.tracker.deliver(&request) {
            Some(PendingOperation::JoinLevel(op)) => op,
            Some(other) => {
                let _enter = self.span.enter();
                tracing::error!("operation {} is a {}, not a join-level request", request, other.kind());
                return;
            }
            None => {
                state.reply(None, reply_op, Reply::Nack(NackReason::Stale));
                return;
            }
        };
        let key = LevelKey::new(op.level, op.route);
        state.busy.release(op.node, BusyKind::JoinLevel, key, request);
        let node = op.node;

        let Some(controller) = state.controllers.get_mut(&node) else {
            state.reply(None, reply_op, Reply::Nack(NackReason::UnknownNode));
            return;
        };
        if controller.is_disabled() {
            state.reply(Some(&node), reply_op, Reply::Nack(NackReason::Disabled));
            return;
        }
        let opposite = op.route.opposite();
        let table = controller.node().contact_table();
        let (open, opposite_open) = match table.level(op.level) {
            Some(l) => (l.points_to_self(&node, op.route), l.points_to_self(&node, opposite)),
            None => (false, false),
        };
        let agrees = table
            .prefix_up_to(op.level)
            .is_some_and(|own| accepting.prefix().common_prefix_len(&own) >= own.depth());
        if !open || !agrees || controller.install(op.level, op.route, accepting.clone()).is_err() {
            state.reply(Some(&node), reply_op, Reply::Nack(NackReason::Stale));
            self.advance_level_builder(state, &node, op.level, Some(op.route));
            return;
        }
        {
            let _enter = self.span.enter();
            tracing::debug!(
                "node {} linked {} on level {} towards {}",
                node.short(),
                accepting,
                op.level,
                op.route
            );
        }

        if former.is(accepting.node_id()) || former.is(&node) || !opposite_open {
            let contact = controller.contact();
            state.reply(Some(&node), reply_op, Reply::Ack(AckPayload::Contact(contact)));
            state.persist(&node);
            self.advance_level_builder(state, &node, op.level, Some(op.route));
            return;
        }
        self.start_handshake(
            state,
            &node,
            op.level,
            opposite,
            former,
            accepting,
            HandshakePurpose::JoinLevel {
                reply_op,
                level: op.level,
                route: op.route,
            },
        );
    }

    /// The requester confirmed, refused or never answered an acceptance.
    pub(crate) fn on_join_level_reply_resolved(
        &mut self,
        state: &mut PeerState,
        op_id: OperationId,
        op: JoinLevelReplyOp,
        resolution: Resolution,
    ) {
        let key = LevelKey::new(op.level, op.side);
        state.busy.release(op.node, BusyKind::JoinLevel, key, op_id);
        let Some(controller) = state.controllers.get_mut(&op.node) else {
            return;
        };
        let requester = match resolution {
            Resolution::Ack(AckPayload::Contact(fresh)) => fresh,
            Resolution::Ack(_) => op.requester,
            other => {
                let _enter = self.span.enter();
                tracing::debug!(
                    "requester {} did not confirm level {}: {}",
                    op.requester,
                    op.level,
                    other
                );
                return;
            }
        };
        match controller.install(op.level, op.side, requester) {
            Ok(()) => state.persist(&op.node),
            Err(e) => {
                let _enter = self.span.enter();
                tracing::warn!("failed to link confirmed requester: {:#}", e);
            }
        }
    }
}

impl OperationResponder {
    /// Accepts the requester on `level` if this node shares its prefix up to that level, or
    /// passes the request further along `direction` on the level below.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn execute_join_level(
        &mut self,
        state: &mut PeerState,
        caller: &mut OperationCaller,
        node: Identifier,
        op_id: OperationId,
        requester: SkipgraphContact,
        level: usize,
        direction: Direction,
        prefix: LevelPrefix,
        hops: usize,
    ) {
        let config = state.config().clone();
        if level == 0 || requester.is(&node) || prefix.depth() != level + 1 {
            state.reply(Some(&node), op_id, Reply::Nack(NackReason::Invalid));
            return;
        }
        if hops > config.max_forward_hops {
            state.reply(Some(&node), op_id, Reply::Nack(NackReason::NoCandidate));
            return;
        }
        let Some(controller) = state.controllers.get_mut(&node) else {
            return;
        };

        let disabled = controller.is_disabled();
        if !disabled {
            if let Err(e) = controller.ensure_level(level, &mut state.rng) {
                {
                    let _enter = self.span.enter();
                    tracing::debug!("node {} cannot serve level {}: {:#}", node.short(), level, e);
                }
                state.reply(Some(&node), op_id, Reply::Nack(NackReason::Invalid));
                return;
            }
        }
        let table = controller.node().contact_table();
        let matches = !disabled && table.shares_prefix(&prefix);

        if !matches {
            let forwardee = table
                .neighbor(level - 1, direction)
                .filter(|c| !c.is(requester.node_id()))
                .cloned();
            let Some(forwardee) = forwardee else {
                state.reply(Some(&node), op_id, Reply::Nack(NackReason::NoCandidate));
                return;
            };
            let forward = Request::JoinLevel {
                requester,
                level,
                direction,
                prefix,
                hops: hops + 1,
            };
            state.send(Some(&node), op_id, Destination::Node(*forwardee.node_id()), forward);
            let notify_id = state.next_op_id();
            state.send(
                Some(&node),
                notify_id,
                Destination::Peer(*op_id.origin()),
                Request::JoinLevelNotify {
                    request: op_id,
                    forwardee,
                },
            );
            return;
        }

        let side = direction.opposite();
        let key = LevelKey::new(level, side);
        if state.busy.is_held_by_other(node, key, &op_id) {
            state.reply(Some(&node), op_id, Reply::Nack(NackReason::Busy));
            return;
        }
        let former = match table.get(level, side) {
            Ok(former) => former.clone(),
            Err(_) => {
                state.reply(Some(&node), op_id, Reply::Nack(NackReason::Invalid));
                return;
            }
        };
        let accepting = controller.contact();
        let accept_id = state.next_op_id();
        if !state.busy.try_acquire(node, BusyKind::JoinLevel, key, accept_id) {
            state.reply(Some(&node), op_id, Reply::Nack(NackReason::Busy));
            return;
        }
        {
            let _enter = self.span.enter();
            tracing::debug!(
                "node {} accepts {} on level {}, displacing {}",
                node.short(),
                requester,
                level,
                former
            );
        }
        let request = Request::JoinLevelReply {
            request: op_id,
            accepting,
            former,
        };
        let op = JoinLevelReplyOp {
            node,
            level,
            side,
            requester,
        };
        caller.send_tracked_as(
            state,
            accept_id,
            &node,
            Destination::Peer(*op_id.origin()),
            request,
            PendingOperation::JoinLevelReply(op),
            // the requester handshakes its former neighbor before it confirms
            config.structural_timeout * 2,
        );
    }
}
