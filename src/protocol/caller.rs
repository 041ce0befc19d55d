use crate::core::element::ElementTable;
use crate::core::controller::ThresholdAction;
use crate::core::model::direction::Direction;
use crate::core::model::peer_contact::PeerContact;
use crate::core::Identifier;
use crate::network::{PeriodicTask, TimerEvent};
use crate::protocol::message::{AckPayload, Destination, NackReason, Reply, Request};
use crate::protocol::ops::{
    HandshakeOp, JoinConfirmOp, JoinHold, JoinLevelOp, JoinLevelReplyOp, JoinOp, LoadBalancingOp,
    ReplaceContactsOp, SearchOp, UpdateContext, UpdateLeg, UpdateOp,
};
use crate::protocol::peer::PeerState;
use crate::protocol::tracker::RequestTracker;
use crate::protocol::OperationId;
use std::collections::HashMap;
use std::fmt;
use std::fmt::{Display, Formatter};
use std::time::Duration;
use tracing::{Level, Span};

/// How a tracked operation ended.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Resolution {
    Ack(AckPayload),
    Nack(NackReason),
    TimedOut,
}

impl Resolution {
    pub(crate) fn is_ack(&self) -> bool {
        matches!(self, Resolution::Ack(_))
    }
}

impl From<Reply> for Resolution {
    fn from(reply: Reply) -> Self {
        match reply {
            Reply::Ack(payload) => Resolution::Ack(payload),
            Reply::Nack(reason) => Resolution::Nack(reason),
        }
    }
}

impl Display for Resolution {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::Ack(_) => write!(f, "ack"),
            Resolution::Nack(reason) => write!(f, "nack ({reason})"),
            Resolution::TimedOut => write!(f, "timeout"),
        }
    }
}

/// Everything an in-flight operation needs to resume once its reply or timer arrives.
pub(crate) enum PendingOperation {
    Join(JoinOp),
    JoinConfirm(JoinConfirmOp),
    JoinHold(JoinHold),
    JoinLevel(JoinLevelOp),
    JoinLevelReply(JoinLevelReplyOp),
    Handshake(HandshakeOp),
    RemainingSize {
        node: Identifier,
        side: Direction,
    },
    LoadBalancingLeg {
        node: Identifier,
        side: Direction,
        part: ElementTable,
    },
    LoadBalancingResponse {
        node: Identifier,
        requester: Identifier,
    },
    ReplaceContactsLeg {
        node: Identifier,
    },
    Search(SearchOp),
    UpdateLeg(UpdateLeg),
}

impl PendingOperation {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            PendingOperation::Join(_) => "join",
            PendingOperation::JoinConfirm(_) => "join_confirm",
            PendingOperation::JoinHold(_) => "join_hold",
            PendingOperation::JoinLevel(_) => "join_level",
            PendingOperation::JoinLevelReply(_) => "join_level_reply",
            PendingOperation::Handshake(_) => "handshake",
            PendingOperation::RemainingSize { .. } => "remaining_size",
            PendingOperation::LoadBalancingLeg { .. } => "load_balancing",
            PendingOperation::LoadBalancingResponse { .. } => "load_balancing_response",
            PendingOperation::ReplaceContactsLeg { .. } => "replace_contacts",
            PendingOperation::Search(_) => "search",
            PendingOperation::UpdateLeg(_) => "update_forward",
        }
    }
}

/// Final state of a range query.
#[derive(Clone, Debug, PartialEq)]
pub struct SearchOutcome {
    /// False when the query timed out before every piece was answered.
    pub success: bool,
    /// Distinct owners found, capped at the query limit.
    pub contacts: Vec<PeerContact>,
    /// Nodes that answered a piece, sorted.
    pub hops: Vec<Identifier>,
}

/// Final state of an update.
#[derive(Clone, Debug, PartialEq)]
pub struct UpdateOutcome {
    /// True when every element was applied, buffered or accepted by the next hop.
    pub success: bool,
    /// Forwarding legs the entry node sent, retries included.
    pub legs: usize,
    pub retries: usize,
}

/// OperationCaller originates operations and keeps the in-flight ones addressable by
/// operation id until their reply, their timeout or their completion arrives.
pub struct OperationCaller {
    pub(crate) tracker: RequestTracker<PendingOperation>,
    pub(crate) load_balancing: HashMap<Identifier, LoadBalancingOp>,
    pub(crate) replace_contacts: HashMap<Identifier, ReplaceContactsOp>,
    pub(crate) updates: HashMap<OperationId, UpdateOp>,
    /// Forwarding retries spent per update chain.
    pub(crate) retry_limits: HashMap<OperationId, usize>,
    pub(crate) search_outcomes: HashMap<OperationId, SearchOutcome>,
    pub(crate) update_outcomes: HashMap<OperationId, UpdateOutcome>,
    pub(crate) span: Span,
}

impl OperationCaller {
    pub fn new(parent_span: &Span) -> OperationCaller {
        let span = tracing::span!(parent: parent_span, Level::INFO, "operation_caller");
        OperationCaller {
            tracker: RequestTracker::new(&span),
            load_balancing: HashMap::new(),
            replace_contacts: HashMap::new(),
            updates: HashMap::new(),
            retry_limits: HashMap::new(),
            search_outcomes: HashMap::new(),
            update_outcomes: HashMap::new(),
            span,
        }
    }

    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    pub fn take_search_outcome(&mut self, op_id: &OperationId) -> Option<SearchOutcome> {
        self.search_outcomes.remove(op_id)
    }

    pub fn take_update_outcome(&mut self, op_id: &OperationId) -> Option<UpdateOutcome> {
        self.update_outcomes.remove(op_id)
    }

    /// Starts tracking `op_id` with a deadline of `timeout`.
    pub(crate) fn track(
        &mut self,
        state: &PeerState,
        op_id: OperationId,
        op: PendingOperation,
        timeout: Duration,
    ) -> bool {
        if let Err(e) = self.tracker.register(op_id, op) {
            let _enter = self.span.enter();
            tracing::error!("failed to track operation: {:#}", e);
            return false;
        }
        state.schedule_timeout(op_id, 0, timeout);
        true
    }

    /// Sends `request` as a new tracked operation and returns its id.
    pub(crate) fn send_tracked(
        &mut self,
        state: &mut PeerState,
        from_node: &Identifier,
        to: Destination,
        request: Request,
        op: PendingOperation,
        timeout: Duration,
    ) -> OperationId {
        let op_id = state.next_op_id();
        self.send_tracked_as(state, op_id, from_node, to, request, op, timeout);
        op_id
    }

    /// Sends `request` tracked under an id chosen by the caller. A request the transport
    /// refuses times out right away.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn send_tracked_as(
        &mut self,
        state: &mut PeerState,
        op_id: OperationId,
        from_node: &Identifier,
        to: Destination,
        request: Request,
        op: PendingOperation,
        timeout: Duration,
    ) {
        if !self.track(state, op_id, op, timeout) {
            return;
        }
        if !state.send(Some(from_node), op_id, to, request) {
            state.schedule_timeout(op_id, 0, Duration::ZERO);
        }
    }

    pub(crate) fn on_reply(&mut self, state: &mut PeerState, op_id: OperationId, reply: Reply) {
        let Some(op) = self.tracker.deliver(&op_id) else {
            return;
        };
        self.resolve(state, op_id, op, Resolution::from(reply));
    }

    pub(crate) fn on_timer(&mut self, state: &mut PeerState, event: TimerEvent) {
        match event {
            TimerEvent::Timeout { op_id, generation } => {
                if let Some(op) = self.tracker.expire(&op_id, generation) {
                    {
                        let _enter = self.span.enter();
                        tracing::debug!("operation {} ({}) timed out", op_id, op.kind());
                    }
                    self.resolve(state, op_id, op, Resolution::TimedOut);
                }
            }
            TimerEvent::Wake { op_id } => self.on_wake(state, op_id),
            TimerEvent::Periodic(task) => self.on_periodic(state, task),
        }
    }

    fn resolve(
        &mut self,
        state: &mut PeerState,
        op_id: OperationId,
        op: PendingOperation,
        resolution: Resolution,
    ) {
        {
            let _enter = self.span.enter();
            tracing::trace!("operation {} ({}) resolved: {}", op_id, op.kind(), resolution);
        }
        match op {
            PendingOperation::Join(op) => self.on_join_resolved(state, op, resolution),
            PendingOperation::JoinConfirm(op) => {
                self.on_join_confirm_resolved(state, op, resolution)
            }
            PendingOperation::JoinHold(hold) => self.on_join_hold_expired(op_id, hold),
            PendingOperation::JoinLevel(op) => {
                self.on_join_level_resolved(state, op_id, op, resolution)
            }
            PendingOperation::JoinLevelReply(op) => {
                self.on_join_level_reply_resolved(state, op_id, op, resolution)
            }
            PendingOperation::Handshake(op) => {
                self.on_handshake_resolved(state, op_id, op, resolution)
            }
            PendingOperation::RemainingSize { node, side } => {
                self.on_remaining_size_resolved(state, node, side, resolution)
            }
            PendingOperation::LoadBalancingLeg { node, side, part } => {
                self.on_load_balancing_leg_resolved(state, node, side, part, resolution)
            }
            PendingOperation::LoadBalancingResponse { node, requester } => {
                self.on_load_balancing_response_expired(state, node, requester)
            }
            PendingOperation::ReplaceContactsLeg { node } => {
                self.on_replace_contacts_leg_resolved(state, node, resolution)
            }
            PendingOperation::Search(op) => self.finish_search(op_id, op, false),
            PendingOperation::UpdateLeg(leg) => {
                self.on_update_leg_resolved(state, op_id, leg, resolution)
            }
        }
    }

    /// Resumes an operation that was waiting out a back-off.
    fn on_wake(&mut self, state: &mut PeerState, op_id: OperationId) {
        if !matches!(self.tracker.get(&op_id), Some(PendingOperation::JoinLevel(_))) {
            return;
        }
        if let Some(PendingOperation::JoinLevel(op)) = self.tracker.complete(&op_id) {
            self.dispatch_join_level(state, op);
        }
    }

    pub(crate) fn on_periodic(&mut self, state: &mut PeerState, task: PeriodicTask) {
        let nodes: Vec<Identifier> = state.controllers.keys().copied().collect();
        match task {
            PeriodicTask::Announce => {
                for node in nodes {
                    self.broadcast_range_adjustment(state, &node);
                    self.act_on_thresholds(state, &node);
                }
            }
            PeriodicTask::Purge => {
                let now = state.now();
                for node in nodes {
                    let purged = state
                        .controllers
                        .get_mut(&node)
                        .map_or(0, |c| c.purge(now));
                    if purged > 0 {
                        state.persist(&node);
                        self.act_on_thresholds(state, &node);
                    }
                }
            }
            PeriodicTask::Stats => {
                for controller in state.controllers.values() {
                    controller.report();
                }
            }
        }
    }

    /// Starts a split or a leave when the node crossed a size threshold.
    pub(crate) fn act_on_thresholds(&mut self, state: &mut PeerState, node: &Identifier) {
        let Some(action) = state.controller(node).and_then(|c| c.check_thresholds()) else {
            return;
        };
        let started = match action {
            ThresholdAction::Split if state.config().load_balancing => {
                self.start_load_balancing(state, node, false)
            }
            ThresholdAction::Split => self.start_join_split(state, node),
            ThresholdAction::Leave => self.start_load_balancing(state, node, true),
        };
        let _enter = self.span.enter();
        tracing::debug!(
            "node {} crossed a threshold ({:?}), started: {}",
            node.short(),
            action,
            started
        );
    }

    /// Unlocks `node`, installing `table` when given, persists it and replays what was buffered.
    pub(crate) fn unlock_node(
        &mut self,
        state: &mut PeerState,
        node: &Identifier,
        table: Option<ElementTable>,
    ) {
        let Some(controller) = state.controllers.get_mut(node) else {
            return;
        };
        let replay = controller.unlock(table);
        state.persist(node);
        for batch in replay {
            self.process_update(state, node, batch, UpdateContext::relay(0));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_from_reply() {
        assert_eq!(Resolution::from(Reply::ack()), Resolution::Ack(AckPayload::Empty));
        assert!(Resolution::from(Reply::Ack(AckPayload::Offer(3))).is_ack());
        assert_eq!(
            Resolution::from(Reply::Nack(NackReason::Busy)),
            Resolution::Nack(NackReason::Busy)
        );
        assert!(!Resolution::TimedOut.is_ack());
        assert_eq!(Resolution::TimedOut.to_string(), "timeout");
    }
}
