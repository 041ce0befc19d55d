use crate::core::element::ElementTable;
use crate::core::model::contact::SkipgraphContact;
use crate::core::model::direction::Direction;
use crate::core::Identifier;
use crate::protocol::caller::{OperationCaller, PendingOperation, Resolution};
use crate::protocol::message::{AckPayload, Destination, NackReason, Reply, Request};
use crate::protocol::ops::UpdateContext;
use crate::protocol::peer::PeerState;
use crate::protocol::responder::{ArmedResponse, OperationResponder};
use crate::protocol::OperationId;

/// A level 0 neighbor asked for room, with what it offered once it answered.
#[derive(Clone, Debug)]
struct Neighbor {
    side: Direction,
    contact: SkipgraphContact,
    offer: Option<usize>,
}

/// Parts of the table on their way to the neighbors.
#[derive(Debug)]
struct Transfer {
    /// What the node keeps, grown by every part a neighbor refused.
    retained: Option<ElementTable>,
    pending: usize,
    accepted: Vec<SkipgraphContact>,
    rejected: bool,
}

/// A node moving elements to its level 0 neighbors, either to shed its excess or to leave.
#[derive(Debug)]
pub(crate) struct LoadBalancingOp {
    leaving: bool,
    outstanding: usize,
    neighbors: Vec<Neighbor>,
    transfer: Option<Transfer>,
}

impl LoadBalancingOp {
    fn offer(&self, side: Direction) -> usize {
        self.neighbors
            .iter()
            .find(|n| n.side == side)
            .and_then(|n| n.offer)
            .unwrap_or(0)
    }
}

/// Splits `desired` elements between two neighbors in proportion to their offers, never giving
/// either more than it offered. The shares add up to `desired` unless the offers are too small.
pub(crate) fn allocate(desired: usize, prev_offer: usize, next_offer: usize) -> (usize, usize) {
    let total = prev_offer + next_offer;
    if total == 0 {
        return (0, 0);
    }
    let desired = desired.min(total);
    let mut prev = ((desired * prev_offer + total / 2) / total).min(prev_offer);
    let mut next = desired - prev;
    if next > next_offer {
        next = next_offer;
        prev = (desired - next).min(prev_offer);
    }
    (prev, next)
}

impl OperationCaller {
    /// Locks `node` and asks its level 0 neighbors how many elements they can take.
    /// A split without neighbors falls back to a join split.
    pub(crate) fn start_load_balancing(
        &mut self,
        state: &mut PeerState,
        node: &Identifier,
        leaving: bool,
    ) -> bool {
        if self.load_balancing.contains_key(node) {
            return false;
        }
        let Some(controller) = state.controllers.get_mut(node) else {
            return false;
        };
        if !controller.lock() {
            return false;
        }
        let requester = controller.contact();
        let neighbors: Vec<Neighbor> = Direction::BOTH
            .iter()
            .filter_map(|side| {
                controller
                    .node()
                    .contact_table()
                    .neighbor(0, *side)
                    .map(|contact| Neighbor {
                        side: *side,
                        contact: contact.clone(),
                        offer: None,
                    })
            })
            .collect();

        if neighbors.is_empty() {
            self.unlock_node(state, node, None);
            return !leaving && self.start_join_split(state, node);
        }
        {
            let _enter = self.span.enter();
            tracing::debug!(
                "node {} starts load balancing ({}) with {} neighbors",
                node.short(),
                if leaving { "leave" } else { "split" },
                neighbors.len()
            );
        }

        let legs: Vec<(Direction, Identifier)> = neighbors
            .iter()
            .map(|n| (n.side, *n.contact.node_id()))
            .collect();
        self.load_balancing.insert(
            *node,
            LoadBalancingOp {
                leaving,
                outstanding: legs.len(),
                neighbors,
                transfer: None,
            },
        );
        let timeout = state.config().structural_timeout;
        for (side, neighbor) in legs {
            self.send_tracked(
                state,
                node,
                Destination::Node(neighbor),
                Request::RemainingSize {
                    requester: requester.clone(),
                    leaving,
                },
                PendingOperation::RemainingSize { node: *node, side },
                timeout,
            );
        }
        true
    }

    pub(crate) fn on_remaining_size_resolved(
        &mut self,
        state: &mut PeerState,
        node: Identifier,
        side: Direction,
        resolution: Resolution,
    ) {
        let Some(op) = self.load_balancing.get_mut(&node) else {
            return;
        };
        let offer = match resolution {
            Resolution::Ack(AckPayload::Offer(offer)) => offer,
            other => {
                let _enter = self.span.enter();
                tracing::debug!("neighbor {} of node {} made no offer: {}", side, node.short(), other);
                0
            }
        };
        if let Some(neighbor) = op.neighbors.iter_mut().find(|n| n.side == side) {
            neighbor.offer = Some(offer);
        }
        op.outstanding = op.outstanding.saturating_sub(1);
        if op.outstanding == 0 {
            self.distribute(state, node);
        }
    }

    /// All offers are in: cuts the table and sends each neighbor its part, or gives up.
    fn distribute(&mut self, state: &mut PeerState, node: Identifier) {
        let Some(mut op) = self.load_balancing.remove(&node) else {
            return;
        };
        let config = state.config().clone();
        let Some(table) = state.controller(&node).and_then(|c| c.element_table().cloned()) else {
            self.abandon_load_balancing(state, node, op, "node has no table");
            return;
        };
        let size = table.len();
        let prev_offer = op.offer(Direction::Prev);
        let next_offer = op.offer(Direction::Next);
        let total = prev_offer + next_offer;

        let (need, desired) = if op.leaving {
            (size, size)
        } else {
            let need = size.saturating_sub(config.max_table_size);
            let headroom = (config.load_balancing_headroom * config.max_table_size as f64) as usize;
            let desired = (need + headroom).min(total).min(size.saturating_sub(1));
            (need, desired)
        };
        if op.leaving && size == 0 {
            let offered = op
                .neighbors
                .iter()
                .filter(|n| n.offer.unwrap_or(0) > 0)
                .map(|n| *n.contact.node_id())
                .collect();
            self.cancel_offers(state, &node, offered);
            self.retire(state, node);
            return;
        }
        if total < need || (!op.leaving && (total == 0 || desired == 0)) {
            self.abandon_load_balancing(state, node, op, "offers too small");
            return;
        }

        let (m, n) = allocate(desired, prev_offer, next_offer);
        let mut parts: Vec<(Direction, ElementTable)> = Vec::new();
        let retained;
        if op.leaving && (m == 0 || n == 0) {
            let side = if m > 0 || (n == 0 && prev_offer > 0) {
                Direction::Prev
            } else {
                Direction::Next
            };
            parts.push((side, table));
            retained = None;
        } else {
            match table.split_counts(m, n) {
                Ok(split) => {
                    if let Some(lower) = split.prev {
                        parts.push((Direction::Prev, lower));
                    }
                    if let Some(upper) = split.next {
                        parts.push((Direction::Next, upper));
                    }
                    retained = Some(split.retained);
                }
                Err(e) if op.leaving => {
                    let side = [(Direction::Prev, prev_offer), (Direction::Next, next_offer)]
                        .into_iter()
                        .find(|(_, offer)| *offer >= size)
                        .map(|(side, _)| side);
                    let Some(side) = side else {
                        let reason = format!("cannot cut table: {e:#}");
                        self.abandon_load_balancing(state, node, op, &reason);
                        return;
                    };
                    parts.push((side, table));
                    retained = None;
                }
                Err(e) => {
                    let reason = format!("cannot cut table: {e:#}");
                    self.abandon_load_balancing(state, node, op, &reason);
                    return;
                }
            }
        }

        {
            let _enter = self.span.enter();
            tracing::debug!(
                "node {} hands {} of {} elements to its neighbors (offers {}/{})",
                node.short(),
                parts.iter().map(|(_, p)| p.len()).sum::<usize>(),
                size,
                prev_offer,
                next_offer
            );
        }

        let receiving: Vec<Direction> = parts.iter().map(|(side, _)| *side).collect();
        let idle: Vec<Identifier> = op
            .neighbors
            .iter()
            .filter(|n| n.offer.unwrap_or(0) > 0 && !receiving.contains(&n.side))
            .map(|n| *n.contact.node_id())
            .collect();
        let legs: Vec<(Direction, Identifier, ElementTable)> = parts
            .into_iter()
            .filter_map(|(side, part)| {
                op.neighbors
                    .iter()
                    .find(|n| n.side == side)
                    .map(|n| (side, *n.contact.node_id(), part))
            })
            .collect();
        op.transfer = Some(Transfer {
            retained,
            pending: legs.len(),
            accepted: Vec::new(),
            rejected: false,
        });
        self.load_balancing.insert(node, op);

        self.cancel_offers(state, &node, idle);
        let Some(sender) = state.controller(&node).map(|c| c.contact()) else {
            return;
        };
        for (side, neighbor, part) in legs {
            self.send_tracked(
                state,
                &node,
                Destination::Node(neighbor),
                Request::LoadBalancing {
                    sender: sender.clone(),
                    table: part.clone(),
                },
                PendingOperation::LoadBalancingLeg { node, side, part },
                config.structural_timeout,
            );
        }
    }

    fn cancel_offers(&mut self, state: &mut PeerState, node: &Identifier, neighbors: Vec<Identifier>) {
        for neighbor in neighbors {
            let op_id = state.next_op_id();
            state.send(
                Some(node),
                op_id,
                Destination::Node(neighbor),
                Request::LoadBalancingCancel { sender: *node },
            );
        }
    }

    fn abandon_load_balancing(
        &mut self,
        state: &mut PeerState,
        node: Identifier,
        op: LoadBalancingOp,
        reason: &str,
    ) {
        {
            let _enter = self.span.enter();
            tracing::debug!("node {} abandons load balancing: {}", node.short(), reason);
        }
        let offered: Vec<Identifier> = op
            .neighbors
            .iter()
            .filter(|n| n.offer.unwrap_or(0) > 0)
            .map(|n| *n.contact.node_id())
            .collect();
        self.cancel_offers(state, &node, offered);
        self.unlock_node(state, &node, None);
        if !op.leaving {
            self.start_join_split(state, &node);
        }
    }

    pub(crate) fn on_load_balancing_leg_resolved(
        &mut self,
        state: &mut PeerState,
        node: Identifier,
        side: Direction,
        part: ElementTable,
        resolution: Resolution,
    ) {
        let Some(transfer) = self
            .load_balancing
            .get_mut(&node)
            .and_then(|op| op.transfer.as_mut())
        else {
            return;
        };
        match resolution {
            Resolution::Ack(AckPayload::Contact(contact)) => transfer.accepted.push(contact),
            other => {
                {
                    let _enter = self.span.enter();
                    tracing::warn!(
                        "neighbor {} of node {} refused {} elements: {}",
                        side,
                        node.short(),
                        part.len(),
                        other
                    );
                }
                transfer.rejected = true;
                transfer.retained = match transfer.retained.take() {
                    None => Some(part),
                    Some(retained) => match ElementTable::merge(&retained, &part) {
                        Some(merged) => Some(merged),
                        None => {
                            let _enter = self.span.enter();
                            tracing::error!(
                                "refused part {} does not touch retained range {}, dropping it",
                                part.range(),
                                retained.range()
                            );
                            Some(retained)
                        }
                    },
                };
            }
        }
        transfer.pending = transfer.pending.saturating_sub(1);
        if transfer.pending == 0 {
            self.finish_load_balancing(state, node);
        }
    }

    fn finish_load_balancing(&mut self, state: &mut PeerState, node: Identifier) {
        let Some(op) = self.load_balancing.remove(&node) else {
            return;
        };
        let Some(transfer) = op.transfer else {
            return;
        };
        if let Some(controller) = state.controllers.get_mut(&node) {
            for contact in &transfer.accepted {
                controller.refresh_contact(contact);
            }
        }

        if op.leaving && !transfer.rejected {
            self.retire(state, node);
            return;
        }
        if transfer.accepted.is_empty() {
            self.unlock_node(state, &node, None);
            if !op.leaving {
                self.start_join_split(state, &node);
            }
            return;
        }
        {
            let _enter = self.span.enter();
            tracing::info!(
                "node {} balanced its table with {} neighbors",
                node.short(),
                transfer.accepted.len()
            );
        }
        self.unlock_node(state, &node, transfer.retained);
        self.broadcast_range_adjustment(state, &node);
    }

    /// Disables a node whose elements all moved away and tells its neighbors how to bypass it.
    fn retire(&mut self, state: &mut PeerState, node: Identifier) {
        let Some(controller) = state.controllers.get_mut(&node) else {
            return;
        };
        let buffered = match controller.disable() {
            Ok(buffered) => buffered,
            Err(e) => {
                {
                    let _enter = self.span.enter();
                    tracing::error!("failed to disable node {}: {:#}", node.short(), e);
                }
                self.unlock_node(state, &node, None);
                return;
            }
        };
        state.persist(&node);
        for batch in buffered {
            self.process_update(state, &node, batch, UpdateContext::relay(0));
        }
        self.start_replace_contacts(state, &node);
    }

    pub(crate) fn on_load_balancing_response_expired(
        &mut self,
        state: &mut PeerState,
        node: Identifier,
        requester: Identifier,
    ) {
        {
            let _enter = self.span.enter();
            tracing::warn!(
                "node {} waited in vain for elements from {}",
                node.short(),
                requester.short()
            );
        }
        self.unlock_node(state, &node, None);
    }
}

impl OperationResponder {
    /// Reports how many elements `node` can take and, if any, locks it until they arrive.
    pub(crate) fn execute_remaining_size(
        &mut self,
        state: &mut PeerState,
        caller: &mut OperationCaller,
        node: Identifier,
        op_id: OperationId,
        requester: SkipgraphContact,
        leaving: bool,
    ) {
        let max_table_size = state.config().max_table_size;
        let timeout = state.config().structural_timeout * 2;
        let armed = self.armed_for(caller, &node).is_some();
        let Some(controller) = state.controllers.get_mut(&node) else {
            return;
        };
        let reply = if controller.is_disabled() {
            Reply::Nack(NackReason::Disabled)
        } else if armed || caller.load_balancing.contains_key(&node) {
            Reply::Nack(NackReason::Busy)
        } else if controller.is_locked() {
            Reply::Nack(NackReason::Locked)
        } else {
            let offer = max_table_size.saturating_sub(controller.size());
            if offer > 0 && controller.lock() {
                let arm_id = state.next_op_id();
                let pending = PendingOperation::LoadBalancingResponse {
                    node,
                    requester: *requester.node_id(),
                };
                if caller.track(state, arm_id, pending, timeout) {
                    self.armed.insert(
                        node,
                        ArmedResponse {
                            op_id: arm_id,
                            requester: *requester.node_id(),
                        },
                    );
                }
            }
            {
                let _enter = self.span.enter();
                tracing::debug!(
                    "node {} offers room for {} elements to {} (leaving: {})",
                    node.short(),
                    offer,
                    requester,
                    leaving
                );
            }
            Reply::Ack(AckPayload::Offer(offer))
        };
        state.reply(Some(&node), op_id, reply);
    }

    /// Merges the part `sender` handed over and unlocks.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn execute_load_balancing(
        &mut self,
        state: &mut PeerState,
        caller: &mut OperationCaller,
        node: Identifier,
        op_id: OperationId,
        sender: SkipgraphContact,
        table: ElementTable,
    ) {
        let armed = self
            .armed_for(caller, &node)
            .filter(|a| sender.is(&a.requester));
        let Some(armed) = armed else {
            {
                let _enter = self.span.enter();
                tracing::warn!("node {} holds no offer for {}", node.short(), sender);
            }
            state.reply(Some(&node), op_id, Reply::Nack(NackReason::Stale));
            return;
        };
        self.armed.remove(&node);
        caller.tracker.complete(&armed.op_id);

        let merged = state
            .controller(&node)
            .and_then(|c| c.element_table())
            .and_then(|own| ElementTable::merge(own, &table));
        let Some(merged) = merged else {
            {
                let _enter = self.span.enter();
                tracing::warn!("part {} from {} does not touch node {}", table.range(), sender, node.short());
            }
            state.reply(Some(&node), op_id, Reply::Nack(NackReason::Invalid));
            caller.unlock_node(state, &node, None);
            return;
        };
        {
            let _enter = self.span.enter();
            tracing::debug!(
                "node {} took {} elements from {}, now holding {}",
                node.short(),
                table.len(),
                sender,
                merged.len()
            );
        }
        caller.unlock_node(state, &node, Some(merged));
        let reply = match state.controller(&node) {
            Some(controller) => Reply::Ack(AckPayload::Contact(controller.contact())),
            None => Reply::Nack(NackReason::UnknownNode),
        };
        state.reply(Some(&node), op_id, reply);
        caller.broadcast_range_adjustment(state, &node);
    }

    /// Withdraws the offer `node` made to `sender`.
    pub(crate) fn execute_load_balancing_cancel(
        &mut self,
        state: &mut PeerState,
        caller: &mut OperationCaller,
        node: Identifier,
        sender: Identifier,
    ) {
        let Some(armed) = self.armed_for(caller, &node).filter(|a| a.requester == sender) else {
            return;
        };
        self.armed.remove(&node);
        caller.tracker.complete(&armed.op_id);
        {
            let _enter = self.span.enter();
            tracing::debug!("node {} released its offer to {}", node.short(), sender.short());
        }
        caller.unlock_node(state, &node, None);
    }
}
