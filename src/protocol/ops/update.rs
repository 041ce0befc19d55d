use crate::core::controller::UpdatePlan;
use crate::core::element::UpdateBatch;
use crate::core::model::contact::SkipgraphContact;
use crate::core::Identifier;
use crate::protocol::caller::{OperationCaller, PendingOperation, Resolution, UpdateOutcome};
use crate::protocol::message::{Destination, NackReason, Reply, Request};
use crate::protocol::peer::PeerState;
use crate::protocol::responder::OperationResponder;
use crate::protocol::OperationId;

/// Where a batch being routed came from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct UpdateContext {
    /// The update a local caller started, if the batch belongs to one.
    pub(crate) root: Option<OperationId>,
    /// Key of the retry budget shared by every leg this batch spawns.
    pub(crate) chain: Option<OperationId>,
    /// Forwarding hops the batch already took.
    pub(crate) hops: usize,
}

impl UpdateContext {
    /// A batch relayed for somebody else, or replayed from a buffer.
    pub(crate) fn relay(hops: usize) -> UpdateContext {
        UpdateContext {
            root: None,
            chain: None,
            hops,
        }
    }
}

/// An update started here, waiting for its forwarding legs.
#[derive(Debug, Default)]
pub(crate) struct UpdateOp {
    outstanding: usize,
    failed: bool,
    legs: usize,
    retries: usize,
}

/// One sub-batch on its way to the node responsible for it.
#[derive(Debug)]
pub(crate) struct UpdateLeg {
    pub(crate) node: Identifier,
    pub(crate) batch: UpdateBatch,
    pub(crate) target: SkipgraphContact,
    pub(crate) context: UpdateContext,
}

impl OperationCaller {
    /// Routes `batch` from the first usable local node.
    pub(crate) fn start_update(&mut self, state: &mut PeerState, batch: UpdateBatch) -> OperationId {
        let root = state.next_op_id();
        let Some(entry) = state.entry_node() else {
            {
                let _enter = self.span.enter();
                tracing::warn!("update {} has no entry node", root);
            }
            self.update_outcomes.insert(
                root,
                UpdateOutcome {
                    success: false,
                    legs: 0,
                    retries: 0,
                },
            );
            return root;
        };
        {
            let _enter = self.span.enter();
            tracing::debug!("update {} of {} elements starts at node {}", root, batch.len(), entry.short());
        }
        self.updates.insert(root, UpdateOp::default());
        let context = UpdateContext {
            root: Some(root),
            chain: Some(root),
            hops: 0,
        };
        let plan = self.process_update(state, &entry, batch, context);
        if !plan.is_accepted() {
            self.fail_update(&root);
        }
        self.maybe_finish_update(&root);
        root
    }

    /// Runs `batch` through the controller of `node`: applies what belongs here, persists, checks
    /// the thresholds and forwards the rest.
    pub(crate) fn process_update(
        &mut self,
        state: &mut PeerState,
        node: &Identifier,
        batch: UpdateBatch,
        context: UpdateContext,
    ) -> UpdatePlan {
        let Some(controller) = state.controllers.get_mut(node) else {
            return UpdatePlan {
                unroutable: batch.len(),
                ..UpdatePlan::default()
            };
        };
        let mut plan = controller.update(batch);
        let forwards = std::mem::take(&mut plan.forwards);
        if plan.applied > 0 {
            state.persist(node);
            self.act_on_thresholds(state, node);
        }
        for (target, batch) in forwards {
            self.send_update_leg(
                state,
                UpdateLeg {
                    node: *node,
                    batch,
                    target,
                    context,
                },
            );
        }
        plan
    }

    fn send_update_leg(&mut self, state: &mut PeerState, mut leg: UpdateLeg) {
        let hops = leg.context.hops + 1;
        if hops > state.config().max_forward_hops {
            {
                let _enter = self.span.enter();
                tracing::warn!(
                    "dropping {} elements for {} after {} hops",
                    leg.batch.len(),
                    leg.target,
                    leg.context.hops
                );
            }
            if let Some(chain) = leg.context.chain {
                self.give_up_chain(leg.context.root, chain);
            }
            return;
        }
        let op_id = state.next_op_id();
        leg.context.chain.get_or_insert(op_id);
        if let Some(op) = leg.context.root.and_then(|root| self.updates.get_mut(&root)) {
            op.outstanding += 1;
            op.legs += 1;
        }
        let request = Request::UpdateForward {
            batch: leg.batch.clone(),
            hops,
        };
        let from = leg.node;
        let to = Destination::Node(*leg.target.node_id());
        let timeout = state.config().service_timeout;
        self.send_tracked_as(state, op_id, &from, to, request, PendingOperation::UpdateLeg(leg), timeout);
    }

    pub(crate) fn on_update_leg_resolved(
        &mut self,
        state: &mut PeerState,
        op_id: OperationId,
        leg: UpdateLeg,
        resolution: Resolution,
    ) {
        let chain = leg.context.chain.unwrap_or(op_id);
        let root = leg.context.root;
        match resolution {
            Resolution::Ack(_) => {
                if root.is_none() {
                    self.retry_limits.remove(&chain);
                }
            }
            Resolution::Nack(NackReason::Invalid) => {
                {
                    let _enter = self.span.enter();
                    tracing::warn!("{} rejected {} elements as malformed", leg.target, leg.batch.len());
                }
                self.give_up_chain(root, chain);
            }
            other => {
                let spent = self.retry_limits.entry(chain).or_insert(0);
                *spent += 1;
                let spent = *spent;
                if spent > state.config().max_update_retries {
                    {
                        let _enter = self.span.enter();
                        tracing::warn!(
                            "giving up forwarding {} elements to {} after {} retries: {}",
                            leg.batch.len(),
                            leg.target,
                            spent - 1,
                            other
                        );
                    }
                    self.give_up_chain(root, chain);
                } else {
                    {
                        let _enter = self.span.enter();
                        tracing::debug!(
                            "retrying {} elements for {} ({}): {}",
                            leg.batch.len(),
                            leg.target,
                            spent,
                            other
                        );
                    }
                    if let Some(op) = root.and_then(|root| self.updates.get_mut(&root)) {
                        op.retries += 1;
                    }
                    let from = Some(leg.node)
                        .filter(|node| state.controller(node).is_some())
                        .or_else(|| state.entry_node());
                    let context = UpdateContext {
                        chain: Some(chain),
                        ..leg.context
                    };
                    let accepted = match from {
                        Some(from) => self.process_update(state, &from, leg.batch, context).is_accepted(),
                        None => false,
                    };
                    if !accepted {
                        self.give_up_chain(root, chain);
                    }
                }
            }
        }

        if let Some(root) = root {
            if let Some(op) = self.updates.get_mut(&root) {
                op.outstanding = op.outstanding.saturating_sub(1);
            }
            self.maybe_finish_update(&root);
        }
    }

    /// An update started here fails; a relayed chain just drops its retry budget.
    fn give_up_chain(&mut self, root: Option<OperationId>, chain: OperationId) {
        match root {
            Some(root) => self.fail_update(&root),
            None => {
                self.retry_limits.remove(&chain);
            }
        }
    }

    fn fail_update(&mut self, root: &OperationId) {
        if let Some(op) = self.updates.get_mut(root) {
            op.failed = true;
        }
    }

    fn maybe_finish_update(&mut self, root: &OperationId) {
        if self.updates.get(root).is_none_or(|op| op.outstanding > 0) {
            return;
        }
        let Some(op) = self.updates.remove(root) else {
            return;
        };
        self.retry_limits.remove(root);
        {
            let _enter = self.span.enter();
            tracing::debug!(
                "update {} finished, success: {}, {} legs, {} retries",
                root,
                !op.failed,
                op.legs,
                op.retries
            );
        }
        self.update_outcomes.insert(
            *root,
            UpdateOutcome {
                success: !op.failed,
                legs: op.legs,
                retries: op.retries,
            },
        );
    }
}

impl OperationResponder {
    /// Routes a batch a neighbor forwarded here and acknowledges it once it was applied, buffered
    /// or passed on.
    pub(crate) fn execute_update_forward(
        &mut self,
        state: &mut PeerState,
        caller: &mut OperationCaller,
        node: Identifier,
        op_id: OperationId,
        batch: UpdateBatch,
        hops: usize,
    ) {
        if hops > state.config().max_forward_hops {
            state.reply(Some(&node), op_id, Reply::Nack(NackReason::NoCandidate));
            return;
        }
        if state.controller(&node).is_none() {
            return;
        }
        let plan = caller.process_update(state, &node, batch, UpdateContext::relay(hops));
        let reply = if plan.rejected {
            Reply::Nack(NackReason::Invalid)
        } else if plan.unroutable > 0 {
            Reply::Nack(NackReason::NoCandidate)
        } else {
            Reply::ack()
        };
        if !reply.is_ack() {
            let _enter = self.span.enter();
            tracing::debug!("node {} could not take a forwarded batch: {:?}", node.short(), reply);
        }
        state.reply(Some(&node), op_id, reply);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_context_has_no_owner() {
        let context = UpdateContext::relay(3);
        assert_eq!(context.hops, 3);
        assert!(context.root.is_none());
        assert!(context.chain.is_none());
        assert_eq!(UpdateContext::relay(0), UpdateContext::default());
    }
}
