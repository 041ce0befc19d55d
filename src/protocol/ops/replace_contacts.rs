use crate::core::model::contact::SkipgraphContact;
use crate::core::model::replacement::Replacement;
use crate::core::Identifier;
use crate::protocol::caller::{OperationCaller, PendingOperation, Resolution};
use crate::protocol::message::{Destination, NackReason, Reply, Request};
use crate::protocol::peer::PeerState;
use crate::protocol::responder::OperationResponder;
use crate::protocol::OperationId;

/// A disabled node waiting for its neighbors to route around it.
#[derive(Debug, Default)]
pub(crate) struct ReplaceContactsOp {
    pub(crate) outstanding: usize,
}

/// For every neighbor of `owner` the replacements that close the gap it leaves behind: the
/// neighbor's pointer back at `owner` is swapped for whatever `owner` holds on the other side of
/// the same level, or for the neighbor itself when that side is empty.
fn replacements_of(
    state: &PeerState,
    owner: &Identifier,
    exclude: Option<&Identifier>,
) -> Vec<(SkipgraphContact, Vec<Replacement>)> {
    let Some(controller) = state.controller(owner) else {
        return Vec::new();
    };
    let table = controller.node().contact_table();
    table
        .unique_neighbors()
        .into_iter()
        .filter(|(neighbor, _)| exclude.is_none_or(|e| !neighbor.is(e)))
        .map(|(neighbor, keys)| {
            let replacements = keys
                .iter()
                .filter_map(|key| {
                    let prefix = table.level_prefix(key.level)?;
                    let across = key.direction.opposite();
                    let other = table.get(key.level, across).ok()?;
                    let contact = if other.is(owner) || other.is(neighbor.node_id()) {
                        neighbor.clone()
                    } else {
                        other.clone()
                    };
                    Some(Replacement::new(key.level, prefix, across, contact))
                })
                .collect();
            (neighbor, replacements)
        })
        .collect()
}

impl OperationCaller {
    /// Tells every neighbor of the disabled `node` how to bypass it; the node terminates once
    /// every message was answered or timed out.
    pub(crate) fn start_replace_contacts(&mut self, state: &mut PeerState, node: &Identifier) {
        self.replace_contacts.insert(*node, ReplaceContactsOp::default());
        self.send_replacements(state, node, None);
        self.maybe_terminate(state, node);
    }

    pub(crate) fn send_replacements(
        &mut self,
        state: &mut PeerState,
        node: &Identifier,
        exclude: Option<&Identifier>,
    ) {
        let messages = replacements_of(state, node, exclude);
        let timeout = state.config().structural_timeout;
        for (neighbor, replacements) in messages {
            if replacements.is_empty() {
                continue;
            }
            {
                let _enter = self.span.enter();
                tracing::debug!(
                    "node {} sends {} replacements to {}",
                    node.short(),
                    replacements.len(),
                    neighbor
                );
            }
            if let Some(op) = self.replace_contacts.get_mut(node) {
                op.outstanding += 1;
            }
            self.send_tracked(
                state,
                node,
                Destination::Node(*neighbor.node_id()),
                Request::ReplaceContacts {
                    leaving: *node,
                    replacements,
                },
                PendingOperation::ReplaceContactsLeg { node: *node },
                timeout,
            );
        }
    }

    pub(crate) fn on_replace_contacts_leg_resolved(
        &mut self,
        state: &mut PeerState,
        node: Identifier,
        resolution: Resolution,
    ) {
        if !resolution.is_ack() {
            let _enter = self.span.enter();
            tracing::debug!("a neighbor of leaving node {} did not confirm: {}", node.short(), resolution);
        }
        if let Some(op) = self.replace_contacts.get_mut(&node) {
            op.outstanding = op.outstanding.saturating_sub(1);
        }
        self.maybe_terminate(state, &node);
    }

    fn maybe_terminate(&mut self, state: &mut PeerState, node: &Identifier) {
        if self.replace_contacts.get(node).is_none_or(|op| op.outstanding > 0) {
            return;
        }
        self.replace_contacts.remove(node);
        let Some(controller) = state.controllers.get_mut(node) else {
            return;
        };
        if let Err(e) = controller.terminate() {
            let _enter = self.span.enter();
            tracing::error!("failed to terminate node {}: {:#}", node.short(), e);
            return;
        }
        state.evict(node);
        let _enter = self.span.enter();
        tracing::info!("node {} left the skip graph", node.short());
    }
}

impl OperationResponder {
    /// Applies the replacements of a leaving neighbor. A node that is itself leaving passes its
    /// updated pointers on to its own neighbors.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn execute_replace_contacts(
        &mut self,
        state: &mut PeerState,
        caller: &mut OperationCaller,
        node: Identifier,
        op_id: OperationId,
        leaving: Identifier,
        replacements: Vec<Replacement>,
    ) {
        let Some(controller) = state.controllers.get_mut(&node) else {
            return;
        };
        let disabled = controller.is_disabled();
        match controller.apply_replacements(&leaving, &replacements) {
            Ok(_) => {
                state.persist(&node);
                state.reply(Some(&node), op_id, Reply::ack());
            }
            Err(e) => {
                {
                    let _enter = self.span.enter();
                    tracing::warn!("node {} cannot apply replacements of {}: {:#}", node.short(), leaving.short(), e);
                }
                state.reply(Some(&node), op_id, Reply::Nack(NackReason::Invalid));
                return;
            }
        }
        if disabled && caller.replace_contacts.contains_key(&node) {
            caller.send_replacements(state, &node, Some(&leaving));
        }
    }
}
