use crate::core::model::contact::SkipgraphContact;
use crate::core::Identifier;
use crate::protocol::caller::OperationCaller;
use crate::protocol::message::{Destination, Request};
use crate::protocol::peer::PeerState;
use crate::protocol::responder::OperationResponder;

impl OperationCaller {
    /// Sends the current snapshot of `node` to each of its distinct neighbors. Nobody answers.
    pub(crate) fn broadcast_range_adjustment(&mut self, state: &mut PeerState, node: &Identifier) {
        let Some(controller) = state.controller(node) else {
            return;
        };
        if controller.is_disabled() {
            return;
        }
        let contact = controller.contact();
        let neighbors: Vec<Identifier> = controller
            .node()
            .contact_table()
            .unique_neighbors()
            .into_iter()
            .map(|(neighbor, _)| *neighbor.node_id())
            .collect();
        {
            let _enter = self.span.enter();
            tracing::trace!(
                "node {} announces range {} to {} neighbors",
                node.short(),
                contact.range(),
                neighbors.len()
            );
        }
        for neighbor in neighbors {
            let op_id = state.next_op_id();
            state.send(
                Some(node),
                op_id,
                Destination::Node(neighbor),
                Request::RangeAdjustment {
                    contact: contact.clone(),
                },
            );
        }
    }
}

impl OperationResponder {
    pub(crate) fn execute_range_adjustment(
        &mut self,
        state: &mut PeerState,
        node: Identifier,
        contact: SkipgraphContact,
    ) {
        let refreshed = state
            .controllers
            .get_mut(&node)
            .map_or(0, |c| c.refresh_contact(&contact));
        if refreshed > 0 {
            state.persist(&node);
            let _enter = self.span.enter();
            tracing::trace!("node {} refreshed {} pointers to {}", node.short(), refreshed, contact);
        }
    }
}
