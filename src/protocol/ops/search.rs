use crate::core::controller::NodeController;
use crate::core::model::direction::Direction;
use crate::core::model::peer_contact::PeerContact;
use crate::core::model::range::KeyRange;
use crate::core::Identifier;
use crate::protocol::caller::{OperationCaller, PendingOperation, SearchOutcome};
use crate::protocol::message::{Destination, Request, SearchPiece, SearchQuery};
use crate::protocol::peer::PeerState;
use crate::protocol::OperationId;
use std::collections::BTreeSet;

/// A range query waiting for every piece it was cut into to be answered.
#[derive(Debug)]
pub(crate) struct SearchOp {
    pub(crate) query: SearchQuery,
    /// Pieces handed out but not answered yet.
    pub(crate) outstanding: usize,
    pub(crate) contacts: Vec<PeerContact>,
    pub(crate) hops: BTreeSet<Identifier>,
}

/// What a node does with one part of a piece.
#[derive(Debug, PartialEq)]
enum Step {
    Answer(SearchPiece),
    Forward(Identifier, SearchPiece),
}

/// Serial coverage: a piece starting outside the local range travels towards its start,
/// otherwise the node answers what it holds and passes the rest to its successor.
fn plan_serial(controller: &NodeController, piece: &SearchPiece) -> Vec<Step> {
    let me = controller.id();
    let table = controller.node().contact_table();
    let range = controller.node().range();

    let below = match (&piece.start, range.start()) {
        (_, None) => false,
        (None, Some(_)) => true,
        (Some(start), Some(own)) => start < own,
    };
    if below {
        let target = match &piece.start {
            Some(start) => Some(table.get_prev_node_for_value(start)),
            None => table
                .levels()
                .iter()
                .rev()
                .map(|level| level.prev())
                .find(|c| !c.is(me)),
        }
        .filter(|c| !c.is(me));
        if let Some(target) = target {
            return vec![Step::Forward(*target.node_id(), piece.clone())];
        }
    }

    if let (Some(start), Some(end)) = (&piece.start, range.end()) {
        if start >= end {
            let target = table.get_next_node_for_value(start);
            if target.is(me) {
                return Vec::new();
            }
            return vec![Step::Forward(*target.node_id(), piece.clone())];
        }
    }

    let mut steps = Vec::new();
    if let Some(local) = piece.clip(&range) {
        steps.push(Step::Answer(local));
    }
    if let Some(end) = range.end() {
        let rest = piece.starting_at(end);
        let next = table.neighbor(0, Direction::Next);
        if let (Some(rest), Some(next)) = (rest, next) {
            steps.push(Step::Forward(*next.node_id(), rest));
        }
    }
    steps
}

/// Parallel coverage: the piece is cut along the ranges of every known contact and each part
/// goes straight to its owner. Parts of the node's own area outside its range go to the level 0
/// neighbors.
fn plan_parallel(controller: &NodeController, piece: &SearchPiece) -> Vec<Step> {
    let me = controller.id();
    let table = controller.node().contact_table();
    let range = controller.node().range();
    let map = table.get_contact_range_map();
    let areas: Vec<_> = map.iter().collect();

    let mut steps = Vec::new();
    for (index, (start, contact)) in areas.iter().enumerate() {
        let lower = if index == 0 { None } else { (*start).clone() };
        let upper = areas.get(index + 1).and_then(|(s, _)| (*s).clone());
        let Some(part) = piece.clip(&KeyRange::new(lower, upper)) else {
            continue;
        };
        if !contact.is(me) {
            steps.push(Step::Forward(*contact.node_id(), part));
            continue;
        }

        if let Some(local) = part.clip(&range) {
            steps.push(Step::Answer(local));
        }
        if let Some(start) = range.start() {
            let before = part.clip(&KeyRange::new(None, Some(start.clone())));
            if let (Some(before), Some(prev)) = (before, table.neighbor(0, Direction::Prev)) {
                steps.push(Step::Forward(*prev.node_id(), before));
            }
        }
        if let Some(end) = range.end() {
            let after = part.starting_at(end);
            if let (Some(after), Some(next)) = (after, table.neighbor(0, Direction::Next)) {
                steps.push(Step::Forward(*next.node_id(), after));
            }
        }
    }
    steps
}

/// Answers the part of `piece` that `node` holds and hands the remainder on. The originator of
/// `request` learns the answer together with how many parts went further.
pub(crate) fn cover_piece(
    state: &mut PeerState,
    node: &Identifier,
    request: OperationId,
    query: &SearchQuery,
    piece: SearchPiece,
    hops: usize,
) {
    let max_hops = state.config().max_forward_hops;
    let parallel = state.config().parallel_search;
    let Some(controller) = state.controllers.get_mut(node) else {
        return;
    };

    let steps = if controller.is_disabled() {
        let table = controller.node().contact_table();
        table
            .neighbor(0, Direction::Next)
            .or_else(|| table.neighbor(0, Direction::Prev))
            .map(|c| vec![Step::Forward(*c.node_id(), piece.clone())])
            .unwrap_or_default()
    } else if parallel {
        plan_parallel(controller, &piece)
    } else {
        plan_serial(controller, &piece)
    };

    let mut contacts: Vec<PeerContact> = Vec::new();
    let mut forwards: Vec<(Identifier, SearchPiece)> = Vec::new();
    for step in steps {
        match step {
            Step::Answer(local) => {
                for contact in controller.search_local(
                    &query.dimension,
                    local.start.as_ref(),
                    local.end.as_ref(),
                    query.limit,
                    local.exclude_end,
                ) {
                    if !contacts.contains(&contact) {
                        contacts.push(contact);
                    }
                }
            }
            Step::Forward(to, part) => forwards.push((to, part)),
        }
    }

    {
        let _enter = controller.span().enter();
        tracing::trace!(
            "piece {} of search {} found {} owners, {} parts go further",
            piece,
            request,
            contacts.len(),
            forwards.len()
        );
        if query.limit > 0 && contacts.len() >= query.limit {
            forwards.clear();
        }
        if hops >= max_hops && !forwards.is_empty() {
            tracing::warn!(
                "search {} exhausted {} hops, dropping {} parts",
                request,
                hops,
                forwards.len()
            );
            forwards.clear();
        }
    }

    let mut delegated = 0;
    for (to, part) in forwards {
        let op_id = state.next_op_id();
        let forward = Request::SearchForward {
            request,
            query: query.clone(),
            piece: part,
            hops: hops + 1,
        };
        if state.send(Some(node), op_id, Destination::Node(to), forward) {
            delegated += 1;
        }
    }
    let op_id = state.next_op_id();
    state.send(
        Some(node),
        op_id,
        Destination::Peer(*request.origin()),
        Request::SearchResult {
            request,
            contacts,
            hops: vec![*node],
            delegated,
        },
    );
}

impl OperationCaller {
    /// Starts a range query at the first usable local node.
    pub(crate) fn start_search(&mut self, state: &mut PeerState, query: SearchQuery) -> OperationId {
        let op_id = state.next_op_id();
        let piece = SearchPiece::of(&query);
        let entry = state.entry_node();
        let Some(entry) = entry.filter(|_| !piece.is_empty()) else {
            {
                let _enter = self.span.enter();
                tracing::debug!("search {} has nothing to cover or no entry node", op_id);
            }
            self.search_outcomes.insert(
                op_id,
                SearchOutcome {
                    success: piece.is_empty(),
                    contacts: Vec::new(),
                    hops: Vec::new(),
                },
            );
            return op_id;
        };

        let op = SearchOp {
            query: query.clone(),
            outstanding: 1,
            contacts: Vec::new(),
            hops: BTreeSet::new(),
        };
        let timeout = state.config().service_timeout;
        if !self.track(state, op_id, PendingOperation::Search(op), timeout) {
            return op_id;
        }
        {
            let _enter = self.span.enter();
            tracing::debug!("search {} for {} starts at node {}", op_id, piece, entry.short());
        }
        cover_piece(state, &entry, op_id, &query, piece, 0);
        op_id
    }

    /// One node answered its piece of `request` and handed `delegated` parts on.
    pub(crate) fn on_search_result(
        &mut self,
        request: OperationId,
        contacts: Vec<PeerContact>,
        hops: Vec<Identifier>,
        delegated: usize,
    ) {
        let Some(PendingOperation::Search(op)) = self.tracker.get_mut(&request) else {
            let _enter = self.span.enter();
            tracing::trace!("late result for search {}", request);
            return;
        };
        for contact in contacts {
            if !op.contacts.contains(&contact) {
                op.contacts.push(contact);
            }
        }
        op.hops.extend(hops);
        op.outstanding = (op.outstanding + delegated).saturating_sub(1);
        let limit_reached = op.query.limit > 0 && op.contacts.len() >= op.query.limit;
        if op.outstanding > 0 && !limit_reached {
            return;
        }
        if let Some(PendingOperation::Search(op)) = self.tracker.complete(&request) {
            self.finish_search(request, op, true);
        }
    }

    pub(crate) fn finish_search(&mut self, op_id: OperationId, op: SearchOp, success: bool) {
        let mut contacts = op.contacts;
        if op.query.limit > 0 {
            contacts.truncate(op.query.limit);
        }
        {
            let _enter = self.span.enter();
            if success {
                tracing::debug!("search {} found {} owners over {} nodes", op_id, contacts.len(), op.hops.len());
            } else {
                tracing::warn!(
                    "search {} timed out with {} pieces unanswered, {} owners found",
                    op_id,
                    op.outstanding,
                    contacts.len()
                );
            }
        }
        self.search_outcomes.insert(
            op_id,
            SearchOutcome {
                success,
                contacts,
                hops: op.hops.into_iter().collect(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Config;
    use crate::core::element::ElementTable;
    use crate::core::model::value::Value;
    use crate::core::node::SkipgraphNode;
    use crate::core::testutil::fixtures::{contact, range, span_fixture};
    use std::sync::Arc;

    /// A node owning [10, 20) between a predecessor owning [0, 10) and a successor owning [20, +inf).
    fn middle_controller() -> NodeController {
        let span = span_fixture();
        let node = SkipgraphNode::new(
            &span,
            Identifier::from_u64(2),
            ElementTable::new(range(Some(10), Some(20))),
            Some(contact(Identifier::from_u64(1), None, Some(10))),
            Some(contact(Identifier::from_u64(3), Some(20), None)),
        );
        NodeController::new(&span, Arc::new(Config::default()), node)
    }

    fn piece(start: i64, end: i64) -> SearchPiece {
        SearchPiece {
            start: Some(Value::from_i64(start)),
            end: Some(Value::from_i64(end)),
            exclude_end: false,
        }
    }

    #[test]
    fn test_serial_answers_and_passes_remainder() {
        let controller = middle_controller();
        let steps = plan_serial(&controller, &piece(12, 25));
        assert_eq!(steps.len(), 2);
        assert_eq!(
            steps[0],
            Step::Answer(SearchPiece {
                start: Some(Value::from_i64(12)),
                end: Some(Value::from_i64(20)),
                exclude_end: true,
            })
        );
        assert_eq!(steps[1], Step::Forward(Identifier::from_u64(3), piece(20, 25)));
    }

    #[test]
    fn test_serial_routes_towards_start() {
        let controller = middle_controller();
        let steps = plan_serial(&controller, &piece(3, 15));
        assert_eq!(steps, vec![Step::Forward(Identifier::from_u64(1), piece(3, 15))]);

        let steps = plan_serial(&controller, &piece(30, 40));
        assert_eq!(steps, vec![Step::Forward(Identifier::from_u64(3), piece(30, 40))]);
    }

    #[test]
    fn test_parallel_cuts_along_known_ranges() {
        let controller = middle_controller();
        let steps = plan_parallel(&controller, &piece(5, 25));
        assert_eq!(steps.len(), 3);
        assert!(steps.contains(&Step::Forward(
            Identifier::from_u64(1),
            SearchPiece {
                start: Some(Value::from_i64(5)),
                end: Some(Value::from_i64(10)),
                exclude_end: true,
            }
        )));
        assert!(steps.contains(&Step::Answer(SearchPiece {
            start: Some(Value::from_i64(10)),
            end: Some(Value::from_i64(20)),
            exclude_end: true,
        })));
        assert!(steps.contains(&Step::Forward(Identifier::from_u64(3), piece(20, 25))));
    }

    #[test]
    fn test_parallel_skips_untouched_contacts() {
        let controller = middle_controller();
        let steps = plan_parallel(&controller, &piece(12, 14));
        assert_eq!(
            steps,
            vec![Step::Answer(SearchPiece {
                start: Some(Value::from_i64(12)),
                end: Some(Value::from_i64(14)),
                exclude_end: false,
            })]
        );
    }
}
