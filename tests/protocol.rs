use parking_lot::Mutex;
use skipgraph_index::core::model::prefix::LevelPrefix;
use skipgraph_index::core::model::replacement::Replacement;
use skipgraph_index::core::{
    Address, Config, Direction, Element, ElementTable, Identifier, KeyRange, PeerContact,
    SkipgraphContact, Timestamp, UpdateBatch, Value,
};
use skipgraph_index::network::sim::MemorySubstrate;
use skipgraph_index::network::{Clock, PeriodicTask, TimerEvent, Transport};
use skipgraph_index::protocol::{
    AckPayload, Body, Destination, Envelope, NackReason, OperationId, Peer, Reply, Request,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::Span;

/// Keeps every envelope instead of delivering it.
#[derive(Clone, Default)]
struct Outbox(Arc<Mutex<Vec<Envelope>>>);

impl Outbox {
    fn take(&self) -> Vec<Envelope> {
        std::mem::take(&mut *self.0.lock())
    }

    /// Takes every envelope and keeps the requests of `kind`.
    fn take_requests(&self, kind: &str) -> Vec<Envelope> {
        self.take()
            .into_iter()
            .filter(|e| matches!(e.body, Body::Request(_)) && e.kind() == kind)
            .collect()
    }
}

impl Transport for Outbox {
    fn send(&self, envelope: Envelope) -> anyhow::Result<()> {
        self.0.lock().push(envelope);
        Ok(())
    }
}

/// Keeps every timer so a test decides when it fires.
#[derive(Clone, Default)]
struct Timers(Arc<Mutex<Vec<TimerEvent>>>);

impl Timers {
    fn timeout_of(&self, op_id: &OperationId) -> Option<TimerEvent> {
        self.0
            .lock()
            .iter()
            .copied()
            .find(|e| matches!(e, TimerEvent::Timeout { op_id: id, .. } if id == op_id))
    }
}

impl Clock for Timers {
    fn now(&self) -> Timestamp {
        Timestamp::ZERO
    }

    fn schedule_after(&self, _delay: Duration, event: TimerEvent) {
        self.0.lock().push(event);
    }

    fn schedule_periodic(&self, _interval: Duration, _task: PeriodicTask) {}
}

const LOCAL: u64 = 1;
const REMOTE: u64 = 2;
const SPLITTER: u64 = 99;
const SUCCESSOR: u64 = 98;

/// A lone peer, root of every key, whose messages and timers are captured.
fn lone_peer() -> (Peer, Outbox, Timers, MemorySubstrate) {
    let id = Identifier::from_u64(LOCAL);
    let substrate = MemorySubstrate::new();
    substrate.join(id);
    let outbox = Outbox::default();
    let timers = Timers::default();
    let peer = Peer::new(
        &Span::none(),
        id,
        Arc::new(Config::default()),
        Box::new(outbox.clone()),
        Arc::new(substrate.view(id)),
        Box::new(timers.clone()),
    );
    (peer, outbox, timers, substrate)
}

fn remote_op(seq: u64) -> OperationId {
    OperationId::new(Identifier::from_u64(REMOTE), seq)
}

fn reply_to(sent: &[Envelope], op_id: &OperationId) -> Reply {
    sent.iter()
        .find_map(|e| match &e.body {
            Body::Reply(reply) if e.op_id == *op_id => Some(reply.clone()),
            _ => None,
        })
        .unwrap_or_else(|| panic!("no reply to {}", op_id))
}

fn handed_table() -> ElementTable {
    let elements = [50, 60, 70]
        .iter()
        .map(|v| {
            let owner = PeerContact::new(Identifier::from_u64(100 + *v as u64), Address::new("localhost", "7000"));
            Element::new("cpu", Value::from_i64(*v), owner, Timestamp::ZERO)
        })
        .collect();
    ElementTable::with_elements(KeyRange::new(Some(Value::from_i64(50)), None), elements).unwrap()
}

fn contact(id: u64, start: Option<i64>, end: Option<i64>) -> SkipgraphContact {
    SkipgraphContact::new(
        Identifier::from_u64(id),
        KeyRange::new(start.map(Value::from_i64), end.map(Value::from_i64)),
        LevelPrefix::new(),
    )
}

fn splitter() -> SkipgraphContact {
    contact(SPLITTER, None, Some(50))
}

fn successor() -> SkipgraphContact {
    contact(SUCCESSOR, Some(100), None)
}

fn join(
    peer: &mut Peer,
    outbox: &Outbox,
    seq: u64,
    next: Option<SkipgraphContact>,
) -> (SkipgraphContact, OperationId) {
    let op_id = remote_op(seq);
    let request = Request::Join {
        table: handed_table(),
        prev: splitter(),
        next,
    };
    peer.handle_envelope(Envelope::request(
        op_id,
        Identifier::from_u64(REMOTE),
        Destination::Peer(Identifier::from_u64(LOCAL)),
        request,
    ));
    match reply_to(&outbox.take(), &op_id) {
        Reply::Ack(AckPayload::Joined { contact, hold }) => (contact, hold),
        other => panic!("join was not held: {:?}", other),
    }
}

fn confirm(peer: &mut Peer, outbox: &Outbox, seq: u64, hold: OperationId, node: &SkipgraphContact) -> Reply {
    let op_id = remote_op(seq);
    peer.handle_envelope(Envelope::request(
        op_id,
        Identifier::from_u64(REMOTE),
        Destination::Peer(Identifier::from_u64(LOCAL)),
        Request::JoinConfirm {
            hold,
            node: *node.node_id(),
        },
    ));
    reply_to(&outbox.take(), &op_id)
}

#[test]
fn test_joined_node_is_hosted_only_once_confirmed() {
    let (mut peer, outbox, _, substrate) = lone_peer();
    let (joined, hold) = join(&mut peer, &outbox, 1, None);

    assert_eq!(peer.nodes().count(), 0);
    assert_eq!(peer.pending_operations(), 1);
    assert!(substrate.record(joined.node_id()).is_none());

    match confirm(&mut peer, &outbox, 2, hold, &joined) {
        Reply::Ack(AckPayload::Contact(contact)) => assert!(contact.is(joined.node_id())),
        other => panic!("confirmation refused: {:?}", other),
    }
    let node = peer.node(joined.node_id()).expect("confirmed node is hosted");
    assert_eq!(node.size(), 3);
    assert!(substrate.record(joined.node_id()).is_some());

    // a repeated confirmation is answered again without creating anything
    assert!(confirm(&mut peer, &outbox, 3, hold, &joined).is_ack());
    assert_eq!(peer.nodes().count(), 1);
}

#[test]
fn test_unconfirmed_join_expires() {
    let (mut peer, outbox, timers, substrate) = lone_peer();
    let (joined, hold) = join(&mut peer, &outbox, 1, None);

    let expiry = timers.timeout_of(&hold).expect("hold has a deadline");
    peer.handle_timer(expiry);
    assert_eq!(peer.pending_operations(), 0);
    assert_eq!(peer.nodes().count(), 0);

    assert_eq!(
        confirm(&mut peer, &outbox, 2, hold, &joined),
        Reply::Nack(NackReason::Stale)
    );
    assert_eq!(peer.nodes().count(), 0);
    assert!(substrate.record(joined.node_id()).is_none());
}

fn join_level(peer: &mut Peer, node: &Identifier, requester: u64, bit: bool) -> OperationId {
    let origin = Identifier::from_u64(requester);
    let op_id = OperationId::new(origin, 1);
    let contact = SkipgraphContact::new(
        origin,
        KeyRange::new(Some(Value::from_i64(requester as i64 * 100)), None),
        LevelPrefix::from_bits(&[true, bit]).unwrap(),
    );
    peer.handle_envelope(Envelope::request(
        op_id,
        origin,
        Destination::Node(*node),
        Request::JoinLevel {
            requester: contact,
            level: 1,
            direction: skipgraph_index::core::Direction::Prev,
            prefix: LevelPrefix::from_bits(&[true, bit]).unwrap(),
            hops: 0,
        },
    ));
    op_id
}

#[test]
fn test_concurrent_join_level_requests_accept_one() {
    let (mut peer, outbox, _, _) = lone_peer();
    let node = peer.bootstrap().unwrap();

    // the first request makes the node draw its level 1 bit
    let first = join_level(&mut peer, &node, 10, true);
    let bit = peer
        .node(&node)
        .unwrap()
        .node()
        .contact_table()
        .level_prefix(1)
        .expect("level 1 exists");
    let mut competing = vec![join_level(&mut peer, &node, 11, bit)];
    if !bit {
        competing.push(join_level(&mut peer, &node, 12, bit));
    }
    let sent = outbox.take();

    let acceptances: Vec<&Envelope> = sent
        .iter()
        .filter(|e| matches!(e.body, Body::Request(Request::JoinLevelReply { .. })))
        .collect();
    assert_eq!(acceptances.len(), 1);
    let busy = sent
        .iter()
        .filter(|e| matches!(e.body, Body::Reply(Reply::Nack(NackReason::Busy))))
        .count();
    assert_eq!(busy, 1);
    if !bit {
        assert_eq!(reply_to(&sent, &first), Reply::Nack(NackReason::NoCandidate));
    }
    assert_eq!(peer.busy_slots(), 1);

    // the requester refuses; the slot is released and nothing stays pending
    let acceptance = acceptances[0];
    let refusal = Envelope::reply(acceptance.op_id, Identifier::from_u64(10), Reply::Nack(NackReason::Stale));
    peer.handle_envelope(refusal);
    assert_eq!(peer.busy_slots(), 0);
    assert_eq!(peer.pending_operations(), 0);
    assert!(peer
        .node(&node)
        .unwrap()
        .node()
        .contact_table()
        .is_self_linked(1));
}

/// Hosts the node holding 50, 60 and 70 behind the splitter and, when given, before `next`.
fn hosted(peer: &mut Peer, outbox: &Outbox, next: Option<SkipgraphContact>) -> Identifier {
    let (joined, hold) = join(peer, outbox, 1, next);
    assert!(confirm(peer, outbox, 2, hold, &joined).is_ack());
    outbox.take();
    *joined.node_id()
}

fn addressee(envelope: &Envelope) -> Identifier {
    match envelope.to {
        Destination::Node(id) | Destination::Peer(id) => id,
    }
}

/// Answers `request` on behalf of the node it was sent to.
fn answer(peer: &mut Peer, request: &Envelope, reply: Reply) {
    peer.handle_envelope(Envelope::reply(request.op_id, addressee(request), reply));
}

fn announce(peer: &mut Peer) {
    peer.handle_timer(TimerEvent::Periodic(PeriodicTask::Announce));
}

fn is_to(envelope: &Envelope, id: u64) -> bool {
    envelope.to == Destination::Node(Identifier::from_u64(id))
}

#[test]
fn test_empty_node_leaves_without_offers() {
    let (mut peer, outbox, _, _) = lone_peer();
    let node = peer.bootstrap().unwrap();
    let handshake = remote_op(1);
    peer.handle_envelope(Envelope::request(
        handshake,
        Identifier::from_u64(REMOTE),
        Destination::Node(node),
        Request::Handshake {
            sender: successor(),
            level: 0,
            direction: Direction::Next,
            former: successor(),
        },
    ));
    assert!(reply_to(&outbox.take(), &handshake).is_ack());

    announce(&mut peer);
    let asks = outbox.take_requests("remaining_size");
    assert_eq!(asks.len(), 1);
    answer(&mut peer, &asks[0], Reply::Ack(AckPayload::Offer(0)));

    assert!(peer.node(&node).unwrap().is_disabled());
    let notices = outbox.take_requests("replace_contacts");
    assert_eq!(notices.len(), 1);
    assert!(is_to(&notices[0], SUCCESSOR));

    answer(&mut peer, &notices[0], Reply::ack());
    assert!(peer.node(&node).is_none());
    assert_eq!(peer.pending_operations(), 0);
}

#[test]
fn test_refused_leave_part_is_kept() {
    let (mut peer, outbox, _, _) = lone_peer();
    let node = hosted(&mut peer, &outbox, Some(successor()));

    announce(&mut peer);
    for ask in outbox.take_requests("remaining_size") {
        answer(&mut peer, &ask, Reply::Ack(AckPayload::Offer(2)));
    }
    let legs = outbox.take_requests("load_balancing");
    assert_eq!(legs.len(), 2);
    for leg in &legs {
        let reply = if is_to(leg, SPLITTER) {
            Reply::Ack(AckPayload::Contact(splitter()))
        } else {
            Reply::Nack(NackReason::Stale)
        };
        answer(&mut peer, leg, reply);
    }

    // the successor refused 70; the node keeps it and stays in the graph
    let controller = peer.node(&node).expect("node stays");
    assert!(!controller.is_disabled());
    assert!(!controller.is_locked());
    assert_eq!(controller.size(), 1);
    let table = controller.element_table().unwrap();
    assert_eq!(table.range().start(), Some(&Value::from_i64(70)));
    assert!(outbox.take_requests("replace_contacts").is_empty());
}

#[test]
fn test_too_small_offers_are_withdrawn() {
    let (mut peer, outbox, _, _) = lone_peer();
    let node = hosted(&mut peer, &outbox, Some(successor()));

    announce(&mut peer);
    for ask in outbox.take_requests("remaining_size") {
        let offer = if is_to(&ask, SPLITTER) { 1 } else { 0 };
        answer(&mut peer, &ask, Reply::Ack(AckPayload::Offer(offer)));
    }

    // only the neighbor that offered room locked itself for us
    let cancels = outbox.take_requests("load_balancing_cancel");
    assert_eq!(cancels.len(), 1);
    assert!(is_to(&cancels[0], SPLITTER));
    assert!(matches!(
        cancels[0].body,
        Body::Request(Request::LoadBalancingCancel { sender }) if sender == node
    ));
    let controller = peer.node(&node).unwrap();
    assert!(!controller.is_disabled());
    assert!(!controller.is_locked());
    assert_eq!(controller.size(), 3);
}

#[test]
fn test_cancel_releases_offer() {
    let (mut peer, outbox, _, _) = lone_peer();
    let node = peer.bootstrap().unwrap();
    let requester = contact(77, Some(100), None);
    let ask = OperationId::new(*requester.node_id(), 1);
    peer.handle_envelope(Envelope::request(
        ask,
        *requester.node_id(),
        Destination::Node(node),
        Request::RemainingSize {
            requester: requester.clone(),
            leaving: true,
        },
    ));
    assert_eq!(reply_to(&outbox.take(), &ask), Reply::Ack(AckPayload::Offer(50)));
    assert!(peer.node(&node).unwrap().is_locked());

    let cancel = |peer: &mut Peer, sender: Identifier, seq: u64| {
        peer.handle_envelope(Envelope::request(
            OperationId::new(sender, seq),
            sender,
            Destination::Node(node),
            Request::LoadBalancingCancel { sender },
        ));
    };
    // nobody but the requester withdraws the offer
    cancel(&mut peer, Identifier::from_u64(78), 1);
    assert!(peer.node(&node).unwrap().is_locked());

    cancel(&mut peer, *requester.node_id(), 2);
    assert!(!peer.node(&node).unwrap().is_locked());
    assert_eq!(peer.pending_operations(), 0);
}

#[test]
fn test_leaving_node_passes_on_replacements() {
    let (mut peer, outbox, _, _) = lone_peer();
    let node = hosted(&mut peer, &outbox, Some(successor()));

    announce(&mut peer);
    for ask in outbox.take_requests("remaining_size") {
        answer(&mut peer, &ask, Reply::Ack(AckPayload::Offer(10)));
    }
    for leg in outbox.take_requests("load_balancing") {
        let taker = if is_to(&leg, SPLITTER) { splitter() } else { successor() };
        answer(&mut peer, &leg, Reply::Ack(AckPayload::Contact(taker)));
    }
    assert!(peer.node(&node).unwrap().is_disabled());
    let notices = outbox.take_requests("replace_contacts");
    assert_eq!(notices.len(), 2);

    // the successor leaves at the same time and hands over its own successor
    let far = contact(97, Some(200), None);
    let handover = OperationId::new(Identifier::from_u64(SUCCESSOR), 1);
    peer.handle_envelope(Envelope::request(
        handover,
        Identifier::from_u64(SUCCESSOR),
        Destination::Node(node),
        Request::ReplaceContacts {
            leaving: Identifier::from_u64(SUCCESSOR),
            replacements: vec![Replacement::new(0, true, Direction::Next, far.clone())],
        },
    ));
    let sent = outbox.take();
    assert!(reply_to(&sent, &handover).is_ack());

    let passed: Vec<&Envelope> = sent.iter().filter(|e| e.kind() == "replace_contacts").collect();
    assert_eq!(passed.len(), 2);
    assert!(passed.iter().any(|e| is_to(e, 97)));
    let to_splitter = passed
        .iter()
        .find(|e| is_to(e, SPLITTER))
        .expect("splitter learns the new successor");
    match &to_splitter.body {
        Body::Request(Request::ReplaceContacts {
            leaving,
            replacements,
        }) => {
            assert_eq!(*leaving, node);
            assert_eq!(replacements.len(), 1);
            assert_eq!(replacements[0].direction, Direction::Next);
            assert!(replacements[0].contact.is(far.node_id()));
        }
        other => panic!("unexpected body {:?}", other),
    }

    // the node is gone once every neighbor answered
    for notice in notices.iter().chain(passed.into_iter()) {
        answer(&mut peer, notice, Reply::ack());
    }
    assert!(peer.node(&node).is_none());
}

#[test]
fn test_relayed_chain_drops_retry_budget_on_rejection() {
    let (mut peer, outbox, _, _) = lone_peer();
    let node = hosted(&mut peer, &outbox, None);

    // 10 lies below the node's range, so the batch moves on to the splitter
    let owner = PeerContact::new(Identifier::from_u64(110), Address::new("localhost", "7000"));
    let batch = UpdateBatch::new(
        vec![Element::new("cpu", Value::from_i64(10), owner, Timestamp::ZERO)],
        Vec::new(),
    );
    let relay = remote_op(3);
    peer.handle_envelope(Envelope::request(
        relay,
        Identifier::from_u64(REMOTE),
        Destination::Node(node),
        Request::UpdateForward { batch, hops: 1 },
    ));
    let sent = outbox.take();
    assert!(reply_to(&sent, &relay).is_ack());
    let leg = sent
        .into_iter()
        .find(|e| e.kind() == "update_forward")
        .expect("batch is forwarded");
    assert!(is_to(&leg, SPLITTER));

    answer(&mut peer, &leg, Reply::Nack(NackReason::Busy));
    assert_eq!(peer.retry_chains(), 1);
    let retry = outbox.take_requests("update_forward");
    assert_eq!(retry.len(), 1);

    answer(&mut peer, &retry[0], Reply::Nack(NackReason::Invalid));
    assert_eq!(peer.retry_chains(), 0);
}
