use crate::core::element::{ElementTable, UpdateBatch};
use crate::core::model::contact::SkipgraphContact;
use crate::core::model::direction::Direction;
use crate::core::model::peer_contact::PeerContact;
use crate::core::model::prefix::LevelPrefix;
use crate::core::model::range::KeyRange;
use crate::core::model::replacement::Replacement;
use crate::core::model::value::Value;
use crate::core::model::IDENTIFIER_SIZE_BYTES;
use crate::core::Identifier;
use crate::protocol::OperationId;
use std::fmt;
use std::fmt::{Display, Formatter};

/// Fixed per-message overhead: operation id, sender, destination and message kind.
const HEADER_SIZE_BYTES: usize = 3 * IDENTIFIER_SIZE_BYTES + 8 + 2;

/// Where an envelope goes: a skip graph node, resolved through the substrate, or a peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Destination {
    Node(Identifier),
    Peer(Identifier),
}

impl Display for Destination {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Node(id) => write!(f, "node {}", id.short()),
            Destination::Peer(id) => write!(f, "peer {}", id.short()),
        }
    }
}

/// Envelope is the unit the transport moves. `op_id` ties a request to its reply; a reply always
/// goes back to the peer that originated the operation.
#[derive(Clone, Debug)]
pub struct Envelope {
    pub op_id: OperationId,
    pub from: Identifier,
    pub to: Destination,
    pub body: Body,
}

impl Envelope {
    pub fn request(op_id: OperationId, from: Identifier, to: Destination, request: Request) -> Envelope {
        Envelope {
            op_id,
            from,
            to,
            body: Body::Request(request),
        }
    }

    /// A reply to the request `op_id`, addressed to its origin.
    pub fn reply(op_id: OperationId, from: Identifier, reply: Reply) -> Envelope {
        Envelope {
            op_id,
            from,
            to: Destination::Peer(*op_id.origin()),
            body: Body::Reply(reply),
        }
    }

    pub fn size_bytes(&self) -> usize {
        HEADER_SIZE_BYTES
            + match &self.body {
                Body::Request(request) => request.size_bytes(),
                Body::Reply(reply) => reply.size_bytes(),
            }
    }

    pub fn kind(&self) -> &'static str {
        match &self.body {
            Body::Request(request) => request.kind(),
            Body::Reply(Reply::Ack(_)) => "ack",
            Body::Reply(Reply::Nack(_)) => "nack",
        }
    }
}

#[derive(Clone, Debug)]
pub enum Body {
    Request(Request),
    Reply(Reply),
}

/// Why a request was refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NackReason {
    /// Another structural operation holds the level.
    Busy,
    /// The node is leaving.
    Disabled,
    /// The node is in the middle of a structural change.
    Locked,
    /// The request refers to state the receiver no longer has.
    Stale,
    /// The request is malformed or out of budget.
    Invalid,
    /// The receiving peer is not authoritative for the key involved.
    NotRoot,
    /// No node with the addressed id lives at the receiving peer.
    UnknownNode,
    /// Nobody along the route can accept the request.
    NoCandidate,
    /// The receiver does not handle this request.
    Unsupported,
}

impl NackReason {
    /// True when the same request may succeed later or elsewhere.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NackReason::Busy | NackReason::Locked | NackReason::NotRoot | NackReason::UnknownNode
        )
    }
}

impl Display for NackReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Payload of a positive reply.
#[derive(Clone, Debug, PartialEq)]
pub enum AckPayload {
    Empty,
    /// A fresh snapshot of the replying node.
    Contact(SkipgraphContact),
    /// How many elements the replying node can still take.
    Offer(usize),
    /// A node created on request, held back until its creator confirms `hold`.
    Joined {
        contact: SkipgraphContact,
        hold: OperationId,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
    Ack(AckPayload),
    Nack(NackReason),
}

impl Reply {
    pub fn ack() -> Reply {
        Reply::Ack(AckPayload::Empty)
    }

    pub fn is_ack(&self) -> bool {
        matches!(self, Reply::Ack(_))
    }

    pub fn size_bytes(&self) -> usize {
        match self {
            Reply::Ack(AckPayload::Empty) => 1,
            Reply::Ack(AckPayload::Contact(contact)) => 1 + contact.size_bytes(),
            Reply::Ack(AckPayload::Offer(_)) => 1 + 8,
            Reply::Ack(AckPayload::Joined { contact, .. }) => {
                1 + contact.size_bytes() + IDENTIFIER_SIZE_BYTES + 8
            }
            Reply::Nack(_) => 2,
        }
    }
}

/// A range query: owners of elements of `dimension` with `start <= value <= end`, or
/// `value < end` when `exclude_end` holds. `limit` caps the owners returned; zero means no cap.
#[derive(Clone, Debug, PartialEq)]
pub struct SearchQuery {
    pub dimension: String,
    pub start: Option<Value>,
    pub end: Option<Value>,
    pub exclude_end: bool,
    pub limit: usize,
}

impl SearchQuery {
    pub fn new(dimension: &str, start: Option<Value>, end: Option<Value>) -> SearchQuery {
        SearchQuery {
            dimension: dimension.to_string(),
            start,
            end,
            exclude_end: false,
            limit: 0,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> SearchQuery {
        self.limit = limit;
        self
    }

    pub fn excluding_end(mut self) -> SearchQuery {
        self.exclude_end = true;
        self
    }

    pub fn size_bytes(&self) -> usize {
        self.dimension.len()
            + self.start.as_ref().map_or(1, Value::size_bytes)
            + self.end.as_ref().map_or(1, Value::size_bytes)
            + 1
            + 8
    }
}

/// SearchPiece is the part of a query one node is asked to cover.
#[derive(Clone, Debug, PartialEq)]
pub struct SearchPiece {
    pub start: Option<Value>,
    pub end: Option<Value>,
    pub exclude_end: bool,
}

impl SearchPiece {
    pub fn of(query: &SearchQuery) -> SearchPiece {
        SearchPiece {
            start: query.start.clone(),
            end: query.end.clone(),
            exclude_end: query.exclude_end,
        }
    }

    /// The part of this piece inside `range`, if any. The cut at the end of `range` is exclusive.
    pub fn clip(&self, range: &KeyRange) -> Option<SearchPiece> {
        let start = match (&self.start, range.start()) {
            (Some(s), Some(r)) => Some(s.max(r).clone()),
            (Some(s), None) => Some(s.clone()),
            (None, r) => r.cloned(),
        };
        let (end, exclude_end) = match (&self.end, range.end()) {
            (Some(e), Some(r)) if r <= e => (Some(r.clone()), true),
            (Some(e), _) => (Some(e.clone()), self.exclude_end),
            (None, r) => (r.cloned(), r.is_some()),
        };
        let piece = SearchPiece {
            start,
            end,
            exclude_end,
        };
        if piece.is_empty() {
            None
        } else {
            Some(piece)
        }
    }

    /// The part of this piece at or above `from`, if any.
    pub fn starting_at(&self, from: &Value) -> Option<SearchPiece> {
        self.clip(&KeyRange::new(Some(from.clone()), None))
    }

    pub fn is_empty(&self) -> bool {
        match (&self.start, &self.end) {
            (Some(s), Some(e)) if self.exclude_end => s >= e,
            (Some(s), Some(e)) => s > e,
            _ => false,
        }
    }

    pub fn size_bytes(&self) -> usize {
        self.start.as_ref().map_or(1, Value::size_bytes)
            + self.end.as_ref().map_or(1, Value::size_bytes)
            + 1
    }
}

impl Display for SearchPiece {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.start {
            Some(s) => write!(f, "[{s}, ")?,
            None => write!(f, "[-inf, ")?,
        }
        match (&self.end, self.exclude_end) {
            (Some(e), true) => write!(f, "{e})"),
            (Some(e), false) => write!(f, "{e}]"),
            (None, _) => write!(f, "+inf)"),
        }
    }
}

/// The request catalogue of the protocol.
#[derive(Clone, Debug)]
pub enum Request {
    /// Create a node from `table`, linked on level 0 between `prev` and `next`.
    Join {
        table: ElementTable,
        prev: SkipgraphContact,
        next: Option<SkipgraphContact>,
    },
    /// Link in `node`, the node held back under `hold` since the join was acknowledged.
    JoinConfirm { hold: OperationId, node: Identifier },
    /// Does the receiver, or a node further along `direction` on `level - 1`, share the
    /// requester's prefix up to and including `level`?
    JoinLevel {
        requester: SkipgraphContact,
        level: usize,
        direction: Direction,
        prefix: LevelPrefix,
        hops: usize,
    },
    /// The join-level request `request` moved on to `forwardee`.
    JoinLevelNotify {
        request: OperationId,
        forwardee: SkipgraphContact,
    },
    /// `accepting` takes the requester of `request` on its level; `former` is the node the
    /// requester must handshake to complete the other side.
    JoinLevelReply {
        request: OperationId,
        accepting: SkipgraphContact,
        former: SkipgraphContact,
    },
    /// Replace the pointer on `level` and `direction` with `sender` if it still holds `former`.
    Handshake {
        sender: SkipgraphContact,
        level: usize,
        direction: Direction,
        former: SkipgraphContact,
    },
    /// How many elements can the receiver take from `requester`?
    RemainingSize {
        requester: SkipgraphContact,
        leaving: bool,
    },
    /// Take over `table`, which touches the receiver's range.
    LoadBalancing {
        sender: SkipgraphContact,
        table: ElementTable,
    },
    /// Forget the offer made to `sender`.
    LoadBalancingCancel { sender: Identifier },
    /// `leaving` leaves the graph; apply `replacements` to the pointers that held it.
    ReplaceContacts {
        leaving: Identifier,
        replacements: Vec<Replacement>,
    },
    /// The range of `contact` changed.
    RangeAdjustment { contact: SkipgraphContact },
    /// Cover `piece` of `query` for the search `request`.
    SearchForward {
        request: OperationId,
        query: SearchQuery,
        piece: SearchPiece,
        hops: usize,
    },
    /// Partial answer to the search `request`. `delegated` counts the pieces the responder
    /// handed on; each of them reports back on its own.
    SearchResult {
        request: OperationId,
        contacts: Vec<PeerContact>,
        hops: Vec<Identifier>,
        delegated: usize,
    },
    /// Apply or forward `batch`.
    UpdateForward { batch: UpdateBatch, hops: usize },
}

impl Request {
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Join { .. } => "join",
            Request::JoinConfirm { .. } => "join_confirm",
            Request::JoinLevel { .. } => "join_level",
            Request::JoinLevelNotify { .. } => "join_level_notify",
            Request::JoinLevelReply { .. } => "join_level_reply",
            Request::Handshake { .. } => "handshake",
            Request::RemainingSize { .. } => "remaining_size",
            Request::LoadBalancing { .. } => "load_balancing",
            Request::LoadBalancingCancel { .. } => "load_balancing_cancel",
            Request::ReplaceContacts { .. } => "replace_contacts",
            Request::RangeAdjustment { .. } => "range_adjustment",
            Request::SearchForward { .. } => "search_forward",
            Request::SearchResult { .. } => "search_result",
            Request::UpdateForward { .. } => "update_forward",
        }
    }

    /// False for requests the receiver never answers with a reply.
    /// A join-level request is answered by a nack or, on acceptance, by a join-level reply.
    pub fn expects_reply(&self) -> bool {
        !matches!(
            self,
            Request::JoinLevelNotify { .. }
                | Request::LoadBalancingCancel { .. }
                | Request::RangeAdjustment { .. }
                | Request::SearchForward { .. }
                | Request::SearchResult { .. }
        )
    }

    pub fn size_bytes(&self) -> usize {
        match self {
            Request::Join { table, prev, next } => {
                table.size_bytes() + prev.size_bytes() + next.as_ref().map_or(1, SkipgraphContact::size_bytes)
            }
            Request::JoinConfirm { .. } => 2 * IDENTIFIER_SIZE_BYTES + 8,
            Request::JoinLevel {
                requester, prefix, ..
            } => requester.size_bytes() + prefix.size_bytes() + 4 + 1 + 4,
            Request::JoinLevelNotify { forwardee, .. } => IDENTIFIER_SIZE_BYTES + 8 + forwardee.size_bytes(),
            Request::JoinLevelReply {
                accepting, former, ..
            } => IDENTIFIER_SIZE_BYTES + 8 + accepting.size_bytes() + former.size_bytes(),
            Request::Handshake { sender, former, .. } => sender.size_bytes() + former.size_bytes() + 5,
            Request::RemainingSize { requester, .. } => requester.size_bytes() + 1,
            Request::LoadBalancing { sender, table } => sender.size_bytes() + table.size_bytes(),
            Request::LoadBalancingCancel { .. } => IDENTIFIER_SIZE_BYTES,
            Request::ReplaceContacts {
                replacements, ..
            } => IDENTIFIER_SIZE_BYTES + replacements.iter().map(Replacement::size_bytes).sum::<usize>(),
            Request::RangeAdjustment { contact } => contact.size_bytes(),
            Request::SearchForward { query, piece, .. } => {
                IDENTIFIER_SIZE_BYTES + 8 + query.size_bytes() + piece.size_bytes() + 4
            }
            Request::SearchResult { contacts, hops, .. } => {
                IDENTIFIER_SIZE_BYTES
                    + 8
                    + contacts.iter().map(PeerContact::size_bytes).sum::<usize>()
                    + hops.len() * IDENTIFIER_SIZE_BYTES
                    + 4
            }
            Request::UpdateForward { batch, .. } => batch.size_bytes() + 4,
        }
    }
}
