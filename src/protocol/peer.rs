use crate::core::config::Config;
use crate::core::controller::NodeController;
use crate::core::element::UpdateBatch;
use crate::core::model::time::Timestamp;
use crate::core::{Identifier, SkipgraphNode};
use crate::network::{Clock, PeriodicTask, Substrate, TimerEvent, Transport};
use crate::protocol::busy::BusyLocks;
use crate::protocol::caller::{OperationCaller, SearchOutcome, UpdateOutcome};
use crate::protocol::message::{Body, Destination, Envelope, NackReason, Reply, Request, SearchQuery};
use crate::protocol::responder::OperationResponder;
use crate::protocol::OperationId;
use anyhow::anyhow;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::BTreeMap;
use std::fmt;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;
use tracing::{Level, Span};

/// PeerState is what every protocol handler of a peer works on: the local node controllers, the
/// busy locks of their level slots and the collaborators.
pub struct PeerState {
    id: Identifier,
    config: Arc<Config>,
    transport: Box<dyn Transport>,
    substrate: Arc<dyn Substrate>,
    clock: Box<dyn Clock>,
    pub(crate) controllers: BTreeMap<Identifier, NodeController>,
    pub(crate) busy: BusyLocks,
    pub(crate) rng: StdRng,
    seq: u64,
    span: Span,
}

impl PeerState {
    pub fn id(&self) -> &Identifier {
        &self.id
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn substrate(&self) -> &dyn Substrate {
        self.substrate.as_ref()
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub fn next_op_id(&mut self) -> OperationId {
        self.seq += 1;
        OperationId::new(self.id, self.seq)
    }

    pub fn controller(&self, node: &Identifier) -> Option<&NodeController> {
        self.controllers.get(node)
    }

    pub fn controller_mut(&mut self, node: &Identifier) -> Option<&mut NodeController> {
        self.controllers.get_mut(node)
    }

    /// Sends a request on behalf of `from_node`, counting it on that node.
    /// Returns false when the transport could not take the envelope.
    pub fn send(
        &mut self,
        from_node: Option<&Identifier>,
        op_id: OperationId,
        to: Destination,
        request: Request,
    ) -> bool {
        let envelope = Envelope::request(op_id, self.id, to, request);
        self.dispatch_out(from_node, envelope)
    }

    /// Answers the request `op_id` on behalf of `from_node`.
    pub fn reply(&mut self, from_node: Option<&Identifier>, op_id: OperationId, reply: Reply) {
        let envelope = Envelope::reply(op_id, self.id, reply);
        self.dispatch_out(from_node, envelope);
    }

    fn dispatch_out(&mut self, from_node: Option<&Identifier>, envelope: Envelope) -> bool {
        let bytes = envelope.size_bytes();
        let kind = envelope.kind();
        if let Some(controller) = from_node.and_then(|id| self.controllers.get_mut(id)) {
            controller.record_sent(kind, bytes);
        }
        let _enter = self.span.enter();
        tracing::trace!("sending {} of operation {} to {}", kind, envelope.op_id, envelope.to);
        match self.transport.send(envelope) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("failed to send {}: {:#}", kind, e);
                false
            }
        }
    }

    pub fn schedule_timeout(&self, op_id: OperationId, generation: u64, delay: Duration) {
        self.clock
            .schedule_after(delay, TimerEvent::Timeout { op_id, generation });
    }

    pub fn schedule_wake(&self, op_id: OperationId, delay: Duration) {
        self.clock.schedule_after(delay, TimerEvent::Wake { op_id });
    }

    /// Stores the record of a local node; failures are logged and the node keeps running.
    pub fn persist(&self, node: &Identifier) {
        if let Some(controller) = self.controllers.get(node) {
            if let Err(e) = controller.persist(self.substrate.as_ref()) {
                let _enter = self.span.enter();
                tracing::error!("failed to persist node {}: {:#}", node.short(), e);
            }
        }
    }

    /// Adds a controller for `node` and persists it.
    pub fn host(&mut self, node: SkipgraphNode) -> Identifier {
        let id = *node.id();
        let controller = NodeController::new(&self.span, self.config.clone(), node);
        self.controllers.insert(id, controller);
        self.persist(&id);
        id
    }

    /// Removes a terminated node with its record and every busy slot it held.
    pub fn evict(&mut self, node: &Identifier) {
        self.controllers.remove(node);
        self.busy.release_node(node);
        if let Err(e) = self.substrate.remove(node) {
            let _enter = self.span.enter();
            tracing::warn!("failed to remove record of node {}: {:#}", node.short(), e);
        }
    }

    /// The first local node able to serve requests.
    pub fn entry_node(&self) -> Option<Identifier> {
        self.controllers
            .values()
            .find(|c| !c.is_disabled())
            .map(|c| *c.id())
    }
}

/// Peer is the protocol engine of one participant. It hosts any number of skip graph nodes and
/// is driven by two inputs only: envelopes from the transport and events from the clock.
/// Handlers never block; every wait is a tracked operation resumed by a later input.
pub struct Peer {
    state: PeerState,
    caller: OperationCaller,
    responder: OperationResponder,
}

impl Peer {
    pub fn new(
        parent_span: &Span,
        id: Identifier,
        config: Arc<Config>,
        transport: Box<dyn Transport>,
        substrate: Arc<dyn Substrate>,
        clock: Box<dyn Clock>,
    ) -> Peer {
        let span = tracing::span!(parent: parent_span, Level::INFO, "peer", peer = %id.short());
        let seed = u64::from_be_bytes(
            id.to_bytes()[..8]
                .try_into()
                .unwrap_or([0u8; 8]),
        );
        let caller = OperationCaller::new(&span);
        let responder = OperationResponder::new(&span);
        Peer {
            state: PeerState {
                id,
                config,
                transport,
                substrate,
                clock,
                controllers: BTreeMap::new(),
                busy: BusyLocks::new(),
                rng: StdRng::seed_from_u64(seed),
                seq: 0,
                span,
            },
            caller,
            responder,
        }
    }

    pub fn id(&self) -> &Identifier {
        &self.state.id
    }

    pub fn state(&self) -> &PeerState {
        &self.state
    }

    /// Creates the first node of a graph here, owning the whole key space.
    /// The local peer must be root of the new node's id.
    pub fn bootstrap(&mut self) -> anyhow::Result<Identifier> {
        for _ in 0..self.state.config.max_lookup_attempts.max(1) {
            let id = Identifier::random(&mut self.state.rng);
            if self.state.substrate.is_root_of(&id) {
                let node = SkipgraphNode::bootstrap(&self.state.span, id);
                self.state.host(node);
                let _enter = self.state.span.enter();
                tracing::info!("bootstrapped node {}", id.short());
                return Ok(id);
            }
        }
        Err(anyhow!(
            "no identifier the local peer is root of found in {} attempts",
            self.state.config.max_lookup_attempts
        ))
    }

    /// Schedules the periodic tasks.
    pub fn start(&mut self) {
        let config = self.state.config.clone();
        self.state
            .clock
            .schedule_periodic(config.announce_interval, PeriodicTask::Announce);
        if config.churn {
            self.state
                .clock
                .schedule_periodic(config.purge_interval, PeriodicTask::Purge);
        }
        self.state
            .clock
            .schedule_periodic(config.stats_interval, PeriodicTask::Stats);
    }

    /// Starts a range query; its outcome is collected with `take_search_outcome`.
    pub fn search(&mut self, query: SearchQuery) -> OperationId {
        self.caller.start_search(&mut self.state, query)
    }

    /// Starts an update; its outcome is collected with `take_update_outcome`.
    pub fn update(&mut self, batch: UpdateBatch) -> OperationId {
        self.caller.start_update(&mut self.state, batch)
    }

    pub fn take_search_outcome(&mut self, op_id: &OperationId) -> Option<SearchOutcome> {
        self.caller.take_search_outcome(op_id)
    }

    pub fn take_update_outcome(&mut self, op_id: &OperationId) -> Option<UpdateOutcome> {
        self.caller.take_update_outcome(op_id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeController> {
        self.state.controllers.values()
    }

    pub fn node(&self, id: &Identifier) -> Option<&NodeController> {
        self.state.controllers.get(id)
    }

    /// Number of operations still waiting for a message or a timer.
    pub fn pending_operations(&self) -> usize {
        self.caller.pending()
    }

    /// Number of relayed update chains still holding a retry budget.
    pub fn retry_chains(&self) -> usize {
        self.caller.retry_limits.len()
    }

    /// Number of level slots held by structural operations.
    pub fn busy_slots(&self) -> usize {
        self.state.busy.len()
    }

    /// Demultiplexes one inbound envelope.
    pub fn handle_envelope(&mut self, envelope: Envelope) {
        let bytes = envelope.size_bytes();
        let Envelope {
            op_id,
            from,
            to,
            body,
        } = envelope;
        {
            let _enter = self.state.span.enter();
            tracing::trace!("received operation {} from peer {} for {}", op_id, from.short(), to);
        }

        let request = match body {
            Body::Reply(reply) => {
                self.caller.on_reply(&mut self.state, op_id, reply);
                return;
            }
            Body::Request(request) => request,
        };

        match to {
            Destination::Peer(_) => {
                self.responder
                    .execute_peer_request(&mut self.state, &mut self.caller, op_id, request);
            }
            Destination::Node(node) => {
                if !self.ensure_controller(&node) {
                    {
                        let _enter = self.state.span.enter();
                        tracing::warn!("no node {} here for {}", node.short(), request.kind());
                    }
                    if request.expects_reply() {
                        self.state
                            .reply(None, op_id, Reply::Nack(NackReason::UnknownNode));
                    }
                    return;
                }
                if let Some(controller) = self.state.controllers.get_mut(&node) {
                    controller.record_received(bytes);
                }
                self.responder.execute_node_request(
                    &mut self.state,
                    &mut self.caller,
                    node,
                    op_id,
                    request,
                );
            }
        }
    }

    /// Looks the node up in the substrate when no local controller exists yet.
    fn ensure_controller(&mut self, node: &Identifier) -> bool {
        if self.state.controllers.contains_key(node) {
            return true;
        }
        if !self.state.substrate.is_root_of(node) {
            return false;
        }
        match self.state.substrate.lookup(node) {
            Some(record) => {
                let controller =
                    NodeController::new(&self.state.span, self.state.config.clone(), record);
                self.state.controllers.insert(*node, controller);
                let _enter = self.state.span.enter();
                tracing::info!("rehydrated node {} from its record", node.short());
                true
            }
            None => false,
        }
    }

    pub fn handle_timer(&mut self, event: TimerEvent) {
        match event {
            TimerEvent::Periodic(task) => self.caller.on_periodic(&mut self.state, task),
            other => self.caller.on_timer(&mut self.state, other),
        }
    }
}

impl Debug for Peer {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.state.id)
            .field("nodes", &self.state.controllers.len())
            .field("pending", &self.caller.pending())
            .finish()
    }
}
