//! Runs every peer as a tokio task fed by an unbounded channel. Timers are tokio sleeps that
//! post back into the channel of the peer that scheduled them.

mod context;

pub use context::RuntimeContext;

use crate::core::config::Config;
use crate::core::element::UpdateBatch;
use crate::core::model::time::Timestamp;
use crate::core::Identifier;
use crate::network::sim::MemorySubstrate;
use crate::network::{Clock, PeriodicTask, TimerEvent, Transport};
use crate::protocol::{Destination, Envelope, OperationId, Peer, SearchOutcome, SearchQuery, UpdateOutcome};
use anyhow::{anyhow, Context};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{Level, Span};

type Inspection = Box<dyn FnOnce(&Peer) + Send>;

/// Everything a peer task reacts to.
enum Input {
    Envelope(Envelope),
    Timer(TimerEvent),
    Bootstrap(oneshot::Sender<anyhow::Result<Identifier>>),
    Search(SearchQuery, oneshot::Sender<SearchOutcome>),
    Update(UpdateBatch, oneshot::Sender<UpdateOutcome>),
    Inspect(Inspection),
}

type Routes = Arc<RwLock<HashMap<Identifier, mpsc::UnboundedSender<Input>>>>;

struct RuntimeTransport {
    local: Identifier,
    routes: Routes,
    substrate: MemorySubstrate,
    latency: Duration,
}

impl Transport for RuntimeTransport {
    fn send(&self, envelope: Envelope) -> anyhow::Result<()> {
        let target = match &envelope.to {
            Destination::Peer(peer) => Some(*peer),
            Destination::Node(node) => self.substrate.root_of(node),
        }
        .ok_or_else(|| anyhow!("peer {} cannot resolve {}", self.local.short(), envelope.to))?;
        let input = self
            .routes
            .read()
            .get(&target)
            .cloned()
            .ok_or_else(|| anyhow!("no route to peer {}", target.short()))?;
        if self.latency.is_zero() {
            return input
                .send(Input::Envelope(envelope))
                .map_err(|_| anyhow!("peer {} stopped", target.short()));
        }
        let latency = self.latency;
        tokio::spawn(async move {
            tokio::time::sleep(latency).await;
            // a peer stopped in the meantime loses the envelope like a real network would
            let _ = input.send(Input::Envelope(envelope));
        });
        Ok(())
    }
}

struct RuntimeClock {
    started: Instant,
    input: mpsc::UnboundedSender<Input>,
    context: RuntimeContext,
}

impl Clock for RuntimeClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_millis(self.started.elapsed().as_millis() as u64)
    }

    fn schedule_after(&self, delay: Duration, event: TimerEvent) {
        let input = self.input.clone();
        let context = self.context.clone();
        tokio::spawn(async move {
            let slept = context
                .run(async {
                    tokio::time::sleep(delay).await;
                    Ok(())
                })
                .await;
            if slept.is_ok() {
                let _ = input.send(Input::Timer(event));
            }
        });
    }

    fn schedule_periodic(&self, interval: Duration, task: PeriodicTask) {
        let input = self.input.clone();
        let context = self.context.clone();
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = ticks.tick() => {
                        if input.send(Input::Timer(TimerEvent::Periodic(task))).is_err() {
                            break;
                        }
                    }
                    _ = context.cancelled() => break,
                }
            }
        });
    }
}

struct PeerHandle {
    input: mpsc::UnboundedSender<Input>,
    context: RuntimeContext,
    task: JoinHandle<()>,
}

/// RuntimeHub hosts peers on the current tokio runtime over an in-memory substrate.
pub struct RuntimeHub {
    config: Arc<Config>,
    substrate: MemorySubstrate,
    routes: Routes,
    peers: HashMap<Identifier, PeerHandle>,
    started: Instant,
    context: RuntimeContext,
    span: Span,
}

impl RuntimeHub {
    pub fn new(parent_span: &Span, config: Config) -> anyhow::Result<RuntimeHub> {
        config.validate().context("invalid runtime config")?;
        let span = tracing::span!(parent: parent_span, Level::INFO, "runtime");
        let context = RuntimeContext::new(&span, "runtime_hub");
        Ok(RuntimeHub {
            config: Arc::new(config),
            substrate: MemorySubstrate::new(),
            routes: Arc::new(RwLock::new(HashMap::new())),
            peers: HashMap::new(),
            started: Instant::now(),
            context,
            span,
        })
    }

    pub fn substrate(&self) -> &MemorySubstrate {
        &self.substrate
    }

    /// Spawns a peer under a random identifier. Must be called within a tokio runtime.
    pub fn add_peer(&mut self) -> anyhow::Result<Identifier> {
        let id = Identifier::random(&mut rand::rng());
        self.add_peer_with_id(id)
    }

    pub fn add_peer_with_id(&mut self, id: Identifier) -> anyhow::Result<Identifier> {
        if self.peers.contains_key(&id) {
            return Err(anyhow!("peer {} already exists", id));
        }
        let (input, inputs) = mpsc::unbounded_channel();
        let context = self.context.child(&id.short());
        let transport = RuntimeTransport {
            local: id,
            routes: self.routes.clone(),
            substrate: self.substrate.clone(),
            latency: self.config.message_latency,
        };
        let clock = RuntimeClock {
            started: self.started,
            input: input.clone(),
            context: context.clone(),
        };
        let peer = Peer::new(
            &self.span,
            id,
            self.config.clone(),
            Box::new(transport),
            Arc::new(self.substrate.view(id)),
            Box::new(clock),
        );
        self.routes.write().insert(id, input.clone());
        self.substrate.join(id);
        let task = tokio::spawn(run_peer(peer, inputs, context.clone()));
        self.peers.insert(
            id,
            PeerHandle {
                input,
                context,
                task,
            },
        );
        let _enter = self.span.enter();
        tracing::debug!("spawned peer {}", id.short());
        Ok(id)
    }

    /// Stops a peer and takes it out of the substrate. Its records stay behind.
    pub async fn stop_peer(&mut self, id: &Identifier) -> anyhow::Result<()> {
        let handle = self.peers.remove(id).ok_or_else(|| anyhow!("no peer {}", id))?;
        self.routes.write().remove(id);
        self.substrate.leave(id);
        handle.context.cancel();
        handle
            .task
            .await
            .with_context(|| format!("task of peer {} failed", id.short()))
    }

    pub async fn bootstrap(&self, peer: &Identifier) -> anyhow::Result<Identifier> {
        let (reply, outcome) = oneshot::channel();
        self.submit(peer, Input::Bootstrap(reply))?;
        self.await_reply(outcome).await?
    }

    pub async fn search(&self, peer: &Identifier, query: SearchQuery) -> anyhow::Result<SearchOutcome> {
        let (reply, outcome) = oneshot::channel();
        self.submit(peer, Input::Search(query, reply))?;
        self.await_reply(outcome).await
    }

    pub async fn update(&self, peer: &Identifier, batch: UpdateBatch) -> anyhow::Result<UpdateOutcome> {
        let (reply, outcome) = oneshot::channel();
        self.submit(peer, Input::Update(batch, reply))?;
        self.await_reply(outcome).await
    }

    /// Evaluates `f` on the task of `peer`, between two inputs.
    pub async fn inspect<T, F>(&self, peer: &Identifier, f: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Peer) -> T + Send + 'static,
    {
        let (reply, outcome) = oneshot::channel();
        let inspection: Inspection = Box::new(move |peer| {
            let _ = reply.send(f(peer));
        });
        self.submit(peer, Input::Inspect(inspection))?;
        self.await_reply(outcome).await
    }

    /// Cancels every peer task and waits for them to finish.
    pub async fn shutdown(mut self) {
        self.context.cancel();
        for (id, handle) in self.peers.drain() {
            if let Err(e) = handle.task.await {
                let _enter = self.span.enter();
                tracing::warn!("task of peer {} failed: {}", id.short(), e);
            }
        }
    }

    fn submit(&self, peer: &Identifier, input: Input) -> anyhow::Result<()> {
        self.peers
            .get(peer)
            .ok_or_else(|| anyhow!("no peer {}", peer))?
            .input
            .send(input)
            .map_err(|_| anyhow!("peer {} stopped", peer.short()))
    }

    async fn await_reply<T>(&self, outcome: oneshot::Receiver<T>) -> anyhow::Result<T> {
        self.context
            .run(async { outcome.await.map_err(|_| anyhow!("peer dropped the request")) })
            .await
    }
}

/// The event loop of one peer. Outcomes are handed to their waiters as soon as they exist.
async fn run_peer(mut peer: Peer, mut inputs: mpsc::UnboundedReceiver<Input>, context: RuntimeContext) {
    let mut searches: HashMap<OperationId, oneshot::Sender<SearchOutcome>> = HashMap::new();
    let mut updates: HashMap<OperationId, oneshot::Sender<UpdateOutcome>> = HashMap::new();
    peer.start();
    loop {
        let input = tokio::select! {
            input = inputs.recv() => match input {
                Some(input) => input,
                None => break,
            },
            _ = context.cancelled() => break,
        };
        match input {
            Input::Envelope(envelope) => peer.handle_envelope(envelope),
            Input::Timer(event) => peer.handle_timer(event),
            Input::Bootstrap(reply) => {
                let _ = reply.send(peer.bootstrap());
            }
            Input::Search(query, reply) => {
                let op_id = peer.search(query);
                searches.insert(op_id, reply);
            }
            Input::Update(batch, reply) => {
                let op_id = peer.update(batch);
                updates.insert(op_id, reply);
            }
            Input::Inspect(inspection) => inspection(&peer),
        }

        let finished: Vec<OperationId> = searches.keys().copied().collect();
        for op_id in finished {
            if let Some(outcome) = peer.take_search_outcome(&op_id) {
                if let Some(reply) = searches.remove(&op_id) {
                    let _ = reply.send(outcome);
                }
            }
        }
        let finished: Vec<OperationId> = updates.keys().copied().collect();
        for op_id in finished {
            if let Some(outcome) = peer.take_update_outcome(&op_id) {
                if let Some(reply) = updates.remove(&op_id) {
                    let _ = reply.send(outcome);
                }
            }
        }
    }
    let _enter = peer.state().span().enter();
    tracing::debug!("peer task stopped");
}
