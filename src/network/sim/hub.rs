use crate::core::config::Config;
use crate::core::element::UpdateBatch;
use crate::core::model::time::Timestamp;
use crate::core::{Identifier, NodeController};
use crate::network::sim::event::{EventQueue, SimEvent};
use crate::network::sim::substrate::MemorySubstrate;
use crate::network::{Clock, PeriodicTask, TimerEvent, Transport};
use crate::protocol::{Destination, Envelope, Peer, SearchOutcome, SearchQuery, UpdateOutcome};
use anyhow::{anyhow, Context};
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{Level, Span};

/// Upper bound on events `settle` processes, so a livelock surfaces as an error.
const MAX_SETTLE_EVENTS: usize = 1_000_000;

/// Shared between the hub and the transports and clocks it hands out.
#[derive(Clone, Default)]
struct Shared {
    queue: Arc<Mutex<EventQueue>>,
    isolated: Arc<RwLock<HashSet<Identifier>>>,
}

/// SimTransport schedules the delivery of every envelope one message latency from now.
struct SimTransport {
    local: Identifier,
    shared: Shared,
    substrate: MemorySubstrate,
    latency: Duration,
}

impl Transport for SimTransport {
    fn send(&self, envelope: Envelope) -> anyhow::Result<()> {
        let resolvable = match &envelope.to {
            Destination::Peer(peer) => self.substrate.contains(peer),
            Destination::Node(node) => self.substrate.root_of(node).is_some(),
        };
        if !resolvable {
            return Err(anyhow!(
                "peer {} cannot resolve {}",
                self.local.short(),
                envelope.to
            ));
        }
        self.shared
            .queue
            .lock()
            .push_after(self.latency, SimEvent::Deliver(envelope));
        Ok(())
    }
}

/// SimClock reads the simulated time and schedules timers on the shared event queue.
struct SimClock {
    local: Identifier,
    shared: Shared,
}

impl Clock for SimClock {
    fn now(&self) -> Timestamp {
        self.shared.queue.lock().now()
    }

    fn schedule_after(&self, delay: Duration, event: TimerEvent) {
        self.shared.queue.lock().push_after(
            delay,
            SimEvent::Timer {
                peer: self.local,
                event,
            },
        );
    }

    fn schedule_periodic(&self, interval: Duration, task: PeriodicTask) {
        self.shared.queue.lock().push_after(
            interval,
            SimEvent::Periodic {
                peer: self.local,
                task,
                interval,
            },
        );
    }
}

/// SimHub runs any number of peers in one thread on simulated time. Events are processed strictly
/// in time order, so a run with the same seed and the same inputs is reproducible.
pub struct SimHub {
    config: Arc<Config>,
    shared: Shared,
    substrate: MemorySubstrate,
    peers: BTreeMap<Identifier, Peer>,
    rng: StdRng,
    span: Span,
}

impl SimHub {
    pub fn new(parent_span: &Span, config: Config, seed: u64) -> anyhow::Result<SimHub> {
        config.validate().context("invalid simulation config")?;
        Ok(SimHub {
            config: Arc::new(config),
            shared: Shared::default(),
            substrate: MemorySubstrate::new(),
            peers: BTreeMap::new(),
            rng: StdRng::seed_from_u64(seed),
            span: tracing::span!(parent: parent_span, Level::INFO, "sim"),
        })
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn substrate(&self) -> &MemorySubstrate {
        &self.substrate
    }

    pub fn now(&self) -> Timestamp {
        self.shared.queue.lock().now()
    }

    /// Adds a peer under a random identifier and starts its periodic tasks.
    pub fn add_peer(&mut self) -> anyhow::Result<Identifier> {
        let id = Identifier::random(&mut self.rng);
        self.add_peer_with_id(id)
    }

    pub fn add_peer_with_id(&mut self, id: Identifier) -> anyhow::Result<Identifier> {
        if self.peers.contains_key(&id) {
            return Err(anyhow!("peer {} already exists", id));
        }
        self.substrate.join(id);
        let transport = SimTransport {
            local: id,
            shared: self.shared.clone(),
            substrate: self.substrate.clone(),
            latency: self.config.message_latency,
        };
        let clock = SimClock {
            local: id,
            shared: self.shared.clone(),
        };
        let mut peer = Peer::new(
            &self.span,
            id,
            self.config.clone(),
            Box::new(transport),
            Arc::new(self.substrate.view(id)),
            Box::new(clock),
        );
        peer.start();
        self.peers.insert(id, peer);
        let _enter = self.span.enter();
        tracing::debug!("added peer {}", id.short());
        Ok(id)
    }

    /// Crashes a peer: its state is gone and it no longer takes part in the substrate. Records it
    /// stored stay, so its nodes come back at the next root on first contact.
    pub fn crash_peer(&mut self, id: &Identifier) -> anyhow::Result<()> {
        self.peers
            .remove(id)
            .ok_or_else(|| anyhow!("no peer {}", id))?;
        self.substrate.leave(id);
        self.shared.isolated.write().remove(id);
        let _enter = self.span.enter();
        tracing::info!("crashed peer {}", id.short());
        Ok(())
    }

    /// Drops every envelope addressed to `id` until `heal` is called. Timers still fire.
    pub fn isolate(&mut self, id: &Identifier) {
        self.shared.isolated.write().insert(*id);
    }

    pub fn heal(&mut self, id: &Identifier) {
        self.shared.isolated.write().remove(id);
    }

    pub fn peer(&self, id: &Identifier) -> Option<&Peer> {
        self.peers.get(id)
    }

    pub fn peer_mut(&mut self, id: &Identifier) -> Option<&mut Peer> {
        self.peers.get_mut(id)
    }

    pub fn peer_ids(&self) -> Vec<Identifier> {
        self.peers.keys().copied().collect()
    }

    /// Creates the first node of the graph at `peer`.
    pub fn bootstrap(&mut self, peer: &Identifier) -> anyhow::Result<Identifier> {
        self.peers
            .get_mut(peer)
            .ok_or_else(|| anyhow!("no peer {}", peer))?
            .bootstrap()
    }

    /// Every node hosted by any peer.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeController> {
        self.peers.values().flat_map(|peer| peer.nodes())
    }

    /// The controller of `node`, wherever it lives.
    pub fn node(&self, node: &Identifier) -> Option<&NodeController> {
        self.peers.values().find_map(|peer| peer.node(node))
    }

    pub fn pending_operations(&self) -> usize {
        self.peers.values().map(|peer| peer.pending_operations()).sum()
    }

    pub fn busy_slots(&self) -> usize {
        self.peers.values().map(|peer| peer.busy_slots()).sum()
    }

    /// Runs a range query from `peer` until it has an outcome.
    pub fn search(&mut self, peer: &Identifier, query: SearchQuery) -> anyhow::Result<SearchOutcome> {
        let op_id = self
            .peers
            .get_mut(peer)
            .ok_or_else(|| anyhow!("no peer {}", peer))?
            .search(query);
        self.run_until_outcome(peer, |p| p.take_search_outcome(&op_id))
            .with_context(|| format!("search {} did not finish", op_id))
    }

    /// Submits `batch` at `peer` and runs until the update has an outcome.
    pub fn update(&mut self, peer: &Identifier, batch: UpdateBatch) -> anyhow::Result<UpdateOutcome> {
        let op_id = self
            .peers
            .get_mut(peer)
            .ok_or_else(|| anyhow!("no peer {}", peer))?
            .update(batch);
        self.run_until_outcome(peer, |p| p.take_update_outcome(&op_id))
            .with_context(|| format!("update {} did not finish", op_id))
    }

    fn run_until_outcome<T>(
        &mut self,
        peer: &Identifier,
        mut take: impl FnMut(&mut Peer) -> Option<T>,
    ) -> anyhow::Result<T> {
        // an operation resolves within its own timeout plus every retry it may spend
        let budget = self.config.service_timeout * (self.config.max_update_retries as u32 + 2);
        let deadline = self.now() + budget;
        loop {
            let target = self
                .peers
                .get_mut(peer)
                .ok_or_else(|| anyhow!("peer {} is gone", peer))?;
            if let Some(outcome) = take(target) {
                return Ok(outcome);
            }
            if !self.step(deadline) {
                return Err(anyhow!("no outcome by {}", deadline));
            }
        }
    }

    /// Processes the next event due by `deadline`. Returns false when there is none.
    pub fn step(&mut self, deadline: Timestamp) -> bool {
        let next = self.shared.queue.lock().pop_until(deadline);
        match next {
            Some(event) => {
                self.dispatch(event);
                true
            }
            None => false,
        }
    }

    /// Processes every event due by `deadline` and moves the clock there.
    pub fn run_until(&mut self, deadline: Timestamp) -> usize {
        let mut processed = 0;
        while self.step(deadline) {
            processed += 1;
        }
        self.shared.queue.lock().advance_to(deadline);
        processed
    }

    pub fn run_for(&mut self, duration: Duration) -> usize {
        let deadline = self.now() + duration;
        self.run_until(deadline)
    }

    /// Processes events until only periodic ones are left, so every message and timer in flight
    /// has been handled.
    pub fn settle(&mut self) -> anyhow::Result<usize> {
        let mut processed = 0;
        while !self.shared.queue.lock().is_quiet() {
            if processed >= MAX_SETTLE_EVENTS {
                return Err(anyhow!("no quiescence after {} events", processed));
            }
            self.step(Timestamp::from_millis(u64::MAX));
            processed += 1;
        }
        let _enter = self.span.enter();
        tracing::debug!("settled after {} events at {}", processed, self.now());
        Ok(processed)
    }

    fn dispatch(&mut self, event: SimEvent) {
        match event {
            SimEvent::Deliver(envelope) => {
                let target = match &envelope.to {
                    Destination::Peer(peer) => Some(*peer),
                    Destination::Node(node) => self.substrate.root_of(node),
                };
                let Some(target) = target else {
                    return;
                };
                if self.shared.isolated.read().contains(&target) {
                    let _enter = self.span.enter();
                    tracing::trace!("dropped {} for isolated peer {}", envelope.kind(), target.short());
                    return;
                }
                match self.peers.get_mut(&target) {
                    Some(peer) => peer.handle_envelope(envelope),
                    None => {
                        let _enter = self.span.enter();
                        tracing::trace!("dropped {} for missing peer {}", envelope.kind(), target.short());
                    }
                }
            }
            SimEvent::Timer { peer, event } => {
                if let Some(peer) = self.peers.get_mut(&peer) {
                    peer.handle_timer(event);
                }
            }
            SimEvent::Periodic {
                peer,
                task,
                interval,
            } => {
                let Some(target) = self.peers.get_mut(&peer) else {
                    return;
                };
                target.handle_timer(TimerEvent::Periodic(task));
                self.shared.queue.lock().push_after(
                    interval,
                    SimEvent::Periodic {
                        peer,
                        task,
                        interval,
                    },
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testutil::fixtures::span_fixture;

    fn hub() -> SimHub {
        SimHub::new(&span_fixture(), Config::default(), 7).unwrap()
    }

    #[test]
    fn test_bootstrap_stores_record_at_root() {
        let mut hub = hub();
        let peer = hub.add_peer().unwrap();
        let node = hub.bootstrap(&peer).unwrap();

        assert_eq!(hub.substrate().root_of(&node), Some(peer));
        assert!(hub.substrate().record(&node).is_some());
        assert_eq!(hub.nodes().count(), 1);
    }

    #[test]
    fn test_duplicate_peer_rejected() {
        let mut hub = hub();
        let peer = hub.add_peer().unwrap();
        assert!(hub.add_peer_with_id(peer).is_err());
    }

    #[test]
    fn test_run_for_moves_clock() {
        let mut hub = hub();
        hub.add_peer().unwrap();
        let interval = hub.config().announce_interval;

        let processed = hub.run_for(interval);
        assert!(processed >= 1);
        assert_eq!(hub.now(), Timestamp::ZERO + interval);
        // periodic tasks alone never keep the hub from settling
        assert_eq!(hub.settle().unwrap(), 0);
    }

    #[test]
    fn test_crash_removes_peer_from_substrate() {
        let mut hub = hub();
        let a = hub.add_peer().unwrap();
        let b = hub.add_peer().unwrap();
        hub.crash_peer(&a).unwrap();

        assert!(hub.peer(&a).is_none());
        assert!(!hub.substrate().contains(&a));
        assert_eq!(hub.peer_ids(), vec![b]);
        assert!(hub.crash_peer(&a).is_err());
    }
}
