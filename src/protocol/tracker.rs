use crate::protocol::OperationId;
use anyhow::anyhow;
use std::collections::HashMap;
use tracing::{Level, Span};

struct Tracked<H> {
    handler: H,
    generation: u64,
}

/// RequestTracker holds the in-flight operations of a peer, addressable by operation id.
///
/// Every registered id leaves the tracker exactly once: through `deliver`, `complete` or
/// `expire`. Messages and timers for an id that already left are dropped.
pub struct RequestTracker<H> {
    pending: HashMap<OperationId, Tracked<H>>,
    span: Span,
}

impl<H> RequestTracker<H> {
    pub fn new(parent_span: &Span) -> RequestTracker<H> {
        let span = tracing::span!(parent: parent_span, Level::INFO, "request_tracker");
        RequestTracker {
            pending: HashMap::new(),
            span,
        }
    }

    /// Starts tracking `id`; an id can be registered once.
    pub fn register(&mut self, id: OperationId, handler: H) -> anyhow::Result<()> {
        if self.pending.contains_key(&id) {
            return Err(anyhow!("operation {} is already registered", id));
        }
        self.pending.insert(
            id,
            Tracked {
                handler,
                generation: 0,
            },
        );
        let _enter = self.span.enter();
        tracing::trace!("registered operation {}", id);
        Ok(())
    }

    /// Hands the handler of `id` over for a message that finishes it.
    /// Returns `None`, logging the drop, when `id` is not tracked.
    pub fn deliver(&mut self, id: &OperationId) -> Option<H> {
        match self.pending.remove(id) {
            Some(tracked) => Some(tracked.handler),
            None => {
                let _enter = self.span.enter();
                tracing::warn!("unable to deliver message for operation {}", id);
                None
            }
        }
    }

    /// Stops tracking `id` without a message; returns its handler if it was tracked.
    pub fn complete(&mut self, id: &OperationId) -> Option<H> {
        self.pending.remove(id).map(|t| t.handler)
    }

    /// Hands the handler of `id` over for a timer of `generation`. A stale timer leaves the
    /// operation in place and returns `None`.
    pub fn expire(&mut self, id: &OperationId, generation: u64) -> Option<H> {
        match self.pending.get(id) {
            Some(tracked) if tracked.generation == generation => {
                self.pending.remove(id).map(|t| t.handler)
            }
            Some(_) => {
                let _enter = self.span.enter();
                tracing::trace!("ignoring stale timer of operation {}", id);
                None
            }
            None => None,
        }
    }

    /// Moves the deadline of `id`: the returned generation is the one a new timer must carry.
    pub fn extend(&mut self, id: &OperationId) -> Option<u64> {
        self.pending.get_mut(id).map(|tracked| {
            tracked.generation += 1;
            tracked.generation
        })
    }

    pub fn generation(&self, id: &OperationId) -> Option<u64> {
        self.pending.get(id).map(|t| t.generation)
    }

    pub fn get(&self, id: &OperationId) -> Option<&H> {
        self.pending.get(id).map(|t| &t.handler)
    }

    pub fn get_mut(&mut self, id: &OperationId) -> Option<&mut H> {
        self.pending.get_mut(id).map(|t| &mut t.handler)
    }

    pub fn contains(&self, id: &OperationId) -> bool {
        self.pending.contains_key(id)
    }

    /// Ids of the tracked operations whose handler satisfies `predicate`.
    pub fn find(&self, predicate: impl Fn(&H) -> bool) -> Vec<OperationId> {
        self.pending
            .iter()
            .filter(|(_, t)| predicate(&t.handler))
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
