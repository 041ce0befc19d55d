
use crate::core::config::Config;
use crate::core::element::{ElementBuffer, ElementTable, UpdateBatch};
use crate::core::model::contact::SkipgraphContact;
use crate::core::model::direction::Direction;
use crate::core::model::element::Element;
use crate::core::model::peer_contact::PeerContact;
use crate::core::model::replacement::Replacement;
use crate::core::model::time::Timestamp;
use crate::core::model::value::Value;
use crate::core::node::SkipgraphNode;
use crate::core::Identifier;
use crate::network::Substrate;
use anyhow::{anyhow, Context};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use tracing::{Level, Span};

/// What a node should do about its size after a change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThresholdAction {
    /// The table holds more than `max_table_size` elements.
    Split,
    /// The table holds fewer than `min_table_size` elements.
    Leave,
}

/// UpdatePlan is the outcome of routing one update batch through a node.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UpdatePlan {
    /// The batch held malformed elements and was dropped as a whole.
    pub rejected: bool,
    /// The node is locked; the batch waits in the buffer.
    pub buffered: bool,
    /// Elements applied to the local table.
    pub applied: usize,
    /// Sub-batches to forward, one per destination.
    pub forwards: Vec<(SkipgraphContact, UpdateBatch)>,
    /// Elements no known node is responsible for.
    pub unroutable: usize,
}

impl UpdatePlan {
    /// True when nothing of the batch was lost.
    pub fn is_accepted(&self) -> bool {
        !self.rejected && self.unroutable == 0
    }
}

/// Sent and received message counts and byte totals of one node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MessageCounters {
    pub sent: u64,
    pub sent_bytes: u64,
    pub received: u64,
    pub received_bytes: u64,
}

/// NodeController owns one skip graph node and is the only writer of its state.
///
/// A locked node keeps answering searches but buffers every update until it is unlocked.
/// A disabled node has handed its elements away; updates reaching it are forwarded, never applied.
/// `lock`, `disable` and `terminate` form the one-way path of a leaving node.
pub struct NodeController {
    node: SkipgraphNode,
    config: Arc<Config>,
    locked: bool,
    terminated: bool,
    buffer: ElementBuffer,
    deprecated: HashSet<Identifier>,
    counters: MessageCounters,
    counters_by_kind: HashMap<&'static str, u64>,
    span: Span,
}

impl NodeController {
    pub fn new(parent_span: &Span, config: Arc<Config>, node: SkipgraphNode) -> NodeController {
        let span = tracing::span!(parent: parent_span, Level::INFO, "node_controller", node = %node.id().short());
        NodeController {
            node,
            config,
            locked: false,
            terminated: false,
            buffer: ElementBuffer::new(),
            deprecated: HashSet::new(),
            counters: MessageCounters::default(),
            counters_by_kind: HashMap::new(),
            span,
        }
    }

    pub fn id(&self) -> &Identifier {
        self.node.id()
    }

    pub fn node(&self) -> &SkipgraphNode {
        &self.node
    }

    pub fn contact(&self) -> SkipgraphContact {
        self.node.contact()
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn is_disabled(&self) -> bool {
        self.node.is_disabled()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn size(&self) -> usize {
        self.node.size()
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Suspends structural changes of the element table. Fails when the node is already locked
    /// or leaving.
    pub fn lock(&mut self) -> bool {
        if self.locked || self.is_disabled() {
            return false;
        }
        self.locked = true;
        let _enter = self.span.enter();
        tracing::debug!("locked");
        true
    }

    /// Lifts the lock, installing `table` when given, and returns the buffered batches for
    /// replay, oldest first.
    pub fn unlock(&mut self, table: Option<ElementTable>) -> Vec<UpdateBatch> {
        if let Some(table) = table {
            self.node.set_element_table(table);
        }
        self.locked = false;
        let replay = self.buffer.drain();
        let _enter = self.span.enter();
        tracing::debug!(
            "unlocked with range {}, replaying {} batches",
            self.node.range(),
            replay.len()
        );
        replay
    }

    /// Gives up the element table for good; the node only forwards from now on.
    /// The buffered batches are returned so they can be forwarded as well.
    pub fn disable(&mut self) -> anyhow::Result<Vec<UpdateBatch>> {
        if !self.locked {
            return Err(anyhow!("node {} must be locked before it is disabled", self.id()));
        }
        self.node
            .take_element_table()
            .ok_or_else(|| anyhow!("node {} is already disabled", self.id()))?;
        let _enter = self.span.enter();
        tracing::info!("disabled");
        Ok(self.buffer.drain())
    }

    /// Ends the life of a disabled node.
    pub fn terminate(&mut self) -> anyhow::Result<()> {
        if !self.is_disabled() {
            return Err(anyhow!("node {} must be disabled before it terminates", self.id()));
        }
        self.terminated = true;
        let _enter = self.span.enter();
        tracing::info!("terminated");
        Ok(())
    }

    /// Routes one update batch.
    ///
    /// Every element goes to the known contact whose range starts at the greatest value not
    /// above the element's value, or to the lowest contact when there is none. Elements routed
    /// to this node are applied; the others become forwarding sub-batches.
    pub fn update(&mut self, batch: UpdateBatch) -> UpdatePlan {
        let span = self.span.clone();
        let _enter = span.enter();
        let mut plan = UpdatePlan::default();

        if self.config.validate_elements && !batch.is_well_formed() {
            tracing::warn!("rejected malformed batch of {} elements", batch.len());
            plan.rejected = true;
            return plan;
        }
        if batch.is_empty() {
            return plan;
        }

        if self.is_disabled() {
            let successor = self
                .node
                .contact_table()
                .neighbor(0, Direction::Next)
                .or_else(|| self.node.contact_table().neighbor(0, Direction::Prev))
                .cloned();
            match successor {
                Some(contact) => {
                    tracing::trace!("disabled, forwarding {} elements to {}", batch.len(), contact);
                    plan.forwards.push((contact, batch));
                }
                None => plan.unroutable = batch.len(),
            }
            return plan;
        }

        if self.locked {
            tracing::trace!("locked, buffering {} elements", batch.len());
            self.buffer.push(batch);
            plan.buffered = true;
            return plan;
        }

        let map = self.node.contact_table().get_contact_range_map();
        let range = self.node.range();
        let mut local = UpdateBatch::default();
        let mut remote: Vec<(SkipgraphContact, UpdateBatch)> = Vec::new();

        let route = |element: &Element| -> Option<SkipgraphContact> {
            if range.contains(element.value()) {
                return Some(self.node.contact());
            }
            let target = map
                .range(..=Some(element.value().clone()))
                .next_back()
                .or_else(|| map.iter().next())
                .map(|(_, c)| c.clone())?;
            if !target.is(self.node.id()) {
                return Some(target);
            }
            // the map points here, but the value lies outside the current range
            let direction = if range.starts_at_or_before(element.value()) {
                Direction::Next
            } else {
                Direction::Prev
            };
            self.node.contact_table().neighbor(0, direction).cloned()
        };

        for (element, is_input) in batch
            .inputs
            .into_iter()
            .map(|e| (e, true))
            .chain(batch.deletes.into_iter().map(|e| (e, false)))
        {
            match route(&element) {
                None => plan.unroutable += 1,
                Some(target) if target.is(self.node.id()) => {
                    if is_input {
                        local.inputs.push(element);
                    } else {
                        local.deletes.push(element);
                    }
                }
                Some(target) => {
                    let slot = match remote.iter().position(|(c, _)| c.is(target.node_id())) {
                        Some(index) => index,
                        None => {
                            remote.push((target, UpdateBatch::default()));
                            remote.len() - 1
                        }
                    };
                    if is_input {
                        remote[slot].1.inputs.push(element);
                    } else {
                        remote[slot].1.deletes.push(element);
                    }
                }
            }
        }

        plan.applied = self.apply_local(local);
        plan.forwards = remote;
        if plan.unroutable > 0 {
            tracing::warn!("{} elements have no responsible node", plan.unroutable);
        }
        plan
    }

    /// Applies a batch routed to this node. In the churn scenario removing a missing element
    /// counts as applied, since its expiry may already have purged it.
    fn apply_local(&mut self, batch: UpdateBatch) -> usize {
        let churn = self.config.churn;
        let Some(table) = self.node.element_table_mut() else {
            return 0;
        };
        let added = table.add_all(batch.inputs);
        let removed = if churn {
            table.remove_all(batch.deletes.iter());
            batch.deletes.len()
        } else {
            table.remove_all(batch.deletes.iter())
        };
        tracing::trace!("applied {} inputs and {} deletes", added, removed);
        added + removed
    }

    /// Checks the size thresholds. Locked and disabled nodes never act, and a node without a
    /// level 0 neighbor has nobody to leave to.
    pub fn check_thresholds(&self) -> Option<ThresholdAction> {
        if self.locked || self.is_disabled() {
            return None;
        }
        let size = self.size();
        if size > self.config.max_table_size {
            return Some(ThresholdAction::Split);
        }
        let has_neighbor = Direction::BOTH
            .iter()
            .any(|d| self.node.contact_table().neighbor(0, *d).is_some());
        if size < self.config.min_table_size && has_neighbor {
            return Some(ThresholdAction::Leave);
        }
        None
    }

    /// Stores the node record at the substrate. Only the root of the node's id may store it.
    pub fn persist(&self, substrate: &dyn Substrate) -> anyhow::Result<()> {
        if !substrate.is_root_of(self.id()) {
            let _enter = self.span.enter();
            tracing::error!("refusing to persist: local peer is not root of the node id");
            return Err(anyhow!("local peer is not root of node {}", self.id()));
        }
        substrate
            .store(self.id(), self.node.clone())
            .with_context(|| format!("failed to persist node {}", self.id()))
    }

    /// Drops elements not confirmed within the purge window. Only meaningful under churn.
    pub fn purge(&mut self, now: Timestamp) -> usize {
        if !self.config.churn || self.locked {
            return 0;
        }
        let window = self.config.purge_window();
        let purged = self
            .node
            .element_table_mut()
            .map_or(0, |table| table.purge(now, window));
        if purged > 0 {
            let _enter = self.span.enter();
            tracing::debug!("purged {} expired elements", purged);
        }
        purged
    }

    /// Owners of the local elements matching a query part.
    pub fn search_local(
        &self,
        dimension: &str,
        start: Option<&Value>,
        end: Option<&Value>,
        limit: usize,
        exclude_end: bool,
    ) -> Vec<PeerContact> {
        match self.node.element_table() {
            Some(table) => table.get_contacts(dimension, start, end, limit, exclude_end),
            None => Vec::new(),
        }
    }

    /// A copy of the element table for operations that hand parts of it away.
    pub fn element_table(&self) -> Option<&ElementTable> {
        self.node.element_table()
    }

    pub fn deprecated(&self) -> &HashSet<Identifier> {
        &self.deprecated
    }

    pub fn is_deprecated(&self, id: &Identifier) -> bool {
        self.deprecated.contains(id)
    }

    /// Records that `id` left the graph and repairs every pointer to it.
    pub fn deprecate(&mut self, id: Identifier) -> usize {
        if id == *self.id() {
            return 0;
        }
        self.deprecated.insert(id);
        self.node
            .contact_table_mut()
            .remove_deprecated_contacts(&self.deprecated)
    }

    /// Installs `contact` on `level` and `direction`. A departed node is never installed.
    pub fn install(
        &mut self,
        level: usize,
        direction: Direction,
        contact: SkipgraphContact,
    ) -> anyhow::Result<()> {
        if self.deprecated.contains(contact.node_id()) {
            return Err(anyhow!(
                "refusing to install departed node {} at {}/{}",
                contact.node_id(),
                level,
                direction
            ));
        }
        self.node.contact_table_mut().set(level, direction, contact)
    }

    pub fn self_link(&mut self, level: usize, direction: Direction) -> anyhow::Result<()> {
        self.node.contact_table_mut().self_link(level, direction)
    }

    pub fn add_default_top_level<R: Rng + ?Sized>(&mut self, rng: &mut R) -> bool {
        let prefix_optimization = self.config.prefix_optimization;
        let max_levels = self.config.max_levels;
        self.node
            .contact_table_mut()
            .add_default_top_level(rng, prefix_optimization, max_levels)
    }

    pub fn ensure_level<R: Rng + ?Sized>(&mut self, level: usize, rng: &mut R) -> anyhow::Result<()> {
        if level >= self.config.max_levels {
            return Err(anyhow!(
                "level {} exceeds the configured maximum of {}",
                level,
                self.config.max_levels
            ));
        }
        self.node.contact_table_mut().ensure_level(level, rng)
    }

    pub fn optimize_top_level_prefix(&mut self, joining: &Identifier, direction: Direction) -> bool {
        if !self.config.prefix_optimization {
            return false;
        }
        self.node
            .contact_table_mut()
            .optimize_top_level_prefix(joining, direction)
    }

    /// Drops levels beyond the configured maximum and redundant self-linked levels above `floor`.
    pub fn delete_redundant_levels(&mut self, floor: usize) -> usize {
        let max_levels = self.config.max_levels;
        self.node
            .contact_table_mut()
            .delete_redundant_levels(max_levels, floor)
    }

    /// Applies the replacements a leaving node sent; returns how many pointers changed.
    pub fn apply_replacements(
        &mut self,
        leaving: &Identifier,
        replacements: &[Replacement],
    ) -> anyhow::Result<usize> {
        self.deprecated.insert(*leaving);
        let mut applied = 0;
        for replacement in replacements {
            if self
                .node
                .contact_table_mut()
                .apply_replacement(replacement, leaving, &self.deprecated)?
            {
                applied += 1;
            }
        }
        self.node
            .contact_table_mut()
            .remove_deprecated_contacts(&self.deprecated);
        let _enter = self.span.enter();
        tracing::debug!(
            "applied {} of {} replacements from leaving node {}",
            applied,
            replacements.len(),
            leaving.short()
        );
        Ok(applied)
    }

    /// Refreshes the snapshot of a neighbor whose range moved; departed nodes are ignored.
    pub fn refresh_contact(&mut self, contact: &SkipgraphContact) -> usize {
        if self.deprecated.contains(contact.node_id()) {
            return 0;
        }
        self.node
            .contact_table_mut()
            .refresh_contact(contact, self.config.prefix_optimization)
    }

    pub fn record_sent(&mut self, kind: &'static str, bytes: usize) {
        self.counters.sent += 1;
        self.counters.sent_bytes += bytes as u64;
        *self.counters_by_kind.entry(kind).or_default() += 1;
    }

    pub fn record_received(&mut self, bytes: usize) {
        self.counters.received += 1;
        self.counters.received_bytes += bytes as u64;
    }

    pub fn counters(&self) -> MessageCounters {
        self.counters
    }

    /// Logs the counters of this node.
    pub fn report(&self) {
        let _enter = self.span.enter();
        let mut kinds: Vec<_> = self.counters_by_kind.iter().collect();
        kinds.sort();
        tracing::info!(
            size = self.size(),
            height = self.node.contact_table().height(),
            sent = self.counters.sent,
            sent_bytes = self.counters.sent_bytes,
            received = self.counters.received,
            received_bytes = self.counters.received_bytes,
            "node statistics {:?}",
            kinds
        );
    }
}

impl Debug for NodeController {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeController")
            .field("node", &self.node)
            .field("locked", &self.locked)
            .field("terminated", &self.terminated)
            .field("buffered", &self.buffer.len())
            .finish()
    }
}
