use crate::core::contact::contact_level::ContactLevel;
use crate::core::model::contact::SkipgraphContact;
use crate::core::model::direction::{Direction, LevelKey};
use crate::core::model::prefix::LevelPrefix;
use crate::core::model::range::KeyRange;
use crate::core::model::replacement::Replacement;
use crate::core::model::value::Value;
use crate::core::model::MAX_LEVELS;
use crate::core::Identifier;
use anyhow::anyhow;
use rand::Rng;
use std::collections::{BTreeMap, HashSet};
use std::fmt::{Debug, Formatter};
use tracing::{Level, Span};

/// ContactTable is the multi-level pointer structure of one skip graph node.
/// Level 0 links the node to its immediate predecessor and successor and always carries prefix bit 1.
/// Every level above carries one random prefix bit and links the node to the closest nodes
/// sharing its prefix up to that level.
///
/// Neighbors are value snapshots; a pointer holding the owner's own id means "no neighbor".
#[derive(Clone)]
pub struct ContactTable {
    owner: Identifier,
    owner_range: KeyRange,
    levels: Vec<ContactLevel>,
    span: Span,
}

impl ContactTable {
    /// Create a table of one level for `owner`, linked to `prev` and `next` when given.
    pub fn new(
        parent_span: &Span,
        owner: Identifier,
        owner_range: KeyRange,
        prev: Option<SkipgraphContact>,
        next: Option<SkipgraphContact>,
    ) -> ContactTable {
        let span = tracing::span!(parent: parent_span, Level::INFO, "contact_table", owner = %owner.short());
        let me = SkipgraphContact::new(owner, owner_range.clone(), LevelPrefix::new());
        let level0 = ContactLevel::new(
            prev.unwrap_or_else(|| me.clone()),
            next.unwrap_or_else(|| me.clone()),
            true,
        );
        ContactTable {
            owner,
            owner_range,
            levels: vec![level0],
            span,
        }
    }

    pub fn owner(&self) -> &Identifier {
        &self.owner
    }

    /// The snapshot peers should keep of the owner: its id, current range and prefix.
    pub fn self_contact(&self) -> SkipgraphContact {
        SkipgraphContact::new(self.owner, self.owner_range.clone(), self.prefix())
    }

    /// Records the range the owner is now responsible for; self-links carry it from then on.
    pub fn set_owner_range(&mut self, range: KeyRange) {
        self.owner_range = range;
        let me = self.self_contact();
        for level in self.levels.iter_mut() {
            for direction in Direction::BOTH {
                if level.points_to_self(&self.owner, direction) {
                    level.set(direction, me.clone());
                }
            }
        }
    }

    /// Number of levels, at least one.
    pub fn height(&self) -> usize {
        self.levels.len()
    }

    pub fn top_level(&self) -> usize {
        self.levels.len() - 1
    }

    pub fn levels(&self) -> &[ContactLevel] {
        &self.levels
    }

    pub fn level(&self, level: usize) -> Option<&ContactLevel> {
        self.levels.get(level)
    }

    /// The accumulated prefix of all levels.
    pub fn prefix(&self) -> LevelPrefix {
        self.levels
            .iter()
            .enumerate()
            .skip(1)
            .fold(LevelPrefix::new(), |acc, (index, level)| {
                acc.with_bit(index, level.prefix()).unwrap_or(acc)
            })
    }

    /// The pointer on `level` and `direction`.
    pub fn get(&self, level: usize, direction: Direction) -> anyhow::Result<&SkipgraphContact> {
        self.levels
            .get(level)
            .map(|l| l.get(direction))
            .ok_or_else(|| anyhow!("level {} is beyond the table height {}", level, self.height()))
    }

    /// The neighbor on `level` and `direction`, or `None` when there is none.
    pub fn neighbor(&self, level: usize, direction: Direction) -> Option<&SkipgraphContact> {
        self.levels
            .get(level)
            .map(|l| l.get(direction))
            .filter(|c| !c.is(&self.owner))
    }

    /// Installs `contact` on `level` and `direction`. Installing the owner's id self-links the slot.
    pub fn set(
        &mut self,
        level: usize,
        direction: Direction,
        contact: SkipgraphContact,
    ) -> anyhow::Result<()> {
        let height = self.height();
        let slot = self
            .levels
            .get_mut(level)
            .ok_or_else(|| anyhow!("level {} is beyond the table height {}", level, height))?;
        slot.set(direction, contact.clone());

        let _enter = self.span.enter();
        tracing::trace!(
            "updated pointer at level {} in direction {} with {}",
            level,
            direction,
            contact
        );
        Ok(())
    }

    /// Points `level` and `direction` back to the owner.
    pub fn self_link(&mut self, level: usize, direction: Direction) -> anyhow::Result<()> {
        let me = self.self_contact();
        self.set(level, direction, me)
    }

    pub fn is_self_linked(&self, level: usize) -> bool {
        self.levels
            .get(level)
            .is_some_and(|l| l.is_self_linked(&self.owner))
    }

    /// The prefix bit of `level`, if the table reaches that level.
    pub fn level_prefix(&self, level: usize) -> Option<bool> {
        self.levels.get(level).map(ContactLevel::prefix)
    }

    /// Among all levels, highest first, the predecessor whose range starts at or below `value`.
    /// Falls back to the level 0 predecessor, which is the owner itself when it has none.
    pub fn get_prev_node_for_value(&self, value: &Value) -> &SkipgraphContact {
        for level in self.levels.iter().rev() {
            let prev = level.prev();
            if prev.is(&self.owner) {
                continue;
            }
            if prev.range().starts_at_or_before(value) {
                return prev;
            }
        }
        self.levels[0].prev()
    }

    /// Among all levels, highest first, the successor whose range starts at or below `value`.
    /// Falls back to the level 0 successor, which is the owner itself when it has none.
    pub fn get_next_node_for_value(&self, value: &Value) -> &SkipgraphContact {
        for level in self.levels.iter().rev() {
            let next = level.next();
            if next.is(&self.owner) {
                continue;
            }
            if next.range().starts_at_or_before(value) {
                return next;
            }
        }
        self.levels[0].next()
    }

    /// Every known contact, the owner included, keyed by the start of its range.
    /// When two snapshots claim the same start, the one from the lower level wins, and the
    /// owner wins over everybody.
    pub fn get_contact_range_map(&self) -> BTreeMap<Option<Value>, SkipgraphContact> {
        let mut map = BTreeMap::new();
        for level in self.levels.iter().rev() {
            for contact in [level.prev(), level.next()] {
                if !contact.is(&self.owner) {
                    map.insert(contact.range().start_bound().clone(), contact.clone());
                }
            }
        }
        map.insert(self.owner_range.start_bound().clone(), self.self_contact());
        map
    }

    /// Distinct neighbors over all levels, each with every slot it occupies.
    pub fn unique_neighbors(&self) -> Vec<(SkipgraphContact, Vec<LevelKey>)> {
        let mut neighbors: Vec<(SkipgraphContact, Vec<LevelKey>)> = Vec::new();
        for (index, level) in self.levels.iter().enumerate() {
            for direction in Direction::BOTH {
                let contact = level.get(direction);
                if contact.is(&self.owner) {
                    continue;
                }
                let key = LevelKey::new(index, direction);
                match neighbors.iter_mut().find(|(c, _)| c.is(contact.node_id())) {
                    Some((_, keys)) => keys.push(key),
                    None => neighbors.push((contact.clone(), vec![key])),
                }
            }
        }
        neighbors
    }

    /// Adds a self-linked level on top. Refused, returning `false`, when the current top level is
    /// already self-linked or the table reached `max_levels`.
    ///
    /// The new prefix bit is random; with `prefix_optimization` it is chosen to differ from the bit
    /// the closest known neighbor of the current top level holds at the new depth, when known.
    pub fn add_default_top_level<R: Rng + ?Sized>(
        &mut self,
        rng: &mut R,
        prefix_optimization: bool,
        max_levels: usize,
    ) -> bool {
        if self.is_self_linked(self.top_level()) {
            return false;
        }
        if self.height() >= max_levels.min(MAX_LEVELS) {
            return false;
        }

        let depth = self.height();
        let known = if prefix_optimization {
            let top = &self.levels[self.top_level()];
            [top.prev(), top.next()]
                .into_iter()
                .filter(|c| !c.is(&self.owner))
                .find_map(|c| c.prefix().bit(depth))
        } else {
            None
        };
        let bit = match known {
            Some(neighbor_bit) => !neighbor_bit,
            None => rng.random_bool(0.5),
        };
        self.push_level(bit);
        true
    }

    /// Adds a self-linked level with `prefix` on top, regardless of the level below.
    pub fn push_level(&mut self, prefix: bool) {
        let me = self.self_contact();
        self.levels.push(ContactLevel::self_linked(&me, prefix));

        let _enter = self.span.enter();
        tracing::trace!("added level {} with prefix {}", self.top_level(), prefix as u8);
    }

    /// Adds random levels until the table reaches `level`. Used by a node asked about a level it
    /// never built.
    pub fn ensure_level<R: Rng + ?Sized>(&mut self, level: usize, rng: &mut R) -> anyhow::Result<()> {
        if level >= MAX_LEVELS {
            return Err(anyhow!("level {} exceeds the maximum of {}", level, MAX_LEVELS));
        }
        while self.height() <= level {
            self.push_level(rng.random_bool(0.5));
        }
        Ok(())
    }

    /// Draws a new prefix for a self-linked top level when `joining` already sits on the level
    /// below in `direction`: both nodes would otherwise meet again on a level the joiner cannot
    /// use. Returns whether the prefix changed.
    pub fn optimize_top_level_prefix(&mut self, joining: &Identifier, direction: Direction) -> bool {
        let top = self.top_level();
        if top == 0 || !self.is_self_linked(top) {
            return false;
        }
        if !self.levels[top - 1].get(direction).is(joining) {
            return false;
        }
        let flipped = !self.levels[top].prefix();
        let me = self.self_contact();
        self.levels[top] = ContactLevel::self_linked(&me, flipped);

        let _enter = self.span.enter();
        tracing::debug!("flipped prefix of top level {} to {}", top, flipped as u8);
        true
    }

    /// Replaces every pointer to a deprecated node on `level`; returns how many were replaced.
    /// A departed pointer takes the level's other neighbor, or the owner's self-link when that
    /// neighbor departed too.
    pub fn sanitize_level(&mut self, level: usize, deprecated: &HashSet<Identifier>) -> usize {
        let me = self.self_contact();
        let Some(slot) = self.levels.get_mut(level) else {
            return 0;
        };
        let before = slot.clone();
        let mut replaced = 0;
        for direction in Direction::BOTH {
            if !deprecated.contains(before.get(direction).node_id()) {
                continue;
            }
            let other = before.get(direction.opposite());
            let substitute = if deprecated.contains(other.node_id()) || other.is(&self.owner) {
                me.clone()
            } else {
                other.clone()
            };
            slot.set(direction, substitute);
            replaced += 1;
        }
        replaced
    }

    /// Removes every pointer to a deprecated node; returns how many were replaced.
    pub fn remove_deprecated_contacts(&mut self, deprecated: &HashSet<Identifier>) -> usize {
        if deprecated.is_empty() {
            return 0;
        }
        let replaced = (0..self.height())
            .map(|level| self.sanitize_level(level, deprecated))
            .sum();
        if replaced > 0 {
            let _enter = self.span.enter();
            tracing::debug!("replaced {} pointers to departed nodes", replaced);
        }
        replaced
    }

    /// Applies one replacement sent by `leaving`: the slot must still point to the leaving node
    /// and the level must still carry the prefix the sender saw. Installing a deprecated contact
    /// is refused and self-links the slot instead. Returns whether the slot changed.
    pub fn apply_replacement(
        &mut self,
        replacement: &Replacement,
        leaving: &Identifier,
        deprecated: &HashSet<Identifier>,
    ) -> anyhow::Result<bool> {
        let Some(level) = self.levels.get(replacement.level) else {
            return Ok(false);
        };
        if level.prefix() != replacement.level_prefix
            || !level.get(replacement.direction).is(leaving)
        {
            return Ok(false);
        }
        if deprecated.contains(replacement.contact.node_id()) {
            self.self_link(replacement.level, replacement.direction)?;
        } else {
            self.set(
                replacement.level,
                replacement.direction,
                replacement.contact.clone(),
            )?;
        }
        Ok(true)
    }

    /// Refreshes every pointer holding `contact`'s node with the new snapshot. A changed prefix
    /// alone only counts when `prefix_aware`. Returns how many pointers changed.
    pub fn refresh_contact(&mut self, contact: &SkipgraphContact, prefix_aware: bool) -> usize {
        if contact.is(&self.owner) {
            return 0;
        }
        let mut refreshed = 0;
        for level in self.levels.iter_mut() {
            for direction in level.directions_of(contact.node_id()) {
                if !level.get(direction).matches(contact, prefix_aware) {
                    level.set(direction, contact.clone());
                    refreshed += 1;
                }
            }
        }
        refreshed
    }

    /// Collapses trailing self-linked levels so at most one remains. Level 0 is never removed.
    /// Returns how many levels were deleted.
    pub fn delete_redundant_self_linked_levels(&mut self) -> usize {
        self.delete_self_linked_levels_above(0)
    }

    /// Like `delete_redundant_self_linked_levels`, but never removes `floor` or anything below it.
    pub fn delete_self_linked_levels_above(&mut self, floor: usize) -> usize {
        let mut deleted = 0;
        while self.height() > 1
            && self.top_level() > floor
            && self.is_self_linked(self.top_level())
            && self.is_self_linked(self.top_level() - 1)
        {
            self.levels.pop();
            deleted += 1;
        }
        if deleted > 0 {
            let _enter = self.span.enter();
            tracing::trace!("deleted {} redundant self-linked levels", deleted);
        }
        deleted
    }

    /// Cuts the table down to `max_levels` and collapses trailing self-linked levels above
    /// `floor`.
    pub fn delete_redundant_levels(&mut self, max_levels: usize, floor: usize) -> usize {
        let limit = max_levels.clamp(1, MAX_LEVELS);
        let mut deleted = 0;
        while self.height() > limit {
            self.levels.pop();
            deleted += 1;
        }
        deleted + self.delete_self_linked_levels_above(floor)
    }

    /// The accumulated prefix of levels `0..=level`, if the table reaches `level`.
    pub fn prefix_up_to(&self, level: usize) -> Option<LevelPrefix> {
        if level >= self.height() {
            return None;
        }
        Some(self.prefix().truncated(level + 1))
    }

    /// True when the table agrees with every level `prefix` covers.
    pub fn shares_prefix(&self, prefix: &LevelPrefix) -> bool {
        self.height() >= prefix.depth() && self.prefix().common_prefix_len(prefix) >= prefix.depth()
    }

    pub fn size_bytes(&self) -> usize {
        self.levels.iter().map(ContactLevel::size_bytes).sum::<usize>() + 4
    }
}

impl PartialEq for ContactTable {
    fn eq(&self, other: &Self) -> bool {
        self.owner == other.owner && self.levels == other.levels
    }
}

impl Debug for ContactTable {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "ContactTable {}: {{", self.owner.short())?;
        for (i, level) in self.levels.iter().enumerate() {
            writeln!(f, "Level: {i}, {level:?}")?;
        }
        write!(f, "}}")
    }
}
