pub mod runtime;
pub mod sim;

use crate::core::model::time::Timestamp;
use crate::core::{Identifier, SkipgraphNode};
use crate::protocol::{Envelope, OperationId};
use std::fmt;
use std::fmt::{Display, Formatter};
use std::time::Duration;
use unimock::unimock;

/// Transport delivers envelopes between peers. A node destination is resolved to the peer that
/// hosts the node, which is the root of the node's identifier in the substrate.
///
/// Delivery is best effort: an envelope may be lost, and the sender learns about it only through
/// the timeout of its operation. `send` fails only when the destination cannot be resolved at all.
pub trait Transport: Send {
    fn send(&self, envelope: Envelope) -> anyhow::Result<()>;
}

/// Substrate is the key-based routing layer under the skip graph. It stores the canonical record
/// of every node at the peer that is root of the node's identifier.
#[unimock(api = SubstrateMock)]
pub trait Substrate: Send + Sync {
    /// True when the local peer is authoritative for `key`.
    fn is_root_of(&self, key: &Identifier) -> bool;

    /// Stores the record of a node under `key`; only the root of `key` may store it.
    fn store(&self, key: &Identifier, node: SkipgraphNode) -> anyhow::Result<()>;

    /// Removes the record under `key`.
    fn remove(&self, key: &Identifier) -> anyhow::Result<()>;

    /// The record stored under `key`, if any.
    fn lookup(&self, key: &Identifier) -> Option<SkipgraphNode>;

    /// Every peer currently participating, the local one included.
    fn peers(&self) -> Vec<Identifier>;
}

/// Clock tells the time and schedules timer events for the local peer.
pub trait Clock: Send {
    fn now(&self) -> Timestamp;

    /// Delivers `event` to the local peer once `delay` elapsed.
    fn schedule_after(&self, delay: Duration, event: TimerEvent);

    /// Delivers `task` to the local peer every `interval`, starting one interval from now.
    fn schedule_periodic(&self, interval: Duration, task: PeriodicTask);
}

/// TimerEvent is what a clock hands back to the peer that scheduled it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerEvent {
    /// The reply budget of an operation ran out. A `generation` that no longer matches the
    /// operation means its deadline was extended and this timer is stale.
    Timeout {
        op_id: OperationId,
        generation: u64,
    },
    /// A back-off of the operation elapsed; it may try again.
    Wake { op_id: OperationId },
    Periodic(PeriodicTask),
}

/// Work every peer repeats on a fixed interval.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PeriodicTask {
    /// Every local node sends its current contact to its neighbors.
    Announce,
    /// Expired elements are dropped (churn only).
    Purge,
    /// Per-node message counters are logged.
    Stats,
}

impl Display for PeriodicTask {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            PeriodicTask::Announce => write!(f, "announce"),
            PeriodicTask::Purge => write!(f, "purge"),
            PeriodicTask::Stats => write!(f, "stats"),
        }
    }
}
