use crate::core::model::time::Timestamp;
use crate::core::Identifier;
use crate::network::{PeriodicTask, TimerEvent};
use crate::protocol::Envelope;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Duration;

/// Something that happens to a peer at a simulated instant.
#[derive(Clone, Debug)]
pub enum SimEvent {
    /// An envelope arrives; node destinations are resolved at this point.
    Deliver(Envelope),
    /// A one-shot timer of `peer` fires.
    Timer { peer: Identifier, event: TimerEvent },
    /// A periodic task of `peer` is due; it is scheduled again after `interval`.
    Periodic {
        peer: Identifier,
        task: PeriodicTask,
        interval: Duration,
    },
}

impl SimEvent {
    pub fn is_periodic(&self) -> bool {
        matches!(self, SimEvent::Periodic { .. })
    }
}

#[derive(Debug)]
struct Scheduled {
    time: Timestamp,
    seq: u64,
    event: SimEvent,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    // reversed: BinaryHeap is a max-heap and the earliest event must come out first
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .time
            .cmp(&self.time)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// EventQueue orders simulated events by time, then by the order they were pushed.
#[derive(Debug, Default)]
pub struct EventQueue {
    heap: BinaryHeap<Scheduled>,
    now: Timestamp,
    seq: u64,
    /// Events in the heap that are not periodic.
    transient: usize,
}

impl EventQueue {
    pub fn new() -> EventQueue {
        EventQueue::default()
    }

    pub fn now(&self) -> Timestamp {
        self.now
    }

    /// Schedules `event` `delay` after the current instant.
    pub fn push_after(&mut self, delay: Duration, event: SimEvent) {
        let time = self.now + delay;
        self.push_at(time, event);
    }

    pub fn push_at(&mut self, time: Timestamp, event: SimEvent) {
        self.seq += 1;
        if !event.is_periodic() {
            self.transient += 1;
        }
        self.heap.push(Scheduled {
            time: time.max(self.now),
            seq: self.seq,
            event,
        });
    }

    /// Removes the earliest event due no later than `deadline` and moves the clock to it.
    pub fn pop_until(&mut self, deadline: Timestamp) -> Option<SimEvent> {
        if self.heap.peek()?.time > deadline {
            return None;
        }
        let scheduled = self.heap.pop()?;
        self.now = scheduled.time;
        if !scheduled.event.is_periodic() {
            self.transient -= 1;
        }
        Some(scheduled.event)
    }

    /// Moves the clock forward to `time` if it is later.
    pub fn advance_to(&mut self, time: Timestamp) {
        self.now = self.now.max(time);
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// True when only periodic events are left.
    pub fn is_quiet(&self) -> bool {
        self.transient == 0
    }
}
