//! Pending-transmit timers.
//!
//! Every forwarding decision is indirected through a short randomized timer
//! so duplicate receptions collapse into a single transmission. Timers are
//! keyed (ACK and ADVERTISE by flow, DATA by frame fingerprint) and the
//! frame a timer will transmit lives in a per-kind table on the service,
//! re-looked-up at fire time. Evicting the table entry before the timer
//! fires is the cancellation path: a popped key with no payload is a no-op.
//!
//! Rescheduling a key replaces its deadline; the superseded heap entry is
//! ignored when popped (its generation no longer matches). Ties on the same
//! deadline fire in insertion order.

use crate::types::{GroupId, GroupKey, HashValue};
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use tokio::time::Instant;

/// Identity of one pending transmission.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerKey {
    /// Periodic ADVERTISE emission for a group this node sources.
    Announce(GroupId),
    Ack(GroupKey),
    Advertise(GroupKey),
    Data(HashValue),
}

struct Entry {
    deadline: Instant,
    order: u64,
    key: TimerKey,
    gen: u64,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.order == other.order
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.deadline, self.order).cmp(&(other.deadline, other.order))
    }
}

/// Deadline queue over [`TimerKey`]s with replace and cancel.
#[derive(Default)]
pub struct TimerWheel {
    heap: BinaryHeap<Reverse<Entry>>,
    live: HashMap<TimerKey, u64>,
    next_gen: u64,
}

impl TimerWheel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm (or re-arm) a timer. An existing deadline for the same key is
    /// superseded.
    pub fn schedule(&mut self, key: TimerKey, deadline: Instant) {
        self.next_gen += 1;
        let gen = self.next_gen;
        self.live.insert(key, gen);
        self.heap.push(Reverse(Entry {
            deadline,
            order: gen,
            key,
            gen,
        }));
    }

    pub fn cancel(&mut self, key: &TimerKey) {
        self.live.remove(key);
    }

    /// Earliest live deadline, if any.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.drop_stale();
        self.heap.peek().map(|Reverse(entry)| entry.deadline)
    }

    /// Pop the next live key whose deadline has passed.
    pub fn pop_due(&mut self, now: Instant) -> Option<TimerKey> {
        self.drop_stale();
        let Reverse(entry) = self.heap.peek()?;
        if entry.deadline > now {
            return None;
        }
        let Reverse(entry) = self.heap.pop().expect("peeked entry");
        self.live.remove(&entry.key);
        Some(entry.key)
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.live.clear();
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Discard heap entries whose key was cancelled or rescheduled.
    fn drop_stale(&mut self) {
        while let Some(Reverse(entry)) = self.heap.peek() {
            if self.live.get(&entry.key) == Some(&entry.gen) {
                break;
            }
            self.heap.pop();
        }
    }
}
