//! Timer queue for the dispatcher's scheduling domain.
//!
//! Holds call timeouts and deferred tasks ordered by deadline. Entries with
//! equal deadlines fire in the order they were scheduled.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::fmt;
use sysbus_types::Token;
use tokio::time::Instant;

/// Deferred unit of work run on the dispatcher.
pub(crate) type Task = Box<dyn FnOnce() + Send>;

/// What happens when a timer fires.
pub(crate) enum TimerEvent {
    /// Response window of a pending call elapsed.
    CallTimeout { token: Token, generation: u64 },
    /// Deferred task.
    Task(Task),
}

impl fmt::Debug for TimerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerEvent::CallTimeout { token, generation } => f
                .debug_struct("CallTimeout")
                .field("token", token)
                .field("generation", generation)
                .finish(),
            TimerEvent::Task(_) => f.write_str("Task"),
        }
    }
}

struct Entry {
    deadline: Instant,
    seq: u64,
    event: TimerEvent,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
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
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

#[derive(Default)]
pub(crate) struct TimerQueue {
    heap: BinaryHeap<Reverse<Entry>>,
    next_seq: u64,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn schedule(&mut self, deadline: Instant, event: TimerEvent) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(Entry {
            deadline,
            seq,
            event,
        }));
    }

    /// Earliest pending deadline.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(entry)| entry.deadline)
    }

    /// Pop the earliest entry if it is due at `now`.
    pub(crate) fn pop_due(&mut self, now: Instant) -> Option<TimerEvent> {
        if self.next_deadline()? > now {
            return None;
        }
        self.heap.pop().map(|Reverse(entry)| entry.event)
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }

    pub(crate) fn clear(&mut self) {
        self.heap.clear();
    }
}
