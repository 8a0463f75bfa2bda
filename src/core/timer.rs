//! Deadline scheduling for the protocol state machines.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    time::Instant,
};

/// A handle to a scheduled action, used to cancel it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken(u64);

/// A min-heap of deadlines with cancellable actions.
///
/// The scheduler doesn't keep time itself: its owner asks for the [next
/// deadline](Scheduler::next_deadline), sleeps until then and hands the current instant to
/// [`pop_expired`](Scheduler::pop_expired). Cancelled actions are removed from the action map
/// immediately and never fire; their stale heap entries are skipped lazily.
#[derive(Debug)]
pub struct Scheduler<A> {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    actions: HashMap<u64, A>,
    next_seq: u64,
}

impl<A> Default for Scheduler<A> {
    fn default() -> Self {
        Self {
            heap: BinaryHeap::new(),
            actions: HashMap::new(),
            next_seq: 0,
        }
    }
}

impl<A> Scheduler<A> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules an action to fire at the supplied instant.
    pub fn schedule(&mut self, at: Instant, action: A) -> TimerToken {
        let seq = self.next_seq;
        self.next_seq += 1;

        self.heap.push(Reverse((at, seq)));
        self.actions.insert(seq, action);

        TimerToken(seq)
    }

    /// Cancels a scheduled action, returning it if it hadn't fired yet.
    pub fn cancel(&mut self, token: TimerToken) -> Option<A> {
        self.actions.remove(&token.0)
    }

    /// Returns the earliest pending deadline, if any.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((at, seq))) = self.heap.peek().copied() {
            if self.actions.contains_key(&seq) {
                return Some(at);
            }

            // Cancelled, discard.
            self.heap.pop();
        }

        None
    }

    /// Removes and returns every action whose deadline is at or before `now`, in deadline order
    /// (ties are resolved in scheduling order).
    pub fn pop_expired(&mut self, now: Instant) -> Vec<A> {
        let mut expired = vec![];

        while let Some(Reverse((at, seq))) = self.heap.peek().copied() {
            if at > now {
                break;
            }

            self.heap.pop();
            if let Some(action) = self.actions.remove(&seq) {
                expired.push(action);
            }
        }

        expired
    }

    /// The number of pending (not cancelled) actions.
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}
