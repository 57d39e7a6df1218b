//! Timer tasks for the orchestrator's single execution context.
//!
//! Continuations are resumed by whoever owns the scheduler calling
//! [`Scheduler::pop_due`]; nothing runs on its own. Equal deadlines resume in
//! scheduling order. Cancellation is lazy: the heap entry stays until popped.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
};

use tokio::time::Instant;

/// Handle returned by [`Scheduler::schedule`], used to cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

pub struct Scheduler<T> {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    tasks: HashMap<u64, T>,
    next_seq: u64,
}

impl<T> Default for Scheduler<T> {
    fn default() -> Self {
        Self {
            heap: BinaryHeap::new(),
            tasks: HashMap::new(),
            next_seq: 0,
        }
    }
}

impl<T> Scheduler<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `task` to resume at `at`.
    pub fn schedule(&mut self, at: Instant, task: T) -> TimerId {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse((at, seq)));
        self.tasks.insert(seq, task);
        TimerId(seq)
    }

    /// Cancels a pending task. Returns false if it already ran or was cancelled.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        self.tasks.remove(&id.0).is_some()
    }

    /// Earliest deadline among live tasks.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.discard_cancelled();
        self.heap.peek().map(|Reverse((at, _))| *at)
    }

    /// Pops the next task whose deadline is at or before `now`, together
    /// with that deadline.
    pub fn pop_due(&mut self, now: Instant) -> Option<(TimerId, Instant, T)> {
        self.discard_cancelled();
        let Reverse((at, seq)) = *self.heap.peek()?;
        if at > now {
            return None;
        }
        self.heap.pop();
        self.tasks.remove(&seq).map(|task| (TimerId(seq), at, task))
    }

    /// Live tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.tasks.clear();
    }

    fn discard_cancelled(&mut self) {
        while let Some(Reverse((_, seq))) = self.heap.peek() {
            if self.tasks.contains_key(seq) {
                break;
            }
            self.heap.pop();
        }
    }
}
