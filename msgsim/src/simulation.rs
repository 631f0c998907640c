//! Time-ordered event queue.
//!
//! Events scheduled for the same time are popped in the order they were
//! pushed: continuations scheduled with a zero delay therefore run after
//! everything already due at the current time, and never overtake each
//! other.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::time::Duration;

use crate::time::MonotonicTime;

struct Scheduled<E> {
    time: MonotonicTime,
    seq: u64,
    event: E,
}

impl<E> PartialEq for Scheduled<E> {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.seq == other.seq
    }
}

impl<E> Eq for Scheduled<E> {}

impl<E> PartialOrd for Scheduled<E> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<E> Ord for Scheduled<E> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: `BinaryHeap` is a max-heap.
        other
            .time
            .cmp(&self.time)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// A queue of events ordered by time, FIFO among equal times.
pub struct EventQueue<E> {
    heap: BinaryHeap<Scheduled<E>>,
    seq: u64,
    now: MonotonicTime,
}

impl<E> EventQueue<E> {
    /// Creates an empty queue positioned at `start`.
    pub fn new(start: MonotonicTime) -> Self {
        Self {
            heap: BinaryHeap::new(),
            seq: 0,
            now: start,
        }
    }

    /// Time of the last popped event, or the start time.
    pub fn time(&self) -> MonotonicTime {
        self.now
    }

    /// Schedules `event` at `delay` past the current time.
    pub fn schedule(&mut self, delay: Duration, event: E) {
        let time = self.now + delay;
        self.push(time, event);
    }

    /// Schedules `event` at an absolute time, clamped to the current time.
    pub fn push(&mut self, time: MonotonicTime, event: E) {
        let time = time.max(self.now);
        self.heap.push(Scheduled {
            time,
            seq: self.seq,
            event,
        });
        self.seq += 1;
    }

    /// Pops the earliest event and advances the current time to it.
    pub fn pop(&mut self) -> Option<(MonotonicTime, E)> {
        let s = self.heap.pop()?;
        self.now = s.time;

        Some((s.time, s.event))
    }

    /// Time of the next event, if any.
    pub fn peek_time(&self) -> Option<MonotonicTime> {
        self.heap.peek().map(|s| s.time)
    }

    /// Number of pending events.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Returns `true` if no event is pending.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

impl<E> fmt::Debug for EventQueue<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventQueue")
            .field("now", &self.now)
            .field("pending", &self.heap.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_orders_by_time_then_fifo() {
        let t0 = MonotonicTime::EPOCH;
        let mut q = EventQueue::new(t0);

        q.schedule(Duration::from_nanos(5), "late");
        q.schedule(Duration::ZERO, "a");
        q.schedule(Duration::ZERO, "b");
        q.schedule(Duration::from_nanos(1), "mid");
        q.schedule(Duration::ZERO, "c");

        let order: Vec<&str> = std::iter::from_fn(|| q.pop().map(|(_, e)| e)).collect();
        assert_eq!(order, vec!["a", "b", "c", "mid", "late"]);
        assert_eq!(q.time(), t0 + Duration::from_nanos(5));
    }

    #[test]
    fn queue_delays_are_relative_to_last_pop() {
        let t0 = MonotonicTime::EPOCH;
        let mut q = EventQueue::new(t0);

        q.schedule(Duration::from_nanos(10), 1);
        q.pop();
        q.schedule(Duration::from_nanos(10), 2);
        q.push(t0, 3);

        assert_eq!(q.pop(), Some((t0 + Duration::from_nanos(10), 3)));
        assert_eq!(q.pop(), Some((t0 + Duration::from_nanos(20), 2)));
        assert!(q.is_empty());
    }
}
