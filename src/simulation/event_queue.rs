//! Virtual clock and timed event queue.
//!
//! Events are kept in a binary heap ordered by fire time, with an insertion
//! sequence number as tie-break so that events scheduled for the same instant
//! dispatch in the order they were scheduled. Cancellation is lazy: a
//! cancelled event stays in the heap and is discarded when it reaches the top.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::time::Duration;

use crate::error::{SimError, SimResult};

/// Handle returned by [`EventQueue::schedule`], used to cancel the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandle(u64);

struct ScheduledEvent<P> {
    time: Duration,
    sequence: u64,
    payload: P,
}

impl<P> PartialEq for ScheduledEvent<P> {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.sequence == other.sequence
    }
}

impl<P> Eq for ScheduledEvent<P> {}

impl<P> PartialOrd for ScheduledEvent<P> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<P> Ord for ScheduledEvent<P> {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max heap: reverse both keys so the earliest time,
        // then the lowest sequence, sits on top.
        match other.time.cmp(&self.time) {
            Ordering::Equal => other.sequence.cmp(&self.sequence),
            ord => ord,
        }
    }
}

/// Priority queue of timed events that also owns the simulation clock.
pub struct EventQueue<P> {
    heap: BinaryHeap<ScheduledEvent<P>>,
    pending: HashSet<u64>,
    now: Duration,
    next_sequence: u64,
    dispatched: u64,
}

impl<P> EventQueue<P> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            pending: HashSet::new(),
            now: Duration::ZERO,
            next_sequence: 0,
            dispatched: 0,
        }
    }

    /// Current simulation time (fire time of the last dispatched event).
    pub fn now(&self) -> Duration {
        self.now
    }

    /// Schedule `payload` at absolute time `time`.
    ///
    /// Scheduling at the current instant is allowed; the event runs after all
    /// events already queued for that instant. Scheduling in the past fails
    /// with [`SimError::InvalidSchedule`].
    pub fn schedule(&mut self, time: Duration, payload: P) -> SimResult<EventHandle> {
        if time < self.now {
            return Err(SimError::InvalidSchedule { requested: time, now: self.now });
        }
        Ok(self.push(time, payload))
    }

    /// Schedule `payload` after `delay` from now.
    pub fn schedule_in(&mut self, delay: Duration, payload: P) -> EventHandle {
        let time = self.now.saturating_add(delay);
        self.push(time, payload)
    }

    fn push(&mut self, time: Duration, payload: P) -> EventHandle {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.pending.insert(sequence);
        self.heap.push(ScheduledEvent { time, sequence, payload });
        EventHandle(sequence)
    }

    /// Cancel a pending event. Returns `false` (and does nothing) when the
    /// event already fired or was cancelled before.
    pub fn cancel(&mut self, handle: EventHandle) -> bool {
        self.pending.remove(&handle.0)
    }

    pub fn is_pending(&self, handle: EventHandle) -> bool {
        self.pending.contains(&handle.0)
    }

    /// Fire time of the earliest live event.
    pub fn next_time(&mut self) -> Option<Duration> {
        self.discard_cancelled();
        self.heap.peek().map(|event| event.time)
    }

    /// Remove the earliest live event if it fires strictly before `stop`,
    /// advancing the clock to its fire time.
    pub fn pop_before(&mut self, stop: Duration) -> Option<(Duration, P)> {
        self.discard_cancelled();
        if self.heap.peek()?.time >= stop {
            return None;
        }
        let event = self.heap.pop()?;
        self.pending.remove(&event.sequence);
        self.now = event.time;
        self.dispatched += 1;
        Some((event.time, event.payload))
    }

    /// Dispatch events until the queue is empty or the next event is at or
    /// after `stop`. The handler may schedule further events through the
    /// queue it is given. Returns the number of dispatched events.
    pub fn run_until<F>(&mut self, stop: Duration, mut handler: F) -> usize
    where
        F: FnMut(&mut Self, Duration, P),
    {
        let mut count = 0;
        while let Some((time, payload)) = self.pop_before(stop) {
            handler(self, time, payload);
            count += 1;
        }
        count
    }

    /// Number of live (not cancelled, not fired) events.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Total number of events dispatched since creation.
    pub fn dispatched(&self) -> u64 {
        self.dispatched
    }

    fn discard_cancelled(&mut self) {
        while let Some(top) = self.heap.peek() {
            if self.pending.contains(&top.sequence) {
                break;
            }
            self.heap.pop();
        }
    }
}

impl<P> Default for EventQueue<P> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn dispatches_in_time_order_with_fifo_ties() {
        let mut queue = EventQueue::new();
        queue.schedule(secs(5), "five").unwrap();
        queue.schedule(secs(3), "three-a").unwrap();
        queue.schedule(secs(3), "three-b").unwrap();
        queue.schedule(secs(1), "one").unwrap();

        let mut order = Vec::new();
        let count = queue.run_until(secs(100), |_, time, payload| order.push((time, payload)));

        assert_eq!(count, 4);
        assert_eq!(order, vec![(secs(1), "one"), (secs(3), "three-a"), (secs(3), "three-b"), (secs(5), "five")]);
        assert!(queue.is_empty());
    }

    #[test]
    fn same_time_events_scheduled_by_handler_run_after_queued_ones() {
        let mut queue = EventQueue::new();
        queue.schedule(secs(1), 1).unwrap();
        queue.schedule(secs(1), 2).unwrap();

        let mut order = Vec::new();
        queue.run_until(secs(10), |q, _, payload| {
            order.push(payload);
            if payload == 1 {
                q.schedule_in(Duration::ZERO, 3);
            }
        });

        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn stop_time_is_exclusive() {
        let mut queue = EventQueue::new();
        queue.schedule(secs(1), "early").unwrap();
        queue.schedule(secs(2), "at-stop").unwrap();

        let mut fired = Vec::new();
        queue.run_until(secs(2), |_, _, payload| fired.push(payload));

        assert_eq!(fired, vec!["early"]);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next_time(), Some(secs(2)));
    }

    #[test]
    fn scheduling_in_the_past_is_rejected() {
        let mut queue = EventQueue::new();
        queue.schedule(secs(5), ()).unwrap();
        queue.run_until(secs(10), |_, _, _| {});
        assert_eq!(queue.now(), secs(5));

        let err = queue.schedule(secs(4), ()).unwrap_err();
        assert_eq!(err, SimError::InvalidSchedule { requested: secs(4), now: secs(5) });
        assert!(queue.schedule(secs(5), ()).is_ok());
    }

    #[test]
    fn cancel_before_fire_suppresses_event_and_is_noop_afterwards() {
        let mut queue = EventQueue::new();
        let keep = queue.schedule(secs(1), "keep").unwrap();
        let discarded = queue.schedule(secs(2), "drop").unwrap();

        assert!(queue.cancel(discarded));
        assert!(!queue.cancel(discarded));

        let mut fired = Vec::new();
        queue.run_until(secs(10), |_, _, payload| fired.push(payload));
        assert_eq!(fired, vec!["keep"]);

        // Already fired: cancelling is not an error and changes nothing.
        assert!(!queue.cancel(keep));
        assert_eq!(queue.dispatched(), 1);
    }
}
