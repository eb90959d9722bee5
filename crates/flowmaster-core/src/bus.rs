// Copyright (C) 2025 Flowmaster Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Delayed-event queues.
//!
//! [`DelayEventBus`] is a time-ordered queue: an event becomes eligible
//! for [`poll`](DelayEventBus::poll) only once its trigger time has
//! elapsed. [`WorkflowEventBus`] wraps it for one workflow instance and
//! adds fire counters. The counters are best-effort telemetry updated
//! with relaxed atomics; they are never consulted for correctness.

use chrono::{DateTime, TimeDelta, Utc};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::event::LifecycleEvent;

struct QueuedEvent {
    trigger_time: DateTime<Utc>,
    seq: i64,
    event: LifecycleEvent,
}

// Ordering is (trigger_time, seq): earlier trigger times first, ties
// broken by insertion sequence for deterministic draining.
impl PartialEq for QueuedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.trigger_time == other.trigger_time && self.seq == other.seq
    }
}

impl Eq for QueuedEvent {}

impl PartialOrd for QueuedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        self.trigger_time
            .cmp(&other.trigger_time)
            .then(self.seq.cmp(&other.seq))
    }
}

/// A time-ordered event queue with non-blocking polling.
///
/// `publish` never blocks and `poll` never waits: an event published
/// with a future trigger time simply stays queued until a later poll
/// finds it elapsed. No event is ever lost.
pub struct DelayEventBus {
    clock: Arc<dyn Clock>,
    queue: Mutex<BinaryHeap<Reverse<QueuedEvent>>>,
    // Positive, increasing for normal publishes; negative, decreasing
    // for front requeues so a requeued event always drains first.
    next_seq: AtomicI64,
    front_seq: AtomicI64,
}

impl DelayEventBus {
    /// Create an empty bus reading time from the given clock.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            queue: Mutex::new(BinaryHeap::new()),
            next_seq: AtomicI64::new(1),
            front_seq: AtomicI64::new(0),
        }
    }

    /// Publish an event that becomes eligible after `delay`.
    /// A zero delay makes it immediately eligible, subject to queue
    /// ordering.
    pub fn publish(&self, event: LifecycleEvent, delay: Duration) {
        let delay = TimeDelta::from_std(delay).unwrap_or(TimeDelta::MAX);
        let trigger_time = self
            .clock
            .now()
            .checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let seq = self.next_seq.fetch_add(1, AtomicOrdering::Relaxed);
        self.queue.lock().unwrap().push(Reverse(QueuedEvent {
            trigger_time,
            seq,
            event,
        }));
    }

    /// Reinsert a popped event ahead of everything else in the queue.
    /// Used when handling failed transiently and the event must be
    /// retried unchanged, in order.
    pub fn requeue_front(&self, event: LifecycleEvent) {
        let seq = self.front_seq.fetch_sub(1, AtomicOrdering::Relaxed) - 1;
        self.queue.lock().unwrap().push(Reverse(QueuedEvent {
            trigger_time: DateTime::<Utc>::MIN_UTC,
            seq,
            event,
        }));
    }

    /// Pop the next elapsed event, if any. Non-blocking: returns `None`
    /// when the queue is empty or the earliest event is still in the
    /// future.
    pub fn poll(&self) -> Option<LifecycleEvent> {
        let mut queue = self.queue.lock().unwrap();
        let due = queue
            .peek()
            .is_some_and(|Reverse(head)| head.trigger_time <= self.clock.now());
        if due {
            queue.pop().map(|Reverse(queued)| queued.event)
        } else {
            None
        }
    }

    /// Whether any event (elapsed or not) is queued.
    pub fn is_empty(&self) -> bool {
        self.queue.lock().unwrap().is_empty()
    }

    /// Number of queued events (elapsed or not).
    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}

impl std::fmt::Debug for DelayEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelayEventBus")
            .field("len", &self.len())
            .finish()
    }
}

/// The private event bus of one workflow instance.
///
/// At most one shard thread drains a given bus at any time; that is
/// enforced by the shard-ownership model, not by this type.
#[derive(Debug)]
pub struct WorkflowEventBus {
    bus: DelayEventBus,
    event_count: AtomicU64,
    fire_success_count: AtomicU64,
    fire_failure_count: AtomicU64,
}

impl WorkflowEventBus {
    /// Create an empty bus for one instance.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            bus: DelayEventBus::new(clock),
            event_count: AtomicU64::new(0),
            fire_success_count: AtomicU64::new(0),
            fire_failure_count: AtomicU64::new(0),
        }
    }

    /// Publish an event with zero delay.
    pub fn publish(&self, event: LifecycleEvent) {
        self.publish_delayed(event, Duration::ZERO);
    }

    /// Publish an event that becomes eligible after `delay`.
    pub fn publish_delayed(&self, event: LifecycleEvent, delay: Duration) {
        self.event_count.fetch_add(1, AtomicOrdering::Relaxed);
        self.bus.publish(event, delay);
    }

    /// Reinsert a popped event at the front (transient-failure retry).
    pub fn requeue_front(&self, event: LifecycleEvent) {
        self.bus.requeue_front(event);
    }

    /// Pop the next elapsed event, if any.
    pub fn poll(&self) -> Option<LifecycleEvent> {
        self.bus.poll()
    }

    /// Whether any event is queued.
    pub fn is_empty(&self) -> bool {
        self.bus.is_empty()
    }

    /// Speculatively count an event as fired, before handling starts.
    /// The live in-flight count is observable while the handler runs;
    /// undone via [`record_fire_requeue`](Self::record_fire_requeue) or
    /// [`record_fire_failure`](Self::record_fire_failure).
    pub fn record_fire_attempt(&self) {
        self.fire_success_count.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Undo the speculative success count for a requeued event.
    pub fn record_fire_requeue(&self) {
        self.fire_success_count.fetch_sub(1, AtomicOrdering::Relaxed);
    }

    /// Undo the speculative success count and count a failure.
    pub fn record_fire_failure(&self) {
        self.fire_success_count.fetch_sub(1, AtomicOrdering::Relaxed);
        self.fire_failure_count.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Total events ever published to this bus.
    pub fn event_count(&self) -> u64 {
        self.event_count.load(AtomicOrdering::Relaxed)
    }

    /// Events handled successfully (plus those currently in a handler).
    pub fn fire_success_count(&self) -> u64 {
        self.fire_success_count.load(AtomicOrdering::Relaxed)
    }

    /// Events whose handler failed non-transiently.
    pub fn fire_failure_count(&self) -> u64 {
        self.fire_failure_count.load(AtomicOrdering::Relaxed)
    }
}
