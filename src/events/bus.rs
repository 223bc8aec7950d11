//! Multi-subscriber event fan-out
//!
//! Every subscriber owns a queue. Publishing never blocks: ordinary events
//! are always enqueued, while performance updates are capped per subscriber
//! and the oldest unread one is dropped to make room for a new one.
//! Publishing is serialized, so all subscribers see the same order.

use super::OutboundEvent;
use crossbeam_channel::{RecvTimeoutError, TryRecvError};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::debug;

/// Performance updates kept per subscriber when no backlog is configured
pub const DEFAULT_PERFORMANCE_BACKLOG: usize = 4;

#[derive(Default)]
struct Queue {
    events: VecDeque<OutboundEvent>,
    /// Performance updates currently in `events`
    performance: usize,
    dropped: u64,
    closed: bool,
}

impl Queue {
    fn push(&mut self, event: OutboundEvent, backlog: usize) {
        if event.is_performance_update() {
            if self.performance >= backlog {
                if let Some(pos) = self.events.iter().position(OutboundEvent::is_performance_update) {
                    self.events.remove(pos);
                    self.performance -= 1;
                    self.dropped += 1;
                }
            }
            self.performance += 1;
        }
        self.events.push_back(event);
    }

    fn pop(&mut self) -> Option<OutboundEvent> {
        let event = self.events.pop_front()?;
        if event.is_performance_update() {
            self.performance -= 1;
        }
        Some(event)
    }
}

struct Slot {
    queue: Mutex<Queue>,
    ready: Condvar,
}

struct BusInner {
    subscribers: Mutex<Vec<Weak<Slot>>>,
    closed: Mutex<bool>,
    performance_backlog: usize,
}

/// Cloneable publisher side
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Bus keeping at most `performance_backlog` unread performance updates
    /// per subscriber (minimum 1)
    pub fn new(performance_backlog: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: Mutex::new(Vec::new()),
                closed: Mutex::new(false),
                performance_backlog: performance_backlog.max(1),
            }),
        }
    }

    /// Live feed of events published from now on
    pub fn subscribe(&self) -> Subscription {
        let slot = Arc::new(Slot {
            queue: Mutex::new(Queue::default()),
            ready: Condvar::new(),
        });
        let closed = self.inner.closed.lock();
        if *closed {
            slot.queue.lock().closed = true;
        } else {
            self.inner.subscribers.lock().push(Arc::downgrade(&slot));
        }
        drop(closed);
        Subscription { slot }
    }

    pub fn publish(&self, event: OutboundEvent) {
        if *self.inner.closed.lock() {
            debug!("Dropping {} published after close", event.name());
            return;
        }
        let mut subscribers = self.inner.subscribers.lock();
        subscribers.retain(|weak| weak.strong_count() > 0);
        for slot in subscribers.iter().filter_map(Weak::upgrade) {
            slot.queue.lock().push(event.clone(), self.inner.performance_backlog);
            slot.ready.notify_all();
        }
    }

    /// Publish `final_event` and end every subscription after it.
    /// Later publishes are ignored.
    pub fn close(&self, final_event: OutboundEvent) {
        let mut closed = self.inner.closed.lock();
        if *closed {
            return;
        }
        *closed = true;
        let subscribers = std::mem::take(&mut *self.inner.subscribers.lock());
        for slot in subscribers.iter().filter_map(Weak::upgrade) {
            let mut queue = slot.queue.lock();
            queue.push(final_event.clone(), self.inner.performance_backlog);
            queue.closed = true;
            drop(queue);
            slot.ready.notify_all();
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.lock()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .lock()
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_PERFORMANCE_BACKLOG)
    }
}

/// Receiving side of one subscriber. Dropping it unsubscribes.
pub struct Subscription {
    slot: Arc<Slot>,
}

impl Subscription {
    /// Block for the next event; `None` once the bus is closed and drained
    pub fn recv(&self) -> Option<OutboundEvent> {
        let mut queue = self.slot.queue.lock();
        loop {
            if let Some(event) = queue.pop() {
                return Some(event);
            }
            if queue.closed {
                return None;
            }
            self.slot.ready.wait(&mut queue);
        }
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<OutboundEvent, RecvTimeoutError> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.slot.queue.lock();
        loop {
            if let Some(event) = queue.pop() {
                return Ok(event);
            }
            if queue.closed {
                return Err(RecvTimeoutError::Disconnected);
            }
            if self.slot.ready.wait_until(&mut queue, deadline).timed_out() {
                return queue.pop().ok_or(RecvTimeoutError::Timeout);
            }
        }
    }

    pub fn try_recv(&self) -> Result<OutboundEvent, TryRecvError> {
        let mut queue = self.slot.queue.lock();
        match queue.pop() {
            Some(event) => Ok(event),
            None if queue.closed => Err(TryRecvError::Disconnected),
            None => Err(TryRecvError::Empty),
        }
    }

    /// Everything queued right now
    pub fn drain(&self) -> Vec<OutboundEvent> {
        let mut queue = self.slot.queue.lock();
        let mut events = Vec::with_capacity(queue.events.len());
        while let Some(event) = queue.pop() {
            events.push(event);
        }
        events
    }

    /// Blocking iterator ending when the bus closes
    pub fn iter(&self) -> impl Iterator<Item = OutboundEvent> + '_ {
        std::iter::from_fn(move || self.recv())
    }

    /// Performance updates discarded because this subscriber fell behind
    pub fn dropped_performance_updates(&self) -> u64 {
        self.slot.queue.lock().dropped
    }

    pub fn len(&self) -> usize {
        self.slot.queue.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.slot.queue.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EngineState;
    use crate::monitor::PerformanceSample;
    use std::thread;

    fn perf(cpu: f32) -> OutboundEvent {
        OutboundEvent::PerformanceUpdate(PerformanceSample::new(cpu, 10.0))
    }

    fn state(to: EngineState) -> OutboundEvent {
        OutboundEvent::StateChanged {
            from: EngineState::Idle,
            to,
        }
    }

    #[test]
    fn test_every_subscriber_sees_same_order() {
        let bus = EventBus::default();
        let a = bus.subscribe();
        let b = bus.subscribe();

        bus.publish(state(EngineState::Listening));
        bus.publish(perf(1.0));
        bus.publish(state(EngineState::Capturing));

        assert_eq!(a.drain(), b.drain());
        assert_eq!(bus.subscriber_count(), 2);
    }

    #[test]
    fn test_late_subscriber_gets_no_replay() {
        let bus = EventBus::default();
        bus.publish(state(EngineState::Listening));
        let late = bus.subscribe();
        assert!(late.is_empty());
    }

    #[test]
    fn test_slow_subscriber_keeps_newest_performance_updates() {
        let bus = EventBus::new(2);
        let sub = bus.subscribe();

        bus.publish(perf(1.0));
        bus.publish(state(EngineState::Listening));
        for cpu in 2..=5 {
            bus.publish(perf(cpu as f32));
        }

        let events = sub.drain();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], state(EngineState::Listening));
        let cpus: Vec<f32> = events
            .iter()
            .filter_map(|e| match e {
                OutboundEvent::PerformanceUpdate(s) => Some(s.cpu_percent),
                _ => None,
            })
            .collect();
        assert_eq!(cpus, vec![4.0, 5.0]);
        assert_eq!(sub.dropped_performance_updates(), 3);
    }

    #[test]
    fn test_other_events_never_dropped() {
        let bus = EventBus::new(1);
        let sub = bus.subscribe();
        for _ in 0..500 {
            bus.publish(state(EngineState::Thinking));
        }
        assert_eq!(sub.len(), 500);
    }

    #[test]
    fn test_close_delivers_final_event_then_ends() {
        let bus = EventBus::default();
        let sub = bus.subscribe();
        bus.publish(state(EngineState::Listening));
        bus.close(OutboundEvent::EngineStopped);
        bus.publish(state(EngineState::Capturing));

        let events: Vec<_> = sub.iter().collect();
        assert_eq!(events, vec![state(EngineState::Listening), OutboundEvent::EngineStopped]);
        assert_eq!(sub.try_recv(), Err(TryRecvError::Disconnected));
        assert!(bus.subscribe().is_closed());
    }

    #[test]
    fn test_recv_wakes_on_publish() {
        let bus = EventBus::default();
        let sub = bus.subscribe();
        let publisher = {
            let bus = bus.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                bus.publish(state(EngineState::Speaking));
            })
        };

        assert_eq!(sub.recv_timeout(Duration::from_secs(2)), Ok(state(EngineState::Speaking)));
        assert_eq!(sub.recv_timeout(Duration::from_millis(10)), Err(RecvTimeoutError::Timeout));
        publisher.join().unwrap();
    }

    #[test]
    fn test_dropped_subscription_is_pruned() {
        let bus = EventBus::default();
        let sub = bus.subscribe();
        drop(sub);
        bus.publish(perf(3.0));
        assert_eq!(bus.subscriber_count(), 0);
    }
}
