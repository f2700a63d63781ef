use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::types::{Event, EventPayload};

/// Per-subscriber ring capacity. Overflow drops the oldest event and the
/// receiver surfaces a `gap` marker; publishers never block.
pub const SUBSCRIBER_CAPACITY: usize = 64;

struct SubscriberState {
    buf: VecDeque<Event>,
    /// Events dropped since the last gap was surfaced.
    dropped: u64,
    /// Id and task of the most recently dropped event; the gap marker
    /// reuses them so subscribers still see non-decreasing ids.
    last_dropped_id: u64,
    last_dropped_task: String,
    closed: bool,
    last_drain: Instant,
}

struct Subscriber {
    state: Mutex<SubscriberState>,
    notify: Notify,
}

impl Subscriber {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SubscriberState {
                buf: VecDeque::with_capacity(SUBSCRIBER_CAPACITY),
                dropped: 0,
                last_dropped_id: 0,
                last_dropped_task: String::new(),
                closed: false,
                last_drain: Instant::now(),
            }),
            notify: Notify::new(),
        })
    }

    fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.closed = true;
        drop(state);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }
}

/// Receiving half of a subscription. Dropping it (or unsubscribing) ends
/// delivery; the bus side only ever buffers, it never blocks on us.
pub struct EventReceiver {
    inner: Arc<Subscriber>,
}

impl EventReceiver {
    /// Next event, or `None` once the bus has shut down or unsubscribed us
    /// and the buffer is drained. A pending gap is surfaced before the next
    /// real event.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            {
                let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
                if state.dropped > 0 {
                    let missed = state.dropped;
                    state.dropped = 0;
                    state.last_drain = Instant::now();
                    return Some(Event {
                        id: state.last_dropped_id,
                        task_id: state.last_dropped_task.clone(),
                        ts: Utc::now(),
                        payload: EventPayload::Gap { missed },
                    });
                }
                if let Some(event) = state.buf.pop_front() {
                    state.last_drain = Instant::now();
                    return Some(event);
                }
                if state.closed {
                    return None;
                }
            }
            self.inner.notified().await;
        }
    }

    /// Non-blocking variant used by tests and the SSE adapter's fast path.
    pub fn try_recv(&mut self) -> Option<Event> {
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.dropped > 0 {
            let missed = state.dropped;
            state.dropped = 0;
            state.last_drain = Instant::now();
            return Some(Event {
                id: state.last_dropped_id,
                task_id: state.last_dropped_task.clone(),
                ts: Utc::now(),
                payload: EventPayload::Gap { missed },
            });
        }
        let event = state.buf.pop_front();
        if event.is_some() {
            state.last_drain = Instant::now();
        }
        event
    }
}

impl Subscriber {
    async fn notified(&self) {
        self.notify.notified().await;
    }
}

/// In-process topic-less pub/sub. Every publish stamps a strictly
/// increasing id; each subscriber gets an independent bounded ring.
pub struct EventBus {
    next_event_id: AtomicU64,
    next_sub_id: AtomicU64,
    subscribers: Mutex<HashMap<u64, Arc<Subscriber>>>,
    shut_down: AtomicBool,
    /// A subscriber holding undrained events older than this is reaped.
    stall_timeout: Duration,
}

impl EventBus {
    pub fn new(stall_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            next_event_id: AtomicU64::new(1),
            next_sub_id: AtomicU64::new(1),
            subscribers: Mutex::new(HashMap::new()),
            shut_down: AtomicBool::new(false),
            stall_timeout,
        })
    }

    /// Continue the id sequence after `last_id` (the persisted maximum),
    /// so replayed history and fresh events never collide.
    pub fn resume_from(&self, last_id: u64) {
        let next = last_id + 1;
        let mut current = self.next_event_id.load(Ordering::Relaxed);
        while current < next {
            match self.next_event_id.compare_exchange(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn subscribe(&self) -> (u64, EventReceiver) {
        let id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        let sub = Subscriber::new();
        if self.shut_down.load(Ordering::Acquire) {
            sub.close();
            return (id, EventReceiver { inner: sub });
        }
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, Arc::clone(&sub));
        (id, EventReceiver { inner: sub })
    }

    pub fn unsubscribe(&self, id: u64) {
        let removed = self
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        if let Some(sub) = removed {
            sub.close();
        }
    }

    /// Stamp and fan out an event. Returns the stamped event so callers can
    /// persist it. Returns immediately; a full subscriber ring loses its
    /// oldest entry instead of blocking us.
    pub fn publish(&self, task_id: impl Into<String>, payload: EventPayload) -> Event {
        let event = Event {
            id: self.next_event_id.fetch_add(1, Ordering::Relaxed),
            task_id: task_id.into(),
            ts: Utc::now(),
            payload,
        };
        if self.shut_down.load(Ordering::Acquire) {
            return event;
        }
        let subs: Vec<Arc<Subscriber>> = {
            let map = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
            map.values().map(Arc::clone).collect()
        };
        for sub in subs {
            let mut state = sub.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.closed {
                continue;
            }
            if state.buf.len() >= SUBSCRIBER_CAPACITY {
                if let Some(victim) = state.buf.pop_front() {
                    let extra = match victim.payload {
                        EventPayload::Gap { missed } => missed,
                        _ => 1,
                    };
                    state.dropped += extra;
                    state.last_dropped_id = victim.id;
                    state.last_dropped_task = victim.task_id;
                }
            }
            state.buf.push_back(event.clone());
            drop(state);
            sub.notify.notify_one();
        }
        event
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Close every subscriber channel. Idempotent; later publishes no-op.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let subs: Vec<Arc<Subscriber>> = {
            let mut map = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
            map.drain().map(|(_, s)| s).collect()
        };
        for sub in subs {
            sub.close();
        }
        info!("event bus shut down");
    }

    /// Background reaper: unsubscribes channels whose receiver has not
    /// drained within the stall timeout. Runs until the bus shuts down.
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let bus = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if bus.shut_down.load(Ordering::Acquire) {
                    return;
                }
                bus.reap_stalled();
            }
        })
    }

    fn reap_stalled(&self) {
        let stalled: Vec<u64> = {
            let map = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
            map.iter()
                .filter(|(_, sub)| {
                    let state = sub.state.lock().unwrap_or_else(|e| e.into_inner());
                    !state.buf.is_empty() && state.last_drain.elapsed() > self.stall_timeout
                })
                .map(|(id, _)| *id)
                .collect()
        };
        for id in stalled {
            debug!(subscriber = id, "reaping stalled event subscriber");
            self.unsubscribe(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(n: u64) -> EventPayload {
        EventPayload::ContentDelta {
            message_id: "m1".into(),
            block_type: "text".into(),
            delta: n.to_string(),
        }
    }

    #[tokio::test]
    async fn ids_are_strictly_increasing() {
        let bus = EventBus::new(Duration::from_secs(5));
        let a = bus.publish("t1", delta(1));
        let b = bus.publish("t2", delta(2));
        let c = bus.publish("t1", delta(3));
        assert!(a.id < b.id && b.id < c.id);
    }

    #[tokio::test]
    async fn resume_continues_past_persisted_ids() {
        let bus = EventBus::new(Duration::from_secs(5));
        bus.resume_from(100);
        let ev = bus.publish("t1", delta(1));
        assert_eq!(ev.id, 101);
        // resuming backwards never rewinds the counter
        bus.resume_from(50);
        let ev = bus.publish("t1", delta(2));
        assert_eq!(ev.id, 102);
    }

    #[tokio::test]
    async fn subscriber_receives_in_order() {
        let bus = EventBus::new(Duration::from_secs(5));
        let (_id, mut rx) = bus.subscribe();
        for n in 0..10 {
            bus.publish("t1", delta(n));
        }
        let mut last = 0;
        for _ in 0..10 {
            let ev = rx.recv().await.unwrap();
            assert!(ev.id > last);
            last = ev.id;
        }
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_marks_gap() {
        let bus = EventBus::new(Duration::from_secs(60));
        let (_id, mut rx) = bus.subscribe();
        let total = SUBSCRIBER_CAPACITY as u64 + 10;
        for n in 0..total {
            bus.publish("t1", delta(n));
        }
        let first = rx.recv().await.unwrap();
        match first.payload {
            EventPayload::Gap { missed } => assert_eq!(missed, 10),
            other => panic!("expected gap first, got {other:?}"),
        }
        // The remaining events are the newest CAPACITY ones, in order.
        let mut seen = 0;
        let mut last_id = first.id;
        while let Some(ev) = rx.try_recv() {
            assert!(ev.id >= last_id);
            last_id = ev.id;
            seen += 1;
        }
        assert_eq!(seen, SUBSCRIBER_CAPACITY);
    }

    #[tokio::test]
    async fn unsubscribed_receiver_drains_then_ends() {
        let bus = EventBus::new(Duration::from_secs(5));
        let (id, mut rx) = bus.subscribe();
        bus.publish("t1", delta(1));
        bus.unsubscribe(id);
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_closes_all() {
        let bus = EventBus::new(Duration::from_secs(5));
        let (_a, mut rx_a) = bus.subscribe();
        let (_b, mut rx_b) = bus.subscribe();
        bus.shutdown();
        bus.shutdown();
        assert!(rx_a.recv().await.is_none());
        assert!(rx_b.recv().await.is_none());
        // publish after shutdown still stamps but delivers nowhere
        let ev = bus.publish("t1", delta(1));
        assert!(ev.id > 0);
        let (_c, mut rx_c) = bus.subscribe();
        assert!(rx_c.recv().await.is_none());
    }

    #[tokio::test]
    async fn reaper_unsubscribes_stalled_subscriber_only() {
        let bus = EventBus::new(Duration::from_millis(10));
        let (_slow, _rx_slow) = bus.subscribe();
        let (_fast, mut rx_fast) = bus.subscribe();
        for n in 0..5 {
            bus.publish("t1", delta(n));
        }
        // fast drains, slow never does
        for _ in 0..5 {
            rx_fast.recv().await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        bus.reap_stalled();
        assert_eq!(bus.subscriber_count(), 1);
    }
}
