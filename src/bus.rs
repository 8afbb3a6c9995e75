//! The event bus: filtered pub/sub with both synchronous callbacks and
//! bounded async streams, backed by a ring-buffer history.
//!
//! Grounded on the teacher's `EventBus` (a single `RwLock`-guarded listener
//! table, panic-isolated callback dispatch) and the original implementation's
//! `event_bus.py` (bounded `EventStream` with drop-oldest back-pressure,
//! 10,000-entry history, filter-by-type/source/user/category).

use crate::event::Event;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::Notify;

/// A bounded FIFO queue feeding a single stream subscription. Unlike
/// `tokio::sync::mpsc`, which drops the *incoming* event once full, this
/// drops the *oldest* queued event to make room: a slow subscriber should
/// lose stale events, not stall the publisher.
struct StreamInner {
    queue: Mutex<VecDeque<Event>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
}

/// Sending half held by the bus; dropped when the subscription is removed.
pub struct EventStreamSender {
    inner: Arc<StreamInner>,
}

impl EventStreamSender {
    /// Pushes an event, dropping the oldest queued one if at capacity.
    /// Returns `true` if an event was dropped to make room.
    fn push(&self, event: Event) -> bool {
        let mut queue = self.inner.queue.lock().unwrap();
        let dropped = if queue.len() >= self.inner.capacity {
            queue.pop_front();
            true
        } else {
            false
        };
        queue.push_back(event);
        drop(queue);
        self.inner.notify.notify_waiters();
        dropped
    }
}

impl Drop for EventStreamSender {
    fn drop(&mut self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }
}

/// Receiving half returned to the subscriber by `subscribe_stream`.
pub struct EventStreamReceiver {
    inner: Arc<StreamInner>,
}

impl EventStreamReceiver {
    /// Waits for the next event in publish order, or `None` once the bus
    /// side of the stream has been dropped and the queue has drained.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            {
                let mut queue = self.inner.queue.lock().unwrap();
                if let Some(event) = queue.pop_front() {
                    return Some(event);
                }
                if self.inner.closed.load(Ordering::SeqCst) {
                    return None;
                }
            }
            self.inner.notify.notified().await;
        }
    }

    /// Non-blocking pop, for tests and synchronous callers.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.inner.queue.lock().unwrap().pop_front()
    }
}

fn event_stream(capacity: usize) -> (EventStreamSender, EventStreamReceiver) {
    let inner = Arc::new(StreamInner {
        queue: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        capacity,
        notify: Notify::new(),
        closed: AtomicBool::new(false),
    });
    (
        EventStreamSender {
            inner: Arc::clone(&inner),
        },
        EventStreamReceiver { inner },
    )
}

/// How deliveries are made to a subscriber.
pub enum Delivery {
    Callback(Box<dyn Fn(&Event) + Send + Sync>),
    Stream(EventStreamSender),
}

/// Populated fields of a filter must all match; unset fields are wildcards.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    pub event_types: Option<Vec<String>>,
    pub sources: Option<Vec<String>>,
    pub user_ids: Option<Vec<String>>,
    pub categories: Option<Vec<crate::event::EventCategory>>,
}

impl EventFilter {
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(types) = &self.event_types {
            if !types.iter().any(|t| t == &event.event_type) {
                return false;
            }
        }
        if let Some(sources) = &self.sources {
            if !sources.iter().any(|s| s == &event.source) {
                return false;
            }
        }
        if let Some(users) = &self.user_ids {
            if !users.iter().any(|u| u == &event.user_id) {
                return false;
            }
        }
        if let Some(categories) = &self.categories {
            if !categories.contains(&event.category) {
                return false;
            }
        }
        true
    }
}

struct Subscription {
    id: u64,
    filter: EventFilter,
    delivery: Delivery,
    active: bool,
}

static NEXT_SUB_ID: AtomicU64 = AtomicU64::new(1);

/// Default capacity for a bounded stream subscription, and for the bus's
/// ring-buffer history, when the owning `Runtime` does not override them.
pub const DEFAULT_STREAM_CAPACITY: usize = 1024;
pub const DEFAULT_HISTORY_CAPACITY: usize = 10_000;

pub struct EventBus {
    subscriptions: RwLock<Vec<Subscription>>,
    history: RwLock<VecDeque<Event>>,
    history_capacity: usize,
    stream_capacity: usize,
    drops: AtomicU64,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Self::with_capacities(DEFAULT_HISTORY_CAPACITY, DEFAULT_STREAM_CAPACITY)
    }

    pub fn with_capacities(history_capacity: usize, stream_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            subscriptions: RwLock::new(Vec::new()),
            history: RwLock::new(VecDeque::with_capacity(history_capacity.min(1024))),
            history_capacity,
            stream_capacity,
            drops: AtomicU64::new(0),
        })
    }

    /// Register a synchronous callback subscription. Returns a subscription
    /// id usable with `unsubscribe`.
    pub fn subscribe<F>(&self, filter: EventFilter, callback: F) -> u64
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = NEXT_SUB_ID.fetch_add(1, Ordering::SeqCst);
        self.subscriptions.write().unwrap().push(Subscription {
            id,
            filter,
            delivery: Delivery::Callback(Box::new(callback)),
            active: true,
        });
        id
    }

    /// Register a bounded stream subscription. The returned receiver yields
    /// events in publish order; a full queue drops the oldest pending event
    /// for this stream only, and is counted rather than surfaced as an error.
    pub fn subscribe_stream(&self, filter: EventFilter) -> (u64, EventStreamReceiver) {
        let (tx, rx) = event_stream(self.stream_capacity);
        let id = NEXT_SUB_ID.fetch_add(1, Ordering::SeqCst);
        self.subscriptions.write().unwrap().push(Subscription {
            id,
            filter,
            delivery: Delivery::Stream(tx),
            active: true,
        });
        (id, rx)
    }

    pub fn unsubscribe(&self, id: u64) {
        let mut subs = self.subscriptions.write().unwrap();
        if let Some(sub) = subs.iter_mut().find(|s| s.id == id) {
            sub.active = false;
        }
        subs.retain(|s| s.active);
    }

    pub fn has_subscribers(&self, event_type: &str) -> bool {
        let probe = Event::new("probe", event_type, "probe", crate::event::EventCategory::Internal);
        self.subscriptions
            .read()
            .unwrap()
            .iter()
            .any(|s| s.active && s.filter.matches(&probe))
    }

    /// Publish an event: append to history under the write lock, then
    /// notify matching subscribers from a snapshot of the subscription list
    /// so a slow callback cannot block registration of new subscribers.
    pub fn emit(&self, mut event: Event) -> Event {
        if event.id.is_empty() {
            event.id = uuid::Uuid::new_v4().simple().to_string();
        }

        {
            let mut history = self.history.write().unwrap();
            history.push_back(event.clone());
            while history.len() > self.history_capacity {
                history.pop_front();
            }
        }

        let subs = self.subscriptions.read().unwrap();
        for sub in subs.iter() {
            if !sub.active || !sub.filter.matches(&event) {
                continue;
            }
            match &sub.delivery {
                Delivery::Callback(cb) => {
                    let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| cb(&event)));
                }
                Delivery::Stream(tx) => {
                    if tx.push(event.clone()) {
                        self.drops.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            event_type = %event.event_type,
                            subscription = sub.id,
                            "stream subscriber queue full, dropping oldest event"
                        );
                    }
                }
            }
        }

        event
    }

    pub fn get_history(&self, filter: Option<&EventFilter>, limit: usize) -> Vec<Event> {
        let history = self.history.read().unwrap();
        history
            .iter()
            .rev()
            .filter(|e| filter.map(|f| f.matches(e)).unwrap_or(true))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn dropped_count(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }
}
