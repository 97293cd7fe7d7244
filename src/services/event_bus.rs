//! Event bus for multicasting domain events.
//!
//! Each subscription owns an unbounded channel, so a slow consumer never
//! blocks `emit`; handlers run on the subscriber's own task. The bus keeps
//! a bounded history ring for late joiners and diagnostics.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::domain::models::event::{Event, EventKind, EventPayload};

/// Configuration for the event bus.
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// How many emitted events the history ring retains.
    pub history_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            history_capacity: 1000,
        }
    }
}

/// Which events a subscription receives.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Matched kinds; empty matches every event.
    kinds: Vec<EventKind>,
}

impl EventFilter {
    /// Match every event.
    pub fn all() -> Self {
        Self::default()
    }

    /// Match one specific kind.
    pub fn kind(kind: EventKind) -> Self {
        Self { kinds: vec![kind] }
    }

    /// Match a set of kinds.
    pub fn kinds(kinds: impl IntoIterator<Item = EventKind>) -> Self {
        Self {
            kinds: kinds.into_iter().collect(),
        }
    }

    pub fn matches(&self, event: &Event) -> bool {
        self.kinds.is_empty() || self.kinds.contains(&event.kind())
    }
}

/// Handle identifying a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct SubscriberEntry {
    id: SubscriptionId,
    filter: EventFilter,
    tx: mpsc::UnboundedSender<Event>,
}

struct BusState {
    subscribers: Vec<SubscriberEntry>,
    history: VecDeque<Event>,
    closed: bool,
}

/// A live subscription. Events arrive via [`recv`](Subscription::recv);
/// the channel closing is the bus's terminal signal. Dropping the
/// subscription unsubscribes it.
pub struct Subscription {
    id: SubscriptionId,
    rx: mpsc::UnboundedReceiver<Event>,
    state: Weak<Mutex<BusState>>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Receive the next matching event; `None` after the bus completes.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Non-blocking receive for tests and polling consumers.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(state) = self.state.upgrade() {
            let mut state = lock(&state);
            state.subscribers.retain(|entry| entry.id != self.id);
        }
    }
}

/// Process-wide multicaster of domain events.
pub struct EventBus {
    state: Arc<Mutex<BusState>>,
    next_subscription: AtomicU64,
    config: EventBusConfig,
}

fn lock(state: &Mutex<BusState>) -> MutexGuard<'_, BusState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl EventBus {
    pub fn new(config: EventBusConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(BusState {
                subscribers: Vec::new(),
                history: VecDeque::new(),
                closed: false,
            })),
            next_subscription: AtomicU64::new(0),
            config,
        }
    }

    /// Emit an event to every matching subscriber and record it in history.
    ///
    /// Sends happen under the state lock so all subscribers observe a single
    /// total order; the sends are channel pushes and never block. Handler
    /// execution happens on each subscriber's task.
    pub fn emit(&self, payload: EventPayload) {
        let mut state = lock(&self.state);
        if state.closed {
            warn!(kind = %payload.kind(), "event bus completed; dropping emit");
            return;
        }

        // Timestamped under the lock, so delivery order agrees with
        // timestamp order for every subscriber.
        let event = Event::new(payload);
        trace!(kind = %event.kind(), "emitting event");
        if state.history.len() >= self.config.history_capacity {
            state.history.pop_front();
        }
        state.history.push_back(event.clone());

        for entry in &state.subscribers {
            if entry.filter.matches(&event) {
                // A dropped receiver is cleaned up lazily by Subscription::drop.
                let _ = entry.tx.send(event.clone());
            }
        }
    }

    /// Register a subscriber for events matching `filter`.
    ///
    /// Only events emitted after subscription are delivered; use
    /// [`recent`](Self::recent) for history.
    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();

        let mut state = lock(&self.state);
        if state.closed {
            // Completed bus: hand back an already-terminated subscription.
            drop(tx);
        } else {
            state.subscribers.push(SubscriberEntry { id, filter, tx });
        }
        drop(state);

        debug!(subscription = id.0, "event bus subscription added");
        Subscription {
            id,
            rx,
            state: Arc::downgrade(&self.state),
        }
    }

    /// Remove a subscription. Idempotent.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut state = lock(&self.state);
        let before = state.subscribers.len();
        state.subscribers.retain(|entry| entry.id != id);
        before != state.subscribers.len()
    }

    /// Up to the last `n` events, optionally filtered by kind, newest last.
    pub fn recent(&self, n: usize, kind: Option<EventKind>) -> Vec<Event> {
        let state = lock(&self.state);
        let matching: Vec<Event> = state
            .history
            .iter()
            .filter(|event| kind.is_none_or(|k| event.kind() == k))
            .cloned()
            .collect();
        let skip = matching.len().saturating_sub(n);
        matching.into_iter().skip(skip).collect()
    }

    /// Reject further emits, close every subscription, clear history.
    pub fn complete(&self) {
        let mut state = lock(&self.state);
        state.closed = true;
        state.subscribers.clear();
        state.history.clear();
        debug!("event bus completed");
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.state).subscribers.len()
    }

    pub fn history_len(&self) -> usize {
        lock(&self.state).history.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EventBusConfig::default())
    }
}
