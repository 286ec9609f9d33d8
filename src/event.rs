//! Lifecycle events and the in-process bus that delivers them.
//!
//! Events are the queue's voice: callers subscribe to learn about adds,
//! per-operation outcomes, and run boundaries. Delivery is synchronous on
//! the emitting thread. A panicking listener is isolated and logged; it
//! never stops the other listeners or the queue.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::model::Operation;
use crate::processor::RunReport;

/// A structured event emitted by the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic per-queue sequence number.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventKind {
    #[serde(rename = "queue:add")]
    QueueAdd { operation: Operation },

    #[serde(rename = "queue:process")]
    QueueProcess { operation: Operation },

    #[serde(rename = "queue:complete")]
    QueueComplete { operation: Operation },

    /// Terminal failure: retry budget spent, or expired before invocation.
    #[serde(rename = "queue:fail")]
    QueueFail {
        operation: Operation,
        error: String,
        expired: bool,
    },

    #[serde(rename = "sync:start")]
    SyncStart { pending: usize },

    #[serde(rename = "sync:complete")]
    SyncComplete { report: RunReport },

    #[serde(rename = "sync:error")]
    SyncError { error: String },
}

impl EventKind {
    pub fn event_type(&self) -> EventType {
        match self {
            EventKind::QueueAdd { .. } => EventType::QueueAdd,
            EventKind::QueueProcess { .. } => EventType::QueueProcess,
            EventKind::QueueComplete { .. } => EventType::QueueComplete,
            EventKind::QueueFail { .. } => EventType::QueueFail,
            EventKind::SyncStart { .. } => EventType::SyncStart,
            EventKind::SyncComplete { .. } => EventType::SyncComplete,
            EventKind::SyncError { .. } => EventType::SyncError,
        }
    }
}

/// Subscription key: which kind of event a listener wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    QueueAdd,
    QueueProcess,
    QueueComplete,
    QueueFail,
    SyncStart,
    SyncComplete,
    SyncError,
}

impl EventType {
    pub const ALL: [EventType; 7] = [
        EventType::QueueAdd,
        EventType::QueueProcess,
        EventType::QueueComplete,
        EventType::QueueFail,
        EventType::SyncStart,
        EventType::SyncComplete,
        EventType::SyncError,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::QueueAdd => "queue:add",
            EventType::QueueProcess => "queue:process",
            EventType::QueueComplete => "queue:complete",
            EventType::QueueFail => "queue:fail",
            EventType::SyncStart => "sync:start",
            EventType::SyncComplete => "sync:complete",
            EventType::SyncError => "sync:error",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

struct Registration {
    id: u64,
    /// `None` receives everything.
    filter: Option<EventType>,
    listener: Listener,
}

#[derive(Default)]
struct BusInner {
    listeners: Mutex<Vec<Registration>>,
    next_id: AtomicU64,
    seq: AtomicU64,
}

impl BusInner {
    fn listeners(&self) -> MutexGuard<'_, Vec<Registration>> {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Typed pub/sub for queue lifecycle events.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to one event type.
    pub fn on<F>(&self, event_type: EventType, listener: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.register(Some(event_type), Arc::new(listener))
    }

    /// Subscribe to every event type.
    pub fn on_any<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.register(None, Arc::new(listener))
    }

    fn register(&self, filter: Option<EventType>, listener: Listener) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners().push(Registration {
            id,
            filter,
            listener,
        });
        Subscription {
            bus: Arc::downgrade(&self.inner),
            id,
        }
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners().len()
    }

    /// Deliver an event to every matching listener and return it.
    ///
    /// Listeners run outside the registry lock, so they may subscribe or
    /// unsubscribe from inside a callback.
    pub fn emit(&self, kind: EventKind) -> Event {
        let event = Event {
            seq: self.inner.seq.fetch_add(1, Ordering::Relaxed) + 1,
            timestamp: Utc::now(),
            kind,
        };
        let event_type = event.kind.event_type();

        let targets: Vec<Listener> = self
            .inner
            .listeners()
            .iter()
            .filter(|r| r.filter.is_none_or(|f| f == event_type))
            .map(|r| Arc::clone(&r.listener))
            .collect();

        debug!(event = %event_type, seq = event.seq, listeners = targets.len(), "emit");

        for listener in targets {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| listener(&event))) {
                warn!(
                    event = %event_type,
                    seq = event.seq,
                    panic = panic_message(panic.as_ref()),
                    "event listener panicked"
                );
            }
        }

        event
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

/// Handle returned by [`EventBus::on`]. Dropping it keeps the listener
/// registered; call [`Subscription::unsubscribe`] to remove it.
#[derive(Debug)]
pub struct Subscription {
    bus: Weak<BusInner>,
    id: u64,
}

impl Subscription {
    /// Remove the listener. Returns false if it was already gone.
    pub fn unsubscribe(self) -> bool {
        let Some(bus) = self.bus.upgrade() else {
            return false;
        };
        let mut listeners = bus.listeners();
        let before = listeners.len();
        listeners.retain(|r| r.id != self.id);
        listeners.len() != before
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
