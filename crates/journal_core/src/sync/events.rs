//! Sync lifecycle events and the per-orchestrator event bus.
//!
//! # Invariants
//! - Listeners are invoked outside the listener lock, so a listener may
//!   subscribe or unsubscribe while handling an event.
//! - Dropping a `Subscription` does not unsubscribe; call `unsubscribe()`.

use crate::model::queued_record::LocalId;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

/// Summary of one sync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub attempted: usize,
    pub synced: usize,
    pub failed: usize,
    /// Records discarded or taken over by a manual retry mid-pass.
    pub skipped_records: usize,
    /// Another pass was already running and `force` was not set.
    pub skipped: bool,
}

/// Lifecycle event published by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    Queued {
        local_id: LocalId,
    },
    SyncStarted {
        pending: usize,
    },
    EntrySynced {
        local_id: LocalId,
        remote_id: String,
    },
    EntryFailed {
        local_id: LocalId,
        error: String,
        retry_count: u32,
        /// Retry cap reached; the record now waits for manual action.
        exhausted: bool,
    },
    SyncCompleted {
        report: SyncReport,
    },
    EntryDiscarded {
        local_id: LocalId,
    },
}

impl SyncEvent {
    /// Wire name of the event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Queued { .. } => "queued",
            Self::SyncStarted { .. } => "sync_started",
            Self::EntrySynced { .. } => "entry_synced",
            Self::EntryFailed { .. } => "entry_failed",
            Self::SyncCompleted { .. } => "sync_completed",
            Self::EntryDiscarded { .. } => "entry_discarded",
        }
    }
}

type Listener = Arc<dyn Fn(&SyncEvent) + Send + Sync>;
type ListenerList = Mutex<Vec<(u64, Listener)>>;

/// Fan-out of sync events to registered listeners.
#[derive(Default)]
pub struct EventBus {
    listeners: Arc<ListenerList>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: impl Fn(&SyncEvent) + Send + Sync + 'static) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));
        Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    pub fn emit(&self, event: &SyncEvent) {
        let snapshot: Vec<Listener> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in snapshot {
            listener(event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Handle returned by `EventBus::subscribe`.
#[must_use = "keep the subscription to be able to unsubscribe"]
pub struct Subscription {
    id: u64,
    listeners: Weak<ListenerList>,
}

impl Subscription {
    /// Removes the listener. A no-op once the bus is gone.
    pub fn unsubscribe(self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{EventBus, SyncEvent};
    use std::sync::{Arc, Mutex};
    use uuid::Uuid;

    #[test]
    fn unsubscribed_listener_stops_receiving() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let subscription = bus.subscribe(move |event| {
            sink.lock().unwrap().push(event.event_type());
        });

        bus.emit(&SyncEvent::SyncStarted { pending: 1 });
        subscription.unsubscribe();
        bus.emit(&SyncEvent::EntryDiscarded {
            local_id: Uuid::new_v4(),
        });

        assert_eq!(*seen.lock().unwrap(), vec!["sync_started"]);
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn independent_buses_do_not_share_listeners() {
        let first = EventBus::new();
        let second = EventBus::new();
        let _subscription = first.subscribe(|_| {});
        assert_eq!(first.listener_count(), 1);
        assert_eq!(second.listener_count(), 0);
    }
}
