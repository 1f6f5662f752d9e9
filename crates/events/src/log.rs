//! Append-only per-job event log.
//!
//! The `Vec` index under the log's lock is the single ordering point for a
//! job: `append` assigns `index = len` and pushes under the writer lock, so
//! indices are gapless and never reassigned. Subscribers hold their own
//! cursor into the same `Vec`, which is why replay and live delivery can
//! never duplicate or skip an index (see [`Subscription`]).

use std::sync::{Arc, Mutex, RwLock, Weak};

use crate::event::{EventKind, JobEvent};
use crate::keep_alive::KeepAliveHub;
use crate::subscription::{Signal, Subscription};

/// Thread-safe, append-only event sequence.
#[derive(Default)]
pub struct EventLog {
    events: RwLock<Vec<JobEvent>>,
    /// Non-owning references to attached subscribers. Dropped subscribers
    /// unregister themselves; anything missed is pruned on the next append.
    listeners: Mutex<Vec<Weak<Signal>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event and wake every attached subscriber.
    ///
    /// Returns the index assigned to the new event.
    pub fn append(&self, kind: EventKind, payload: impl Into<String>) -> u64 {
        let index = {
            let mut events = self.events.write().unwrap_or_else(|p| p.into_inner());
            let index = events.len() as u64;
            events.push(JobEvent {
                index,
                kind,
                payload: payload.into(),
            });
            index
        };
        self.wake_listeners();
        index
    }

    pub fn len(&self) -> usize {
        self.read_events().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_events().is_empty()
    }

    pub fn get(&self, index: u64) -> Option<JobEvent> {
        self.read_events().get(index as usize).cloned()
    }

    /// Copy of every event with `index >= from`, in index order.
    pub fn events_from(&self, from: u64) -> Vec<JobEvent> {
        let events = self.read_events();
        let start = (from as usize).min(events.len());
        events[start..].to_vec()
    }

    /// Attach a new subscriber that replays from `from_index` and then
    /// follows live events.
    ///
    /// The subscriber is also registered with `hub` so it receives periodic
    /// keep-alive pulses.
    pub fn subscribe(self: &Arc<Self>, from_index: u64, hub: &Arc<KeepAliveHub>) -> Subscription {
        let signal = Arc::new(Signal::default());
        self.lock_listeners().push(Arc::downgrade(&signal));
        hub.register(&signal);
        Subscription::new(Arc::clone(self), Arc::clone(hub), signal, from_index)
    }

    /// Number of subscribers still attached. Prunes dead references.
    pub fn subscriber_count(&self) -> usize {
        let mut listeners = self.lock_listeners();
        listeners.retain(|w| w.strong_count() > 0);
        listeners.len()
    }

    pub(crate) fn unregister(&self, signal: &Arc<Signal>) {
        let target = Arc::as_ptr(signal);
        self.lock_listeners()
            .retain(|w| w.strong_count() > 0 && !std::ptr::eq(w.as_ptr(), target));
    }

    // ---- private helpers ----

    fn wake_listeners(&self) {
        let mut listeners = self.lock_listeners();
        listeners.retain(|weak| match weak.upgrade() {
            Some(signal) => {
                signal.wake();
                true
            }
            None => false,
        });
    }

    fn read_events(&self) -> std::sync::RwLockReadGuard<'_, Vec<JobEvent>> {
        self.events.read().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_listeners(&self) -> std::sync::MutexGuard<'_, Vec<Weak<Signal>>> {
        self.listeners.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
