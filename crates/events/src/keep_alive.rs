//! Periodic keep-alive pulses for live subscribers.
//!
//! Intermediaries (proxies, gzip layers) may buffer a quiet stream
//! indefinitely. The ticker forces a synthetic item into every subscriber's
//! output on a fixed cadence so the connection is flushed and does not look
//! stalled.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::subscription::Signal;

/// Default interval between keep-alive pulses.
pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// Registry of every live subscriber across all jobs.
///
/// Holds only weak references; a subscriber that is dropped without
/// unregistering is pruned on the next pulse.
#[derive(Default)]
pub struct KeepAliveHub {
    subscribers: Mutex<Vec<Weak<Signal>>>,
}

impl KeepAliveHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, signal: &Arc<Signal>) {
        self.lock().push(Arc::downgrade(signal));
    }

    pub(crate) fn unregister(&self, signal: &Arc<Signal>) {
        let target = Arc::as_ptr(signal);
        self.lock()
            .retain(|w| w.strong_count() > 0 && !std::ptr::eq(w.as_ptr(), target));
    }

    /// Queue a keep-alive for every live subscriber and prune dead ones.
    ///
    /// Returns the number of subscribers pulsed.
    pub fn pulse_all(&self) -> usize {
        let mut subscribers = self.lock();
        subscribers.retain(|weak| match weak.upgrade() {
            Some(signal) => {
                signal.request_keep_alive();
                true
            }
            None => false,
        });
        subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.lock();
        subscribers.retain(|w| w.strong_count() > 0);
        subscribers.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Weak<Signal>>> {
        self.subscribers.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Spawn the keep-alive ticker.
///
/// Pulses every subscriber registered with `hub` once per `interval` until
/// `cancel` fires. The first pulse happens one full interval after start.
pub fn start_keep_alive(
    hub: Arc<KeepAliveHub>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Keep-alive ticker stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let count = hub.pulse_all();
                    tracing::trace!(count, "Keep-alive pulse");
                }
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
