//! A single observer's view of an [`EventLog`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::Stream;
use tokio::sync::Notify;

use crate::event::{JobEvent, StreamItem};
use crate::keep_alive::KeepAliveHub;
use crate::log::EventLog;

/// Wake-up channel shared between a subscriber and its broadcasters.
///
/// `Notify::notify_one` stores a permit when nobody is waiting, so an append
/// that races with a subscriber's "caught up" check is never lost.
#[derive(Default)]
pub(crate) struct Signal {
    notify: Notify,
    keep_alive_pending: AtomicBool,
}

impl Signal {
    pub(crate) fn wake(&self) {
        self.notify.notify_one();
    }

    pub(crate) fn request_keep_alive(&self) {
        self.keep_alive_pending.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    fn take_keep_alive(&self) -> bool {
        self.keep_alive_pending.swap(false, Ordering::AcqRel)
    }
}

/// Replay-then-follow cursor over one job's events.
///
/// Yields every event with `index >= from_index` in order, then blocks until
/// new events arrive, forever. A [`StreamItem::KeepAlive`] follows every
/// real event and is also injected whenever the keep-alive ticker fires.
///
/// Replay and live delivery read the same log through a private cursor, so
/// each index is delivered exactly once and in order even when events are
/// appended during replay.
///
/// Dropping the subscription detaches it from the log and the hub.
pub struct Subscription {
    log: Arc<EventLog>,
    hub: Arc<KeepAliveHub>,
    signal: Arc<Signal>,
    cursor: u64,
    buffered: VecDeque<JobEvent>,
    pulse_owed: bool,
}

impl Subscription {
    pub(crate) fn new(
        log: Arc<EventLog>,
        hub: Arc<KeepAliveHub>,
        signal: Arc<Signal>,
        from_index: u64,
    ) -> Self {
        Self {
            log,
            hub,
            signal,
            cursor: from_index,
            buffered: VecDeque::new(),
            pulse_owed: false,
        }
    }

    /// Index of the next event this subscriber will receive.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Wait for the next item.
    pub async fn next(&mut self) -> StreamItem {
        loop {
            if self.pulse_owed {
                self.pulse_owed = false;
                return StreamItem::KeepAlive;
            }

            if let Some(event) = self.buffered.pop_front() {
                self.cursor = event.index + 1;
                self.pulse_owed = true;
                return StreamItem::Event(event);
            }

            let fresh = self.log.events_from(self.cursor);
            if !fresh.is_empty() {
                self.buffered.extend(fresh);
                continue;
            }

            if self.signal.take_keep_alive() {
                return StreamItem::KeepAlive;
            }

            self.signal.notify.notified().await;
        }
    }

    /// Adapt into a never-ending [`Stream`]. Drop the stream to disconnect.
    pub fn into_stream(self) -> impl Stream<Item = StreamItem> + Send + 'static {
        futures::stream::unfold(self, |mut sub| async move {
            let item = sub.next().await;
            Some((item, sub))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.log.unregister(&self.signal);
        self.hub.unregister(&self.signal);
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("cursor", &self.cursor)
            .field("buffered", &self.buffered.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
