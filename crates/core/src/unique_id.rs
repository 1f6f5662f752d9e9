//! Collision-resistant, lexically sortable identifiers.
//!
//! An id is `<prefix><timestamp><counter><random>`, each numeric part
//! rendered as 16 zero-padded hex digits. The timestamp comes from a
//! monotonic clock anchored to wall time at construction, so ids from one
//! generator sort in creation order and ids across restarts still sort
//! roughly chronologically. The counter disambiguates calls that observe
//! the same clock reading on coarse-resolution platforms.

use std::sync::Mutex;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::types::Id;

/// Width of every hex-encoded segment.
const SEGMENT_WIDTH: usize = 16;

#[derive(Debug, Default)]
struct ClockState {
    last_timestamp: u64,
    same_timestamp_count: u64,
}

/// Thread-safe identifier generator with a fixed namespace prefix.
#[derive(Debug)]
pub struct UniqueId {
    prefix: String,
    wall_anchor_nanos: u64,
    monotonic_anchor: Instant,
    state: Mutex<ClockState>,
}

impl UniqueId {
    pub fn new(prefix: impl Into<String>) -> Self {
        let wall_anchor_nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        Self {
            prefix: prefix.into(),
            wall_anchor_nanos,
            monotonic_anchor: Instant::now(),
            state: Mutex::new(ClockState::default()),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn timestamp(&self) -> u64 {
        self.wall_anchor_nanos
            .wrapping_add(self.monotonic_anchor.elapsed().as_nanos() as u64)
    }

    /// Produce the next identifier. Never returns the same value twice.
    pub fn next(&self) -> Id {
        // A poisoned lock only means another caller panicked mid-update; the
        // counters are still usable.
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        // Read under the lock so timestamps are handed out in lock order.
        let ts = self.timestamp();
        if ts == state.last_timestamp {
            state.same_timestamp_count += 1;
        } else {
            state.same_timestamp_count = 0;
            state.last_timestamp = ts;
        }
        format!(
            "{}{:0w$x}{:0w$x}{:0w$x}",
            self.prefix,
            ts,
            state.same_timestamp_count,
            rand::random::<u64>(),
            w = SEGMENT_WIDTH,
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
