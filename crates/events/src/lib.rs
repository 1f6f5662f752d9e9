//! Per-job event logs with replayable, live-tailing subscribers.
//!
//! - [`EventLog`] -- append-only gapless event sequence owned
//!   by one job.
//! - [`Subscription`] -- one observer's cursor into a log: replays from an
//!   arbitrary index, then follows new events, interleaving keep-alive
//!   pulses.
//! - [`KeepAliveHub`] / [`start_keep_alive`] -- periodic keep-alive pulses
//!   for every live subscriber, pruning abandoned ones.
//! - [`parse_resume_cursor`] -- turns a client's last-seen id into a replay
//!   start index.

pub mod cursor;
pub mod event;
pub mod keep_alive;
pub mod log;
pub mod subscription;

pub use cursor::parse_resume_cursor;
pub use event::{EventKind, JobEvent, StreamItem};
pub use keep_alive::{start_keep_alive, KeepAliveHub, DEFAULT_KEEP_ALIVE_INTERVAL};
pub use log::EventLog;
pub use subscription::Subscription;
