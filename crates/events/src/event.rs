//! Event envelope types.

use serde::{Deserialize, Serialize};

/// The fixed vocabulary of indexed job events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    /// The job moved to a new status; payload is the status name.
    StatusChange,
    /// One complete line of subprocess output.
    OutputLine,
    /// The subprocess emitted a bare `\r` (progress-bar redraw); empty payload.
    CarriageReturn,
}

impl EventKind {
    /// Wire name, identical to the serde representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StatusChange => "status-change",
            Self::OutputLine => "output-line",
            Self::CarriageReturn => "carriage-return",
        }
    }
}

/// One indexed event in a job's log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEvent {
    /// 0-based position in the log; stable forever.
    pub index: u64,
    pub kind: EventKind,
    pub payload: String,
}

/// What a subscriber receives: a real event, or a synthetic keep-alive that
/// carries no index and is never replayed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamItem {
    Event(JobEvent),
    KeepAlive,
}

impl StreamItem {
    pub fn event(&self) -> Option<&JobEvent> {
        match self {
            Self::Event(e) => Some(e),
            Self::KeepAlive => None,
        }
    }

    pub fn is_keep_alive(&self) -> bool {
        matches!(self, Self::KeepAlive)
    }
}
