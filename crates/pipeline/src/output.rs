//! Converter output capture.
//!
//! Turns the raw stdout/stderr chunks of a conversion into line events and
//! a bounded raw transcript. Each pipe gets its own line buffer so
//! interleaved writes from the two streams never splice into one line.
//!
//! Terminators:
//!
//! | Byte | Emits                                 |
//! |------|---------------------------------------|
//! | `\n` | [`LineEvent::Line`]                   |
//! | `\r` | [`LineEvent::Line`] then [`LineEvent::CarriageReturn`] |
//!
//! Bytes are decoded as UTF-8 with invalid sequences replaced.

use crate::process::{OutputChunk, OutputReceiver, OutputStream};

/// Cap on retained raw output (10 MiB). Lines are still emitted as events
/// past the cap; only the transcript stops growing.
pub const MAX_RAW_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

/// A unit of line-oriented output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineEvent {
    Line(String),
    CarriageReturn,
}

// ---------------------------------------------------------------------------
// LineSplitter
// ---------------------------------------------------------------------------

/// Incremental splitter for one byte stream.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8], emit: &mut impl FnMut(LineEvent)) {
        for &byte in bytes {
            match byte {
                b'\n' => emit(LineEvent::Line(self.take_line())),
                b'\r' => {
                    emit(LineEvent::Line(self.take_line()));
                    emit(LineEvent::CarriageReturn);
                }
                other => self.pending.push(other),
            }
        }
    }

    /// Flush an unterminated trailing line, if any.
    pub fn finish(&mut self, emit: &mut impl FnMut(LineEvent)) {
        if !self.pending.is_empty() {
            emit(LineEvent::Line(self.take_line()));
        }
    }

    fn take_line(&mut self) -> String {
        let bytes = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

// ---------------------------------------------------------------------------
// OutputCapture
// ---------------------------------------------------------------------------

/// Accumulates a conversion's output from both pipes.
#[derive(Debug, Default)]
pub struct OutputCapture {
    raw: Vec<u8>,
    truncated: bool,
    stdout: LineSplitter,
    stderr: LineSplitter,
}

impl OutputCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one chunk: append to the transcript and emit its lines.
    pub fn accept(&mut self, chunk: &OutputChunk, emit: &mut impl FnMut(LineEvent)) {
        let room = MAX_RAW_OUTPUT_BYTES.saturating_sub(self.raw.len());
        if chunk.bytes.len() > room {
            self.truncated = true;
        }
        self.raw
            .extend_from_slice(&chunk.bytes[..chunk.bytes.len().min(room)]);

        match chunk.stream {
            OutputStream::Stdout => self.stdout.push(&chunk.bytes, emit),
            OutputStream::Stderr => self.stderr.push(&chunk.bytes, emit),
        }
    }

    /// Consume `rx` until both pipes close, then flush trailing partial lines.
    pub async fn drain(&mut self, rx: &mut OutputReceiver, mut emit: impl FnMut(LineEvent)) {
        while let Some(chunk) = rx.recv().await {
            self.accept(&chunk, &mut emit);
        }
        self.stdout.finish(&mut emit);
        self.stderr.finish(&mut emit);
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// The transcript decoded as text.
    pub fn transcript(&self) -> String {
        String::from_utf8_lossy(&self.raw).into_owned()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
