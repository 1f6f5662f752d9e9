//! Shared domain types for the mp3ify conversion engine.
//!
//! Pure logic with no I/O: identifier generation, content-key derivation
//! and source resolution. Everything that touches disk or subprocesses
//! lives in the `db` and `pipeline` crates.

pub mod content_key;
pub mod error;
pub mod resolver;
pub mod types;
pub mod unique_id;
