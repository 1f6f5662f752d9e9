//! Durable key-value storage for mp3ify.
//!
//! [`DiskMap`] keeps a full in-memory copy of a string-keyed map and writes
//! the whole map back to a JSON file on every mutation, before the writer
//! lock is released. A successful `put`/`remove` therefore survives a crash
//! that happens immediately afterwards.
//!
//! The full-file rewrite is a deliberate scalability ceiling: it is fine
//! for tens to low hundreds of records.

pub mod disk_map;

pub use disk_map::{DiskMap, StoreError};
