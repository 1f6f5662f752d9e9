//! Conversion job engine.
//!
//! - [`process`]: subprocess registry, pipe copying and the reaper.
//! - [`output`]: line splitting and transcript capture.
//! - [`job`]: the per-job state machine.
//! - [`artifact`]: content-addressed result storage.
//! - [`pool`]: fixed-size worker pool.
//! - [`manager`]: deduplicating submission front door over all of the above.

pub mod artifact;
pub mod config;
pub mod error;
pub mod job;
pub mod manager;
pub mod output;
pub mod pool;
pub mod process;

pub use config::{ConverterConfig, EngineConfig};
pub use error::{JobError, ManagerError};
pub use job::{Job, JobSnapshot, JobStatus};
pub use manager::JobManager;
