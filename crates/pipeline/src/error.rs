use mp3ify_db::StoreError;

use crate::process::ProcessError;

/// Why a job's execution failed.
///
/// The display text becomes the job's failure reason.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Error: could not resolve source {0:?}")]
    Unresolved(String),

    #[error("Error: {0}")]
    Process(#[from] ProcessError),

    #[error("Bad exit code {0}")]
    ExitCode(i32),

    #[error("Converter terminated by signal")]
    Signaled,

    #[error("Error: converter exited cleanly but produced no file")]
    MissingArtifact,

    #[error("Error: I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("Error: persistence failure: {0}")]
    Store(#[from] StoreError),

    #[error("Error: job was deleted during conversion")]
    Deleted,

    #[error("Error: blocking task failed: {0}")]
    Blocking(#[from] tokio::task::JoinError),
}

/// Errors surfaced by [`JobManager`](crate::manager::JobManager).
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("worker pool is shut down")]
    PoolClosed,
}
