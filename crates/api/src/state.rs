use std::sync::Arc;

use mp3ify_pipeline::JobManager;
use tokio_util::sync::CancellationToken;

/// Shared application state available to all Axum handlers via `State<AppState>`.
#[derive(Clone)]
pub struct AppState {
    /// The conversion engine.
    pub manager: Arc<JobManager>,
    /// Cancelled when the server starts shutting down; ends open event
    /// streams so graceful shutdown can complete.
    pub shutdown: CancellationToken,
}
