//! mp3ify HTTP server library.
//!
//! A thin axum adapter over [`mp3ify_pipeline::JobManager`]. Exposed as a
//! library so integration tests and the binary entrypoint share the same
//! router.

pub mod config;
pub mod error;
pub mod routes;
pub mod state;

use axum::Router;
use tower_http::trace::TraceLayer;

use state::AppState;

/// Build the full application router with tracing and shared state.
pub fn build_app(state: AppState) -> Router {
    Router::new()
        .merge(routes::health::router())
        .merge(routes::mp3ify::router())
        .merge(routes::stream::router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
