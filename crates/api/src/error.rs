use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use mp3ify_core::error::CoreError;
use mp3ify_pipeline::ManagerError;
use serde_json::json;

/// Application-level error type for HTTP handlers.
///
/// Implements [`IntoResponse`] to produce `{"error": ..., "code": ...}`
/// JSON bodies.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// A domain-level error from `mp3ify_core`.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// The job engine failed (persistence, shut-down pool).
    #[error(transparent)]
    Manager(#[from] ManagerError),

    #[error("Bad request: {0}")]
    BadRequest(String),

    /// The job exists but is not in a state that allows the request.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::Core(CoreError::NotFound {
            entity: "job",
            id: id.into(),
        })
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::Core(CoreError::NotFound { entity, id }) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                format!("{entity} with id {id} not found"),
            ),

            AppError::Manager(ManagerError::PoolClosed) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "SHUTTING_DOWN",
                "The server is shutting down".to_string(),
            ),
            AppError::Manager(err) => {
                tracing::error!(error = %err, "Job manager error");
                internal()
            }

            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
            AppError::InternalError(msg) => {
                tracing::error!(error = %msg, "Internal error");
                internal()
            }
        };

        let body = json!({
            "error": message,
            "code": code,
        });

        (status, axum::Json(body)).into_response()
    }
}

fn internal() -> (StatusCode, &'static str, String) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "INTERNAL_ERROR",
        "An internal error occurred".to_string(),
    )
}
