//! Conversion job routes.
//!
//! | Method | Path                     | Handler     |
//! |--------|--------------------------|-------------|
//! | POST   | `/mp3ify`                | submit      |
//! | GET    | `/mp3ify`                | list        |
//! | DELETE | `/mp3ify/{id}`           | delete      |
//! | GET    | `/mp3ify/{id}/status`    | status      |
//! | GET    | `/mp3ify/{id}/rawOutput` | raw_output  |
//! | GET    | `/mp3ify/{id}/fileName`  | file_name   |
//! | GET    | `/mp3ify/{id}/download`  | download    |

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get};
use axum::{Json, Router};
use mp3ify_pipeline::{Job, JobStatus};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/mp3ify", get(list).post(submit))
        .route("/mp3ify/{id}", delete(remove))
        .route("/mp3ify/{id}/status", get(status))
        .route("/mp3ify/{id}/rawOutput", get(raw_output))
        .route("/mp3ify/{id}/fileName", get(file_name))
        .route("/mp3ify/{id}/download", get(download))
}

pub(crate) fn find_job(state: &AppState, id: &str) -> AppResult<Arc<Job>> {
    state.manager.get(id).ok_or_else(|| AppError::not_found(id))
}

// ---------------------------------------------------------------------------
// Submit
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct SubmitBody {
    pub video: Option<String>,
}

/// POST /mp3ify -- start (or join) a conversion, returning the job id.
async fn submit(
    State(state): State<AppState>,
    Json(body): Json<SubmitBody>,
) -> AppResult<(StatusCode, Json<String>)> {
    let video = body
        .video
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::BadRequest("video.not.provided".into()))?;

    // Submission writes the durable stores synchronously.
    let manager = Arc::clone(&state.manager);
    let job = tokio::task::spawn_blocking(move || manager.submit(&video))
        .await
        .map_err(|e| AppError::InternalError(e.to_string()))??;

    Ok((StatusCode::CREATED, Json(job.id().to_string())))
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub from: Option<String>,
    pub to: Option<String>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct FinishedJob {
    pub id: String,
    pub name: Option<String>,
}

/// GET /mp3ify -- successful jobs completed in `[from, to)` (epoch millis),
/// newest first. Unparseable bounds are ignored.
async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> AppResult<Json<Vec<FinishedJob>>> {
    let from = query.from.as_deref().and_then(|v| v.trim().parse::<i64>().ok());
    let to = query.to.as_deref().and_then(|v| v.trim().parse::<i64>().ok());

    if from.is_some_and(|f| f < 0) {
        return Err(AppError::BadRequest("from.too.small".into()));
    }
    if let (Some(f), Some(t)) = (from, to) {
        if t < f {
            return Err(AppError::BadRequest("to.too.small".into()));
        }
    }
    let lower = from.unwrap_or(i64::MIN);
    let upper = to.unwrap_or(i64::MAX);

    let mut finished = state.manager.list(|job| {
        job.status == JobStatus::Successful
            && job
                .completed_at
                .is_some_and(|at| (lower..upper).contains(&at.timestamp_millis()))
    });
    finished.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));

    Ok(Json(
        finished
            .into_iter()
            .map(|job| FinishedJob {
                id: job.id,
                name: job.result_name,
            })
            .collect(),
    ))
}

// ---------------------------------------------------------------------------
// Per-job accessors
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// GET /mp3ify/{id}/status
async fn status(State(state): State<AppState>, Path(id): Path<String>) -> AppResult<Json<StatusResponse>> {
    let job = find_job(&state, &id)?;
    let status = job.status();
    let reason = match status {
        JobStatus::Failed => job.failure_reason(),
        _ => None,
    };
    Ok(Json(StatusResponse { status, reason }))
}

/// GET /mp3ify/{id}/rawOutput -- `null` until the job is finished.
async fn raw_output(State(state): State<AppState>, Path(id): Path<String>) -> AppResult<Json<Option<String>>> {
    Ok(Json(find_job(&state, &id)?.raw_output()))
}

/// GET /mp3ify/{id}/fileName -- `null` unless the job succeeded.
async fn file_name(State(state): State<AppState>, Path(id): Path<String>) -> AppResult<Json<Option<String>>> {
    Ok(Json(find_job(&state, &id)?.result_name()))
}

/// DELETE /mp3ify/{id}
async fn remove(State(state): State<AppState>, Path(id): Path<String>) -> AppResult<StatusCode> {
    find_job(&state, &id)?;
    let manager = Arc::clone(&state.manager);
    tokio::task::spawn_blocking(move || manager.delete(&id))
        .await
        .map_err(|e| AppError::InternalError(e.to_string()))??;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Download
// ---------------------------------------------------------------------------

/// GET /mp3ify/{id}/download
async fn download(State(state): State<AppState>, Path(id): Path<String>) -> AppResult<Response> {
    let job = find_job(&state, &id)?;
    match job.status() {
        JobStatus::Successful => {}
        JobStatus::Failed => return Err(AppError::Conflict("conversion.failed".into())),
        other => {
            return Err(AppError::Conflict(format!("conversion.not.finished: {other}")));
        }
    }

    let artifact = state
        .manager
        .result_file(&job)
        .ok_or_else(|| AppError::InternalError(format!("result file missing for job {id}")))?;
    let bytes = tokio::fs::read(&artifact.path)
        .await
        .map_err(|e| AppError::InternalError(e.to_string()))?;

    Ok((
        [
            (header::CONTENT_TYPE, content_type(&artifact.name).to_string()),
            (header::CONTENT_DISPOSITION, content_disposition(&artifact.name)),
        ],
        Body::from(bytes),
    )
        .into_response())
}

fn content_type(file_name: &str) -> &'static str {
    match file_name.rsplit('.').next().map(str::to_ascii_lowercase).as_deref() {
        Some("mp3") => "audio/mpeg",
        Some("m4a") => "audio/mp4",
        Some("ogg") | Some("opus") => "audio/ogg",
        _ => "application/octet-stream",
    }
}

/// `attachment` disposition for `file_name`.
///
/// ASCII names are quoted as-is. Anything else is percent-encoded and sent
/// twice: as a legacy `filename` and as an RFC 5987 `filename*`.
pub fn content_disposition(file_name: &str) -> String {
    if file_name.is_ascii() && !file_name.contains('"') {
        return format!("attachment; filename=\"{file_name}\"");
    }
    let encoded: String = url::form_urlencoded::byte_serialize(file_name.as_bytes())
        .collect::<String>()
        .replace('+', "%20");
    format!("attachment; filename=\"{encoded}\"; filename*=utf-8''{encoded}")
}
