//! Server-Sent Events stream of a job's events.
//!
//! Each event is sent with `id` = sequence index and `event` = kind name.
//! Keep-alives go out as SSE comments so they never consume an id. A client
//! reconnecting with `Last-Event-ID: n` resumes at index `n + 1`.

use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, Sse};
use axum::routing::get;
use axum::Router;
use futures::{Stream, StreamExt};
use mp3ify_events::{parse_resume_cursor, StreamItem};

use crate::error::AppResult;
use crate::routes::mp3ify::find_job;
use crate::state::AppState;

const LAST_EVENT_ID: &str = "last-event-id";

pub fn router() -> Router<AppState> {
    Router::new().route("/mp3ify/{id}/stream", get(stream))
}

/// GET /mp3ify/{id}/stream
async fn stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> AppResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let job = find_job(&state, &id)?;
    let last_event_id = headers.get(LAST_EVENT_ID).and_then(|v| v.to_str().ok());
    let from = parse_resume_cursor(last_event_id);

    tracing::debug!(job_id = %id, from, "Event stream opened");
    let events = state
        .manager
        .subscribe(&job, from)
        .into_stream()
        .take_until(state.shutdown.clone().cancelled_owned())
        .map(|item| Ok(to_sse(item)));

    Ok(Sse::new(events))
}

fn to_sse(item: StreamItem) -> Event {
    match item {
        StreamItem::Event(event) => Event::default()
            .id(event.index.to_string())
            .event(event.kind.as_str())
            .data(event.payload),
        StreamItem::KeepAlive => Event::default().comment("keep-alive"),
    }
}
