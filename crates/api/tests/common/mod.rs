use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, Response};
use axum::Router;
use http_body_util::BodyExt;
use mp3ify_api::state::AppState;
use mp3ify_core::resolver::{SourceId, SourceResolver};
use mp3ify_pipeline::{ConverterConfig, EngineConfig, JobManager};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

/// Script that writes `Song-<source>.mp3` into the scratch directory.
pub const CONVERT_OK: &str = "echo converting; echo audio > \"Song-$1.mp3\"";

/// Resolves every source except those starting with `B`.
pub struct LetterResolver;

impl SourceResolver for LetterResolver {
    fn resolve(&self, source: &str) -> Option<SourceId> {
        (!source.starts_with('B')).then(|| SourceId::new("test", source))
    }
}

/// Start a job manager rooted at `root` whose converter runs `script` under
/// `sh -c`, with the source reference as `$1`.
pub fn start_manager(root: &Path, script: &str) -> Arc<JobManager> {
    let mut config = EngineConfig::rooted_at(
        root,
        ConverterConfig::new("sh", ["-c", script, "sh", "{source}"]),
    );
    config.reap_interval = Duration::from_millis(20);
    config.keep_alive_interval = Duration::from_millis(200);
    JobManager::start(config, Box::new(LetterResolver)).expect("manager starts")
}

/// Build the application router over `manager`, the same way `main.rs` does.
pub fn build_test_app(manager: Arc<JobManager>) -> Router {
    mp3ify_api::build_app(AppState {
        manager,
        shutdown: CancellationToken::new(),
    })
}

pub async fn get(app: Router, uri: &str) -> Response<Body> {
    send(app, Method::GET, uri, Body::empty()).await
}

pub async fn delete(app: Router, uri: &str) -> Response<Body> {
    send(app, Method::DELETE, uri, Body::empty()).await
}

pub async fn post_json(app: Router, uri: &str, json: serde_json::Value) -> Response<Body> {
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(json.to_string()))
        .unwrap();
    app.oneshot(request).await.unwrap()
}

async fn send(app: Router, method: Method, uri: &str, body: Body) -> Response<Body> {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .body(body)
        .unwrap();
    app.oneshot(request).await.unwrap()
}

pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes()
        .to_vec()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

/// Poll `GET /mp3ify/{id}/status` until it reports `expected`.
pub async fn wait_status(app: &Router, id: &str, expected: &str) {
    let uri = format!("/mp3ify/{id}/status");
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let json = body_json(get(app.clone(), &uri).await).await;
            if json["status"] == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("job {id} should reach {expected}"));
}
