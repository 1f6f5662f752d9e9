//! The conversion job state machine.
//!
//! ```text
//! CREATED ──► CONVERTING ──► SUCCESSFUL
//!    │             │
//!    │             └───────► FAILED
//!    ├─────────────────────► SUCCESSFUL   (artifact reuse)
//!    └─────────────────────► FAILED       (setup failure)
//! ```
//!
//! A job is mutated only by the worker executing it. Every transition emits
//! a `status-change` event and is followed by a call to the job's
//! [`JobRecorder`]. Events are only emitted once execution has begun, so a
//! job that fails during construction has an empty log.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard};

use chrono::Utc;
use mp3ify_core::content_key::content_key;
use mp3ify_core::resolver::{SourceId, SourceResolver};
use mp3ify_core::types::{Id, Timestamp};
use mp3ify_db::StoreError;
use mp3ify_events::{EventKind, EventLog};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::artifact::{strip_source_id, ArtifactStore};
use crate::config::ConverterConfig;
use crate::error::JobError;
use crate::output::{LineEvent, OutputCapture};
use crate::process::ProcessRegistry;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Created,
    Converting,
    Successful,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Converting => "CONVERTING",
            Self::Successful => "SUCCESSFUL",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Successful | Self::Failed)
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Created, Converting) | (Created, Successful) | (Created, Failed) | (Converting, Successful) | (Converting, Failed)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Persisted form of a job. The event log is not part of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: Id,
    pub source: String,
    pub source_id: Option<SourceId>,
    pub content_key: Option<String>,
    pub status: JobStatus,
    pub failure_reason: Option<String>,
    pub process_id: Option<Id>,
    pub raw_output: Option<String>,
    pub result_name: Option<String>,
    pub created_at: Timestamp,
    pub completed_at: Option<Timestamp>,
}

// ---------------------------------------------------------------------------
// Execution context
// ---------------------------------------------------------------------------

/// Persists a job after each state change.
pub trait JobRecorder: Send + Sync {
    fn record(&self, job: &Job) -> Result<(), StoreError>;
}

/// Shared collaborators handed to [`Job::execute`].
pub struct JobContext {
    pub registry: Arc<ProcessRegistry>,
    pub artifacts: Arc<ArtifactStore>,
    pub converter: ConverterConfig,
    pub work_dir: PathBuf,
    pub recorder: Arc<dyn JobRecorder>,
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

pub struct Job {
    id: Id,
    source_id: Option<SourceId>,
    content_key: Option<String>,
    record: RwLock<JobSnapshot>,
    events: Arc<EventLog>,
    live: AtomicBool,
    /// Held while the result artifact is moved into place, so a delete
    /// either waits for the move or prevents it.
    deleted: Mutex<bool>,
}

impl Job {
    /// Create a job for `source`.
    ///
    /// If `resolver` does not recognise the source the job is born `FAILED`
    /// with no content key and never emits events.
    pub fn new(id: Id, source: impl Into<String>, resolver: &dyn SourceResolver) -> Self {
        let source = source.into();
        let source_id = resolver.resolve(&source);
        let key = source_id.as_ref().map(content_key);
        let now = Utc::now();

        let (status, failure_reason, completed_at) = match source_id {
            Some(_) => (JobStatus::Created, None, None),
            None => (
                JobStatus::Failed,
                Some(JobError::Unresolved(source.clone()).to_string()),
                Some(now),
            ),
        };

        Self::from_snapshot(JobSnapshot {
            id,
            source,
            source_id,
            content_key: key,
            status,
            failure_reason,
            process_id: None,
            raw_output: None,
            result_name: None,
            created_at: now,
            completed_at,
        })
    }

    /// Rehydrate a persisted job. Its event log starts empty.
    pub fn from_snapshot(snapshot: JobSnapshot) -> Self {
        Self {
            id: snapshot.id.clone(),
            source_id: snapshot.source_id.clone(),
            content_key: snapshot.content_key.clone(),
            record: RwLock::new(snapshot),
            events: Arc::new(EventLog::new()),
            live: AtomicBool::new(false),
            deleted: Mutex::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn source_id(&self) -> Option<&SourceId> {
        self.source_id.as_ref()
    }

    pub fn content_key(&self) -> Option<&str> {
        self.content_key.as_deref()
    }

    pub fn source(&self) -> String {
        self.read().source.clone()
    }

    pub fn status(&self) -> JobStatus {
        self.read().status
    }

    pub fn failure_reason(&self) -> Option<String> {
        self.read().failure_reason.clone()
    }

    pub fn process_id(&self) -> Option<Id> {
        self.read().process_id.clone()
    }

    /// Captured converter output. Only set once the job is terminal.
    pub fn raw_output(&self) -> Option<String> {
        self.read().raw_output.clone()
    }

    pub fn result_name(&self) -> Option<String> {
        self.read().result_name.clone()
    }

    pub fn created_at(&self) -> Timestamp {
        self.read().created_at
    }

    pub fn completed_at(&self) -> Option<Timestamp> {
        self.read().completed_at
    }

    pub fn events(&self) -> &Arc<EventLog> {
        &self.events
    }

    pub fn snapshot(&self) -> JobSnapshot {
        self.read().clone()
    }

    /// Whether execution has begun (events are being emitted).
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    pub fn is_deleted(&self) -> bool {
        *self.deletion()
    }

    /// Flag the job as deleted. Blocks while its artifact is being stored.
    pub(crate) fn mark_deleted(&self) {
        *self.deletion() = true;
    }

    /// Run the conversion to a terminal state.
    ///
    /// Any error is recorded as the failure reason before being returned.
    /// The captured output is attached exactly once, just before the
    /// terminal transition, and the job is recorded again on the way out
    /// whatever the outcome.
    pub async fn execute(self: &Arc<Self>, ctx: &JobContext) -> Result<(), JobError> {
        if self.live.swap(true, Ordering::AcqRel) {
            tracing::warn!(job_id = %self.id, "Job already executed");
            return Ok(());
        }
        if self.status().is_terminal() {
            return Ok(());
        }

        let mut capture = OutputCapture::new();
        let outcome = self.run(ctx, &mut capture).await;
        if let Err(e) = &outcome {
            self.attach_output(&capture);
            self.fail(e.to_string());
        }
        let recorded = self.persist(ctx).await;

        let scratch = ctx.work_dir.join(&self.id);
        if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::debug!(job_id = %self.id, error = %e, "Failed to remove scratch directory");
            }
        }

        outcome?;
        recorded?;
        Ok(())
    }

    async fn run(self: &Arc<Self>, ctx: &JobContext, capture: &mut OutputCapture) -> Result<(), JobError> {
        let (Some(source_id), Some(key)) = (&self.source_id, &self.content_key) else {
            return Err(JobError::Unresolved(self.source()));
        };

        if let Some(artifact) = ctx.artifacts.lookup(key) {
            tracing::info!(job_id = %self.id, content_key = %key, "Reusing existing artifact");
            self.attach_output(capture);
            self.succeed(artifact.name);
            self.persist(ctx).await?;
            return Ok(());
        }

        let work_dir = ctx.work_dir.join(&self.id);
        tokio::fs::create_dir_all(&work_dir).await?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut command = ctx.converter.command(&self.source(), &work_dir);
        let process = ctx.registry.start(move || command.spawn(), tx)?;

        self.write().process_id = Some(process.id().to_string());
        self.transition(JobStatus::Converting);
        self.persist(ctx).await?;
        tracing::info!(job_id = %self.id, process_id = %process.id(), "Conversion started");

        let (exit, ()) = tokio::join!(
            process.wait(),
            capture.drain(&mut rx, |line| self.emit_line(line))
        );
        match exit?.code() {
            Some(0) => {}
            Some(code) => return Err(JobError::ExitCode(code)),
            None => return Err(JobError::Signaled),
        }

        let produced = first_file(&work_dir).await?.ok_or(JobError::MissingArtifact)?;
        let file_name = produced
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let name = strip_source_id(&file_name, &source_id.id);
        if !self.store_artifact(ctx, key, produced, &name).await? {
            tracing::info!(job_id = %self.id, content_key = %key, "Job deleted during conversion, result discarded");
            return Err(JobError::Deleted);
        }

        self.attach_output(capture);
        self.succeed(name);
        self.persist(ctx).await?;
        tracing::info!(job_id = %self.id, content_key = %key, "Conversion succeeded");
        Ok(())
    }

    // ---- persistence ----

    /// Persist the current snapshot through the context's recorder.
    async fn persist(self: &Arc<Self>, ctx: &JobContext) -> Result<(), JobError> {
        let job = Arc::clone(self);
        let recorder = Arc::clone(&ctx.recorder);
        tokio::task::spawn_blocking(move || recorder.record(&job)).await??;
        Ok(())
    }

    /// Move `produced` into the artifact store unless the job has been
    /// deleted. Returns whether it was stored.
    async fn store_artifact(
        self: &Arc<Self>,
        ctx: &JobContext,
        key: &str,
        produced: PathBuf,
        name: &str,
    ) -> Result<bool, JobError> {
        let job = Arc::clone(self);
        let artifacts = Arc::clone(&ctx.artifacts);
        let key = key.to_string();
        let name = name.to_string();
        let stored = tokio::task::spawn_blocking(move || {
            let deleted = job.deletion();
            if *deleted {
                return Ok(false);
            }
            artifacts.store(&key, &produced, &name).map(|_| true)
        })
        .await??;
        Ok(stored)
    }

    // ---- state changes ----

    /// Set the final transcript. Happens before the terminal transition so
    /// anyone observing a terminal status also sees the output.
    fn attach_output(&self, capture: &OutputCapture) {
        let mut record = self.write();
        if record.raw_output.is_some() {
            return;
        }
        if capture.is_truncated() {
            tracing::warn!(job_id = %self.id, "Converter output truncated");
        }
        record.raw_output = Some(capture.transcript());
    }

    fn transition(&self, next: JobStatus) -> bool {
        self.advance(next, |_| {})
    }

    fn succeed(&self, result_name: String) -> bool {
        self.advance(JobStatus::Successful, |r| r.result_name = Some(result_name))
    }

    fn fail(&self, reason: String) -> bool {
        self.advance(JobStatus::Failed, |r| r.failure_reason = Some(reason))
    }

    /// Move to `next` and apply `update` under one lock, then announce it.
    fn advance(&self, next: JobStatus, update: impl FnOnce(&mut JobSnapshot)) -> bool {
        {
            let mut record = self.write();
            if !record.status.can_transition_to(next) {
                tracing::warn!(
                    job_id = %self.id,
                    from = %record.status,
                    to = %next,
                    "Ignoring invalid status transition"
                );
                return false;
            }
            record.status = next;
            if next.is_terminal() {
                record.completed_at = Some(Utc::now());
            }
            update(&mut record);
        }
        self.emit(EventKind::StatusChange, next.as_str());
        true
    }

    fn emit_line(&self, line: LineEvent) {
        match line {
            LineEvent::Line(text) => self.emit(EventKind::OutputLine, text),
            LineEvent::CarriageReturn => self.emit(EventKind::CarriageReturn, ""),
        }
    }

    fn emit(&self, kind: EventKind, payload: impl Into<String>) {
        if self.is_live() {
            self.events.append(kind, payload);
        }
    }

    fn deletion(&self) -> MutexGuard<'_, bool> {
        self.deleted.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn read(&self) -> RwLockReadGuard<'_, JobSnapshot> {
        self.record.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, JobSnapshot> {
        self.record.write().unwrap_or_else(|p| p.into_inner())
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("content_key", &self.content_key)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// First regular file in `dir`, by name.
async fn first_file(dir: &Path) -> std::io::Result<Option<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files.into_iter().next())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
