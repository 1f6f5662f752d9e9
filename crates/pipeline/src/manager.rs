//! Deduplicating job manager.
//!
//! Owns the durable stores, the worker pool, the process registry and the
//! keep-alive hub, and is the only entry point the route layer talks to.
//!
//! Two independent stores are kept:
//!
//! - the primary store (`id -> snapshot`), authoritative for job state;
//! - the resubmission store (`content key -> snapshot`), consulted only to
//!   decide whether a submission can reuse an earlier job.
//!
//! They are not cross-validated on load. [`JobManager::submit`] reconciles
//! them lazily by always re-reading the primary record for whatever job the
//! resubmission store points at.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use mp3ify_core::resolver::SourceResolver;
use mp3ify_core::types::Id;
use mp3ify_core::unique_id::UniqueId;
use mp3ify_db::{DiskMap, StoreError};
use mp3ify_events::{start_keep_alive, KeepAliveHub, Subscription};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::artifact::{Artifact, ArtifactStore};
use crate::config::EngineConfig;
use crate::error::ManagerError;
use crate::job::{Job, JobContext, JobRecorder, JobSnapshot, JobStatus};
use crate::pool::WorkerPool;
use crate::process::{resolve_program, ProcessRegistry};

/// Failure reason given to jobs found unfinished at startup.
pub const INTERRUPTED_REASON: &str = "Error: interrupted by a server restart";

const BACKGROUND_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// JobStores
// ---------------------------------------------------------------------------

/// The primary and resubmission stores, written together.
pub struct JobStores {
    jobs: DiskMap<JobSnapshot>,
    resubmit: DiskMap<JobSnapshot>,
    /// Serialises record/delete so a deleted job is never written back.
    write_lock: Mutex<()>,
}

impl JobStores {
    pub fn open(jobs_path: impl Into<PathBuf>, resubmit_path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        Ok(Self {
            jobs: DiskMap::open(jobs_path)?,
            resubmit: DiskMap::open(resubmit_path)?,
            write_lock: Mutex::new(()),
        })
    }

    pub fn get(&self, id: &str) -> Option<JobSnapshot> {
        self.jobs.get(id)
    }

    pub fn resubmission(&self, content_key: &str) -> Option<JobSnapshot> {
        self.resubmit.get(content_key)
    }

    pub fn snapshot(&self) -> HashMap<Id, JobSnapshot> {
        self.jobs.snapshot()
    }

    /// Remove `id` from the primary store and, when it still points at
    /// this job, its resubmission entry. Returns the removed record.
    pub fn remove(&self, id: &str) -> Result<Option<JobSnapshot>, StoreError> {
        let _guard = self.lock();
        let removed = self.jobs.remove(id)?;
        if let Some(key) = removed.as_ref().and_then(|s| s.content_key.as_deref()) {
            if self.resubmit.get(key).is_some_and(|s| s.id == id) {
                self.resubmit.remove(key)?;
            }
        }
        Ok(removed)
    }

    /// Mark every non-terminal record failed. Returns how many changed.
    fn fail_interrupted(&self) -> Result<usize, StoreError> {
        let _guard = self.lock();
        let mut failed = Vec::new();
        self.jobs.update(|jobs| {
            let now = Utc::now();
            for snapshot in jobs.values_mut().filter(|s| !s.status.is_terminal()) {
                snapshot.status = JobStatus::Failed;
                snapshot.failure_reason = Some(INTERRUPTED_REASON.to_string());
                snapshot.completed_at = Some(now);
                failed.push(snapshot.clone());
            }
            !failed.is_empty()
        })?;

        for snapshot in &failed {
            if let Some(key) = snapshot.content_key.as_deref() {
                if self.resubmit.get(key).is_some_and(|s| s.id == snapshot.id) {
                    self.resubmit.put(key, snapshot.clone())?;
                }
            }
        }
        Ok(failed.len())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl JobRecorder for JobStores {
    fn record(&self, job: &Job) -> Result<(), StoreError> {
        let _guard = self.lock();
        if job.is_deleted() {
            return Ok(());
        }
        let snapshot = job.snapshot();
        if let Some(key) = snapshot.content_key.clone() {
            self.resubmit.put(key, snapshot.clone())?;
        }
        self.jobs.put(snapshot.id.clone(), snapshot)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// JobManager
// ---------------------------------------------------------------------------

pub struct JobManager {
    ids: UniqueId,
    resolver: Box<dyn SourceResolver>,
    stores: Arc<JobStores>,
    artifacts: Arc<ArtifactStore>,
    registry: Arc<ProcessRegistry>,
    hub: Arc<KeepAliveHub>,
    pool: WorkerPool,
    /// Jobs touched by this process, so live event logs are shared.
    live: RwLock<HashMap<Id, Arc<Job>>>,
    /// Held across the whole check-then-submit sequence.
    submit_lock: Mutex<()>,
    cancel: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl JobManager {
    /// Open the stores and start the workers, reaper and keep-alive ticker.
    pub fn start(config: EngineConfig, resolver: Box<dyn SourceResolver>) -> Result<Arc<Self>, ManagerError> {
        std::fs::create_dir_all(&config.data_dir)?;
        std::fs::create_dir_all(&config.work_dir)?;

        let stores = Arc::new(JobStores::open(
            config.jobs_store_path(),
            config.resubmit_store_path(),
        )?);
        let recovered = stores.fail_interrupted()?;
        if recovered > 0 {
            tracing::warn!(count = recovered, "Marked interrupted jobs as failed");
        }

        let artifacts = Arc::new(ArtifactStore::open(&config.result_dir, config.result_names_path())?);

        let mut converter = config.converter.clone();
        match resolve_program(&converter.program) {
            Some(path) => converter.program = path.to_string_lossy().into_owned(),
            None => tracing::warn!(
                program = %converter.program,
                "Converter not found on search path; conversions will fail"
            ),
        }

        let cancel = CancellationToken::new();
        let registry = Arc::new(ProcessRegistry::new());
        let hub = Arc::new(KeepAliveHub::new());
        let background = vec![
            registry.start_reaper(config.reap_interval, cancel.child_token()),
            start_keep_alive(Arc::clone(&hub), config.keep_alive_interval, cancel.child_token()),
        ];

        let ctx = Arc::new(JobContext {
            registry: Arc::clone(&registry),
            artifacts: Arc::clone(&artifacts),
            converter,
            work_dir: config.work_dir.clone(),
            recorder: Arc::clone(&stores) as Arc<dyn JobRecorder>,
        });
        let pool = WorkerPool::start(config.workers, ctx, cancel.child_token());

        tracing::info!(
            data_dir = %config.data_dir.display(),
            result_dir = %config.result_dir.display(),
            workers = config.workers,
            "Job manager started"
        );

        Ok(Arc::new(Self {
            ids: UniqueId::new("job"),
            resolver,
            stores,
            artifacts,
            registry,
            hub,
            pool,
            live: RwLock::new(HashMap::new()),
            submit_lock: Mutex::new(()),
            cancel,
            background: Mutex::new(background),
        }))
    }

    /// Submit `source` for conversion.
    ///
    /// Returns the existing job when one for the same content key is still
    /// live or succeeded. A source that cannot be resolved yields a job that
    /// is already `FAILED` and never reaches the pool.
    pub fn submit(&self, source: &str) -> Result<Arc<Job>, ManagerError> {
        let job = Arc::new(Job::new(self.ids.next(), source, self.resolver.as_ref()));

        let Some(key) = job.content_key().map(str::to_owned) else {
            tracing::warn!(
                job_id = %job.id(),
                source,
                reason = ?job.failure_reason(),
                "Source could not be resolved"
            );
            self.stores.jobs.put(job.id(), job.snapshot())?;
            self.track(&job);
            return Ok(job);
        };

        let _guard = self.submit_lock.lock().unwrap_or_else(|p| p.into_inner());

        if let Some(existing) = self.reusable(&key)? {
            tracing::info!(job_id = %existing.id(), content_key = %key, "Reusing existing job");
            return Ok(existing);
        }

        // A closed pool must leave no record behind. Records snapshot the job
        // under the store lock, so a worker recording first is never
        // overwritten with older state.
        self.track(&job);
        if let Err(e) = self.pool.submit(Arc::clone(&job)) {
            self.untrack(job.id());
            return Err(e);
        }
        self.stores.record(&job)?;
        tracing::info!(job_id = %job.id(), content_key = %key, "Job submitted");
        Ok(job)
    }

    /// The job that a new submission for `content_key` should return, if any.
    ///
    /// Clears the stale artifact when the previous attempt failed or its
    /// record is gone.
    fn reusable(&self, content_key: &str) -> Result<Option<Arc<Job>>, ManagerError> {
        let Some(previous) = self.stores.resubmission(content_key) else {
            return Ok(None);
        };

        match self.stores.get(&previous.id) {
            Some(current) if current.status != JobStatus::Failed => return Ok(Some(self.hydrate(current))),
            Some(_) => {}
            None => tracing::warn!(
                job_id = %previous.id,
                content_key,
                "Resubmission entry points at a missing job"
            ),
        }

        if let Err(e) = self.artifacts.remove(content_key) {
            tracing::warn!(content_key, error = %e, "Failed to remove stale artifact");
        }
        Ok(None)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Job>> {
        let snapshot = self.stores.get(id)?;
        Some(self.hydrate(snapshot))
    }

    /// Remove a job, its resubmission entry and its artifact. Idempotent.
    ///
    /// A running conversion is not stopped; its later updates and its result
    /// file are dropped.
    pub fn delete(&self, id: &str) -> Result<(), ManagerError> {
        if let Some(job) = self.live_job(id) {
            job.mark_deleted();
        }
        let removed = self.stores.remove(id)?;
        self.untrack(id);

        let Some(snapshot) = removed else {
            return Ok(());
        };
        if let Some(key) = snapshot.content_key.as_deref() {
            let superseded = self
                .stores
                .resubmission(key)
                .is_some_and(|s| s.id != snapshot.id);
            if !superseded {
                self.artifacts.remove(key)?;
            }
        }
        tracing::info!(job_id = %id, "Job deleted");
        Ok(())
    }

    /// Point-in-time copies of every stored job matching `predicate`.
    pub fn list(&self, predicate: impl Fn(&JobSnapshot) -> bool) -> Vec<JobSnapshot> {
        self.stores
            .snapshot()
            .into_values()
            .filter(|s| predicate(s))
            .collect()
    }

    /// Persist `job` to both stores.
    pub fn refresh(&self, job: &Job) -> Result<(), ManagerError> {
        self.stores.record(job)?;
        Ok(())
    }

    /// Attach a live subscriber to `job`'s events, replaying from `from_index`.
    pub fn subscribe(&self, job: &Job, from_index: u64) -> Subscription {
        job.events().subscribe(from_index, &self.hub)
    }

    /// The downloadable artifact of a successful job.
    pub fn result_file(&self, job: &Job) -> Option<Artifact> {
        if job.status() != JobStatus::Successful {
            return None;
        }
        self.artifacts.lookup(job.content_key()?)
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    pub fn hub(&self) -> &Arc<KeepAliveHub> {
        &self.hub
    }

    /// Total jobs handed to the worker pool.
    pub fn enqueued(&self) -> u64 {
        self.pool.enqueued()
    }

    /// Stop the workers, the reaper and the keep-alive ticker.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
        self.cancel.cancel();
        let handles: Vec<_> = self
            .background
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            let _ = tokio::time::timeout(BACKGROUND_SHUTDOWN_TIMEOUT, handle).await;
        }
        tracing::info!("Job manager shut down");
    }

    // ---- private helpers ----

    fn track(&self, job: &Arc<Job>) {
        self.live
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(job.id().to_string(), Arc::clone(job));
    }

    fn untrack(&self, id: &str) {
        self.live.write().unwrap_or_else(|p| p.into_inner()).remove(id);
    }

    fn live_job(&self, id: &str) -> Option<Arc<Job>> {
        self.live.read().unwrap_or_else(|p| p.into_inner()).get(id).cloned()
    }

    /// The in-process job for `snapshot`, rehydrating it if this process
    /// has not seen it yet.
    fn hydrate(&self, snapshot: JobSnapshot) -> Arc<Job> {
        let mut live = self.live.write().unwrap_or_else(|p| p.into_inner());
        Arc::clone(
            live.entry(snapshot.id.clone())
                .or_insert_with(|| Arc::new(Job::from_snapshot(snapshot))),
        )
    }
}

impl std::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManager")
            .field("workers", &self.pool.size())
            .field("enqueued", &self.pool.enqueued())
            .finish_non_exhaustive()
    }
}
