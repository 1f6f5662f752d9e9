//! Fixed-size worker pool.
//!
//! `size` long-lived tasks share one unbounded queue. Each job runs start
//! to finish on the worker that dequeued it. Execution errors have already
//! been recorded on the job; the pool only logs them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::error::ManagerError;
use crate::job::{Job, JobContext};

/// How long `shutdown` waits for each worker to finish its current job.
const WORKER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

type JobQueue = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Arc<Job>>>>;

pub struct WorkerPool {
    sender: mpsc::UnboundedSender<Arc<Job>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    enqueued: AtomicU64,
    size: usize,
    cancel: CancellationToken,
}

impl WorkerPool {
    /// Spawn `size` workers executing jobs against `ctx`.
    pub fn start(size: usize, ctx: Arc<JobContext>, cancel: CancellationToken) -> Self {
        let size = size.max(1);
        let (sender, receiver) = mpsc::unbounded_channel();
        let queue: JobQueue = Arc::new(tokio::sync::Mutex::new(receiver));

        let workers = (0..size)
            .map(|worker| {
                tokio::spawn(worker_loop(
                    worker,
                    Arc::clone(&queue),
                    Arc::clone(&ctx),
                    cancel.clone(),
                ))
            })
            .collect();

        tracing::info!(size, "Worker pool started");
        Self {
            sender,
            workers: Mutex::new(workers),
            enqueued: AtomicU64::new(0),
            size,
            cancel,
        }
    }

    pub fn submit(&self, job: Arc<Job>) -> Result<(), ManagerError> {
        if self.cancel.is_cancelled() {
            return Err(ManagerError::PoolClosed);
        }
        self.sender.send(job).map_err(|_| ManagerError::PoolClosed)?;
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Total jobs ever enqueued.
    pub fn enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Stop taking new jobs and wait briefly for workers to wind down.
    ///
    /// Running conversions are not interrupted; a worker still busy after
    /// the timeout is left to finish in the background.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
            .collect();
        for handle in workers {
            if tokio::time::timeout(WORKER_SHUTDOWN_TIMEOUT, handle).await.is_err() {
                tracing::warn!("Worker still busy at shutdown, detaching");
            }
        }
        tracing::info!("Worker pool shut down");
    }
}

async fn worker_loop(worker: usize, queue: JobQueue, ctx: Arc<JobContext>, cancel: CancellationToken) {
    loop {
        let job = {
            let mut queue = queue.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = queue.recv() => match next {
                    Some(job) => job,
                    None => break,
                },
            }
        };

        let span = tracing::info_span!("job", job_id = %job.id(), worker);
        if let Err(e) = job.execute(&ctx).instrument(span).await {
            tracing::error!(job_id = %job.id(), worker, error = %e, "Job failed");
        }
    }
    tracing::debug!(worker, "Worker stopped");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
