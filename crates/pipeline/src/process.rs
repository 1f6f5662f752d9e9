//! Subprocess registry.
//!
//! [`ProcessRegistry`] starts child processes, tracks them under generated
//! ids, and streams their stdout/stderr into a caller-supplied channel. A
//! background reaper drops entries for processes that have exited so the
//! registry does not grow without bound. Lookups of reaped ids simply
//! return `None`.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use mp3ify_core::types::Id;
use mp3ify_core::unique_id::UniqueId;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Default interval between reaper sweeps.
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_millis(100);

/// Read buffer size for output pipes.
const PIPE_CHUNK_BYTES: usize = 8 * 1024;

/// Errors from starting or waiting on a subprocess.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("failed to wait for process {id}: {message}")]
    Wait { id: Id, message: String },
}

// ---------------------------------------------------------------------------
// Output plumbing
// ---------------------------------------------------------------------------

/// Which pipe a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// A raw slice of subprocess output.
#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub bytes: Vec<u8>,
}

/// Receiving end of a process's combined output. The channel closes once
/// both pipes have reached end-of-file.
pub type OutputReceiver = mpsc::UnboundedReceiver<OutputChunk>;
pub type OutputSender = mpsc::UnboundedSender<OutputChunk>;

// ---------------------------------------------------------------------------
// ProcessHandle
// ---------------------------------------------------------------------------

type ExitSlot = Option<Result<ExitStatus, String>>;

/// A tracked subprocess.
///
/// The child itself is owned by a waiter task; the handle observes its exit
/// through a watch channel, so any number of callers may wait concurrently.
#[derive(Debug)]
pub struct ProcessHandle {
    id: Id,
    pid: Option<u32>,
    exit: watch::Receiver<ExitSlot>,
}

impl ProcessHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// OS process id, if the child was still running when registered.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// Block until the process exits.
    pub async fn wait(&self) -> Result<ExitStatus, ProcessError> {
        let mut rx = self.exit.clone();
        let slot = rx.wait_for(Option::is_some).await.map_err(|_| ProcessError::Wait {
            id: self.id.clone(),
            message: "exit watcher dropped".to_string(),
        })?;
        match slot.as_ref() {
            Some(Ok(status)) => Ok(*status),
            Some(Err(message)) => Err(ProcessError::Wait {
                id: self.id.clone(),
                message: message.clone(),
            }),
            None => Err(ProcessError::Wait {
                id: self.id.clone(),
                message: "exit status missing".to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// ProcessRegistry
// ---------------------------------------------------------------------------

/// Tracks running subprocesses by generated id.
pub struct ProcessRegistry {
    ids: UniqueId,
    processes: RwLock<HashMap<Id, Arc<ProcessHandle>>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self {
            ids: UniqueId::new("process"),
            processes: RwLock::new(HashMap::new()),
        }
    }

    /// Spawn a process via `constructor` and register it.
    ///
    /// The constructor is expected to configure piped stdout/stderr; any
    /// pipe it leaves unconfigured is simply not copied. Both pipes are
    /// copied into `sink` on background tasks, and `sink` is closed once
    /// both reach end-of-file.
    pub fn start<F>(&self, constructor: F, sink: OutputSender) -> Result<Arc<ProcessHandle>, ProcessError>
    where
        F: FnOnce() -> std::io::Result<Child>,
    {
        let mut child = constructor().map_err(ProcessError::Spawn)?;
        let id = self.ids.next();
        let pid = child.id();

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(copy_pipe(stdout, OutputStream::Stdout, sink.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(copy_pipe(stderr, OutputStream::Stderr, sink.clone()));
        }
        drop(sink);

        let (exit_tx, exit_rx) = watch::channel(None);
        let waiter_id = id.clone();
        tokio::spawn(async move {
            let result = child.wait().await.map_err(|e| e.to_string());
            match &result {
                Ok(status) => {
                    tracing::debug!(process_id = %waiter_id, code = ?status.code(), "Process exited")
                }
                Err(e) => tracing::warn!(process_id = %waiter_id, error = %e, "Failed to wait for process"),
            }
            let _ = exit_tx.send(Some(result));
        });

        let handle = Arc::new(ProcessHandle {
            id: id.clone(),
            pid,
            exit: exit_rx,
        });
        self.processes
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id.clone(), Arc::clone(&handle));

        tracing::debug!(process_id = %id, pid = ?pid, "Process started");
        Ok(handle)
    }

    pub fn get(&self, id: &str) -> Option<Arc<ProcessHandle>> {
        self.processes
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.processes.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry whose process has exited. Returns how many were removed.
    pub fn reap(&self) -> usize {
        let mut processes = self.processes.write().unwrap_or_else(|p| p.into_inner());
        let before = processes.len();
        processes.retain(|_, handle| !handle.has_exited());
        before - processes.len()
    }

    /// Spawn the reaper loop, sweeping every `interval` until `cancel` fires.
    pub fn start_reaper(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let reaped = registry.reap();
                        if reaped > 0 {
                            tracing::trace!(reaped, "Reaped exited processes");
                        }
                    }
                }
            }
        })
    }
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Copy one pipe into the sink until EOF, a read error, or the receiver
/// going away.
async fn copy_pipe<R: AsyncRead + Unpin>(mut pipe: R, stream: OutputStream, sink: OutputSender) {
    let mut buf = vec![0u8; PIPE_CHUNK_BYTES];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let chunk = OutputChunk {
                    stream,
                    bytes: buf[..n].to_vec(),
                };
                if sink.send(chunk).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(?stream, error = %e, "Output pipe read failed");
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Program resolution
// ---------------------------------------------------------------------------

/// Find `program` on the process search path (`PATH`), also trying every
/// executable suffix listed in `PATHEXT`.
pub fn resolve_program(program: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH").unwrap_or_default();
    let pathext = std::env::var_os("PATHEXT").unwrap_or_default();
    resolve_program_in(program, &path, &pathext)
}

/// [`resolve_program`] against explicit search-path values.
///
/// Candidates are the bare name first, then the name with each suffix. A
/// `program` that already contains a directory component is checked as-is.
pub fn resolve_program_in(program: &str, path: &OsStr, pathext: &OsStr) -> Option<PathBuf> {
    let as_path = Path::new(program);
    if as_path.components().count() > 1 {
        return as_path.is_file().then(|| as_path.to_path_buf());
    }

    let suffixes: Vec<String> = std::iter::once(String::new())
        .chain(
            std::env::split_paths(pathext)
                .map(|s| s.to_string_lossy().into_owned())
                .filter(|s| !s.is_empty()),
        )
        .collect();

    std::env::split_paths(path)
        .filter(|dir| !dir.as_os_str().is_empty() && dir.is_dir())
        .flat_map(|dir| {
            suffixes
                .iter()
                .map(move |suffix| dir.join(format!("{program}{suffix}")))
        })
        .find(|candidate| candidate.is_file())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::process::Stdio;

    use super::*;

    fn sh(script: &str) -> impl FnOnce() -> std::io::Result<Child> + '_ {
        move || {
            tokio::process::Command::new("sh")
                .arg("-c")
                .arg(script)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
        }
    }

    async fn collect(mut rx: OutputReceiver) -> (Vec<u8>, Vec<u8>) {
        let (mut out, mut err) = (Vec::new(), Vec::new());
        while let Some(chunk) = rx.recv().await {
            match chunk.stream {
                OutputStream::Stdout => out.extend(chunk.bytes),
                OutputStream::Stderr => err.extend(chunk.bytes),
            }
        }
        (out, err)
    }

    #[tokio::test]
    async fn start_copies_both_pipes_and_closes_sink() {
        let registry = ProcessRegistry::new();
        let (tx, rx) = mpsc::unbounded_channel();

        let handle = registry
            .start(sh("echo out; echo err 1>&2"), tx)
            .expect("start");
        let status = handle.wait().await.expect("wait");
        let (out, err) = collect(rx).await;

        assert!(status.success());
        assert_eq!(out, b"out\n");
        assert_eq!(err, b"err\n");
    }

    #[tokio::test]
    async fn exit_code_is_reported() {
        let registry = ProcessRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        let handle = registry.start(sh("exit 3"), tx).expect("start");
        let status = handle.wait().await.expect("wait");

        assert_eq!(status.code(), Some(3));
        assert!(handle.has_exited());
    }

    #[tokio::test]
    async fn spawn_failure_is_an_error() {
        let registry = ProcessRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        let result = registry.start(
            || tokio::process::Command::new("/nonexistent/mp3ify-converter").spawn(),
            tx,
        );

        assert!(matches!(result, Err(ProcessError::Spawn(_))));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn reap_drops_exited_processes_only() {
        let registry = ProcessRegistry::new();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();

        let done = registry.start(sh("true"), tx1).expect("start");
        let running = registry.start(sh("sleep 5"), tx2).expect("start");
        done.wait().await.expect("wait");

        assert_eq!(registry.reap(), 1);
        assert!(registry.get(done.id()).is_none());
        assert!(registry.get(running.id()).is_some());
    }

    #[tokio::test]
    async fn reaper_task_cleans_up_in_background() {
        let registry = Arc::new(ProcessRegistry::new());
        let cancel = CancellationToken::new();
        let reaper = registry.start_reaper(Duration::from_millis(10), cancel.clone());

        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = registry.start(sh("true"), tx).expect("start");
        handle.wait().await.expect("wait");

        tokio::time::timeout(Duration::from_secs(2), async {
            while registry.get(handle.id()).is_some() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("reaper should remove the exited process");

        cancel.cancel();
        reaper.await.expect("reaper panicked");
    }

    #[test]
    fn resolve_finds_program_in_search_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let exe = dir.path().join("converter");
        std::fs::write(&exe, b"").expect("write");

        let path = std::env::join_paths([Path::new("/nonexistent-dir"), dir.path()]).expect("join");
        let found = resolve_program_in("converter", &path, OsStr::new(""));

        assert_eq!(found, Some(exe));
    }

    #[test]
    fn resolve_tries_every_suffix_candidate() {
        let dir = tempfile::tempdir().expect("tempdir");
        let exe = dir.path().join("converter.cmd");
        std::fs::write(&exe, b"").expect("write");

        let path = std::env::join_paths([dir.path()]).expect("join");
        let pathext = std::env::join_paths([".exe", ".cmd"]).expect("join");

        assert_eq!(resolve_program_in("converter", &path, &pathext), Some(exe));
        assert_eq!(resolve_program_in("missing", &path, &pathext), None);
    }

    #[test]
    fn resolve_accepts_explicit_paths() {
        let dir = tempfile::tempdir().expect("tempdir");
        let exe = dir.path().join("converter");
        std::fs::write(&exe, b"").expect("write");

        let found = resolve_program_in(exe.to_str().expect("utf-8"), OsStr::new(""), OsStr::new(""));
        assert_eq!(found, Some(exe));
    }
}
