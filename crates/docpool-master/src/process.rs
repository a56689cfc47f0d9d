//! Process Manager
//!
//! Owns the live worker set. The controller never touches OS processes
//! directly: it requests spawns and terminations through the
//! [`ProcessManager`] trait and observes their completions later as
//! [`PoolEvent`]s, which keeps the reconciler testable without forking
//! real processes.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

/// Worker identity within the master process. Ids are monotonic spawn
/// ordinals, so ascending id order is spawn order — the stable enumeration
/// order the reconciler's tail-selection relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// One-way worker-bound license notice: one JSON object per line on the
/// worker's stdin. Workers parse this and update their license-gated
/// behavior; what they do with it is their business.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseNotice {
    pub data: String,
}

/// Lifecycle events observed from the worker set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolEvent {
    /// A requested spawn completed; the worker is live.
    Joined(WorkerId),
    /// A worker process exited.
    Exited(WorkerId),
}

/// The controller's window onto the worker fleet.
///
/// Spawn and terminate are fire-and-forget: failures are logged by the
/// implementation and surface later as a missing `Joined` or an `Exited`
/// event, never as a synchronous error.
pub trait ProcessManager {
    /// Request one more worker. Completion is observed as `PoolEvent::Joined`.
    fn request_spawn(&mut self);

    /// Request termination of a specific worker. No-op for ids that are
    /// already dead or unknown (idempotent).
    fn request_terminate(&mut self, id: WorkerId);

    /// Live workers in stable spawn order.
    fn live_workers(&self) -> Vec<WorkerId>;

    /// Best-effort one-way license notice to a single worker. A worker that
    /// dies mid-delivery is simply dropped; no retry.
    fn send_license(&mut self, id: WorkerId, tier: &str);

    /// Drain joined/exited events observed since the last poll.
    fn poll_events(&mut self) -> Vec<PoolEvent>;
}

/// A single worker child process.
struct WorkerProcess {
    child: Child,
    /// Piped stdin carrying license notices; `None` if the pipe was lost.
    stdin: Option<ChildStdin>,
}

/// OS-process implementation of [`ProcessManager`].
///
/// Workers are child processes of the master running the (out-of-scope)
/// request-serving logic. Their stdout/stderr are forwarded line-by-line to
/// the master's log, tagged with the worker id. Exits are detected by a
/// `try_wait` sweep each time events are polled.
pub struct ClusterManager {
    worker_cmd: PathBuf,
    worker_args: Vec<String>,
    next_id: u64,
    workers: BTreeMap<WorkerId, WorkerProcess>,
    pending: Vec<PoolEvent>,
}

impl ClusterManager {
    pub fn new(worker_cmd: PathBuf, worker_args: Vec<String>) -> Self {
        Self {
            worker_cmd,
            worker_args,
            next_id: 0,
            workers: BTreeMap::new(),
            pending: Vec::new(),
        }
    }

    /// Kill every live worker. Called on master shutdown.
    pub fn terminate_all(&mut self) {
        for (id, worker) in self.workers.iter_mut() {
            debug!("stopping {}", id);
            if let Err(e) = worker.child.kill() {
                warn!("failed to stop {}: {}", id, e);
            }
        }
    }

    /// Reap exited children and queue `Exited` events for them.
    fn sweep_exits(&mut self) {
        let mut exited = Vec::new();

        for (id, worker) in self.workers.iter_mut() {
            match worker.child.try_wait() {
                Ok(Some(status)) => {
                    warn!("{} exited with status {}", id, status);
                    exited.push(*id);
                }
                Ok(None) => {}
                Err(e) => {
                    // Treat an unpollable child as gone; the reconciler
                    // will backfill it.
                    error!("failed to poll {}: {}", id, e);
                    exited.push(*id);
                }
            }
        }

        for id in exited {
            self.workers.remove(&id);
            self.pending.push(PoolEvent::Exited(id));
        }
    }

    /// Forward a child's pipe to the master log, one line at a time.
    fn forward_output(id: WorkerId, reader: impl std::io::Read + Send + 'static, is_stderr: bool) {
        let reader = BufReader::new(reader);
        std::thread::spawn(move || {
            for line in reader.lines() {
                match line {
                    Ok(line) if is_stderr => warn!("[{}] {}", id, line),
                    Ok(line) => info!("[{}] {}", id, line),
                    Err(_) => break,
                }
            }
        });
    }
}

impl ProcessManager for ClusterManager {
    fn request_spawn(&mut self) {
        let id = WorkerId(self.next_id);
        self.next_id += 1;

        let spawned = Command::new(&self.worker_cmd)
            .args(&self.worker_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                // Surfaces as reduced capacity, not as a crash; the next
                // reconciliation pass will try again.
                error!(
                    "failed to spawn {} from {}: {}",
                    id,
                    self.worker_cmd.display(),
                    e
                );
                return;
            }
        };

        if let Some(stdout) = child.stdout.take() {
            Self::forward_output(id, stdout, false);
        }
        if let Some(stderr) = child.stderr.take() {
            Self::forward_output(id, stderr, true);
        }
        let stdin = child.stdin.take();

        debug!("{} spawned (pid {})", id, child.id());
        self.workers.insert(id, WorkerProcess { child, stdin });
        self.pending.push(PoolEvent::Joined(id));
    }

    fn request_terminate(&mut self, id: WorkerId) {
        match self.workers.get_mut(&id) {
            Some(worker) => {
                if let Err(e) = worker.child.kill() {
                    // Already dead: the sweep will reap it.
                    debug!("terminate {}: {}", id, e);
                }
            }
            None => debug!("terminate {}: already gone", id),
        }
    }

    fn live_workers(&self) -> Vec<WorkerId> {
        self.workers.keys().copied().collect()
    }

    fn send_license(&mut self, id: WorkerId, tier: &str) {
        let Some(worker) = self.workers.get_mut(&id) else {
            debug!("license notice for {} dropped: not live", id);
            return;
        };
        let Some(stdin) = worker.stdin.as_mut() else {
            debug!("license notice for {} dropped: no stdin pipe", id);
            return;
        };

        let notice = LicenseNotice {
            data: tier.to_string(),
        };
        let line = match serde_json::to_string(&notice) {
            Ok(line) => line,
            Err(e) => {
                error!("failed to encode license notice: {}", e);
                return;
            }
        };

        if let Err(e) = writeln!(stdin, "{}", line) {
            // Best effort: the worker is dying or dead, no retry.
            debug!("license notice for {} dropped: {}", id, e);
            worker.stdin = None;
        }
    }

    fn poll_events(&mut self) -> Vec<PoolEvent> {
        self.sweep_exits();
        std::mem::take(&mut self.pending)
    }
}

impl Drop for ClusterManager {
    fn drop(&mut self) {
        self.terminate_all();
    }
}
