//! Handle to one running worker process.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{Notify, broadcast, mpsc, oneshot, watch};
use tracing::debug;

use crate::error::BridgeError;

/// Raw bytes read from the worker's stdout in one read call.
pub type OutputChunk = Vec<u8>;

/// Lifecycle state of a worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Starting,
    Running,
    /// `code` is `None` when the process was ended by a signal.
    Exited { code: Option<i32> },
}

impl WorkerStatus {
    pub const fn is_exited(&self) -> bool {
        matches!(self, Self::Exited { .. })
    }

    pub const fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Exited { code } => *code,
            _ => None,
        }
    }
}

/// A line queued for the stdin writer, acknowledged once flushed.
#[derive(Debug)]
pub(crate) struct StdinWrite {
    pub line: String,
    pub ack: oneshot::Sender<io::Result<()>>,
}

/// Ownership wrapper around one worker instance and its three streams.
///
/// Stdin is owned by a writer task fed through a channel; stdout and stderr
/// are fanned out to any number of subscribers. A handle never outlives the
/// process it describes in a usable state: once the process exits the status
/// becomes [`WorkerStatus::Exited`] and writes are refused.
#[derive(Debug)]
pub struct WorkerHandle {
    id: String,
    generation: u64,
    pid: Option<u32>,
    started_at: Instant,
    stdin_tx: mpsc::Sender<StdinWrite>,
    close_stdin: Arc<Notify>,
    output_tx: broadcast::Sender<OutputChunk>,
    diagnostic_tx: broadcast::Sender<String>,
    status_tx: watch::Sender<WorkerStatus>,
    kill_tx: mpsc::Sender<()>,
    exit_requested: AtomicBool,
}

/// Channel ends that stay with the process side of a handle.
pub(crate) struct HandleParts {
    pub stdin_rx: mpsc::Receiver<StdinWrite>,
    pub close_stdin: Arc<Notify>,
    pub output_tx: broadcast::Sender<OutputChunk>,
    pub diagnostic_tx: broadcast::Sender<String>,
    pub kill_rx: mpsc::Receiver<()>,
}

impl WorkerHandle {
    pub(crate) fn new(
        generation: u64,
        pid: Option<u32>,
        output_capacity: usize,
    ) -> (Self, HandleParts) {
        let (stdin_tx, stdin_rx) = mpsc::channel(32);
        let (output_tx, _) = broadcast::channel(output_capacity.max(1));
        let (diagnostic_tx, _) = broadcast::channel(output_capacity.max(1));
        let (status_tx, _) = watch::channel(WorkerStatus::Starting);
        let (kill_tx, kill_rx) = mpsc::channel(1);
        let close_stdin = Arc::new(Notify::new());

        let handle = Self {
            id: uuid::Uuid::new_v4().to_string(),
            generation,
            pid,
            started_at: Instant::now(),
            stdin_tx,
            close_stdin: Arc::clone(&close_stdin),
            output_tx: output_tx.clone(),
            diagnostic_tx: diagnostic_tx.clone(),
            status_tx,
            kill_tx,
            exit_requested: AtomicBool::new(false),
        };
        let parts = HandleParts {
            stdin_rx,
            close_stdin,
            output_tx,
            diagnostic_tx,
            kill_rx,
        };
        (handle, parts)
    }

    /// Unique identifier of this worker instance.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Monotonic spawn counter within the owning supervisor.
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// OS process id, when the platform reports one.
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn status(&self) -> WorkerStatus {
        *self.status_tx.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.status() == WorkerStatus::Running
    }

    /// Running, stdin still open, and not being torn down.
    pub fn is_usable(&self) -> bool {
        self.is_running() && !self.stdin_tx.is_closed() && !self.exit_requested()
    }

    /// Subscribe to raw stdout chunks produced from now on.
    pub fn subscribe_output(&self) -> broadcast::Receiver<OutputChunk> {
        self.output_tx.subscribe()
    }

    /// Subscribe to stderr lines produced from now on.
    pub fn subscribe_diagnostics(&self) -> broadcast::Receiver<String> {
        self.diagnostic_tx.subscribe()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<WorkerStatus> {
        self.status_tx.subscribe()
    }

    /// Number of live stdout subscriptions.
    pub fn output_subscribers(&self) -> usize {
        self.output_tx.receiver_count()
    }

    /// Resolves with the exit code once the process has exited.
    pub async fn exited(&self) -> Option<i32> {
        let mut rx = self.status_tx.subscribe();
        rx.wait_for(WorkerStatus::is_exited)
            .await
            .ok()
            .and_then(|status| status.exit_code())
    }

    /// Queue one line for stdin and wait until it has been flushed.
    pub(crate) async fn write_line(&self, line: String) -> Result<(), BridgeError> {
        if !self.is_running() {
            return Err(BridgeError::unavailable(format!(
                "worker {} is {:?}",
                self.id,
                self.status()
            )));
        }
        let (ack, ack_rx) = oneshot::channel();
        self.stdin_tx
            .send(StdinWrite { line, ack })
            .await
            .map_err(|_| BridgeError::unavailable(format!("worker {} stdin is closed", self.id)))?;
        ack_rx
            .await
            .map_err(|_| {
                BridgeError::unavailable(format!("worker {} stdin writer stopped", self.id))
            })?
            .map_err(|e| {
                BridgeError::unavailable(format!("write to worker {} failed: {e}", self.id))
            })
    }

    pub(crate) fn exit_requested(&self) -> bool {
        self.exit_requested.load(Ordering::Acquire)
    }

    /// Mark the coming exit as intentional so no respawn is scheduled.
    pub(crate) fn request_exit(&self) {
        self.exit_requested.store(true, Ordering::Release);
    }

    /// Close stdin; a well-behaved worker exits on end of input.
    pub(crate) fn close_input(&self) {
        self.request_exit();
        self.close_stdin.notify_one();
    }

    /// Forcibly end the process.
    pub(crate) fn kill(&self) {
        self.request_exit();
        if self.kill_tx.try_send(()).is_err() {
            debug!(worker_id = %self.id, "kill already pending or process gone");
        }
    }

    pub(crate) fn set_status(&self, status: WorkerStatus) {
        self.status_tx.send_replace(status);
    }
}
