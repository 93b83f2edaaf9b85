//! In-memory stand-in for a worker process.
//!
//! [`WorkerHarness`] owns the process side of a detached [`WorkerHandle`]:
//! tests read the lines the bridge writes, push stdout chunks and decide when
//! the "process" exits, all without spawning anything.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};

use super::handle::{HandleParts, OutputChunk, StdinWrite, WorkerHandle, WorkerStatus};

/// Process side of a detached worker handle.
pub struct WorkerHarness {
    handle: Arc<WorkerHandle>,
    stdin_rx: Option<mpsc::Receiver<StdinWrite>>,
    output_tx: broadcast::Sender<OutputChunk>,
    diagnostic_tx: broadcast::Sender<String>,
}

impl WorkerHarness {
    /// Create a running handle backed by this harness.
    pub fn new(generation: u64) -> (Arc<WorkerHandle>, Self) {
        let (handle, parts) = WorkerHandle::new(generation, None, 64);
        let HandleParts {
            stdin_rx,
            output_tx,
            diagnostic_tx,
            ..
        } = parts;
        handle.set_status(WorkerStatus::Running);
        let handle = Arc::new(handle);
        let harness = Self {
            handle: Arc::clone(&handle),
            stdin_rx: Some(stdin_rx),
            output_tx,
            diagnostic_tx,
        };
        (handle, harness)
    }

    /// Wait for the next line written to stdin and acknowledge it.
    pub async fn next_line(&mut self) -> Option<String> {
        let StdinWrite { line, ack } = self.stdin_rx.as_mut()?.recv().await?;
        let _ = ack.send(Ok(()));
        Some(line)
    }

    /// Take a line if one is already queued.
    pub fn try_next_line(&mut self) -> Option<String> {
        let StdinWrite { line, ack } = self.stdin_rx.as_mut()?.try_recv().ok()?;
        let _ = ack.send(Ok(()));
        Some(line)
    }

    /// Push a stdout chunk to every subscriber.
    pub fn emit(&self, chunk: &str) {
        let _ = self.output_tx.send(chunk.as_bytes().to_vec());
    }

    /// Push a stderr line to every subscriber.
    pub fn emit_diagnostic(&self, line: &str) {
        let _ = self.diagnostic_tx.send(line.to_string());
    }

    /// Simulate the process ending with `code`.
    pub fn exit(&self, code: Option<i32>) {
        self.handle.set_status(WorkerStatus::Exited { code });
    }

    /// Simulate the stdin pipe breaking.
    pub fn close_stdin(&mut self) {
        self.stdin_rx = None;
    }
}
