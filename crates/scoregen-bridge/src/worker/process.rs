//! Spawning the worker executable and pumping its pipes.
//!
//! Each worker gets three tasks: a stdin writer draining the handle's queue,
//! a stdout reader broadcasting raw chunks, and a stderr reader logging and
//! broadcasting diagnostic lines. [`WorkerProcess`] keeps the child itself
//! and is consumed by whoever monitors the exit.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Notify, broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use scoregen_core::config::WorkerConfig;

use super::handle::{HandleParts, OutputChunk, StdinWrite, WorkerHandle, WorkerStatus};
use crate::error::BridgeError;

const READ_CHUNK: usize = 8 * 1024;

/// Grace period for the readers to hit end of file after the process exits.
/// A grandchild holding the pipe open must not stall exit handling.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Process side of a spawned worker.
pub struct WorkerProcess {
    child: Child,
    kill_rx: mpsc::Receiver<()>,
    readers: Vec<JoinHandle<()>>,
}

/// Spawn the configured worker executable with all three streams piped.
///
/// The returned handle is already [`WorkerStatus::Running`]; there is no
/// readiness handshake with the worker.
pub fn spawn_worker(
    config: &WorkerConfig,
    generation: u64,
) -> Result<(Arc<WorkerHandle>, WorkerProcess), BridgeError> {
    let mut cmd = Command::new(&config.bin);
    cmd.args(&config.args)
        .envs(&config.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &config.working_directory {
        cmd.current_dir(dir);
    }

    info!(
        bin = %config.bin.display(),
        args = ?config.args,
        generation,
        "Spawning worker"
    );
    let mut child = cmd.spawn().map_err(|source| BridgeError::Spawn {
        bin: config.bin.clone(),
        source,
    })?;

    let (handle, parts) = WorkerHandle::new(generation, child.id(), config.output_capacity);
    let HandleParts {
        stdin_rx,
        close_stdin,
        output_tx,
        diagnostic_tx,
        kill_rx,
    } = parts;
    let worker_id = handle.id().to_string();

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| BridgeError::unavailable("Failed to capture stdin"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| BridgeError::unavailable("Failed to capture stdout"))?;
    let stderr = child.stderr.take();

    tokio::spawn(write_stdin(worker_id.clone(), stdin, stdin_rx, close_stdin));

    let mut readers = vec![tokio::spawn(read_stdout(worker_id.clone(), stdout, output_tx))];
    if let Some(stderr) = stderr {
        readers.push(tokio::spawn(read_stderr(worker_id.clone(), stderr, diagnostic_tx)));
    }

    handle.set_status(WorkerStatus::Running);
    info!(worker_id, generation, pid = ?handle.pid(), "Worker running");

    Ok((
        Arc::new(handle),
        WorkerProcess {
            child,
            kill_rx,
            readers,
        },
    ))
}

impl WorkerProcess {
    /// Wait for the process to end (or kill it on request), drain its output
    /// and mark the handle exited. Returns the exit code.
    pub async fn wait(mut self, handle: &WorkerHandle) -> Option<i32> {
        let status = tokio::select! {
            status = self.child.wait() => status,
            Some(()) = self.kill_rx.recv() => {
                info!(worker_id = %handle.id(), "Killing worker");
                if let Err(e) = self.child.start_kill() {
                    warn!(worker_id = %handle.id(), error = %e, "Failed to signal worker");
                }
                self.child.wait().await
            }
        };

        for reader in &mut self.readers {
            if tokio::time::timeout(DRAIN_TIMEOUT, reader).await.is_err() {
                warn!(worker_id = %handle.id(), "Worker output still open after exit");
            }
        }

        let code = match status {
            Ok(status) => status.code(),
            Err(e) => {
                error!(worker_id = %handle.id(), error = %e, "Failed to wait for worker");
                None
            }
        };
        handle.set_status(WorkerStatus::Exited { code });
        info!(
            worker_id = %handle.id(),
            generation = handle.generation(),
            code = ?code,
            uptime_ms = u64::try_from(handle.uptime().as_millis()).unwrap_or(u64::MAX),
            "Worker exited"
        );
        code
    }
}

async fn write_stdin(
    worker_id: String,
    mut stdin: ChildStdin,
    mut rx: mpsc::Receiver<StdinWrite>,
    close: Arc<Notify>,
) {
    loop {
        tokio::select! {
            biased;
            () = close.notified() => {
                debug!(worker_id, "Closing worker stdin");
                break;
            }
            msg = rx.recv() => {
                let Some(StdinWrite { line, ack }) = msg else { break };
                let result = write_line(&mut stdin, &line).await;
                let failed = result.is_err();
                if let Err(e) = &result {
                    error!(worker_id, error = %e, "Failed to write to worker stdin");
                }
                let _ = ack.send(result);
                if failed {
                    break;
                }
            }
        }
    }
    debug!(worker_id, "stdin writer finished");
}

async fn write_line(stdin: &mut ChildStdin, line: &str) -> std::io::Result<()> {
    stdin.write_all(line.as_bytes()).await?;
    stdin.flush().await
}

async fn read_stdout(
    worker_id: String,
    mut stdout: impl tokio::io::AsyncRead + Unpin,
    tx: broadcast::Sender<OutputChunk>,
) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let chunk = buf[..n].to_vec();
                debug!(
                    worker_id,
                    bytes = n,
                    "stdout: {}",
                    String::from_utf8_lossy(&chunk).trim_end()
                );
                // No subscribers simply means nobody is waiting on a request.
                let _ = tx.send(chunk);
            }
            Err(e) => {
                warn!(worker_id, error = %e, "Failed to read worker stdout");
                break;
            }
        }
    }
    debug!(worker_id, "stdout reader finished");
}

async fn read_stderr(
    worker_id: String,
    stderr: impl tokio::io::AsyncRead + Unpin,
    tx: broadcast::Sender<String>,
) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        warn!(worker_id, "stderr: {}", line);
        let _ = tx.send(line);
    }
    debug!(worker_id, "stderr reader finished");
}

#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn sh(script: &str) -> WorkerConfig {
        WorkerConfig {
            bin: PathBuf::from("/bin/sh"),
            args: vec!["-c".into(), script.into()],
            ..WorkerConfig::default()
        }
    }

    #[tokio::test]
    async fn spawned_worker_echoes_and_exits_on_stdin_close() {
        let config = sh("while read l; do echo \"got $l\"; done");
        let (handle, process) = spawn_worker(&config, 1).unwrap();
        assert!(handle.is_usable());
        let mut output = handle.subscribe_output();

        handle.write_line("ping {}\n".into()).await.unwrap();
        let chunk = output.recv().await.unwrap();
        assert_eq!(String::from_utf8(chunk).unwrap(), "got ping {}\n");

        handle.close_input();
        assert_eq!(process.wait(&handle).await, Some(0));
        assert!(handle.status().is_exited());
    }

    #[tokio::test]
    async fn stderr_lines_are_broadcast() {
        let config = sh("read l; echo \"Unknown command: $l\" >&2");
        let (handle, process) = spawn_worker(&config, 1).unwrap();
        let mut diagnostics = handle.subscribe_diagnostics();
        handle.write_line("bogus\n".into()).await.unwrap();
        assert_eq!(diagnostics.recv().await.unwrap(), "Unknown command: bogus");
        process.wait(&handle).await;
    }

    #[tokio::test]
    async fn kill_ends_a_stuck_worker() {
        let (handle, process) = spawn_worker(&sh("sleep 30"), 1).unwrap();
        handle.kill();
        assert_eq!(process.wait(&handle).await, None);
        assert_eq!(handle.status(), WorkerStatus::Exited { code: None });
    }

    #[tokio::test]
    async fn configured_env_reaches_worker() {
        let mut config = sh("read l; echo \"model=$SCOREGEN_MODEL\"");
        config.env.insert("SCOREGEN_MODEL".into(), "piano".into());
        let (handle, process) = spawn_worker(&config, 1).unwrap();
        let mut output = handle.subscribe_output();
        handle.write_line("go\n".into()).await.unwrap();
        let chunk = output.recv().await.unwrap();
        assert_eq!(String::from_utf8(chunk).unwrap(), "model=piano\n");
        process.wait(&handle).await;
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let config = WorkerConfig {
            bin: PathBuf::from("/nonexistent/ScoreGen"),
            ..WorkerConfig::default()
        };
        let err = spawn_worker(&config, 1).err().unwrap();
        assert!(matches!(err, BridgeError::Spawn { .. }));
    }
}
