//! Worker process supervisor.
//!
//! Keeps at most one worker alive, hands out the current handle through
//! [`Supervisor::ensure_running`], and respawns the worker after an
//! unexpected exit. Spawn failures are surfaced and never retried on a timer:
//! a binary that cannot be launched will not start launching by itself.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

use scoregen_core::config::{RespawnConfig, WorkerConfig};

use crate::error::BridgeError;
use crate::worker::{WorkerHandle, WorkerProcess, WorkerStatus, spawn_worker};

/// Backoff applied between crash and respawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RespawnPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// A worker that ran at least this long resets the backoff.
    pub stable_after: Duration,
}

impl Default for RespawnPolicy {
    fn default() -> Self {
        Self::from(&RespawnConfig::default())
    }
}

impl From<&RespawnConfig> for RespawnPolicy {
    fn from(config: &RespawnConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms.max(config.initial_delay_ms)),
            stable_after: Duration::from_millis(config.stable_after_ms),
        }
    }
}

impl RespawnPolicy {
    /// Delay before respawn number `crashes` in an unbroken crash streak.
    pub fn delay(&self, crashes: u32) -> Duration {
        let doublings = crashes.saturating_sub(1).min(16);
        self.initial_delay
            .saturating_mul(1 << doublings)
            .min(self.max_delay)
    }
}

/// Point-in-time view of the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorStats {
    /// Successful spawns, including respawns.
    pub spawns: u64,
    /// Spawns triggered by the crash monitor.
    pub restarts: u64,
    pub worker_id: Option<String>,
    pub generation: Option<u64>,
    pub pid: Option<u32>,
    pub status: Option<WorkerStatus>,
    /// Unexpected exits in the current streak of short-lived workers.
    pub crash_streak: u32,
    /// Delay chosen before the most recent respawn.
    pub last_respawn_delay: Option<Duration>,
}

/// Owns the worker lifecycle. Cheap to clone; clones share one worker.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

struct Inner {
    config: WorkerConfig,
    policy: RespawnPolicy,
    current: Mutex<Option<Arc<WorkerHandle>>>,
    generation: AtomicU64,
    spawns: AtomicU64,
    restarts: AtomicU64,
    backoff: Mutex<Backoff>,
    shutdown: watch::Sender<bool>,
}

#[derive(Debug, Default)]
struct Backoff {
    crash_streak: u32,
    last_delay: Option<Duration>,
}

impl Backoff {
    /// Record an unexpected exit after `uptime` and pick the respawn delay.
    fn record_crash(&mut self, policy: &RespawnPolicy, uptime: Duration) -> Duration {
        self.crash_streak = if uptime >= policy.stable_after {
            1
        } else {
            self.crash_streak.saturating_add(1)
        };
        let delay = policy.delay(self.crash_streak);
        self.last_delay = Some(delay);
        delay
    }
}

impl Supervisor {
    pub fn new(config: WorkerConfig, policy: RespawnPolicy) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config,
                policy,
                current: Mutex::new(None),
                generation: AtomicU64::new(0),
                spawns: AtomicU64::new(0),
                restarts: AtomicU64::new(0),
                backoff: Mutex::new(Backoff::default()),
                shutdown,
            }),
        }
    }

    /// Return the current worker if it accepts input, otherwise start a new
    /// one and return that.
    pub async fn ensure_running(&self) -> Result<Arc<WorkerHandle>, BridgeError> {
        let mut current = self.inner.current.lock().await;
        if self.inner.is_shut_down() {
            return Err(BridgeError::unavailable("supervisor has been shut down"));
        }
        if let Some(handle) = current.as_ref()
            && handle.is_usable()
        {
            return Ok(Arc::clone(handle));
        }
        self.inner.start_locked(&mut current)
    }

    /// Spawn a new worker unconditionally, retiring the current one.
    pub async fn start(&self) -> Result<Arc<WorkerHandle>, BridgeError> {
        let mut current = self.inner.current.lock().await;
        if self.inner.is_shut_down() {
            return Err(BridgeError::unavailable("supervisor has been shut down"));
        }
        self.inner.start_locked(&mut current)
    }

    /// The held handle, without starting anything.
    pub async fn current(&self) -> Option<Arc<WorkerHandle>> {
        self.inner.current.lock().await.clone()
    }

    /// Stop handing out `handle`; the next [`ensure_running`] spawns afresh.
    ///
    /// [`ensure_running`]: Self::ensure_running
    pub async fn invalidate(&self, handle: &WorkerHandle) {
        let current = self.inner.current.lock().await;
        if current.as_ref().is_some_and(|h| h.id() == handle.id()) {
            warn!(worker_id = %handle.id(), "Invalidating worker");
            handle.kill();
        }
    }

    /// Forcibly end the current worker. No respawn is scheduled for it.
    ///
    /// Returns whether a live worker was signaled.
    pub async fn kill(&self) -> bool {
        let current = self.inner.current.lock().await;
        match current.as_ref() {
            Some(handle) if !handle.status().is_exited() => {
                info!(worker_id = %handle.id(), "Killing worker on request");
                handle.kill();
                true
            }
            _ => false,
        }
    }

    /// Stop respawning, close the worker's stdin and wait for it to exit,
    /// killing it if it outlives the terminate timeout.
    pub async fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        let handle = self.inner.current.lock().await.take();
        let Some(handle) = handle else {
            return;
        };
        if handle.status().is_exited() {
            return;
        }

        info!(worker_id = %handle.id(), "Shutting down worker");
        handle.close_input();
        let timeout = self.inner.config.terminate_timeout();
        if tokio::time::timeout(timeout, handle.exited()).await.is_err() {
            warn!(
                worker_id = %handle.id(),
                "Timeout waiting for graceful shutdown, killing"
            );
            handle.kill();
            if tokio::time::timeout(timeout, handle.exited()).await.is_err() {
                error!(worker_id = %handle.id(), "Worker did not exit after kill");
            }
        }
    }

    pub async fn stats(&self) -> SupervisorStats {
        let current = self.inner.current.lock().await;
        let backoff = self.inner.backoff.lock().await;
        SupervisorStats {
            spawns: self.inner.spawns.load(Ordering::Relaxed),
            restarts: self.inner.restarts.load(Ordering::Relaxed),
            worker_id: current.as_ref().map(|h| h.id().to_string()),
            generation: current.as_ref().map(|h| h.generation()),
            pid: current.as_ref().and_then(|h| h.pid()),
            status: current.as_ref().map(|h| h.status()),
            crash_streak: backoff.crash_streak,
            last_respawn_delay: backoff.last_delay,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.inner.config
    }
}

impl Inner {
    fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Spawn a worker into `slot`. Caller holds the `current` lock.
    fn start_locked(
        self: &Arc<Self>,
        slot: &mut Option<Arc<WorkerHandle>>,
    ) -> Result<Arc<WorkerHandle>, BridgeError> {
        if let Some(old) = slot.as_ref()
            && !old.status().is_exited()
        {
            // Unusable but still alive: make sure it goes away quietly.
            old.kill();
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let (handle, process) = spawn_worker(&self.config, generation).inspect_err(|e| {
            error!(bin = %self.config.bin.display(), error = %e, "Worker spawn failed");
        })?;
        self.spawns.fetch_add(1, Ordering::Relaxed);
        *slot = Some(Arc::clone(&handle));

        tokio::spawn(monitor(Arc::clone(self), Arc::clone(&handle), process));
        Ok(handle)
    }
}

/// Wait for `handle`'s process to exit and schedule a respawn if the exit
/// was not asked for.
async fn monitor(inner: Arc<Inner>, handle: Arc<WorkerHandle>, process: WorkerProcess) {
    let code = process.wait(&handle).await;

    if handle.exit_requested() || inner.is_shut_down() {
        debug!(worker_id = %handle.id(), "Worker exit was requested; not respawning");
        return;
    }

    let (streak, delay) = {
        let mut backoff = inner.backoff.lock().await;
        let delay = backoff.record_crash(&inner.policy, handle.uptime());
        (backoff.crash_streak, delay)
    };
    warn!(
        worker_id = %handle.id(),
        code = ?code,
        crash_streak = streak,
        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
        "Worker exited unexpectedly, scheduling respawn"
    );

    let mut shutdown = inner.shutdown.subscribe();
    tokio::select! {
        () = tokio::time::sleep(delay) => {}
        _ = shutdown.wait_for(|down| *down) => {
            debug!("Shutdown during respawn delay");
            return;
        }
    }

    let mut current = inner.current.lock().await;
    if inner.is_shut_down() {
        return;
    }
    if current
        .as_ref()
        .is_some_and(|h| h.generation() != handle.generation())
    {
        debug!(
            stale_generation = handle.generation(),
            "Worker already replaced; skipping respawn"
        );
        return;
    }
    match inner.start_locked(&mut current) {
        Ok(new) => {
            inner.restarts.fetch_add(1, Ordering::Relaxed);
            info!(
                worker_id = %new.id(),
                generation = new.generation(),
                replaced = %handle.id(),
                "Worker respawned"
            );
        }
        Err(e) => {
            error!(error = %e, "Respawn failed; waiting for the next request to retry");
        }
    }
}
