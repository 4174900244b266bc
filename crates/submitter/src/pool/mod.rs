//! Bounded pool of JSON-over-stdio worker processes.
//!
//! A [`Pool`] launches external workers, caps how many run at once, writes
//! each one a JSON payload on stdin and hands its stdout to an
//! [`OutputConsumer`]. A background supervisor evicts finished workers,
//! reports stalled ones, and kills everything when the pool's cancellation
//! token fires.
//!
//! - `admission`: serialized, semaphore-bounded admission.
//! - `launcher`: process start and the per-worker writer, consumer,
//!   stderr and reaper tasks.
//! - [`registry`]: the ordered set of live worker records.
//! - [`supervisor`]: the reconciliation loop.
//!
//! `submit` succeeding means the process started, not that its payload was
//! delivered. Delivery failures are logged in debug mode and otherwise
//! invisible.

mod admission;
pub mod consumer;
pub mod error;
mod launcher;
pub mod registry;
pub mod supervisor;
#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test_support;

use std::ffi::OsStr;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use submitter_core::PoolSettings;
use tokio::sync::{Mutex, Notify, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use admission::AdmissionGate;
use launcher::WorkerIo;
use registry::{Registry, WorkerRecord};

pub use consumer::OutputConsumer;
pub use error::{PayloadDeliveryError, PoolError};
pub use registry::{WorkerId, WorkerInfo, WorkerState};
pub use supervisor::SupervisorState;

/// How often [`Pool::await_idle`] looks at the registry.
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Pool parameters, fixed for the pool's lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Upper bound on registered workers; 0 means unbounded.
    pub max_concurrent: usize,
    /// Log worker stderr and payload delivery failures instead of dropping them.
    pub debug_mode: bool,
    /// Supervisor reconciliation cadence.
    pub tick_interval: Duration,
    /// Age after which a still-running worker is reported on every tick.
    pub slow_worker_threshold: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 0,
            debug_mode: false,
            tick_interval: Duration::from_millis(100),
            slow_worker_threshold: Duration::from_secs(60),
        }
    }
}

impl From<&PoolSettings> for PoolConfig {
    fn from(settings: &PoolSettings) -> Self {
        Self {
            max_concurrent: settings.max_concurrent,
            debug_mode: settings.debug_mode,
            tick_interval: Duration::from_millis(settings.tick_interval_ms),
            slow_worker_threshold: Duration::from_secs(settings.slow_worker_threshold_secs),
        }
    }
}

/// Supervising handle for a set of worker processes.
///
/// Dropping the pool cancels it: its workers are killed, but the token it
/// was created from is left alone.
pub struct Pool {
    config: PoolConfig,
    cancel: CancellationToken,
    gate: Arc<AdmissionGate>,
    registry: Arc<Mutex<Registry>>,
    io: WorkerIo,
    wake: Arc<Notify>,
    supervisor: watch::Receiver<SupervisorState>,
}

impl Pool {
    /// Create a pool and start its supervisor. Must be called inside a Tokio
    /// runtime.
    ///
    /// The pool is cancelled when `cancel` is. `consumer` defaults to
    /// copying worker output to this process's stdout.
    pub fn new(
        cancel: &CancellationToken,
        config: PoolConfig,
        consumer: Option<OutputConsumer>,
    ) -> Self {
        let cancel = cancel.child_token();
        let gate = Arc::new(AdmissionGate::new(config.max_concurrent));
        let registry = Arc::new(Mutex::new(Registry::default()));
        let wake = Arc::new(Notify::new());
        let (state_tx, state_rx) = watch::channel(SupervisorState::Active);

        supervisor::Supervisor {
            registry: Arc::clone(&registry),
            gate: Arc::clone(&gate),
            cancel: cancel.clone(),
            wake: Arc::clone(&wake),
            tick: config.tick_interval.max(Duration::from_millis(1)),
            slow_threshold: config.slow_worker_threshold,
            state: state_tx,
        }
        .spawn();

        info!(
            max_concurrent = config.max_concurrent,
            debug_mode = config.debug_mode,
            "Pool created"
        );

        Self {
            io: WorkerIo {
                debug_mode: config.debug_mode,
                consumer: consumer.unwrap_or_else(consumer::stdout),
            },
            config,
            cancel,
            gate,
            registry,
            wake,
            supervisor: state_rx,
        }
    }

    /// Start one worker running `command` and feed it `payload` as JSON.
    ///
    /// Waits while the pool is full. Only one submission is admitted at a
    /// time. Returns once the process has started and is registered.
    ///
    /// On a pool that is already cancelled this fails with
    /// [`PoolError::StartFailed`]; a call that was waiting for a slot when
    /// cancellation fired fails with [`PoolError::Cancelled`].
    pub async fn submit<S, P>(&self, command: &[S], payload: P) -> Result<WorkerId, PoolError>
    where
        S: AsRef<OsStr>,
        P: Serialize + Send + 'static,
    {
        let Some(program) = command.first() else {
            return Err(PoolError::InvalidCommand);
        };
        let cancelled = || PoolError::StartFailed {
            program: launcher::program_name(program.as_ref()),
            reason: "pool cancelled".to_string(),
        };

        if self.cancel.is_cancelled() {
            return Err(cancelled());
        }

        let mut admission = self.gate.admit(&self.cancel).await?;
        if self.cancel.is_cancelled() {
            return Err(cancelled());
        }

        let spawned = launcher::spawn_worker(command)?;
        let (id, pid, started_at) = (spawned.id, spawned.pid, spawned.started_at);

        let mut registry = self.registry.lock().await;
        if registry.is_closed() {
            // Dropping `spawned` kills the process.
            return Err(cancelled());
        }

        let kill = self.cancel.child_token();
        let state = spawned.detach(payload, &self.io, kill.clone(), Arc::clone(&self.wake));
        registry.push(WorkerRecord::new(
            id,
            pid,
            started_at,
            state,
            kill,
            admission.take_slot(),
        ));
        let active = registry.len();
        drop(registry);
        drop(admission);

        debug!(worker_id = %id, ?pid, active, "Worker admitted");
        Ok(id)
    }

    /// Wait until no workers are registered.
    ///
    /// Fails with [`PoolError::Cancelled`] once the pool is cancelled, even if
    /// it is also idle, and with [`PoolError::Timeout`] after `timeout`.
    pub async fn await_idle(&self, timeout: Duration) -> Result<(), PoolError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.cancel.is_cancelled() {
                return Err(PoolError::Cancelled);
            }
            if self.registry.lock().await.is_empty() {
                return Ok(());
            }

            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Err(PoolError::Cancelled),
                () = tokio::time::sleep_until(deadline) => return Err(PoolError::Timeout(timeout)),
                () = tokio::time::sleep(IDLE_POLL_INTERVAL) => {}
            }
        }
    }

    /// Number of registered workers.
    pub async fn active_count(&self) -> usize {
        self.registry.lock().await.len()
    }

    /// Registered workers in admission order.
    pub async fn workers(&self) -> Vec<WorkerInfo> {
        self.registry
            .lock()
            .await
            .snapshot(std::time::Instant::now())
    }

    /// Free slots, or `None` when the pool is unbounded.
    pub fn available_slots(&self) -> Option<usize> {
        self.gate.available_slots()
    }

    pub fn supervisor_state(&self) -> SupervisorState {
        *self.supervisor.borrow()
    }

    /// Resolve once the supervisor has killed every worker and stopped.
    pub async fn stopped(&self) {
        let mut state = self.supervisor.clone();
        let _ = state.wait_for(|s| *s == SupervisorState::Stopped).await;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub const fn config(&self) -> &PoolConfig {
        &self.config
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
