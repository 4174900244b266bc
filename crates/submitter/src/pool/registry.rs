//! Worker records and the registry that tracks them.
//!
//! The registry is appended to by admission and compacted by the supervisor.
//! A record never owns its child process (the reaper task does); it holds a
//! view of the worker's exit state, the token that kills it, and the slot
//! permit that keeps it counted against the pool ceiling.

use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Unique identifier assigned to a worker at admission.
pub type WorkerId = Uuid;

/// Lifecycle state published by a worker's reaper task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Running,
    /// The process has been reaped. `code` is `None` when it died from a
    /// signal or its status could not be collected.
    Exited { code: Option<i32> },
}

impl WorkerState {
    pub const fn is_exited(self) -> bool {
        matches!(self, Self::Exited { .. })
    }
}

/// Point-in-time view of a registered worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub pid: Option<u32>,
    pub age: Duration,
}

/// A running worker that has outlived the slow-worker threshold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlowWorker {
    pub id: WorkerId,
    pub pid: Option<u32>,
    pub elapsed: Duration,
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Default)]
pub struct Reconciliation {
    /// Records removed because their process exited, with the final state.
    pub evicted: Vec<(WorkerId, WorkerState)>,
    /// Records still running past the threshold. They stay registered.
    pub slow: Vec<SlowWorker>,
}

pub(crate) struct WorkerRecord {
    id: WorkerId,
    pid: Option<u32>,
    created_at: Instant,
    state: watch::Receiver<WorkerState>,
    kill: CancellationToken,
    /// Dropped with the record, which frees the slot for the next admission.
    _slot: Option<OwnedSemaphorePermit>,
}

impl WorkerRecord {
    pub(crate) fn new(
        id: WorkerId,
        pid: Option<u32>,
        created_at: Instant,
        state: watch::Receiver<WorkerState>,
        kill: CancellationToken,
        slot: Option<OwnedSemaphorePermit>,
    ) -> Self {
        Self {
            id,
            pid,
            created_at,
            state,
            kill,
            _slot: slot,
        }
    }

    pub(crate) const fn id(&self) -> WorkerId {
        self.id
    }

    pub(crate) const fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub(crate) fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    pub(crate) fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    /// Ask the reaper to force-kill the process. Idempotent.
    pub(crate) fn kill(&self) {
        self.kill.cancel();
    }

    /// Resolve once the reaper reports the process gone.
    ///
    /// A reaper that vanished without reporting counts as exited.
    pub(crate) async fn exited(&self) -> WorkerState {
        let mut state = self.state.clone();
        match state.wait_for(|s| s.is_exited()).await {
            Ok(s) => *s,
            Err(_) => WorkerState::Exited { code: None },
        }
    }

    fn info(&self, now: Instant) -> WorkerInfo {
        WorkerInfo {
            id: self.id,
            pid: self.pid,
            age: self.age(now),
        }
    }
}

/// Ordered collection of live worker records.
#[derive(Default)]
pub(crate) struct Registry {
    records: Vec<WorkerRecord>,
    closed: bool,
}

impl Registry {
    pub(crate) const fn len(&self) -> usize {
        self.records.len()
    }

    pub(crate) const fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Whether the registry stopped accepting records after cancellation.
    pub(crate) const fn is_closed(&self) -> bool {
        self.closed
    }

    /// Append a record in admission order.
    ///
    /// Callers check [`is_closed`](Self::is_closed) under the same lock first.
    pub(crate) fn push(&mut self, record: WorkerRecord) {
        debug_assert!(!self.closed, "push into a closed registry");
        self.records.push(record);
    }

    /// Evict exited records and, when `slow_threshold` is given, report
    /// running records older than it.
    pub(crate) fn reconcile(
        &mut self,
        now: Instant,
        slow_threshold: Option<Duration>,
    ) -> Reconciliation {
        let (exited, live): (Vec<_>, Vec<_>) = std::mem::take(&mut self.records)
            .into_iter()
            .partition(|r| r.state().is_exited());
        self.records = live;

        let slow = slow_threshold
            .map(|threshold| {
                self.records
                    .iter()
                    .filter(|r| r.age(now) > threshold)
                    .map(|r| SlowWorker {
                        id: r.id,
                        pid: r.pid,
                        elapsed: r.age(now),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Reconciliation {
            evicted: exited.iter().map(|r| (r.id, r.state())).collect(),
            slow,
        }
    }

    /// Stop accepting records and hand back everything still tracked.
    pub(crate) fn close(&mut self) -> Vec<WorkerRecord> {
        self.closed = true;
        std::mem::take(&mut self.records)
    }

    pub(crate) fn snapshot(&self, now: Instant) -> Vec<WorkerInfo> {
        self.records.iter().map(|r| r.info(now)).collect()
    }
}
