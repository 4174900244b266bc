//! Background reconciliation loop, one per pool.
//!
//! While active, it evicts finished workers on every tick and whenever a
//! reaper reports an exit, and reports slow workers on ticks only. When the
//! pool is cancelled it closes the gate and registry, kills what is left,
//! waits briefly for the reapers, and stops for good.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::admission::AdmissionGate;
use super::registry::Registry;

/// How long termination waits for killed workers to be reaped.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Supervisor lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Active,
    Terminating,
    Stopped,
}

pub(crate) struct Supervisor {
    pub(crate) registry: Arc<Mutex<Registry>>,
    pub(crate) gate: Arc<AdmissionGate>,
    pub(crate) cancel: CancellationToken,
    pub(crate) wake: Arc<Notify>,
    pub(crate) tick: Duration,
    pub(crate) slow_threshold: Duration,
    pub(crate) state: watch::Sender<SupervisorState>,
}

impl Supervisor {
    /// Detach the loop. Its end is observable through the state channel.
    pub(crate) fn spawn(self) {
        tokio::spawn(self.run());
    }

    async fn run(self) {
        let mut timer = tokio::time::interval_at(Instant::now() + self.tick, self.tick);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                _ = timer.tick() => self.reconcile(true).await,
                () = self.wake.notified() => self.reconcile(false).await,
            }
        }

        self.terminate().await;
    }

    async fn reconcile(&self, check_slow: bool) {
        let pass = self
            .registry
            .lock()
            .await
            .reconcile(std::time::Instant::now(), check_slow.then_some(self.slow_threshold));

        for (id, state) in &pass.evicted {
            debug!(worker_id = %id, ?state, "Worker finished");
        }
        for slow in &pass.slow {
            warn!(
                worker_id = %slow.id,
                pid = ?slow.pid,
                elapsed = ?slow.elapsed,
                "Slow worker"
            );
        }
    }

    async fn terminate(self) {
        self.state.send_replace(SupervisorState::Terminating);
        self.gate.close();

        let records = self.registry.lock().await.close();
        info!(workers = records.len(), "Pool cancelled, terminating workers");

        for record in &records {
            record.kill();
        }

        let deadline = Instant::now() + KILL_GRACE;
        for record in &records {
            match tokio::time::timeout_at(deadline, record.exited()).await {
                Ok(state) => debug!(worker_id = %record.id(), ?state, "Worker terminated"),
                Err(_) => warn!(
                    worker_id = %record.id(),
                    pid = ?record.pid(),
                    "Worker still running after kill"
                ),
            }
        }
        drop(records);

        self.state.send_replace(SupervisorState::Stopped);
        info!("Supervisor stopped");
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::pool::registry::{WorkerRecord, WorkerState};
    use crate::pool::test_support::capture_logs;
    use uuid::Uuid;

    struct Harness {
        registry: Arc<Mutex<Registry>>,
        gate: Arc<AdmissionGate>,
        cancel: CancellationToken,
        wake: Arc<Notify>,
        state: watch::Receiver<SupervisorState>,
    }

    fn start(tick: Duration) -> Harness {
        let registry = Arc::new(Mutex::new(Registry::default()));
        let gate = Arc::new(AdmissionGate::new(4));
        let cancel = CancellationToken::new();
        let wake = Arc::new(Notify::new());
        let (state_tx, state) = watch::channel(SupervisorState::Active);

        Supervisor {
            registry: Arc::clone(&registry),
            gate: Arc::clone(&gate),
            cancel: cancel.clone(),
            wake: Arc::clone(&wake),
            tick,
            slow_threshold: Duration::from_secs(60),
            state: state_tx,
        }
        .spawn();

        Harness {
            registry,
            gate,
            cancel,
            wake,
            state,
        }
    }

    /// A fake worker: the returned sender plays the reaper.
    fn fake_worker(kill: CancellationToken) -> (WorkerRecord, watch::Sender<WorkerState>) {
        let (tx, rx) = watch::channel(WorkerState::Running);
        let record = WorkerRecord::new(
            Uuid::new_v4(),
            None,
            std::time::Instant::now(),
            rx,
            kill,
            None,
        );
        (record, tx)
    }

    #[tokio::test]
    async fn exited_worker_is_evicted_on_wake() {
        let h = start(Duration::from_secs(3600));
        let (record, reaper) = fake_worker(CancellationToken::new());
        h.registry.lock().await.push(record);

        reaper.send_replace(WorkerState::Exited { code: Some(0) });
        h.wake.notify_one();

        tokio::time::timeout(Duration::from_secs(1), async {
            while !h.registry.lock().await.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("wake-up should trigger eviction");
    }

    #[tokio::test]
    async fn exited_worker_is_evicted_on_tick() {
        let h = start(Duration::from_millis(20));
        let (record, reaper) = fake_worker(CancellationToken::new());
        h.registry.lock().await.push(record);

        reaper.send_replace(WorkerState::Exited { code: Some(1) });

        tokio::time::timeout(Duration::from_secs(1), async {
            while !h.registry.lock().await.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("tick should trigger eviction");
    }

    #[tokio::test]
    async fn old_running_worker_is_reported_on_tick() {
        let (logs, _guard) = capture_logs();
        let h = start(Duration::from_millis(20));
        let (tx, rx) = watch::channel(WorkerState::Running);
        let started = std::time::Instant::now()
            .checked_sub(Duration::from_secs(120))
            .unwrap();
        h.registry.lock().await.push(WorkerRecord::new(
            Uuid::new_v4(),
            Some(4242),
            started,
            rx,
            CancellationToken::new(),
            None,
        ));

        tokio::time::timeout(Duration::from_secs(1), async {
            while !logs.contents().contains("Slow worker") {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("slow worker should be reported");
        assert!(logs.contents().contains("4242"));

        // Reported, not evicted or killed.
        assert_eq!(h.registry.lock().await.len(), 1);
        assert_eq!(*tx.borrow(), WorkerState::Running);
    }

    #[tokio::test]
    async fn wake_up_does_not_report_slow_workers() {
        let (logs, _guard) = capture_logs();
        let h = start(Duration::from_secs(3600));
        let (_tx, rx) = watch::channel(WorkerState::Running);
        let started = std::time::Instant::now()
            .checked_sub(Duration::from_secs(120))
            .unwrap();
        h.registry.lock().await.push(WorkerRecord::new(
            Uuid::new_v4(),
            None,
            started,
            rx,
            CancellationToken::new(),
            None,
        ));

        h.wake.notify_one();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!logs.contents().contains("Slow worker"));
    }

    #[tokio::test]
    async fn cancellation_kills_closes_and_stops() {
        let mut h = start(Duration::from_millis(20));
        let kill = CancellationToken::new();
        let (record, reaper) = fake_worker(kill.clone());
        h.registry.lock().await.push(record);

        // Play a reaper that exits once killed.
        tokio::spawn(async move {
            kill.cancelled().await;
            reaper.send_replace(WorkerState::Exited { code: None });
        });

        h.cancel.cancel();
        tokio::time::timeout(
            Duration::from_secs(1),
            h.state.wait_for(|s| *s == SupervisorState::Stopped),
        )
        .await
        .expect("supervisor should stop")
        .unwrap();

        let registry = h.registry.lock().await;
        assert!(registry.is_closed());
        assert!(registry.is_empty());
        drop(registry);
        assert!(h.gate.admit(&CancellationToken::new()).await.is_err());
    }

    #[tokio::test]
    async fn stuck_worker_does_not_block_stop_forever() {
        let mut h = start(Duration::from_millis(20));
        // Never reports exit, even after being killed.
        let (record, _reaper) = fake_worker(CancellationToken::new());
        h.registry.lock().await.push(record);

        h.cancel.cancel();
        tokio::time::timeout(
            KILL_GRACE + Duration::from_secs(1),
            h.state.wait_for(|s| *s == SupervisorState::Stopped),
        )
        .await
        .expect("supervisor should stop after the grace period")
        .unwrap();
    }
}
