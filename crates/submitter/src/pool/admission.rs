//! Admission gate: serializes launches and bounds concurrent workers.
//!
//! One submission at a time holds the gate's lock while it waits for a slot
//! and starts its process. Slots are semaphore permits; a permit travels into
//! the worker's registry record and returns to the gate when the supervisor
//! evicts that record. A ceiling of zero means no semaphore at all.

use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::error::PoolError;

/// An in-progress admission. The gate stays locked until this is dropped.
pub(crate) struct Admission<'a> {
    _guard: MutexGuard<'a, ()>,
    slot: Option<OwnedSemaphorePermit>,
}

impl Admission<'_> {
    /// Move the slot permit out so it can live in the worker record.
    pub(crate) fn take_slot(&mut self) -> Option<OwnedSemaphorePermit> {
        self.slot.take()
    }
}

pub(crate) struct AdmissionGate {
    lock: Mutex<()>,
    slots: Option<Arc<Semaphore>>,
    max_concurrent: usize,
}

impl AdmissionGate {
    pub(crate) fn new(max_concurrent: usize) -> Self {
        let slots = (max_concurrent > 0).then(|| Arc::new(Semaphore::new(max_concurrent)));
        Self {
            lock: Mutex::new(()),
            slots,
            max_concurrent,
        }
    }

    /// Wait for the gate and a free slot, or fail with
    /// [`PoolError::Cancelled`] once `cancel` fires.
    pub(crate) async fn admit(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Admission<'_>, PoolError> {
        let guard = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(PoolError::Cancelled),
            guard = self.lock.lock() => guard,
        };

        let slot = match &self.slots {
            None => None,
            Some(slots) => {
                if slots.available_permits() == 0 {
                    debug!(max_concurrent = self.max_concurrent, "Pool full, waiting for a slot");
                }
                let permit = tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Err(PoolError::Cancelled),
                    permit = Arc::clone(slots).acquire_owned() => permit,
                };
                Some(permit.map_err(|_| PoolError::Cancelled)?)
            }
        };

        Ok(Admission {
            _guard: guard,
            slot,
        })
    }

    /// Refuse all further slots. Waiters fail with [`PoolError::Cancelled`].
    pub(crate) fn close(&self) {
        if let Some(slots) = &self.slots {
            slots.close();
        }
    }

    /// Free slots, or `None` when the pool is unbounded.
    pub(crate) fn available_slots(&self) -> Option<usize> {
        self.slots.as_ref().map(|s| s.available_permits())
    }
}
