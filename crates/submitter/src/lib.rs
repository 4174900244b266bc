//! Submitter Library
//!
//! A bounded supervisor for short-lived worker processes that take one JSON
//! payload on stdin:
//! - Admission with a concurrency ceiling
//! - Background eviction and slow-worker reports
//! - Cancellation that kills every live worker

pub mod pool;

pub use pool::{Pool, PoolConfig, PoolError, SupervisorState, WorkerId, WorkerInfo, WorkerState};
