//! Errors from pool operations.

use std::time::Duration;

/// Errors returned by [`Pool::submit`](super::Pool::submit) and
/// [`Pool::await_idle`](super::Pool::await_idle).
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Worker command is empty")]
    InvalidCommand,

    #[error("Failed to capture worker {stream}")]
    StreamSetup { stream: &'static str },

    #[error("Failed to start worker {program}: {reason}")]
    StartFailed { program: String, reason: String },

    #[error("Pool did not become idle within {0:?}")]
    Timeout(Duration),

    #[error("Pool has been cancelled")]
    Cancelled,
}

/// Failure to hand a payload to a worker's stdin.
///
/// Never returned from `submit`: a started worker counts as submitted whether
/// or not its payload arrived. Reported through the log in debug mode only.
#[derive(Debug, thiserror::Error)]
pub enum PayloadDeliveryError {
    #[error("Failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Payload must be a JSON object, got {0}")]
    NotAnObject(&'static str),

    #[error("Failed to write payload: {0}")]
    Write(#[from] std::io::Error),
}
