//! Worker launch and per-worker background tasks.
//!
//! [`spawn_worker`] starts the process with all three stdio streams piped.
//! [`Spawned::detach`] then hands each stream and the child itself to its own
//! task: a payload writer, the output consumer, a stderr forwarder and an exit
//! reaper. None of them report back to the submitter; the reaper publishes
//! the exit through a watch channel the registry record holds.

use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::consumer::OutputConsumer;
use super::error::{PayloadDeliveryError, PoolError};
use super::registry::{WorkerId, WorkerState};

/// Stream handling shared by every worker of a pool.
pub(crate) struct WorkerIo {
    pub(crate) debug_mode: bool,
    pub(crate) consumer: OutputConsumer,
}

/// A started worker whose streams have not been handed off yet.
///
/// Dropping it kills the process.
pub(crate) struct Spawned {
    pub(crate) id: WorkerId,
    pub(crate) pid: Option<u32>,
    pub(crate) started_at: Instant,
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
    stderr: ChildStderr,
}

pub(crate) fn program_name(program: &OsStr) -> String {
    Path::new(program).display().to_string()
}

/// Start `command` (program followed by its arguments) with piped stdio.
pub(crate) fn spawn_worker<S: AsRef<OsStr>>(command: &[S]) -> Result<Spawned, PoolError> {
    let (program, args) = command.split_first().ok_or(PoolError::InvalidCommand)?;
    let program = program.as_ref();

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| PoolError::StartFailed {
        program: program_name(program),
        reason: e.to_string(),
    })?;
    let started_at = Instant::now();

    let stdin = child
        .stdin
        .take()
        .ok_or(PoolError::StreamSetup { stream: "stdin" })?;
    let stdout = child
        .stdout
        .take()
        .ok_or(PoolError::StreamSetup { stream: "stdout" })?;
    let stderr = child
        .stderr
        .take()
        .ok_or(PoolError::StreamSetup { stream: "stderr" })?;

    Ok(Spawned {
        id: Uuid::new_v4(),
        pid: child.id(),
        started_at,
        child,
        stdin,
        stdout,
        stderr,
    })
}

impl Spawned {
    /// Hand the worker's streams and process to background tasks.
    ///
    /// Returns the receiver on which the reaper publishes the exit. `kill`
    /// makes the reaper force-kill the process; `wake` is notified after the
    /// exit is published.
    pub(crate) fn detach<P>(
        self,
        payload: P,
        io: &WorkerIo,
        kill: CancellationToken,
        wake: Arc<Notify>,
    ) -> watch::Receiver<WorkerState>
    where
        P: Serialize + Send + 'static,
    {
        let Self {
            id,
            pid,
            child,
            stdin,
            stdout,
            stderr,
            ..
        } = self;

        tokio::spawn(write_payload(id, stdin, payload, io.debug_mode));
        tokio::spawn(consume_output(id, stdout, Arc::clone(&io.consumer)));
        tokio::spawn(forward_stderr(id, stderr, io.debug_mode));

        let (state_tx, state_rx) = watch::channel(WorkerState::Running);
        tokio::spawn(reap(id, pid, child, kill, state_tx, wake));
        state_rx
    }
}

async fn write_payload<P: Serialize>(
    id: WorkerId,
    mut stdin: ChildStdin,
    payload: P,
    debug_mode: bool,
) {
    let encoded = encode_payload(&payload);
    drop(payload);

    if let Err(e) = deliver(&mut stdin, encoded).await
        && debug_mode
    {
        warn!(worker_id = %id, error = %e, "Could not deliver payload to worker");
    }
    // Dropping stdin closes the pipe so the worker sees end of input.
}

/// Encode `payload` as one JSON object line. Any other JSON value is refused.
fn encode_payload<P: Serialize>(payload: &P) -> Result<Vec<u8>, PayloadDeliveryError> {
    let object = match serde_json::to_value(payload)? {
        Value::Object(object) => object,
        Value::Null => return Err(PayloadDeliveryError::NotAnObject("null")),
        Value::Bool(_) => return Err(PayloadDeliveryError::NotAnObject("a boolean")),
        Value::Number(_) => return Err(PayloadDeliveryError::NotAnObject("a number")),
        Value::String(_) => return Err(PayloadDeliveryError::NotAnObject("a string")),
        Value::Array(_) => return Err(PayloadDeliveryError::NotAnObject("an array")),
    };
    let mut line = serde_json::to_vec(&object)?;
    line.push(b'\n');
    Ok(line)
}

async fn deliver(
    stdin: &mut ChildStdin,
    encoded: Result<Vec<u8>, PayloadDeliveryError>,
) -> Result<(), PayloadDeliveryError> {
    let line = encoded?;
    stdin.write_all(&line).await?;
    stdin.shutdown().await?;
    Ok(())
}

async fn consume_output(id: WorkerId, stdout: ChildStdout, consumer: OutputConsumer) {
    if let Err(e) = consumer(stdout).await {
        debug!(worker_id = %id, error = %e, "Output consumer failed");
    }
}

/// Log stderr lines in debug mode, otherwise drain them unread.
///
/// Logged lines are decoded as lossy UTF-8 with trailing whitespace trimmed;
/// the raw bytes are not passed through.
async fn forward_stderr(id: WorkerId, mut stderr: ChildStderr, debug_mode: bool) {
    if !debug_mode {
        let _ = tokio::io::copy(&mut stderr, &mut tokio::io::sink()).await;
        return;
    }

    let mut reader = BufReader::new(stderr);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                warn!(worker_id = %id, "stderr: {}", text.trim_end());
            }
        }
    }
}

/// Own the child until it exits or `kill` fires, then publish the exit.
async fn reap(
    id: WorkerId,
    pid: Option<u32>,
    mut child: Child,
    kill: CancellationToken,
    state: watch::Sender<WorkerState>,
    wake: Arc<Notify>,
) {
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        () = kill.cancelled() => None,
    };

    let status = match exited {
        Some(status) => status,
        None => {
            debug!(worker_id = %id, ?pid, "Killing worker");
            if let Err(e) = child.kill().await {
                warn!(worker_id = %id, ?pid, error = %e, "Failed to kill worker");
            }
            child.wait().await
        }
    };

    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            warn!(worker_id = %id, ?pid, error = %e, "Failed to wait for worker");
            None
        }
    };

    state.send_replace(WorkerState::Exited { code });
    wake.notify_one();
}
