//! Output consumers: what happens to a worker's stdout.
//!
//! A consumer receives the worker's stdout pipe and reads it on its own task.
//! Its result is only logged; a failing consumer never affects the pool.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::process::ChildStdout;
use tokio::sync::mpsc;

/// Future returned by an [`OutputConsumer`].
pub type ConsumeFuture = Pin<Box<dyn Future<Output = std::io::Result<()>> + Send>>;

/// Handler for a worker's stdout stream.
pub type OutputConsumer = Arc<dyn Fn(ChildStdout) -> ConsumeFuture + Send + Sync>;

/// Build a consumer from an async closure.
pub fn from_fn<F, Fut>(f: F) -> OutputConsumer
where
    F: Fn(ChildStdout) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::io::Result<()>> + Send + 'static,
{
    Arc::new(move |stdout| -> ConsumeFuture { Box::pin(f(stdout)) })
}

/// Copy worker output to this process's stdout. The pool default.
pub fn stdout() -> OutputConsumer {
    from_fn(copy_to_stdout)
}

/// Drain and drop worker output.
pub fn discard() -> OutputConsumer {
    from_fn(drain)
}

/// Read each worker's complete output and send it on `tx`.
///
/// Fails (and so only logs) when the receiver is gone.
pub fn collect(tx: mpsc::Sender<Vec<u8>>) -> OutputConsumer {
    from_fn(move |out| send_all(out, tx.clone()))
}

async fn copy_to_stdout(mut out: ChildStdout) -> std::io::Result<()> {
    tokio::io::copy(&mut out, &mut tokio::io::stdout()).await?;
    Ok(())
}

async fn drain(mut out: ChildStdout) -> std::io::Result<()> {
    tokio::io::copy(&mut out, &mut tokio::io::sink()).await?;
    Ok(())
}

async fn send_all(mut out: ChildStdout, tx: mpsc::Sender<Vec<u8>>) -> std::io::Result<()> {
    let mut buf = Vec::new();
    out.read_to_end(&mut buf).await?;
    tx.send(buf)
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "receiver closed"))
}
