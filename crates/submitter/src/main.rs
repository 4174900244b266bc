//! `submitter`
//!
//! Reads newline-delimited JSON objects from stdin and runs one worker
//! process per object, at most `--max-concurrent` at a time. Worker output is
//! copied to stdout; logs go to stderr.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use submitter::{Pool, PoolConfig, PoolError};

#[derive(Parser, Debug)]
#[command(name = "submitter")]
#[command(version, about = "Run a worker process for every JSON payload read from stdin")]
struct Args {
    /// Config file, layered over the global settings file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Maximum concurrently running workers (0 = unbounded)
    #[arg(long)]
    max_concurrent: Option<usize>,

    /// Log worker stderr and payload delivery failures
    #[arg(long)]
    debug: bool,

    /// Seconds to wait for running workers once stdin is exhausted
    #[arg(long, default_value_t = 300, env = "SUBMITTER_IDLE_TIMEOUT")]
    idle_timeout: u64,

    /// Log level filter (e.g. "info", "debug", "warn")
    #[arg(long)]
    log_level: Option<String>,

    /// Output logs as JSON
    #[arg(long)]
    log_json: bool,

    /// Worker program and its arguments
    #[arg(last = true, required = true, num_args = 1..)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = submitter_core::config::load_config(args.config.as_deref())?;
    if let Some(max) = args.max_concurrent {
        config.pool.max_concurrent = max;
    }
    if args.debug {
        config.pool.debug_mode = true;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if args.log_json {
        config.logging.json = true;
    }

    let log_filter = format!("submitter={}", config.logging.level);
    submitter_core::tracing_init::init_tracing(&log_filter, config.logging.json);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        command = ?args.command,
        max_concurrent = config.pool.max_concurrent,
        "Starting submitter"
    );

    let cancel = CancellationToken::new();
    let pool = Pool::new(&cancel, PoolConfig::from(&config.pool), None);

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    let run = run(&pool, &args.command, Duration::from_secs(args.idle_timeout));
    let result = tokio::select! {
        result = run => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
            Err(anyhow::anyhow!("interrupted"))
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
            Err(anyhow::anyhow!("terminated"))
        }
    };

    cancel.cancel();
    pool.stopped().await;
    info!("Submitter stopped");
    result
}

/// Submit one worker per payload line, then wait for quiescence.
async fn run(pool: &Pool, command: &[String], idle_timeout: Duration) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut submitted = 0usize;
    let mut line_no = 0usize;

    while let Some(line) = lines.next_line().await.context("reading stdin")? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let payload = match serde_json::from_str::<Map<String, Value>>(&line) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(line = line_no, error = %e, "Skipping payload that is not a JSON object");
                continue;
            }
        };

        match pool.submit(command, payload).await {
            Ok(_) => submitted += 1,
            Err(PoolError::Cancelled) => return Err(PoolError::Cancelled.into()),
            Err(e) => warn!(line = line_no, error = %e, "Worker failed to start"),
        }
    }

    info!(submitted, "Input exhausted, waiting for workers");
    pool.await_idle(idle_timeout).await?;
    info!(submitted, "All workers finished");
    Ok(())
}
