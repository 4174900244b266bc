//! `submitter-testbin`
//!
//! Reference worker used by the integration tests. Reads one JSON object from
//! stdin, optionally stalls, then writes a JSON object to stdout: the contents
//! of FILE when given, `{}` otherwise.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde_json::{Map, Value};
use tokio::io::AsyncReadExt;

#[derive(Parser, Debug)]
#[command(name = "submitter-testbin")]
#[command(about = "Test worker: reads a JSON object on stdin, writes one on stdout")]
struct Args {
    /// Never exit
    #[arg(long, conflicts_with = "sleep")]
    hang: bool,

    /// Seconds to sleep before answering
    #[arg(long)]
    sleep: Option<u64>,

    /// JSON object to echo instead of `{}`
    file: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut input = Vec::new();
    tokio::io::stdin()
        .read_to_end(&mut input)
        .await
        .context("reading payload")?;
    let _payload: Map<String, Value> =
        serde_json::from_slice(&input).context("payload is not a JSON object")?;

    if args.hang {
        std::future::pending::<()>().await;
    }
    if let Some(secs) = args.sleep {
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }

    let output = match &args.file {
        Some(path) => {
            let raw = std::fs::read(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_slice::<Map<String, Value>>(&raw)
                .with_context(|| format!("{} is not a JSON object", path.display()))?
        }
        None => Map::new(),
    };

    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer(&mut stdout, &output)?;
    stdout.write_all(b"\n")?;
    stdout.flush()?;
    Ok(())
}
