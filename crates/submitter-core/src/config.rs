//! Configuration resolution for submitter.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (`<config dir>/submitter/settings.json`)
//! 3. Explicit config file (`--config`)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Error, Result};

/// Complete submitter configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PoolSettings {
    /// Upper bound on simultaneously running workers; 0 means unbounded.
    pub max_concurrent: usize,
    /// Mirror worker stderr and report payload delivery failures.
    pub debug_mode: bool,
    /// Supervisor reconciliation cadence in milliseconds.
    pub tick_interval_ms: u64,
    /// Age in seconds after which a running worker is reported as slow.
    pub slow_worker_threshold_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 0,
            debug_mode: false,
            tick_interval_ms: 100,
            slow_worker_threshold_secs: 60,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// A config file as written on disk: every field is optional so a file only
/// overrides what it names.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    pool: PoolOverlay,
    logging: LoggingOverlay,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct PoolOverlay {
    max_concurrent: Option<usize>,
    debug_mode: Option<bool>,
    tick_interval_ms: Option<u64>,
    slow_worker_threshold_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct LoggingOverlay {
    level: Option<String>,
    json: Option<bool>,
}

/// Load configuration with hierarchical resolution.
///
/// `explicit` must exist when given; the global file is optional.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        let global = load_config_file(&global_path)?;
        merge_config(&mut config, global);
        debug!(path = %global_path.display(), "Loaded global config");
    }

    if let Some(path) = explicit {
        let file = load_config_file(path)?;
        merge_config(&mut config, file);
        debug!(path = %path.display(), "Loaded config file");
    }

    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("submitter").join("settings.json"))
}

fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn merge_config(base: &mut Config, overlay: ConfigFile) {
    let pool = overlay.pool;
    if let Some(n) = pool.max_concurrent {
        base.pool.max_concurrent = n;
    }
    if let Some(debug) = pool.debug_mode {
        base.pool.debug_mode = debug;
    }
    if let Some(ms) = pool.tick_interval_ms {
        base.pool.tick_interval_ms = ms;
    }
    if let Some(secs) = pool.slow_worker_threshold_secs {
        base.pool.slow_worker_threshold_secs = secs;
    }

    let logging = overlay.logging;
    if let Some(level) = logging.level {
        base.logging.level = level;
    }
    if let Some(json) = logging.json {
        base.logging.json = json;
    }
}

fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(val) = lookup("SUBMITTER_MAX_CONCURRENT") {
        config.pool.max_concurrent = parse_env("SUBMITTER_MAX_CONCURRENT", &val)?;
    }
    if let Some(val) = lookup("SUBMITTER_DEBUG") {
        config.pool.debug_mode = parse_env_bool("SUBMITTER_DEBUG", &val)?;
    }
    if let Some(val) = lookup("SUBMITTER_TICK_MS") {
        config.pool.tick_interval_ms = parse_env("SUBMITTER_TICK_MS", &val)?;
    }
    if let Some(val) = lookup("SUBMITTER_SLOW_WORKER_SECS") {
        config.pool.slow_worker_threshold_secs = parse_env("SUBMITTER_SLOW_WORKER_SECS", &val)?;
    }
    if let Some(val) = lookup("SUBMITTER_LOG_LEVEL") {
        config.logging.level = val;
    }
    Ok(())
}

fn parse_env<T: std::str::FromStr>(key: &str, val: &str) -> Result<T> {
    val.trim()
        .parse()
        .map_err(|_| Error::Config(format!("{key}: invalid value {val:?}")))
}

fn parse_env_bool(key: &str, val: &str) -> Result<bool> {
    match val.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(Error::Config(format!("{key}: invalid value {val:?}"))),
    }
}
