//! Log stream setup.
//!
//! One `tracing` subscriber per process. Interactive commands log to
//! stderr; the daemon also (or only, when detached) appends to its log file
//! through a non-blocking writer so concurrent watchers never interleave
//! partial lines. `FERRY_LOG` takes an `EnvFilter` directive and overrides
//! the verbosity flag.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

pub const LOG_ENV_VAR: &str = "FERRY_LOG";

/// Where log lines go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    Stderr,
    /// Attached daemon: terminal and log file.
    StderrAndFile(PathBuf),
    /// Detached daemon: stderr is already redirected into the log file.
    File(PathBuf),
}

/// Flushes buffered file output when dropped. Keep it alive in `main`.
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

pub fn level_from_verbosity(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

pub fn init(verbosity: u8, target: LogTarget) -> Result<LogGuard> {
    let filter = EnvFilter::builder()
        .with_default_directive(level_from_verbosity(verbosity).into())
        .with_env_var(LOG_ENV_VAR)
        .from_env_lossy();

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    let mut file_guard = None;

    let file = match &target {
        LogTarget::Stderr => None,
        LogTarget::StderrAndFile(path) | LogTarget::File(path) => Some(path.as_path()),
    };
    if !matches!(target, LogTarget::File(_)) {
        layers.push(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .boxed(),
        );
    }
    if let Some(path) = file {
        let (layer, guard) = file_layer(path)?;
        layers.push(layer);
        file_guard = Some(guard);
    }
    layers.push(filter.boxed());

    Registry::default()
        .with(layers)
        .try_init()
        .context("Failed to install log subscriber")?;

    Ok(LogGuard { _file: file_guard })
}

fn file_layer(path: &Path) -> Result<(Box<dyn Layer<Registry> + Send + Sync>, WorkerGuard)> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let name = path
        .file_name()
        .with_context(|| format!("Log file path {} has no file name", path.display()))?;
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create log directory {}", dir.display()))?;

    // `never` rotates nothing and opens in append mode
    let appender = tracing_appender::rolling::never(&dir, name);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .boxed();
    Ok((layer, guard))
}
