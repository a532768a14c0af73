use std::ffi::OsString;
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::future::Future;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::container::DiscoveryFilter;
use crate::errors::DaemonError;
use crate::sync::SyncExecutor;
use crate::watch::{SweepReport, WatchOptions, sweep};

use super::lease::{LeaseStatus, PidLease, process_alive};

/// Marker logged for every detected signal; `status` counts it.
pub const DETECTION_MARKER: &str = "signal detected";

/// Hidden flag telling a respawned process it is the detached daemon.
pub const DETACHED_CHILD_FLAG: &str = "--detached-child";

const STOP_POLL: Duration = Duration::from_millis(100);
const KILL_WAIT: Duration = Duration::from_secs(2);
/// How long a freshly spawned daemon must survive to count as started.
const STARTUP_WINDOW: Duration = Duration::from_secs(1);

/// Result of `daemon stop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    NotRunning,
    /// The record named a dead process and was removed.
    RemovedStale { pid: Option<u32> },
    /// Exited after SIGTERM.
    Stopped { pid: u32 },
    /// Needed SIGKILL after the grace period.
    Killed { pid: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DaemonState {
    Running,
    Stopped,
    Stale,
}

/// Snapshot reported by `daemon status`.
#[derive(Debug, Clone, Serialize)]
pub struct DaemonStatus {
    pub state: DaemonState,
    pub pid: Option<u32>,
    pub pid_file: PathBuf,
    pub log_file: PathBuf,
    pub signals_detected: usize,
    pub recent_log: Vec<String>,
}

/// Start, stop and inspect the background daemon.
pub struct Supervisor {
    lease: PidLease,
    log_file: PathBuf,
    stop_grace: Duration,
}

impl Supervisor {
    pub fn new(pid_file: impl Into<PathBuf>, log_file: impl Into<PathBuf>, stop_grace: Duration) -> Self {
        Self {
            lease: PidLease::new(pid_file),
            log_file: log_file.into(),
            stop_grace,
        }
    }

    pub fn lease(&self) -> &PidLease {
        &self.lease
    }

    /// Run the sweep loop in this process until `shutdown` resolves.
    ///
    /// The lease is held for the whole run and released on every exit path.
    pub async fn run_attached<F>(
        &self,
        executor: Arc<SyncExecutor>,
        filter: &DiscoveryFilter,
        options: WatchOptions,
        shutdown: F,
    ) -> Result<SweepReport, DaemonError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let guard = self.lease.acquire_for(std::process::id())?;
        tracing::info!(pid = guard.pid(), interval_secs = options.interval.as_secs_f64(), "daemon started");

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let listener = tokio::spawn(async move {
            shutdown.await;
            trigger.cancel();
        });

        let report = sweep(executor, filter, options, cancel).await;
        listener.abort();
        guard.release()?;
        tracing::info!(sweeps = report.sweeps, jobs = report.jobs, "daemon stopped");
        Ok(report)
    }

    /// Re-execute `program` with `args` plus [`DETACHED_CHILD_FLAG`] as a
    /// background process and record it as the lease holder.
    pub fn spawn_detached(&self, program: &Path, args: &[OsString]) -> Result<u32> {
        if let LeaseStatus::Held { pid } = self.lease.status().unwrap_or(LeaseStatus::Free) {
            return Err(DaemonError::AlreadyRunning { pid }.into());
        }

        if let Some(parent) = self.log_file.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create log directory {}", parent.display()))?;
        }
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file)
            .with_context(|| format!("Failed to open log file {}", self.log_file.display()))?;
        let log_err = log.try_clone().context("Failed to duplicate log file handle")?;

        let mut command = Command::new(program);
        command
            .args(args)
            .arg(DETACHED_CHILD_FLAG)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to spawn {}", program.display()))?;
        let pid = child.id();

        self.lease.acquire_for(pid)?.persist();
        if let Some(status) = exited_during_startup(&mut child)? {
            self.lease.release_if_held_by(pid)?;
            anyhow::bail!(
                "Daemon exited during startup ({}); see {}",
                status,
                self.log_file.display()
            );
        }
        tracing::info!(pid, log = %self.log_file.display(), "daemon detached");
        Ok(pid)
    }

    /// Stop the running daemon: SIGTERM, wait up to the grace period, then
    /// SIGKILL.
    pub async fn stop(&self) -> Result<StopOutcome, DaemonError> {
        let pid = match self.lease.status() {
            Ok(LeaseStatus::Free) => return Ok(StopOutcome::NotRunning),
            Ok(LeaseStatus::Stale { pid }) => {
                self.lease.release()?;
                return Ok(StopOutcome::RemovedStale { pid: Some(pid) });
            }
            Err(DaemonError::InvalidRecord { .. }) => {
                self.lease.release()?;
                return Ok(StopOutcome::RemovedStale { pid: None });
            }
            Err(e) => return Err(e),
            Ok(LeaseStatus::Held { pid }) => pid,
        };

        tracing::info!(pid, "sending SIGTERM to daemon");
        send_signal(pid, libc::SIGTERM);
        let outcome = if wait_for_exit(pid, self.stop_grace).await {
            StopOutcome::Stopped { pid }
        } else {
            tracing::warn!(pid, grace_secs = self.stop_grace.as_secs(), "daemon ignored SIGTERM, sending SIGKILL");
            send_signal(pid, libc::SIGKILL);
            wait_for_exit(pid, KILL_WAIT).await;
            StopOutcome::Killed { pid }
        };
        self.lease.release_if_held_by(pid)?;
        Ok(outcome)
    }

    /// Current state plus log statistics. Never fails on a missing log.
    pub fn status(&self, lines: usize) -> DaemonStatus {
        let (state, pid) = match self.lease.status() {
            Ok(LeaseStatus::Free) => (DaemonState::Stopped, None),
            Ok(LeaseStatus::Held { pid }) => (DaemonState::Running, Some(pid)),
            Ok(LeaseStatus::Stale { pid }) => (DaemonState::Stale, Some(pid)),
            Err(e) => {
                tracing::debug!(error = %e, "unreadable PID file");
                (DaemonState::Stale, None)
            }
        };
        let (signals_detected, recent_log) = summarize_log(&self.log_file, lines);
        DaemonStatus {
            state,
            pid,
            pid_file: self.lease.path().to_path_buf(),
            log_file: self.log_file.clone(),
            signals_detected,
            recent_log,
        }
    }
}

fn send_signal(pid: u32, signal: libc::c_int) {
    let Ok(target) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: plain kill(2) on a pid read from our own record.
    if unsafe { libc::kill(target, signal) } != 0 {
        let e = std::io::Error::last_os_error();
        tracing::warn!(pid, signal, error = %e, "kill failed");
    }
}

async fn wait_for_exit(pid: u32, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if !process_alive(pid) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(STOP_POLL).await;
    }
}

/// Poll the child for [`STARTUP_WINDOW`]; its exit status if it died.
fn exited_during_startup(child: &mut std::process::Child) -> Result<Option<std::process::ExitStatus>> {
    let deadline = std::time::Instant::now() + STARTUP_WINDOW;
    loop {
        if let Some(status) = child
            .try_wait()
            .context("Failed to check the daemon process")?
        {
            return Ok(Some(status));
        }
        if std::time::Instant::now() >= deadline {
            return Ok(None);
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

/// Count detection markers and keep the last `lines` lines. Streams the
/// file since the log is never rotated.
fn summarize_log(path: &Path, lines: usize) -> (usize, Vec<String>) {
    let Ok(file) = File::open(path) else {
        return (0, Vec::new());
    };
    let mut reader = BufReader::new(file);
    let mut buf = Vec::new();
    let mut detected = 0;
    let mut tail = VecDeque::with_capacity(lines);
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "log read stopped early");
                break;
            }
        }
        let text = String::from_utf8_lossy(&buf);
        let line = text.trim_end_matches(['\n', '\r']);
        if line.contains(DETECTION_MARKER) {
            detected += 1;
        }
        if lines == 0 {
            continue;
        }
        if tail.len() == lines {
            tail.pop_front();
        }
        tail.push_back(line.to_string());
    }
    (detected, tail.into())
}
