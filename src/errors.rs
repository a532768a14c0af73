//! Typed error hierarchy for ferry.
//!
//! One enum per subsystem:
//! - `RunnerError`: spawning and waiting on external commands
//! - `ContainerError`: container lookup and file transfer
//! - `SyncError`: job-fatal failures inside a single sync job
//! - `DaemonError`: PID lease and daemon control failures
//! - `ConfigError`: configuration loading and validation

use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// Errors from the process runner.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Failed to spawn `{program}`: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{program}` timed out after {secs}s")]
    TimedOut { program: String, secs: u64 },

    #[error("I/O error while talking to `{program}`: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to open redirect target {path}: {source}")]
    RedirectFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the container directory.
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("Container {0} not found")]
    NotFound(String),

    #[error("`{command}` failed in container {container}: {message}")]
    ExecFailed {
        container: String,
        command: String,
        message: String,
    },

    #[error("Failed to copy {path} out of container {container}: {message}")]
    CopyFailed {
        container: String,
        path: String,
        message: String,
    },

    #[error(transparent)]
    Runner(#[from] RunnerError),
}

/// Stage of a sync job at which a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncStage {
    RetrievePatch,
    ClearSignal,
    VerifyClone,
    Fetch,
    CreateBranch,
    ApplyPatch,
    Commit,
    Push,
    OpenReview,
    CopyWorkspace,
}

impl std::fmt::Display for SyncStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SyncStage::RetrievePatch => "retrieve-patch",
            SyncStage::ClearSignal => "clear-signal",
            SyncStage::VerifyClone => "verify-clone",
            SyncStage::Fetch => "fetch",
            SyncStage::CreateBranch => "create-branch",
            SyncStage::ApplyPatch => "apply-patch",
            SyncStage::Commit => "commit",
            SyncStage::Push => "push",
            SyncStage::OpenReview => "open-review",
            SyncStage::CopyWorkspace => "copy-workspace",
        };
        f.write_str(name)
    }
}

/// Job-fatal errors. Each aborts the current sync job only.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Repository clone {path} does not exist or is not a git repository")]
    CloneMissing { path: PathBuf },

    #[error("Failed to retrieve patch {path}: {source}")]
    PatchRetrieval {
        path: String,
        #[source]
        source: ContainerError,
    },

    #[error("Failed to clear signal: {0}")]
    ClearSignal(#[source] ContainerError),

    #[error("git {step} failed: {stderr}")]
    Git { step: SyncStage, stderr: String },

    #[error("Failed to open review request: {0}")]
    Review(String),

    #[error("Failed to copy workspace: {0}")]
    CopyWorkspace(#[source] ContainerError),
}

impl SyncError {
    /// The stage this error aborts.
    pub fn stage(&self) -> SyncStage {
        match self {
            SyncError::CloneMissing { .. } => SyncStage::VerifyClone,
            SyncError::PatchRetrieval { .. } => SyncStage::RetrievePatch,
            SyncError::ClearSignal(_) => SyncStage::ClearSignal,
            SyncError::Git { step, .. } => *step,
            SyncError::Review(_) => SyncStage::OpenReview,
            SyncError::CopyWorkspace(_) => SyncStage::CopyWorkspace,
        }
    }
}

/// Errors from the daemon supervisor and its PID lease.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("ferry daemon already running (PID {pid})")]
    AlreadyRunning { pid: u32 },

    #[error("PID file {path} does not contain a process id: {content:?}")]
    InvalidRecord { path: PathBuf, content: String },

    #[error("Failed to lock {path}: {source}")]
    LockFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("PID file I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}
