use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use crate::errors::SyncStage;

/// How one detected signal was handled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
    /// Workspace tree copied into the staging directory.
    RawCopied { destination: PathBuf },
    /// Branch pushed and review request opened.
    ReviewOpened {
        repo: String,
        branch: String,
        url: String,
    },
    /// Dry-run: intended actions logged, signal cleared, nothing else.
    DryRun,
    /// Signal content rejected; cleared without further action.
    Invalid { reason: String },
    /// The job aborted at `stage`.
    Failed { stage: SyncStage, error: String },
    /// The signal disappeared between the presence probe and the read.
    NoSignal,
}

impl SyncOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, SyncOutcome::Failed { .. } | SyncOutcome::Invalid { .. })
    }
}

impl fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncOutcome::RawCopied { destination } => {
                write!(f, "workspace copied to {}", destination.display())
            }
            SyncOutcome::ReviewOpened { repo, branch, url } => {
                write!(f, "{}: pushed {} and opened {}", repo, branch, url)
            }
            SyncOutcome::DryRun => f.write_str("dry run"),
            SyncOutcome::Invalid { reason } => write!(f, "invalid signal: {}", reason),
            SyncOutcome::Failed { stage, error } => write!(f, "failed at {}: {}", stage, error),
            SyncOutcome::NoSignal => f.write_str("no signal"),
        }
    }
}
