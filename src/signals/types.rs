//! Readiness-signal types.
//!
//! Defines what an agent's signal file decodes into.

use serde::{Deserialize, Serialize};

/// Signal keys, in the order they are reported when missing.
pub const KEY_REPO: &str = "REPO";
pub const KEY_PATCH: &str = "PATCH";
pub const KEY_BRANCH: &str = "BRANCH";
pub const KEY_MESSAGE: &str = "MESSAGE";

/// A structured patch job.
///
/// The agent writes:
///
/// ```text
/// REPO=<repository-directory-name>
/// PATCH=<absolute-path-to-patch-file-inside-container>
/// BRANCH=<branch-name-prefix>
/// MESSAGE=<commit-message-and-review-request-title>
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchJob {
    /// Directory name of the local clone under the repository base
    pub repo: String,
    /// Path of the patch file inside the container
    pub patch: String,
    /// Prefix for the generated branch name
    pub branch: String,
    /// Commit message and review-request title
    pub message: String,
}

impl PatchJob {
    /// Branch name for a job created at `timestamp` (unix seconds).
    pub fn branch_name(&self, timestamp: i64) -> String {
        format!("{}-{}", self.branch, timestamp)
    }
}

/// Result of decoding a signal file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// Whitespace-only content: copy the whole workspace, no git.
    RawCopy,
    /// A complete patch job.
    Patch(PatchJob),
    /// Structurally invalid content.
    Invalid {
        /// Why the content was rejected
        reason: String,
        /// The original content, for diagnostics
        content: String,
    },
}

impl Decoded {
    /// Short label used in logs.
    pub fn mode(&self) -> &'static str {
        match self {
            Decoded::RawCopy => "raw-copy",
            Decoded::Patch(_) => "patch",
            Decoded::Invalid { .. } => "invalid",
        }
    }
}
