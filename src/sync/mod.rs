//! Sync execution: one detected signal in, one [`SyncOutcome`] out.
//!
//! Patch jobs run: retrieve patch, clear signal, verify clone, fetch the
//! default line, branch, apply, commit, push, open a review request. A
//! failure before the push rolls the clone back to where it was; nothing
//! partial ever reaches the remote. Raw-copy jobs copy the workspace tree
//! into a per-container staging directory.
//!
//! The signal is consumed before any git operation runs, so a failed job
//! is never retried from the same signal.

mod executor;
mod outcome;

pub use executor::{SyncExecutor, SyncSettings};
pub use outcome::SyncOutcome;
