//! Singleton background daemon.
//!
//! One daemon per PID file. `start` either runs the sweep loop in the
//! foreground or respawns the current executable detached; `stop` signals
//! the recorded process; `status` reports liveness plus a summary of the
//! log file.

pub mod lease;
mod supervisor;

pub use lease::{LeaseGuard, LeaseStatus, PidLease};
pub use supervisor::{
    DETACHED_CHILD_FLAG, DETECTION_MARKER, DaemonState, DaemonStatus, StopOutcome, Supervisor,
};
