//! CLI command implementations.
//!
//! | Module   | Commands handled                |
//! |----------|---------------------------------|
//! | `watch`  | `Watch`, `WatchAll`             |
//! | `daemon` | `Daemon start`, `stop`, `status`|
//! | `config` | `Config`                        |

pub mod config;
pub mod daemon;
pub mod watch;

pub use config::cmd_config;
pub use daemon::{cmd_daemon_start, cmd_daemon_status, cmd_daemon_stop};
pub use watch::{cmd_watch, cmd_watch_all};
