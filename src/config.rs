//! Layered configuration.
//!
//! Precedence, lowest first: built-in defaults, `ferry.toml`, `FERRY_*`
//! environment variables, command-line flags. Environment and flags arrive
//! together through clap (each flag declares its variable), so this module
//! only merges the file with one set of [`Overrides`].
//!
//! # Configuration File Format
//!
//! ```toml
//! [watch]
//! interval_secs = 5
//! signal_path = "/workspace/.ferry-ready"
//! workspace_path = "/workspace"
//! label = "ferry.watch=true"
//! image_filter = "agent"
//! dry_run = false
//!
//! [paths]
//! repo_base = "~/repos"
//! staging_root = "~/.ferry/staging"
//!
//! [daemon]
//! pid_file = "~/.ferry/daemon.pid"
//! log_file = "~/.ferry/daemon.log"
//! stop_grace_secs = 10
//!
//! [commands]
//! runtime = "docker"
//! git = "git"
//! review = "gh"
//! remote = "origin"
//! # timeout_secs = 300
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::container::DiscoveryFilter;
use crate::errors::ConfigError;
use crate::sync::SyncSettings;
use crate::watch::WatchOptions;

/// File name looked up in the working directory and in `~/.ferry/`.
pub const CONFIG_FILE_NAME: &str = "ferry.toml";

/// Polling and signal settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub interval_secs: u64,
    pub signal_path: String,
    pub workspace_path: String,
    /// Opt-in container label; empty disables label discovery
    pub label: String,
    /// Image-name substring for fallback discovery; empty disables it
    pub image_filter: String,
    pub dry_run: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            signal_path: "/workspace/.ferry-ready".to_string(),
            workspace_path: "/workspace".to_string(),
            label: "ferry.watch=true".to_string(),
            image_filter: "agent".to_string(),
            dry_run: false,
        }
    }
}

/// Host directories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub repo_base: PathBuf,
    pub staging_root: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            repo_base: PathBuf::from("~/repos"),
            staging_root: PathBuf::from("~/.ferry/staging"),
        }
    }
}

/// Daemon record and log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub pid_file: PathBuf,
    pub log_file: PathBuf,
    pub stop_grace_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            pid_file: PathBuf::from("~/.ferry/daemon.pid"),
            log_file: PathBuf::from("~/.ferry/daemon.log"),
            stop_grace_secs: 10,
        }
    }
}

/// External CLIs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandsConfig {
    /// Container runtime CLI (`docker`, `podman`, ...)
    pub runtime: String,
    pub git: String,
    pub review: String,
    pub remote: String,
    /// Per-command timeout; unset means wait indefinitely
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            runtime: "docker".to_string(),
            git: "git".to_string(),
            review: "gh".to_string(),
            remote: "origin".to_string(),
            timeout_secs: None,
        }
    }
}

/// Effective configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FerryConfig {
    pub watch: WatchConfig,
    pub paths: PathsConfig,
    pub daemon: DaemonConfig,
    pub commands: CommandsConfig,
}

/// Values from the environment and the command line. `None` keeps the
/// file (or default) value.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub repo_base: Option<PathBuf>,
    pub interval_secs: Option<u64>,
    pub signal_path: Option<String>,
    pub workspace_path: Option<String>,
    pub staging_root: Option<PathBuf>,
    pub image_filter: Option<String>,
    pub label: Option<String>,
    pub pid_file: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    pub runtime: Option<String>,
    pub dry_run: bool,
}

impl FerryConfig {
    /// Parse a config file's content. `origin` names it in errors.
    pub fn parse(content: &str, origin: &Path) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content, path)
    }

    /// Where the config file comes from: the explicit path if given (it must
    /// exist), else `./ferry.toml`, else `~/.ferry/ferry.toml`.
    pub fn locate(explicit: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }
        let local = PathBuf::from(CONFIG_FILE_NAME);
        if local.is_file() {
            return Some(local);
        }
        dirs::home_dir()
            .map(|home| home.join(".ferry").join(CONFIG_FILE_NAME))
            .filter(|p| p.is_file())
    }

    /// Defaults, then the located file, then `overrides`; paths expanded
    /// and values validated.
    pub fn resolve(explicit: Option<&Path>, overrides: &Overrides) -> Result<(Self, Option<PathBuf>), ConfigError> {
        let source = Self::locate(explicit);
        let mut config = match &source {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply(overrides);
        config.expand_paths();
        config.validate()?;
        Ok((config, source))
    }

    pub fn apply(&mut self, o: &Overrides) {
        fn set<T: Clone>(slot: &mut T, value: &Option<T>) {
            if let Some(v) = value {
                *slot = v.clone();
            }
        }
        set(&mut self.paths.repo_base, &o.repo_base);
        set(&mut self.paths.staging_root, &o.staging_root);
        set(&mut self.watch.interval_secs, &o.interval_secs);
        set(&mut self.watch.signal_path, &o.signal_path);
        set(&mut self.watch.workspace_path, &o.workspace_path);
        set(&mut self.watch.image_filter, &o.image_filter);
        set(&mut self.watch.label, &o.label);
        set(&mut self.daemon.pid_file, &o.pid_file);
        set(&mut self.daemon.log_file, &o.log_file);
        set(&mut self.commands.runtime, &o.runtime);
        if o.dry_run {
            self.watch.dry_run = true;
        }
    }

    fn expand_paths(&mut self) {
        for path in [
            &mut self.paths.repo_base,
            &mut self.paths.staging_root,
            &mut self.daemon.pid_file,
            &mut self.daemon.log_file,
        ] {
            *path = expand_home(path);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &str, message: &str| ConfigError::InvalidValue {
            key: key.to_string(),
            message: message.to_string(),
        };
        if self.watch.interval_secs == 0 {
            return Err(invalid("interval_secs", "must be at least 1"));
        }
        if !self.watch.signal_path.starts_with('/') {
            return Err(invalid("signal_path", "must be an absolute path inside the container"));
        }
        if !self.watch.workspace_path.starts_with('/') {
            return Err(invalid("workspace_path", "must be an absolute path inside the container"));
        }
        if self.watch.label.is_empty() && self.watch.image_filter.is_empty() {
            return Err(invalid("label", "label and image_filter cannot both be empty"));
        }
        for (key, value) in [
            ("commands.runtime", &self.commands.runtime),
            ("commands.git", &self.commands.git),
            ("commands.review", &self.commands.review),
            ("commands.remote", &self.commands.remote),
        ] {
            if value.trim().is_empty() {
                return Err(invalid(key, "must not be empty"));
            }
        }
        if self.commands.timeout_secs == Some(0) {
            return Err(invalid("commands.timeout_secs", "must be at least 1 when set"));
        }
        Ok(())
    }

    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.watch.interval_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.daemon.stop_grace_secs)
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.commands.timeout_secs.map(Duration::from_secs)
    }

    pub fn watch_options(&self, once: bool) -> WatchOptions {
        WatchOptions {
            interval: self.interval(),
            once,
        }
    }

    pub fn discovery_filter(&self) -> DiscoveryFilter {
        let non_empty = |s: &str| (!s.trim().is_empty()).then(|| s.trim().to_string());
        DiscoveryFilter {
            label: non_empty(&self.watch.label),
            image: non_empty(&self.watch.image_filter),
        }
    }

    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            repo_base: self.paths.repo_base.clone(),
            signal_path: self.watch.signal_path.clone(),
            workspace_path: self.watch.workspace_path.clone(),
            staging_root: self.paths.staging_root.clone(),
            git_cmd: self.commands.git.clone(),
            remote: self.commands.remote.clone(),
            dry_run: self.watch.dry_run,
        }
    }
}

/// Replace a leading `~` with the home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match dirs::home_dir() {
        Some(home) => home.join(rest),
        None => path.to_path_buf(),
    }
}
