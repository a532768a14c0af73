use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

use ferry::config::{FerryConfig, Overrides};
use ferry::logging::{self, LogTarget};

mod cmd;

#[derive(Parser)]
#[command(name = "ferry")]
#[command(
    version,
    about = "Carry finished work out of agent containers into branches and pull requests"
)]
pub struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (default: ./ferry.toml, then ~/.ferry/ferry.toml)
    #[arg(long, global = true, env = "FERRY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory holding the local repository clones
    #[arg(long, global = true, env = "FERRY_REPO_BASE")]
    pub repo_base: Option<PathBuf>,

    /// Poll interval in seconds
    #[arg(long, global = true, env = "FERRY_INTERVAL")]
    pub interval: Option<u64>,

    /// Signal file path inside the container
    #[arg(long, global = true, env = "FERRY_SIGNAL_PATH")]
    pub signal_path: Option<String>,

    /// Workspace directory inside the container (raw-copy source)
    #[arg(long, global = true, env = "FERRY_WORKSPACE_PATH")]
    pub workspace_path: Option<String>,

    /// Host directory receiving raw workspace copies
    #[arg(long, global = true, env = "FERRY_STAGING_ROOT")]
    pub staging_root: Option<PathBuf>,

    /// Image-name substring used when no container carries the label
    #[arg(long, global = true, env = "FERRY_IMAGE_FILTER")]
    pub image_filter: Option<String>,

    /// Container label marking containers to watch
    #[arg(long, global = true, env = "FERRY_LABEL")]
    pub label: Option<String>,

    /// Daemon PID file
    #[arg(long, global = true, env = "FERRY_PID_FILE")]
    pub pid_file: Option<PathBuf>,

    /// Daemon log file
    #[arg(long, global = true, env = "FERRY_LOG_FILE")]
    pub log_file: Option<PathBuf>,

    /// Container runtime CLI (docker, podman)
    #[arg(long, global = true, env = "FERRY_RUNTIME")]
    pub runtime: Option<String>,

    /// Log intended actions and clear signals without touching any repository
    #[arg(long, global = true, env = "FERRY_DRY_RUN")]
    pub dry_run: bool,

    /// Set on the respawned background daemon process
    #[arg(long, global = true, hide = true)]
    pub detached_child: bool,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            repo_base: self.repo_base.clone(),
            interval_secs: self.interval,
            signal_path: self.signal_path.clone(),
            workspace_path: self.workspace_path.clone(),
            staging_root: self.staging_root.clone(),
            image_filter: self.image_filter.clone(),
            label: self.label.clone(),
            pid_file: self.pid_file.clone(),
            log_file: self.log_file.clone(),
            runtime: self.runtime.clone(),
            dry_run: self.dry_run,
        }
    }

    fn log_target(&self, config: &FerryConfig) -> LogTarget {
        let log_file = config.daemon.log_file.clone();
        match &self.command {
            Commands::Daemon {
                command: DaemonCommands::Start { .. },
            } if self.detached_child => LogTarget::File(log_file),
            Commands::Daemon {
                command: DaemonCommands::Start { detach: false },
            } => LogTarget::StderrAndFile(log_file),
            _ => LogTarget::Stderr,
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Watch a single container until it stops
    Watch {
        /// Container id or name
        container: String,
        /// Poll once and exit
        #[arg(long)]
        once: bool,
    },
    /// Watch every matching container concurrently
    WatchAll {
        /// Poll each container once and exit
        #[arg(long)]
        once: bool,
    },
    /// Manage the background daemon
    Daemon {
        #[command(subcommand)]
        command: DaemonCommands,
    },
    /// View configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum DaemonCommands {
    /// Start the daemon
    Start {
        /// Run in the background
        #[arg(long)]
        detach: bool,
    },
    /// Stop the running daemon
    Stop,
    /// Show daemon state and recent log lines
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
        /// Number of log lines to show
        #[arg(long, default_value = "10")]
        lines: usize,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config, source) = FerryConfig::resolve(cli.config.as_deref(), &cli.overrides())
        .context("Failed to load configuration")?;
    let _log = logging::init(cli.verbose, cli.log_target(&config))?;
    if let Some(path) = &source {
        tracing::debug!(path = %path.display(), "configuration loaded");
    }

    match &cli.command {
        Commands::Watch { container, once } => {
            cmd::cmd_watch(config, container, *once).await?;
        }
        Commands::WatchAll { once } => {
            cmd::cmd_watch_all(config, *once).await?;
        }
        Commands::Daemon { command } => match command {
            DaemonCommands::Start { detach } => {
                cmd::cmd_daemon_start(config, *detach, cli.detached_child).await?
            }
            DaemonCommands::Stop => cmd::cmd_daemon_stop(&config).await?,
            DaemonCommands::Status { json, lines } => cmd::cmd_daemon_status(&config, *json, *lines)?,
        },
        Commands::Config { command } => {
            cmd::cmd_config(&config, source.as_deref(), command.clone())?;
        }
    }

    Ok(())
}
