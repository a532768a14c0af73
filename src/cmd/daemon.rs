//! Daemon lifecycle commands: `ferry daemon start|stop|status`.

use std::ffi::OsString;

use anyhow::{Context, Result};
use console::style;

use ferry::app::App;
use ferry::config::FerryConfig;
use ferry::daemon::{DaemonState, DaemonStatus, LeaseStatus, StopOutcome, Supervisor};
use ferry::errors::DaemonError;
use ferry::watch;

fn supervisor(config: &FerryConfig) -> Supervisor {
    Supervisor::new(
        &config.daemon.pid_file,
        &config.daemon.log_file,
        config.stop_grace(),
    )
}

pub async fn cmd_daemon_start(config: FerryConfig, detach: bool, detached_child: bool) -> Result<()> {
    let sup = supervisor(&config);
    if !detached_child
        && let Ok(LeaseStatus::Held { pid }) = sup.lease().status()
    {
        return Err(DaemonError::AlreadyRunning { pid }.into());
    }

    if detach && !detached_child {
        let program = std::env::current_exe().context("Failed to locate the ferry executable")?;
        let args: Vec<OsString> = std::env::args_os()
            .skip(1)
            .filter(|arg| arg != "--detach")
            .collect();
        // fail before forking when a tool is missing
        App::new(config.clone()).preflight().await?;
        let pid = sup.spawn_detached(&program, &args)?;
        println!(
            "{} Daemon started in the background (PID {})",
            style("✓").green(),
            pid
        );
        println!("  Log: {}", config.daemon.log_file.display());
        return Ok(());
    }

    let app = App::new(config);
    app.preflight().await?;
    let filter = app.config.discovery_filter();
    let report = sup
        .run_attached(
            app.executor.clone(),
            &filter,
            app.config.watch_options(false),
            watch::shutdown_signal(),
        )
        .await?;

    if !detached_child {
        println!(
            "{} Daemon stopped after {} sweep(s), {} job(s)",
            style("✓").green(),
            report.sweeps,
            report.jobs
        );
    }
    Ok(())
}

pub async fn cmd_daemon_stop(config: &FerryConfig) -> Result<()> {
    match supervisor(config).stop().await? {
        StopOutcome::NotRunning => println!("{} Daemon is not running", style("●").dim()),
        StopOutcome::RemovedStale { pid } => {
            let pid = pid.map(|p| format!(" (PID {})", p)).unwrap_or_default();
            println!(
                "{} Daemon is not running; removed stale PID file{}",
                style("●").dim(),
                pid
            );
        }
        StopOutcome::Stopped { pid } => {
            println!("{} Daemon stopped (PID {})", style("✓").green(), pid)
        }
        StopOutcome::Killed { pid } => println!(
            "{} Daemon did not exit within {}s and was killed (PID {})",
            style("!").yellow(),
            config.daemon.stop_grace_secs,
            pid
        ),
    }
    Ok(())
}

pub fn cmd_daemon_status(config: &FerryConfig, json: bool, lines: usize) -> Result<()> {
    let status = supervisor(config).status(lines);
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        print_status(&status);
    }
    Ok(())
}

fn print_status(status: &DaemonStatus) {
    let pid = status.pid.map(|p| format!(" (PID {})", p)).unwrap_or_default();
    match status.state {
        DaemonState::Running => println!("{} Daemon running{}", style("●").green(), pid),
        DaemonState::Stopped => println!("{} Daemon stopped", style("●").dim()),
        DaemonState::Stale => println!(
            "{} Daemon not running, stale PID file{}",
            style("●").yellow(),
            pid
        ),
    }
    println!("  PID file: {}", status.pid_file.display());
    println!("  Log file: {}", status.log_file.display());
    println!("  Signals detected: {}", status.signals_detected);

    if !status.recent_log.is_empty() {
        println!();
        println!("{}", style("Recent log:").bold());
        for line in &status.recent_log {
            println!("  {}", line);
        }
    }
}
