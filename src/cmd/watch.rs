//! Foreground watching: `ferry watch` and `ferry watch-all`.

use anyhow::{Context, Result};
use console::style;
use tokio_util::sync::CancellationToken;

use ferry::app::App;
use ferry::config::FerryConfig;
use ferry::watch::{self, WatchExit};

pub async fn cmd_watch(config: FerryConfig, container: &str, once: bool) -> Result<()> {
    let app = App::new(config);
    app.preflight().await?;

    let handle = app
        .containers
        .resolve(container)
        .await
        .with_context(|| format!("Cannot watch container {}", container))?;
    if !handle.running {
        anyhow::bail!("Container {} is not running", handle.name);
    }

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let listener = tokio::spawn(async move {
        watch::shutdown_signal().await;
        trigger.cancel();
    });

    let options = app.config.watch_options(once);
    let report = watch::watch(app.executor.clone(), handle, options, cancel).await;
    listener.abort();

    let reason = match report.exit {
        WatchExit::Cancelled => "interrupted",
        WatchExit::ContainerStopped => "container stopped",
        WatchExit::Once => "single poll",
    };
    println!(
        "{} {}: {} job(s) handled ({})",
        style("●").cyan(),
        style(&report.container).bold(),
        report.jobs,
        reason
    );
    Ok(())
}

pub async fn cmd_watch_all(config: FerryConfig, once: bool) -> Result<()> {
    let app = App::new(config);
    app.preflight().await?;

    let filter = app.config.discovery_filter();
    let report = watch::fan_out(
        app.executor.clone(),
        &filter,
        app.config.watch_options(once),
        app.config.stop_grace(),
        watch::shutdown_signal(),
    )
    .await
    .context("Container discovery failed")?;

    if report.started == 0 {
        println!("{} No matching containers found", style("!").yellow());
        return Ok(());
    }
    println!(
        "{} {} watcher(s) started, {} finished, {} aborted",
        style("●").cyan(),
        report.started,
        report.finished,
        report.aborted
    );
    Ok(())
}
