use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::container::DiscoveryFilter;
use crate::errors::ContainerError;
use crate::sync::{SyncExecutor, SyncOutcome};

use super::watcher::{WatchOptions, WatchReport, watch};

/// Result of a fan-out run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FanOutReport {
    pub started: usize,
    pub finished: usize,
    /// Watchers still running when the grace period ran out.
    pub aborted: usize,
}

/// One watcher task per discovered container.
///
/// Runs until every watcher has exited or `shutdown` resolves. On shutdown
/// the shared token is cancelled; watchers get `grace` to finish the poll
/// or job they are in, then the rest are aborted.
pub async fn fan_out<F>(
    executor: Arc<SyncExecutor>,
    filter: &DiscoveryFilter,
    options: WatchOptions,
    grace: Duration,
    shutdown: F,
) -> Result<FanOutReport, ContainerError>
where
    F: Future<Output = ()>,
{
    let handles = executor.containers().discover(filter).await?;
    if handles.is_empty() {
        tracing::warn!(label = ?filter.label, image = ?filter.image, "no matching containers found");
        return Ok(FanOutReport::default());
    }

    let cancel = CancellationToken::new();
    let mut set: JoinSet<WatchReport> = JoinSet::new();
    let mut report = FanOutReport::default();
    for handle in handles {
        set.spawn(watch(executor.clone(), handle, options, cancel.child_token()));
        report.started += 1;
    }
    tracing::info!(watchers = report.started, "fan-out started");

    tokio::pin!(shutdown);
    let stopping = loop {
        tokio::select! {
            joined = set.join_next() => match joined {
                Some(result) => {
                    log_join(result);
                    report.finished += 1;
                }
                None => break false,
            },
            _ = &mut shutdown => break true,
        }
    };

    if stopping {
        tracing::info!(remaining = set.len(), grace_secs = grace.as_secs_f64(), "shutting down watchers");
        cancel.cancel();
        let deadline = tokio::time::sleep(grace);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                joined = set.join_next() => match joined {
                    Some(result) => {
                        log_join(result);
                        report.finished += 1;
                    }
                    None => break,
                },
                _ = &mut deadline => {
                    report.aborted = set.len();
                    tracing::warn!(aborted = report.aborted, "grace period elapsed, aborting watchers");
                    set.abort_all();
                    while set.join_next().await.is_some() {}
                    break;
                }
            }
        }
    }

    tracing::info!(
        started = report.started,
        finished = report.finished,
        aborted = report.aborted,
        "fan-out finished"
    );
    Ok(report)
}

fn log_join(result: Result<WatchReport, tokio::task::JoinError>) {
    match result {
        Ok(report) => {
            tracing::debug!(container = %report.container, exit = ?report.exit, jobs = report.jobs, "watcher joined")
        }
        Err(e) if e.is_cancelled() => {}
        Err(e) => tracing::error!(error = %e, "watcher task panicked"),
    }
}

/// Totals for a sweep run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub sweeps: u64,
    pub jobs: u64,
}

/// Single re-discovering loop, used by the daemon.
///
/// Each pass discovers containers afresh and handles any present signals
/// one after another. One failing container or job never ends the pass.
pub async fn sweep(
    executor: Arc<SyncExecutor>,
    filter: &DiscoveryFilter,
    options: WatchOptions,
    cancel: CancellationToken,
) -> SweepReport {
    let containers = executor.containers();
    let mut report = SweepReport::default();

    loop {
        if cancel.is_cancelled() {
            break;
        }
        report.sweeps += 1;
        let mut handled = 0u64;

        match containers.discover(filter).await {
            Ok(handles) => {
                for handle in handles {
                    if cancel.is_cancelled() {
                        break;
                    }
                    match containers
                        .signal_present(&handle, executor.signal_path())
                        .await
                    {
                        Ok(true) => match executor.process(&handle).await {
                            Ok(SyncOutcome::NoSignal) => {}
                            Ok(_) => handled += 1,
                            Err(e) => {
                                tracing::warn!(container = %handle, error = %e, "failed to read signal")
                            }
                        },
                        Ok(false) => {}
                        Err(e) => tracing::warn!(container = %handle, error = %e, "signal probe failed"),
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "container discovery failed"),
        }

        report.jobs += handled;
        tracing::debug!(sweep = report.sweeps, jobs = handled, "sweep complete");

        if options.once {
            break;
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(options.interval) => {}
        }
    }

    tracing::info!(sweeps = report.sweeps, jobs = report.jobs, "sweep loop stopped");
    report
}

#[cfg(test)]
mod tests {
    use super::super::test_support::dry_executor;
    use super::*;
    use crate::errors::RunnerError;
    use crate::runner::testing::ScriptedRunner;
    use crate::runner::{CommandOutput, CommandRunner, CommandSpec};
    use async_trait::async_trait;

    const PS: &str = r#"{"ID":"abc123","Image":"agent:1","Names":"agent-1","State":"running"}
{"ID":"def456","Image":"agent:1","Names":"agent-2","State":"running"}
"#;

    fn filter() -> DiscoveryFilter {
        DiscoveryFilter {
            label: Some("ferry.watch=true".into()),
            image: Some("agent".into()),
        }
    }

    fn two_containers() -> ScriptedRunner {
        ScriptedRunner::new()
            .on("label=ferry.watch=true", CommandOutput::ok(PS))
            .on("inspect", CommandOutput::ok("true"))
            .on("test -f", CommandOutput::failed(1, ""))
    }

    /// Never returns from a signal probe.
    struct StallingRunner(ScriptedRunner);

    #[async_trait]
    impl CommandRunner for StallingRunner {
        async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, RunnerError> {
            if spec.args.iter().any(|a| a == "test") {
                std::future::pending::<()>().await;
            }
            self.0.run(spec).await
        }

        async fn pipe(
            &self,
            producer: &CommandSpec,
            consumer: &CommandSpec,
        ) -> Result<CommandOutput, RunnerError> {
            self.0.pipe(producer, consumer).await
        }
    }

    const SLOW: WatchOptions = WatchOptions {
        interval: Duration::from_secs(60),
        once: false,
    };

    #[tokio::test]
    async fn test_fan_out_once_runs_every_watcher() {
        let runner = Arc::new(two_containers());
        let report = fan_out(
            dry_executor(runner.clone()),
            &filter(),
            WatchOptions { once: true, ..SLOW },
            Duration::from_secs(1),
            std::future::pending(),
        )
        .await
        .unwrap();

        assert_eq!(
            report,
            FanOutReport {
                started: 2,
                finished: 2,
                aborted: 0
            }
        );
        assert_eq!(runner.calls_matching("test -f").len(), 2);
    }

    #[tokio::test]
    async fn test_fan_out_without_containers_returns_empty_report() {
        let runner = Arc::new(ScriptedRunner::new());
        let report = fan_out(
            dry_executor(runner),
            &filter(),
            SLOW,
            Duration::from_secs(1),
            std::future::pending(),
        )
        .await
        .unwrap();
        assert_eq!(report, FanOutReport::default());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_sleeping_watchers() {
        let runner = Arc::new(two_containers());
        let report = fan_out(
            dry_executor(runner),
            &filter(),
            SLOW,
            Duration::from_secs(5),
            tokio::time::sleep(Duration::from_millis(50)),
        )
        .await
        .unwrap();

        assert_eq!(report.started, 2);
        assert_eq!(report.finished, 2);
        assert_eq!(report.aborted, 0);
    }

    #[tokio::test]
    async fn test_stuck_watchers_are_aborted_after_grace() {
        let runner = Arc::new(StallingRunner(two_containers()));
        let report = fan_out(
            dry_executor(runner),
            &filter(),
            SLOW,
            Duration::from_millis(50),
            tokio::time::sleep(Duration::from_millis(20)),
        )
        .await
        .unwrap();

        assert_eq!(report.started, 2);
        assert_eq!(report.finished, 0);
        assert_eq!(report.aborted, 2);
    }

    #[tokio::test]
    async fn test_sweep_once_handles_present_signals() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .on("label=ferry.watch=true", CommandOutput::ok(PS))
                .on("exec abc123 test -f", CommandOutput::ok(""))
                .on("exec def456 test -f", CommandOutput::failed(1, ""))
                .on("cat /workspace/.ferry-ready", CommandOutput::ok("")),
        );
        let report = sweep(
            dry_executor(runner.clone()),
            &filter(),
            WatchOptions { once: true, ..SLOW },
            CancellationToken::new(),
        )
        .await;

        assert_eq!(report, SweepReport { sweeps: 1, jobs: 1 });
        assert_eq!(
            runner.calls_matching("rm -f"),
            vec!["docker exec abc123 rm -f /workspace/.ferry-ready"]
        );
    }

    #[tokio::test]
    async fn test_sweep_survives_discovery_failure() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .on_seq(
                    "ps",
                    vec![CommandOutput::failed(1, "daemon unavailable"), CommandOutput::ok(PS)],
                )
                .on("test -f", CommandOutput::failed(1, "")),
        );
        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            stopper.cancel();
        });
        let report = sweep(
            dry_executor(runner.clone()),
            &filter(),
            WatchOptions {
                interval: Duration::from_millis(10),
                once: false,
            },
            cancel,
        )
        .await;

        assert!(report.sweeps >= 2);
        assert!(!runner.calls_matching("test -f").is_empty());
    }

    #[tokio::test]
    async fn test_sweep_stops_when_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = sweep(
            dry_executor(Arc::new(ScriptedRunner::new())),
            &filter(),
            SLOW,
            cancel,
        )
        .await;
        assert_eq!(report, SweepReport::default());
    }
}
