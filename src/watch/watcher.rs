use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::container::ContainerHandle;
use crate::sync::{SyncExecutor, SyncOutcome};

/// Poll settings shared by every watcher of a run.
#[derive(Debug, Clone, Copy)]
pub struct WatchOptions {
    pub interval: Duration,
    /// Exit after the first poll.
    pub once: bool,
}

/// Why a watcher stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchExit {
    Cancelled,
    ContainerStopped,
    Once,
}

/// Summary of one watcher's run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchReport {
    pub container: String,
    pub exit: WatchExit,
    /// Signals handled, whatever their outcome.
    pub jobs: usize,
}

/// Poll one container until it stops, `cancel` fires, or after one poll
/// with `once`. Failed jobs and probe errors never end the loop.
pub async fn watch(
    executor: Arc<SyncExecutor>,
    handle: ContainerHandle,
    options: WatchOptions,
    cancel: CancellationToken,
) -> WatchReport {
    let containers = executor.containers();
    let mut jobs = 0;
    tracing::info!(container = %handle, interval_secs = options.interval.as_secs_f64(), "watching");

    let exit = loop {
        if cancel.is_cancelled() {
            break WatchExit::Cancelled;
        }
        if !containers.is_running(&handle).await {
            tracing::info!(container = %handle, "container no longer running");
            break WatchExit::ContainerStopped;
        }

        match containers
            .signal_present(&handle, executor.signal_path())
            .await
        {
            Ok(true) => match executor.process(&handle).await {
                Ok(SyncOutcome::NoSignal) => {}
                Ok(outcome) => {
                    jobs += 1;
                    tracing::debug!(container = %handle, %outcome, jobs, "job handled");
                }
                Err(e) => tracing::warn!(container = %handle, error = %e, "failed to read signal"),
            },
            Ok(false) => {}
            Err(e) => tracing::warn!(container = %handle, error = %e, "signal probe failed"),
        }

        if options.once {
            break WatchExit::Once;
        }

        tokio::select! {
            _ = cancel.cancelled() => break WatchExit::Cancelled,
            _ = tokio::time::sleep(options.interval) => {}
        }
    };

    tracing::info!(container = %handle, ?exit, jobs, "watcher finished");
    WatchReport {
        container: handle.name,
        exit,
        jobs,
    }
}
