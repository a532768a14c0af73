//! Wiring from an effective configuration to running components.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::FerryConfig;
use crate::container::ContainerDirectory;
use crate::git::GitRepo;
use crate::review::ReviewClient;
use crate::runner::{CommandRunner, SystemRunner};
use crate::sync::SyncExecutor;

/// The shared pieces every command needs.
pub struct App {
    pub config: FerryConfig,
    pub runner: Arc<dyn CommandRunner>,
    pub containers: ContainerDirectory,
    pub review: ReviewClient,
    pub executor: Arc<SyncExecutor>,
}

/// One verified external tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolVersion {
    pub tool: String,
    pub version: String,
}

impl App {
    pub fn new(config: FerryConfig) -> Self {
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner::new(config.command_timeout()));
        Self::with_runner(config, runner)
    }

    pub fn with_runner(config: FerryConfig, runner: Arc<dyn CommandRunner>) -> Self {
        let containers = ContainerDirectory::new(runner.clone(), &config.commands.runtime);
        let review = ReviewClient::new(runner.clone(), &config.commands.review);
        let executor = Arc::new(SyncExecutor::new(
            containers.clone(),
            review.clone(),
            runner.clone(),
            config.sync_settings(),
        ));
        Self {
            config,
            runner,
            containers,
            review,
            executor,
        }
    }

    /// Check the external CLIs before any watching starts. The container
    /// runtime is always required; `git` and `gh` only when jobs will
    /// really run.
    pub async fn preflight(&self) -> Result<Vec<ToolVersion>> {
        let commands = &self.config.commands;
        let mut found = Vec::new();

        let version = self
            .containers
            .probe_runtime()
            .await
            .with_context(|| format!("Container runtime `{}` is not available", commands.runtime))?;
        found.push(ToolVersion {
            tool: commands.runtime.clone(),
            version,
        });

        if self.config.watch.dry_run {
            tracing::debug!("dry run: skipping git and review CLI checks");
            return Ok(found);
        }

        let version = GitRepo::probe(self.runner.as_ref(), &commands.git)
            .await
            .with_context(|| format!("`{}` is not available", commands.git))?;
        found.push(ToolVersion {
            tool: commands.git.clone(),
            version,
        });

        let version = self
            .review
            .probe()
            .await
            .with_context(|| format!("Review CLI `{}` is not available", commands.review))?;
        found.push(ToolVersion {
            tool: commands.review.clone(),
            version,
        });

        for tool in &found {
            tracing::debug!(tool = %tool.tool, version = %tool.version, "preflight ok");
        }
        Ok(found)
    }
}
