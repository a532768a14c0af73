//! Review requests through the `gh` CLI.

use std::path::Path;
use std::sync::Arc;

use crate::errors::SyncError;
use crate::runner::{CommandRunner, CommandSpec};

/// What a review request is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewRequest<'a> {
    pub title: &'a str,
    pub container: &'a str,
    pub branch: &'a str,
}

impl ReviewRequest<'_> {
    /// Body recording where the change came from.
    pub fn body(&self) -> String {
        format!(
            "## Summary\n\n{}\n\n- Container: `{}`\n- Branch: `{}`\n\n---\n*Opened by ferry*",
            self.title, self.container, self.branch
        )
    }
}

/// Opens pull requests for pushed branches.
#[derive(Clone)]
pub struct ReviewClient {
    runner: Arc<dyn CommandRunner>,
    review_cmd: String,
}

impl ReviewClient {
    pub fn new(runner: Arc<dyn CommandRunner>, review_cmd: impl Into<String>) -> Self {
        Self {
            runner,
            review_cmd: review_cmd.into(),
        }
    }

    /// `gh pr create` from inside the clone; returns the printed PR URL.
    pub async fn open(&self, clone: &Path, request: &ReviewRequest<'_>) -> Result<String, SyncError> {
        let body = request.body();
        let spec = CommandSpec::new(&self.review_cmd)
            .args(["pr", "create", "--title", request.title, "--body", body.as_str()])
            .current_dir(clone);
        let out = self
            .runner
            .run(&spec)
            .await
            .map_err(|e| SyncError::Review(e.to_string()))?;
        if !out.success() {
            return Err(SyncError::Review(out.diagnostic()));
        }
        // gh prints progress lines before the URL on some versions
        let url = out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .next_back()
            .unwrap_or_default()
            .to_string();
        Ok(url)
    }

    /// `gh --version`, used by the startup preflight.
    pub async fn probe(&self) -> anyhow::Result<String> {
        let out = self
            .runner
            .run(&CommandSpec::new(&self.review_cmd).arg("--version"))
            .await?;
        if !out.success() {
            anyhow::bail!("`{} --version` failed: {}", self.review_cmd, out.diagnostic());
        }
        Ok(out.stdout.lines().next().unwrap_or_default().trim().to_string())
    }
}
