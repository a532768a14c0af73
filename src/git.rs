//! Version-control operations on one local clone.
//!
//! Mutating operations (fetch, branch, apply, commit, push) go through the
//! `git` CLI so they pick up the operator's credentials and hooks. Read-only
//! inspection of the clone (does it exist, which branch is checked out) uses
//! `git2` directly.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use git2::{BranchType, Repository};

use crate::errors::{SyncError, SyncStage};
use crate::runner::{CommandOutput, CommandRunner, CommandSpec};

/// Conventional default-branch names, probed in order.
const DEFAULT_BRANCH_CANDIDATES: [&str; 2] = ["main", "master"];

/// A verified local clone.
pub struct GitRepo {
    path: PathBuf,
    runner: Arc<dyn CommandRunner>,
    git_cmd: String,
    remote: String,
}

impl GitRepo {
    /// Open the clone at `base/name`. Never creates anything: a missing or
    /// non-git directory is [`SyncError::CloneMissing`].
    pub fn open(
        base: &Path,
        name: &str,
        runner: Arc<dyn CommandRunner>,
        git_cmd: impl Into<String>,
        remote: impl Into<String>,
    ) -> Result<Self, SyncError> {
        let path = base.join(name);
        if Repository::open(&path).is_err() {
            return Err(SyncError::CloneMissing { path });
        }
        Ok(Self {
            path,
            runner,
            git_cmd: git_cmd.into(),
            remote: remote.into(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn repository(&self) -> Result<Repository, SyncError> {
        Repository::open(&self.path).map_err(|_| SyncError::CloneMissing {
            path: self.path.clone(),
        })
    }

    /// The checked-out branch, or the commit id for a detached HEAD.
    pub fn current_branch(&self) -> Result<String, SyncError> {
        let repo = self.repository()?;
        let head = repo.head().map_err(|e| SyncError::Git {
            step: SyncStage::CreateBranch,
            stderr: format!("cannot read HEAD: {}", e.message()),
        })?;
        if head.is_branch()
            && let Some(name) = head.shorthand()
        {
            return Ok(name.to_string());
        }
        head.target()
            .map(|oid| oid.to_string())
            .ok_or_else(|| SyncError::Git {
                step: SyncStage::CreateBranch,
                stderr: "HEAD does not point at a commit".to_string(),
            })
    }

    /// Whether a local branch with this name exists.
    pub fn branch_exists(&self, name: &str) -> bool {
        self.repository()
            .map(|repo| repo.find_branch(name, BranchType::Local).is_ok())
            .unwrap_or(false)
    }

    fn spec<I, S>(&self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandSpec::new(&self.git_cmd)
            .args(args)
            .current_dir(&self.path)
    }

    async fn git<I, S>(&self, step: SyncStage, args: I) -> Result<CommandOutput, SyncError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let spec = self.spec(args);
        tracing::debug!(repo = %self.path.display(), command = %spec.display(), "git");
        let out = self
            .runner
            .run(&spec)
            .await
            .map_err(|e| SyncError::Git {
                step,
                stderr: e.to_string(),
            })?;
        if out.success() {
            Ok(out)
        } else {
            Err(SyncError::Git {
                step,
                stderr: out.diagnostic(),
            })
        }
    }

    /// Name of the remote's default line: `main` if the remote has it,
    /// otherwise `master`.
    pub async fn default_branch(&self) -> Result<String, SyncError> {
        let [preferred, fallback] = DEFAULT_BRANCH_CANDIDATES;
        let probe = self.spec([
            "ls-remote",
            "--exit-code",
            "--heads",
            self.remote.as_str(),
            preferred,
        ]);
        let out = self
            .runner
            .run(&probe)
            .await
            .map_err(|e| SyncError::Git {
                step: SyncStage::Fetch,
                stderr: e.to_string(),
            })?;
        Ok(if out.success() { preferred } else { fallback }.to_string())
    }

    /// Fetch `branch` from the remote.
    pub async fn fetch(&self, branch: &str) -> Result<(), SyncError> {
        self.git(SyncStage::Fetch, ["fetch", self.remote.as_str(), branch])
            .await
            .map(drop)
    }

    /// Create and check out `name` starting at `<remote>/<start>`.
    pub async fn create_branch(&self, name: &str, start: &str) -> Result<(), SyncError> {
        let start_point = format!("{}/{}", self.remote, start);
        self.git(
            SyncStage::CreateBranch,
            ["checkout", "-b", name, start_point.as_str()],
        )
        .await
        .map(drop)
    }

    /// Apply a patch file to the working tree.
    pub async fn apply(&self, patch: &Path) -> Result<(), SyncError> {
        let patch = patch.display().to_string();
        self.git(SyncStage::ApplyPatch, ["apply", patch.as_str()])
            .await
            .map(drop)
    }

    /// Stage everything and commit.
    pub async fn commit_all(&self, message: &str) -> Result<(), SyncError> {
        self.git(SyncStage::Commit, ["add", "-A"]).await?;
        self.git(SyncStage::Commit, ["commit", "-m", message])
            .await
            .map(drop)
    }

    /// Push `branch` and set its upstream.
    pub async fn push(&self, branch: &str) -> Result<(), SyncError> {
        self.git(SyncStage::Push, ["push", "-u", self.remote.as_str(), branch])
            .await
            .map(drop)
    }

    /// Check out an existing branch (or commit).
    pub async fn checkout(&self, target: &str) -> Result<(), SyncError> {
        self.git(SyncStage::CreateBranch, ["checkout", target])
            .await
            .map(drop)
    }

    /// Undo a job that never reached the remote: discard working-tree and
    /// index changes, return to `original`, delete `created`.
    ///
    /// Best effort; each failing step is logged and the rest still run.
    pub async fn rollback(&self, original: &str, created: &str) {
        let steps: [Vec<&str>; 3] = [
            vec!["reset", "--hard"],
            vec!["checkout", "-f", original],
            vec!["branch", "-D", created],
        ];
        for args in steps {
            if let Err(e) = self.git(SyncStage::CreateBranch, args.clone()).await {
                tracing::error!(
                    repo = %self.path.display(),
                    command = %args.join(" "),
                    error = %e,
                    "rollback step failed"
                );
            }
        }
    }

    /// `git --version`, used by the startup preflight.
    pub async fn probe(runner: &dyn CommandRunner, git_cmd: &str) -> anyhow::Result<String> {
        let out = runner.run(&CommandSpec::new(git_cmd).arg("--version")).await?;
        if !out.success() {
            anyhow::bail!("`{} --version` failed: {}", git_cmd, out.diagnostic());
        }
        Ok(out.stdout.trim().to_string())
    }
}
