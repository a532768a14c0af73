use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::container::{ContainerDirectory, ContainerHandle};
use crate::errors::{ContainerError, SyncError};
use crate::git::GitRepo;
use crate::review::{ReviewClient, ReviewRequest};
use crate::runner::CommandRunner;
use crate::signals::{Decoded, PatchJob, SignalParser};

use super::SyncOutcome;

/// Settings the executor needs from the effective configuration.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub repo_base: PathBuf,
    pub signal_path: String,
    pub workspace_path: String,
    pub staging_root: PathBuf,
    pub git_cmd: String,
    pub remote: String,
    pub dry_run: bool,
}

/// Local copy of a retrieved patch; removed when dropped.
struct TempPatch {
    path: PathBuf,
}

impl TempPatch {
    fn new() -> Self {
        Self {
            path: std::env::temp_dir().join(format!("ferry-{}.patch", Uuid::new_v4())),
        }
    }
}

impl Drop for TempPatch {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to remove temporary patch");
        }
    }
}

/// Turns a detected signal into its side effects.
///
/// Shared by every watcher of a process. Jobs on the same repository
/// serialize on a per-repository lock for their git section; everything
/// else runs concurrently.
pub struct SyncExecutor {
    containers: ContainerDirectory,
    review: ReviewClient,
    runner: Arc<dyn CommandRunner>,
    settings: SyncSettings,
    parser: SignalParser,
    repo_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    clock: fn() -> i64,
}

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

impl SyncExecutor {
    pub fn new(
        containers: ContainerDirectory,
        review: ReviewClient,
        runner: Arc<dyn CommandRunner>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            containers,
            review,
            runner,
            settings,
            parser: SignalParser,
            repo_locks: Mutex::new(HashMap::new()),
            clock: unix_now,
        }
    }

    /// Replace the branch timestamp source.
    pub fn with_clock(mut self, clock: fn() -> i64) -> Self {
        self.clock = clock;
        self
    }

    pub fn containers(&self) -> &ContainerDirectory {
        &self.containers
    }

    pub fn signal_path(&self) -> &str {
        &self.settings.signal_path
    }

    fn repo_lock(&self, repo: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .repo_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(repo.to_string()).or_default().clone()
    }

    /// Handle the signal in `handle`, if there still is one.
    ///
    /// `Err` means the signal could not be read at all; that is a
    /// transient probe failure and the caller retries on the next poll.
    pub async fn process(&self, handle: &ContainerHandle) -> Result<SyncOutcome, ContainerError> {
        let Some(content) = self
            .containers
            .read_signal(handle, &self.settings.signal_path)
            .await?
        else {
            return Ok(SyncOutcome::NoSignal);
        };

        let decoded = self.parser.parse(&content);
        tracing::info!(container = %handle, mode = decoded.mode(), "signal detected");

        let outcome = match decoded {
            Decoded::Invalid { reason, content } => {
                tracing::error!(container = %handle, %reason, %content, "invalid signal");
                self.clear_logged(handle).await;
                SyncOutcome::Invalid { reason }
            }
            decoded if self.settings.dry_run => self.dry_run(handle, &decoded).await,
            Decoded::RawCopy => self.finish(handle, None, self.raw_copy(handle).await),
            Decoded::Patch(job) => {
                let result = self.patch(handle, &job).await;
                self.finish(handle, Some(&job), result)
            }
        };
        Ok(outcome)
    }

    fn finish(
        &self,
        handle: &ContainerHandle,
        job: Option<&PatchJob>,
        result: Result<SyncOutcome, SyncError>,
    ) -> SyncOutcome {
        match result {
            Ok(outcome) => {
                tracing::info!(container = %handle, %outcome, "sync job finished");
                outcome
            }
            Err(e) => {
                let stage = e.stage();
                tracing::error!(
                    container = %handle,
                    repo = job.map(|j| j.repo.as_str()).unwrap_or("-"),
                    branch = job.map(|j| j.branch.as_str()).unwrap_or("-"),
                    %stage,
                    error = %e,
                    "sync job failed"
                );
                SyncOutcome::Failed {
                    stage,
                    error: e.to_string(),
                }
            }
        }
    }

    async fn clear_logged(&self, handle: &ContainerHandle) {
        if let Err(e) = self
            .containers
            .clear_signal(handle, &self.settings.signal_path)
            .await
        {
            tracing::error!(container = %handle, error = %e, "failed to clear signal");
        }
    }

    async fn dry_run(&self, handle: &ContainerHandle, decoded: &Decoded) -> SyncOutcome {
        match decoded {
            Decoded::Patch(job) => tracing::info!(
                container = %handle,
                repo = %job.repo,
                clone = %self.settings.repo_base.join(&job.repo).display(),
                patch = %job.patch,
                branch = %job.branch_name((self.clock)()),
                message = %job.message,
                "dry run: would apply patch, push branch and open review request"
            ),
            _ => tracing::info!(
                container = %handle,
                source = %self.settings.workspace_path,
                destination = %self.staging_dir(handle).display(),
                "dry run: would copy workspace"
            ),
        }
        self.clear_logged(handle).await;
        SyncOutcome::DryRun
    }

    fn staging_dir(&self, handle: &ContainerHandle) -> PathBuf {
        self.settings.staging_root.join(&handle.name)
    }

    async fn raw_copy(&self, handle: &ContainerHandle) -> Result<SyncOutcome, SyncError> {
        let destination = self.staging_dir(handle);
        let copied = match std::fs::create_dir_all(&destination) {
            Ok(()) => {
                self.containers
                    .copy_tree_out(handle, &self.settings.workspace_path, &destination)
                    .await
            }
            Err(e) => Err(ContainerError::CopyFailed {
                container: handle.name.clone(),
                path: self.settings.workspace_path.clone(),
                message: format!("cannot create {}: {}", destination.display(), e),
            }),
        };
        if copied.is_ok() {
            self.remove_stray_signal(&destination);
        }
        let cleared = self
            .containers
            .clear_signal(handle, &self.settings.signal_path)
            .await;

        copied.map_err(SyncError::CopyWorkspace)?;
        cleared.map_err(SyncError::ClearSignal)?;
        Ok(SyncOutcome::RawCopied { destination })
    }

    /// The copied tree contains the signal file itself when it lives inside
    /// the workspace.
    fn remove_stray_signal(&self, destination: &Path) {
        let Ok(relative) =
            Path::new(&self.settings.signal_path).strip_prefix(&self.settings.workspace_path)
        else {
            return;
        };
        let stray = destination.join(relative);
        if let Err(e) = std::fs::remove_file(&stray)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(path = %stray.display(), error = %e, "failed to remove copied signal file");
        }
    }

    async fn patch(&self, handle: &ContainerHandle, job: &PatchJob) -> Result<SyncOutcome, SyncError> {
        let patch = TempPatch::new();
        let retrieved = self
            .containers
            .copy_file_out(handle, &job.patch, &patch.path)
            .await;
        let cleared = self
            .containers
            .clear_signal(handle, &self.settings.signal_path)
            .await;
        retrieved.map_err(|source| SyncError::PatchRetrieval {
            path: job.patch.clone(),
            source,
        })?;
        cleared.map_err(SyncError::ClearSignal)?;

        let git = GitRepo::open(
            &self.settings.repo_base,
            &job.repo,
            self.runner.clone(),
            &self.settings.git_cmd,
            &self.settings.remote,
        )?;

        let lock = self.repo_lock(&job.repo);
        let _held = lock.lock().await;

        let original = git.current_branch()?;
        let default = git.default_branch().await?;
        git.fetch(&default).await?;
        let branch = job.branch_name((self.clock)());
        git.create_branch(&branch, &default).await?;
        tracing::debug!(container = %handle, repo = %job.repo, %branch, base = %default, "branch created");

        if let Err(e) = self.publish(&git, &patch.path, job, &branch).await {
            git.rollback(&original, &branch).await;
            return Err(e);
        }

        let request = ReviewRequest {
            title: &job.message,
            container: &handle.name,
            branch: &branch,
        };
        let opened = self.review.open(git.path(), &request).await;
        if let Err(e) = git.checkout(&original).await {
            tracing::warn!(repo = %job.repo, %original, error = %e, "failed to return clone to original branch");
        }
        let url = opened.inspect_err(|_| {
            tracing::warn!(repo = %job.repo, %branch, "branch remains pushed without a review request");
        })?;

        Ok(SyncOutcome::ReviewOpened {
            repo: job.repo.clone(),
            branch,
            url,
        })
    }

    /// Everything between branch creation and the remote. A failure here
    /// leaves nothing on the remote.
    async fn publish(
        &self,
        git: &GitRepo,
        patch: &Path,
        job: &PatchJob,
        branch: &str,
    ) -> Result<(), SyncError> {
        git.apply(patch).await?;
        git.commit_all(&job.message).await?;
        git.push(branch).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{RunnerError, SyncStage};
    use crate::runner::testing::ScriptedRunner;
    use crate::runner::{CommandOutput, CommandSpec, SystemRunner};
    use async_trait::async_trait;
    use git2::Repository;
    use std::fs;
    use tempfile::{TempDir, tempdir};

    const TS: i64 = 1_700_000_000;
    const SIGNAL_READ: &str = "exec abc123 cat /workspace/.ferry-ready";
    const SIGNAL_CLEAR: &str = "exec abc123 rm -f /workspace/.ferry-ready";
    const VALID: &str = "REPO=foo\nPATCH=/tmp/a.patch\nBRANCH=feat\nMESSAGE=add x\n";

    fn fixed_clock() -> i64 {
        TS
    }

    fn handle() -> ContainerHandle {
        ContainerHandle {
            id: "abc123".into(),
            name: "agent-1".into(),
            running: true,
        }
    }

    struct Fixture {
        _repos: TempDir,
        _staging: TempDir,
        settings: SyncSettings,
        original: String,
    }

    fn fixture() -> Fixture {
        let repos = tempdir().unwrap();
        let staging = tempdir().unwrap();
        let repo_dir = repos.path().join("foo");
        fs::create_dir(&repo_dir).unwrap();
        let repo = Repository::init(&repo_dir).unwrap();
        fs::write(repo_dir.join("readme.txt"), "hello").unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new("readme.txt")).unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = git2::Signature::now("test", "test@test.com").unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "init", &tree, &[])
            .unwrap();
        let original = repo.head().unwrap().shorthand().unwrap().to_string();

        let settings = SyncSettings {
            repo_base: repos.path().to_path_buf(),
            signal_path: "/workspace/.ferry-ready".into(),
            workspace_path: "/workspace".into(),
            staging_root: staging.path().join("staging"),
            git_cmd: "git".into(),
            remote: "origin".into(),
            dry_run: false,
        };
        Fixture {
            _repos: repos,
            _staging: staging,
            settings,
            original,
        }
    }

    fn executor(settings: SyncSettings, runner: ScriptedRunner) -> (SyncExecutor, Arc<ScriptedRunner>) {
        let runner = Arc::new(runner);
        let exec = SyncExecutor::new(
            ContainerDirectory::new(runner.clone(), "docker"),
            ReviewClient::new(runner.clone(), "gh"),
            runner.clone(),
            settings,
        )
        .with_clock(fixed_clock);
        (exec, runner)
    }

    fn git_calls(runner: &ScriptedRunner) -> Vec<String> {
        runner
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("git "))
            .collect()
    }

    fn position(calls: &[String], needle: &str) -> usize {
        calls
            .iter()
            .position(|c| c.contains(needle))
            .unwrap_or_else(|| panic!("no call containing {:?} in {:#?}", needle, calls))
    }

    #[tokio::test]
    async fn test_valid_patch_pushes_branch_and_opens_review() {
        let fx = fixture();
        let (exec, runner) = executor(
            fx.settings.clone(),
            ScriptedRunner::new()
                .on(SIGNAL_READ, CommandOutput::ok(VALID))
                .on("pr create", CommandOutput::ok("https://github.com/o/foo/pull/1\n")),
        );

        let outcome = exec.process(&handle()).await.unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::ReviewOpened {
                repo: "foo".into(),
                branch: "feat-1700000000".into(),
                url: "https://github.com/o/foo/pull/1".into(),
            }
        );

        let calls = runner.calls();
        let cleared = position(&calls, SIGNAL_CLEAR);
        let retrieved = position(&calls, "cp abc123:/tmp/a.patch");
        let first_git = calls.iter().position(|c| c.starts_with("git ")).unwrap();
        assert!(retrieved < cleared && cleared < first_git);

        assert!(position(&calls, "git fetch origin main") < position(&calls, "git checkout -b"));
        assert!(calls.contains(&"git checkout -b feat-1700000000 origin/main".to_string()));
        assert!(calls.contains(&"git commit -m add x".to_string()));
        assert!(calls.contains(&"git push -u origin feat-1700000000".to_string()));
        let pr = runner.calls_matching("gh pr create");
        assert_eq!(pr.len(), 1);
        assert!(pr[0].starts_with("gh pr create --title add x --body"));
        assert!(pr[0].contains("agent-1"));
        assert_eq!(
            calls.last().unwrap(),
            &format!("git checkout {}", fx.original)
        );
        assert_eq!(runner.calls_matching(SIGNAL_CLEAR).len(), 1);
    }

    #[tokio::test]
    async fn test_failed_apply_rolls_back_without_push() {
        let fx = fixture();
        let (exec, runner) = executor(
            fx.settings.clone(),
            ScriptedRunner::new()
                .on(SIGNAL_READ, CommandOutput::ok(VALID))
                .on("git apply", CommandOutput::failed(1, "error: patch failed")),
        );

        match exec.process(&handle()).await.unwrap() {
            SyncOutcome::Failed { stage, error } => {
                assert_eq!(stage, SyncStage::ApplyPatch);
                assert!(error.contains("patch failed"));
            }
            other => panic!("Expected Failed, got {:?}", other),
        }
        assert!(runner.calls_matching("push").is_empty());
        assert!(runner.calls_matching("pr create").is_empty());
        let calls = runner.calls();
        assert!(calls.contains(&format!("git checkout -f {}", fx.original)));
        assert!(calls.contains(&"git branch -D feat-1700000000".to_string()));
        assert_eq!(runner.calls_matching(SIGNAL_CLEAR).len(), 1);
    }

    #[tokio::test]
    async fn test_failed_push_rolls_back() {
        let fx = fixture();
        let (exec, runner) = executor(
            fx.settings.clone(),
            ScriptedRunner::new()
                .on(SIGNAL_READ, CommandOutput::ok(VALID))
                .on("git push", CommandOutput::failed(1, "rejected")),
        );

        let outcome = exec.process(&handle()).await.unwrap();
        assert!(matches!(outcome, SyncOutcome::Failed { stage: SyncStage::Push, .. }));
        assert!(runner.calls_matching("pr create").is_empty());
        assert_eq!(runner.calls_matching("git branch -D feat-1700000000").len(), 1);
    }

    #[tokio::test]
    async fn test_review_failure_keeps_pushed_branch() {
        let fx = fixture();
        let (exec, runner) = executor(
            fx.settings.clone(),
            ScriptedRunner::new()
                .on(SIGNAL_READ, CommandOutput::ok(VALID))
                .on("pr create", CommandOutput::failed(1, "gh: not logged in")),
        );

        let outcome = exec.process(&handle()).await.unwrap();
        assert!(matches!(
            outcome,
            SyncOutcome::Failed { stage: SyncStage::OpenReview, .. }
        ));
        assert_eq!(runner.calls_matching("git push -u origin feat-1700000000").len(), 1);
        assert!(runner.calls_matching("branch -D").is_empty());
        assert_eq!(
            runner.calls().last().unwrap(),
            &format!("git checkout {}", fx.original)
        );
    }

    #[tokio::test]
    async fn test_falls_back_to_master_when_remote_has_no_main() {
        let fx = fixture();
        let (exec, runner) = executor(
            fx.settings.clone(),
            ScriptedRunner::new()
                .on(SIGNAL_READ, CommandOutput::ok(VALID))
                .on("ls-remote", CommandOutput::failed(2, "")),
        );

        exec.process(&handle()).await.unwrap();
        assert_eq!(runner.calls_matching("git fetch origin master").len(), 1);
        assert_eq!(
            runner
                .calls_matching("git checkout -b feat-1700000000 origin/master")
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_whitespace_signal_copies_workspace() {
        let fx = fixture();
        let dest = fx.settings.staging_root.join("agent-1");
        let (exec, runner) = executor(
            fx.settings.clone(),
            ScriptedRunner::new().on(SIGNAL_READ, CommandOutput::ok("  \n\t\n")),
        );
        // simulate the copied tree, signal file included
        fs::create_dir_all(&dest).unwrap();
        fs::write(dest.join(".ferry-ready"), "").unwrap();
        fs::write(dest.join("result.txt"), "done").unwrap();

        let outcome = exec.process(&handle()).await.unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::RawCopied {
                destination: dest.clone()
            }
        );
        assert!(!dest.join(".ferry-ready").exists());
        assert!(dest.join("result.txt").exists());
        assert_eq!(
            runner.calls_matching("cp abc123:/workspace/."),
            vec![format!("docker cp abc123:/workspace/. {}", dest.display())]
        );
        assert!(git_calls(&runner).is_empty());
        assert_eq!(runner.calls_matching(SIGNAL_CLEAR).len(), 1);
    }

    #[tokio::test]
    async fn test_raw_copy_failure_still_clears_signal() {
        let fx = fixture();
        let (exec, runner) = executor(
            fx.settings.clone(),
            ScriptedRunner::new()
                .on(SIGNAL_READ, CommandOutput::ok(""))
                .on("docker cp", CommandOutput::failed(1, "no such path"))
                .on("tar", CommandOutput::failed(2, "tar: error")),
        );

        let outcome = exec.process(&handle()).await.unwrap();
        assert!(matches!(
            outcome,
            SyncOutcome::Failed { stage: SyncStage::CopyWorkspace, .. }
        ));
        assert_eq!(runner.calls_matching(SIGNAL_CLEAR).len(), 1);
    }

    #[tokio::test]
    async fn test_missing_branch_field_is_invalid() {
        let fx = fixture();
        let (exec, runner) = executor(
            fx.settings.clone(),
            ScriptedRunner::new().on(
                SIGNAL_READ,
                CommandOutput::ok("REPO=foo\nPATCH=/tmp/a.patch\nMESSAGE=add x\n"),
            ),
        );

        match exec.process(&handle()).await.unwrap() {
            SyncOutcome::Invalid { reason } => assert!(reason.contains("BRANCH")),
            other => panic!("Expected Invalid, got {:?}", other),
        }
        assert!(runner.calls_matching("docker cp").is_empty());
        assert!(git_calls(&runner).is_empty());
        assert_eq!(runner.calls_matching(SIGNAL_CLEAR).len(), 1);
    }

    #[tokio::test]
    async fn test_dry_run_clears_signal_and_touches_nothing() {
        let fx = fixture();
        let mut settings = fx.settings.clone();
        settings.dry_run = true;
        let (exec, runner) = executor(
            settings,
            ScriptedRunner::new().on(SIGNAL_READ, CommandOutput::ok(VALID)),
        );

        assert_eq!(exec.process(&handle()).await.unwrap(), SyncOutcome::DryRun);
        assert_eq!(
            runner.calls(),
            vec![
                format!("docker {}", SIGNAL_READ),
                format!("docker {}", SIGNAL_CLEAR),
            ]
        );
        assert!(!fx.settings.staging_root.exists());
    }

    #[tokio::test]
    async fn test_missing_clone_fails_after_clearing() {
        let fx = fixture();
        let (exec, runner) = executor(
            fx.settings.clone(),
            ScriptedRunner::new().on(
                SIGNAL_READ,
                CommandOutput::ok("REPO=nope\nPATCH=/tmp/a.patch\nBRANCH=feat\nMESSAGE=add x"),
            ),
        );

        let outcome = exec.process(&handle()).await.unwrap();
        assert!(matches!(
            outcome,
            SyncOutcome::Failed { stage: SyncStage::VerifyClone, .. }
        ));
        assert_eq!(runner.calls_matching(SIGNAL_CLEAR).len(), 1);
        assert!(git_calls(&runner).is_empty());
    }

    #[tokio::test]
    async fn test_retrieval_failure_clears_signal_and_skips_git() {
        let fx = fixture();
        let (exec, runner) = executor(
            fx.settings.clone(),
            ScriptedRunner::new()
                .on(SIGNAL_READ, CommandOutput::ok(VALID))
                .on("cp abc123:/tmp/a.patch", CommandOutput::failed(1, "no such file"))
                .on("cat /tmp/a.patch", CommandOutput::failed(1, "no such file")),
        );

        let outcome = exec.process(&handle()).await.unwrap();
        assert!(matches!(
            outcome,
            SyncOutcome::Failed { stage: SyncStage::RetrievePatch, .. }
        ));
        assert_eq!(runner.calls_matching(SIGNAL_CLEAR).len(), 1);
        assert!(git_calls(&runner).is_empty());
    }

    #[tokio::test]
    async fn test_temporary_patch_is_removed() {
        let fx = fixture();
        let (exec, runner) = executor(
            fx.settings.clone(),
            ScriptedRunner::new()
                .on(SIGNAL_READ, CommandOutput::ok(VALID))
                .on("cp abc123:/tmp/a.patch", CommandOutput::failed(1, "cp refused"))
                .on("cat /tmp/a.patch", CommandOutput::ok("diff --git a/x b/x\n"))
                .on("git apply", CommandOutput::failed(1, "corrupt patch")),
        );

        exec.process(&handle()).await.unwrap();
        let cp = runner.calls_matching("cp abc123:/tmp/a.patch");
        let local = cp[0].rsplit(' ').next().unwrap().to_string();
        assert!(local.contains("ferry-"));
        assert!(!Path::new(&local).exists());
    }

    #[tokio::test]
    async fn test_vanished_signal_is_no_signal() {
        let fx = fixture();
        let (exec, runner) = executor(
            fx.settings.clone(),
            ScriptedRunner::new().on(SIGNAL_READ, CommandOutput::failed(1, "No such file")),
        );
        assert_eq!(exec.process(&handle()).await.unwrap(), SyncOutcome::NoSignal);
        assert!(runner.calls_matching(SIGNAL_CLEAR).is_empty());
    }

    #[test]
    fn test_repo_lock_is_shared_per_repository() {
        let fx = fixture();
        let (exec, _) = executor(fx.settings.clone(), ScriptedRunner::new());
        let a = exec.repo_lock("foo");
        let b = exec.repo_lock("foo");
        let c = exec.repo_lock("bar");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    // Real git against a local bare remote; container and review calls stay
    // scripted.

    const NEW_FILE_PATCH: &str = "diff --git a/x.txt b/x.txt
new file mode 100644
--- /dev/null
+++ b/x.txt
@@ -0,0 +1 @@
+x
";

    const STALE_PATCH: &str = "diff --git a/readme.txt b/readme.txt
--- a/readme.txt
+++ b/readme.txt
@@ -1 +1 @@
-something else entirely
+changed
";

    struct RealGit {
        git: SystemRunner,
        rest: ScriptedRunner,
    }

    #[async_trait]
    impl CommandRunner for RealGit {
        async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, RunnerError> {
            if spec.program == "git" {
                self.git.run(spec).await
            } else {
                self.rest.run(spec).await
            }
        }

        async fn pipe(
            &self,
            producer: &CommandSpec,
            consumer: &CommandSpec,
        ) -> Result<CommandOutput, RunnerError> {
            self.rest.pipe(producer, consumer).await
        }
    }

    fn run_git(dir: &Path, args: &[&str]) {
        let out = std::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap();
        assert!(
            out.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&out.stderr)
        );
    }

    struct Remote {
        _root: TempDir,
        settings: SyncSettings,
        clone: PathBuf,
        remote: PathBuf,
    }

    /// Clone `foo` on branch `work`, tracking a bare remote whose `main`
    /// holds one commit.
    fn remote_fixture() -> Remote {
        let root = tempdir().unwrap();
        let repos = root.path().join("repos");
        let clone = repos.join("foo");
        let remote = root.path().join("remote.git");
        fs::create_dir_all(&clone).unwrap();

        run_git(&clone, &["init", "-q", "-b", "main"]);
        run_git(&clone, &["config", "user.name", "test"]);
        run_git(&clone, &["config", "user.email", "test@test.com"]);
        run_git(&clone, &["config", "commit.gpgsign", "false"]);
        fs::write(clone.join("readme.txt"), "hello\n").unwrap();
        run_git(&clone, &["add", "readme.txt"]);
        run_git(&clone, &["commit", "-q", "-m", "init"]);
        run_git(root.path(), &["clone", "-q", "--bare", "repos/foo", "remote.git"]);
        run_git(&clone, &["remote", "add", "origin", remote.to_str().unwrap()]);
        run_git(&clone, &["checkout", "-q", "-b", "work"]);

        let settings = SyncSettings {
            repo_base: repos,
            signal_path: "/workspace/.ferry-ready".into(),
            workspace_path: "/workspace".into(),
            staging_root: root.path().join("staging"),
            git_cmd: "git".into(),
            remote: "origin".into(),
            dry_run: false,
        };
        Remote {
            _root: root,
            settings,
            clone,
            remote,
        }
    }

    fn real_git_executor(settings: SyncSettings, patch: &str) -> SyncExecutor {
        let rest = ScriptedRunner::new()
            .on(SIGNAL_READ, CommandOutput::ok(VALID))
            .on("cp abc123:/tmp/a.patch", CommandOutput::failed(1, "cp refused"))
            .on("cat /tmp/a.patch", CommandOutput::ok(patch))
            .on("pr create", CommandOutput::ok("https://github.com/o/foo/pull/7\n"));
        let runner = Arc::new(RealGit {
            git: SystemRunner::default(),
            rest,
        });
        SyncExecutor::new(
            ContainerDirectory::new(runner.clone(), "docker"),
            ReviewClient::new(runner.clone(), "gh"),
            runner,
            settings,
        )
        .with_clock(fixed_clock)
    }

    fn open_clone(fx: &Remote) -> GitRepo {
        GitRepo::open(
            &fx.settings.repo_base,
            "foo",
            Arc::new(SystemRunner::default()),
            "git",
            "origin",
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_failed_apply_restores_real_clone() {
        let fx = remote_fixture();
        let exec = real_git_executor(fx.settings.clone(), STALE_PATCH);

        let outcome = exec.process(&handle()).await.unwrap();
        assert!(matches!(
            outcome,
            SyncOutcome::Failed { stage: SyncStage::ApplyPatch, .. }
        ));

        let git = open_clone(&fx);
        assert_eq!(git.current_branch().unwrap(), "work");
        assert!(!git.branch_exists("feat-1700000000"));
        assert!(git.branch_exists("work"));
        assert_eq!(fs::read_to_string(fx.clone.join("readme.txt")).unwrap(), "hello\n");

        let remote = Repository::open_bare(&fx.remote).unwrap();
        assert!(remote.find_reference("refs/heads/feat-1700000000").is_err());
        assert!(remote.find_reference("refs/heads/main").is_ok());
    }

    #[tokio::test]
    async fn test_applied_patch_reaches_real_remote() {
        let fx = remote_fixture();
        let exec = real_git_executor(fx.settings.clone(), NEW_FILE_PATCH);

        let outcome = exec.process(&handle()).await.unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::ReviewOpened {
                repo: "foo".into(),
                branch: "feat-1700000000".into(),
                url: "https://github.com/o/foo/pull/7".into(),
            }
        );

        let git = open_clone(&fx);
        assert_eq!(git.current_branch().unwrap(), "work");
        assert!(git.branch_exists("feat-1700000000"));
        assert!(!fx.clone.join("x.txt").exists());

        let remote = Repository::open_bare(&fx.remote).unwrap();
        let commit = remote
            .find_reference("refs/heads/feat-1700000000")
            .unwrap()
            .peel_to_commit()
            .unwrap();
        assert_eq!(commit.summary(), Some("add x"));
        assert!(commit.tree().unwrap().get_name("x.txt").is_some());
    }
}
