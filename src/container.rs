//! Container directory: discovery, liveness and file transfer.
//!
//! Talks to the container runtime CLI (`docker` or a compatible CLI such as
//! `podman`) through a [`CommandRunner`]. Nothing here is cached: a handle
//! describes a container at the moment it was listed, and any container can
//! stop between two calls. Callers treat vanished containers as "not
//! running", never as a fault.

use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;

use crate::errors::ContainerError;
use crate::runner::{CommandOutput, CommandRunner, CommandSpec};

/// A container as seen by one discovery or liveness check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub id: String,
    pub name: String,
    pub running: bool,
}

impl std::fmt::Display for ContainerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// Which containers to watch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryFilter {
    /// Opt-in label (`key=value` or `key`), tried first
    pub label: Option<String>,
    /// Image-name substring, used when the label matches nothing
    pub image: Option<String>,
}

/// One line of `docker ps --format '{{json .}}'`.
#[derive(Debug, Deserialize)]
struct PsEntry {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Names", default)]
    names: String,
    #[serde(rename = "Image", default)]
    image: String,
    #[serde(rename = "State", default)]
    state: Option<String>,
}

impl PsEntry {
    fn into_handle(self) -> ContainerHandle {
        let name = self
            .names
            .split(',')
            .next()
            .filter(|n| !n.is_empty())
            .unwrap_or(self.id.as_str())
            .to_string();
        ContainerHandle {
            running: self.state.as_deref().is_none_or(|s| s == "running"),
            id: self.id,
            name,
        }
    }
}

/// Container runtime front-end.
#[derive(Clone)]
pub struct ContainerDirectory {
    runner: Arc<dyn CommandRunner>,
    runtime: String,
}

impl ContainerDirectory {
    pub fn new(runner: Arc<dyn CommandRunner>, runtime: impl Into<String>) -> Self {
        Self {
            runner,
            runtime: runtime.into(),
        }
    }

    fn cmd(&self) -> CommandSpec {
        CommandSpec::new(&self.runtime)
    }

    fn exec(&self, handle: &ContainerHandle) -> CommandSpec {
        self.cmd().args(["exec", handle.id.as_str()])
    }

    /// List running containers matching the filter.
    ///
    /// Label match first; if it yields nothing, fall back to an image-name
    /// substring match over all running containers.
    pub async fn discover(
        &self,
        filter: &DiscoveryFilter,
    ) -> Result<Vec<ContainerHandle>, ContainerError> {
        if let Some(label) = &filter.label {
            let labeled = self.list(Some(label)).await?;
            if !labeled.is_empty() {
                return Ok(labeled.into_iter().map(|(_, handle)| handle).collect());
            }
        }

        let Some(image) = &filter.image else {
            return Ok(Vec::new());
        };
        let handles: Vec<ContainerHandle> = self
            .list(None)
            .await?
            .into_iter()
            .filter(|(entry_image, _)| entry_image.contains(image.as_str()))
            .map(|(_, handle)| handle)
            .collect();
        tracing::debug!(image = %image, count = handles.len(), "image-name discovery");
        Ok(handles)
    }

    /// `docker ps` with an optional label filter; returns `(image, handle)`.
    async fn list(&self, label: Option<&str>) -> Result<Vec<(String, ContainerHandle)>, ContainerError> {
        let mut spec = self.cmd().arg("ps");
        if let Some(label) = label {
            spec = spec.args(["--filter".to_string(), format!("label={}", label)]);
        }
        let spec = spec.args(["--format", "{{json .}}"]);

        let out = self.runner.run(&spec).await?;
        if !out.success() {
            return Err(ContainerError::ExecFailed {
                container: "-".to_string(),
                command: spec.display(),
                message: out.diagnostic(),
            });
        }

        let mut found = Vec::new();
        for line in out.stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
            match serde_json::from_str::<PsEntry>(line) {
                Ok(entry) => {
                    let image = entry.image.clone();
                    let handle = entry.into_handle();
                    if handle.running {
                        found.push((image, handle));
                    }
                }
                Err(e) => tracing::warn!(error = %e, line, "skipping undecodable container listing"),
            }
        }
        Ok(found)
    }

    /// Look up a single container by id or name.
    pub async fn resolve(&self, id_or_name: &str) -> Result<ContainerHandle, ContainerError> {
        let spec = self.cmd().args([
            "inspect",
            "--format",
            "{{.Id}}|{{.Name}}|{{.State.Running}}",
            id_or_name,
        ]);
        let out = self.runner.run(&spec).await?;
        if !out.success() {
            return Err(ContainerError::NotFound(id_or_name.to_string()));
        }
        let line = out.stdout.trim();
        let mut parts = line.splitn(3, '|');
        let (Some(id), Some(name), Some(running)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(ContainerError::NotFound(id_or_name.to_string()));
        };
        Ok(ContainerHandle {
            id: id.to_string(),
            name: name.trim_start_matches('/').to_string(),
            running: running.trim() == "true",
        })
    }

    /// Whether the container is running right now. Every failure reads as
    /// "not running".
    pub async fn is_running(&self, handle: &ContainerHandle) -> bool {
        let spec = self
            .cmd()
            .args(["inspect", "--format", "{{.State.Running}}", handle.id.as_str()]);
        match self.runner.run(&spec).await {
            Ok(out) => out.success() && out.stdout.trim() == "true",
            Err(e) => {
                tracing::debug!(container = %handle, error = %e, "liveness probe failed");
                false
            }
        }
    }

    /// Whether a file exists at `path` inside the container.
    pub async fn signal_present(
        &self,
        handle: &ContainerHandle,
        path: &str,
    ) -> Result<bool, ContainerError> {
        let out = self
            .runner
            .run(&self.exec(handle).args(["test", "-f", path]))
            .await?;
        Ok(out.success())
    }

    /// Read the signal file. `None` when it vanished since the presence probe.
    pub async fn read_signal(
        &self,
        handle: &ContainerHandle,
        path: &str,
    ) -> Result<Option<String>, ContainerError> {
        let out = self.runner.run(&self.exec(handle).args(["cat", path])).await?;
        Ok(out.success().then_some(out.stdout))
    }

    /// Remove the signal file inside the container.
    pub async fn clear_signal(
        &self,
        handle: &ContainerHandle,
        path: &str,
    ) -> Result<(), ContainerError> {
        let spec = self.exec(handle).args(["rm", "-f", path]);
        let out = self.runner.run(&spec).await?;
        self.check(handle, &spec, &out)
    }

    /// Copy one file out of the container.
    ///
    /// Tries `docker cp` first, then falls back to `cat` with stdout
    /// redirected into `dest`.
    pub async fn copy_file_out(
        &self,
        handle: &ContainerHandle,
        src: &str,
        dest: &Path,
    ) -> Result<(), ContainerError> {
        let direct = self.cmd().args([
            "cp".to_string(),
            format!("{}:{}", handle.id, src),
            dest.display().to_string(),
        ]);
        let out = self.runner.run(&direct).await?;
        if out.success() {
            return Ok(());
        }
        let direct_err = out.diagnostic();
        tracing::warn!(container = %handle, src, error = %direct_err, "direct copy failed, falling back to cat");

        let fallback = self.exec(handle).args(["cat", src]).stdout_to(dest);
        let out = self.runner.run(&fallback).await?;
        if out.success() {
            return Ok(());
        }

        if let Err(e) = std::fs::remove_file(dest)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(path = %dest.display(), error = %e, "failed to remove partial copy");
        }
        Err(ContainerError::CopyFailed {
            container: handle.name.clone(),
            path: src.to_string(),
            message: format!("cp: {}; cat: {}", direct_err, out.diagnostic()),
        })
    }

    /// Copy a directory tree out of the container into `dest_dir`.
    ///
    /// Tries `docker cp <id>:<src>/. <dest>` first, then streams a tar
    /// archive through the host (handles symlinks `docker cp` refuses).
    pub async fn copy_tree_out(
        &self,
        handle: &ContainerHandle,
        src_dir: &str,
        dest_dir: &Path,
    ) -> Result<(), ContainerError> {
        let src = format!("{}/.", src_dir.trim_end_matches('/'));
        let direct = self.cmd().args([
            "cp".to_string(),
            format!("{}:{}", handle.id, src),
            dest_dir.display().to_string(),
        ]);
        let out = self.runner.run(&direct).await?;
        if out.success() {
            return Ok(());
        }
        let direct_err = out.diagnostic();
        tracing::warn!(container = %handle, src = src_dir, error = %direct_err, "direct tree copy failed, falling back to tar stream");

        let producer = self.exec(handle).args(["tar", "-C", src_dir, "-cf", "-", "."]);
        let consumer = CommandSpec::new("tar").args([
            "-C".to_string(),
            dest_dir.display().to_string(),
            "-xf".to_string(),
            "-".to_string(),
        ]);
        let out = self.runner.pipe(&producer, &consumer).await?;
        if out.success() {
            return Ok(());
        }
        Err(ContainerError::CopyFailed {
            container: handle.name.clone(),
            path: src_dir.to_string(),
            message: format!("cp: {}; tar: {}", direct_err, out.diagnostic()),
        })
    }

    /// `<runtime> --version`, used by the startup preflight.
    pub async fn probe_runtime(&self) -> Result<String, ContainerError> {
        let spec = self.cmd().arg("--version");
        let out = self.runner.run(&spec).await?;
        self.check_host(&spec, &out)?;
        Ok(out.stdout.trim().to_string())
    }

    fn check(
        &self,
        handle: &ContainerHandle,
        spec: &CommandSpec,
        out: &CommandOutput,
    ) -> Result<(), ContainerError> {
        if out.success() {
            Ok(())
        } else {
            Err(ContainerError::ExecFailed {
                container: handle.name.clone(),
                command: spec.display(),
                message: out.diagnostic(),
            })
        }
    }

    fn check_host(&self, spec: &CommandSpec, out: &CommandOutput) -> Result<(), ContainerError> {
        if out.success() {
            Ok(())
        } else {
            Err(ContainerError::ExecFailed {
                container: "-".to_string(),
                command: spec.display(),
                message: out.diagnostic(),
            })
        }
    }
}
