//! External command execution.
//!
//! Every interaction with the container runtime, git and the code-hosting
//! CLI goes through [`CommandRunner`]. The real implementation is
//! [`SystemRunner`]; tests substitute `testing::ScriptedRunner`.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::errors::RunnerError;

/// A single external command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub stdin: Option<Vec<u8>>,
    /// Redirect stdout into this host file instead of capturing it.
    pub stdout_to: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            stdin: None,
            stdout_to: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn stdin_bytes(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn stdout_to(mut self, path: impl AsRef<Path>) -> Self {
        self.stdout_to = Some(path.as_ref().to_path_buf());
        self
    }

    /// Render as a single line for logs and test assertions.
    pub fn display(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Best available diagnostic text (stderr, else stdout, else exit code).
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            return stdout.to_string();
        }
        match self.code {
            Some(code) => format!("exit code {}", code),
            None => "terminated by signal".to_string(),
        }
    }
}

/// Abstraction over external command execution.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run one command to completion.
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, RunnerError>;

    /// Run `producer | consumer`. Succeeds only if both sides exit 0; the
    /// returned output is the consumer's, with the producer's stderr
    /// appended on producer failure.
    async fn pipe(
        &self,
        producer: &CommandSpec,
        consumer: &CommandSpec,
    ) -> Result<CommandOutput, RunnerError>;
}

/// Runs commands on the host with `tokio::process`.
#[derive(Debug, Clone, Default)]
pub struct SystemRunner {
    timeout: Option<Duration>,
}

impl SystemRunner {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    fn build(spec: &CommandSpec) -> Result<Command, RunnerError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args).kill_on_drop(true);
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }
        cmd.stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        match &spec.stdout_to {
            Some(path) => {
                let file =
                    std::fs::File::create(path).map_err(|source| RunnerError::RedirectFailed {
                        path: path.clone(),
                        source,
                    })?;
                cmd.stdout(Stdio::from(file));
            }
            None => {
                cmd.stdout(Stdio::piped());
            }
        }
        cmd.stderr(Stdio::piped());
        Ok(cmd)
    }

    async fn wait_bounded(
        &self,
        program: &str,
        child: tokio::process::Child,
    ) -> Result<std::process::Output, RunnerError> {
        let io_err = |source: std::io::Error| RunnerError::Io {
            program: program.to_string(),
            source,
        };
        match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(result) => result.map_err(io_err),
                // Dropping the future drops the child, and kill_on_drop reaps it.
                Err(_) => Err(RunnerError::TimedOut {
                    program: program.to_string(),
                    secs: limit.as_secs(),
                }),
            },
            None => child.wait_with_output().await.map_err(io_err),
        }
    }
}

fn to_output(output: std::process::Output) -> CommandOutput {
    CommandOutput {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, RunnerError> {
        let mut child = Self::build(spec)?
            .spawn()
            .map_err(|source| RunnerError::SpawnFailed {
                program: spec.program.clone(),
                source,
            })?;

        if let Some(input) = &spec.stdin
            && let Some(mut stdin) = child.stdin.take()
        {
            stdin
                .write_all(input)
                .await
                .map_err(|source| RunnerError::Io {
                    program: spec.program.clone(),
                    source,
                })?;
            // stdin is dropped here, closing the pipe
        }

        let output = self.wait_bounded(&spec.program, child).await?;
        Ok(to_output(output))
    }

    async fn pipe(
        &self,
        producer: &CommandSpec,
        consumer: &CommandSpec,
    ) -> Result<CommandOutput, RunnerError> {
        let mut upstream = Self::build(producer)?;
        upstream.stdout(Stdio::piped());
        let mut upstream = upstream
            .spawn()
            .map_err(|source| RunnerError::SpawnFailed {
                program: producer.program.clone(),
                source,
            })?;

        let stream = upstream.stdout.take().ok_or_else(|| RunnerError::Io {
            program: producer.program.clone(),
            source: std::io::Error::other("producer stdout was not captured"),
        })?;
        let stream: Stdio = stream.try_into().map_err(|source| RunnerError::Io {
            program: producer.program.clone(),
            source,
        })?;

        let mut downstream = Self::build(consumer)?;
        downstream.stdin(stream);
        let downstream = downstream
            .spawn()
            .map_err(|source| RunnerError::SpawnFailed {
                program: consumer.program.clone(),
                source,
            })?;

        let (up, down) = tokio::join!(
            self.wait_bounded(&producer.program, upstream),
            self.wait_bounded(&consumer.program, downstream),
        );
        let up = to_output(up?);
        let mut down = to_output(down?);

        if !up.success() {
            if down.success() {
                down.code = up.code;
            }
            if !down.stderr.is_empty() {
                down.stderr.push('\n');
            }
            down.stderr.push_str(&up.diagnostic());
        }
        Ok(down)
    }
}

#[cfg(test)]
pub mod testing {
    //! Deterministic runner double for unit tests.

    use super::*;
    use std::sync::Mutex;

    struct Rule {
        pattern: String,
        outputs: Vec<CommandOutput>,
        served: usize,
    }

    /// Answers commands from a script of `(substring, outputs)` rules and
    /// records every invocation. The first rule whose pattern is contained
    /// in the rendered command line wins; its outputs are served in order
    /// and the last one repeats. Unmatched commands succeed with empty
    /// output. When a command redirects stdout to a file, the scripted
    /// stdout is written there.
    #[derive(Default)]
    pub struct ScriptedRunner {
        rules: Mutex<Vec<Rule>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedRunner {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn on(self, pattern: &str, output: CommandOutput) -> Self {
            self.on_seq(pattern, vec![output])
        }

        pub fn on_seq(self, pattern: &str, outputs: Vec<CommandOutput>) -> Self {
            self.rules.lock().unwrap().push(Rule {
                pattern: pattern.to_string(),
                outputs,
                served: 0,
            });
            self
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        pub fn calls_matching(&self, pattern: &str) -> Vec<String> {
            self.calls()
                .into_iter()
                .filter(|c| c.contains(pattern))
                .collect()
        }

        fn answer(&self, spec: &CommandSpec) -> CommandOutput {
            let line = spec.display();
            self.calls.lock().unwrap().push(line.clone());
            let mut rules = self.rules.lock().unwrap();
            let output = rules
                .iter_mut()
                .find(|rule| line.contains(&rule.pattern))
                .map(|rule| {
                    let idx = rule.served.min(rule.outputs.len().saturating_sub(1));
                    rule.served += 1;
                    rule.outputs.get(idx).cloned().unwrap_or_default()
                })
                .unwrap_or_else(|| CommandOutput::ok(""));
            if let Some(path) = &spec.stdout_to {
                std::fs::write(path, &output.stdout).unwrap();
            }
            output
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, RunnerError> {
            Ok(self.answer(spec))
        }

        async fn pipe(
            &self,
            producer: &CommandSpec,
            consumer: &CommandSpec,
        ) -> Result<CommandOutput, RunnerError> {
            let up = self.answer(producer);
            let down = self.answer(consumer);
            if up.success() { Ok(down) } else { Ok(up) }
        }
    }
}
