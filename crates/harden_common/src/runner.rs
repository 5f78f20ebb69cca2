//! External command execution.
//!
//! Every syntax test, service control call and port query goes through
//! [`CommandRunner`] so the engine can be driven against a recording fake.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{HardenError, Result};

/// Maximum bytes kept from each output stream
const MAX_OUTPUT_BYTES: usize = 64 * 1024;

/// A program and its arguments. No shell is involved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
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

    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", crate::paths::shell_quote(arg))?;
        }
        Ok(())
    }
}

/// Captured result of one command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when killed by a signal or timed out
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// stdout and stderr together, for operator-facing diagnostics
    pub fn diagnostic(&self) -> String {
        let mut text = String::new();
        for part in [self.stdout.trim_end(), self.stderr.trim_end()] {
            if part.is_empty() {
                continue;
            }
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(part);
        }
        if text.is_empty() {
            match self.code {
                Some(code) => text = format!("exit status {}", code),
                None => text = "terminated without exit status".to_string(),
            }
        }
        text
    }

    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
            duration_ms: 0,
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
            duration_ms: 0,
        }
    }
}

/// Seam for every external collaborator.
#[allow(async_fn_in_trait)]
pub trait CommandRunner {
    /// Run to completion. A non-zero exit is an `Ok` output; `Err` means the
    /// command could not be started at all.
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;
}

/// Runs commands on the real host with a per-command timeout
#[derive(Debug, Clone)]
pub struct SystemRunner {
    timeout: Duration,
}

impl SystemRunner {
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            timeout: Duration::from_secs(timeout_secs),
        }
    }
}

impl CommandRunner for SystemRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        debug!(command = %spec, "Executing command");
        let start = Instant::now();

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|e| HardenError::CommandFailed {
            command: spec.to_string(),
            message: e.to_string(),
        })?;

        match timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(CommandOutput {
                code: output.status.code(),
                stdout: truncate_output(&output.stdout),
                stderr: truncate_output(&output.stderr),
                duration_ms: start.elapsed().as_millis() as u64,
            }),
            Ok(Err(e)) => Err(HardenError::CommandFailed {
                command: spec.to_string(),
                message: e.to_string(),
            }),
            Err(_) => {
                warn!(command = %spec, timeout_secs = self.timeout.as_secs(), "Command timed out");
                Ok(CommandOutput {
                    code: None,
                    stdout: String::new(),
                    stderr: format!("timed out after {} seconds", self.timeout.as_secs()),
                    duration_ms: start.elapsed().as_millis() as u64,
                })
            }
        }
    }
}

/// Runner for a scratch filesystem root.
///
/// Commands that name a path under the root (syntax tests of staged files)
/// run through the inner runner. Everything else would act on the live host,
/// so it is logged and reported as a successful no-op.
#[derive(Debug, Clone)]
pub struct ScratchRootRunner<R> {
    inner: R,
    root: PathBuf,
}

impl<R: CommandRunner> ScratchRootRunner<R> {
    pub fn new(inner: R, root: &Path) -> Self {
        Self {
            inner,
            root: root.to_path_buf(),
        }
    }

    fn targets_root(&self, spec: &CommandSpec) -> bool {
        spec.args.iter().any(|a| Path::new(a).starts_with(&self.root))
    }
}

impl<R: CommandRunner> CommandRunner for ScratchRootRunner<R> {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        if self.targets_root(spec) {
            return self.inner.run(spec).await;
        }
        info!(command = %spec, root = %self.root.display(), "[SCRATCH ROOT] Would run on the live host");
        Ok(CommandOutput::ok(""))
    }
}

fn truncate_output(bytes: &[u8]) -> String {
    let slice = if bytes.len() > MAX_OUTPUT_BYTES {
        &bytes[..MAX_OUTPUT_BYTES]
    } else {
        bytes
    };
    String::from_utf8_lossy(slice).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_quotes_arguments() {
        let spec = CommandSpec::new("sshd").args(["-t", "-f", "/etc/ssh/my config"]);
        assert_eq!(spec.to_string(), "sshd -t -f '/etc/ssh/my config'");
        assert_eq!(spec.argv().len(), 4);
    }

    #[test]
    fn test_diagnostic_falls_back_to_status() {
        let out = CommandOutput::failed(3, "");
        assert_eq!(out.diagnostic(), "exit status 3");

        let out = CommandOutput {
            code: Some(1),
            stdout: "line one\n".to_string(),
            stderr: "line two\n".to_string(),
            duration_ms: 0,
        };
        assert_eq!(out.diagnostic(), "line one\nline two");
    }

    #[tokio::test]
    async fn test_system_runner_captures_output() {
        let runner = SystemRunner::new(10);
        let out = runner
            .run(&CommandSpec::new("echo").arg("test output"))
            .await
            .unwrap();
        assert!(out.success());
        assert!(out.stdout.contains("test output"));
    }

    #[tokio::test]
    async fn test_system_runner_reports_failure_status() {
        let runner = SystemRunner::new(10);
        let out = runner.run(&CommandSpec::new("false")).await.unwrap();
        assert!(!out.success());
        assert_eq!(out.code, Some(1));
    }

    #[tokio::test]
    async fn test_system_runner_missing_program() {
        let runner = SystemRunner::new(10);
        let result = runner
            .run(&CommandSpec::new("/nonexistent/harden-test-binary"))
            .await;
        assert!(matches!(result, Err(HardenError::CommandFailed { .. })));
    }

    #[tokio::test]
    async fn test_scratch_root_runner_only_reaches_root_files() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("sshd_config");
        std::fs::write(&file, "Port 2222\n").unwrap();
        let runner = ScratchRootRunner::new(SystemRunner::new(10), dir.path());

        let out = runner
            .run(&CommandSpec::new("cat").arg(file.display().to_string()))
            .await
            .unwrap();
        assert_eq!(out.stdout, "Port 2222\n");

        // Host-wide commands never run
        let out = runner
            .run(&CommandSpec::new("/nonexistent/systemctl").args(["restart", "ssh"]))
            .await
            .unwrap();
        assert!(out.success());
        assert!(out.stdout.is_empty());
    }

    #[tokio::test]
    async fn test_system_runner_timeout() {
        let runner = SystemRunner::new(1);
        let out = runner
            .run(&CommandSpec::new("sleep").arg("5"))
            .await
            .unwrap();
        assert_eq!(out.code, None);
        assert!(out.stderr.contains("timed out"));
    }
}
