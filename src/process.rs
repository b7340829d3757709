//! External command execution for CLI-driven backends.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::fmt::Debug;
use std::process::Stdio;
use std::time::Duration;

/// Arguments whose following value is never logged or reported.
const SECRET_FLAGS: &[&str] = &["--password"];

/// Longest a single external command may run before it is killed.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

/// Captured result of one command invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit status, `None` when killed by a signal.
    pub status: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Output of a command that exited 0 with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Output of a command that exited 1 with the given stderr.
    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            status: Some(1),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Whether either stream contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.stdout.contains(needle) || self.stderr.contains(needle)
    }

    /// Whether either stream mentions "error" in any case.
    pub fn mentions_error(&self) -> bool {
        self.stdout.to_ascii_lowercase().contains("error")
            || self.stderr.to_ascii_lowercase().contains("error")
    }

    /// First non-empty line of stderr, else of stdout.
    pub fn summary(&self) -> &str {
        first_line(&self.stderr)
            .or_else(|| first_line(&self.stdout))
            .unwrap_or("no output")
    }
}

fn first_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).find(|l| !l.is_empty())
}

/// Capability to run a command line and capture its output.
#[async_trait]
pub trait CommandRunner: Send + Sync + Debug {
    /// Run `program` with `args` to completion.
    ///
    /// Only spawn failures are errors here; exit status and output are
    /// judged by the caller.
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput>;
}

/// [`CommandRunner`] backed by `tokio::process`.
///
/// A command still running after `timeout` is killed and reported as
/// [`Error::Timeout`].
#[derive(Debug, Clone, Copy)]
pub struct TokioCommandRunner {
    timeout: Duration,
}

impl TokioCommandRunner {
    /// Runner that kills commands after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TokioCommandRunner {
    fn default() -> Self {
        Self::new(DEFAULT_COMMAND_TIMEOUT)
    }
}

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        let command = display_command(program, args);
        tracing::debug!(command = %command, "running command");
        let child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        // Dropping the pending output future kills the child.
        let output = match tokio::time::timeout(self.timeout, child).await {
            Ok(finished) => finished.map_err(|e| Error::command_failed(&command, e.to_string()))?,
            Err(_) => {
                tracing::warn!(command = %command, timeout = ?self.timeout, "command killed after timeout");
                return Err(Error::Timeout {
                    what: command,
                    desired: "exited".into(),
                    last: "running".into(),
                });
            }
        };

        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Render a command line for logs and error messages, masking secrets.
pub fn display_command(program: &str, args: &[String]) -> String {
    let mut rendered = String::from(program);
    let mut mask_next = false;
    for arg in args {
        rendered.push(' ');
        if mask_next {
            rendered.push_str("****");
            mask_next = false;
        } else {
            rendered.push_str(arg);
            mask_next = SECRET_FLAGS.contains(&arg.as_str());
        }
    }
    rendered
}

/// Judge a finished command: fail on nonzero exit, on any mention of
/// "error", or on any of the backend's `sentinels`.
pub fn check_output(
    program: &str,
    args: &[String],
    output: &CommandOutput,
    sentinels: &[&str],
) -> Result<()> {
    let failed = output.status != Some(0)
        || output.mentions_error()
        || sentinels.iter().any(|s| output.contains(s));
    if failed {
        return Err(Error::command_failed(
            display_command(program, args),
            output.summary(),
        ));
    }
    Ok(())
}

/// Run a command and judge its output in one step.
pub async fn run_checked(
    runner: &dyn CommandRunner,
    program: &str,
    args: &[String],
    sentinels: &[&str],
) -> Result<CommandOutput> {
    let output = runner.run(program, args).await?;
    check_output(program, args, &output, sentinels)?;
    Ok(output)
}

/// Build an owned argument vector.
pub fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}
