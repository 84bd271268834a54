//! Privileged command execution.
//!
//! Rule backends, interface drivers and the ARP announcer all go through
//! [`CommandExecutor`] so tests can record and fail individual commands.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, error, warn};

use crate::error::{NatError, Result};

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Runs argument vectors with root privileges.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run `argv`, feeding `stdin` if given. A non-zero exit is not an error here.
    async fn run(&self, argv: &[String], stdin: Option<&str>) -> Result<CommandOutput>;

    /// Run `argv` and fail with [`NatError::CommandFailed`] on a non-zero exit.
    async fn check(&self, argv: &[String], stdin: Option<&str>) -> Result<String> {
        let output = self.run(argv, stdin).await?;
        let cmd = argv.join(" ");
        if output.success() {
            if !output.stderr.is_empty() {
                warn!(%cmd, stderr = %output.stderr, "Non empty stderr on successful command");
            }
            return Ok(output.stdout.trim().to_string());
        }
        error!(
            %cmd,
            status_code = ?output.code,
            stdout = %output.stdout,
            stderr = %output.stderr,
            "Error executing command"
        );
        Err(NatError::CommandFailed {
            cmd,
            code: output.code,
            stderr: output.stderr.trim().to_string(),
        })
    }
}

/// Build an argument vector from string slices.
pub fn argv<S: AsRef<str>>(parts: &[S]) -> Vec<String> {
    parts.iter().map(|p| p.as_ref().to_string()).collect()
}

/// Executes commands on the host, optionally through a root helper such as `sudo`.
pub struct RootExecutor {
    root_helper: Vec<String>,
    timeout: Duration,
}

impl RootExecutor {
    /// `root_helper` is split on whitespace; an empty string runs commands directly.
    pub fn new(root_helper: &str, timeout: Duration) -> Self {
        Self {
            root_helper: root_helper.split_whitespace().map(String::from).collect(),
            timeout,
        }
    }

    fn full_argv(&self, argv: &[String]) -> Vec<String> {
        self.root_helper.iter().chain(argv).cloned().collect()
    }
}

#[async_trait]
impl CommandExecutor for RootExecutor {
    async fn run(&self, argv: &[String], stdin: Option<&str>) -> Result<CommandOutput> {
        let full = self.full_argv(argv);
        let (program, args) = full
            .split_first()
            .ok_or_else(|| NatError::Config("empty command".into()))?;

        debug!(cmd = %full.join(" "), "Running command");

        let mut child = Command::new(program)
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let input = stdin.map(str::to_owned);
        let mut pipe = child.stdin.take();
        let run = async move {
            if let (Some(pipe), Some(input)) = (pipe.as_mut(), input) {
                pipe.write_all(input.as_bytes()).await?;
            }
            // Close stdin so the command sees EOF.
            drop(pipe);
            child.wait_with_output().await
        };

        let output = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| NatError::Timeout {
                what: format!("command `{}`", argv.join(" ")),
                after: self.timeout,
            })??;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
