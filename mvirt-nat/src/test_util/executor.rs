//! Command executor that records instead of running.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::lock;
use crate::error::Result;
use crate::exec::{CommandExecutor, CommandOutput};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCommand {
    pub argv: Vec<String>,
    pub stdin: Option<String>,
}

impl RecordedCommand {
    /// The argument vector joined with spaces.
    pub fn line(&self) -> String {
        self.argv.join(" ")
    }
}

#[derive(Debug, Default)]
struct ExecutorState {
    commands: Vec<RecordedCommand>,
    /// Commands whose line contains one of these exit with status 1.
    fail_patterns: Vec<String>,
}

/// Records every command and succeeds unless told otherwise.
#[derive(Debug, Clone, Default)]
pub struct RecordingExecutor {
    state: Arc<Mutex<ExecutorState>>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every later command whose line contains `pattern`.
    pub fn fail_when(&self, pattern: &str) {
        lock(&self.state).fail_patterns.push(pattern.to_string());
    }

    pub fn clear_failures(&self) {
        lock(&self.state).fail_patterns.clear();
    }

    pub fn commands(&self) -> Vec<RecordedCommand> {
        lock(&self.state).commands.clone()
    }

    pub fn lines(&self) -> Vec<String> {
        lock(&self.state)
            .commands
            .iter()
            .map(RecordedCommand::line)
            .collect()
    }

    /// Forget recorded commands, keeping failure patterns.
    pub fn clear(&self) {
        lock(&self.state).commands.clear();
    }

    /// The stdin of the most recent `iptables-restore` call.
    pub fn last_restore(&self) -> Option<String> {
        lock(&self.state)
            .commands
            .iter()
            .rev()
            .find(|c| c.argv.first().map(String::as_str) == Some("iptables-restore"))
            .and_then(|c| c.stdin.clone())
    }
}

#[async_trait]
impl CommandExecutor for RecordingExecutor {
    async fn run(&self, argv: &[String], stdin: Option<&str>) -> Result<CommandOutput> {
        let mut state = lock(&self.state);
        let cmd = RecordedCommand {
            argv: argv.to_vec(),
            stdin: stdin.map(str::to_string),
        };
        let line = cmd.line();
        state.commands.push(cmd);
        if state.fail_patterns.iter().any(|p| line.contains(p.as_str())) {
            return Ok(CommandOutput {
                code: Some(1),
                stdout: String::new(),
                stderr: "injected failure".to_string(),
            });
        }
        Ok(CommandOutput {
            code: Some(0),
            ..Default::default()
        })
    }
}
