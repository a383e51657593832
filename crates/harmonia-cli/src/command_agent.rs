use async_trait::async_trait;
use harmonia_core::{HarmoniaError, HarmoniaResult};
use harmonia_orchestrator::{AgentHandle, CancelSignal, ProbeSignal, Task, TaskOutcome};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

const MAX_STDOUT: usize = 50_000;
const MAX_STDERR: usize = 10_000;

/// Agent whose probe and execute callbacks are shell commands.
///
/// The task is exposed to the execute command through `HARMONIA_TASK_ID`,
/// `HARMONIA_TASK_CAPABILITY`, `HARMONIA_TASK_LABEL` and
/// `HARMONIA_TASK_PAYLOAD` (JSON). A cancelled task kills the child process.
pub struct CommandAgent {
    id: String,
    probe_command: Option<String>,
    execute_command: String,
}

impl CommandAgent {
    pub fn new(
        id: impl Into<String>,
        probe_command: Option<String>,
        execute_command: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            probe_command,
            execute_command: execute_command.into(),
        }
    }

    fn shell(command: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command).kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl AgentHandle for CommandAgent {
    async fn probe(&self) -> HarmoniaResult<ProbeSignal> {
        let Some(command) = &self.probe_command else {
            return Ok(ProbeSignal::Healthy);
        };
        let status = Self::shell(command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| HarmoniaError::Execution(format!("Failed to run probe: {e}")))?;
        debug!(agent = %self.id, code = status.code().unwrap_or(-1), "Probe command finished");
        Ok(if status.success() {
            ProbeSignal::Healthy
        } else {
            ProbeSignal::Unhealthy
        })
    }

    async fn execute(&self, task: &Task, mut cancel: CancelSignal) -> HarmoniaResult<TaskOutcome> {
        info!(agent = %self.id, task = %task.id, command = %self.execute_command, "Executing task command");
        let payload = serde_json::to_string(&task.definition.payload)?;
        let child = Self::shell(&self.execute_command)
            .env("HARMONIA_TASK_ID", task.id.to_string())
            .env("HARMONIA_TASK_CAPABILITY", task.capability())
            .env("HARMONIA_TASK_LABEL", task.definition.label.clone().unwrap_or_default())
            .env("HARMONIA_TASK_PAYLOAD", payload)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| HarmoniaError::Execution(format!("Failed to execute command: {e}")))?;

        let output = tokio::select! {
            output = child.wait_with_output() => output?,
            _ = cancel.cancelled() => {
                warn!(agent = %self.id, task = %task.id, "Task cancelled, command killed");
                return Ok(TaskOutcome::failed("cancelled"));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let exit_code = output.status.code().unwrap_or(-1);

        if output.status.success() {
            Ok(TaskOutcome::completed(serde_json::json!({
                "exit_code": exit_code,
                "stdout": truncate_output(&stdout, MAX_STDOUT),
                "stderr": truncate_output(&stderr, MAX_STDERR),
            })))
        } else {
            Ok(TaskOutcome::failed(format!(
                "exit code {exit_code}: {}",
                truncate_output(stderr.trim(), MAX_STDERR)
            )))
        }
    }
}

/// Cut `s` to at most `max` bytes on a char boundary.
fn truncate_output(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... [truncated, {} total bytes]", &s[..end], s.len())
}
