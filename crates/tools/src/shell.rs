//! Shell tool: execute system commands with a timeout.

use async_trait::async_trait;
use parley_core::error::ToolError;
use parley_core::tool::Tool;
use serde::Deserialize;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

const NAME: &str = "shell";
/// Output beyond this many bytes per stream is clipped.
const MAX_OUTPUT_BYTES: usize = 64 * 1024;

#[derive(Debug, Deserialize)]
struct Args {
    command: String,
    #[serde(default)]
    working_dir: Option<String>,
    #[serde(default)]
    timeout_secs: Option<u64>,
}

/// Execute shell commands.
pub struct ShellTool {
    default_timeout: Duration,
}

impl ShellTool {
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }
}

impl Default for ShellTool {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

fn clip(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(&bytes[..bytes.len().min(MAX_OUTPUT_BYTES)]);
    let mut text = text.trim_end().to_string();
    if bytes.len() > MAX_OUTPUT_BYTES {
        text.push_str("\n[output truncated]");
    }
    text
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> &str {
        "Execute a shell command and return its exit code, stdout and stderr. Use this for running programs, git operations, builds, etc."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                },
                "working_dir": {
                    "type": "string",
                    "description": "Directory to run the command in"
                },
                "timeout_secs": {
                    "type": "integer",
                    "description": "Kill the command after this many seconds"
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> Result<serde_json::Value, ToolError> {
        let args: Args =
            serde_json::from_value(input).map_err(|e| ToolError::invalid_input(NAME, e))?;
        if args.command.trim().is_empty() {
            return Err(ToolError::invalid_input(NAME, "command must not be empty"));
        }
        let timeout = args
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);

        debug!(command = %args.command, timeout_secs = timeout.as_secs(), "Executing shell command");

        let mut command = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", &args.command]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", &args.command]);
            c
        };
        if let Some(dir) = &args.working_dir {
            command.current_dir(dir);
        }
        command.kill_on_drop(true);

        let output = match tokio::time::timeout(timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(ToolError::failed(NAME, e)),
            Err(_) => {
                warn!(command = %args.command, "Command timed out");
                return Err(ToolError::Timeout {
                    tool_name: NAME.into(),
                    timeout_secs: timeout.as_secs(),
                });
            }
        };

        let exit_code = output.status.code().unwrap_or(-1);
        if !output.status.success() {
            warn!(command = %args.command, exit_code, "Command failed");
        }

        Ok(serde_json::json!({
            "exit_code": exit_code,
            "success": output.status.success(),
            "stdout": clip(&output.stdout),
            "stderr": clip(&output.stderr),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn execute_echo() {
        let result = ShellTool::default()
            .execute(serde_json::json!({"command": "echo hello"}))
            .await
            .unwrap();
        assert_eq!(result["exit_code"], 0);
        assert_eq!(result["stdout"], "hello");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_is_reported_not_raised() {
        let result = ShellTool::default()
            .execute(serde_json::json!({"command": "echo oops >&2; exit 3"}))
            .await
            .unwrap();
        assert_eq!(result["exit_code"], 3);
        assert_eq!(result["success"], false);
        assert_eq!(result["stderr"], "oops");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn working_dir_is_used() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "").unwrap();
        let result = ShellTool::default()
            .execute(serde_json::json!({
                "command": "ls",
                "working_dir": dir.path().to_str().unwrap()
            }))
            .await
            .unwrap();
        assert!(result["stdout"].as_str().unwrap().contains("marker.txt"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_kills_command() {
        let result = ShellTool::new(Duration::from_millis(200))
            .execute(serde_json::json!({"command": "sleep 5"}))
            .await;
        assert!(matches!(result, Err(ToolError::Timeout { .. })));
    }

    #[tokio::test]
    async fn empty_command_rejected() {
        let result = ShellTool::default()
            .execute(serde_json::json!({"command": "   "}))
            .await;
        assert!(matches!(result, Err(ToolError::InvalidInput { .. })));
    }

    #[test]
    fn clip_truncates() {
        let big = vec![b'a'; MAX_OUTPUT_BYTES + 10];
        assert!(clip(&big).ends_with("[output truncated]"));
        assert_eq!(clip(b"short\n"), "short");
    }
}
