//! Shell execution tool, confined to the session's workspace directory.

use async_trait::async_trait;
use serde_json::Value;

use okcvm_workspace::WorkspaceManager;

use crate::{Tool, ToolError, ToolOutput, ToolSpec};

const DEFAULT_TIMEOUT_SECS: u64 = 60;
const MAX_OUTPUT_BYTES: usize = 32768;

pub struct RunShellTool;

#[async_trait]
impl Tool for RunShellTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "run_shell".to_string(),
            description: "Execute a shell command within the workspace directory. Each \
                invocation runs in a fresh shell — `cd` does not persist between calls. \
                Chain commands with `&&` if you need them to share working directory or state."
                .to_string(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "command": { "type": "string", "description": "Shell command to execute" },
                    "timeout_secs": { "type": "integer", "description": "Max execution time in seconds (default: 60)" },
                },
                "required": ["command"],
            }),
            requires_workspace: true,
        }
    }

    async fn invoke(&self, input: Value, workspace: Option<&WorkspaceManager>) -> crate::Result<ToolOutput> {
        let workspace = workspace.expect("registry guarantees workspace for requires_workspace tools");

        let command = input
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::ToolInputInvalid { tool: "run_shell".to_string(), reason: "missing command".to_string() })?;
        let timeout_secs = input.get("timeout_secs").and_then(Value::as_u64).unwrap_or(DEFAULT_TIMEOUT_SECS);

        let cwd = &workspace.paths().internal_mount;

        let output = tokio::time::timeout(
            std::time::Duration::from_secs(timeout_secs),
            tokio::process::Command::new("sh").arg("-c").arg(command).current_dir(cwd).output(),
        )
        .await
        .map_err(|_| ToolError::ToolExecError {
            tool: "run_shell".to_string(),
            message: format!("command timed out after {timeout_secs}s"),
        })?
        .map_err(|e| ToolError::ToolExecError { tool: "run_shell".to_string(), message: e.to_string() })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let combined = if stderr.is_empty() { stdout.to_string() } else { format!("{stdout}\n[stderr] {stderr}") };

        let result = if combined.len() > MAX_OUTPUT_BYTES {
            let mut end = MAX_OUTPUT_BYTES;
            while end > 0 && !combined.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}…[truncated at {} bytes]", &combined[..end], MAX_OUTPUT_BYTES)
        } else {
            combined
        };

        Ok(ToolOutput { success: output.status.success(), output: result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace() -> (tempfile::TempDir, WorkspaceManager) {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::provision(dir.path(), "client-a").unwrap();
        (dir, manager)
    }

    #[tokio::test]
    async fn runs_command_in_workspace() {
        let (_dir, workspace) = workspace();
        let tool = RunShellTool;
        let out = tool.invoke(serde_json::json!({"command": "echo hi"}), Some(&workspace)).await.unwrap();
        assert!(out.success);
        assert!(out.output.contains("hi"));
    }

    #[tokio::test]
    async fn reports_nonzero_exit_without_erroring() {
        let (_dir, workspace) = workspace();
        let tool = RunShellTool;
        let out = tool.invoke(serde_json::json!({"command": "exit 1"}), Some(&workspace)).await.unwrap();
        assert!(!out.success);
    }

    #[tokio::test]
    async fn times_out_long_running_command() {
        let (_dir, workspace) = workspace();
        let tool = RunShellTool;
        let err = tool
            .invoke(serde_json::json!({"command": "sleep 5", "timeout_secs": 1}), Some(&workspace))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::ToolExecError { .. }));
    }
}
