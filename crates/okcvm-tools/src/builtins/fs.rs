//! File system tools: read and write files, confined to the session's workspace.

use async_trait::async_trait;
use serde_json::Value;

use okcvm_workspace::WorkspaceManager;

use crate::{Tool, ToolError, ToolOutput, ToolSpec};

/// Find the largest byte offset ≤ `max` that falls on a UTF-8 character
/// boundary. Safe to use as `&s[..truncate_byte_boundary(s, max)]`.
fn truncate_byte_boundary(s: &str, max: usize) -> usize {
    if max >= s.len() {
        return s.len();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    end
}

pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "read_file".to_string(),
            description: "Read the contents of a file within the workspace.".to_string(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "Path relative to the workspace mount" },
                    "max_bytes": { "type": "integer", "description": "Maximum bytes to read (default: 65536)" },
                },
                "required": ["path"],
            }),
            requires_workspace: true,
        }
    }

    async fn invoke(&self, input: Value, workspace: Option<&WorkspaceManager>) -> crate::Result<ToolOutput> {
        let workspace = workspace.expect("registry guarantees workspace for requires_workspace tools");

        let path = input
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::ToolInputInvalid { tool: "read_file".to_string(), reason: "missing path".to_string() })?;

        let resolved = workspace.resolve(path).map_err(|e| ToolError::ToolExecError {
            tool: "read_file".to_string(),
            message: e.to_string(),
        })?;

        let max_bytes = input.get("max_bytes").and_then(Value::as_u64).unwrap_or(65536) as usize;

        let content = std::fs::read_to_string(&resolved).map_err(|e| ToolError::ToolExecError {
            tool: "read_file".to_string(),
            message: format!("cannot read '{path}': {e}"),
        })?;

        let output = if content.len() > max_bytes {
            let end = truncate_byte_boundary(&content, max_bytes);
            format!("{}…[truncated at {} bytes]", &content[..end], max_bytes)
        } else {
            content
        };

        Ok(ToolOutput { success: true, output })
    }
}

pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "write_file".to_string(),
            description: "Write content to a file within the workspace (creates or overwrites).".to_string(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "Path relative to the workspace mount" },
                    "content": { "type": "string", "description": "File content to write" },
                },
                "required": ["path", "content"],
            }),
            requires_workspace: true,
        }
    }

    async fn invoke(&self, input: Value, workspace: Option<&WorkspaceManager>) -> crate::Result<ToolOutput> {
        let workspace = workspace.expect("registry guarantees workspace for requires_workspace tools");

        let path = input
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::ToolInputInvalid { tool: "write_file".to_string(), reason: "missing path".to_string() })?;
        let content = input
            .get("content")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::ToolInputInvalid { tool: "write_file".to_string(), reason: "missing content".to_string() })?;

        let resolved = workspace.resolve(path).map_err(|e| ToolError::ToolExecError {
            tool: "write_file".to_string(),
            message: e.to_string(),
        })?;

        if let Some(parent) = resolved.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ToolError::ToolExecError {
                tool: "write_file".to_string(),
                message: e.to_string(),
            })?;
        }

        std::fs::write(&resolved, content).map_err(|e| ToolError::ToolExecError {
            tool: "write_file".to_string(),
            message: format!("cannot write '{path}': {e}"),
        })?;

        Ok(ToolOutput { success: true, output: format!("wrote {} bytes to {}", content.len(), path) })
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
    async fn write_then_read_round_trips() {
        let (_dir, workspace) = workspace();
        let write = WriteFileTool;
        let read = ReadFileTool;

        write
            .invoke(serde_json::json!({"path": "notes.txt", "content": "hello workspace"}), Some(&workspace))
            .await
            .unwrap();

        let out = read.invoke(serde_json::json!({"path": "notes.txt"}), Some(&workspace)).await.unwrap();
        assert_eq!(out.output, "hello workspace");
    }

    #[tokio::test]
    async fn read_rejects_path_escape() {
        let (_dir, workspace) = workspace();
        let read = ReadFileTool;
        let err = read.invoke(serde_json::json!({"path": "../../etc/passwd"}), Some(&workspace)).await.unwrap_err();
        assert!(matches!(err, ToolError::ToolExecError { .. }));
    }

    #[tokio::test]
    async fn read_truncates_large_file() {
        let (_dir, workspace) = workspace();
        let write = WriteFileTool;
        let read = ReadFileTool;

        let big = "x".repeat(100);
        write.invoke(serde_json::json!({"path": "big.txt", "content": big}), Some(&workspace)).await.unwrap();

        let out = read.invoke(serde_json::json!({"path": "big.txt", "max_bytes": 10}), Some(&workspace)).await.unwrap();
        assert!(out.output.contains("truncated at 10 bytes"));
    }
}
