//! File read tool: return the text content of a file.

use async_trait::async_trait;
use parley_core::error::ToolError;
use parley_core::tool::Tool;
use serde::Deserialize;
use tracing::debug;

const NAME: &str = "read_file";
const DEFAULT_MAX_BYTES: usize = 256 * 1024;

#[derive(Debug, Deserialize)]
struct Args {
    path: String,
    #[serde(default)]
    max_bytes: Option<usize>,
}

pub struct FileReadTool {
    max_bytes: usize,
}

impl FileReadTool {
    pub fn new() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }

    /// Builder: cap how much of a file is returned.
    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }
}

impl Default for FileReadTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for FileReadTool {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> &str {
        "Read the contents of a text file at the given path."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "The file path to read"
                },
                "max_bytes": {
                    "type": "integer",
                    "description": "Return at most this many bytes"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> Result<serde_json::Value, ToolError> {
        let args: Args =
            serde_json::from_value(input).map_err(|e| ToolError::invalid_input(NAME, e))?;
        let limit = args.max_bytes.unwrap_or(self.max_bytes).min(self.max_bytes);

        debug!(path = %args.path, "Reading file");

        let bytes = tokio::fs::read(&args.path)
            .await
            .map_err(|e| ToolError::failed(NAME, format!("{}: {e}", args.path)))?;

        let truncated = bytes.len() > limit;
        let content = String::from_utf8_lossy(&bytes[..bytes.len().min(limit)]).into_owned();

        Ok(serde_json::json!({
            "path": args.path,
            "content": content,
            "size": bytes.len(),
            "truncated": truncated,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn tool_definition() {
        let tool = FileReadTool::new();
        assert_eq!(tool.name(), "read_file");
        let schema = tool.input_schema();
        assert_eq!(schema["required"], serde_json::json!(["path"]));
        assert!(schema["properties"]["path"].is_object());
    }

    #[tokio::test]
    async fn read_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("test.txt");
        let mut f = std::fs::File::create(&file_path).unwrap();
        writeln!(f, "Hello, world!").unwrap();

        let tool = FileReadTool::new();
        let result = tool
            .execute(serde_json::json!({ "path": file_path.to_str().unwrap() }))
            .await
            .unwrap();

        assert!(result["content"].as_str().unwrap().contains("Hello, world!"));
        assert_eq!(result["truncated"], false);
    }

    #[tokio::test]
    async fn large_file_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("big.txt");
        std::fs::write(&file_path, "x".repeat(100)).unwrap();

        let tool = FileReadTool::new().with_max_bytes(10);
        let result = tool
            .execute(serde_json::json!({ "path": file_path.to_str().unwrap() }))
            .await
            .unwrap();
        assert_eq!(result["content"].as_str().unwrap().len(), 10);
        assert_eq!(result["size"], 100);
        assert_eq!(result["truncated"], true);
    }

    #[tokio::test]
    async fn read_nonexistent_file() {
        let tool = FileReadTool::new();
        let result = tool
            .execute(serde_json::json!({ "path": "/tmp/parley_test_nonexistent_file_12345.txt" }))
            .await;
        assert!(matches!(result, Err(ToolError::ExecutionFailed { .. })));
    }

    #[tokio::test]
    async fn missing_path_argument() {
        let tool = FileReadTool::new();
        let result = tool.execute(serde_json::json!({})).await;
        assert!(matches!(result, Err(ToolError::InvalidInput { .. })));
    }
}
