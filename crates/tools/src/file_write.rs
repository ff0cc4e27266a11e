//! File write tool: create or overwrite a file.

use async_trait::async_trait;
use parley_core::error::ToolError;
use parley_core::tool::Tool;
use serde::Deserialize;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::debug;

const NAME: &str = "write_file";

#[derive(Debug, Deserialize)]
struct Args {
    path: String,
    content: String,
    #[serde(default)]
    append: bool,
}

#[derive(Default)]
pub struct FileWriteTool;

#[async_trait]
impl Tool for FileWriteTool {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> &str {
        "Write content to a file, creating parent directories as needed. Overwrites unless append is true."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "The file path to write to"
                },
                "content": {
                    "type": "string",
                    "description": "The content to write"
                },
                "append": {
                    "type": "boolean",
                    "description": "Append instead of overwriting"
                }
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> Result<serde_json::Value, ToolError> {
        let args: Args =
            serde_json::from_value(input).map_err(|e| ToolError::invalid_input(NAME, e))?;
        let path = Path::new(&args.path);

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ToolError::failed(NAME, format!("{}: {e}", parent.display())))?;
        }

        debug!(path = %args.path, bytes = args.content.len(), append = args.append, "Writing file");

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(args.append)
            .truncate(!args.append)
            .open(path)
            .await
            .map_err(|e| ToolError::failed(NAME, format!("{}: {e}", args.path)))?;
        file.write_all(args.content.as_bytes())
            .await
            .map_err(|e| ToolError::failed(NAME, e))?;
        file.flush().await.map_err(|e| ToolError::failed(NAME, e))?;

        Ok(serde_json::json!({
            "path": args.path,
            "bytes_written": args.content.len(),
            "appended": args.append,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_definition() {
        let schema = FileWriteTool.input_schema();
        assert_eq!(FileWriteTool.name(), "write_file");
        assert_eq!(schema["required"], serde_json::json!(["path", "content"]));
    }

    #[tokio::test]
    async fn write_and_verify() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("out.txt");

        let result = FileWriteTool
            .execute(serde_json::json!({
                "path": file_path.to_str().unwrap(),
                "content": "Hello from Parley!"
            }))
            .await
            .unwrap();

        assert_eq!(result["bytes_written"], 18);
        assert_eq!(std::fs::read_to_string(&file_path).unwrap(), "Hello from Parley!");
    }

    #[tokio::test]
    async fn write_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("a/b/c/deep.txt");

        FileWriteTool
            .execute(serde_json::json!({
                "path": file_path.to_str().unwrap(),
                "content": "deep"
            }))
            .await
            .unwrap();

        assert_eq!(std::fs::read_to_string(&file_path).unwrap(), "deep");
    }

    #[tokio::test]
    async fn overwrite_then_append() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("log.txt");
        std::fs::write(&file_path, "old content that is long").unwrap();

        let path = file_path.to_str().unwrap();
        FileWriteTool
            .execute(serde_json::json!({ "path": path, "content": "new" }))
            .await
            .unwrap();
        FileWriteTool
            .execute(serde_json::json!({ "path": path, "content": "+more", "append": true }))
            .await
            .unwrap();

        assert_eq!(std::fs::read_to_string(&file_path).unwrap(), "new+more");
    }

    #[tokio::test]
    async fn missing_content_argument() {
        let result = FileWriteTool
            .execute(serde_json::json!({ "path": "/tmp/x.txt" }))
            .await;
        assert!(matches!(result, Err(ToolError::InvalidInput { .. })));
    }
}
