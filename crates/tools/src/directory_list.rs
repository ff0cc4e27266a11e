//! Directory listing tool.

use async_trait::async_trait;
use parley_core::error::ToolError;
use parley_core::tool::Tool;
use serde::{Deserialize, Serialize};

const NAME: &str = "directory_list";

#[derive(Debug, Deserialize)]
struct Args {
    path: String,
    /// Include dot-files
    #[serde(default)]
    show_hidden: bool,
}

/// One directory entry as reported to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub name: String,
    #[serde(rename = "isDir")]
    pub is_dir: bool,
}

#[derive(Default)]
pub struct DirectoryListTool;

#[async_trait]
impl Tool for DirectoryListTool {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> &str {
        "List the entries of a directory. Returns each entry's name and whether it is a directory."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "The directory to list"
                },
                "show_hidden": {
                    "type": "boolean",
                    "description": "Include entries whose names start with a dot"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> Result<serde_json::Value, ToolError> {
        let args: Args =
            serde_json::from_value(input).map_err(|e| ToolError::invalid_input(NAME, e))?;

        let mut reader = tokio::fs::read_dir(&args.path)
            .await
            .map_err(|e| ToolError::failed(NAME, format!("{}: {e}", args.path)))?;

        let mut entries = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| ToolError::failed(NAME, e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !args.show_hidden && name.starts_with('.') {
                continue;
            }
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            entries.push(Entry { name, is_dir });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        serde_json::to_value(entries).map_err(|e| ToolError::failed(NAME, e))
    }
}
