//! Content search tool: find lines containing a string under a directory.

use async_trait::async_trait;
use parley_core::error::ToolError;
use parley_core::tool::Tool;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

const NAME: &str = "content_search";
const DEFAULT_MAX_RESULTS: usize = 100;
/// Files larger than this are skipped.
const MAX_FILE_BYTES: u64 = 2 * 1024 * 1024;
/// Long matching lines are clipped to this many characters.
const MAX_LINE_CHARS: usize = 240;

#[derive(Debug, Deserialize)]
struct Args {
    query: String,
    path: String,
    /// Glob matched against file names, e.g. `*.rs`
    #[serde(default)]
    file_pattern: Option<String>,
    /// Descend into subdirectories; true when omitted
    #[serde(default)]
    recursive: Option<bool>,
    #[serde(default)]
    case_sensitive: bool,
    #[serde(default)]
    max_results: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchHit {
    pub file: String,
    pub line: usize,
    pub text: String,
}

#[derive(Default)]
pub struct ContentSearchTool;

#[async_trait]
impl Tool for ContentSearchTool {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> &str {
        "Search text files under a directory for lines containing a string. Returns file, line number and line text for each match."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Text to look for" },
                "path": { "type": "string", "description": "Directory (or single file) to search" },
                "file_pattern": { "type": "string", "description": "Glob for file names, e.g. *.rs" },
                "recursive": { "type": "boolean", "description": "Search subdirectories (default true)" },
                "case_sensitive": { "type": "boolean", "description": "Match case exactly (default false)" },
                "max_results": { "type": "integer", "description": "Stop after this many matches" }
            },
            "required": ["query", "path"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> Result<serde_json::Value, ToolError> {
        let args: Args =
            serde_json::from_value(input).map_err(|e| ToolError::invalid_input(NAME, e))?;
        if args.query.is_empty() {
            return Err(ToolError::invalid_input(NAME, "query must not be empty"));
        }

        let pattern = args
            .file_pattern
            .as_deref()
            .map(glob::Pattern::new)
            .transpose()
            .map_err(|e| ToolError::invalid_input(NAME, format!("file_pattern: {e}")))?;

        debug!(query = %args.query, path = %args.path, recursive = ?args.recursive, "Searching");

        // walkdir is blocking
        let hits = tokio::task::spawn_blocking(move || search(&args, pattern.as_ref()))
            .await
            .map_err(|e| ToolError::failed(NAME, e))??;

        serde_json::to_value(hits).map_err(|e| ToolError::failed(NAME, e))
    }
}

fn search(args: &Args, pattern: Option<&glob::Pattern>) -> Result<Vec<SearchHit>, ToolError> {
    let root = Path::new(&args.path);
    if !root.exists() {
        return Err(ToolError::failed(NAME, format!("{}: no such path", args.path)));
    }

    let recursive = args.recursive.unwrap_or(true);
    let max_results = args.max_results.unwrap_or(DEFAULT_MAX_RESULTS);
    let needle = if args.case_sensitive {
        args.query.clone()
    } else {
        args.query.to_lowercase()
    };

    let mut walker = walkdir::WalkDir::new(root).sort_by_file_name();
    if !recursive {
        walker = walker.max_depth(1);
    }

    let mut hits = Vec::new();
    for entry in walker
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'))
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if pattern.is_some_and(|p| !p.matches(&name)) {
            continue;
        }
        if entry.metadata().map(|m| m.len() > MAX_FILE_BYTES).unwrap_or(true) {
            continue;
        }
        // Non-UTF-8 files are treated as binary and skipped
        let Ok(content) = std::fs::read_to_string(entry.path()) else {
            continue;
        };

        for (idx, line) in content.lines().enumerate() {
            let matched = if args.case_sensitive {
                line.contains(&needle)
            } else {
                line.to_lowercase().contains(&needle)
            };
            if !matched {
                continue;
            }
            hits.push(SearchHit {
                file: entry.path().display().to_string(),
                line: idx + 1,
                text: line.trim().chars().take(MAX_LINE_CHARS).collect(),
            });
            if hits.len() >= max_results {
                return Ok(hits);
            }
        }
    }

    Ok(hits)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("top.rs"), "fn main() {\n    println!(\"Hello\");\n}\n").unwrap();
        std::fs::write(dir.path().join("notes.md"), "hello from the notes\n").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("nested/deep.rs"), "// hello again\n").unwrap();
        dir
    }

    async fn run(input: serde_json::Value) -> Vec<serde_json::Value> {
        ContentSearchTool
            .execute(input)
            .await
            .unwrap()
            .as_array()
            .unwrap()
            .clone()
    }

    #[tokio::test]
    async fn recursive_by_default_and_case_insensitive() {
        let dir = fixture();
        let hits = run(serde_json::json!({
            "query": "hello",
            "path": dir.path().to_str().unwrap()
        }))
        .await;
        assert_eq!(hits.len(), 3);
    }

    #[tokio::test]
    async fn recursive_false_is_honoured() {
        let dir = fixture();
        let hits = run(serde_json::json!({
            "query": "hello",
            "path": dir.path().to_str().unwrap(),
            "recursive": false
        }))
        .await;
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|h| !h["file"].as_str().unwrap().contains("nested")));
    }

    #[tokio::test]
    async fn file_pattern_and_case_sensitivity() {
        let dir = fixture();
        let hits = run(serde_json::json!({
            "query": "Hello",
            "path": dir.path().to_str().unwrap(),
            "file_pattern": "*.rs",
            "case_sensitive": true
        }))
        .await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0]["line"], 2);
        assert!(hits[0]["file"].as_str().unwrap().ends_with("top.rs"));
    }

    #[tokio::test]
    async fn max_results_caps_output() {
        let dir = fixture();
        let hits = run(serde_json::json!({
            "query": "hello",
            "path": dir.path().to_str().unwrap(),
            "max_results": 1
        }))
        .await;
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn bad_glob_is_invalid_input() {
        let result = ContentSearchTool
            .execute(serde_json::json!({ "query": "x", "path": "/tmp", "file_pattern": "[" }))
            .await;
        assert!(matches!(result, Err(ToolError::InvalidInput { .. })));
    }

    #[tokio::test]
    async fn missing_root_fails() {
        let result = ContentSearchTool
            .execute(serde_json::json!({ "query": "x", "path": "/nonexistent/parley" }))
            .await;
        assert!(matches!(result, Err(ToolError::ExecutionFailed { .. })));
    }
}
