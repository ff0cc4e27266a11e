//! Built-in tool implementations for Parley.
//!
//! Tools give the model the ability to interact with the local machine:
//! read and list files, search file contents, write files, and run shell
//! commands. Each tool is registered under a category whose permission
//! level decides whether it may be enabled.

pub mod content_search;
pub mod directory_list;
pub mod file_read;
pub mod file_write;
pub mod shell;

use parley_config::ToolsConfig;
use parley_core::error::ToolError;
use parley_core::tool::{Category, PermissionLevel, ToolRegistry};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub use content_search::ContentSearchTool;
pub use directory_list::DirectoryListTool;
pub use file_read::FileReadTool;
pub use file_write::FileWriteTool;
pub use shell::ShellTool;

pub const FILESYSTEM: &str = "filesystem";
pub const SEARCH: &str = "search";
pub const EDITING: &str = "editing";
pub const SHELL: &str = "shell";

/// Create a registry with every built-in tool in its category, then enable
/// the categories `config` lists.
///
/// Categories unknown to the registry or above `config.max_permission` are
/// skipped with a warning rather than failing startup.
pub fn default_registry(config: &ToolsConfig) -> Result<ToolRegistry, ToolError> {
    let registry = ToolRegistry::with_ceiling(config.max_permission);

    registry.register_category(Category::new(
        FILESYSTEM,
        "Filesystem",
        "Read files and list directories",
        PermissionLevel::ReadOnly,
    ))?;
    registry.register_category(Category::new(
        SEARCH,
        "Search",
        "Search file contents",
        PermissionLevel::ReadOnly,
    ))?;
    registry.register_category(Category::new(
        EDITING,
        "Editing",
        "Create and modify files",
        PermissionLevel::ReadWrite,
    ))?;
    registry.register_category(Category::new(
        SHELL,
        "Shell",
        "Run shell commands",
        PermissionLevel::Execute,
    ))?;

    registry.register_tool(FILESYSTEM, Arc::new(FileReadTool::new()))?;
    registry.register_tool(FILESYSTEM, Arc::new(DirectoryListTool))?;
    registry.register_tool(SEARCH, Arc::new(ContentSearchTool))?;
    registry.register_tool(EDITING, Arc::new(FileWriteTool))?;
    registry.register_tool(
        SHELL,
        Arc::new(ShellTool::new(Duration::from_secs(config.shell_timeout_secs))),
    )?;

    if config.enabled {
        for id in &config.enabled_categories {
            if let Err(e) = registry.enable_category(id, true) {
                warn!(category = %id, error = %e, "Skipping tool category");
            }
        }
    }

    Ok(registry)
}
