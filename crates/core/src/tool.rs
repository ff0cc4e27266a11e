//! Tool trait and the category-permissioned tool registry.
//!
//! Tools give the model mediated access to the local machine: reading
//! files, listing directories, searching, running commands. Every tool
//! belongs to exactly one category; a category carries a permission level
//! and an enable flag, and a disabled category hides all of its tools from
//! both discovery and lookup.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use crate::backend::ToolDefinition;
use crate::error::ToolError;

/// A request from the model to execute a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Call ID (matches the backend's tool-use id)
    pub id: String,

    /// Name of the tool to execute
    pub name: String,

    /// Raw input as JSON
    pub input: serde_json::Value,
}

impl ToolCall {
    /// Create a call with a generated ID.
    pub fn new(name: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            id: format!("call_{}", crate::message::new_id()),
            name: name.into(),
            input,
        }
    }
}

/// The backend-consumable result of a dispatched tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// The call ID this result answers
    pub tool_use_id: String,

    pub tool_name: String,

    /// The input the tool was invoked with (echoed for wire formats that
    /// need the original call next to its result)
    #[serde(default)]
    pub input: serde_json::Value,

    /// Serialized JSON output
    pub content: String,

    #[serde(default)]
    pub is_error: bool,
}

/// How much a category's tools may do to the local machine.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum PermissionLevel {
    #[default]
    ReadOnly,
    ReadWrite,
    Execute,
}

impl std::fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ReadOnly => "read_only",
            Self::ReadWrite => "read_write",
            Self::Execute => "execute",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for PermissionLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "read_only" | "readonly" => Ok(Self::ReadOnly),
            "read_write" | "readwrite" => Ok(Self::ReadWrite),
            "execute" => Ok(Self::Execute),
            other => Err(format!("unknown permission level '{other}'")),
        }
    }
}

/// The core Tool trait.
///
/// Each tool declares its input schema; the dispatcher checks raw input
/// against it before `execute` is called. The output must be
/// JSON-serializable.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g., "read_file").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the model).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's input.
    fn input_schema(&self) -> serde_json::Value;

    /// Execute the tool with the given raw input.
    async fn execute(&self, input: serde_json::Value) -> Result<serde_json::Value, ToolError>;

    /// Convert this tool into a declaration for the model.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.input_schema(),
        }
    }
}

/// Declarative description of a category, used to register it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub permission: PermissionLevel,
}

impl Category {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
        permission: PermissionLevel,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: description.into(),
            enabled: false,
            permission,
        }
    }
}

/// A snapshot of one category and the names of its tools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryInfo {
    #[serde(flatten)]
    pub category: Category,
    pub tools: Vec<String>,
}

struct CategoryEntry {
    category: Category,
    tools: Vec<Arc<dyn Tool>>,
}

/// A registry of tools grouped by category.
///
/// Guarded by a reader/writer lock: configuration mutations exclude
/// lookups, lookups run concurrently. Tools are handed out as `Arc`s so no
/// lock is held while a tool executes.
pub struct ToolRegistry {
    categories: RwLock<BTreeMap<String, CategoryEntry>>,
    ceiling: PermissionLevel,
}

impl ToolRegistry {
    /// An empty registry that allows every permission level.
    pub fn new() -> Self {
        Self::with_ceiling(PermissionLevel::Execute)
    }

    /// An empty registry that refuses to enable categories above `ceiling`.
    pub fn with_ceiling(ceiling: PermissionLevel) -> Self {
        Self {
            categories: RwLock::new(BTreeMap::new()),
            ceiling,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, CategoryEntry>> {
        self.categories.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, CategoryEntry>> {
        self.categories.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn ceiling(&self) -> PermissionLevel {
        self.ceiling
    }

    /// Register a category. Fails if the ID is taken, or if it arrives
    /// enabled with a permission level above the ceiling.
    pub fn register_category(&self, category: Category) -> Result<(), ToolError> {
        if category.enabled && category.permission > self.ceiling {
            return Err(self.denied(&category));
        }
        let mut categories = self.write();
        if categories.contains_key(&category.id) {
            return Err(ToolError::DuplicateCategory(category.id));
        }
        debug!(category = %category.id, permission = %category.permission, "Registered tool category");
        categories.insert(
            category.id.clone(),
            CategoryEntry {
                category,
                tools: Vec::new(),
            },
        );
        Ok(())
    }

    /// Register a tool under a category. Tool names are unique across the
    /// whole registry.
    pub fn register_tool(&self, category_id: &str, tool: Arc<dyn Tool>) -> Result<(), ToolError> {
        let mut categories = self.write();
        let name = tool.name().to_string();
        let taken = categories
            .values()
            .any(|entry| entry.tools.iter().any(|t| t.name() == name));
        if taken {
            return Err(ToolError::DuplicateTool(name));
        }
        let entry = categories
            .get_mut(category_id)
            .ok_or_else(|| ToolError::CategoryNotFound(category_id.to_string()))?;
        debug!(tool = %name, category = %category_id, "Registered tool");
        entry.tools.push(tool);
        Ok(())
    }

    /// Enable or disable one category.
    pub fn enable_category(&self, category_id: &str, enabled: bool) -> Result<(), ToolError> {
        let mut categories = self.write();
        let entry = categories
            .get_mut(category_id)
            .ok_or_else(|| ToolError::CategoryNotFound(category_id.to_string()))?;
        if enabled && entry.category.permission > self.ceiling {
            return Err(self.denied(&entry.category));
        }
        entry.category.enabled = enabled;
        Ok(())
    }

    /// Enable or disable every category. Categories above the permission
    /// ceiling stay disabled.
    pub fn enable_all_categories(&self, enabled: bool) {
        let mut categories = self.write();
        for entry in categories.values_mut() {
            entry.category.enabled = enabled && entry.category.permission <= self.ceiling;
        }
    }

    /// Declarations of every tool in an enabled category.
    pub fn enabled_tools(&self) -> Vec<ToolDefinition> {
        self.read()
            .values()
            .filter(|entry| entry.category.enabled)
            .flat_map(|entry| entry.tools.iter().map(|t| t.to_definition()))
            .collect()
    }

    /// Find a tool by name across enabled categories only.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.read()
            .values()
            .filter(|entry| entry.category.enabled)
            .flat_map(|entry| entry.tools.iter())
            .find(|t| t.name() == name)
            .cloned()
    }

    /// The category a tool is registered under, whether enabled or not.
    pub fn category_of(&self, tool_name: &str) -> Option<String> {
        self.read()
            .values()
            .find(|entry| entry.tools.iter().any(|t| t.name() == tool_name))
            .map(|entry| entry.category.id.clone())
    }

    /// Snapshot of all categories.
    pub fn categories(&self) -> Vec<CategoryInfo> {
        self.read()
            .values()
            .map(|entry| CategoryInfo {
                category: entry.category.clone(),
                tools: entry.tools.iter().map(|t| t.name().to_string()).collect(),
            })
            .collect()
    }

    /// Total registered tools, enabled or not.
    pub fn len(&self) -> usize {
        self.read().values().map(|entry| entry.tools.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn denied(&self, category: &Category) -> ToolError {
        ToolError::PermissionDenied {
            category: category.id.clone(),
            reason: format!(
                "permission level {} exceeds the configured ceiling {}",
                category.permission, self.ceiling
            ),
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
