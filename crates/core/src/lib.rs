//! # Parley Core
//!
//! Domain types, traits, and error definitions for the Parley conversation
//! orchestrator. This crate performs no I/O; it defines the model that all
//! other crates implement against.
//!
//! ## Design Philosophy
//!
//! Every seam is a trait here. Implementations live in their respective
//! crates, which lets configuration swap backends and tools, lets tests
//! substitute scripted mocks, and keeps the dependency graph pointing
//! inward on core.

pub mod backend;
pub mod error;
pub mod message;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use backend::{
    Backend, BackendRequest, BackendResponse, ChatMessage, ChatRole, FinishReason,
    RequestOptions, ToolDefinition, Usage,
};
pub use error::{
    BackendError, ContextError, Error, ErrorKind, Result, StoreError, ToolError,
};
pub use message::{
    ContextSelection, Importance, LOADED_FROM_DISK_TAG, Message, Role, Summary, TimeSpan,
};
pub use tool::{Category, CategoryInfo, PermissionLevel, Tool, ToolCall, ToolRegistry, ToolResult};
