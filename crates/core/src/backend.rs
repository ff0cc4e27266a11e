//! Backend trait: the abstraction over LLM chat endpoints.
//!
//! A Backend knows how to send a rendered conversation plus tool
//! declarations to a model and get back either a textual reply or a
//! single tool-call request. Responses are delivered whole; there is no
//! token streaming.
//!
//! Implementations: OpenAI-compatible, Anthropic Messages, local
//! OpenAI-compatible servers, and a scripted mock.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::BackendError;
use crate::tool::{ToolCall, ToolResult};

/// Role of a message in the backend's wire form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// A rendered message as the backend consumes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// A tool declaration sent to the model so it knows what it can call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema describing the tool's input
    pub input_schema: serde_json::Value,
}

/// Per-request options beyond sampling parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestOptions {
    /// Tools the model may call on this request
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,

    /// Results of tool calls made earlier in the same turn
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_results: Vec<ToolResult>,

    /// Stop sequences
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
}

/// A single request to a backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendRequest {
    pub messages: Vec<ChatMessage>,

    /// Maximum tokens to generate
    pub max_tokens: u32,

    /// Temperature (0.0 = deterministic)
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Nucleus sampling
    #[serde(default = "default_top_p")]
    pub top_p: f32,

    #[serde(default)]
    pub options: RequestOptions,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_top_p() -> f32 {
    0.9
}

impl BackendRequest {
    /// A request with default sampling and no tools.
    pub fn new(messages: Vec<ChatMessage>, max_tokens: u32) -> Self {
        Self {
            messages,
            max_tokens,
            temperature: default_temperature(),
            top_p: default_top_p(),
            options: RequestOptions::default(),
        }
    }
}

/// Why the model stopped generating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolUse,
    MaxTokens,
    ContentFiltered,
    Other(String),
}

impl FinishReason {
    /// Normalize the provider-specific spellings.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "stop" | "end_turn" | "stop_sequence" | "eos" => Self::Stop,
            "tool_use" | "tool_calls" | "function_call" => Self::ToolUse,
            "length" | "max_tokens" => Self::MaxTokens,
            "content_filter" | "content_filtered" | "refusal" => Self::ContentFiltered,
            other => Self::Other(other.to_string()),
        }
    }
}

/// Token usage information.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// A complete response from a backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendResponse {
    pub content: String,
    pub finish_reason: FinishReason,
    #[serde(default)]
    pub usage: Usage,
    /// Present when the model asks for a tool call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_request: Option<ToolCall>,
    /// Which model actually responded
    #[serde(default)]
    pub model: String,
}

impl BackendResponse {
    /// A plain textual reply.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            finish_reason: FinishReason::Stop,
            usage: Usage::default(),
            tool_request: None,
            model: String::new(),
        }
    }

    /// A reply that requests a tool call.
    pub fn tool_use(call: ToolCall) -> Self {
        Self {
            content: String::new(),
            finish_reason: FinishReason::ToolUse,
            usage: Usage::default(),
            tool_request: Some(call),
            model: String::new(),
        }
    }

    /// Whether the turn loop should dispatch a tool for this reply.
    pub fn wants_tool(&self) -> bool {
        self.finish_reason == FinishReason::ToolUse && self.tool_request.is_some()
    }
}

/// The core Backend trait.
///
/// The orchestrator calls `send()` without knowing which concrete
/// endpoint sits behind it. Errors are classified through
/// [`BackendError::kind`] so the caller can decide retry vs. report.
#[async_trait]
pub trait Backend: Send + Sync {
    /// A human-readable name for this backend (e.g., "openai", "mock").
    fn name(&self) -> &str;

    /// The model identifier requests are sent to.
    fn model_id(&self) -> &str;

    /// Send a request and get a complete response.
    async fn send(&self, request: BackendRequest) -> Result<BackendResponse, BackendError>;

    /// Release any held resources. Called once on session close.
    async fn close(&self) -> Result<(), BackendError> {
        Ok(())
    }
}
