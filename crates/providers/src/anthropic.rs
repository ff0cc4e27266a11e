//! Anthropic native backend implementation.
//!
//! Uses Anthropic's Messages API directly (not an OpenAI-compatible proxy).
//!
//! Features:
//! - `x-api-key` header authentication (not Bearer)
//! - `anthropic-version` header
//! - Leading system messages lifted into the top-level `system` field
//! - Native tool use with `tool_use` / `tool_result` content blocks

use async_trait::async_trait;
use parley_core::backend::{
    Backend, BackendRequest, BackendResponse, ChatMessage, ChatRole, FinishReason, ToolDefinition,
    Usage,
};
use parley_core::error::BackendError;
use parley_core::tool::{ToolCall, ToolResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const ANTHROPIC_VERSION: &str = "2023-06-01";
pub const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";

/// Anthropic native Messages API backend.
pub struct AnthropicBackend {
    base_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl AnthropicBackend {
    /// Create a new Anthropic backend.
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| BackendError::InvalidConfiguration(format!("HTTP client: {e}")))?;

        Ok(Self {
            base_url: ANTHROPIC_BASE_URL.into(),
            api_key: api_key.into(),
            model: model.into(),
            client,
        })
    }

    /// Create with a custom base URL (e.g., for testing or proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Split the leading run of system messages off into the `system`
    /// field. Later system messages (summaries, tool results, notices)
    /// stay in place as user text so their position is preserved.
    fn extract_system(messages: &[ChatMessage]) -> (Option<String>, &[ChatMessage]) {
        let split = messages
            .iter()
            .position(|m| m.role != ChatRole::System)
            .unwrap_or(messages.len());
        let (system, rest) = messages.split_at(split);

        let system = if system.is_empty() {
            None
        } else {
            Some(
                system
                    .iter()
                    .map(|m| m.content.as_str())
                    .collect::<Vec<_>>()
                    .join("\n\n"),
            )
        };

        (system, rest)
    }

    /// Convert messages to Anthropic content-block form. Consecutive
    /// messages with the same role are merged and the conversation always
    /// opens with a user turn.
    fn to_api_messages(messages: &[ChatMessage], tool_results: &[ToolResult]) -> Vec<AnthropicMessage> {
        let mut result: Vec<AnthropicMessage> = Vec::new();

        for msg in messages {
            let (role, text) = match msg.role {
                ChatRole::User => ("user", msg.content.clone()),
                ChatRole::Assistant => ("assistant", msg.content.clone()),
                ChatRole::System => ("user", format!("[system] {}", msg.content)),
            };
            push_block(&mut result, role, ContentBlock::Text { text });
        }

        for tool_result in tool_results {
            push_block(
                &mut result,
                "assistant",
                ContentBlock::ToolUse {
                    id: tool_result.tool_use_id.clone(),
                    name: tool_result.tool_name.clone(),
                    input: tool_result.input.clone(),
                },
            );
            push_block(
                &mut result,
                "user",
                ContentBlock::ToolResult {
                    tool_use_id: tool_result.tool_use_id.clone(),
                    content: tool_result.content.clone(),
                    is_error: tool_result.is_error,
                },
            );
        }

        if result.first().is_some_and(|m| m.role != "user") {
            result.insert(
                0,
                AnthropicMessage {
                    role: "user".into(),
                    content: vec![ContentBlock::Text {
                        text: "(conversation continues)".into(),
                    }],
                },
            );
        }

        result
    }

    /// Convert tool definitions to Anthropic format.
    fn to_api_tools(tools: &[ToolDefinition]) -> Vec<AnthropicTool> {
        tools
            .iter()
            .map(|t| AnthropicTool {
                name: t.name.clone(),
                description: t.description.clone(),
                input_schema: t.input_schema.clone(),
            })
            .collect()
    }

    fn build_body(&self, request: &BackendRequest) -> serde_json::Value {
        let (system, messages) = Self::extract_system(&request.messages);
        let api_messages = Self::to_api_messages(messages, &request.options.tool_results);

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": api_messages,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "top_p": request.top_p,
        });

        if let Some(ref sys) = system {
            body["system"] = serde_json::json!(sys);
        }

        if !request.options.tools.is_empty() {
            body["tools"] = serde_json::json!(Self::to_api_tools(&request.options.tools));
        }

        if !request.options.stop.is_empty() {
            body["stop_sequences"] = serde_json::json!(request.options.stop);
        }

        body
    }

    /// Convert an Anthropic API response to a backend response.
    fn parse_response(resp: AnthropicResponse) -> Result<BackendResponse, BackendError> {
        let mut text_content = String::new();
        let mut tool_request = None;

        for block in resp.content {
            match block {
                ResponseContentBlock::Text { text } => {
                    if !text_content.is_empty() {
                        text_content.push('\n');
                    }
                    text_content.push_str(&text);
                }
                ResponseContentBlock::ToolUse { id, name, input } => {
                    if tool_request.is_none() {
                        tool_request = Some(ToolCall { id, name, input });
                    }
                }
                ResponseContentBlock::Other => {}
            }
        }

        let mut finish_reason = resp
            .stop_reason
            .as_deref()
            .map(FinishReason::parse)
            .unwrap_or(FinishReason::Stop);

        if finish_reason == FinishReason::ContentFiltered {
            return Err(BackendError::ContentFiltered(
                "response refused by the model".into(),
            ));
        }
        if tool_request.is_some() {
            finish_reason = FinishReason::ToolUse;
        }

        Ok(BackendResponse {
            content: text_content,
            finish_reason,
            usage: Usage {
                prompt_tokens: resp.usage.input_tokens,
                completion_tokens: resp.usage.output_tokens,
                total_tokens: resp.usage.input_tokens + resp.usage.output_tokens,
            },
            tool_request,
            model: resp.model,
        })
    }
}

fn push_block(messages: &mut Vec<AnthropicMessage>, role: &str, block: ContentBlock) {
    match messages.last_mut() {
        Some(last) if last.role == role => last.content.push(block),
        _ => messages.push(AnthropicMessage {
            role: role.to_string(),
            content: vec![block],
        }),
    }
}

#[async_trait]
impl Backend for AnthropicBackend {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn model_id(&self) -> &str {
        &self.model
    }

    async fn send(&self, request: BackendRequest) -> Result<BackendResponse, BackendError> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = self.build_body(&request);

        debug!(backend = "anthropic", model = %self.model, "Sending completion request");

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::Network(e.to_string()))?;

        let status = response.status().as_u16();

        if !response.status().is_success() {
            let error_body = response.text().await.unwrap_or_default();
            warn!(status, body = %error_body, "Anthropic API error");
            // 529 is Anthropic's "overloaded"
            return Err(BackendError::from_status(status, error_body));
        }

        let api_resp: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Unknown(format!("Failed to parse Anthropic response: {e}")))?;

        Self::parse_response(api_resp)
    }
}

// --- Anthropic API types ---

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: Vec<ContentBlock>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
}

#[derive(Debug, Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    model: String,
    content: Vec<ResponseContentBlock>,
    usage: AnthropicUsage,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ResponseContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructor() {
        let backend = AnthropicBackend::new("sk-ant-test", "claude-sonnet-4-20250514").unwrap();
        assert_eq!(backend.name(), "anthropic");
        assert_eq!(backend.model_id(), "claude-sonnet-4-20250514");
        assert_eq!(backend.base_url, ANTHROPIC_BASE_URL);

        let proxied = backend.with_base_url("http://localhost:9000/");
        assert_eq!(proxied.base_url, "http://localhost:9000");
    }

    #[test]
    fn system_extraction_takes_leading_run_only() {
        let messages = vec![
            ChatMessage::system("You are helpful"),
            ChatMessage::system("Be concise"),
            ChatMessage::user("Hi"),
            ChatMessage::system("Tool result from shell: ok"),
        ];
        let (system, rest) = AnthropicBackend::extract_system(&messages);
        assert_eq!(system.as_deref(), Some("You are helpful\n\nBe concise"));
        assert_eq!(rest.len(), 2);
    }

    #[test]
    fn system_extraction_no_system() {
        let messages = vec![ChatMessage::user("Hi")];
        let (system, rest) = AnthropicBackend::extract_system(&messages);
        assert!(system.is_none());
        assert_eq!(rest.len(), 1);
    }

    #[test]
    fn consecutive_roles_are_merged() {
        let messages = vec![
            ChatMessage::user("list files"),
            ChatMessage::system("Tool result from directory_list: []"),
            ChatMessage::assistant("Nothing there."),
        ];
        let api = AnthropicBackend::to_api_messages(&messages, &[]);
        assert_eq!(api.len(), 2);
        assert_eq!(api[0].role, "user");
        assert_eq!(api[0].content.len(), 2);
        assert_eq!(api[1].role, "assistant");
    }

    #[test]
    fn conversation_opens_with_user() {
        let api = AnthropicBackend::to_api_messages(&[ChatMessage::assistant("Welcome back")], &[]);
        assert_eq!(api.len(), 2);
        assert_eq!(api[0].role, "user");
    }

    #[test]
    fn tool_results_become_blocks() {
        let result = ToolResult {
            tool_use_id: "toolu_1".into(),
            tool_name: "read_file".into(),
            input: serde_json::json!({"path": "a.txt"}),
            content: "\"hello\"".into(),
            is_error: false,
        };
        let api = AnthropicBackend::to_api_messages(&[ChatMessage::user("read a.txt")], &[result]);
        assert_eq!(api.len(), 3);
        assert_eq!(api[1].role, "assistant");
        assert_eq!(api[2].role, "user");

        let json = serde_json::to_value(&api).unwrap();
        assert_eq!(json[1]["content"][0]["type"], "tool_use");
        assert_eq!(json[1]["content"][0]["input"]["path"], "a.txt");
        assert_eq!(json[2]["content"][0]["type"], "tool_result");
        assert_eq!(json[2]["content"][0]["tool_use_id"], "toolu_1");
    }

    #[test]
    fn body_has_system_and_tools() {
        let backend = AnthropicBackend::new("k", "claude-3-5-haiku-latest").unwrap();
        let mut request = BackendRequest::new(
            vec![ChatMessage::system("sys"), ChatMessage::user("hi")],
            1024,
        );
        request.options.tools = vec![ToolDefinition {
            name: "read_file".into(),
            description: "Read a file".into(),
            input_schema: serde_json::json!({"type": "object"}),
        }];
        request.options.stop = vec!["END".into()];
        let body = backend.build_body(&request);
        assert_eq!(body["system"], "sys");
        assert_eq!(body["tools"][0]["name"], "read_file");
        assert_eq!(body["stop_sequences"][0], "END");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn parse_text_response() {
        let data = r#"{
            "id": "msg_123",
            "model": "claude-sonnet-4-20250514",
            "content": [{"type": "text", "text": "Hello!"}],
            "usage": {"input_tokens": 10, "output_tokens": 5},
            "stop_reason": "end_turn"
        }"#;
        let resp: AnthropicResponse = serde_json::from_str(data).unwrap();
        let parsed = AnthropicBackend::parse_response(resp).unwrap();
        assert_eq!(parsed.content, "Hello!");
        assert_eq!(parsed.finish_reason, FinishReason::Stop);
        assert_eq!(parsed.usage.total_tokens, 15);
    }

    #[test]
    fn parse_tool_use_response() {
        let data = r#"{
            "id": "msg_456",
            "model": "claude-sonnet-4-20250514",
            "content": [
                {"type": "thinking", "thinking": "let me look"},
                {"type": "text", "text": "Let me check."},
                {"type": "tool_use", "id": "toolu_1", "name": "directory_list", "input": {"path": "/tmp"}}
            ],
            "usage": {"input_tokens": 20, "output_tokens": 15},
            "stop_reason": "tool_use"
        }"#;
        let resp: AnthropicResponse = serde_json::from_str(data).unwrap();
        let parsed = AnthropicBackend::parse_response(resp).unwrap();
        assert!(parsed.wants_tool());
        let call = parsed.tool_request.unwrap();
        assert_eq!(call.name, "directory_list");
        assert_eq!(call.input["path"], "/tmp");
        assert_eq!(parsed.content, "Let me check.");
    }

    #[test]
    fn refusal_is_content_filtered() {
        let data = r#"{
            "model": "m", "content": [],
            "usage": {"input_tokens": 1, "output_tokens": 0},
            "stop_reason": "refusal"
        }"#;
        let resp: AnthropicResponse = serde_json::from_str(data).unwrap();
        assert!(matches!(
            AnthropicBackend::parse_response(resp),
            Err(BackendError::ContentFiltered(_))
        ));
    }
}
