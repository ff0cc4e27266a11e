//! OpenAI-compatible backend implementation.
//!
//! Works with: OpenAI, OpenRouter, Ollama, vLLM, llama.cpp and any other
//! endpoint that exposes `/v1/chat/completions`.
//!
//! Supports:
//! - Chat completions (whole responses, no streaming)
//! - Tool use / function calling, including replaying earlier tool results

use async_trait::async_trait;
use parley_core::backend::{
    Backend, BackendRequest, BackendResponse, ChatMessage, ChatRole, FinishReason, ToolDefinition,
    Usage,
};
use parley_core::error::BackendError;
use parley_core::tool::{ToolCall, ToolResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const LOCAL_BASE_URL: &str = "http://localhost:11434/v1";

/// An OpenAI-compatible chat backend.
pub struct OpenAiCompatBackend {
    name: String,
    base_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl OpenAiCompatBackend {
    /// Create a new OpenAI-compatible backend.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| BackendError::InvalidConfiguration(format!("HTTP client: {e}")))?;

        Ok(Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            client,
        })
    }

    /// Create an OpenAI backend (convenience constructor).
    pub fn openai(api_key: impl Into<String>, model: impl Into<String>) -> Result<Self, BackendError> {
        Self::new("openai", OPENAI_BASE_URL, api_key, model)
    }

    /// Create a backend for a local OpenAI-compatible server (Ollama by
    /// default). Local servers ignore the key.
    pub fn local(base_url: Option<&str>, model: impl Into<String>) -> Result<Self, BackendError> {
        Self::new("local", base_url.unwrap_or(LOCAL_BASE_URL), "local", model)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Convert rendered messages plus this turn's tool results to the
    /// OpenAI wire form. Each tool result becomes an assistant message
    /// carrying the original call followed by a `tool` message.
    fn to_api_messages(messages: &[ChatMessage], tool_results: &[ToolResult]) -> Vec<ApiMessage> {
        let mut api: Vec<ApiMessage> = messages
            .iter()
            .map(|m| ApiMessage {
                role: match m.role {
                    ChatRole::System => "system".into(),
                    ChatRole::User => "user".into(),
                    ChatRole::Assistant => "assistant".into(),
                },
                content: Some(m.content.clone()),
                tool_calls: None,
                tool_call_id: None,
            })
            .collect();

        for result in tool_results {
            api.push(ApiMessage {
                role: "assistant".into(),
                content: None,
                tool_calls: Some(vec![ApiToolCall {
                    id: result.tool_use_id.clone(),
                    r#type: "function".into(),
                    function: ApiFunction {
                        name: result.tool_name.clone(),
                        arguments: result.input.to_string(),
                    },
                }]),
                tool_call_id: None,
            });
            api.push(ApiMessage {
                role: "tool".into(),
                content: Some(result.content.clone()),
                tool_calls: None,
                tool_call_id: Some(result.tool_use_id.clone()),
            });
        }

        api
    }

    /// Convert tool definitions to OpenAI API format.
    fn to_api_tools(tools: &[ToolDefinition]) -> Vec<ApiToolDefinition> {
        tools
            .iter()
            .map(|t| ApiToolDefinition {
                r#type: "function".into(),
                function: ApiToolFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.input_schema.clone(),
                },
            })
            .collect()
    }

    fn build_body(&self, request: &BackendRequest) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": Self::to_api_messages(&request.messages, &request.options.tool_results),
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "top_p": request.top_p,
            "stream": false,
        });

        if !request.options.tools.is_empty() {
            body["tools"] = serde_json::json!(Self::to_api_tools(&request.options.tools));
        }

        if !request.options.stop.is_empty() {
            body["stop"] = serde_json::json!(request.options.stop);
        }

        body
    }

    /// Convert an API response into a backend response.
    fn parse_response(api_response: ApiResponse) -> Result<BackendResponse, BackendError> {
        let choice = api_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::Unknown("No choices in response".into()))?;

        let mut finish_reason = choice
            .finish_reason
            .as_deref()
            .map(FinishReason::parse)
            .unwrap_or(FinishReason::Stop);

        if finish_reason == FinishReason::ContentFiltered {
            return Err(BackendError::ContentFiltered(
                "response blocked by the provider's content filter".into(),
            ));
        }

        // Only the first call is honoured; the turn loop runs one tool per
        // iteration.
        let tool_request = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .next()
            .map(|tc| ToolCall {
                id: tc.id,
                name: tc.function.name,
                input: serde_json::from_str(&tc.function.arguments)
                    .unwrap_or(serde_json::Value::String(tc.function.arguments)),
            });

        if tool_request.is_some() {
            finish_reason = FinishReason::ToolUse;
        }

        let usage = api_response
            .usage
            .map(|u| Usage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            })
            .unwrap_or_default();

        Ok(BackendResponse {
            content: choice.message.content.unwrap_or_default(),
            finish_reason,
            usage,
            tool_request,
            model: api_response.model,
        })
    }
}

#[async_trait]
impl Backend for OpenAiCompatBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn model_id(&self) -> &str {
        &self.model
    }

    async fn send(&self, request: BackendRequest) -> Result<BackendResponse, BackendError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_body(&request);

        debug!(
            backend = %self.name,
            model = %self.model,
            messages = request.messages.len(),
            tools = request.options.tools.len(),
            "Sending completion request"
        );

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::Network(e.to_string()))?;

        let status = response.status().as_u16();

        if !response.status().is_success() {
            let error_body = response.text().await.unwrap_or_default();
            warn!(status, body = %error_body, "Backend returned error");
            return Err(BackendError::from_status(status, error_body));
        }

        let api_response: ApiResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Unknown(format!("Failed to parse response: {e}")))?;

        Self::parse_response(api_response)
    }
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolCall {
    id: String,
    r#type: String,
    function: ApiFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolDefinition {
    r#type: String,
    function: ApiToolFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    model: String,
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openai_constructor() {
        let backend = OpenAiCompatBackend::openai("sk-test", "gpt-4o-mini").unwrap();
        assert_eq!(backend.name(), "openai");
        assert_eq!(backend.model_id(), "gpt-4o-mini");
        assert!(backend.base_url().contains("api.openai.com"));
    }

    #[test]
    fn local_constructor() {
        let backend = OpenAiCompatBackend::local(None, "llama3.2").unwrap();
        assert_eq!(backend.name(), "local");
        assert!(backend.base_url().contains("localhost:11434"));

        let custom = OpenAiCompatBackend::local(Some("http://10.0.0.2:8000/v1/"), "qwen").unwrap();
        assert_eq!(custom.base_url(), "http://10.0.0.2:8000/v1");
    }

    #[test]
    fn message_conversion() {
        let messages = vec![ChatMessage::system("You are helpful"), ChatMessage::user("Hello")];
        let api_messages = OpenAiCompatBackend::to_api_messages(&messages, &[]);
        assert_eq!(api_messages.len(), 2);
        assert_eq!(api_messages[0].role, "system");
        assert_eq!(api_messages[1].role, "user");
    }

    #[test]
    fn tool_results_replayed_as_call_and_response() {
        let result = ToolResult {
            tool_use_id: "call_1".into(),
            tool_name: "directory_list".into(),
            input: serde_json::json!({"path": "/tmp"}),
            content: r#"[{"name":"a","isDir":false}]"#.into(),
            is_error: false,
        };
        let api = OpenAiCompatBackend::to_api_messages(&[ChatMessage::user("ls /tmp")], &[result]);
        assert_eq!(api.len(), 3);
        assert_eq!(api[1].role, "assistant");
        let call = &api[1].tool_calls.as_ref().unwrap()[0];
        assert_eq!(call.function.name, "directory_list");
        assert_eq!(call.function.arguments, r#"{"path":"/tmp"}"#);
        assert_eq!(api[2].role, "tool");
        assert_eq!(api[2].tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn body_carries_sampling_and_tools() {
        let backend = OpenAiCompatBackend::openai("sk-test", "gpt-4o").unwrap();
        let mut request = BackendRequest::new(vec![ChatMessage::user("hi")], 512);
        request.options.tools = vec![ToolDefinition {
            name: "shell".into(),
            description: "Run a shell command".into(),
            input_schema: serde_json::json!({"type": "object"}),
        }];
        let body = backend.build_body(&request);
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["max_tokens"], 512);
        assert_eq!(body["tools"][0]["type"], "function");
        assert_eq!(body["tools"][0]["function"]["name"], "shell");
        assert!(body.get("stop").is_none());
    }

    #[test]
    fn parse_text_response() {
        let data = r#"{
            "model": "gpt-4o-mini",
            "choices": [{"message": {"role": "assistant", "content": "hi"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 1, "total_tokens": 11}
        }"#;
        let parsed: ApiResponse = serde_json::from_str(data).unwrap();
        let response = OpenAiCompatBackend::parse_response(parsed).unwrap();
        assert_eq!(response.content, "hi");
        assert_eq!(response.finish_reason, FinishReason::Stop);
        assert_eq!(response.usage.total_tokens, 11);
        assert!(!response.wants_tool());
    }

    #[test]
    fn parse_tool_call_response() {
        let data = r#"{
            "model": "gpt-4o-mini",
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{"id": "call_abc", "type": "function",
                        "function": {"name": "read_file", "arguments": "{\"path\":\"Cargo.toml\"}"}}]
                },
                "finish_reason": "tool_calls"
            }]
        }"#;
        let parsed: ApiResponse = serde_json::from_str(data).unwrap();
        let response = OpenAiCompatBackend::parse_response(parsed).unwrap();
        assert!(response.wants_tool());
        let call = response.tool_request.unwrap();
        assert_eq!(call.id, "call_abc");
        assert_eq!(call.input["path"], "Cargo.toml");
    }

    #[test]
    fn malformed_arguments_kept_as_string() {
        let data = r#"{
            "choices": [{
                "message": {"role": "assistant", "tool_calls": [{"id": "c", "type": "function",
                    "function": {"name": "shell", "arguments": "{not json"}}]},
                "finish_reason": "tool_calls"
            }]
        }"#;
        let parsed: ApiResponse = serde_json::from_str(data).unwrap();
        let response = OpenAiCompatBackend::parse_response(parsed).unwrap();
        assert_eq!(
            response.tool_request.unwrap().input,
            serde_json::Value::String("{not json".into())
        );
    }

    #[test]
    fn content_filter_is_an_error() {
        let data = r#"{"choices": [{"message": {"role": "assistant", "content": ""}, "finish_reason": "content_filter"}]}"#;
        let parsed: ApiResponse = serde_json::from_str(data).unwrap();
        let err = OpenAiCompatBackend::parse_response(parsed).unwrap_err();
        assert!(matches!(err, BackendError::ContentFiltered(_)));
    }

    #[test]
    fn empty_choices_is_an_error() {
        let parsed: ApiResponse = serde_json::from_str(r#"{"choices": []}"#).unwrap();
        assert!(OpenAiCompatBackend::parse_response(parsed).is_err());
    }
}
