//! Scripted mock backend for tests and offline runs.
//!
//! Replies are served from a script in order. Once the script runs out the
//! mock answers with its fallback reply, or by echoing the last user
//! message. Every request is recorded for later inspection.

use async_trait::async_trait;
use parley_core::backend::{Backend, BackendRequest, BackendResponse, ChatRole};
use parley_core::error::BackendError;
use parley_core::tool::ToolCall;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// A backend whose replies are scripted up front.
pub struct MockBackend {
    model: String,
    script: Mutex<VecDeque<Result<BackendResponse, BackendError>>>,
    fallback: Option<BackendResponse>,
    delay: Option<Duration>,
    requests: Mutex<Vec<BackendRequest>>,
    closes: AtomicUsize,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            model: "mock-model".into(),
            script: Mutex::new(VecDeque::new()),
            fallback: None,
            delay: None,
            requests: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Queue a plain text reply.
    pub fn with_reply(self, text: impl Into<String>) -> Self {
        self.with_response(BackendResponse::text(text))
    }

    /// Queue a tool-call reply.
    pub fn with_tool_call(self, name: impl Into<String>, input: serde_json::Value) -> Self {
        self.with_response(BackendResponse::tool_use(ToolCall::new(name, input)))
    }

    pub fn with_response(self, response: BackendResponse) -> Self {
        self.push(Ok(response));
        self
    }

    /// Queue an error.
    pub fn with_error(self, error: BackendError) -> Self {
        self.push(Err(error));
        self
    }

    /// Reply used once the script is exhausted.
    pub fn with_fallback(mut self, response: BackendResponse) -> Self {
        self.fallback = Some(response);
        self
    }

    /// Sleep this long before every reply.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn push(&self, entry: Result<BackendResponse, BackendError>) {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(entry);
    }

    /// Every request received so far, in order.
    pub fn requests(&self) -> Vec<BackendRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Scripted entries not yet consumed.
    pub fn remaining(&self) -> usize {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn echo(request: &BackendRequest) -> BackendResponse {
        let last_user = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == ChatRole::User)
            .map(|m| m.content.as_str())
            .unwrap_or("");
        BackendResponse::text(format!("Mock reply to: {last_user}"))
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn model_id(&self) -> &str {
        &self.model
    }

    async fn send(&self, request: BackendRequest) -> Result<BackendResponse, BackendError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let next = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();

        let mut response = match next {
            Some(entry) => entry?,
            None => match &self.fallback {
                Some(fallback) => fallback.clone(),
                None => Self::echo(&request),
            },
        };
        if response.model.is_empty() {
            response.model = self.model.clone();
        }
        Ok(response)
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::backend::ChatMessage;

    fn request(text: &str) -> BackendRequest {
        BackendRequest::new(vec![ChatMessage::user(text)], 128)
    }

    #[tokio::test]
    async fn serves_script_in_order_then_echoes() {
        let mock = MockBackend::new()
            .with_reply("first")
            .with_error(BackendError::ServiceUnavailable("503".into()));

        assert_eq!(mock.send(request("a")).await.unwrap().content, "first");
        assert!(mock.send(request("b")).await.is_err());
        assert_eq!(
            mock.send(request("c")).await.unwrap().content,
            "Mock reply to: c"
        );
        assert_eq!(mock.call_count(), 3);
        assert_eq!(mock.remaining(), 0);
    }

    #[tokio::test]
    async fn fallback_repeats() {
        let call = ToolCall::new("shell", serde_json::json!({"command": "ls"}));
        let mock = MockBackend::new().with_fallback(BackendResponse::tool_use(call));
        for _ in 0..3 {
            assert!(mock.send(request("go")).await.unwrap().wants_tool());
        }
    }

    #[tokio::test]
    async fn records_requests_and_closes() {
        let mock = MockBackend::new().with_model("tiny");
        let response = mock.send(request("hello")).await.unwrap();
        assert_eq!(response.model, "tiny");
        assert_eq!(mock.requests()[0].messages[0].content, "hello");

        mock.close().await.unwrap();
        assert_eq!(mock.close_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn delay_is_applied() {
        let mock = MockBackend::new()
            .with_reply("slow")
            .with_delay(Duration::from_secs(5));
        let start = tokio::time::Instant::now();
        mock.send(request("x")).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(5));
    }
}
