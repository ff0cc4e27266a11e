//! The UI-facing conversation contract.
//!
//! A view layer talks to a [`ChatService`]. The real implementation is the
//! [`Orchestrator`](crate::Orchestrator); [`EchoChatService`] is an
//! independent offline implementation with no backend, tools, or
//! persistence.

use async_trait::async_trait;
use parley_core::error::Error;
use parley_core::message::{Importance, Message};
use serde_json::{Map, Value, json};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[async_trait]
pub trait ChatService: Send + Sync {
    /// Run one user turn and return the reply.
    async fn send_user_message(&self, text: &str) -> Result<String, Error>;

    /// A copy of the conversation so far.
    fn history(&self) -> Vec<Message>;

    async fn clear(&self);

    async fn update_system_prompt(&self, text: &str);

    async fn enable_tools(&self, enabled: bool);

    async fn enable_context_management(&self, enabled: bool);

    fn context_statistics(&self) -> Map<String, Value>;

    /// Flush and release everything. Calling it twice is harmless.
    async fn close(&self) -> Result<(), Error>;
}

#[derive(Default)]
struct EchoState {
    system_prompt: Option<String>,
    messages: Vec<Message>,
    tools_enabled: bool,
    context_enabled: bool,
}

/// Offline chat service that echoes every message back.
#[derive(Default)]
pub struct EchoChatService {
    state: Mutex<EchoState>,
}

impl EchoChatService {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, EchoState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ChatService for EchoChatService {
    async fn send_user_message(&self, text: &str) -> Result<String, Error> {
        let reply = format!("Echo: {text}");
        let mut state = self.lock();
        state.messages.push(Message::user(text));
        state.messages.push(Message::assistant(reply.clone()));
        Ok(reply)
    }

    fn history(&self) -> Vec<Message> {
        self.lock().messages.clone()
    }

    async fn clear(&self) {
        self.lock().messages.clear();
    }

    async fn update_system_prompt(&self, text: &str) {
        self.lock().system_prompt = Some(text.to_string());
    }

    async fn enable_tools(&self, enabled: bool) {
        self.lock().tools_enabled = enabled;
    }

    async fn enable_context_management(&self, enabled: bool) {
        self.lock().context_enabled = enabled;
    }

    fn context_statistics(&self) -> Map<String, Value> {
        let state = self.lock();
        let mut stats = Map::new();
        stats.insert("backend".into(), json!("echo"));
        stats.insert("message_count".into(), json!(state.messages.len()));
        stats.insert(
            "critical_count".into(),
            json!(
                state
                    .messages
                    .iter()
                    .filter(|m| m.level() == Importance::Critical)
                    .count()
            ),
        );
        stats.insert("has_system_prompt".into(), json!(state.system_prompt.is_some()));
        stats.insert("tools_enabled".into(), json!(state.tools_enabled));
        stats.insert("context_management".into(), json!(state.context_enabled));
        stats
    }

    async fn close(&self) -> Result<(), Error> {
        Ok(())
    }
}
