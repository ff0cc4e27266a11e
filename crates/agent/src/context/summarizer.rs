//! LLM-based summarization of conversation spans.

use crate::context::prioritizer::Prioritizer;
use crate::context::token::TokenCounter;
use parley_config::SummarizerConfig;
use parley_core::backend::{Backend, BackendRequest, ChatMessage};
use parley_core::error::{BackendError, ContextError};
use parley_core::message::{Message, Summary, TimeSpan};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const CONVERSATION_PLACEHOLDER: &str = "{{CONVERSATION}}";
pub const CODE_PLACEHOLDER: &str = "{{CODE_PRESERVATION_INSTRUCTIONS}}";

pub const DEFAULT_TEMPLATE: &str = "Summarize the following conversation into a concise record \
that can stand in for it in future turns. Keep decisions, requirements, user preferences, \
open questions, and any facts the user asked to remember. Write in plain prose, no preamble.
{{CODE_PRESERVATION_INSTRUCTIONS}}
Conversation:
{{CONVERSATION}}";

const CODE_INSTRUCTIONS: &str = "\nReproduce code blocks that matter for future work verbatim, \
inside fenced blocks, rather than describing them.\n";

/// Tag carried by every produced summary.
pub const SUMMARY_TAG: &str = "summary";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Produces a [`Summary`] from a span of messages with a designated backend.
pub struct Summarizer {
    backend: Arc<dyn Backend>,
    config: SummarizerConfig,
    prioritizer: Arc<Prioritizer>,
    counter: Arc<dyn TokenCounter>,
    timeout: Duration,
}

impl Summarizer {
    pub fn new(
        backend: Arc<dyn Backend>,
        config: SummarizerConfig,
        prioritizer: Arc<Prioritizer>,
        counter: Arc<dyn TokenCounter>,
    ) -> Self {
        Self {
            backend,
            config,
            prioritizer,
            counter,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Deadline for one summarizer backend call.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Summarize `messages`. A backend failure is returned unchanged and
    /// nothing else happens.
    pub async fn summarize(&self, messages: &[Message]) -> Result<Summary, ContextError> {
        let mut ordered: Vec<&Message> = messages.iter().collect();
        ordered.sort_by_key(|m| m.created_at);
        ordered.truncate(self.config.max_input_messages.max(1));
        let span = TimeSpan::covering(ordered.iter().copied()).ok_or(ContextError::EmptySummaryInput)?;

        let prompt = self.render_prompt(&ordered);
        let mut request = BackendRequest::new(vec![ChatMessage::user(prompt)], self.config.max_tokens);
        request.temperature = self.config.temperature;

        debug!(
            messages = ordered.len(),
            backend = self.backend.name(),
            "Requesting summary"
        );
        let response = tokio::time::timeout(self.timeout, self.backend.send(request))
            .await
            .unwrap_or(Err(BackendError::Timeout {
                timeout_secs: self.timeout.as_secs(),
            }))?;
        let content = response.content.trim();
        if content.is_empty() {
            return Err(BackendError::Unknown("summarizer returned an empty reply".into()).into());
        }

        let mut summary = Summary::new(
            content,
            ordered.iter().map(|m| m.id.clone()).collect(),
            span,
        );
        summary.topics = self.prioritizer.extract_topics(content);
        summary.tags = ordered
            .iter()
            .flat_map(|m| m.tags.iter().cloned())
            .filter(|t| !t.starts_with("role:"))
            .collect();
        summary.tags.insert(SUMMARY_TAG.to_string());
        summary.token_count = self.counter.count_summary(&summary);
        Ok(summary)
    }

    /// The prompt sent to the summarizer backend.
    pub fn render_prompt(&self, messages: &[&Message]) -> String {
        let transcript = messages
            .iter()
            .map(|m| self.transcript_line(m))
            .collect::<Vec<_>>()
            .join("\n");
        let code = if self.config.preserve_code {
            CODE_INSTRUCTIONS
        } else {
            ""
        };
        self.config
            .prompt_template
            .as_deref()
            .unwrap_or(DEFAULT_TEMPLATE)
            .replace(CODE_PLACEHOLDER, code)
            .replace(CONVERSATION_PLACEHOLDER, &transcript)
    }

    fn transcript_line(&self, message: &Message) -> String {
        if !self.config.include_metadata {
            return format!("[{}] {}", message.role, message.content);
        }
        let tags: Vec<&str> = message
            .tags
            .iter()
            .map(String::as_str)
            .filter(|t| !t.starts_with("role:"))
            .collect();
        if tags.is_empty() {
            format!("[{}] ({}) {}", message.role, message.level(), message.content)
        } else {
            format!(
                "[{}] ({}; tags: {}) {}",
                message.role,
                message.level(),
                tags.join(", "),
                message.content
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::token::HeuristicCounter;
    use chrono::{Duration, Utc};
    use parley_config::ContextConfig;
    use parley_core::message::Importance;
    use parley_providers::MockBackend;

    fn summarizer(backend: Arc<MockBackend>, config: SummarizerConfig) -> Summarizer {
        let prioritizer = Arc::new(Prioritizer::from_config(&ContextConfig::default()).unwrap());
        Summarizer::new(backend, config, prioritizer, Arc::new(HeuristicCounter))
    }

    #[tokio::test]
    async fn summary_covers_inputs_in_order() {
        let backend = Arc::new(MockBackend::new().with_reply(
            "The user needs to migrate the database schema before the release.",
        ));
        let s = summarizer(backend.clone(), SummarizerConfig::default());
        let now = Utc::now();
        let later = Message::assistant("ok").at(now);
        let earlier = Message::user("migrate the schema")
            .at(now - Duration::minutes(5))
            .with_importance(Importance::High)
            .with_tag("requirement");

        let summary = s.summarize(&[later.clone(), earlier.clone()]).await.unwrap();
        assert_eq!(summary.source_message_ids, vec![earlier.id, later.id]);
        assert!(summary.time_span.start <= summary.time_span.end);
        assert_eq!(summary.time_span.start, earlier.created_at);
        assert!(summary.tags.contains(SUMMARY_TAG));
        assert!(summary.tags.contains("requirement"));
        assert!(!summary.topics.is_empty());
        assert!(summary.token_count > 0);

        let request = &backend.requests()[0];
        assert_eq!(request.temperature, 0.3);
        let prompt = &request.messages[0].content;
        assert!(prompt.contains("[user] (high; tags: requirement) migrate the schema"));
        assert!(prompt.contains("verbatim"));
        assert!(!prompt.contains(CONVERSATION_PLACEHOLDER));
    }

    #[tokio::test]
    async fn input_is_truncated() {
        let backend = Arc::new(MockBackend::new().with_reply("short"));
        let config = SummarizerConfig {
            max_input_messages: 2,
            ..SummarizerConfig::default()
        };
        let s = summarizer(backend, config);
        let msgs: Vec<Message> = (0..5).map(|i| Message::user(format!("m{i}"))).collect();
        let summary = s.summarize(&msgs).await.unwrap();
        assert_eq!(summary.source_message_ids.len(), 2);
    }

    #[tokio::test]
    async fn custom_template_without_metadata() {
        let backend = Arc::new(MockBackend::new().with_reply("done"));
        let config = SummarizerConfig {
            include_metadata: false,
            preserve_code: false,
            prompt_template: Some("SUM:{{CODE_PRESERVATION_INSTRUCTIONS}}{{CONVERSATION}}".into()),
            ..SummarizerConfig::default()
        };
        let s = summarizer(backend.clone(), config);
        s.summarize(&[Message::user("hi")]).await.unwrap();
        assert_eq!(backend.requests()[0].messages[0].content, "SUM:[user] hi");
    }

    #[tokio::test]
    async fn backend_error_is_returned() {
        let backend = Arc::new(
            MockBackend::new().with_error(BackendError::ServiceUnavailable("down".into())),
        );
        let s = summarizer(backend, SummarizerConfig::default());
        let result = s.summarize(&[Message::user("hi")]).await;
        assert!(matches!(
            result,
            Err(ContextError::Summarization(BackendError::ServiceUnavailable(_)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_backend_times_out() {
        let backend = Arc::new(
            MockBackend::new()
                .with_reply("too late")
                .with_delay(std::time::Duration::from_secs(120)),
        );
        let s = summarizer(backend, SummarizerConfig::default())
            .with_timeout(std::time::Duration::from_secs(5));
        let result = s.summarize(&[Message::user("hi")]).await;
        assert!(matches!(
            result,
            Err(ContextError::Summarization(BackendError::Timeout { timeout_secs: 5 }))
        ));
    }

    #[tokio::test]
    async fn empty_input_is_rejected() {
        let backend = Arc::new(MockBackend::new());
        let s = summarizer(backend.clone(), SummarizerConfig::default());
        assert!(matches!(
            s.summarize(&[]).await,
            Err(ContextError::EmptySummaryInput)
        ));
        assert_eq!(backend.call_count(), 0);
    }
}
