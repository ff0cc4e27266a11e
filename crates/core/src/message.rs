//! Message, Summary and ContextSelection domain types.
//!
//! These are the value objects that flow through the whole orchestrator:
//! the user types → a `Message` is recorded → the context manager selects a
//! `ContextSelection` → the backend sees it → the reply becomes a `Message`.
//! Older spans of history are compressed into `Summary` records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Tag attached to every message restored from a persisted session.
pub const LOADED_FROM_DISK_TAG: &str = "loaded_from_disk";

/// Generate a new time-ordered identifier (UUID v7).
pub fn new_id() -> String {
    Uuid::now_v7().to_string()
}

/// The role of a message in the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The human at the terminal
    User,
    /// The model
    Assistant,
    /// Instructions, tool results, and orchestrator notices
    System,
    /// A compressed span produced by the summarizer
    Summary,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
            Self::Summary => "summary",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered importance level driving retention priority.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Importance {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Importance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for Importance {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(format!("unknown importance level '{other}'")),
        }
    }
}

/// A single message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID. Empty until the context manager assigns one.
    pub id: String,

    /// Who produced this message
    pub role: Role,

    /// The text content
    pub content: String,

    /// Wall-clock creation time
    pub created_at: DateTime<Utc>,

    /// Estimated tokens; zero means "not yet counted"
    #[serde(default)]
    pub token_count: usize,

    /// Importance; `None` until the prioritizer (or a caller) sets it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub importance: Option<Importance>,

    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,

    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub topics: BTreeSet<String>,

    /// IDs of other messages this one refers to
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub references: BTreeSet<String>,
}

impl Message {
    /// Create a message with a fresh ID and the current time.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            role,
            content: content.into(),
            created_at: Utc::now(),
            token_count: 0,
            importance: None,
            tags: BTreeSet::new(),
            topics: BTreeSet::new(),
            references: BTreeSet::new(),
        }
    }

    /// Create a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Create a new assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Create a new system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Builder: set the importance level.
    pub fn with_importance(mut self, importance: Importance) -> Self {
        self.importance = Some(importance);
        self
    }

    /// Builder: add a tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Builder: override the creation time.
    pub fn at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Effective importance (unset counts as `Low`).
    pub fn level(&self) -> Importance {
        self.importance.unwrap_or_default()
    }

    pub fn is_critical(&self) -> bool {
        self.level() == Importance::Critical
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }
}

/// Closed time interval covered by a summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSpan {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeSpan {
    /// Build a span, swapping the bounds if they arrive out of order.
    pub fn new(a: DateTime<Utc>, b: DateTime<Utc>) -> Self {
        if a <= b {
            Self { start: a, end: b }
        } else {
            Self { start: b, end: a }
        }
    }

    /// The min/max `created_at` over a set of messages.
    pub fn covering<'a>(messages: impl IntoIterator<Item = &'a Message>) -> Option<Self> {
        let mut iter = messages.into_iter();
        let first = iter.next()?.created_at;
        let (start, end) = iter.fold((first, first), |(lo, hi), m| {
            (lo.min(m.created_at), hi.max(m.created_at))
        });
        Some(Self { start, end })
    }
}

/// A compressed record standing in for a span of older messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub token_count: usize,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub topics: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,
    /// The messages this summary replaces.
    pub source_message_ids: Vec<String>,
    pub time_span: TimeSpan,
}

impl Summary {
    /// Create a summary over the given span with a fresh ID.
    pub fn new(
        content: impl Into<String>,
        source_message_ids: Vec<String>,
        time_span: TimeSpan,
    ) -> Self {
        Self {
            id: new_id(),
            content: content.into(),
            created_at: Utc::now(),
            token_count: 0,
            topics: BTreeSet::new(),
            tags: BTreeSet::new(),
            source_message_ids,
            time_span,
        }
    }

    pub fn covers(&self, message_id: &str) -> bool {
        self.source_message_ids.iter().any(|id| id == message_id)
    }
}

/// The concrete set of messages and summaries chosen for one backend call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextSelection {
    pub system_message: Option<Message>,
    /// Chronologically ordered.
    pub messages: Vec<Message>,
    /// Ordered by time span.
    pub summaries: Vec<Summary>,
    pub total_tokens: usize,
    pub max_tokens: usize,
}

impl ContextSelection {
    /// Whether the selection respects its budget.
    pub fn within_budget(&self) -> bool {
        self.total_tokens <= self.max_tokens
    }

    pub fn is_empty(&self) -> bool {
        self.system_message.is_none() && self.messages.is_empty() && self.summaries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn create_user_message() {
        let msg = Message::user("Hello!");
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.content, "Hello!");
        assert!(!msg.id.is_empty());
        assert_eq!(msg.level(), Importance::Low);
        assert!(msg.importance.is_none());
    }

    #[test]
    fn ids_are_unique() {
        let a = new_id();
        let b = new_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 36);
    }

    #[test]
    fn importance_ordering() {
        assert!(Importance::Critical > Importance::High);
        assert!(Importance::High > Importance::Medium);
        assert!(Importance::Medium > Importance::Low);
        assert_eq!("HIGH".parse::<Importance>().unwrap(), Importance::High);
        assert!("urgent".parse::<Importance>().is_err());
    }

    #[test]
    fn message_serialization_roundtrip() {
        let msg = Message::system("Tool result")
            .with_importance(Importance::High)
            .with_tag("tool_result");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"role\":\"system\""));
        assert!(json.contains("\"importance\":\"high\""));
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn time_span_covers_min_and_max() {
        let now = Utc::now();
        let msgs = vec![
            Message::user("b").at(now),
            Message::user("a").at(now - Duration::minutes(10)),
            Message::user("c").at(now + Duration::minutes(5)),
        ];
        let span = TimeSpan::covering(&msgs).unwrap();
        assert_eq!(span.start, now - Duration::minutes(10));
        assert_eq!(span.end, now + Duration::minutes(5));
        assert!(TimeSpan::covering(Vec::<Message>::new().iter()).is_none());
    }

    #[test]
    fn time_span_new_orders_bounds() {
        let now = Utc::now();
        let span = TimeSpan::new(now, now - Duration::seconds(1));
        assert!(span.start <= span.end);
    }
}
