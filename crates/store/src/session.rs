//! Session records and the store contract.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parley_core::error::StoreError;
use parley_core::message::{Message, Summary};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

/// On-disk format version. Adding fields is backwards compatible.
pub const FORMAT_VERSION: &str = "1.0";

/// Descriptive record for one persisted session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub primary_model_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: usize,
    pub summary_count: usize,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub topics: BTreeSet<String>,
}

/// A complete persisted session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionData {
    pub version: String,
    pub metadata: SessionMetadata,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub summaries: Vec<Summary>,
}

impl SessionData {
    /// Assemble a session record, deriving counts and the aggregate
    /// tag/topic sets from the content.
    pub fn new(
        session_id: impl Into<String>,
        name: Option<String>,
        model_id: impl Into<String>,
        messages: Vec<Message>,
        summaries: Vec<Summary>,
    ) -> Self {
        let mut tags = BTreeSet::new();
        let mut topics = BTreeSet::new();
        for m in &messages {
            tags.extend(m.tags.iter().cloned());
            topics.extend(m.topics.iter().cloned());
        }
        for s in &summaries {
            tags.extend(s.tags.iter().cloned());
            topics.extend(s.topics.iter().cloned());
        }

        let now = Utc::now();
        let created_at = messages.iter().map(|m| m.created_at).min().unwrap_or(now);

        Self {
            version: FORMAT_VERSION.into(),
            metadata: SessionMetadata {
                session_id: session_id.into(),
                name,
                primary_model_id: model_id.into(),
                created_at,
                updated_at: now,
                message_count: messages.len(),
                summary_count: summaries.len(),
                tags,
                topics,
            },
            messages,
            summaries,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.metadata.session_id
    }
}

/// Derive a stable session ID from the earliest message's timestamp and
/// the primary model. The same conversation re-saves under the same ID no
/// matter how many messages are appended later.
pub fn session_id_for(earliest: DateTime<Utc>, model_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(earliest.timestamp_nanos_opt().unwrap_or_default().to_le_bytes());
    hasher.update(model_id.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{}-{}", earliest.format("%Y%m%d-%H%M%S"), &digest[..12])
}

/// Session IDs become file names, so only a conservative character set is
/// accepted.
pub fn validate_session_id(session_id: &str) -> Result<(), StoreError> {
    let ok = !session_id.is_empty()
        && session_id.len() <= 128
        && !session_id.starts_with('.')
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidSessionId(session_id.to_string()))
    }
}

/// Durable storage for conversation sessions.
///
/// A missing session on load is `Ok(None)`, not an error.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Persist a session, replacing any previous copy with the same ID.
    async fn save(&self, data: &SessionData) -> Result<(), StoreError>;

    /// Load a session by ID.
    async fn load(&self, session_id: &str) -> Result<Option<SessionData>, StoreError>;

    /// Metadata of every stored session, newest-updated first.
    async fn list(&self) -> Result<Vec<SessionMetadata>, StoreError>;

    /// Remove a session. Removing an absent session is not an error.
    async fn delete(&self, session_id: &str) -> Result<(), StoreError>;

    /// The most recently updated session, if any.
    async fn latest(&self) -> Result<Option<SessionData>, StoreError> {
        match self.list().await?.into_iter().next() {
            Some(meta) => self.load(&meta.session_id).await,
            None => Ok(None),
        }
    }
}
