//! The authoritative in-memory conversation store.
//!
//! The [`ContextManager`] owns the message and summary collections for one
//! session. Everything else reads copies or writes through its mutators.
//! It also implements the flat selection used when hierarchical memory is
//! disabled:
//!
//! 1. The system prompt is charged at full cost and never evicted.
//! 2. The remaining budget is split by the configured percentages.
//! 3. Summaries fill their slot newest-first.
//! 4. Messages are ranked by `(importance desc, created_at desc)` and
//!    admitted greedily; Critical messages are admitted even over budget.
//! 5. Admitted messages are emitted in chronological order.

use crate::context::token::TokenCounter;
use chrono::{DateTime, Utc};
use parley_config::{AllocationConfig, ContextConfig};
use parley_core::backend::ChatMessage;
use parley_core::error::ContextError;
use parley_core::message::{
    ContextSelection, Importance, LOADED_FROM_DISK_TAG, Message, Role, Summary, new_id,
};
use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};

/// Label that opens the synthetic summaries message.
pub const SUMMARIES_LABEL: &str = "Summary of earlier conversation:";

#[derive(Default)]
struct State {
    system_prompt: Option<Message>,
    messages: Vec<Message>,
    summaries: Vec<Summary>,
    loaded_history: bool,
}

/// Manager-level counts, used for statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextStats {
    pub message_count: usize,
    pub summary_count: usize,
    pub message_tokens: usize,
    pub summary_tokens: usize,
    pub system_tokens: usize,
    pub critical_count: usize,
}

/// Holds the session history and produces budgeted selections.
pub struct ContextManager {
    state: RwLock<State>,
    counter: Arc<dyn TokenCounter>,
    allocation: AllocationConfig,
    max_messages: usize,
    /// Only messages already represented in a summary may be trimmed
    summarized_trim: bool,
}

impl ContextManager {
    pub fn new(counter: Arc<dyn TokenCounter>, config: &ContextConfig) -> Self {
        Self {
            state: RwLock::new(State::default()),
            counter,
            allocation: config.allocation,
            max_messages: config.max_messages,
            summarized_trim: config.hierarchical.enabled,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn counter(&self) -> &Arc<dyn TokenCounter> {
        &self.counter
    }

    // ── System prompt ─────────────────────────────────────────────────────

    /// Replace the system prompt. It is always Critical.
    pub fn set_system_prompt(&self, text: impl Into<String>) {
        let mut prompt = Message::system(text).with_importance(Importance::Critical);
        prompt.token_count = self.counter.count_message(&prompt);
        self.write().system_prompt = Some(prompt);
    }

    pub fn system_prompt(&self) -> Option<Message> {
        self.read().system_prompt.clone()
    }

    // ── Mutators ──────────────────────────────────────────────────────────

    /// Append a message, filling in the ID and token count when missing.
    ///
    /// `created_at` is clamped so it never precedes the previous message.
    /// Returns the stored copy.
    pub fn add_message(&self, mut message: Message) -> Message {
        if message.id.is_empty() {
            message.id = new_id();
        }
        if message.token_count == 0 {
            message.token_count = self.counter.count_message(&message);
        }

        let mut state = self.write();
        if let Some(last) = state.messages.last() {
            if message.created_at < last.created_at {
                message.created_at = last.created_at;
            }
        }
        debug!(id = %message.id, role = %message.role, tokens = message.token_count, "Adding message");
        state.messages.push(message.clone());
        self.trim(&mut state);
        message
    }

    /// Append a summary, filling in the ID and token count when missing.
    pub fn add_summary(&self, mut summary: Summary) -> Result<Summary, ContextError> {
        if summary.source_message_ids.is_empty() {
            return Err(ContextError::EmptySummaryInput);
        }
        if summary.id.is_empty() {
            summary.id = new_id();
        }
        if summary.token_count == 0 {
            summary.token_count = self.counter.count_summary(&summary);
        }

        let mut state = self.write();
        debug!(
            id = %summary.id,
            sources = summary.source_message_ids.len(),
            tokens = summary.token_count,
            "Adding summary"
        );
        state.summaries.push(summary.clone());
        self.trim(&mut state);
        Ok(summary)
    }

    /// Seed the manager with a persisted session. Every restored message is
    /// tagged as loaded from disk.
    pub fn restore(&self, messages: Vec<Message>, summaries: Vec<Summary>) {
        let mut state = self.write();
        for mut message in messages {
            message.tags.insert(LOADED_FROM_DISK_TAG.to_string());
            if message.token_count == 0 {
                message.token_count = self.counter.count_message(&message);
            }
            state.messages.push(message);
        }
        for mut summary in summaries {
            if summary.token_count == 0 {
                summary.token_count = self.counter.count_summary(&summary);
            }
            state.summaries.push(summary);
        }
        state.loaded_history = true;
    }

    /// Drop all messages and summaries. The system prompt survives.
    pub fn clear(&self) {
        let mut state = self.write();
        state.messages.clear();
        state.summaries.clear();
        state.loaded_history = false;
    }

    fn with_message<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut Message) -> T,
    ) -> Result<T, ContextError> {
        let mut state = self.write();
        let message = state
            .messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| ContextError::MessageNotFound(id.to_string()))?;
        Ok(f(message))
    }

    pub fn set_importance(&self, id: &str, level: Importance) -> Result<(), ContextError> {
        self.with_message(id, |m| m.importance = Some(level))
    }

    pub fn add_tag(&self, id: &str, tag: impl Into<String>) -> Result<(), ContextError> {
        let tag = tag.into();
        self.with_message(id, |m| {
            m.tags.insert(tag);
        })
    }

    pub fn add_topic(&self, id: &str, topic: impl Into<String>) -> Result<(), ContextError> {
        let topic = topic.into();
        self.with_message(id, |m| {
            m.topics.insert(topic);
        })
    }

    /// Enforce `max_messages`. In summarized mode only messages already
    /// covered by a summary are eligible, oldest first.
    fn trim(&self, state: &mut State) {
        let excess = state.messages.len().saturating_sub(self.max_messages);
        if excess == 0 {
            return;
        }

        if self.summarized_trim {
            let covered: HashSet<&str> = state
                .summaries
                .iter()
                .flat_map(|s| s.source_message_ids.iter().map(String::as_str))
                .collect();
            let victims: HashSet<String> = state
                .messages
                .iter()
                .filter(|m| covered.contains(m.id.as_str()))
                .take(excess)
                .map(|m| m.id.clone())
                .collect();
            if victims.is_empty() {
                return;
            }
            state.messages.retain(|m| !victims.contains(&m.id));
            debug!(removed = victims.len(), "Trimmed summarized messages");
        } else {
            state.messages.drain(..excess);
            debug!(removed = excess, "Trimmed oldest messages");
        }
    }

    // ── Queries ───────────────────────────────────────────────────────────

    pub fn full_history(&self) -> Vec<Message> {
        self.read().messages.clone()
    }

    pub fn summaries(&self) -> Vec<Summary> {
        self.read().summaries.clone()
    }

    pub fn len(&self) -> usize {
        self.read().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().messages.is_empty()
    }

    /// Whether a persisted session was restored into this manager.
    pub fn has_loaded_history(&self) -> bool {
        self.read().loaded_history
    }

    pub fn earliest_message_time(&self) -> Option<DateTime<Utc>> {
        self.read().messages.iter().map(|m| m.created_at).min()
    }

    /// Copies of the messages with the given IDs, in history order.
    pub fn messages_by_ids(&self, ids: &[String]) -> Vec<Message> {
        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        self.read()
            .messages
            .iter()
            .filter(|m| wanted.contains(m.id.as_str()))
            .cloned()
            .collect()
    }

    /// IDs of every message represented by some summary.
    pub fn summarized_ids(&self) -> HashSet<String> {
        self.read()
            .summaries
            .iter()
            .flat_map(|s| s.source_message_ids.iter().cloned())
            .collect()
    }

    /// Case-insensitive substring search over content, tags, and topics.
    /// Newest matches first.
    pub fn search(&self, query: &str, max_results: usize) -> Vec<Message> {
        let needle = query.to_lowercase();
        self.read()
            .messages
            .iter()
            .rev()
            .filter(|m| {
                m.content.to_lowercase().contains(&needle)
                    || m.tags.iter().any(|t| t.to_lowercase().contains(&needle))
                    || m.topics.iter().any(|t| t.to_lowercase().contains(&needle))
            })
            .take(max_results)
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> ContextStats {
        let state = self.read();
        ContextStats {
            message_count: state.messages.len(),
            summary_count: state.summaries.len(),
            message_tokens: state.messages.iter().map(|m| m.token_count).sum(),
            summary_tokens: state.summaries.iter().map(|s| s.token_count).sum(),
            system_tokens: state.system_prompt.as_ref().map_or(0, |m| m.token_count),
            critical_count: state.messages.iter().filter(|m| m.is_critical()).count(),
        }
    }

    // ── Selection ─────────────────────────────────────────────────────────

    /// Everything in history, unbudgeted. Used when context management is off.
    pub fn unbounded_selection(&self) -> ContextSelection {
        let state = self.read();
        let system_tokens = state.system_prompt.as_ref().map_or(0, |m| m.token_count);
        let message_tokens: usize = state.messages.iter().map(|m| m.token_count).sum();
        ContextSelection {
            system_message: state.system_prompt.clone(),
            messages: state.messages.clone(),
            summaries: Vec::new(),
            total_tokens: system_tokens + message_tokens,
            max_tokens: usize::MAX,
        }
    }

    /// The flat selection.
    pub fn get_context_for_prompt(&self, max_tokens: usize) -> ContextSelection {
        let state = self.read();
        let system_tokens = state.system_prompt.as_ref().map_or(0, |m| m.token_count);
        let available = max_tokens.saturating_sub(system_tokens);

        // The system share is already paid by the prompt itself; the other
        // shares divide what is left in proportion.
        let shared = (100 - self.allocation.system.min(99)) as usize;
        let summary_budget = available * self.allocation.summaries as usize / shared;
        let recent_budget = available * self.allocation.recent as usize / shared;

        // Summaries newest-first until one no longer fits
        let mut summaries: Vec<&Summary> = state.summaries.iter().collect();
        summaries.sort_by(|a, b| b.time_span.end.cmp(&a.time_span.end));
        let mut summary_tokens = 0;
        let mut chosen_summaries = Vec::new();
        for summary in summaries {
            if summary_tokens + summary.token_count > summary_budget {
                break;
            }
            summary_tokens += summary.token_count;
            chosen_summaries.push(summary.clone());
        }
        chosen_summaries.sort_by(|a, b| a.time_span.start.cmp(&b.time_span.start));

        let covered: HashSet<&str> = chosen_summaries
            .iter()
            .flat_map(|s| s.source_message_ids.iter().map(String::as_str))
            .collect();

        // Unused summary budget rolls into the recent slot
        let message_budget = recent_budget + (summary_budget - summary_tokens);
        let candidates: Vec<(usize, &Message)> = state
            .messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.is_critical() || !covered.contains(m.id.as_str()))
            .collect();
        let (admitted, message_tokens) = admit_ranked(candidates, message_budget);

        let total_tokens = system_tokens + summary_tokens + message_tokens;
        if total_tokens > max_tokens {
            warn!(
                total_tokens,
                budget = max_tokens,
                "Critical messages pushed the selection over budget"
            );
        }

        ContextSelection {
            system_message: state.system_prompt.clone(),
            messages: admitted,
            summaries: chosen_summaries,
            total_tokens,
            max_tokens,
        }
    }

    /// Render a selection into backend messages: the system prompt, then
    /// one synthetic system message carrying every summary, then history.
    pub fn prepare_backend_messages(&self, selection: &ContextSelection) -> Vec<ChatMessage> {
        let mut out = Vec::with_capacity(selection.messages.len() + 2);

        if let Some(system) = &selection.system_message {
            out.push(ChatMessage::system(system.content.clone()));
        }

        if !selection.summaries.is_empty() {
            let mut block = String::from(SUMMARIES_LABEL);
            for summary in &selection.summaries {
                block.push_str(&format!(
                    "\n\n[{} to {}]\n{}",
                    summary.time_span.start.format("%Y-%m-%d %H:%M"),
                    summary.time_span.end.format("%Y-%m-%d %H:%M"),
                    summary.content
                ));
            }
            out.push(ChatMessage::system(block));
        }

        for message in &selection.messages {
            let content = message.content.clone();
            out.push(match message.role {
                Role::User => ChatMessage::user(content),
                Role::Assistant => ChatMessage::assistant(content),
                Role::System | Role::Summary => ChatMessage::system(content),
            });
        }

        out
    }
}

/// Rank `(history index, message)` pairs by importance then recency and
/// admit greedily under `budget`. Critical messages are always admitted.
/// Returns the admitted messages in history order and their token total.
pub(crate) fn admit_ranked(
    mut candidates: Vec<(usize, &Message)>,
    budget: usize,
) -> (Vec<Message>, usize) {
    candidates.sort_by(|(ia, a), (ib, b)| {
        b.level()
            .cmp(&a.level())
            .then(b.created_at.cmp(&a.created_at))
            .then(ib.cmp(ia))
    });

    let mut used = 0;
    let mut admitted: Vec<(usize, &Message)> = Vec::new();
    for (idx, message) in candidates {
        if message.is_critical() || used + message.token_count <= budget {
            used += message.token_count;
            admitted.push((idx, message));
        }
    }

    admitted.sort_by_key(|(idx, _)| *idx);
    (
        admitted.into_iter().map(|(_, m)| m.clone()).collect(),
        used,
    )
}
