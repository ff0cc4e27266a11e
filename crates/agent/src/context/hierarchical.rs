//! Hierarchical memory: budget split across four recency tiers.
//!
//! | Tier | Window | Share | Threshold |
//! |------|--------|-------|-----------|
//! | long_term | 30 days | 10% | High |
//! | medium_term | 1 day | 25% | Medium |
//! | short_term | 1 hour | 30% | Low |
//! | immediate | 5 minutes | 35% | Low |
//!
//! Tiers are filled long → immediate. A message is a candidate for a tier
//! if it falls inside the tier's window, meets its importance threshold, or
//! was loaded from a previous session. Each message is selected at most
//! once; budget a tier does not use carries into the next. Summaries feed
//! only the long- and medium-term tiers.

use crate::context::manager::{ContextManager, admit_ranked};
use chrono::{DateTime, Duration, Utc};
use parley_config::{HierarchicalConfig, TierConfig};
use parley_core::error::ContextError;
use parley_core::message::{ContextSelection, LOADED_FROM_DISK_TAG, Message, Role, Summary};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Appended to the system prompt when a persisted session was restored.
pub const PRIOR_HISTORY_INSTRUCTION: &str = "You have access to conversation history from previous sessions. \
Messages and summaries from those sessions are included below; use them when the user refers to earlier work.";

/// Tiers that may carry summaries.
const SUMMARY_TIERS: [&str; 2] = ["long_term", "medium_term"];

/// Newest messages the auto-summarize trigger leaves out of a task.
pub const RETAIN_VERBATIM: usize = 2;

/// Per-tier accounting from the last selection.
#[derive(Debug, Clone, PartialEq)]
pub struct TierUsage {
    pub tier: &'static str,
    pub budget: usize,
    pub used: usize,
    pub messages: usize,
    pub summaries: usize,
}

/// Selects context across memory tiers on top of a [`ContextManager`].
pub struct HierarchicalSelector {
    manager: Arc<ContextManager>,
    config: HierarchicalConfig,
}

impl HierarchicalSelector {
    pub fn new(manager: Arc<ContextManager>, config: HierarchicalConfig) -> Self {
        Self { manager, config }
    }

    pub fn config(&self) -> &HierarchicalConfig {
        &self.config
    }

    /// Build a selection under `max_tokens` as of `now`.
    pub fn select(
        &self,
        max_tokens: usize,
        now: DateTime<Utc>,
    ) -> Result<ContextSelection, ContextError> {
        self.select_with_usage(max_tokens, now).map(|(s, _)| s)
    }

    /// Like [`select`](Self::select), also reporting per-tier usage.
    pub fn select_with_usage(
        &self,
        max_tokens: usize,
        now: DateTime<Utc>,
    ) -> Result<(ContextSelection, Vec<TierUsage>), ContextError> {
        let history = self.manager.full_history();
        let summaries = self.manager.summaries();
        let system_message = self.system_message();
        let system_tokens = system_message.as_ref().map_or(0, |m| m.token_count);
        let available = max_tokens.saturating_sub(system_tokens);

        let mut selected_messages: Vec<Message> = Vec::new();
        let mut selected_ids: HashSet<String> = HashSet::new();
        let mut selected_summaries: Vec<Summary> = Vec::new();
        let mut covered: HashSet<String> = HashSet::new();
        let mut usage = Vec::with_capacity(4);
        let mut carry = 0usize;
        let mut total = system_tokens;

        for (name, tier) in self.config.tiers() {
            if !(0.0..=1.0).contains(&tier.share) {
                return Err(ContextError::Selection(format!(
                    "tier {name} has share {} outside [0, 1]",
                    tier.share
                )));
            }
            let budget = (available as f64 * f64::from(tier.share)) as usize + carry;
            let mut used = 0;
            let mut summaries_taken = 0;

            if SUMMARY_TIERS.contains(&name) {
                let mut pool: Vec<&Summary> = summaries
                    .iter()
                    .filter(|s| !selected_summaries.iter().any(|t| t.id == s.id))
                    .collect();
                pool.sort_by(|a, b| b.time_span.end.cmp(&a.time_span.end));
                for summary in pool {
                    if used + summary.token_count > budget {
                        continue;
                    }
                    used += summary.token_count;
                    summaries_taken += 1;
                    covered.extend(summary.source_message_ids.iter().cloned());
                    selected_summaries.push(summary.clone());
                }
            }

            let candidates: Vec<(usize, &Message)> = history
                .iter()
                .enumerate()
                .filter(|(_, m)| !selected_ids.contains(&m.id))
                .filter(|(_, m)| m.is_critical() || !covered.contains(&m.id))
                .filter(|(_, m)| Self::eligible(m, &tier, now))
                .collect();
            let (admitted, tokens) = admit_ranked(candidates, budget - used);
            used += tokens;
            let admitted_count = admitted.len();
            for message in admitted {
                selected_ids.insert(message.id.clone());
                selected_messages.push(message);
            }

            debug!(
                tier = name,
                budget,
                used,
                messages = admitted_count,
                summaries = summaries_taken,
                "Tier filled"
            );
            usage.push(TierUsage {
                tier: name,
                budget,
                used,
                messages: admitted_count,
                summaries: summaries_taken,
            });
            carry = budget.saturating_sub(used);
            total += used;
        }

        // Chronological emission: history order for messages, span start
        // for summaries
        let position: std::collections::HashMap<&str, usize> = history
            .iter()
            .enumerate()
            .map(|(i, m)| (m.id.as_str(), i))
            .collect();
        selected_messages.sort_by_key(|m| position.get(m.id.as_str()).copied().unwrap_or(usize::MAX));
        selected_summaries.sort_by(|a, b| a.time_span.start.cmp(&b.time_span.start));

        if total > max_tokens {
            warn!(
                total_tokens = total,
                budget = max_tokens,
                "Critical messages pushed the selection over budget"
            );
        }

        Ok((
            ContextSelection {
                system_message,
                messages: selected_messages,
                summaries: selected_summaries,
                total_tokens: total,
                max_tokens,
            },
            usage,
        ))
    }

    /// The system prompt, extended once with the prior-history
    /// instruction when a persisted session is loaded.
    fn system_message(&self) -> Option<Message> {
        let mut system = self.manager.system_prompt()?;
        if self.manager.has_loaded_history() && !system.content.contains(PRIOR_HISTORY_INSTRUCTION)
        {
            system.content.push_str("\n\n");
            system.content.push_str(PRIOR_HISTORY_INSTRUCTION);
            system.token_count = self.manager.counter().count_message(&system);
        }
        Some(system)
    }

    fn eligible(message: &Message, tier: &TierConfig, now: DateTime<Utc>) -> bool {
        within(message.created_at, tier.window_secs, now)
            || message.level() >= tier.threshold
            || message.has_tag(LOADED_FROM_DISK_TAG)
    }

    /// IDs of recent messages to summarize, or `None` when the trigger has
    /// not fired.
    ///
    /// Counts non-system messages inside the medium-term window that are
    /// neither covered by a summary nor already `pending` in the queue. The
    /// newest [`RETAIN_VERBATIM`] of them stay out of the task.
    pub fn check_auto_summarize(
        &self,
        now: DateTime<Utc>,
        pending: &HashSet<String>,
    ) -> Option<Vec<String>> {
        let threshold = self.config.auto_summarize_threshold;
        if threshold == 0 {
            return None;
        }
        let summarized = self.manager.summarized_ids();
        let window = self.config.medium_term.window_secs;
        let mut ids: Vec<String> = self
            .manager
            .full_history()
            .into_iter()
            .filter(|m| m.role != Role::System)
            .filter(|m| within(m.created_at, window, now))
            .filter(|m| !summarized.contains(&m.id) && !pending.contains(&m.id))
            .map(|m| m.id)
            .collect();

        if ids.len() < threshold {
            return None;
        }
        debug!(count = ids.len(), threshold, "Auto-summarize triggered");
        ids.truncate(ids.len().saturating_sub(RETAIN_VERBATIM));
        (!ids.is_empty()).then_some(ids)
    }
}

fn within(created_at: DateTime<Utc>, window_secs: u64, now: DateTime<Utc>) -> bool {
    let window = Duration::seconds(i64::try_from(window_secs).unwrap_or(i64::MAX / 1000));
    now.signed_duration_since(created_at) <= window
}
