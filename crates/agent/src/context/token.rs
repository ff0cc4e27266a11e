//! Token estimation.
//!
//! Uses a character-based heuristic: ~4 characters per token for GPT-style
//! BPE vocabularies, slightly denser for Claude models. Counts are
//! estimates; the only hard guarantee is monotonicity, so adding content
//! never lowers a count.

use parley_core::message::{Message, Summary};

/// Framing cost of one message (role name, delimiters).
pub const MESSAGE_OVERHEAD: usize = 4;

/// Framing cost of a whole request (priming the reply).
pub const CONVERSATION_OVERHEAD: usize = 3;

const DEFAULT_CHARS_PER_TOKEN: usize = 4;

/// Estimate tokens for a string at a given density. Rounds up.
fn estimate(text: &str, chars_per_token: usize) -> usize {
    if text.is_empty() {
        return 0;
    }
    text.len().div_ceil(chars_per_token.max(1))
}

/// Estimate the token count for a string at the default density.
pub fn estimate_tokens(text: &str) -> usize {
    estimate(text, DEFAULT_CHARS_PER_TOKEN)
}

/// Counts tokens for text, messages, and whole requests.
pub trait TokenCounter: Send + Sync {
    /// Tokens in a bare string.
    fn count(&self, text: &str) -> usize;

    /// Tokens in one message, including role framing.
    fn count_message(&self, message: &Message) -> usize {
        MESSAGE_OVERHEAD + self.count(&message.content)
    }

    /// Tokens in a summary as it is rendered for the backend.
    fn count_summary(&self, summary: &Summary) -> usize {
        MESSAGE_OVERHEAD + self.count(&summary.content)
    }

    /// Tokens in a full request to `model`, including conversation overhead.
    fn count_context(&self, messages: &[Message], model: &str) -> usize;
}

/// Heuristic counter with per-model character densities.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicCounter;

impl HeuristicCounter {
    /// Characters per token for a model family.
    pub fn chars_per_token(model: &str) -> usize {
        let model = model.to_ascii_lowercase();
        if model.contains("claude") {
            3
        } else {
            DEFAULT_CHARS_PER_TOKEN
        }
    }
}

impl TokenCounter for HeuristicCounter {
    fn count(&self, text: &str) -> usize {
        estimate_tokens(text)
    }

    fn count_context(&self, messages: &[Message], model: &str) -> usize {
        let ratio = Self::chars_per_token(model);
        CONVERSATION_OVERHEAD
            + messages
                .iter()
                .map(|m| MESSAGE_OVERHEAD + estimate(&m.content, ratio))
                .sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_string_is_zero() {
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn four_chars_is_one_token() {
        assert_eq!(estimate_tokens("test"), 1);
    }

    #[test]
    fn five_chars_rounds_up() {
        assert_eq!(estimate_tokens("hello"), 2);
    }

    #[test]
    fn message_includes_overhead() {
        let msg = Message::user("test"); // 1 token + 4 overhead
        assert_eq!(HeuristicCounter.count_message(&msg), 5);
    }

    #[test]
    fn context_adds_conversation_overhead() {
        let msgs = vec![
            Message::user("hello"),      // 2 + 4
            Message::assistant("world"), // 2 + 4
        ];
        assert_eq!(HeuristicCounter.count_context(&msgs, "gpt-4o-mini"), 15);
        assert_eq!(HeuristicCounter.count_context(&[], "gpt-4o-mini"), 3);
    }

    #[test]
    fn claude_is_denser() {
        let msgs = vec![Message::user("a".repeat(120))];
        let gpt = HeuristicCounter.count_context(&msgs, "gpt-4o");
        let claude = HeuristicCounter.count_context(&msgs, "claude-3-5-sonnet");
        assert!(claude > gpt);
    }

    #[test]
    fn adding_content_never_decreases_count() {
        let mut text = String::new();
        let mut last = 0;
        for c in "The quick brown fox jumps over the lazy dog".chars() {
            text.push(c);
            let n = estimate_tokens(&text);
            assert!(n >= last);
            last = n;
        }
    }
}
