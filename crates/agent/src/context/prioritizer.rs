//! Message prioritization: importance, tags, and topics from content.
//!
//! Importance rules are ordered and the first match wins:
//!
//! | # | Condition | Importance |
//! |---|-----------|------------|
//! | 1 | system role | High |
//! | 2 | critical pattern | Critical |
//! | 3 | important pattern | High |
//! | 4 | high-priority keyword | High |
//! | 5 | fenced code block | Medium |
//! | 6 | otherwise | Low |
//!
//! Enhancement is idempotent: fields that are already populated are left
//! alone.

use parley_config::ContextConfig;
use parley_core::message::{Importance, Message, Role};
use regex_lite::Regex;
use std::collections::BTreeSet;

/// Most topics extracted from one text.
pub const MAX_TOPICS: usize = 3;

/// Words a topic needs in its sentence before the sentence counts.
const MIN_SENTENCE_WORDS: usize = 4;

/// Content words taken from the start of a sentence to form a topic.
const TOPIC_WORDS: usize = 3;

const PREFERENCE_PATTERN: &str =
    r"(?i)\b(i prefer|i'd prefer|i would prefer|i like|i don't like|i want|i'd rather|please (use|avoid|don't))\b";

const TECHNICAL_PATTERN: &str = r"(?i)\b(api|function|method|class|struct|module|database|schema|query|server|endpoint|config(uration)?|deploy(ment)?|test(s|ing)?|error|exception|build|compile[rd]?|library|crate|package|dependency)\b";

const STOPWORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "is", "are", "was", "were", "be", "been", "to", "of",
    "in", "on", "for", "with", "at", "by", "from", "it", "its", "this", "that", "these", "those",
    "i", "you", "we", "they", "he", "she", "me", "my", "your", "our", "their", "can", "could",
    "would", "should", "will", "do", "does", "did", "please", "so", "if", "then", "just", "also",
    "what", "how", "why", "when", "where", "which", "there", "here", "have", "has", "had", "not",
    "no", "yes", "as", "about", "into", "let", "lets", "let's", "i'm", "it's", "some", "any",
];

/// Classifies messages by importance and derives tags and topics.
#[derive(Debug, Clone)]
pub struct Prioritizer {
    critical: Vec<Regex>,
    important: Vec<Regex>,
    keywords: Vec<String>,
    preference: Regex,
    technical: Regex,
}

impl Prioritizer {
    /// Compile the configured patterns. An invalid pattern is an error.
    pub fn from_config(config: &ContextConfig) -> Result<Self, regex_lite::Error> {
        let compile = |patterns: &[String]| -> Result<Vec<Regex>, regex_lite::Error> {
            patterns.iter().map(|p| Regex::new(p)).collect()
        };
        Ok(Self {
            critical: compile(&config.critical_patterns)?,
            important: compile(&config.important_patterns)?,
            keywords: config
                .high_priority_keywords
                .iter()
                .map(|k| k.to_lowercase())
                .collect(),
            preference: Regex::new(PREFERENCE_PATTERN)?,
            technical: Regex::new(TECHNICAL_PATTERN)?,
        })
    }

    /// Populate importance, tags, and topics where they are still empty.
    pub fn enhance(&self, message: &mut Message) {
        if message.importance.is_none() {
            message.importance = Some(self.classify(message.role, &message.content));
        }
        if message.tags.is_empty() {
            message.tags = self.extract_tags(message.role, &message.content);
        }
        if message.topics.is_empty() {
            message.topics = self.extract_topics(&message.content);
        }
    }

    /// Importance for a piece of content spoken by `role`.
    pub fn classify(&self, role: Role, content: &str) -> Importance {
        if role == Role::System {
            return Importance::High;
        }
        if self.critical.iter().any(|re| re.is_match(content)) {
            return Importance::Critical;
        }
        if self.is_requirement(content) {
            return Importance::High;
        }
        let lower = content.to_lowercase();
        if self.keywords.iter().any(|k| lower.contains(k.as_str())) {
            return Importance::High;
        }
        if has_code_block(content) {
            return Importance::Medium;
        }
        Importance::Low
    }

    pub fn extract_tags(&self, role: Role, content: &str) -> BTreeSet<String> {
        let mut tags = BTreeSet::new();
        if has_code_block(content) {
            tags.insert("code".to_string());
        }
        if self.preference.is_match(content) {
            tags.insert("preference".to_string());
        }
        if self.is_requirement(content) {
            tags.insert("requirement".to_string());
        }
        tags.insert(format!("role:{role}"));
        tags
    }

    /// Short phrases taken from the opening words of significant sentences.
    ///
    /// Sentences that state requirements, preferences, or technical
    /// subjects are preferred; ties keep their order in the text.
    pub fn extract_topics(&self, content: &str) -> BTreeSet<String> {
        let prose = strip_code_blocks(content);
        let mut scored: Vec<(usize, String)> = prose
            .split(['.', '!', '?', '\n'])
            .filter(|s| s.split_whitespace().count() >= MIN_SENTENCE_WORDS)
            .filter_map(|sentence| {
                let topic = topic_phrase(sentence)?;
                let mut score = 0;
                if self.is_requirement(sentence) {
                    score += 2;
                }
                if self.preference.is_match(sentence) {
                    score += 1;
                }
                if self.technical.is_match(sentence) {
                    score += 1;
                }
                Some((score, topic))
            })
            .collect();
        // Stable: equal scores stay in text order
        scored.sort_by(|a, b| b.0.cmp(&a.0));

        let mut topics = BTreeSet::new();
        for (_, topic) in scored {
            if topics.len() >= MAX_TOPICS {
                break;
            }
            topics.insert(topic);
        }
        topics
    }

    fn is_requirement(&self, content: &str) -> bool {
        self.important.iter().any(|re| re.is_match(content))
    }
}

fn has_code_block(content: &str) -> bool {
    content.contains("```")
}

/// Remove fenced code; an unterminated fence swallows the rest.
fn strip_code_blocks(content: &str) -> String {
    content
        .split("```")
        .step_by(2)
        .collect::<Vec<_>>()
        .join(" ")
}

fn topic_phrase(sentence: &str) -> Option<String> {
    let words: Vec<String> = sentence
        .split_whitespace()
        .map(|w| {
            w.trim_matches(|c: char| !c.is_alphanumeric() && c != '\'')
                .to_lowercase()
        })
        .filter(|w| w.len() > 2 && !STOPWORDS.contains(&w.as_str()))
        .take(TOPIC_WORDS)
        .collect();
    (!words.is_empty()).then(|| words.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prioritizer() -> Prioritizer {
        Prioritizer::from_config(&ContextConfig::default()).unwrap()
    }

    #[test]
    fn rules_apply_in_order() {
        let p = prioritizer();
        assert_eq!(p.classify(Role::System, "hello"), Importance::High);
        assert_eq!(p.classify(Role::System, "URGENT"), Importance::High);
        assert_eq!(
            p.classify(Role::User, "This is urgent, production is down"),
            Importance::Critical
        );
        assert_eq!(
            p.classify(Role::User, "You must use tabs"),
            Importance::High
        );
        assert_eq!(
            p.classify(Role::User, "There is a bug here"),
            Importance::High
        );
        assert_eq!(
            p.classify(Role::Assistant, "```rust\nfn main() {}\n```"),
            Importance::Medium
        );
        assert_eq!(p.classify(Role::User, "hello"), Importance::Low);
    }

    #[test]
    fn tags_are_additive() {
        let p = prioritizer();
        let tags = p.extract_tags(Role::User, "I prefer snake_case and you must keep it.\n```\nx\n```");
        assert!(tags.contains("code"));
        assert!(tags.contains("preference"));
        assert!(tags.contains("requirement"));
        assert!(tags.contains("role:user"));
    }

    #[test]
    fn topics_are_capped_and_skip_code() {
        let p = prioritizer();
        let text = "Database migrations keep failing on startup. \
                    Logging output looks noisy today. \
                    Frontend colors seem slightly off. \
                    Release notes need to mention the change.\n\
                    ```\nlet ignored = code_words_here_only;\n```";
        let topics = p.extract_topics(text);
        assert_eq!(topics.len(), MAX_TOPICS);
        assert!(topics.iter().all(|t| !t.contains("ignored")));
        // technical and requirement sentences win over plain ones
        assert!(topics.contains("database migrations keep"));
        assert!(topics.contains("release notes need"));
    }

    #[test]
    fn short_sentences_yield_no_topics() {
        assert!(prioritizer().extract_topics("hi there").is_empty());
    }

    #[test]
    fn enhance_is_idempotent() {
        let p = prioritizer();
        let mut msg = Message::user("Remember this: the deploy key rotates weekly on Mondays.");
        p.enhance(&mut msg);
        assert_eq!(msg.importance, Some(Importance::Critical));
        let snapshot = msg.clone();
        p.enhance(&mut msg);
        assert_eq!(msg, snapshot);
    }

    #[test]
    fn enhance_keeps_existing_fields() {
        let p = prioritizer();
        let mut msg = Message::user("urgent!").with_importance(Importance::Low).with_tag("custom");
        p.enhance(&mut msg);
        assert_eq!(msg.importance, Some(Importance::Low));
        assert_eq!(msg.tags.len(), 1);
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let config = ContextConfig {
            critical_patterns: vec!["(unclosed".into()],
            ..ContextConfig::default()
        };
        assert!(Prioritizer::from_config(&config).is_err());
    }
}
