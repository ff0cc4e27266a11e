//! Context window management.
//!
//! | Module | Role |
//! |--------|------|
//! | `token` | Token estimates for messages, summaries, and whole prompts |
//! | `prioritizer` | Importance, tags, and topics from message content |
//! | `manager` | Conversation store and the flat budgeted selection |
//! | `hierarchical` | Time-tiered selection and the auto-summarize trigger |
//! | `summarizer` | Backend-produced summaries of message spans |
//! | `queue` | Bounded summary queue and its background worker |

pub mod hierarchical;
pub mod manager;
pub mod prioritizer;
pub mod queue;
pub mod summarizer;
pub mod token;

pub use hierarchical::{HierarchicalSelector, PRIOR_HISTORY_INSTRUCTION, RETAIN_VERBATIM, TierUsage};
pub use manager::{ContextManager, ContextStats, SUMMARIES_LABEL};
pub use prioritizer::Prioritizer;
pub use queue::{SummaryQueue, SummaryService, SummaryTask};
pub use summarizer::Summarizer;
pub use token::{HeuristicCounter, TokenCounter, estimate_tokens};
