//! The conversation orchestrator for Parley.
//!
//! Each user turn runs a **select → ask → act** cycle:
//!
//! 1. **Record** the user message, prioritized by content
//! 2. **Select** a token-budgeted context: system prompt, summaries of older
//!    spans, and the messages that matter most
//! 3. **Ask** the backend
//! 4. **If a tool is requested**: dispatch it, record the call and its
//!    result, and go back to step 2
//! 5. **If text comes back**: record it and return it to the caller
//!
//! The loop ends on a text reply, a tool failure, or the configured
//! per-turn iteration ceiling. Summaries of aging history are produced in
//! the background and replace the messages they cover during selection.

pub mod chat;
pub mod context;
pub mod dispatcher;
pub mod orchestrator;

pub use chat::{ChatService, EchoChatService};
pub use context::{
    ContextManager, ContextStats, HeuristicCounter, HierarchicalSelector, Prioritizer,
    SummaryService, Summarizer, TokenCounter,
};
pub use dispatcher::ToolDispatcher;
pub use orchestrator::{Orchestrator, OrchestratorBuilder, SessionOptions};
