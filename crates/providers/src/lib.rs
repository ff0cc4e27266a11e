//! LLM backend implementations for Parley.
//!
//! All backends implement the `parley_core::Backend` trait.
//! The factory selects the correct backend based on configuration.

pub mod anthropic;
pub mod factory;
pub mod mock;
pub mod openai_compat;
pub mod retry;

pub use anthropic::AnthropicBackend;
pub use factory::build_backend;
pub use mock::MockBackend;
pub use openai_compat::OpenAiCompatBackend;
pub use retry::RetryingBackend;
