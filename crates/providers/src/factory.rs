//! Backend factory: maps a configured type tag to a constructor.
//!
//! Every constructed backend is wrapped in a [`RetryingBackend`] when the
//! configuration allows retries.

use std::sync::Arc;
use std::time::Duration;

use parley_config::BackendConfig;
use parley_core::backend::Backend;
use parley_core::error::BackendError;
use tracing::info;

use crate::anthropic::AnthropicBackend;
use crate::mock::MockBackend;
use crate::openai_compat::OpenAiCompatBackend;
use crate::retry::RetryingBackend;

/// Type tags understood by [`build_backend`].
pub const BACKEND_KINDS: &[&str] = &["openai", "anthropic", "local", "mock", "bedrock"];

/// Build a backend from configuration.
pub fn build_backend(config: &BackendConfig) -> Result<Arc<dyn Backend>, BackendError> {
    let backend: Arc<dyn Backend> = match config.kind.as_str() {
        "openai" => {
            let api_key = required_key(config)?;
            let base_url = config
                .api_url
                .clone()
                .unwrap_or_else(|| default_base_url("openai"));
            Arc::new(OpenAiCompatBackend::new(
                "openai",
                base_url,
                api_key,
                &config.model,
            )?)
        }
        "anthropic" => {
            let api_key = required_key(config)?;
            let mut backend = AnthropicBackend::new(api_key, &config.model)?;
            if let Some(url) = &config.api_url {
                backend = backend.with_base_url(url);
            }
            Arc::new(backend)
        }
        "local" => Arc::new(OpenAiCompatBackend::local(
            config.api_url.as_deref(),
            &config.model,
        )?),
        "mock" => Arc::new(MockBackend::new().with_model(&config.model)),
        "bedrock" => {
            return Err(BackendError::Unsupported(
                "bedrock requires AWS request signing, which this build does not include".into(),
            ));
        }
        other => {
            return Err(BackendError::Unsupported(format!(
                "unknown backend '{other}' (expected one of: {})",
                BACKEND_KINDS.join(", ")
            )));
        }
    };

    info!(kind = %config.kind, model = %config.model, "Backend initialized");

    if config.max_retries == 0 {
        return Ok(backend);
    }
    Ok(Arc::new(RetryingBackend::new(
        backend,
        config.max_retries,
        Duration::from_millis(config.retry_base_delay_ms),
    )))
}

fn required_key(config: &BackendConfig) -> Result<String, BackendError> {
    config
        .api_key
        .clone()
        .filter(|k| !k.trim().is_empty())
        .ok_or_else(|| {
            BackendError::InvalidConfiguration(format!(
                "backend '{}' needs an API key (set backend.api_key or PARLEY_API_KEY)",
                config.kind
            ))
        })
}

/// Get the default base URL for well-known backends.
fn default_base_url(kind: &str) -> String {
    match kind {
        "openai" => crate::openai_compat::OPENAI_BASE_URL.into(),
        "anthropic" => crate::anthropic::ANTHROPIC_BASE_URL.into(),
        _ => crate::openai_compat::LOCAL_BASE_URL.into(),
    }
}
