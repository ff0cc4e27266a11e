//! Bounded retry with exponential backoff.
//!
//! Wraps any backend and retries calls that fail with a retryable error
//! kind (Network, RateLimited, ServiceUnavailable). Everything else is
//! returned on the first failure.

use async_trait::async_trait;
use parley_core::backend::{Backend, BackendRequest, BackendResponse};
use parley_core::error::BackendError;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// A backend that retries its inner backend on transient failures.
pub struct RetryingBackend {
    inner: Arc<dyn Backend>,
    max_retries: u32,
    base_delay: Duration,
}

impl RetryingBackend {
    pub fn new(inner: Arc<dyn Backend>, max_retries: u32, base_delay: Duration) -> Self {
        Self {
            inner,
            max_retries,
            base_delay,
        }
    }

    /// Delay before retry number `attempt` (zero-based).
    fn delay_for(&self, attempt: u32, error: &BackendError) -> Duration {
        let backoff = self.base_delay.saturating_mul(2u32.saturating_pow(attempt));
        match error {
            BackendError::RateLimited { retry_after_secs } => {
                backoff.max(Duration::from_secs(*retry_after_secs))
            }
            _ => backoff,
        }
    }
}

#[async_trait]
impl Backend for RetryingBackend {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn model_id(&self) -> &str {
        self.inner.model_id()
    }

    async fn send(&self, request: BackendRequest) -> Result<BackendResponse, BackendError> {
        let mut attempt = 0;
        loop {
            match self.inner.send(request.clone()).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let delay = self.delay_for(attempt, &e);
                    warn!(
                        backend = %self.inner.name(),
                        attempt = attempt + 1,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying backend call"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.inner.close().await
    }
}
