use std::time::Duration;

use futures::future::BoxFuture;
use tracing::{info, warn};

use sift_core::config::RetryConfig;
use sift_core::error::{Result, SiftError};
use sift_core::traits::LanguageModel;
use sift_core::types::{GenerateRequest, Generation};

/// A language model that retries failed requests and falls back to alternative providers.
///
/// Only transport-level failures are retried. A completion that fails strict
/// schema checking is returned as-is; correcting it is the caller's job.
pub struct RetryingClient {
    primary: Box<dyn LanguageModel>,
    fallbacks: Vec<Box<dyn LanguageModel>>,
    retry_config: RetryConfig,
}

impl RetryingClient {
    pub fn new(
        primary: Box<dyn LanguageModel>,
        fallbacks: Vec<Box<dyn LanguageModel>>,
        retry_config: RetryConfig,
    ) -> Self {
        Self {
            primary,
            fallbacks,
            retry_config,
        }
    }
}

fn is_retryable(e: &SiftError) -> bool {
    match e {
        SiftError::LlmRequest(msg) => {
            msg.contains("429")
                || msg.contains("500")
                || msg.contains("502")
                || msg.contains("503")
                || msg.contains("timeout")
                || msg.contains("connection")
        }
        _ => false,
    }
}

fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let ms = (config.initial_backoff_ms * 2u64.pow(attempt)).min(config.max_backoff_ms);
    // Add jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

impl LanguageModel for RetryingClient {
    fn generate(&self, request: GenerateRequest) -> BoxFuture<'_, Result<Generation>> {
        Box::pin(async move {
            let max_retries = self.retry_config.max_retries;

            // Try primary with retries
            let mut last_err = None;
            for attempt in 0..=max_retries {
                match self.primary.generate(request.clone()).await {
                    Ok(generation) => return Ok(generation),
                    Err(e) => {
                        if is_retryable(&e) && attempt < max_retries {
                            let backoff = calculate_backoff(attempt, &self.retry_config);
                            warn!(
                                attempt = attempt + 1,
                                max_retries,
                                backoff_ms = backoff.as_millis() as u64,
                                error = %e,
                                "Retrying LLM request"
                            );
                            tokio::time::sleep(backoff).await;
                            last_err = Some(e);
                            continue;
                        }
                        last_err = Some(e);
                        break;
                    }
                }
            }

            // Parse and schema failures are answers, not outages: no fallback.
            if let Some(e) = last_err.take() {
                if !matches!(e, SiftError::LlmRequest(_)) {
                    return Err(e);
                }
                last_err = Some(e);
            }

            // Primary exhausted, try fallbacks
            if !self.fallbacks.is_empty() {
                info!("Primary LLM exhausted, trying fallback models");
            }
            for fallback in &self.fallbacks {
                match fallback.generate(request.clone()).await {
                    Ok(generation) => {
                        info!(model = %fallback.name(), "Fell back to alternative model");
                        return Ok(generation);
                    }
                    Err(e) => {
                        warn!(model = %fallback.name(), error = %e, "Fallback model also failed");
                        continue;
                    }
                }
            }

            Err(last_err.unwrap_or_else(|| SiftError::LlmRequest("All providers failed".into())))
        })
    }

    fn name(&self) -> &str {
        self.primary.name()
    }
}
