pub mod providers;
pub mod retry;

use std::sync::Arc;

use sift_core::config::{AppConfig, ModelConfig};
use sift_core::traits::LanguageModel;

pub use providers::anthropic::AnthropicClient;
pub use providers::openai::OpenAiClient;
pub use retry::RetryingClient;

/// Create a language-model client based on the provider name.
pub fn create_client(config: &ModelConfig) -> Box<dyn LanguageModel> {
    match config.provider.as_str() {
        "anthropic" | "claude" => Box::new(AnthropicClient::new(config.clone())),
        // Everything else uses the OpenAI-compatible client
        _ => Box::new(OpenAiClient::new(config.clone())),
    }
}

/// Primary client wrapped with retries and the configured fallback models.
pub fn create_from_config(config: &AppConfig) -> Arc<dyn LanguageModel> {
    let fallbacks = config.fallback_models.iter().map(create_client).collect();
    Arc::new(RetryingClient::new(
        create_client(&config.model),
        fallbacks,
        config.model.retry.clone().unwrap_or_default(),
    ))
}
