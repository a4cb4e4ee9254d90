use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use sift_core::config::ModelConfig;
use sift_core::error::{Result, SiftError};
use sift_core::traits::LanguageModel;
use sift_core::types::{GenerateRequest, Generation};

use super::{finish, schema_instruction};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic Messages API client.
pub struct AnthropicClient {
    http: Client,
    config: ModelConfig,
}

impl AnthropicClient {
    pub fn new(config: ModelConfig) -> Self {
        Self {
            http: Client::new(),
            config,
        }
    }
}

#[derive(Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Serialize)]
struct ApiMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize, Debug)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Deserialize, Debug)]
struct ApiUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

fn build_request(config: &ModelConfig, request: &GenerateRequest) -> MessagesRequest {
    MessagesRequest {
        model: config.model_id.clone(),
        max_tokens: request.max_tokens.min(config.max_tokens),
        system: request.system.clone(),
        messages: vec![ApiMessage {
            role: "user",
            content: schema_instruction(request),
        }],
        temperature: if config.temperature > 0.0 {
            Some(config.temperature)
        } else {
            None
        },
    }
}

fn collect_text(response: MessagesResponse) -> (String, u64) {
    let text = response
        .content
        .into_iter()
        .filter_map(|b| match b {
            ContentBlock::Text { text } => Some(text),
            ContentBlock::Other => None,
        })
        .collect::<Vec<_>>()
        .join("");
    let tokens = response
        .usage
        .map(|u| u.input_tokens + u.output_tokens)
        .unwrap_or(0);
    (text, tokens)
}

impl LanguageModel for AnthropicClient {
    fn generate(&self, request: GenerateRequest) -> BoxFuture<'_, Result<Generation>> {
        Box::pin(async move {
            let url = self.config.base_url.as_deref().unwrap_or(ANTHROPIC_API_URL);
            let api_key = self
                .config
                .api_key
                .as_deref()
                .ok_or_else(|| SiftError::Config("anthropic provider requires api_key".into()))?;

            let body = build_request(&self.config, &request);
            let mut req = self
                .http
                .post(url)
                .header("x-api-key", api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .header("content-type", "application/json")
                .json(&body);

            for (k, v) in &self.config.extra_headers {
                req = req.header(k.as_str(), v.as_str());
            }

            let response = req
                .send()
                .await
                .map_err(|e| SiftError::LlmRequest(e.to_string()))?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "unknown".to_string());
                return Err(SiftError::LlmRequest(format!("HTTP {}: {}", status, body)));
            }

            let parsed: MessagesResponse = response
                .json()
                .await
                .map_err(|e| SiftError::LlmParse(e.to_string()))?;
            let (raw, tokens_used) = collect_text(parsed);

            debug!(model = %self.config.model_id, tokens_used, "Anthropic completion received");
            finish(&request, raw, tokens_used)
        })
    }

    fn name(&self) -> &str {
        &self.config.model_id
    }
}
