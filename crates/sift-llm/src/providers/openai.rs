use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use sift_core::config::ModelConfig;
use sift_core::error::{Result, SiftError};
use sift_core::traits::LanguageModel;
use sift_core::types::{GenerateRequest, Generation};

use super::{finish, schema_instruction};

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

/// OpenAI-compatible client. Works with OpenAI, Ollama, vLLM, Groq, OpenRouter, etc.
pub struct OpenAiClient {
    http: Client,
    config: ModelConfig,
}

impl OpenAiClient {
    pub fn new(config: ModelConfig) -> Self {
        Self {
            http: Client::new(),
            config,
        }
    }
}

// Request types
#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<OaiMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct OaiMessage {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct ResponseFormat {
    r#type: &'static str,
}

// Response types
#[derive(Deserialize, Debug)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize, Debug)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize, Debug)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

fn build_request(config: &ModelConfig, request: &GenerateRequest) -> ChatRequest {
    let mut messages = Vec::new();
    if let Some(system) = &request.system {
        messages.push(OaiMessage {
            role: "system",
            content: system.clone(),
        });
    }
    messages.push(OaiMessage {
        role: "user",
        content: schema_instruction(request),
    });

    ChatRequest {
        model: config.model_id.clone(),
        messages,
        max_tokens: request.max_tokens.min(config.max_tokens),
        temperature: if config.temperature > 0.0 {
            Some(config.temperature)
        } else {
            None
        },
        response_format: request.schema.as_ref().map(|_| ResponseFormat {
            r#type: "json_object",
        }),
    }
}

impl LanguageModel for OpenAiClient {
    fn generate(&self, request: GenerateRequest) -> BoxFuture<'_, Result<Generation>> {
        Box::pin(async move {
            let base_url = self.config.base_url.as_deref().unwrap_or(OPENAI_API_URL);
            let body = build_request(&self.config, &request);

            let mut req = self.http.post(base_url).json(&body);

            if let Some(api_key) = &self.config.api_key {
                req = req.header("Authorization", format!("Bearer {}", api_key));
            }

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

            let parsed: ChatResponse = response
                .json()
                .await
                .map_err(|e| SiftError::LlmParse(e.to_string()))?;

            let tokens_used = parsed
                .usage
                .map(|u| u.prompt_tokens + u.completion_tokens)
                .unwrap_or(0);
            let raw = parsed
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.message.content)
                .ok_or_else(|| SiftError::LlmParse("response has no choices".into()))?;

            debug!(model = %self.config.model_id, tokens_used, "OpenAI completion received");
            finish(&request, raw, tokens_used)
        })
    }

    fn name(&self) -> &str {
        &self.config.model_id
    }
}
