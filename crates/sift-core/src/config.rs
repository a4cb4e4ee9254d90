use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SiftError};
use crate::types::{FailureClass, Preferences};

/// Top-level sift configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub model: ModelConfig,
    #[serde(default)]
    pub fallback_models: Vec<ModelConfig>,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub decomposer: DecomposerConfig,
    #[serde(default)]
    pub synthesis: SynthesisConfig,
    #[serde(default)]
    pub strategies: StrategiesConfig,
    #[serde(default)]
    pub preferences: Preferences,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

fn default_provider() -> String { "openai".to_string() }
fn default_max_tokens() -> u32 { 4096 }
fn default_temperature() -> f32 { 0.0 }

/// Retry configuration for LLM requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30000 }

/// Pipeline-wide limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Conversation turns passed to the decomposer.
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,
    /// Deadline for a whole graph run.
    #[serde(default = "default_run_timeout")]
    pub run_timeout_secs: u64,
    /// Deadline for a single strategy call.
    #[serde(default = "default_node_timeout")]
    pub node_timeout_secs: u64,
    /// Re-planning rounds after fatal node failures (0 = never).
    #[serde(default)]
    pub max_replans: usize,
    #[serde(default)]
    pub confirmation: ConfirmationConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            history_turns: default_history_turns(),
            run_timeout_secs: default_run_timeout(),
            node_timeout_secs: default_node_timeout(),
            max_replans: 0,
            confirmation: ConfirmationConfig::default(),
        }
    }
}

fn default_history_turns() -> usize { 6 }
fn default_run_timeout() -> u64 { 120 }
fn default_node_timeout() -> u64 { 30 }

/// Budget above which a plan needs explicit user confirmation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationConfig {
    #[serde(default = "default_confirm_tokens")]
    pub max_tokens: u64,
    #[serde(default = "default_confirm_cost")]
    pub max_cost: f64,
    #[serde(default = "default_confirm_time")]
    pub max_time_ms: u64,
    /// How long an unconfirmed plan stays valid.
    #[serde(default = "default_confirm_ttl")]
    pub ttl_secs: u64,
    /// Price used when the engine has to estimate cost itself.
    #[serde(default = "default_cost_per_1k")]
    pub cost_per_1k_tokens: f64,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_confirm_tokens(),
            max_cost: default_confirm_cost(),
            max_time_ms: default_confirm_time(),
            ttl_secs: default_confirm_ttl(),
            cost_per_1k_tokens: default_cost_per_1k(),
        }
    }
}

fn default_confirm_tokens() -> u64 { 50_000 }
fn default_confirm_cost() -> f64 { 0.50 }
fn default_confirm_time() -> u64 { 90_000 }
fn default_confirm_ttl() -> u64 { 600 }
fn default_cost_per_1k() -> f64 { 0.002 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecomposerConfig {
    #[serde(default = "default_decomposer_tokens")]
    pub max_tokens: u32,
}

impl Default for DecomposerConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_decomposer_tokens(),
        }
    }
}

fn default_decomposer_tokens() -> u32 { 2048 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisConfig {
    /// Output cap for the final answer.
    #[serde(default = "default_synthesis_tokens")]
    pub max_tokens: u32,
    /// Characters of each node's data shown to the model.
    #[serde(default = "default_excerpt_chars")]
    pub excerpt_chars: usize,
    /// Token budget for the whole findings block.
    #[serde(default = "default_findings_budget")]
    pub findings_token_budget: usize,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_synthesis_tokens(),
            excerpt_chars: default_excerpt_chars(),
            findings_token_budget: default_findings_budget(),
        }
    }
}

fn default_synthesis_tokens() -> u32 { 600 }
fn default_excerpt_chars() -> usize { 1_200 }
fn default_findings_budget() -> usize { 3_000 }

/// Built-in strategy tuning and the failure policy table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategiesConfig {
    /// Items per semantic-analysis model call.
    #[serde(default = "default_semantic_batch")]
    pub semantic_batch_size: usize,
    /// Concurrent semantic-analysis calls within one node.
    #[serde(default = "default_semantic_concurrency")]
    pub semantic_concurrency: usize,
    /// Max thread ids per batch read.
    #[serde(default = "default_thread_batch")]
    pub thread_batch_limit: usize,
    /// Result cap applied when a node sets no limit.
    #[serde(default = "default_limit")]
    pub default_limit: usize,
    /// Per-tag override of the failure class, keyed by operation tag.
    #[serde(default)]
    pub failure: HashMap<String, FailureClass>,
}

impl Default for StrategiesConfig {
    fn default() -> Self {
        Self {
            semantic_batch_size: default_semantic_batch(),
            semantic_concurrency: default_semantic_concurrency(),
            thread_batch_limit: default_thread_batch(),
            default_limit: default_limit(),
            failure: HashMap::new(),
        }
    }
}

fn default_semantic_batch() -> usize { 10 }
fn default_semantic_concurrency() -> usize { 4 }
fn default_thread_batch() -> usize { 50 }
fn default_limit() -> usize { 50 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| SiftError::ConfigNotFound(path.display().to_string()))?;

        Self::from_toml(&content)
    }

    /// Parse config from TOML text, with env var expansion.
    pub fn from_toml(content: &str) -> Result<Self> {
        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(content);

        let config: Self = toml::from_str(&expanded).map_err(|e| SiftError::Config(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<()> {
        if self.strategies.semantic_batch_size == 0 {
            return Err(SiftError::Config("strategies.semantic_batch_size must be > 0".into()));
        }
        if self.strategies.semantic_concurrency == 0 {
            return Err(SiftError::Config("strategies.semantic_concurrency must be > 0".into()));
        }
        if self.engine.run_timeout_secs == 0 || self.engine.node_timeout_secs == 0 {
            return Err(SiftError::Config("engine timeouts must be > 0".into()));
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}
