//! Executable behaviour bound to operation tags.

pub mod batch_thread_read;
pub mod cross_reference;
pub mod keyword_search;
pub mod metadata_filter;
pub mod semantic_analysis;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use sift_core::config::StrategiesConfig;
use sift_core::error::SiftError;
use sift_core::traits::{DomainService, LanguageModel};
use sift_core::types::Item;

use crate::graph::OperationTag;

pub use batch_thread_read::BatchThreadReadStrategy;
pub use cross_reference::CrossReferenceStrategy;
pub use keyword_search::KeywordSearchStrategy;
pub use metadata_filter::MetadataFilterStrategy;
pub use semantic_analysis::SemanticAnalysisStrategy;

/// Everything a strategy may touch during one invocation.
#[derive(Clone)]
pub struct StrategyContext {
    pub node_id: String,
    /// Fixed per run so re-running a graph sees the same relative dates.
    pub now: DateTime<Utc>,
    pub domain: Arc<dyn DomainService>,
    pub model: Arc<dyn LanguageModel>,
    pub settings: Arc<StrategiesConfig>,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StrategyOutcome {
    pub data: Value,
    pub tokens_used: u64,
}

impl StrategyOutcome {
    pub fn free(data: Value) -> Self {
        Self {
            data,
            tokens_used: 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("domain service failed: {0}")]
    Domain(String),

    #[error("language model failed: {0}")]
    Model(String),
}

impl StrategyError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidParameters(_) => "invalid_parameters",
            Self::Domain(_) => "domain_error",
            Self::Model(_) => "model_error",
        }
    }
}

impl From<SiftError> for StrategyError {
    fn from(e: SiftError) -> Self {
        match e {
            SiftError::LlmRequest(_)
            | SiftError::LlmParse(_)
            | SiftError::SchemaMismatch(_)
            | SiftError::UnsupportedProvider(_) => Self::Model(e.to_string()),
            other => Self::Domain(other.to_string()),
        }
    }
}

/// Static cost of one node, used when the plan carries no estimate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CostHint {
    pub tokens: u64,
    pub time_ms: u64,
}

/// A pluggable operation. Implementations are stateless per invocation and
/// must be safe to run concurrently.
pub trait Strategy: Send + Sync + 'static {
    fn tag(&self) -> OperationTag;

    /// One line shown to the decomposer.
    fn description(&self) -> &str;

    /// Example parameters shown to the decomposer.
    fn parameter_hint(&self) -> Value;

    fn cost_hint(&self) -> CostHint {
        CostHint::default()
    }

    /// Run with fully resolved parameters.
    fn execute(
        &self,
        params: Value,
        ctx: StrategyContext,
    ) -> BoxFuture<'_, Result<StrategyOutcome, StrategyError>>;
}

pub(crate) fn parse_params<T: DeserializeOwned>(params: Value) -> Result<T, StrategyError> {
    serde_json::from_value(params).map_err(|e| StrategyError::InvalidParameters(e.to_string()))
}

/// Items from a resolved parameter: a list of items, or an object carrying
/// `items`/`threads`. Entries that are not items are skipped; a thread
/// contributes its messages.
pub(crate) fn items_from(value: &Value) -> Vec<Item> {
    match value {
        Value::Array(values) => values.iter().flat_map(items_from).collect(),
        Value::Object(map) => {
            if let Some(inner) = map.get("items") {
                return items_from(inner);
            }
            if let Some(threads) = map.get("threads") {
                return items_from(threads);
            }
            if let Some(messages) = map.get("messages") {
                if map.contains_key("id") && !map.contains_key("timestamp") {
                    return items_from(messages);
                }
            }
            serde_json::from_value::<Item>(value.clone())
                .map(|item| vec![item])
                .unwrap_or_default()
        }
        _ => vec![],
    }
}

pub(crate) fn items_value(items: &[Item]) -> Value {
    serde_json::to_value(items).unwrap_or(Value::Array(vec![]))
}
