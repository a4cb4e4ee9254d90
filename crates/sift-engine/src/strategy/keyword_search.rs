use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use sift_core::types::{ItemSource, KeywordQuery};

use super::{items_value, parse_params, CostHint, Strategy, StrategyContext, StrategyError, StrategyOutcome};
use crate::graph::OperationTag;

/// Case-insensitive substring search across subjects and bodies.
pub struct KeywordSearchStrategy;

#[derive(Debug, Deserialize)]
struct SearchParams {
    query: String,
    #[serde(default)]
    source: Option<ItemSource>,
    #[serde(default)]
    limit: Option<usize>,
}

impl Strategy for KeywordSearchStrategy {
    fn tag(&self) -> OperationTag {
        OperationTag::KeywordSearch
    }

    fn description(&self) -> &str {
        "Find items whose subject or body contains a phrase."
    }

    fn parameter_hint(&self) -> Value {
        json!({"query": "budget", "source": "email", "limit": 50})
    }

    fn cost_hint(&self) -> CostHint {
        CostHint {
            tokens: 0,
            time_ms: 500,
        }
    }

    fn execute(
        &self,
        params: Value,
        ctx: StrategyContext,
    ) -> BoxFuture<'_, Result<StrategyOutcome, StrategyError>> {
        Box::pin(async move {
            let params: SearchParams = parse_params(params)?;
            if params.query.trim().is_empty() {
                return Err(StrategyError::InvalidParameters("query must not be empty".into()));
            }

            let items = ctx
                .domain
                .search_by_keyword(KeywordQuery {
                    query: params.query,
                    source: params.source,
                    limit: Some(params.limit.unwrap_or(ctx.settings.default_limit)),
                })
                .await?;
            debug!(node_id = %ctx.node_id, matched = items.len(), "Keyword search done");
            Ok(StrategyOutcome::free(json!({
                "items": items_value(&items),
                "count": items.len(),
            })))
        })
    }
}
