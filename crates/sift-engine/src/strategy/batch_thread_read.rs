use std::collections::HashSet;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{items_from, parse_params, CostHint, Strategy, StrategyContext, StrategyError, StrategyOutcome};
use crate::graph::OperationTag;

/// Fetches full threads for a batch of ids in one domain round trip.
pub struct BatchThreadReadStrategy;

#[derive(Debug, Default, Deserialize)]
struct ReadParams {
    #[serde(default)]
    ids: Option<Vec<String>>,
    /// Items whose threads should be read; each contributes its
    /// `thread_id`, or its own id when it has none.
    #[serde(default)]
    items: Option<Value>,
}

fn thread_ids(params: ReadParams, limit: usize) -> Vec<String> {
    let mut ids: Vec<String> = params.ids.unwrap_or_default();
    if let Some(items) = &params.items {
        ids.extend(items_from(items).into_iter().map(|i| i.thread_id.unwrap_or(i.id)));
    }

    let mut seen = HashSet::new();
    ids.retain(|id| !id.is_empty() && seen.insert(id.clone()));
    if ids.len() > limit {
        warn!(requested = ids.len(), limit, "Thread batch truncated");
        ids.truncate(limit);
    }
    ids
}

impl Strategy for BatchThreadReadStrategy {
    fn tag(&self) -> OperationTag {
        OperationTag::BatchThreadRead
    }

    fn description(&self) -> &str {
        "Read complete conversation threads for ids or for items produced by an earlier node."
    }

    fn parameter_hint(&self) -> Value {
        json!({"items": {"$ref": "n1", "path": "items"}, "ids": ["thread-id"]})
    }

    fn cost_hint(&self) -> CostHint {
        CostHint {
            tokens: 0,
            time_ms: 800,
        }
    }

    fn execute(
        &self,
        params: Value,
        ctx: StrategyContext,
    ) -> BoxFuture<'_, Result<StrategyOutcome, StrategyError>> {
        Box::pin(async move {
            let params: ReadParams = parse_params(params)?;
            let ids = thread_ids(params, ctx.settings.thread_batch_limit);
            if ids.is_empty() {
                return Ok(StrategyOutcome::free(json!({"threads": [], "count": 0})));
            }

            let threads = ctx.domain.read_threads_batch(ids).await?;
            debug!(node_id = %ctx.node_id, threads = threads.len(), "Thread batch read");
            Ok(StrategyOutcome::free(json!({
                "threads": serde_json::to_value(&threads).unwrap_or(Value::Array(vec![])),
                "count": threads.len(),
            })))
        })
    }
}
