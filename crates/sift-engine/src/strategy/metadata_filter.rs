use chrono::{DateTime, Duration, Utc};
use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use sift_core::types::{ItemSource, MetadataCriteria};

use super::{items_value, parse_params, CostHint, Strategy, StrategyContext, StrategyError, StrategyOutcome};
use crate::graph::OperationTag;

/// Structural filter over the user's items. No model calls.
pub struct MetadataFilterStrategy;

#[derive(Debug, Default, Deserialize)]
struct FilterParams {
    #[serde(default)]
    source: Option<ItemSource>,
    #[serde(default)]
    sender: Option<String>,
    #[serde(default)]
    after: Option<DateTime<Utc>>,
    #[serde(default)]
    before: Option<DateTime<Utc>>,
    /// Shorthand for `after = now - within_days`.
    #[serde(default)]
    within_days: Option<i64>,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    labels: Option<Vec<String>>,
    #[serde(default)]
    unread: Option<bool>,
    #[serde(default)]
    limit: Option<usize>,
}

impl FilterParams {
    fn into_criteria(self, now: DateTime<Utc>, default_limit: usize) -> Result<MetadataCriteria, StrategyError> {
        if let Some(days) = self.within_days {
            if days < 0 {
                return Err(StrategyError::InvalidParameters(format!(
                    "within_days must be >= 0, got {}",
                    days
                )));
            }
        }
        let after = match (self.after, self.within_days) {
            (Some(after), _) => Some(after),
            (None, Some(days)) => Some(
                Duration::try_days(days)
                    .and_then(|span| now.checked_sub_signed(span))
                    .ok_or_else(|| {
                        StrategyError::InvalidParameters(format!("within_days out of range: {}", days))
                    })?,
            ),
            (None, None) => None,
        };
        let mut labels = self.labels.unwrap_or_default();
        labels.extend(self.label);

        Ok(MetadataCriteria {
            source: self.source,
            sender: self.sender.filter(|s| !s.trim().is_empty()),
            after,
            before: self.before,
            labels,
            unread: self.unread,
            limit: Some(self.limit.unwrap_or(default_limit)),
        })
    }
}

impl Strategy for MetadataFilterStrategy {
    fn tag(&self) -> OperationTag {
        OperationTag::MetadataFilter
    }

    fn description(&self) -> &str {
        "Filter emails, events, contacts or chat messages by source, sender, date range, label and read state."
    }

    fn parameter_hint(&self) -> Value {
        json!({
            "source": "email|calendar|contact|chat",
            "sender": "dana@acme.com",
            "within_days": 7,
            "after": "RFC3339 timestamp",
            "before": "RFC3339 timestamp",
            "labels": ["INBOX"],
            "unread": true,
            "limit": 50
        })
    }

    fn cost_hint(&self) -> CostHint {
        CostHint {
            tokens: 0,
            time_ms: 300,
        }
    }

    fn execute(
        &self,
        params: Value,
        ctx: StrategyContext,
    ) -> BoxFuture<'_, Result<StrategyOutcome, StrategyError>> {
        Box::pin(async move {
            let params: FilterParams = parse_params(params)?;
            let criteria = params.into_criteria(ctx.now, ctx.settings.default_limit)?;
            let items = ctx.domain.filter_by_metadata(criteria).await?;
            debug!(node_id = %ctx.node_id, matched = items.len(), "Metadata filter done");
            Ok(StrategyOutcome::free(json!({
                "items": items_value(&items),
                "count": items.len(),
            })))
        })
    }
}
