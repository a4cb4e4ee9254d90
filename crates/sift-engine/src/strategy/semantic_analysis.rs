//! Per-item intent/urgency/sentiment classification, one model call per batch.
//!
//! Batches run concurrently up to `semantic_concurrency`. A failed batch
//! leaves its items without an `analysis` field; the node only fails when
//! every batch fails.

use futures::future::BoxFuture;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use sift_core::types::{GenerateRequest, Item};

use super::{items_from, parse_params, CostHint, Strategy, StrategyContext, StrategyError, StrategyOutcome};
use crate::graph::OperationTag;

const BODY_CHARS: usize = 400;
const TOKENS_PER_BATCH: u32 = 1024;

pub struct SemanticAnalysisStrategy;

#[derive(Debug, Default, Deserialize)]
struct AnalysisParams {
    #[serde(default)]
    items: Option<Value>,
    #[serde(default)]
    focus: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct Verdict {
    id: String,
    intent: String,
    urgency: String,
    sentiment: String,
    #[serde(default)]
    summary: String,
}

fn batch_schema() -> Value {
    json!({
        "type": "object",
        "required": ["results"],
        "properties": {
            "results": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["id", "intent", "urgency", "sentiment"],
                    "properties": {
                        "id": {"type": "string"},
                        "intent": {"type": "string"},
                        "urgency": {"type": "string", "enum": ["low", "medium", "high"]},
                        "sentiment": {"type": "string", "enum": ["negative", "neutral", "positive"]},
                        "summary": {"type": "string"}
                    }
                }
            }
        }
    })
}

fn batch_prompt(items: &[Item], focus: Option<&str>) -> String {
    let mut prompt = String::from(
        "Classify each message below. For every message give its intent (a short phrase), \
         urgency (low, medium or high), sentiment (negative, neutral or positive) and a \
         one-sentence summary. Use the message id exactly as given.\n",
    );
    if let Some(focus) = focus {
        prompt.push_str(&format!("Pay particular attention to: {}\n", focus));
    }
    prompt.push_str("\n## Messages\n");
    for item in items {
        let body: String = item
            .body
            .as_deref()
            .or(item.snippet.as_deref())
            .unwrap_or("")
            .chars()
            .take(BODY_CHARS)
            .collect();
        prompt.push_str(&format!(
            "\n[id: {}] from: {} | subject: {} | at: {}\n{}\n",
            item.id,
            item.sender.as_deref().unwrap_or("unknown"),
            item.subject.as_deref().unwrap_or("(none)"),
            item.timestamp.to_rfc3339(),
            body
        ));
    }
    prompt
}

async fn analyze_batch(
    ctx: StrategyContext,
    batch: Vec<Item>,
    focus: Option<String>,
) -> Result<(Vec<Verdict>, u64), StrategyError> {
    let request = GenerateRequest::structured(
        batch_prompt(&batch, focus.as_deref()),
        batch_schema(),
        TOKENS_PER_BATCH,
    );
    let generation = ctx.model.generate(request).await?;
    let parsed = generation
        .parsed
        .ok_or_else(|| StrategyError::Model("structured response missing".into()))?;
    let verdicts: Vec<Verdict> = serde_json::from_value(parsed["results"].clone())
        .map_err(|e| StrategyError::Model(e.to_string()))?;
    Ok((verdicts, generation.tokens_used))
}

impl Strategy for SemanticAnalysisStrategy {
    fn tag(&self) -> OperationTag {
        OperationTag::SemanticAnalysis
    }

    fn description(&self) -> &str {
        "Classify intent, urgency and sentiment of items from earlier nodes using the language model."
    }

    fn parameter_hint(&self) -> Value {
        json!({
            "items": [{"$ref": "n1", "path": "items"}, {"$ref": "n2", "path": "items"}],
            "focus": "what needs a reply today"
        })
    }

    fn cost_hint(&self) -> CostHint {
        CostHint {
            tokens: 4_000,
            time_ms: 4_000,
        }
    }

    fn execute(
        &self,
        params: Value,
        ctx: StrategyContext,
    ) -> BoxFuture<'_, Result<StrategyOutcome, StrategyError>> {
        Box::pin(async move {
            let params: AnalysisParams = parse_params(params)?;
            let items = params.items.as_ref().map(items_from).unwrap_or_default();
            if items.is_empty() {
                return Ok(StrategyOutcome::free(json!({"items": [], "count": 0, "analyzed": 0})));
            }

            let batch_size = ctx.settings.semantic_batch_size.max(1);
            let concurrency = ctx.settings.semantic_concurrency.max(1);
            // Owned batches keep the stream future Send.
            let batches: Vec<Vec<Item>> = items.chunks(batch_size).map(<[Item]>::to_vec).collect();
            let batch_count = batches.len();

            let results: Vec<Result<(Vec<Verdict>, u64), StrategyError>> = futures::stream::iter(batches)
                .map(|batch| analyze_batch(ctx.clone(), batch, params.focus.clone()))
                .buffered(concurrency)
                .collect()
                .await;

            let mut verdicts = Vec::new();
            let mut tokens_used = 0;
            let mut failed = Vec::new();
            for result in results {
                match result {
                    Ok((batch_verdicts, tokens)) => {
                        verdicts.extend(batch_verdicts);
                        tokens_used += tokens;
                    }
                    Err(e) => {
                        warn!(node_id = %ctx.node_id, error = %e, "Semantic batch failed");
                        failed.push(e);
                    }
                }
            }
            if failed.len() == batch_count {
                return Err(failed
                    .pop()
                    .unwrap_or_else(|| StrategyError::Model("no batches ran".into())));
            }

            let mut analyzed = 0;
            let enriched: Vec<Value> = items
                .iter()
                .map(|item| {
                    let mut value = serde_json::to_value(item).unwrap_or(Value::Null);
                    if let Some(v) = verdicts.iter().find(|v| v.id == item.id) {
                        analyzed += 1;
                        value["analysis"] = json!({
                            "intent": v.intent,
                            "urgency": v.urgency,
                            "sentiment": v.sentiment,
                            "summary": v.summary,
                        });
                    }
                    value
                })
                .collect();

            debug!(
                node_id = %ctx.node_id,
                items = enriched.len(),
                analyzed,
                failed_batches = failed.len(),
                tokens_used,
                "Semantic analysis done"
            );
            Ok(StrategyOutcome {
                data: json!({
                    "items": enriched,
                    "count": items.len(),
                    "analyzed": analyzed,
                    "failed_batches": failed.len(),
                }),
                tokens_used,
            })
        })
    }
}
