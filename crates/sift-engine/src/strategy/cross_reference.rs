use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use sift_core::types::GenerateRequest;

use super::{parse_params, CostHint, Strategy, StrategyContext, StrategyError, StrategyOutcome};
use crate::graph::OperationTag;

const RANKING_TOKENS: u32 = 512;

/// Combines, deduplicates and ranks records produced by earlier nodes.
pub struct CrossReferenceStrategy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Mode {
    Union,
    Intersection,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum RankBy {
    #[default]
    Urgency,
    Recency,
    None,
}

#[derive(Debug, Deserialize)]
struct CrossParams {
    #[serde(default)]
    items: Option<Value>,
    #[serde(default)]
    groups: Option<BTreeMap<String, Value>>,
    #[serde(default)]
    mode: Option<Mode>,
    #[serde(default)]
    rank_by: Option<RankBy>,
    #[serde(default)]
    use_model: bool,
    #[serde(default)]
    instruction: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

/// Objects carrying a string `id`, flattened out of lists and `items` wrappers.
fn records(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(values) => values.iter().flat_map(records).collect(),
        Value::Object(map) => {
            if let Some(inner) = map.get("items") {
                return records(inner);
            }
            if map.get("id").is_some_and(Value::is_string) {
                vec![value.clone()]
            } else {
                vec![]
            }
        }
        _ => vec![],
    }
}

fn id_of(record: &Value) -> &str {
    record["id"].as_str().unwrap_or_default()
}

/// Keep the first record per id, upgrading it when a later duplicate
/// carries an analysis the first one lacks.
fn dedup(all: Vec<Value>) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::new();
    for record in all {
        match out.iter_mut().find(|r| id_of(r) == id_of(&record)) {
            Some(existing) => {
                if existing.get("analysis").is_none() && record.get("analysis").is_some() {
                    *existing = record;
                }
            }
            None => out.push(record),
        }
    }
    out
}

fn urgency_rank(record: &Value) -> u8 {
    match record["analysis"]["urgency"].as_str() {
        Some("high") => 3,
        Some("medium") => 2,
        Some("low") => 1,
        _ => 0,
    }
}

fn timestamp(record: &Value) -> Option<DateTime<Utc>> {
    record["timestamp"]
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn newest_then_id(a: &Value, b: &Value) -> Ordering {
    timestamp(b)
        .cmp(&timestamp(a))
        .then_with(|| id_of(a).cmp(id_of(b)))
}

fn rank(records: &mut [Value], by: RankBy) {
    match by {
        RankBy::Urgency => records.sort_by(|a, b| {
            urgency_rank(b)
                .cmp(&urgency_rank(a))
                .then_with(|| newest_then_id(a, b))
        }),
        RankBy::Recency => records.sort_by(newest_then_id),
        RankBy::None => {}
    }
}

fn combine(params: &CrossParams) -> Result<Vec<Value>, StrategyError> {
    let mode = params.mode.unwrap_or(if params.groups.is_some() {
        Mode::Intersection
    } else {
        Mode::Union
    });

    match (mode, &params.groups, &params.items) {
        (Mode::Intersection, Some(groups), _) => {
            let sets: Vec<Vec<Value>> = groups.values().map(records).collect();
            let Some((first, rest)) = sets.split_first() else {
                return Ok(vec![]);
            };
            let keep: Vec<HashSet<&str>> = rest
                .iter()
                .map(|set| set.iter().map(id_of).collect())
                .collect();
            let shared: Vec<Value> = first
                .iter()
                .filter(|r| keep.iter().all(|ids| ids.contains(id_of(r))))
                .cloned()
                .collect();
            // Bring in richer duplicates from the other groups.
            let shared_ids: HashSet<&str> = shared.iter().map(id_of).collect();
            let mut all = shared.clone();
            for set in rest {
                all.extend(set.iter().filter(|r| shared_ids.contains(id_of(r))).cloned());
            }
            Ok(dedup(all))
        }
        (Mode::Intersection, None, _) => Err(StrategyError::InvalidParameters(
            "intersection needs `groups`".into(),
        )),
        (Mode::Union, groups, items) => {
            if groups.is_none() && items.is_none() {
                return Err(StrategyError::InvalidParameters(
                    "cross_reference needs `items` or `groups`".into(),
                ));
            }
            let mut all = items.as_ref().map(records).unwrap_or_default();
            if let Some(groups) = groups {
                all.extend(groups.values().flat_map(records));
            }
            Ok(dedup(all))
        }
    }
}

fn ranking_prompt(records: &[Value], instruction: Option<&str>) -> String {
    let mut prompt = format!(
        "Rank the following records from most to least relevant.\nCriterion: {}\n\n",
        instruction.unwrap_or("what the user should look at first")
    );
    for r in records {
        prompt.push_str(&format!(
            "- id: {} | from: {} | subject: {} | urgency: {} | summary: {}\n",
            id_of(r),
            r["sender"].as_str().unwrap_or("unknown"),
            r["subject"].as_str().unwrap_or("(none)"),
            r["analysis"]["urgency"].as_str().unwrap_or("unknown"),
            r["analysis"]["summary"].as_str().unwrap_or(""),
        ));
    }
    prompt.push_str("\nReturn every id exactly once in the `ranking` array.");
    prompt
}

/// Ask the model for an order; unknown ids are ignored and anything the
/// model left out keeps its deterministic position after the ranked ones.
async fn model_rank(
    ctx: &StrategyContext,
    records: Vec<Value>,
    instruction: Option<&str>,
) -> Result<(Vec<Value>, u64), StrategyError> {
    let schema = json!({
        "type": "object",
        "required": ["ranking"],
        "properties": {"ranking": {"type": "array", "items": {"type": "string"}}}
    });
    let request = GenerateRequest::structured(ranking_prompt(&records, instruction), schema, RANKING_TOKENS);
    let generation = ctx.model.generate(request).await?;
    let ranking: Vec<String> = generation
        .parsed
        .as_ref()
        .and_then(|p| serde_json::from_value(p["ranking"].clone()).ok())
        .unwrap_or_default();

    let mut remaining = records;
    let mut ordered = Vec::with_capacity(remaining.len());
    for id in ranking {
        if let Some(pos) = remaining.iter().position(|r| id_of(r) == id) {
            ordered.push(remaining.remove(pos));
        }
    }
    ordered.extend(remaining);
    Ok((ordered, generation.tokens_used))
}

impl Strategy for CrossReferenceStrategy {
    fn tag(&self) -> OperationTag {
        OperationTag::CrossReference
    }

    fn description(&self) -> &str {
        "Merge, intersect, deduplicate and rank results of earlier nodes; optionally rank with the language model."
    }

    fn parameter_hint(&self) -> Value {
        json!({
            "items": [{"$ref": "n3", "path": "items"}],
            "groups": {"boss": {"$ref": "n1", "path": "items"}, "budget": {"$ref": "n2", "path": "items"}},
            "mode": "union|intersection",
            "rank_by": "urgency|recency|none",
            "use_model": false,
            "instruction": "most urgent first",
            "limit": 10
        })
    }

    fn cost_hint(&self) -> CostHint {
        CostHint {
            tokens: 800,
            time_ms: 1_500,
        }
    }

    fn execute(
        &self,
        params: Value,
        ctx: StrategyContext,
    ) -> BoxFuture<'_, Result<StrategyOutcome, StrategyError>> {
        Box::pin(async move {
            let params: CrossParams = parse_params(params)?;
            let mut combined = combine(&params)?;
            let rank_by = params.rank_by.unwrap_or_default();
            rank(&mut combined, rank_by);

            let mut tokens_used = 0;
            let mut ranked_by = match rank_by {
                RankBy::Urgency => "urgency",
                RankBy::Recency => "recency",
                RankBy::None => "none",
            };
            if params.use_model && combined.len() > 1 {
                match model_rank(&ctx, combined.clone(), params.instruction.as_deref()).await {
                    Ok((ordered, tokens)) => {
                        combined = ordered;
                        tokens_used = tokens;
                        ranked_by = "model";
                    }
                    Err(e) => {
                        warn!(node_id = %ctx.node_id, error = %e, "Model ranking failed, keeping rule order");
                    }
                }
            }

            let total = combined.len();
            combined.truncate(params.limit.unwrap_or(ctx.settings.default_limit));
            debug!(node_id = %ctx.node_id, total, kept = combined.len(), ranked_by, "Cross reference done");

            Ok(StrategyOutcome {
                data: json!({
                    "items": combined,
                    "count": combined.len(),
                    "total": total,
                    "ranked_by": ranked_by,
                }),
                tokens_used,
            })
        })
    }
}
