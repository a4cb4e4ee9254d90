//! Bounded synthesis of node results into a natural-language answer.
//!
//! The model sees a findings summary (status plus a capped excerpt per
//! node), never the raw payloads. If the model call fails the caller still
//! gets a deterministic answer listing what succeeded and what did not.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use sift_core::config::SynthesisConfig;
use sift_core::error::SiftError;
use sift_core::traits::LanguageModel;
use sift_core::types::{GenerateRequest, NodeStatus, Preferences};

use crate::context::ExecutionContext;
use crate::estimate::estimate_tokens;
use crate::graph::ExecutionGraph;
use crate::prompts;

pub const NO_INFORMATION_MESSAGE: &str = "No information from your email, calendar, contacts or chat was needed to answer this request.";

/// Consumed once per request.
pub struct SynthesisInput<'a> {
    pub query: &'a str,
    pub graph: &'a ExecutionGraph,
    pub results: &'a ExecutionContext,
    pub preferences: &'a Preferences,
}

/// One node's contribution to the findings block.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Finding {
    pub node_id: String,
    pub operation: String,
    pub status: NodeStatus,
    /// Bounded excerpt of the node's data, or the error for failed/skipped nodes.
    pub detail: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SynthesisMetadata {
    pub fallback: bool,
    pub tokens_used: u64,
    pub elapsed_ms: u64,
    pub findings: usize,
    pub findings_tokens: usize,
}

#[derive(Debug, Clone)]
pub struct Synthesis {
    pub message: String,
    pub findings: Vec<Finding>,
    pub metadata: SynthesisMetadata,
}

pub struct Synthesizer {
    model: Arc<dyn LanguageModel>,
    config: SynthesisConfig,
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max).collect();
    format!("{}…", cut)
}

fn excerpt(data: Option<&Value>, max_chars: usize) -> String {
    let Some(data) = data else {
        return "(no data)".to_string();
    };
    let body = serde_json::to_string(data).unwrap_or_default();
    match data.get("count").and_then(Value::as_u64) {
        Some(count) => format!("{} result(s): {}", count, truncate_chars(&body, max_chars)),
        None => truncate_chars(&body, max_chars),
    }
}

/// Per-node findings in graph order. Excerpts stop being included once the
/// findings token budget is spent; statuses are always listed.
pub fn findings(graph: &ExecutionGraph, results: &ExecutionContext, config: &SynthesisConfig) -> Vec<Finding> {
    let mut spent = 0;
    let mut out = Vec::with_capacity(graph.nodes.len());

    for node in &graph.nodes {
        let Some(result) = results.get(&node.id) else {
            continue;
        };
        let detail = match result.status {
            NodeStatus::Success => {
                let text = excerpt(result.data.as_ref(), config.excerpt_chars);
                let cost = estimate_tokens(&text);
                if spent + cost > config.findings_token_budget {
                    "(details omitted to stay within budget)".to_string()
                } else {
                    spent += cost;
                    text
                }
            }
            _ => result
                .error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no detail".to_string()),
        };
        out.push(Finding {
            node_id: node.id.clone(),
            operation: node.op.to_string(),
            status: result.status,
            detail,
        });
    }
    out
}

fn render(findings: &[Finding]) -> String {
    findings
        .iter()
        .map(|f| format!("- [{}] {} ({}): {}", f.status, f.node_id, f.operation, f.detail))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Deterministic answer used when the model is unavailable.
pub fn fallback_message(findings: &[Finding]) -> String {
    let mut lines = vec!["I couldn't compose a full answer, but here is what I found:".to_string()];
    for f in findings {
        let line = match f.status {
            NodeStatus::Success => format!("- {} ({}) succeeded: {}", f.node_id, f.operation, f.detail),
            NodeStatus::Failed => format!("- {} ({}) failed: {}", f.node_id, f.operation, f.detail),
            NodeStatus::Skipped => format!("- {} ({}) was skipped: {}", f.node_id, f.operation, f.detail),
            NodeStatus::Pending => format!("- {} ({}) did not finish", f.node_id, f.operation),
        };
        lines.push(line);
    }
    lines.join("\n")
}

impl Synthesizer {
    pub fn new(model: Arc<dyn LanguageModel>, config: SynthesisConfig) -> Self {
        Self { model, config }
    }

    /// Produce the final answer. Never fails.
    pub async fn synthesize(&self, input: &SynthesisInput<'_>) -> Synthesis {
        let start = Instant::now();

        if input.graph.is_empty() {
            return Synthesis {
                message: NO_INFORMATION_MESSAGE.to_string(),
                findings: vec![],
                metadata: SynthesisMetadata::default(),
            };
        }

        let findings = findings(input.graph, input.results, &self.config);
        let block = render(&findings);
        let findings_tokens = estimate_tokens(&block);
        let request = GenerateRequest::text(
            prompts::synthesis(input.query, &block, input.preferences),
            self.config.max_tokens,
        )
        .with_system(prompts::SYNTHESIS_SYSTEM);

        let outcome = match self.model.generate(request).await {
            Ok(g) if !g.raw.trim().is_empty() => Ok(g),
            Ok(_) => Err(SiftError::Synthesis("model returned an empty answer".into())),
            Err(e) => Err(SiftError::Synthesis(e.to_string())),
        };

        let (message, tokens_used, fallback) = match outcome {
            Ok(g) => (g.raw.trim().to_string(), g.tokens_used, false),
            Err(e) => {
                warn!(error = %e, "Synthesis failed, using deterministic summary");
                (fallback_message(&findings), 0, true)
            }
        };

        let metadata = SynthesisMetadata {
            fallback,
            tokens_used,
            elapsed_ms: start.elapsed().as_millis() as u64,
            findings: findings.len(),
            findings_tokens,
        };
        info!(
            findings = metadata.findings,
            findings_tokens,
            tokens_used,
            fallback,
            "Synthesis complete"
        );
        Synthesis {
            message,
            findings,
            metadata,
        }
    }
}
