use std::sync::OnceLock;

use tiktoken_rs::CoreBPE;

use sift_core::config::ConfirmationConfig;

use crate::graph::{ExecutionGraph, ResourceEstimate};
use crate::registry::StrategyRegistry;

/// Get or initialize the tokenizer for cl100k_base.
fn tokenizer() -> &'static CoreBPE {
    static TOKENIZER: OnceLock<CoreBPE> = OnceLock::new();
    TOKENIZER.get_or_init(|| {
        tiktoken_rs::cl100k_base().expect("Failed to load cl100k_base tokenizer")
    })
}

/// Token count using BPE tokenization (cl100k_base).
pub fn estimate_tokens(text: &str) -> usize {
    tokenizer().encode_ordinary(text).len()
}

/// Estimate from per-strategy cost hints. Nodes in a stage run in parallel,
/// so time is the sum over stages of the slowest node in each.
pub fn estimate_graph(
    graph: &ExecutionGraph,
    registry: &StrategyRegistry,
    cost_per_1k_tokens: f64,
) -> ResourceEstimate {
    let mut est_tokens = 0;
    let mut est_time_ms = 0;
    for nodes in graph.stages().values() {
        let mut slowest = 0;
        for node in nodes {
            let hint = registry.cost_hint(&node.op);
            est_tokens += hint.tokens;
            slowest = slowest.max(hint.time_ms);
        }
        est_time_ms += slowest;
    }

    ResourceEstimate {
        est_tokens,
        est_cost: est_tokens as f64 / 1000.0 * cost_per_1k_tokens,
        est_time_ms,
    }
}

/// Budget lines the estimate crosses; empty when it fits.
pub fn over_budget(estimate: &ResourceEstimate, limits: &ConfirmationConfig) -> Vec<String> {
    let mut reasons = Vec::new();
    if estimate.est_tokens > limits.max_tokens {
        reasons.push(format!("~{} tokens (limit {})", estimate.est_tokens, limits.max_tokens));
    }
    if estimate.est_cost > limits.max_cost {
        reasons.push(format!("~${:.2} (limit ${:.2})", estimate.est_cost, limits.max_cost));
    }
    if estimate.est_time_ms > limits.max_time_ms {
        reasons.push(format!(
            "~{:.0}s (limit {:.0}s)",
            estimate.est_time_ms as f64 / 1000.0,
            limits.max_time_ms as f64 / 1000.0
        ));
    }
    reasons
}
