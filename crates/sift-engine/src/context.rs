use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use sift_core::error::SiftError;
use sift_core::types::{FailureClass, NodeStatus};

/// Structured error attached to a failed or skipped node, or to an aborted run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl From<&SiftError> for ErrorInfo {
    fn from(e: &SiftError) -> Self {
        Self::new(e.kind(), e.to_string())
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Terminal outcome of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResult {
    pub node_id: String,
    pub status: NodeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    /// Set on failures; decides what happens to dependents.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_class: Option<FailureClass>,
    pub tokens_used: u64,
    pub elapsed_ms: u64,
}

impl NodeResult {
    pub fn success(node_id: impl Into<String>, data: Value, tokens_used: u64, elapsed_ms: u64) -> Self {
        Self {
            node_id: node_id.into(),
            status: NodeStatus::Success,
            data: Some(data),
            error: None,
            failure_class: None,
            tokens_used,
            elapsed_ms,
        }
    }

    pub fn failed(node_id: impl Into<String>, error: ErrorInfo, class: FailureClass, elapsed_ms: u64) -> Self {
        Self {
            node_id: node_id.into(),
            status: NodeStatus::Failed,
            data: None,
            error: Some(error),
            failure_class: Some(class),
            tokens_used: 0,
            elapsed_ms,
        }
    }

    pub fn skipped(node_id: impl Into<String>, reason: ErrorInfo) -> Self {
        Self {
            node_id: node_id.into(),
            status: NodeStatus::Skipped,
            data: None,
            error: Some(reason),
            failure_class: None,
            tokens_used: 0,
            elapsed_ms: 0,
        }
    }

    pub fn is_fatal_failure(&self) -> bool {
        self.status == NodeStatus::Failed && self.failure_class == Some(FailureClass::Fatal)
    }
}

/// Append-only result store for one coordinator run.
///
/// Each node id has exactly one writer; recording a second result for the
/// same id is a scheduler bug and panics.
#[derive(Debug, Default)]
pub struct ExecutionContext {
    results: HashMap<String, NodeResult>,
    order: Vec<String>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, result: NodeResult) {
        if self.results.contains_key(&result.node_id) {
            panic!("NodeResult for '{}' written twice", result.node_id);
        }
        assert!(result.status.is_terminal(), "only terminal results are recorded");
        self.order.push(result.node_id.clone());
        self.results.insert(result.node_id.clone(), result);
    }

    pub fn get(&self, node_id: &str) -> Option<&NodeResult> {
        self.results.get(node_id)
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.results.contains_key(node_id)
    }

    /// Results in the order they were recorded.
    pub fn results(&self) -> impl Iterator<Item = &NodeResult> {
        self.order.iter().filter_map(|id| self.results.get(id))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Data of the given dependencies that succeeded. Dependencies that
    /// failed or were skipped are absent, so references to them resolve to null.
    pub fn available_data<'a>(&'a self, deps: &'a [String]) -> HashMap<&'a str, &'a Value> {
        deps.iter()
            .filter_map(|id| {
                let result = self.results.get(id)?;
                match (&result.status, &result.data) {
                    (NodeStatus::Success, Some(data)) => Some((id.as_str(), data)),
                    _ => None,
                }
            })
            .collect()
    }

    pub fn count(&self, status: NodeStatus) -> usize {
        self.results.values().filter(|r| r.status == status).count()
    }

    pub fn total_tokens(&self) -> u64 {
        self.results.values().map(|r| r.tokens_used).sum()
    }

    pub fn fatal_failures(&self) -> Vec<&NodeResult> {
        self.results().filter(|r| r.is_fatal_failure()).collect()
    }
}
