use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::node::Node;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    #[default]
    Simple,
    Moderate,
    Complex,
}

/// What kind of request the decomposer thinks this is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub complexity: Complexity,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceEstimate {
    #[serde(default)]
    pub est_tokens: u64,
    #[serde(default)]
    pub est_cost: f64,
    #[serde(default)]
    pub est_time_ms: u64,
}

impl ResourceEstimate {
    /// Field-wise maximum of two estimates.
    pub fn at_least(self, floor: ResourceEstimate) -> Self {
        Self {
            est_tokens: self.est_tokens.max(floor.est_tokens),
            est_cost: self.est_cost.max(floor.est_cost),
            est_time_ms: self.est_time_ms.max(floor.est_time_ms),
        }
    }
}

/// The DAG of typed operations for one request. Immutable once validated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionGraph {
    #[serde(default)]
    pub classification: Classification,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_estimate: Option<ResourceEstimate>,
}

impl ExecutionGraph {
    pub fn new(kind: impl Into<String>, nodes: Vec<Node>) -> Self {
        Self {
            classification: Classification {
                kind: kind.into(),
                complexity: Complexity::Simple,
            },
            nodes,
            resource_estimate: None,
        }
    }

    pub fn with_estimate(mut self, estimate: ResourceEstimate) -> Self {
        self.resource_estimate = Some(estimate);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Nodes grouped by stage, ascending. Order within a stage follows the graph.
    pub fn stages(&self) -> BTreeMap<i64, Vec<&Node>> {
        let mut stages: BTreeMap<i64, Vec<&Node>> = BTreeMap::new();
        for node in &self.nodes {
            stages.entry(node.stage).or_default().push(node);
        }
        stages
    }

    /// Reverse adjacency: node id -> ids of nodes that list it in `dependsOn`.
    pub fn dependents(&self) -> HashMap<&str, Vec<&str>> {
        let mut map: HashMap<&str, Vec<&str>> = HashMap::new();
        for node in &self.nodes {
            for dep in &node.depends_on {
                map.entry(dep.as_str()).or_default().push(node.id.as_str());
            }
        }
        map
    }

    /// Every node that depends on `id`, directly or transitively.
    pub fn transitive_dependents(&self, id: &str) -> Vec<String> {
        let reverse = self.dependents();
        let mut seen: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([id]);
        let mut out = Vec::new();

        while let Some(current) = queue.pop_front() {
            for &next in reverse.get(current).map(Vec::as_slice).unwrap_or(&[]) {
                if seen.insert(next) {
                    out.push(next.to_string());
                    queue.push_back(next);
                }
            }
        }
        out
    }

    /// JSON schema the decomposer's structured output must satisfy.
    pub fn schema() -> Value {
        json!({
            "type": "object",
            "required": ["classification", "nodes"],
            "properties": {
                "classification": {
                    "type": "object",
                    "required": ["type", "complexity"],
                    "properties": {
                        "type": {"type": "string"},
                        "complexity": {"type": "string", "enum": ["simple", "moderate", "complex"]}
                    }
                },
                "nodes": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "required": ["id", "type", "stage"],
                        "properties": {
                            "id": {"type": "string"},
                            "type": {"type": "string"},
                            "parameters": {"type": "object"},
                            "dependsOn": {"type": "array", "items": {"type": "string"}},
                            "stage": {"type": "integer"}
                        }
                    }
                },
                "resourceEstimate": {
                    "type": "object",
                    "properties": {
                        "estTokens": {"type": "integer"},
                        "estCost": {"type": "number"},
                        "estTimeMs": {"type": "integer"}
                    }
                }
            }
        })
    }
}
