use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::param::{Param, Reference};

/// Operation type of a node. The five built-ins have dedicated variants;
/// anything else is kept verbatim so custom strategies can be registered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum OperationTag {
    MetadataFilter,
    KeywordSearch,
    BatchThreadRead,
    SemanticAnalysis,
    CrossReference,
    Other(String),
}

impl OperationTag {
    pub fn as_str(&self) -> &str {
        match self {
            Self::MetadataFilter => "metadata_filter",
            Self::KeywordSearch => "keyword_search",
            Self::BatchThreadRead => "batch_thread_read",
            Self::SemanticAnalysis => "semantic_analysis",
            Self::CrossReference => "cross_reference",
            Self::Other(s) => s,
        }
    }
}

impl From<String> for OperationTag {
    fn from(s: String) -> Self {
        match s.as_str() {
            "metadata_filter" => Self::MetadataFilter,
            "keyword_search" => Self::KeywordSearch,
            "batch_thread_read" => Self::BatchThreadRead,
            "semantic_analysis" => Self::SemanticAnalysis,
            "cross_reference" => Self::CrossReference,
            _ => Self::Other(s),
        }
    }
}

impl From<&str> for OperationTag {
    fn from(s: &str) -> Self {
        Self::from(s.to_string())
    }
}

impl From<OperationTag> for String {
    fn from(tag: OperationTag) -> Self {
        tag.as_str().to_string()
    }
}

impl std::fmt::Display for OperationTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One typed operation in an execution graph.
///
/// `stage` is signed on purpose so a negative stage from the model survives
/// parsing and is reported by the validator instead of a serde error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: String,
    #[serde(rename = "type")]
    pub op: OperationTag,
    #[serde(default)]
    pub parameters: BTreeMap<String, Param>,
    #[serde(default, alias = "depends_on")]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub stage: i64,
}

impl Node {
    pub fn new(id: impl Into<String>, op: impl Into<OperationTag>, stage: i64) -> Self {
        Self {
            id: id.into(),
            op: op.into(),
            parameters: BTreeMap::new(),
            depends_on: vec![],
            stage,
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Param>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_depends_on(mut self, ids: &[&str]) -> Self {
        self.depends_on = ids.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Every deferred reference in this node's parameters.
    pub fn references(&self) -> Vec<&Reference> {
        let mut refs = Vec::new();
        for param in self.parameters.values() {
            param.collect_refs(&mut refs);
        }
        refs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tag_round_trips_through_strings() {
        assert_eq!(OperationTag::from("semantic_analysis"), OperationTag::SemanticAnalysis);
        assert_eq!(
            OperationTag::from("calendar_lookup"),
            OperationTag::Other("calendar_lookup".into())
        );
        assert_eq!(
            serde_json::to_value(OperationTag::CrossReference).unwrap(),
            json!("cross_reference")
        );
    }

    #[test]
    fn test_node_from_wire_json() {
        let node: Node = serde_json::from_value(json!({
            "id": "n3",
            "type": "semantic_analysis",
            "parameters": {
                "items": [{"$ref": "n1", "path": "items"}, {"$ref": "n2", "path": "items"}],
                "focus": "urgency"
            },
            "dependsOn": ["n1", "n2"],
            "stage": 1
        }))
        .unwrap();

        assert_eq!(node.op, OperationTag::SemanticAnalysis);
        assert_eq!(node.depends_on, vec!["n1", "n2"]);
        let refs: Vec<_> = node.references().iter().map(|r| r.node.clone()).collect();
        assert_eq!(refs, vec!["n1", "n2"]);
    }

    #[test]
    fn test_node_defaults() {
        let node: Node = serde_json::from_value(json!({"id": "a", "type": "keyword_search"})).unwrap();
        assert_eq!(node.stage, 0);
        assert!(node.depends_on.is_empty());
        assert!(node.parameters.is_empty());
    }
}
