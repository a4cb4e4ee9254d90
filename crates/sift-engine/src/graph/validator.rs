use std::collections::{HashMap, HashSet};

use sift_core::error::{Result, SiftError};

use super::node::OperationTag;
use super::plan::ExecutionGraph;
use crate::registry::StrategyRegistry;

/// Structural rules, checked in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    UniqueIds,
    DependencyExists,
    StageOrder,
    RegisteredOperation,
    ReferenceInDependsOn,
    CrossReferenceNeedsDependency,
}

impl Rule {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UniqueIds => "unique_ids",
            Self::DependencyExists => "dependency_exists",
            Self::StageOrder => "stage_order",
            Self::RegisteredOperation => "registered_operation",
            Self::ReferenceInDependsOn => "reference_in_depends_on",
            Self::CrossReferenceNeedsDependency => "cross_reference_needs_dependency",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub node_id: String,
    pub rule: Rule,
    pub detail: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node '{}' [{}]: {}", self.node_id, self.rule.as_str(), self.detail)
    }
}

/// Checks a proposed graph against the registry it will run on.
pub struct GraphValidator<'a> {
    registry: &'a StrategyRegistry,
}

impl<'a> GraphValidator<'a> {
    pub fn new(registry: &'a StrategyRegistry) -> Self {
        Self { registry }
    }

    /// All violations, grouped by rule in check order.
    pub fn check(&self, graph: &ExecutionGraph) -> Vec<Violation> {
        let mut violations = Vec::new();

        // 1. Unique ids
        let mut seen = HashSet::new();
        for node in &graph.nodes {
            if !seen.insert(node.id.as_str()) {
                violations.push(Violation {
                    node_id: node.id.clone(),
                    rule: Rule::UniqueIds,
                    detail: "duplicate node id".into(),
                });
            }
        }

        // First occurrence wins for stage lookups below.
        let mut stages: HashMap<&str, i64> = HashMap::new();
        for node in &graph.nodes {
            stages.entry(node.id.as_str()).or_insert(node.stage);
        }

        // 2. Dependencies exist
        for node in &graph.nodes {
            for dep in &node.depends_on {
                if !stages.contains_key(dep.as_str()) {
                    violations.push(Violation {
                        node_id: node.id.clone(),
                        rule: Rule::DependencyExists,
                        detail: format!("depends on unknown node '{}'", dep),
                    });
                }
            }
        }

        // 3. Stage order
        for node in &graph.nodes {
            if node.stage < 0 {
                violations.push(Violation {
                    node_id: node.id.clone(),
                    rule: Rule::StageOrder,
                    detail: format!("negative stage {}", node.stage),
                });
            }
            for dep in &node.depends_on {
                if let Some(&dep_stage) = stages.get(dep.as_str()) {
                    if dep_stage >= node.stage {
                        violations.push(Violation {
                            node_id: node.id.clone(),
                            rule: Rule::StageOrder,
                            detail: format!(
                                "dependency '{}' is at stage {}, not below {}",
                                dep, dep_stage, node.stage
                            ),
                        });
                    }
                }
            }
        }

        // 4. Registered operations
        for node in &graph.nodes {
            if !self.registry.contains(&node.op) {
                violations.push(Violation {
                    node_id: node.id.clone(),
                    rule: Rule::RegisteredOperation,
                    detail: format!("unknown operation '{}'", node.op),
                });
            }
        }

        // 5. References stay within dependsOn
        for node in &graph.nodes {
            for reference in node.references() {
                if !node.depends_on.iter().any(|d| d == &reference.node) {
                    violations.push(Violation {
                        node_id: node.id.clone(),
                        rule: Rule::ReferenceInDependsOn,
                        detail: format!("references '{}' which is not in dependsOn", reference.node),
                    });
                }
            }
        }

        // 6. cross_reference combines earlier results
        for node in &graph.nodes {
            if node.op == OperationTag::CrossReference && node.depends_on.is_empty() {
                violations.push(Violation {
                    node_id: node.id.clone(),
                    rule: Rule::CrossReferenceNeedsDependency,
                    detail: "cross_reference must depend on at least one node".into(),
                });
            }
        }

        violations
    }

    pub fn validate(&self, graph: &ExecutionGraph) -> Result<()> {
        let violations = self.check(graph);
        if violations.is_empty() {
            return Ok(());
        }
        let message = violations
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        Err(SiftError::GraphValidation(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::node::{Node, OperationTag};
    use crate::graph::param::Param;

    fn registry() -> StrategyRegistry {
        StrategyRegistry::with_builtins()
    }

    fn graph(nodes: Vec<Node>) -> ExecutionGraph {
        ExecutionGraph::new("test", nodes)
    }

    #[test]
    fn test_accepts_well_formed_graph() {
        let g = graph(vec![
            Node::new("a", OperationTag::MetadataFilter, 0),
            Node::new("b", OperationTag::SemanticAnalysis, 1)
                .with_depends_on(&["a"])
                .with_param("items", Param::reference("a", "items")),
        ]);
        let reg = registry();
        assert!(GraphValidator::new(&reg).check(&g).is_empty());
        assert!(GraphValidator::new(&reg).validate(&g).is_ok());
    }

    #[test]
    fn test_empty_graph_is_valid() {
        let reg = registry();
        assert!(GraphValidator::new(&reg).validate(&ExecutionGraph::default()).is_ok());
    }

    #[test]
    fn test_collects_every_violation_in_rule_order() {
        let g = graph(vec![
            Node::new("a", OperationTag::MetadataFilter, 0),
            Node::new("a", OperationTag::KeywordSearch, 0),
            Node::new("b", OperationTag::SemanticAnalysis, 1).with_depends_on(&["ghost"]),
            Node::new("c", OperationTag::CrossReference, 1).with_depends_on(&["a", "b"]),
            Node::new("d", "teleport", -1),
            Node::new("e", OperationTag::SemanticAnalysis, 2)
                .with_depends_on(&["c"])
                .with_param("items", Param::reference("a", "items")),
        ]);
        let reg = registry();
        let violations = GraphValidator::new(&reg).check(&g);
        let rules: Vec<_> = violations.iter().map(|v| (v.node_id.as_str(), v.rule)).collect();

        assert_eq!(
            rules,
            vec![
                ("a", Rule::UniqueIds),
                ("b", Rule::DependencyExists),
                ("c", Rule::StageOrder),
                ("d", Rule::StageOrder),
                ("d", Rule::RegisteredOperation),
                ("e", Rule::ReferenceInDependsOn),
            ]
        );
    }

    #[test]
    fn test_self_dependency_is_a_stage_violation() {
        let g = graph(vec![Node::new("a", OperationTag::KeywordSearch, 0).with_depends_on(&["a"])]);
        let reg = registry();
        let violations = GraphValidator::new(&reg).check(&g);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].rule, Rule::StageOrder);
    }

    #[test]
    fn test_accepted_graphs_have_strictly_lower_dependency_stages() {
        let g = graph(vec![
            Node::new("a", OperationTag::MetadataFilter, 0),
            Node::new("b", OperationTag::MetadataFilter, 0),
            Node::new("c", OperationTag::SemanticAnalysis, 1).with_depends_on(&["a", "b"]),
            Node::new("d", OperationTag::CrossReference, 3).with_depends_on(&["a", "c"]),
        ]);
        let reg = registry();
        assert!(GraphValidator::new(&reg).check(&g).is_empty());
        for node in &g.nodes {
            for dep in &node.depends_on {
                assert!(g.node(dep).unwrap().stage < node.stage);
            }
        }
    }

    #[test]
    fn test_cross_reference_without_dependency_is_rejected() {
        let g = graph(vec![Node::new("c", OperationTag::CrossReference, 0)
            .with_param("items", serde_json::json!([{"id": "m1"}]))]);
        let reg = registry();
        let violations = GraphValidator::new(&reg).check(&g);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].node_id, "c");
        assert_eq!(violations[0].rule, Rule::CrossReferenceNeedsDependency);

        let err = GraphValidator::new(&reg).validate(&g).unwrap_err();
        assert!(err.to_string().contains("cross_reference_needs_dependency"));
    }

    #[test]
    fn test_validate_reports_graph_validation_error() {
        let g = graph(vec![Node::new("a", "teleport", 0)]);
        let reg = registry();
        match GraphValidator::new(&reg).validate(&g).unwrap_err() {
            SiftError::GraphValidation(msg) => {
                assert!(msg.contains("node 'a' [registered_operation]"));
            }
            other => panic!("expected GraphValidation, got {:?}", other),
        }
    }
}
