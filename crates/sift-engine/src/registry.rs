use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::graph::OperationTag;
use crate::strategy::{
    BatchThreadReadStrategy, CostHint, CrossReferenceStrategy, KeywordSearchStrategy,
    MetadataFilterStrategy, SemanticAnalysisStrategy, Strategy,
};

/// Operation tag -> strategy table, built once at startup.
pub struct StrategyRegistry {
    strategies: HashMap<OperationTag, Arc<dyn Strategy>>,
}

/// What the decomposer is told about one registered operation.
#[derive(Debug, Clone)]
pub struct OperationInfo {
    pub tag: OperationTag,
    pub description: String,
    pub parameter_hint: Value,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self {
            strategies: HashMap::new(),
        }
    }

    /// Register a strategy, replacing any previous one for the same tag.
    pub fn register(&mut self, strategy: impl Strategy) {
        self.strategies.insert(strategy.tag(), Arc::new(strategy));
    }

    pub fn get(&self, tag: &OperationTag) -> Option<Arc<dyn Strategy>> {
        self.strategies.get(tag).cloned()
    }

    pub fn contains(&self, tag: &OperationTag) -> bool {
        self.strategies.contains_key(tag)
    }

    /// Registered tags in stable (sorted) order.
    pub fn tags(&self) -> Vec<OperationTag> {
        let mut tags: Vec<_> = self.strategies.keys().cloned().collect();
        tags.sort();
        tags
    }

    pub fn operations(&self) -> Vec<OperationInfo> {
        self.tags()
            .into_iter()
            .filter_map(|tag| {
                let s = self.strategies.get(&tag)?;
                Some(OperationInfo {
                    description: s.description().to_string(),
                    parameter_hint: s.parameter_hint(),
                    tag,
                })
            })
            .collect()
    }

    /// Cost hint for a tag; unknown tags cost nothing.
    pub fn cost_hint(&self, tag: &OperationTag) -> CostHint {
        self.strategies
            .get(tag)
            .map(|s| s.cost_hint())
            .unwrap_or_default()
    }

    /// Create a registry with the five built-in strategies.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(MetadataFilterStrategy);
        registry.register(KeywordSearchStrategy);
        registry.register(BatchThreadReadStrategy);
        registry.register(SemanticAnalysisStrategy);
        registry.register(CrossReferenceStrategy);
        registry
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_registered() {
        let registry = StrategyRegistry::with_builtins();
        let tags: Vec<_> = registry.tags().iter().map(|t| t.to_string()).collect();
        assert_eq!(
            tags,
            vec![
                "metadata_filter",
                "keyword_search",
                "batch_thread_read",
                "semantic_analysis",
                "cross_reference"
            ]
        );
        assert!(registry.contains(&OperationTag::SemanticAnalysis));
        assert!(!registry.contains(&OperationTag::from("teleport")));
        assert!(registry.get(&OperationTag::from("teleport")).is_none());
    }

    #[test]
    fn test_operations_carry_descriptions_and_hints() {
        let registry = StrategyRegistry::with_builtins();
        let ops = registry.operations();
        assert_eq!(ops.len(), 5);
        assert!(ops.iter().all(|o| !o.description.is_empty()));
        assert!(ops.iter().all(|o| o.parameter_hint.is_object()));
    }

    #[test]
    fn test_cost_hints() {
        let registry = StrategyRegistry::with_builtins();
        assert_eq!(registry.cost_hint(&OperationTag::MetadataFilter).tokens, 0);
        assert!(registry.cost_hint(&OperationTag::SemanticAnalysis).tokens > 0);
        assert_eq!(registry.cost_hint(&OperationTag::from("nope")), CostHint::default());
    }
}
