use std::collections::HashMap;

use tracing::debug;

use sift_core::config::StrategiesConfig;
use sift_core::types::FailureClass;

use crate::graph::OperationTag;

/// Per-tag failure classification. Tags not in the table are fatal.
#[derive(Debug, Clone)]
pub struct FailurePolicy {
    classes: HashMap<OperationTag, FailureClass>,
}

impl FailurePolicy {
    /// Lookups and ranking are fatal; thread reads and model analysis are
    /// recoverable.
    pub fn defaults() -> Self {
        let classes = HashMap::from([
            (OperationTag::MetadataFilter, FailureClass::Fatal),
            (OperationTag::KeywordSearch, FailureClass::Fatal),
            (OperationTag::CrossReference, FailureClass::Fatal),
            (OperationTag::BatchThreadRead, FailureClass::Recoverable),
            (OperationTag::SemanticAnalysis, FailureClass::Recoverable),
        ]);
        Self { classes }
    }

    /// Defaults overlaid with `[strategies.failure]`.
    pub fn from_config(config: &StrategiesConfig) -> Self {
        let mut policy = Self::defaults();
        for (tag, class) in &config.failure {
            debug!(tag = %tag, class = ?class, "Failure policy override");
            policy.set(OperationTag::from(tag.as_str()), *class);
        }
        policy
    }

    pub fn set(&mut self, tag: OperationTag, class: FailureClass) {
        self.classes.insert(tag, class);
    }

    pub fn class_for(&self, tag: &OperationTag) -> FailureClass {
        self.classes.get(tag).copied().unwrap_or(FailureClass::Fatal)
    }
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self::defaults()
    }
}
