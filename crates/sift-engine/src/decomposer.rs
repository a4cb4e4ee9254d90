use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use sift_core::config::DecomposerConfig;
use sift_core::error::{Result, SiftError};
use sift_core::traits::LanguageModel;
use sift_core::types::{ConversationTurn, GenerateRequest, UserContext};

use crate::graph::{ExecutionGraph, GraphValidator};
use crate::prompts::{self, PlanningPrompt};
use crate::registry::StrategyRegistry;

const MAX_ATTEMPTS: usize = 2;

/// Input to one decomposition.
pub struct PlanRequest<'a> {
    pub query: &'a str,
    /// Already trimmed to the configured number of turns.
    pub history: &'a [ConversationTurn],
    pub user: &'a UserContext,
    pub now: DateTime<Utc>,
    /// Failure summary from a previous execution, when re-planning.
    pub failures: Option<&'a [String]>,
}

#[derive(Debug, Clone)]
pub struct Decomposition {
    pub graph: ExecutionGraph,
    pub tokens_used: u64,
    pub attempts: usize,
}

/// Why an attempt was rejected.
enum Rejection {
    Parse(String),
    Validation(String),
}

impl Rejection {
    fn message(&self) -> &str {
        match self {
            Self::Parse(m) | Self::Validation(m) => m,
        }
    }
}

/// Turns a request into a validated execution graph with one structured
/// model call, plus one error-correction retry.
pub struct Decomposer {
    model: Arc<dyn LanguageModel>,
    registry: Arc<StrategyRegistry>,
    config: DecomposerConfig,
}

impl Decomposer {
    pub fn new(model: Arc<dyn LanguageModel>, registry: Arc<StrategyRegistry>, config: DecomposerConfig) -> Self {
        Self {
            model,
            registry,
            config,
        }
    }

    pub async fn decompose(&self, request: &PlanRequest<'_>) -> Result<Decomposition> {
        let operations = self.registry.operations();
        let mut base = PlanningPrompt {
            query: request.query,
            history: request.history,
            user: request.user,
            now: request.now,
            operations: &operations,
        }
        .render();
        if let Some(failures) = request.failures {
            base.push_str(&prompts::replan_note(failures));
        }

        let validator = GraphValidator::new(&self.registry);
        let mut tokens_used = 0;
        let mut last: Option<Rejection> = None;

        for attempt in 1..=MAX_ATTEMPTS {
            let prompt = match &last {
                Some(rejection) => format!("{}{}", base, prompts::correction(rejection.message())),
                None => base.clone(),
            };
            let model_request = GenerateRequest::structured(prompt, ExecutionGraph::schema(), self.config.max_tokens)
                .with_system(prompts::PLANNER_SYSTEM);

            let generation = match self.model.generate(model_request).await {
                Ok(g) => g,
                Err(e @ (SiftError::LlmParse(_) | SiftError::SchemaMismatch(_))) => {
                    warn!(attempt, error = %e, "Plan output rejected");
                    last = Some(Rejection::Parse(e.to_string()));
                    continue;
                }
                Err(e) => {
                    // Transport failures were already retried by the client.
                    return Err(SiftError::Decomposition {
                        attempts: attempt,
                        message: e.to_string(),
                    });
                }
            };
            tokens_used += generation.tokens_used;

            let graph = match generation
                .parsed
                .ok_or_else(|| "model returned no structured output".to_string())
                .and_then(|v| serde_json::from_value::<ExecutionGraph>(v).map_err(|e| e.to_string()))
            {
                Ok(graph) => graph,
                Err(e) => {
                    warn!(attempt, error = %e, "Plan does not decode as a graph");
                    last = Some(Rejection::Parse(e));
                    continue;
                }
            };

            if let Err(e) = validator.validate(&graph) {
                warn!(attempt, error = %e, "Plan failed validation");
                last = Some(Rejection::Validation(e.to_string()));
                continue;
            }

            info!(
                attempt,
                nodes = graph.nodes.len(),
                stages = graph.stages().len(),
                kind = %graph.classification.kind,
                "Plan accepted"
            );
            return Ok(Decomposition {
                graph,
                tokens_used,
                attempts: attempt,
            });
        }

        Err(match last {
            Some(Rejection::Validation(message)) => SiftError::GraphValidation(message),
            Some(Rejection::Parse(message)) => SiftError::Decomposition {
                attempts: MAX_ATTEMPTS,
                message,
            },
            None => SiftError::Decomposition {
                attempts: MAX_ATTEMPTS,
                message: "no attempt made".into(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sift_test_utils::{fixed_now, FailingModel, ScriptedModel};

    use crate::graph::OperationTag;

    fn plan_json() -> String {
        json!({
            "classification": {"type": "triage", "complexity": "moderate"},
            "nodes": [
                {"id": "n1", "type": "metadata_filter", "parameters": {"sender": "dana@acme.com"}, "dependsOn": [], "stage": 0},
                {"id": "n2", "type": "semantic_analysis",
                 "parameters": {"items": {"$ref": "n1", "path": "items"}},
                 "dependsOn": ["n1"], "stage": 1}
            ]
        })
        .to_string()
    }

    fn decomposer(model: Arc<dyn LanguageModel>) -> Decomposer {
        Decomposer::new(
            model,
            Arc::new(StrategyRegistry::with_builtins()),
            DecomposerConfig::default(),
        )
    }

    fn request<'a>(user: &'a UserContext) -> PlanRequest<'a> {
        PlanRequest {
            query: "urgent emails from my boss",
            history: &[],
            user,
            now: fixed_now(),
            failures: None,
        }
    }

    #[tokio::test]
    async fn test_first_attempt_accepted() {
        let model = Arc::new(ScriptedModel::new([plan_json()]));
        let user = UserContext::default();
        let out = decomposer(model.clone()).decompose(&request(&user)).await.unwrap();

        assert_eq!(out.attempts, 1);
        assert_eq!(out.tokens_used, 10);
        assert_eq!(out.graph.nodes[1].op, OperationTag::SemanticAnalysis);
        let req = &model.requests()[0];
        assert!(req.schema.is_some());
        assert_eq!(req.system.as_deref(), Some(prompts::PLANNER_SYSTEM));
        assert!(req.prompt.contains("urgent emails from my boss"));
    }

    #[tokio::test]
    async fn test_retries_once_with_error_in_prompt() {
        let model = Arc::new(ScriptedModel::new(["not json at all".to_string(), plan_json()]));
        let user = UserContext::default();
        let out = decomposer(model.clone()).decompose(&request(&user)).await.unwrap();

        assert_eq!(out.attempts, 2);
        let prompts = model.prompts();
        assert!(!prompts[0].contains("previous plan was rejected"));
        assert!(prompts[1].contains("previous plan was rejected"));
    }

    #[tokio::test]
    async fn test_malformed_twice_is_decomposition_error() {
        let model = Arc::new(ScriptedModel::new(["{oops", "still not json"]));
        let user = UserContext::default();
        let err = decomposer(model.clone()).decompose(&request(&user)).await.unwrap_err();

        assert!(matches!(err, SiftError::Decomposition { attempts: 2, .. }));
        assert_eq!(err.kind(), "decomposition_error");
        assert_eq!(model.calls(), 2);
    }

    #[tokio::test]
    async fn test_invalid_graph_twice_is_validation_error() {
        let bad = json!({
            "classification": {"type": "x", "complexity": "simple"},
            "nodes": [{"id": "n1", "type": "teleport", "parameters": {}, "dependsOn": [], "stage": 0}]
        })
        .to_string();
        let model = Arc::new(ScriptedModel::new([bad.clone(), bad]));
        let user = UserContext::default();
        let err = decomposer(model.clone()).decompose(&request(&user)).await.unwrap_err();

        match err {
            SiftError::GraphValidation(msg) => assert!(msg.contains("teleport")),
            other => panic!("expected GraphValidation, got {:?}", other),
        }
        assert!(model.prompts()[1].contains("registered_operation"));
    }

    #[tokio::test]
    async fn test_orphan_cross_reference_is_corrected() {
        let orphan = json!({
            "classification": {"type": "triage", "complexity": "simple"},
            "nodes": [{
                "id": "n1",
                "type": "cross_reference",
                "parameters": {"items": [{"id": "m1"}]},
                "dependsOn": [],
                "stage": 0
            }]
        })
        .to_string();
        let model = Arc::new(ScriptedModel::new([orphan, plan_json()]));
        let user = UserContext::default();
        let out = decomposer(model.clone()).decompose(&request(&user)).await.unwrap();

        assert_eq!(out.attempts, 2);
        assert!(model.prompts()[1].contains("cross_reference_needs_dependency"));
    }

    #[tokio::test]
    async fn test_transport_failure_is_not_retried() {
        let model = Arc::new(FailingModel::new("connection refused"));
        let user = UserContext::default();
        let err = decomposer(model.clone()).decompose(&request(&user)).await.unwrap_err();
        assert!(matches!(err, SiftError::Decomposition { attempts: 1, .. }));
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test]
    async fn test_replan_note_is_included() {
        let model = Arc::new(ScriptedModel::new([plan_json()]));
        let user = UserContext::default();
        let failures = vec!["n1 (keyword_search): domain_error: index offline".to_string()];
        let req = PlanRequest {
            failures: Some(&failures),
            ..request(&user)
        };
        decomposer(model.clone()).decompose(&req).await.unwrap();
        assert!(model.prompts()[0].contains("index offline"));
    }
}
