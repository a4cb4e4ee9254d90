//! Request lifecycle: plan, gate, execute, synthesize.
//!
//! `Planning → (AwaitingConfirmation) → Executing → Synthesizing → Done`,
//! with `Aborted` reachable from every non-terminal phase. Confirmation is
//! stateless: an over-budget plan is handed back to the caller as a
//! [`PendingPlan`], and the caller re-invokes [`Orchestrator::run`] with it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use sift_core::config::{AppConfig, EngineConfig};
use sift_core::error::{Result, SiftError};
use sift_core::event::EventBus;
use sift_core::traits::{DomainService, LanguageModel};
use sift_core::types::{
    ConversationTurn, EngineEvent, NodeStatus, Preferences, RequestId, RunStatus, UserContext,
};

use crate::context::{ErrorInfo, ExecutionContext};
use crate::coordinator::{ExecutionCoordinator, RunControl};
use crate::decomposer::{Decomposer, Decomposition, PlanRequest};
use crate::estimate::{estimate_graph, over_budget};
use crate::graph::{ExecutionGraph, GraphValidator, ResourceEstimate};
use crate::policy::FailurePolicy;
use crate::registry::StrategyRegistry;
use crate::synthesizer::{SynthesisInput, Synthesizer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Planning,
    AwaitingConfirmation,
    Executing,
    Synthesizing,
    Done,
    Aborted,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::AwaitingConfirmation => "awaiting_confirmation",
            Self::Executing => "executing",
            Self::Synthesizing => "synthesizing",
            Self::Done => "done",
            Self::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Aborted)
    }

    pub fn can_transition(&self, to: Phase) -> bool {
        use Phase::*;
        match (self, to) {
            (Done | Aborted, _) => false,
            (_, Aborted) => true,
            (Planning, AwaitingConfirmation | Executing) => true,
            (AwaitingConfirmation, Executing) => true,
            (Executing, Synthesizing | Planning) => true,
            (Synthesizing, Done) => true,
            _ => false,
        }
    }

    pub fn transition(self, to: Phase) -> Result<Phase> {
        if self.can_transition(to) {
            Ok(to)
        } else {
            Err(SiftError::InvalidTransition {
                from: self.as_str().to_string(),
                to: to.as_str().to_string(),
            })
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated plan waiting for the caller's go-ahead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingPlan {
    pub id: String,
    pub query: String,
    pub graph: ExecutionGraph,
    pub issued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub query: String,
    pub history: Vec<ConversationTurn>,
    pub user: UserContext,
    pub confirmed: bool,
    pub pending: Option<PendingPlan>,
    /// Overrides the configured preferences for this request.
    pub preferences: Option<Preferences>,
    /// Fixed clock for the run; `Utc::now()` when unset.
    pub now: Option<DateTime<Utc>>,
}

impl RunRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    pub fn with_history(mut self, history: Vec<ConversationTurn>) -> Self {
        self.history = history;
        self
    }

    pub fn with_user(mut self, user: UserContext) -> Self {
        self.user = user;
        self
    }

    pub fn with_preferences(mut self, preferences: Preferences) -> Self {
        self.preferences = Some(preferences);
        self
    }

    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = Some(now);
        self
    }

    /// Proceed regardless of the budget gate. Without a pending plan the
    /// request is planned afresh.
    pub fn confirmed(mut self) -> Self {
        self.confirmed = true;
        self
    }

    /// Execute a previously returned plan as-is.
    pub fn confirm(mut self, plan: PendingPlan) -> Self {
        self.query = plan.query.clone();
        self.confirmed = true;
        self.pending = Some(plan);
        self
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunMetadata {
    pub tokens_used: u64,
    pub elapsed_ms: u64,
    pub plan_attempts: usize,
    pub nodes: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub replans: usize,
    pub synthesis_fallback: bool,
    pub estimate: Option<ResourceEstimate>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub request_id: RequestId,
    pub status: RunStatus,
    pub message: Option<String>,
    pub plan: Option<PendingPlan>,
    pub error: Option<ErrorInfo>,
    pub metadata: RunMetadata,
}

/// Per-request bookkeeping. Nothing here outlives one `run` call.
struct Run {
    request_id: RequestId,
    phase: Phase,
    started: Instant,
    metadata: RunMetadata,
}

impl Run {
    fn new(phase: Phase) -> Self {
        Self {
            request_id: RequestId::new(),
            phase,
            started: Instant::now(),
            metadata: RunMetadata::default(),
        }
    }

    fn advance(&mut self, to: Phase) -> Result<()> {
        let next = self.phase.transition(to)?;
        debug!(request_id = %self.request_id, from = %self.phase, to = %next, "Phase change");
        self.phase = next;
        Ok(())
    }

    fn finish(mut self, status: RunStatus, message: Option<String>, plan: Option<PendingPlan>, error: Option<ErrorInfo>) -> RunOutcome {
        self.metadata.elapsed_ms = self.started.elapsed().as_millis() as u64;
        RunOutcome {
            request_id: self.request_id,
            status,
            message,
            plan,
            error,
            metadata: self.metadata,
        }
    }
}

/// The engine. Built once with its collaborators and shared across requests.
pub struct Orchestrator {
    registry: Arc<StrategyRegistry>,
    decomposer: Decomposer,
    coordinator: ExecutionCoordinator,
    synthesizer: Synthesizer,
    engine: EngineConfig,
    cost_per_1k_tokens: f64,
    preferences: Preferences,
    events: Arc<EventBus>,
}

impl Orchestrator {
    pub fn new(
        config: &AppConfig,
        model: Arc<dyn LanguageModel>,
        domain: Arc<dyn DomainService>,
        registry: StrategyRegistry,
        events: Arc<EventBus>,
    ) -> Self {
        let registry = Arc::new(registry);
        let decomposer = Decomposer::new(model.clone(), registry.clone(), config.decomposer.clone());
        let coordinator = ExecutionCoordinator::new(registry.clone(), domain, model.clone())
            .with_policy(FailurePolicy::from_config(&config.strategies))
            .with_settings(config.strategies.clone())
            .with_node_timeout(Duration::from_secs(config.engine.node_timeout_secs))
            .with_events(events.clone());
        let synthesizer = Synthesizer::new(model, config.synthesis.clone());

        Self {
            registry,
            decomposer,
            coordinator,
            synthesizer,
            engine: config.engine.clone(),
            cost_per_1k_tokens: config.engine.confirmation.cost_per_1k_tokens,
            preferences: config.preferences.clone(),
            events,
        }
    }

    pub fn registry(&self) -> &StrategyRegistry {
        &self.registry
    }

    fn trimmed_history<'a>(&self, history: &'a [ConversationTurn]) -> &'a [ConversationTurn] {
        let skip = history.len().saturating_sub(self.engine.history_turns);
        &history[skip..]
    }

    /// The model's own estimate never undercuts the cost hints.
    fn with_estimate(&self, mut graph: ExecutionGraph) -> ExecutionGraph {
        let floor = estimate_graph(&graph, &self.registry, self.cost_per_1k_tokens);
        graph.resource_estimate = Some(match graph.resource_estimate {
            Some(claimed) => claimed.at_least(floor),
            None => floor,
        });
        graph
    }

    /// Decompose a request without executing it. The returned graph always
    /// carries a resource estimate.
    pub async fn plan(&self, request: &RunRequest) -> Result<Decomposition> {
        let now = request.now.unwrap_or_else(Utc::now);
        let mut decomposition = self
            .decomposer
            .decompose(&PlanRequest {
                query: &request.query,
                history: self.trimmed_history(&request.history),
                user: &request.user,
                now,
                failures: None,
            })
            .await?;
        decomposition.graph = self.with_estimate(decomposition.graph);
        Ok(decomposition)
    }

    pub async fn run(&self, request: RunRequest) -> RunOutcome {
        self.run_with_cancel(request, CancellationToken::new()).await
    }

    /// Run one request to an outcome. Never fails: planning errors become
    /// an `Aborted` outcome with a structured error.
    pub async fn run_with_cancel(&self, request: RunRequest, cancel: CancellationToken) -> RunOutcome {
        let resuming = request.confirmed && request.pending.is_some();
        let mut run = Run::new(if resuming { Phase::AwaitingConfirmation } else { Phase::Planning });
        info!(request_id = %run.request_id, resuming, query_len = request.query.len(), "Run started");

        let outcome = match self.drive(&mut run, &request, cancel).await {
            Ok(Step::Answered(message)) => run.finish(RunStatus::Done, Some(message), None, None),
            Ok(Step::NeedsConfirmation(plan, message)) => {
                run.finish(RunStatus::AwaitingConfirmation, Some(message), Some(plan), None)
            }
            Err(e) => {
                warn!(request_id = %run.request_id, phase = %run.phase, error = %e, "Run aborted");
                if let Err(bad) = run.advance(Phase::Aborted) {
                    warn!(error = %bad, "Abort from terminal phase");
                }
                let message = format!("I couldn't complete this request: {}", e);
                run.finish(RunStatus::Aborted, Some(message), None, Some(ErrorInfo::from(&e)))
            }
        };

        info!(
            request_id = %outcome.request_id,
            status = ?outcome.status,
            tokens_used = outcome.metadata.tokens_used,
            elapsed_ms = outcome.metadata.elapsed_ms,
            "Run finished"
        );
        self.events.publish(EngineEvent::RunFinished {
            request_id: outcome.request_id.clone(),
            status: outcome.status,
            total_tokens: outcome.metadata.tokens_used,
        });
        outcome
    }

    async fn drive(&self, run: &mut Run, request: &RunRequest, cancel: CancellationToken) -> Result<Step> {
        let now = request.now.unwrap_or_else(Utc::now);
        let history = self.trimmed_history(&request.history);

        let mut graph = match (&request.pending, request.confirmed) {
            (Some(pending), true) => self.resume(pending, now)?,
            (pending, _) => {
                if pending.is_some() {
                    debug!(request_id = %run.request_id, "Ignoring unconfirmed pending plan");
                }
                let decomposition = self
                    .decomposer
                    .decompose(&PlanRequest {
                        query: &request.query,
                        history,
                        user: &request.user,
                        now,
                        failures: None,
                    })
                    .await?;
                run.metadata.tokens_used += decomposition.tokens_used;
                run.metadata.plan_attempts += decomposition.attempts;
                self.with_estimate(decomposition.graph)
            }
        };

        let estimate = graph.resource_estimate.unwrap_or_default();
        run.metadata.estimate = Some(estimate);
        self.events.publish(EngineEvent::PlanReady {
            request_id: run.request_id.clone(),
            nodes: graph.nodes.len(),
            est_tokens: estimate.est_tokens,
        });

        if !request.confirmed {
            let reasons = over_budget(&estimate, &self.engine.confirmation);
            if !reasons.is_empty() {
                run.advance(Phase::AwaitingConfirmation)?;
                let plan = PendingPlan {
                    id: Uuid::new_v4().to_string(),
                    query: request.query.clone(),
                    graph,
                    issued_at: now,
                };
                info!(request_id = %run.request_id, plan_id = %plan.id, reasons = ?reasons, "Plan needs confirmation");
                self.events.publish(EngineEvent::ConfirmationRequired {
                    request_id: run.request_id.clone(),
                    plan_id: plan.id.clone(),
                });
                let message = format!(
                    "This request would take {}. Confirm to proceed.",
                    reasons.join(", ")
                );
                return Ok(Step::NeedsConfirmation(plan, message));
            }
        }

        let control = RunControl::new(
            run.request_id.clone(),
            now,
            cancel,
            Duration::from_secs(self.engine.run_timeout_secs),
        );

        let results = loop {
            run.advance(Phase::Executing)?;
            let results = self.coordinator.execute(&graph, &control).await;
            run.metadata.tokens_used += results.total_tokens();

            let failures = failure_summary(&graph, &results);
            let stopped = control.cancel.is_cancelled() || tokio::time::Instant::now() >= control.deadline;
            if failures.is_empty() || stopped || run.metadata.replans >= self.engine.max_replans {
                break results;
            }

            run.advance(Phase::Planning)?;
            run.metadata.replans += 1;
            info!(request_id = %run.request_id, replan = run.metadata.replans, failures = failures.len(), "Re-planning");
            let decomposition = self
                .decomposer
                .decompose(&PlanRequest {
                    query: &request.query,
                    history,
                    user: &request.user,
                    now,
                    failures: Some(&failures),
                })
                .await?;
            run.metadata.tokens_used += decomposition.tokens_used;
            run.metadata.plan_attempts += decomposition.attempts;
            graph = self.with_estimate(decomposition.graph);
        };

        run.metadata.nodes = graph.nodes.len();
        run.metadata.succeeded = results.count(NodeStatus::Success);
        run.metadata.failed = results.count(NodeStatus::Failed);
        run.metadata.skipped = results.count(NodeStatus::Skipped);

        run.advance(Phase::Synthesizing)?;
        let preferences = request.preferences.as_ref().unwrap_or(&self.preferences);
        let synthesis = self
            .synthesizer
            .synthesize(&SynthesisInput {
                query: &request.query,
                graph: &graph,
                results: &results,
                preferences,
            })
            .await;
        run.metadata.tokens_used += synthesis.metadata.tokens_used;
        run.metadata.synthesis_fallback = synthesis.metadata.fallback;

        run.advance(Phase::Done)?;
        Ok(Step::Answered(synthesis.message))
    }

    /// Check a confirmed plan is still fresh and still valid.
    fn resume(&self, pending: &PendingPlan, now: DateTime<Utc>) -> Result<ExecutionGraph> {
        let age = now.signed_duration_since(pending.issued_at);
        if age.num_seconds() > self.engine.confirmation.ttl_secs as i64 {
            return Err(SiftError::PlanExpired {
                plan_id: pending.id.clone(),
                ttl_secs: self.engine.confirmation.ttl_secs,
            });
        }
        GraphValidator::new(&self.registry).validate(&pending.graph)?;
        info!(plan_id = %pending.id, nodes = pending.graph.nodes.len(), "Resuming confirmed plan");
        Ok(self.with_estimate(pending.graph.clone()))
    }
}

enum Step {
    Answered(String),
    NeedsConfirmation(PendingPlan, String),
}

/// One line per fatal failure, for the re-planning prompt.
fn failure_summary(graph: &ExecutionGraph, results: &ExecutionContext) -> Vec<String> {
    results
        .fatal_failures()
        .into_iter()
        .map(|r| {
            let op = graph.node(&r.node_id).map(|n| n.op.to_string()).unwrap_or_default();
            let error = r.error.as_ref().map(|e| e.to_string()).unwrap_or_default();
            format!("{} ({}): {}", r.node_id, op, error)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::future::BoxFuture;
    use serde_json::{json, Value};

    use sift_test_utils::{boss_mailbox, fixed_now, ScriptedModel};

    use crate::graph::{Node, OperationTag};
    use crate::strategy::{Strategy, StrategyContext, StrategyError, StrategyOutcome};
    use crate::synthesizer::NO_INFORMATION_MESSAGE;

    /// Counts invocations; fails every call when `broken`.
    #[derive(Clone)]
    struct Stub {
        tag: OperationTag,
        broken: bool,
        calls: Arc<AtomicUsize>,
    }

    impl Stub {
        fn new(tag: OperationTag) -> Self {
            Self {
                tag,
                broken: false,
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn broken(tag: OperationTag) -> Self {
            Self {
                broken: true,
                ..Self::new(tag)
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Strategy for Stub {
        fn tag(&self) -> OperationTag {
            self.tag.clone()
        }

        fn description(&self) -> &str {
            "stub"
        }

        fn parameter_hint(&self) -> Value {
            json!({})
        }

        fn execute(
            &self,
            _params: Value,
            ctx: StrategyContext,
        ) -> BoxFuture<'_, std::result::Result<StrategyOutcome, StrategyError>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if self.broken {
                    return Err(StrategyError::Domain("search index offline".into()));
                }
                Ok(StrategyOutcome::free(json!({
                    "items": [{"id": format!("{}-item", ctx.node_id)}],
                    "count": 1
                })))
            })
        }
    }

    fn config(extra: &str) -> AppConfig {
        AppConfig::from_toml(&format!("[model]\nmodel_id = \"test\"\n{}", extra)).unwrap()
    }

    fn orchestrator(config: &AppConfig, model: Arc<ScriptedModel>, stubs: &[Stub]) -> Orchestrator {
        let mut registry = StrategyRegistry::with_builtins();
        for stub in stubs {
            registry.register(stub.clone());
        }
        Orchestrator::new(config, model, Arc::new(boss_mailbox()), registry, Arc::new(EventBus::default()))
    }

    fn filter_plan(est_tokens: Option<u64>) -> String {
        let mut plan = json!({
            "classification": {"type": "lookup", "complexity": "simple"},
            "nodes": [
                {"id": "n1", "type": "metadata_filter", "parameters": {"sender": "dana@acme.com"}, "dependsOn": [], "stage": 0}
            ]
        });
        if let Some(tokens) = est_tokens {
            plan["resourceEstimate"] = json!({"estTokens": tokens, "estCost": 0.01, "estTimeMs": 1000});
        }
        plan.to_string()
    }

    fn failing_search_plan() -> String {
        json!({
            "classification": {"type": "triage", "complexity": "moderate"},
            "nodes": [
                {"id": "n1", "type": "keyword_search", "parameters": {"query": "budget"}, "dependsOn": [], "stage": 0},
                {"id": "n2", "type": "semantic_analysis",
                 "parameters": {"items": {"$ref": "n1", "path": "items"}, "focus": "urgency"},
                 "dependsOn": ["n1"], "stage": 1}
            ]
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_simple_request_runs_to_done() {
        let filter = Stub::new(OperationTag::MetadataFilter);
        let model = Arc::new(ScriptedModel::new([filter_plan(None), "One email from Dana.".into()]));
        let orch = orchestrator(&config(""), model.clone(), &[filter.clone()]);

        let out = orch.run(RunRequest::new("anything from Dana?").at(fixed_now())).await;

        assert_eq!(out.status, RunStatus::Done);
        assert_eq!(out.message.as_deref(), Some("One email from Dana."));
        assert!(out.error.is_none());
        assert_eq!(filter.calls(), 1);
        assert_eq!(out.metadata.succeeded, 1);
        assert_eq!(out.metadata.plan_attempts, 1);
        // Planning plus synthesis.
        assert_eq!(out.metadata.tokens_used, 20);
        assert!(out.metadata.estimate.is_some());
    }

    #[tokio::test]
    async fn test_scenario_c_over_budget_waits_for_confirmation() {
        let filter = Stub::new(OperationTag::MetadataFilter);
        let model = Arc::new(ScriptedModel::new([filter_plan(Some(1_000_000)), "Done it.".into()]));
        let orch = orchestrator(&config(""), model.clone(), &[filter.clone()]);
        let mut events = orch.events.subscribe();

        let first = orch.run(RunRequest::new("summarise everything").at(fixed_now())).await;
        assert_eq!(first.status, RunStatus::AwaitingConfirmation);
        assert_eq!(filter.calls(), 0);
        assert!(first.message.unwrap().contains("tokens"));
        let plan = first.plan.expect("pending plan");
        assert_eq!(plan.query, "summarise everything");
        assert_eq!(plan.graph.nodes.len(), 1);

        let mut saw_confirmation = false;
        while let Ok(event) = events.try_recv() {
            if let EngineEvent::ConfirmationRequired { plan_id, .. } = event {
                assert_eq!(plan_id, plan.id);
                saw_confirmation = true;
            }
        }
        assert!(saw_confirmation);

        let second = orch
            .run(RunRequest::new("ignored").confirm(plan).at(fixed_now() + chrono::Duration::minutes(2)))
            .await;
        assert_eq!(second.status, RunStatus::Done);
        assert_eq!(second.message.as_deref(), Some("Done it."));
        assert_eq!(filter.calls(), 1);
        // No second planning call: plan, then synthesis.
        assert_eq!(model.calls(), 2);
        assert!(model.requests()[1].schema.is_none());
    }

    #[tokio::test]
    async fn test_understated_model_estimate_still_hits_the_gate() {
        let mut plan: Value = serde_json::from_str(&failing_search_plan()).unwrap();
        plan["resourceEstimate"] = json!({"estTokens": 0, "estCost": 0.0, "estTimeMs": 0});
        let model = Arc::new(ScriptedModel::new([plan.to_string()]));
        let orch = orchestrator(
            &config("[engine.confirmation]\nmax_tokens = 1000\n"),
            model.clone(),
            &[],
        );

        let out = orch.run(RunRequest::new("what is urgent about the budget?").at(fixed_now())).await;

        assert_eq!(out.status, RunStatus::AwaitingConfirmation);
        let estimate = out.plan.unwrap().graph.resource_estimate.unwrap();
        assert!(estimate.est_tokens >= 4_000);
        assert!(estimate.est_time_ms > 0);
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test]
    async fn test_confirmed_without_pending_plans_and_skips_gate() {
        let filter = Stub::new(OperationTag::MetadataFilter);
        let model = Arc::new(ScriptedModel::new([filter_plan(Some(1_000_000)), "ok".into()]));
        let orch = orchestrator(&config(""), model.clone(), &[filter.clone()]);

        let out = orch.run(RunRequest::new("everything").confirmed().at(fixed_now())).await;
        assert_eq!(out.status, RunStatus::Done);
        assert_eq!(filter.calls(), 1);
    }

    #[tokio::test]
    async fn test_expired_plan_is_aborted() {
        let filter = Stub::new(OperationTag::MetadataFilter);
        let model = Arc::new(ScriptedModel::new(Vec::<String>::new()));
        let orch = orchestrator(&config(""), model.clone(), &[filter.clone()]);

        let plan = PendingPlan {
            id: "p1".into(),
            query: "old request".into(),
            graph: ExecutionGraph::new("lookup", vec![Node::new("n1", OperationTag::MetadataFilter, 0)]),
            issued_at: fixed_now() - chrono::Duration::minutes(11),
        };
        let out = orch.run(RunRequest::default().confirm(plan).at(fixed_now())).await;

        assert_eq!(out.status, RunStatus::Aborted);
        assert_eq!(out.error.unwrap().kind, "plan_expired");
        assert_eq!(filter.calls(), 0);
        assert_eq!(model.calls(), 0);
    }

    #[tokio::test]
    async fn test_tampered_plan_is_revalidated() {
        let model = Arc::new(ScriptedModel::new(Vec::<String>::new()));
        let orch = orchestrator(&config(""), model, &[]);
        let plan = PendingPlan {
            id: "p2".into(),
            query: "q".into(),
            graph: ExecutionGraph::new("x", vec![Node::new("n1", "teleport", 0)]),
            issued_at: fixed_now(),
        };
        let out = orch.run(RunRequest::default().confirm(plan).at(fixed_now())).await;
        assert_eq!(out.status, RunStatus::Aborted);
        assert_eq!(out.error.unwrap().kind, "graph_validation_error");
    }

    #[tokio::test]
    async fn test_scenario_d_malformed_plan_twice_aborts() {
        let filter = Stub::new(OperationTag::MetadataFilter);
        let model = Arc::new(ScriptedModel::new(["{oops", "still not json"]));
        let orch = orchestrator(&config(""), model.clone(), &[filter.clone()]);

        let out = orch.run(RunRequest::new("urgent emails from my boss").at(fixed_now())).await;

        assert_eq!(out.status, RunStatus::Aborted);
        let error = out.error.unwrap();
        assert_eq!(error.kind, "decomposition_error");
        assert!(out.message.is_some());
        assert_eq!(filter.calls(), 0);
        assert_eq!(model.calls(), 2);
    }

    #[tokio::test]
    async fn test_scenario_b_fatal_failure_reaches_synthesis() {
        let search = Stub::broken(OperationTag::KeywordSearch);
        let analysis = Stub::new(OperationTag::SemanticAnalysis);
        // No scripted synthesis answer, so the deterministic fallback is used.
        let model = Arc::new(ScriptedModel::new([failing_search_plan()]));
        let orch = orchestrator(&config(""), model.clone(), &[search.clone(), analysis.clone()]);

        let out = orch.run(RunRequest::new("urgent budget emails").at(fixed_now())).await;

        assert_eq!(out.status, RunStatus::Done);
        assert_eq!(analysis.calls(), 0);
        assert_eq!((out.metadata.failed, out.metadata.skipped), (1, 1));
        assert!(out.metadata.synthesis_fallback);
        let message = out.message.unwrap();
        assert!(message.contains("n1 (keyword_search) failed"));
        assert!(message.contains("n2 (semantic_analysis) was skipped"));

        let synthesis_prompt = &model.prompts()[1];
        assert!(synthesis_prompt.contains("[failed] n1"));
        assert!(synthesis_prompt.contains("[skipped] n2"));
    }

    #[tokio::test]
    async fn test_empty_plan_answers_without_execution() {
        let plan = json!({"classification": {"type": "chitchat", "complexity": "simple"}, "nodes": []}).to_string();
        let model = Arc::new(ScriptedModel::new([plan]));
        let orch = orchestrator(&config(""), model.clone(), &[]);

        let out = orch.run(RunRequest::new("what is 2 + 2?").at(fixed_now())).await;
        assert_eq!(out.status, RunStatus::Done);
        assert_eq!(out.message.as_deref(), Some(NO_INFORMATION_MESSAGE));
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test]
    async fn test_replan_is_bounded() {
        let search = Stub::broken(OperationTag::KeywordSearch);
        let filter = Stub::new(OperationTag::MetadataFilter);
        let model = Arc::new(ScriptedModel::new([
            failing_search_plan(),
            failing_search_plan(),
            "Nothing urgent found.".into(),
        ]));
        let cfg = config("[engine]\nmax_replans = 1\n");
        let orch = orchestrator(&cfg, model.clone(), &[search.clone(), filter.clone()]);

        let out = orch.run(RunRequest::new("urgent budget emails").at(fixed_now())).await;

        assert_eq!(out.status, RunStatus::Done);
        assert_eq!(out.metadata.replans, 1);
        assert_eq!(search.calls(), 2);
        assert_eq!(model.calls(), 3);
        let prompts = model.prompts();
        assert!(!prompts[0].contains("A previous plan for this request failed"));
        assert!(prompts[1].contains("A previous plan for this request failed"));
        assert!(prompts[1].contains("search index offline"));
    }

    #[tokio::test]
    async fn test_replan_recovers() {
        let search = Stub::broken(OperationTag::KeywordSearch);
        let filter = Stub::new(OperationTag::MetadataFilter);
        let model = Arc::new(ScriptedModel::new([
            failing_search_plan(),
            filter_plan(None),
            "Found it.".into(),
        ]));
        let cfg = config("[engine]\nmax_replans = 2\n");
        let orch = orchestrator(&cfg, model.clone(), &[search.clone(), filter.clone()]);

        let out = orch.run(RunRequest::new("budget").at(fixed_now())).await;
        assert_eq!(out.status, RunStatus::Done);
        assert_eq!(out.metadata.replans, 1);
        assert_eq!(out.metadata.failed, 0);
        assert_eq!(filter.calls(), 1);
        assert_eq!(out.message.as_deref(), Some("Found it."));
    }

    #[tokio::test]
    async fn test_history_is_trimmed() {
        let model = Arc::new(ScriptedModel::new([filter_plan(None), "ok".into()]));
        let cfg = config("[engine]\nhistory_turns = 2\n");
        let orch = orchestrator(&cfg, model.clone(), &[Stub::new(OperationTag::MetadataFilter)]);

        let history = (0..6).map(|i| ConversationTurn::user(format!("turn-{}", i))).collect();
        orch.run(RunRequest::new("and now?").with_history(history).at(fixed_now())).await;

        let prompt = &model.prompts()[0];
        assert!(!prompt.contains("turn-3"));
        assert!(prompt.contains("turn-4"));
        assert!(prompt.contains("turn-5"));
    }

    #[tokio::test]
    async fn test_run_finished_is_last_event() {
        let model = Arc::new(ScriptedModel::new([filter_plan(None), "ok".into()]));
        let orch = orchestrator(&config(""), model, &[Stub::new(OperationTag::MetadataFilter)]);
        let mut rx = orch.events.subscribe();

        let out = orch.run(RunRequest::new("q").at(fixed_now())).await;

        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }
        assert!(matches!(events.first(), Some(EngineEvent::PlanReady { nodes: 1, .. })));
        match events.last() {
            Some(EngineEvent::RunFinished { request_id, status, total_tokens }) => {
                assert_eq!(request_id, &out.request_id);
                assert_eq!(*status, RunStatus::Done);
                assert_eq!(*total_tokens, out.metadata.tokens_used);
            }
            other => panic!("expected RunFinished, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancelled_run_still_synthesizes() {
        let model = Arc::new(ScriptedModel::new([filter_plan(None), "partial".into()]));
        let filter = Stub::new(OperationTag::MetadataFilter);
        let orch = orchestrator(&config(""), model, &[filter.clone()]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let out = orch
            .run_with_cancel(RunRequest::new("q").at(fixed_now()), cancel)
            .await;
        assert_eq!(out.status, RunStatus::Done);
        assert_eq!(out.metadata.skipped, 1);
        assert_eq!(filter.calls(), 0);
    }

    #[test]
    fn test_phase_transitions() {
        use Phase::*;
        assert_eq!(Planning.transition(Executing).unwrap(), Executing);
        assert_eq!(Planning.transition(AwaitingConfirmation).unwrap(), AwaitingConfirmation);
        assert_eq!(AwaitingConfirmation.transition(Executing).unwrap(), Executing);
        assert_eq!(Executing.transition(Planning).unwrap(), Planning);
        assert_eq!(Synthesizing.transition(Done).unwrap(), Done);
        for phase in [Planning, AwaitingConfirmation, Executing, Synthesizing] {
            assert!(phase.can_transition(Aborted));
        }

        let err = Planning.transition(Done).unwrap_err();
        assert_eq!(err.kind(), "invalid_transition");
        assert!(Done.transition(Aborted).is_err());
        assert!(Aborted.transition(Planning).is_err());
        assert!(Synthesizing.transition(Executing).is_err());
        assert!(AwaitingConfirmation.transition(Synthesizing).is_err());
    }
}
