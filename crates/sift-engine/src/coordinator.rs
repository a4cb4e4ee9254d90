//! Stage-by-stage execution of a validated graph.
//!
//! Stages run in ascending order and never overlap. Within a stage every
//! node's references are resolved from already-terminal dependencies, then
//! all nodes are dispatched together and awaited as a group. Fatal failures
//! skip their transitive dependents before the next stage starts.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sift_core::config::StrategiesConfig;
use sift_core::error::SiftError;
use sift_core::event::EventBus;
use sift_core::traits::{DomainService, LanguageModel};
use sift_core::types::{EngineEvent, FailureClass, NodeStatus, RequestId};

use crate::context::{ErrorInfo, ExecutionContext, NodeResult};
use crate::graph::param::resolve_all;
use crate::graph::{ExecutionGraph, Node};
use crate::policy::FailurePolicy;
use crate::registry::StrategyRegistry;
use crate::strategy::StrategyContext;

/// Cancellation, deadline and fixed clock for one graph run.
#[derive(Clone)]
pub struct RunControl {
    pub request_id: RequestId,
    pub now: DateTime<Utc>,
    pub cancel: CancellationToken,
    pub deadline: tokio::time::Instant,
}

impl RunControl {
    pub fn new(request_id: RequestId, now: DateTime<Utc>, cancel: CancellationToken, timeout: Duration) -> Self {
        Self {
            request_id,
            now,
            cancel,
            deadline: tokio::time::Instant::now() + timeout,
        }
    }

    /// Why nothing more should start, if anything.
    fn stop_reason(&self) -> Option<ErrorInfo> {
        if self.cancel.is_cancelled() {
            Some(cancelled())
        } else if tokio::time::Instant::now() >= self.deadline {
            Some(deadline_exceeded())
        } else {
            None
        }
    }
}

fn cancelled() -> ErrorInfo {
    ErrorInfo::from(&SiftError::Cancelled)
}

fn deadline_exceeded() -> ErrorInfo {
    ErrorInfo::new("deadline_exceeded", "run deadline passed")
}

pub struct ExecutionCoordinator {
    registry: Arc<StrategyRegistry>,
    domain: Arc<dyn DomainService>,
    model: Arc<dyn LanguageModel>,
    policy: FailurePolicy,
    settings: Arc<StrategiesConfig>,
    node_timeout: Duration,
    events: Arc<EventBus>,
}

impl ExecutionCoordinator {
    pub fn new(
        registry: Arc<StrategyRegistry>,
        domain: Arc<dyn DomainService>,
        model: Arc<dyn LanguageModel>,
    ) -> Self {
        Self {
            registry,
            domain,
            model,
            policy: FailurePolicy::defaults(),
            settings: Arc::new(StrategiesConfig::default()),
            node_timeout: Duration::from_secs(30),
            events: Arc::new(EventBus::default()),
        }
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_settings(mut self, settings: StrategiesConfig) -> Self {
        self.settings = Arc::new(settings);
        self
    }

    pub fn with_node_timeout(mut self, timeout: Duration) -> Self {
        self.node_timeout = timeout;
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    /// Run every node of `graph` to a terminal status.
    ///
    /// Never fails: node errors, timeouts and cancellation all end up as
    /// results in the returned context.
    pub async fn execute(&self, graph: &ExecutionGraph, control: &RunControl) -> ExecutionContext {
        let mut ctx = ExecutionContext::new();
        let started = Instant::now();

        for (stage, nodes) in graph.stages() {
            let pending: Vec<&Node> = nodes.into_iter().filter(|n| !ctx.contains(&n.id)).collect();
            if pending.is_empty() {
                continue;
            }

            if let Some(reason) = control.stop_reason() {
                warn!(stage, reason = %reason, "Skipping stage");
                for node in pending {
                    self.record(&mut ctx, control, NodeResult::skipped(&node.id, reason.clone()));
                }
                continue;
            }

            let ids: Vec<String> = pending.iter().map(|n| n.id.clone()).collect();
            info!(request_id = %control.request_id, stage, nodes = ids.len(), "Stage started");
            self.events.publish(EngineEvent::StageStarted {
                request_id: control.request_id.clone(),
                stage: stage as u32,
                nodes: ids,
            });

            let dispatch: Vec<_> = pending
                .iter()
                .map(|node| {
                    debug_assert!(node
                        .depends_on
                        .iter()
                        .all(|d| ctx.get(d).is_some_and(|r| r.status.is_terminal())));
                    let available = ctx.available_data(&node.depends_on);
                    let params = resolve_all(&node.parameters, &available);
                    self.run_node(node, params, control)
                })
                .collect();
            let results = join_all(dispatch).await;

            let mut fatal = Vec::new();
            for result in results {
                if result.is_fatal_failure() {
                    fatal.push(result.node_id.clone());
                }
                self.record(&mut ctx, control, result);
            }

            for failed in fatal {
                for dependent in graph.transitive_dependents(&failed) {
                    if ctx.contains(&dependent) {
                        continue;
                    }
                    let reason = ErrorInfo::new(
                        "upstream_failed",
                        format!("dependency '{}' failed fatally", failed),
                    );
                    self.record(&mut ctx, control, NodeResult::skipped(dependent, reason));
                }
            }
        }

        info!(
            request_id = %control.request_id,
            succeeded = ctx.count(NodeStatus::Success),
            failed = ctx.count(NodeStatus::Failed),
            skipped = ctx.count(NodeStatus::Skipped),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Graph run finished"
        );
        ctx
    }

    fn record(&self, ctx: &mut ExecutionContext, control: &RunControl, result: NodeResult) {
        debug!(
            node_id = %result.node_id,
            status = %result.status,
            elapsed_ms = result.elapsed_ms,
            "Node finished"
        );
        self.events.publish(EngineEvent::NodeFinished {
            request_id: control.request_id.clone(),
            node_id: result.node_id.clone(),
            status: result.status,
            elapsed_ms: result.elapsed_ms,
        });
        ctx.record(result);
    }

    async fn run_node(&self, node: &Node, params: Value, control: &RunControl) -> NodeResult {
        let start = Instant::now();
        let class = self.policy.class_for(&node.op);

        let Some(strategy) = self.registry.get(&node.op) else {
            return NodeResult::failed(
                &node.id,
                ErrorInfo::from(&SiftError::UnknownOperation(node.op.to_string())),
                FailureClass::Fatal,
                0,
            );
        };

        let strategy_ctx = StrategyContext {
            node_id: node.id.clone(),
            now: control.now,
            domain: self.domain.clone(),
            model: self.model.clone(),
            settings: self.settings.clone(),
            cancel: control.cancel.child_token(),
        };

        debug!(node_id = %node.id, op = %node.op, "Dispatching node");
        let outcome = tokio::select! {
            biased;
            _ = control.cancel.cancelled() => {
                return NodeResult::skipped(&node.id, cancelled());
            }
            _ = tokio::time::sleep_until(control.deadline) => {
                return NodeResult::skipped(&node.id, deadline_exceeded());
            }
            r = tokio::time::timeout(self.node_timeout, strategy.execute(params, strategy_ctx)) => r,
        };
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok(out)) => NodeResult::success(&node.id, out.data, out.tokens_used, elapsed_ms),
            Ok(Err(e)) => {
                warn!(node_id = %node.id, op = %node.op, error = %e, class = ?class, "Node failed");
                NodeResult::failed(&node.id, ErrorInfo::new(e.kind(), e.to_string()), class, elapsed_ms)
            }
            Err(_) => {
                warn!(node_id = %node.id, timeout_secs = self.node_timeout.as_secs(), "Node timed out");
                NodeResult::failed(
                    &node.id,
                    ErrorInfo::new(
                        "timeout",
                        format!("no result within {}ms", self.node_timeout.as_millis()),
                    ),
                    class,
                    elapsed_ms,
                )
            }
        }
    }
}
