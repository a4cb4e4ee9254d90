pub mod context;
pub mod coordinator;
pub mod decomposer;
pub mod estimate;
pub mod graph;
pub mod orchestrator;
pub mod policy;
pub mod prompts;
pub mod registry;
pub mod strategy;
pub mod synthesizer;

pub use context::{ErrorInfo, ExecutionContext, NodeResult};
pub use coordinator::{ExecutionCoordinator, RunControl};
pub use decomposer::{Decomposer, Decomposition, PlanRequest};
pub use graph::{ExecutionGraph, GraphValidator, Node, OperationTag, Param, Reference, ResourceEstimate};
pub use orchestrator::{Orchestrator, PendingPlan, Phase, RunMetadata, RunOutcome, RunRequest};
pub use policy::FailurePolicy;
pub use registry::{OperationInfo, StrategyRegistry};
pub use strategy::{Strategy, StrategyContext, StrategyError, StrategyOutcome};
pub use synthesizer::{Synthesis, Synthesizer, NO_INFORMATION_MESSAGE};
