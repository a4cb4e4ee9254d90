//! Execution graph model: typed nodes with stages and dependencies, deferred
//! parameter references, and the structural validator.

pub mod node;
pub mod param;
pub mod plan;
pub mod validator;

pub use node::{Node, OperationTag};
pub use param::{Param, Reference};
pub use plan::{Classification, Complexity, ExecutionGraph, ResourceEstimate};
pub use validator::{GraphValidator, Rule, Violation};
