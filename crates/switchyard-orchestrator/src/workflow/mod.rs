//! DAG workflows executed as dependent agent tasks.

pub mod engine;
pub mod graph;
pub mod types;

pub use engine::{STEP_RESULTS_KEY, WorkflowEngine};
pub use graph::{GraphError, StepGraph};
pub use types::{
    ExecutionStarted, ExecutionStatus, RetryPolicy, StepRun, StepStatus, Workflow,
    WorkflowDefinition, WorkflowExecution, WorkflowStatus, WorkflowStep, WorkflowTrigger,
};
