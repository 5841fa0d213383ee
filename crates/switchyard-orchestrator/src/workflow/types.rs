//! Workflow definitions and execution records.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::queue::Priority;

/// Whether a workflow may be executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    #[default]
    Active,
    Inactive,
}

/// What starts a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WorkflowTrigger {
    /// Started explicitly through `execute`.
    Manual,
    /// Started when the named event fires.
    Event {
        /// Event name.
        event: String,
    },
}

/// Retry behaviour for a failing step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    /// Delay before a retry is released.
    #[serde(default)]
    pub backoff_ms: u64,
}

/// One step of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    /// Step ID, unique within the workflow.
    pub id: String,
    /// Agent type that runs the step.
    pub agent_type: String,
    /// Task type submitted for the step.
    pub action: String,
    /// Task payload.
    #[serde(default)]
    pub data: serde_json::Value,
    /// Steps that must complete first.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Retry behaviour on task failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    /// Time from execution start by which the step must complete.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Task priority.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
}

impl WorkflowStep {
    /// Step `id` running `action` on agents of `agent_type`.
    #[must_use]
    pub fn new(id: impl Into<String>, agent_type: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            agent_type: agent_type.into(),
            action: action.into(),
            data: serde_json::Value::Null,
            dependencies: Vec::new(),
            retry_policy: None,
            timeout_ms: None,
            priority: None,
        }
    }

    /// Adds dependencies.
    #[must_use]
    pub fn depends_on<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(dependencies.into_iter().map(Into::into));
        self
    }

    /// Sets the payload.
    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, max_attempts: u32, backoff_ms: u64) -> Self {
        self.retry_policy = Some(RetryPolicy { max_attempts, backoff_ms });
        self
    }

    /// Sets the timeout.
    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub(crate) fn max_attempts(&self) -> u32 {
        self.retry_policy.map_or(1, |p| p.max_attempts.max(1))
    }
}

/// A stored workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    /// Workflow ID.
    pub id: String,
    /// Name.
    pub name: String,
    /// Description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Steps in declaration order.
    pub steps: Vec<WorkflowStep>,
    /// Triggers.
    pub triggers: Vec<WorkflowTrigger>,
    /// Status.
    pub status: WorkflowStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

fn default_triggers() -> Vec<WorkflowTrigger> {
    vec![WorkflowTrigger::Manual]
}

/// Workflow submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    /// Fixed ID; generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    /// Name.
    pub name: String,
    /// Description.
    #[serde(default)]
    pub description: Option<String>,
    /// Steps.
    pub steps: Vec<WorkflowStep>,
    /// Triggers (manual when absent).
    #[serde(default = "default_triggers")]
    pub triggers: Vec<WorkflowTrigger>,
    /// Status.
    #[serde(default)]
    pub status: WorkflowStatus,
}

impl WorkflowDefinition {
    /// Manually triggered workflow named `name`.
    #[must_use]
    pub fn new(name: impl Into<String>, steps: Vec<WorkflowStep>) -> Self {
        Self {
            id: None,
            name: name.into(),
            description: None,
            steps,
            triggers: default_triggers(),
            status: WorkflowStatus::Active,
        }
    }

    /// Adds an event trigger.
    #[must_use]
    pub fn on_event(mut self, event: impl Into<String>) -> Self {
        self.triggers.push(WorkflowTrigger::Event { event: event.into() });
        self
    }
}

/// Status of a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Status of one step within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Task held back until dependencies complete.
    Waiting,
    /// Task released to the scheduler.
    Dispatched,
    Completed,
    /// Task failed and retries are exhausted.
    Failed,
    /// Deadline passed before completion.
    TimedOut,
    /// A dependency did not complete.
    Skipped,
}

impl StepStatus {
    /// Whether the step can no longer change.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut | Self::Skipped)
    }
}

/// Progress of one step.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRun {
    /// Step ID.
    pub step_id: String,
    /// Status.
    pub status: StepStatus,
    /// Current task.
    pub task_id: String,
    /// Every task created for the step, oldest first.
    pub task_history: Vec<String>,
    /// Attempts released so far.
    pub attempts: u32,
    /// When the current task was released.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispatched_at: Option<DateTime<Utc>>,
    /// When the step reached a terminal status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Failure reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Earliest release of a retry.
    #[serde(skip)]
    pub(crate) retry_at: Option<Instant>,
}

/// One run of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowExecution {
    /// Execution ID.
    pub id: String,
    /// Workflow ID.
    pub workflow_id: String,
    /// Context receiving step results.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
    /// Status.
    pub status: ExecutionStatus,
    /// Step progress keyed by step ID.
    pub steps: BTreeMap<String, StepRun>,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// Finish time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Monotonic start used for step deadlines.
    #[serde(skip)]
    pub(crate) started: Instant,
}

/// Handle returned when an execution starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStarted {
    /// Execution ID.
    pub execution_id: String,
    /// Task ID per step, in declaration order.
    pub task_ids: Vec<String>,
}
