//! Workflow engine.
//!
//! Executing a workflow creates one held-back task per step. Each engine
//! tick walks every running execution in dependency order: it observes task
//! outcomes, releases steps whose dependencies have completed, retries or
//! fails steps whose tasks failed, times out steps past their deadline and
//! skips everything downstream of a step that did not complete.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::graph::StepGraph;
use super::types::{
    ExecutionStarted, ExecutionStatus, StepRun, StepStatus, Workflow, WorkflowDefinition,
    WorkflowExecution, WorkflowStatus, WorkflowStep, WorkflowTrigger,
};
use crate::agents::{AgentCoordinator, NewTask, TaskStatus};
use crate::context::ContextStore;
use crate::error::{OrchestrationError, Result};

/// Key under which step results are written into the execution context.
pub const STEP_RESULTS_KEY: &str = "steps";

#[derive(Debug, Clone)]
struct StoredWorkflow {
    workflow: Workflow,
    graph: StepGraph,
}

/// Drives workflow executions over the agent coordinator.
pub struct WorkflowEngine {
    workflows: RwLock<HashMap<String, StoredWorkflow>>,
    executions: Mutex<HashMap<String, WorkflowExecution>>,
    coordinator: Arc<AgentCoordinator>,
    contexts: Arc<ContextStore>,
    default_step_timeout: Duration,
}

impl fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("workflow_count", &self.workflows.try_read().map(|w| w.len()).unwrap_or(0))
            .field("execution_count", &self.executions.try_lock().map(|e| e.len()).unwrap_or(0))
            .field("default_step_timeout", &self.default_step_timeout)
            .finish_non_exhaustive()
    }
}

impl WorkflowEngine {
    /// Creates an engine.
    ///
    /// # Arguments
    /// * `coordinator` - Receives one task per step
    /// * `contexts` - Receives step results for executions with a context
    /// * `default_step_timeout` - Deadline for steps that declare none
    #[must_use]
    pub fn new(
        coordinator: Arc<AgentCoordinator>,
        contexts: Arc<ContextStore>,
        default_step_timeout: Duration,
    ) -> Self {
        Self {
            workflows: RwLock::new(HashMap::new()),
            executions: Mutex::new(HashMap::new()),
            coordinator,
            contexts,
            default_step_timeout,
        }
    }

    /// Validates and stores a workflow.
    ///
    /// # Errors
    /// Returns a validation error for an empty name, duplicate workflow ID,
    /// or an invalid step graph.
    pub async fn create_workflow(&self, definition: WorkflowDefinition) -> Result<Workflow> {
        if definition.name.trim().is_empty() {
            return Err(OrchestrationError::Validation("workflow name is required".into()));
        }
        for step in &definition.steps {
            if step.id.trim().is_empty() || step.agent_type.trim().is_empty() || step.action.trim().is_empty() {
                return Err(OrchestrationError::Validation(format!(
                    "step '{}' needs an id, agentType and action",
                    step.id
                )));
            }
        }
        let graph = StepGraph::build(&definition.steps)?;

        let workflow = Workflow {
            id: definition.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            name: definition.name,
            description: definition.description,
            steps: definition.steps,
            triggers: definition.triggers,
            status: definition.status,
            created_at: Utc::now(),
        };

        let mut workflows = self.workflows.write().await;
        if workflows.contains_key(&workflow.id) {
            return Err(OrchestrationError::Validation(format!(
                "workflow '{}' already exists",
                workflow.id
            )));
        }
        workflows.insert(workflow.id.clone(), StoredWorkflow { workflow: workflow.clone(), graph });
        info!(workflow_id = %workflow.id, steps = workflow.steps.len(), "Created workflow");
        Ok(workflow)
    }

    /// Looks up a workflow.
    pub async fn get_workflow(&self, id: &str) -> Result<Workflow> {
        let workflows = self.workflows.read().await;
        workflows
            .get(id)
            .map(|s| s.workflow.clone())
            .ok_or_else(|| OrchestrationError::WorkflowNotFound(id.to_string()))
    }

    /// All workflows, oldest first.
    pub async fn list_workflows(&self) -> Vec<Workflow> {
        let workflows = self.workflows.read().await;
        let mut list: Vec<Workflow> = workflows.values().map(|s| s.workflow.clone()).collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        list
    }

    /// Starts an execution.
    ///
    /// Every step gets a held-back task up front; steps without dependencies
    /// are released immediately.
    ///
    /// # Errors
    /// Returns `WorkflowNotFound`, `ContextNotFound` for an unknown context,
    /// `InvalidTransition` for an inactive workflow, or a task validation error.
    pub async fn execute_workflow(
        &self,
        workflow_id: &str,
        context_id: Option<String>,
    ) -> Result<ExecutionStarted> {
        let stored = {
            let workflows = self.workflows.read().await;
            workflows
                .get(workflow_id)
                .cloned()
                .ok_or_else(|| OrchestrationError::WorkflowNotFound(workflow_id.to_string()))?
        };
        if stored.workflow.status != WorkflowStatus::Active {
            return Err(OrchestrationError::InvalidTransition {
                entity: "workflow",
                id: workflow_id.to_string(),
                reason: "workflow is inactive".into(),
            });
        }
        if let Some(context_id) = &context_id {
            self.contexts.get(context_id).await?;
        }

        let mut steps = BTreeMap::new();
        let mut task_ids = Vec::with_capacity(stored.workflow.steps.len());
        for step in &stored.workflow.steps {
            match self.coordinator.prepare_task(step_task(step, context_id.as_deref())).await {
                Ok(task) => {
                    task_ids.push(task.id.clone());
                    steps.insert(step.id.clone(), StepRun {
                        step_id: step.id.clone(),
                        status: StepStatus::Waiting,
                        task_id: task.id.clone(),
                        task_history: vec![task.id],
                        attempts: 0,
                        dispatched_at: None,
                        completed_at: None,
                        error: None,
                        retry_at: None,
                    });
                }
                Err(err) => {
                    for task_id in &task_ids {
                        self.cancel_quietly(task_id).await;
                    }
                    return Err(err);
                }
            }
        }

        let mut execution = WorkflowExecution {
            id: Uuid::new_v4().to_string(),
            workflow_id: workflow_id.to_string(),
            context_id,
            status: ExecutionStatus::Running,
            steps,
            started_at: Utc::now(),
            completed_at: None,
            started: Instant::now(),
        };
        self.advance(&mut execution, &stored).await;

        let started = ExecutionStarted { execution_id: execution.id.clone(), task_ids };
        info!(
            workflow_id = %workflow_id,
            execution_id = %execution.id,
            steps = execution.steps.len(),
            "Started workflow execution"
        );
        self.executions.lock().await.insert(execution.id.clone(), execution);
        Ok(started)
    }

    /// Starts every active workflow with an event trigger named `event`.
    pub async fn trigger_event(
        &self,
        event: &str,
        context_id: Option<String>,
    ) -> Result<Vec<ExecutionStarted>> {
        let matching: Vec<String> = {
            let workflows = self.workflows.read().await;
            let mut matching: Vec<&Workflow> = workflows
                .values()
                .map(|s| &s.workflow)
                .filter(|w| {
                    w.status == WorkflowStatus::Active
                        && w.triggers.iter().any(
                            |t| matches!(t, WorkflowTrigger::Event { event: name } if name == event),
                        )
                })
                .collect();
            matching.sort_by_key(|w| w.created_at);
            matching.into_iter().map(|w| w.id.clone()).collect()
        };

        debug!(event = %event, workflows = matching.len(), "Firing workflow event");
        let mut started = Vec::with_capacity(matching.len());
        for workflow_id in matching {
            started.push(self.execute_workflow(&workflow_id, context_id.clone()).await?);
        }
        Ok(started)
    }

    /// Looks up an execution.
    pub async fn get_execution(&self, id: &str) -> Result<WorkflowExecution> {
        let executions = self.executions.lock().await;
        executions.get(id).cloned().ok_or_else(|| OrchestrationError::ExecutionNotFound(id.to_string()))
    }

    /// Executions, oldest first, optionally for one workflow.
    pub async fn list_executions(&self, workflow_id: Option<&str>) -> Vec<WorkflowExecution> {
        let executions = self.executions.lock().await;
        let mut list: Vec<WorkflowExecution> = executions
            .values()
            .filter(|e| workflow_id.is_none_or(|id| e.workflow_id == id))
            .cloned()
            .collect();
        list.sort_by_key(|e| e.started);
        list
    }

    /// Cancels a running execution and every unfinished step task.
    ///
    /// # Errors
    /// Returns `InvalidTransition` if the execution already finished.
    pub async fn cancel_execution(&self, id: &str) -> Result<WorkflowExecution> {
        let mut executions = self.executions.lock().await;
        let execution = executions
            .get_mut(id)
            .ok_or_else(|| OrchestrationError::ExecutionNotFound(id.to_string()))?;
        if execution.status != ExecutionStatus::Running {
            return Err(OrchestrationError::InvalidTransition {
                entity: "execution",
                id: id.to_string(),
                reason: format!("execution is {:?}", execution.status),
            });
        }

        let now = Utc::now();
        for run in execution.steps.values_mut().filter(|r| !r.status.is_terminal()) {
            self.cancel_quietly(&run.task_id).await;
            run.status = StepStatus::Skipped;
            run.error = Some("execution cancelled".into());
            run.completed_at = Some(now);
        }
        execution.status = ExecutionStatus::Cancelled;
        execution.completed_at = Some(now);
        info!(execution_id = %id, "Cancelled workflow execution");
        Ok(execution.clone())
    }

    /// Runs one pass over every running execution.
    ///
    /// # Returns
    /// The number of step transitions made.
    pub async fn tick(&self) -> usize {
        let workflows = self.workflows.read().await;
        let mut executions = self.executions.lock().await;
        let mut changed = 0;
        for execution in executions.values_mut().filter(|e| e.status == ExecutionStatus::Running) {
            match workflows.get(&execution.workflow_id) {
                Some(stored) => changed += self.advance(execution, stored).await,
                None => warn!(execution_id = %execution.id, "Execution references unknown workflow"),
            }
        }
        changed
    }

    /// Execution counts per status.
    pub async fn execution_counts(&self) -> HashMap<ExecutionStatus, usize> {
        let executions = self.executions.lock().await;
        let mut counts = HashMap::new();
        for execution in executions.values() {
            *counts.entry(execution.status).or_default() += 1;
        }
        counts
    }

    /// Drops finished executions that ended at least `retention` ago.
    ///
    /// # Returns
    /// The number of executions removed.
    pub async fn purge_finished(&self, retention: Duration) -> usize {
        let Some(cutoff) =
            chrono::Duration::from_std(retention).ok().and_then(|r| Utc::now().checked_sub_signed(r))
        else {
            return 0;
        };

        let mut executions = self.executions.lock().await;
        let before = executions.len();
        executions.retain(|_, execution| {
            execution.status == ExecutionStatus::Running
                || execution.completed_at.is_none_or(|at| at > cutoff)
        });
        let removed = before - executions.len();
        if removed > 0 {
            debug!(removed, remaining = executions.len(), "Purged finished executions");
        }
        removed
    }

    /// Number of stored workflows.
    pub async fn workflow_count(&self) -> usize {
        self.workflows.read().await.len()
    }

    async fn advance(&self, execution: &mut WorkflowExecution, stored: &StoredWorkflow) -> usize {
        let now = Instant::now();
        let mut changed = 0;

        for step_id in stored.graph.topological_order() {
            let Some(step) = stored.workflow.steps.iter().find(|s| &s.id == step_id) else {
                continue;
            };
            let Some(status) = execution.steps.get(step_id).map(|r| r.status) else {
                continue;
            };
            if status.is_terminal() {
                continue;
            }

            let dependency_statuses: Vec<StepStatus> = step
                .dependencies
                .iter()
                .filter_map(|d| execution.steps.get(d).map(|r| r.status))
                .collect();
            let blocked = dependency_statuses
                .iter()
                .any(|s| matches!(s, StepStatus::Failed | StepStatus::TimedOut | StepStatus::Skipped));
            let ready = dependency_statuses.iter().all(|s| *s == StepStatus::Completed);
            let timeout_ms = step
                .timeout_ms
                .unwrap_or_else(|| self.default_step_timeout.as_millis() as u64);
            let expired = now >= execution.started + Duration::from_millis(timeout_ms);

            let context_id = execution.context_id.clone();
            let Some(run) = execution.steps.get_mut(step_id) else {
                continue;
            };

            if blocked {
                self.cancel_quietly(&run.task_id).await;
                finish(run, StepStatus::Skipped, Some("a dependency did not complete".into()));
                debug!(execution_id = %execution.id, step_id = %step_id, "Skipped step");
                changed += 1;
                continue;
            }

            if status == StepStatus::Dispatched {
                changed += self.observe_task(&execution.id, step, run, context_id.as_deref(), now).await;
                if run.status.is_terminal() || run.status == StepStatus::Waiting {
                    continue;
                }
            }

            if expired {
                self.cancel_quietly(&run.task_id).await;
                let err = OrchestrationError::WorkflowStepTimeout {
                    workflow: stored.workflow.id.clone(),
                    step: step_id.clone(),
                    timeout_ms,
                };
                warn!(execution_id = %execution.id, step_id = %step_id, timeout_ms, "Workflow step timed out");
                finish(run, StepStatus::TimedOut, Some(err.to_string()));
                changed += 1;
                continue;
            }

            if run.status == StepStatus::Waiting && ready && run.retry_at.is_none_or(|at| now >= at) {
                match self.coordinator.release_task(&run.task_id).await {
                    Ok(_) => {
                        run.status = StepStatus::Dispatched;
                        run.attempts += 1;
                        run.dispatched_at = Some(Utc::now());
                        run.retry_at = None;
                        debug!(
                            execution_id = %execution.id,
                            step_id = %step_id,
                            task_id = %run.task_id,
                            attempt = run.attempts,
                            "Released step"
                        );
                    }
                    Err(err) => {
                        warn!(step_id = %step_id, error = %err, "Could not release step task");
                        finish(run, StepStatus::Failed, Some(err.to_string()));
                    }
                }
                changed += 1;
            }
        }

        if execution.steps.values().all(|r| r.status.is_terminal()) {
            let succeeded = execution.steps.values().all(|r| r.status == StepStatus::Completed);
            execution.status =
                if succeeded { ExecutionStatus::Completed } else { ExecutionStatus::Failed };
            execution.completed_at = Some(Utc::now());
            if succeeded {
                info!(execution_id = %execution.id, "Workflow execution completed");
            } else {
                warn!(execution_id = %execution.id, "Workflow execution failed");
            }
        }
        changed
    }

    /// Applies the outcome of a dispatched step's task.
    async fn observe_task(
        &self,
        execution_id: &str,
        step: &WorkflowStep,
        run: &mut StepRun,
        context_id: Option<&str>,
        now: Instant,
    ) -> usize {
        let task = match self.coordinator.get_task(&run.task_id).await {
            Ok(task) => task,
            Err(err) => {
                finish(run, StepStatus::Failed, Some(err.to_string()));
                return 1;
            }
        };

        match task.status {
            TaskStatus::Pending | TaskStatus::Running => 0,
            TaskStatus::Completed => {
                if let Some(context_id) = context_id {
                    self.record_result(context_id, &step.id, task.result.clone().unwrap_or(Value::Null))
                        .await;
                }
                finish(run, StepStatus::Completed, None);
                debug!(execution_id = %execution_id, step_id = %step.id, "Step completed");
                1
            }
            TaskStatus::Failed if run.attempts < step.max_attempts() => {
                let reason = task.error.unwrap_or_else(|| "task failed".into());
                match self.coordinator.prepare_task(step_task(step, context_id)).await {
                    Ok(retry) => {
                        let backoff =
                            Duration::from_millis(step.retry_policy.map_or(0, |p| p.backoff_ms));
                        info!(
                            execution_id = %execution_id,
                            step_id = %step.id,
                            attempt = run.attempts,
                            max_attempts = step.max_attempts(),
                            "Retrying failed step"
                        );
                        run.task_id = retry.id.clone();
                        run.task_history.push(retry.id);
                        run.status = StepStatus::Waiting;
                        run.dispatched_at = None;
                        run.retry_at = Some(now + backoff);
                        run.error = Some(reason);
                    }
                    Err(err) => finish(run, StepStatus::Failed, Some(err.to_string())),
                }
                1
            }
            TaskStatus::Failed | TaskStatus::Cancelled => {
                let reason = task.error.unwrap_or_else(|| format!("task {:?}", task.status));
                warn!(execution_id = %execution_id, step_id = %step.id, error = %reason, "Step failed");
                finish(run, StepStatus::Failed, Some(reason));
                1
            }
        }
    }

    async fn record_result(&self, context_id: &str, step_id: &str, result: Value) {
        let written = self
            .contexts
            .update_with(context_id, |data| {
                let slot = data
                    .entry(STEP_RESULTS_KEY.to_string())
                    .or_insert_with(|| Value::Object(Map::new()));
                if !slot.is_object() {
                    *slot = Value::Object(Map::new());
                }
                if let Value::Object(results) = slot {
                    results.insert(step_id.to_string(), result);
                }
            })
            .await;
        if let Err(err) = written {
            warn!(context_id = %context_id, step_id = %step_id, error = %err, "Could not record step result");
        }
    }

    async fn cancel_quietly(&self, task_id: &str) {
        if let Err(err) = self.coordinator.cancel_task(task_id).await {
            debug!(task_id = %task_id, error = %err, "Step task already finished");
        }
    }
}

fn step_task(step: &WorkflowStep, context_id: Option<&str>) -> NewTask {
    NewTask {
        agent_type: step.agent_type.clone(),
        task_type: step.action.clone(),
        data: step.data.clone(),
        priority: step.priority,
        context_id: context_id.map(str::to_string),
        agent_id: None,
    }
}

fn finish(run: &mut StepRun, status: StepStatus, error: Option<String>) {
    run.status = status;
    run.completed_at = Some(Utc::now());
    run.retry_at = None;
    if error.is_some() || status == StepStatus::Completed {
        run.error = error;
    }
}
