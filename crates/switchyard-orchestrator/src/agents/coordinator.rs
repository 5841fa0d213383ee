//! Agent coordinator and task scheduler.
//!
//! Agents, tasks and the pending queue share one lock, so capacity checks and
//! the assignments they allow are a single atomic step.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::types::{
    Agent, AgentRegistration, AgentStatus, Assignment, DEFAULT_PRIORITY, HeartbeatReport, NewTask,
    Task, TaskOutcome, TaskStatus,
};
use crate::error::{OrchestrationError, Result};
use crate::events::{CoordinatorEvent, EventBus};
use crate::queue::TaskQueue;
use crate::schema::TaskSchemaRegistry;

#[derive(Debug, Default)]
struct CoordinatorState {
    agents: HashMap<String, Agent>,
    tasks: HashMap<String, Task>,
    /// Task IDs in creation order.
    task_order: Vec<String>,
    queue: TaskQueue,
}

impl CoordinatorState {
    fn task_mut(&mut self, id: &str) -> Result<&mut Task> {
        self.tasks.get_mut(id).ok_or_else(|| OrchestrationError::TaskNotFound(id.to_string()))
    }

    /// Frees the agent slot held by a running task.
    fn release_slot(&mut self, agent_id: Option<&str>, events: &EventBus) {
        let Some(agent) = agent_id.and_then(|id| self.agents.get_mut(id)) else {
            return;
        };
        agent.active_tasks = agent.active_tasks.saturating_sub(1);
        refresh_and_publish(agent, events);
    }

    /// Picks the least loaded eligible agent; ties go to the earliest registration.
    fn pick_agent(&self, task: &Task) -> Option<String> {
        if let Some(pinned) = &task.agent_id {
            return self
                .agents
                .get(pinned)
                .filter(|a| a.agent_type == task.agent_type && a.has_capacity())
                .map(|a| a.id.clone());
        }
        self.agents
            .values()
            .filter(|a| a.agent_type == task.agent_type && a.has_capacity())
            .min_by(|a, b| {
                a.active_tasks
                    .cmp(&b.active_tasks)
                    .then_with(|| a.registered_at.cmp(&b.registered_at))
                    .then_with(|| a.id.cmp(&b.id))
            })
            .map(|a| a.id.clone())
    }

    /// Checks that no agent runs more tasks than it allows.
    fn verify_capacity(&self) -> Result<()> {
        let mut running: HashMap<&str, u32> = HashMap::new();
        for task in self.tasks.values().filter(|t| t.status == TaskStatus::Running) {
            if let Some(agent_id) = &task.agent_id {
                *running.entry(agent_id.as_str()).or_default() += 1;
            }
        }
        for agent in self.agents.values() {
            let count = running.get(agent.id.as_str()).copied().unwrap_or(0);
            if count > agent.max_concurrency || count != agent.active_tasks {
                error!(
                    agent_id = %agent.id,
                    running = count,
                    active_tasks = agent.active_tasks,
                    max_concurrency = agent.max_concurrency,
                    "Agent capacity invariant violated"
                );
                return Err(OrchestrationError::Internal(format!(
                    "agent {} runs {count} tasks (tracked {}, limit {})",
                    agent.id, agent.active_tasks, agent.max_concurrency
                )));
            }
        }
        Ok(())
    }
}

fn refresh_and_publish(agent: &mut Agent, events: &EventBus) {
    let from = agent.status;
    agent.refresh_status();
    publish_status_change(agent, from, events);
}

fn publish_status_change(agent: &Agent, from: AgentStatus, events: &EventBus) {
    if agent.status != from {
        debug!(agent_id = %agent.id, from = ?from, to = ?agent.status, "Agent status changed");
        events.publish(CoordinatorEvent::AgentStatusChanged {
            agent_id: agent.id.clone(),
            from,
            to: agent.status,
        });
    }
}

/// Counts reported by [`AgentCoordinator::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorStats {
    /// Registered agents.
    pub agents: usize,
    /// Agents per status.
    pub agents_by_status: HashMap<AgentStatus, usize>,
    /// Known tasks.
    pub tasks: usize,
    /// Tasks per status.
    pub tasks_by_status: HashMap<TaskStatus, usize>,
    /// Tasks waiting in the queue.
    pub queued: usize,
}

/// Tracks agents and schedules tasks onto them.
pub struct AgentCoordinator {
    state: Arc<Mutex<CoordinatorState>>,
    schemas: TaskSchemaRegistry,
    events: EventBus,
    heartbeat_timeout: Duration,
}

impl fmt::Debug for AgentCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (agents, tasks) =
            self.state.try_lock().map(|s| (s.agents.len(), s.tasks.len())).unwrap_or((0, 0));
        f.debug_struct("AgentCoordinator")
            .field("agent_count", &agents)
            .field("task_count", &tasks)
            .field("heartbeat_timeout", &self.heartbeat_timeout)
            .finish_non_exhaustive()
    }
}

impl AgentCoordinator {
    /// Creates a coordinator.
    ///
    /// # Arguments
    /// * `schemas` - Payload schemas checked on task creation
    /// * `events` - Channel for coordinator events
    /// * `heartbeat_timeout` - Silence after which an agent is marked ERROR
    #[must_use]
    pub fn new(schemas: TaskSchemaRegistry, events: EventBus, heartbeat_timeout: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(CoordinatorState::default())),
            schemas,
            events,
            heartbeat_timeout,
        }
    }

    /// Subscribes to coordinator events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.events.subscribe()
    }

    /// Number of live event subscribers.
    #[must_use]
    pub fn event_subscribers(&self) -> usize {
        self.events.subscriber_count()
    }

    /// Registers an agent, or refreshes an existing registration with the same ID.
    ///
    /// # Errors
    /// Returns a validation error for an empty name or type, or a zero concurrency limit.
    pub async fn register_agent(&self, registration: AgentRegistration) -> Result<Agent> {
        if registration.name.trim().is_empty() || registration.agent_type.trim().is_empty() {
            return Err(OrchestrationError::Validation("agent name and type are required".into()));
        }
        if registration.max_concurrency == 0 {
            return Err(OrchestrationError::Validation("maxConcurrency must be at least 1".into()));
        }

        let id = registration.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let now = Utc::now();
        let mut state = self.state.lock().await;

        if let Some(agent) = state.agents.get_mut(&id) {
            if agent.agent_type != registration.agent_type && agent.active_tasks > 0 {
                return Err(OrchestrationError::InvalidTransition {
                    entity: "agent",
                    id,
                    reason: "cannot change type while tasks are running".into(),
                });
            }
            if registration.max_concurrency < agent.active_tasks {
                return Err(OrchestrationError::InvalidTransition {
                    entity: "agent",
                    id,
                    reason: format!(
                        "maxConcurrency {} is below the {} running tasks",
                        registration.max_concurrency, agent.active_tasks
                    ),
                });
            }
            let from = agent.status;
            agent.name = registration.name;
            agent.agent_type = registration.agent_type;
            agent.capabilities = registration.capabilities;
            agent.max_concurrency = registration.max_concurrency;
            agent.last_heartbeat = now;
            agent.status = AgentStatus::Active;
            agent.refresh_status();
            publish_status_change(agent, from, &self.events);
            debug!(agent_id = %id, "Refreshed agent registration");
            return Ok(agent.clone());
        }

        let agent = Agent {
            id: id.clone(),
            name: registration.name,
            agent_type: registration.agent_type,
            status: AgentStatus::Active,
            capabilities: registration.capabilities,
            max_concurrency: registration.max_concurrency,
            active_tasks: 0,
            accepting_tasks: true,
            last_heartbeat: now,
            registered_at: now,
        };
        state.agents.insert(id.clone(), agent.clone());
        info!(
            agent_id = %id,
            agent_type = %agent.agent_type,
            max_concurrency = agent.max_concurrency,
            "Registered agent"
        );
        Ok(agent)
    }

    /// Removes an agent and cancels its running and pinned queued tasks.
    ///
    /// # Returns
    /// IDs of the cancelled tasks.
    pub async fn unregister_agent(&self, id: &str) -> Result<Vec<String>> {
        let mut state = self.state.lock().await;
        if state.agents.remove(id).is_none() {
            return Err(OrchestrationError::AgentNotFound(id.to_string()));
        }

        let now = Utc::now();
        let owned: Vec<String> = state
            .task_order
            .iter()
            .filter(|task_id| {
                state.tasks.get(*task_id).is_some_and(|t| {
                    !t.status.is_terminal() && t.agent_id.as_deref() == Some(id)
                })
            })
            .cloned()
            .collect();

        for task_id in &owned {
            state.queue.remove(task_id);
            if let Some(task) = state.tasks.get_mut(task_id) {
                task.status = TaskStatus::Cancelled;
                task.completed_at = Some(now);
                task.error = Some(format!("agent {id} unregistered"));
            }
            self.events.publish(CoordinatorEvent::TaskFinished {
                task_id: task_id.clone(),
                status: TaskStatus::Cancelled,
            });
        }

        info!(agent_id = %id, cancelled = owned.len(), "Unregistered agent");
        Ok(owned)
    }

    /// Records a heartbeat. An errored agent recovers.
    pub async fn heartbeat(&self, id: &str, report: HeartbeatReport) -> Result<Agent> {
        let mut state = self.state.lock().await;
        let agent =
            state.agents.get_mut(id).ok_or_else(|| OrchestrationError::AgentNotFound(id.to_string()))?;

        let from = agent.status;
        agent.last_heartbeat = Utc::now();
        if let Some(accepting) = report.accepting_tasks {
            agent.accepting_tasks = accepting;
        }
        if agent.status == AgentStatus::Error {
            info!(agent_id = %id, "Agent recovered after heartbeat");
            agent.status = AgentStatus::Active;
        }
        agent.refresh_status();
        publish_status_change(agent, from, &self.events);
        Ok(agent.clone())
    }

    /// Looks up an agent.
    pub async fn get_agent(&self, id: &str) -> Result<Agent> {
        let state = self.state.lock().await;
        state.agents.get(id).cloned().ok_or_else(|| OrchestrationError::AgentNotFound(id.to_string()))
    }

    /// All agents, earliest registration first.
    pub async fn list_agents(&self) -> Vec<Agent> {
        let state = self.state.lock().await;
        let mut agents: Vec<Agent> = state.agents.values().cloned().collect();
        agents.sort_by(|a, b| a.registered_at.cmp(&b.registered_at).then_with(|| a.id.cmp(&b.id)));
        agents
    }

    /// Validates and enqueues a task.
    ///
    /// # Errors
    /// Returns a validation error for a malformed task or payload, or
    /// `AgentNotFound` when pinned to an unknown agent.
    pub async fn create_task(&self, new_task: NewTask) -> Result<Task> {
        self.insert_task(new_task, true).await
    }

    /// Validates and stores a task without queueing it.
    ///
    /// The task stays pending until [`Self::release_task`] is called.
    pub async fn prepare_task(&self, new_task: NewTask) -> Result<Task> {
        self.insert_task(new_task, false).await
    }

    async fn insert_task(&self, new_task: NewTask, released: bool) -> Result<Task> {
        if new_task.agent_type.trim().is_empty() || new_task.task_type.trim().is_empty() {
            return Err(OrchestrationError::Validation("agentType and type are required".into()));
        }
        self.schemas.validate(&new_task.task_type, &new_task.data)?;

        let mut state = self.state.lock().await;
        if let Some(agent_id) = &new_task.agent_id {
            if !state.agents.contains_key(agent_id) {
                return Err(OrchestrationError::AgentNotFound(agent_id.clone()));
            }
        }

        let task = Task {
            id: Uuid::new_v4().to_string(),
            agent_id: new_task.agent_id,
            agent_type: new_task.agent_type,
            task_type: new_task.task_type,
            priority: new_task.priority.unwrap_or(DEFAULT_PRIORITY),
            data: new_task.data,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            context_id: new_task.context_id,
            released,
        };

        if released {
            state.queue.push(task.id.clone(), task.agent_type.clone(), task.priority);
        }
        state.task_order.push(task.id.clone());
        state.tasks.insert(task.id.clone(), task.clone());
        debug!(
            task_id = %task.id,
            task_type = %task.task_type,
            priority = task.priority,
            released,
            "Created task"
        );
        Ok(task)
    }

    /// Queues a held-back task for assignment.
    ///
    /// # Errors
    /// Returns `InvalidTransition` if the task is no longer pending.
    pub async fn release_task(&self, id: &str) -> Result<Task> {
        let mut state = self.state.lock().await;
        let task = state.task_mut(id)?;
        if task.status != TaskStatus::Pending {
            return Err(OrchestrationError::InvalidTransition {
                entity: "task",
                id: id.to_string(),
                reason: format!("cannot release a {:?} task", task.status),
            });
        }
        if task.released {
            return Ok(task.clone());
        }
        task.released = true;
        let task = task.clone();
        state.queue.push(task.id.clone(), task.agent_type.clone(), task.priority);
        debug!(task_id = %id, "Released task");
        Ok(task)
    }

    /// Records the outcome of a running task.
    ///
    /// # Errors
    /// Returns `InvalidTransition` unless the task is running.
    pub async fn complete_task(&self, id: &str, outcome: TaskOutcome) -> Result<Task> {
        let mut state = self.state.lock().await;
        let task = state.task_mut(id)?;
        if task.status != TaskStatus::Running {
            return Err(OrchestrationError::InvalidTransition {
                entity: "task",
                id: id.to_string(),
                reason: format!("cannot complete a {:?} task", task.status),
            });
        }

        task.completed_at = Some(Utc::now());
        match outcome {
            TaskOutcome::Succeeded(result) => {
                task.status = TaskStatus::Completed;
                task.result = result;
            }
            TaskOutcome::Failed(message) => {
                task.status = TaskStatus::Failed;
                task.error = Some(message);
            }
        }
        let task = task.clone();
        state.release_slot(task.agent_id.as_deref(), &self.events);

        info!(task_id = %id, status = ?task.status, "Task finished");
        self.events.publish(CoordinatorEvent::TaskFinished { task_id: task.id.clone(), status: task.status });
        Ok(task)
    }

    /// Cancels a task.
    ///
    /// A pending task leaves the queue immediately. A running task is only
    /// marked; the agent is not interrupted.
    ///
    /// # Errors
    /// Returns `InvalidTransition` for a task that already finished.
    pub async fn cancel_task(&self, id: &str) -> Result<Task> {
        let mut state = self.state.lock().await;
        let task = state.task_mut(id)?;
        let previous = task.status;
        if previous.is_terminal() {
            return Err(OrchestrationError::InvalidTransition {
                entity: "task",
                id: id.to_string(),
                reason: format!("cannot cancel a {previous:?} task"),
            });
        }

        task.status = TaskStatus::Cancelled;
        task.completed_at = Some(Utc::now());
        let task = task.clone();
        match previous {
            TaskStatus::Pending => {
                state.queue.remove(id);
            }
            TaskStatus::Running => state.release_slot(task.agent_id.as_deref(), &self.events),
            _ => {}
        }

        info!(task_id = %id, previous = ?previous, "Cancelled task");
        self.events.publish(CoordinatorEvent::TaskFinished {
            task_id: task.id.clone(),
            status: TaskStatus::Cancelled,
        });
        Ok(task)
    }

    /// Looks up a task.
    pub async fn get_task(&self, id: &str) -> Result<Task> {
        let state = self.state.lock().await;
        state.tasks.get(id).cloned().ok_or_else(|| OrchestrationError::TaskNotFound(id.to_string()))
    }

    /// Tasks in creation order, optionally filtered by status.
    pub async fn list_tasks(&self, status: Option<TaskStatus>) -> Vec<Task> {
        let state = self.state.lock().await;
        state
            .task_order
            .iter()
            .filter_map(|id| state.tasks.get(id))
            .filter(|t| status.is_none_or(|s| t.status == s))
            .cloned()
            .collect()
    }

    /// Queued tasks in dispatch order.
    pub async fn queue_snapshot(&self) -> Vec<Task> {
        let state = self.state.lock().await;
        state.queue.snapshot().iter().filter_map(|e| state.tasks.get(&e.task_id)).cloned().collect()
    }

    /// Runs one scheduler pass, assigning queued tasks to agents with capacity.
    ///
    /// # Errors
    /// Returns an internal error if an agent ends up over its concurrency limit.
    pub async fn assign_pending(&self) -> Result<Vec<Assignment>> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let now = Utc::now();
        let mut assignments = Vec::new();

        let mut queue = std::mem::take(&mut state.queue);
        queue.take_where(|entry| {
            let Some(task) = state.tasks.get(&entry.task_id) else {
                return true;
            };
            if task.status != TaskStatus::Pending {
                // Stale entry.
                return true;
            }
            let Some(agent_id) = state.pick_agent(task) else {
                return false;
            };

            if let Some(agent) = state.agents.get_mut(&agent_id) {
                agent.active_tasks += 1;
                refresh_and_publish(agent, &self.events);
            }
            if let Some(task) = state.tasks.get_mut(&entry.task_id) {
                task.status = TaskStatus::Running;
                task.agent_id = Some(agent_id.clone());
                task.started_at = Some(now);
            }

            debug!(task_id = %entry.task_id, agent_id = %agent_id, "Assigned task");
            self.events.publish(CoordinatorEvent::TaskAssigned {
                task_id: entry.task_id.clone(),
                agent_id: agent_id.clone(),
            });
            assignments.push(Assignment { task_id: entry.task_id.clone(), agent_id });
            true
        });
        state.queue = queue;

        state.verify_capacity()?;
        if !assignments.is_empty() {
            info!(assigned = assignments.len(), queued = state.queue.len(), "Scheduler pass");
        }
        Ok(assignments)
    }

    /// Marks agents silent for longer than the heartbeat timeout as ERROR.
    ///
    /// Their running tasks stay assigned.
    ///
    /// # Returns
    /// IDs of the agents newly marked ERROR.
    pub async fn check_heartbeats(&self) -> Vec<String> {
        let now = Utc::now();
        let timeout = chrono::Duration::from_std(self.heartbeat_timeout).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100));
        let mut state = self.state.lock().await;
        let mut stale = Vec::new();

        for agent in state.agents.values_mut() {
            if agent.status == AgentStatus::Error || now - agent.last_heartbeat < timeout {
                continue;
            }
            let from = agent.status;
            agent.status = AgentStatus::Error;
            warn!(
                agent_id = %agent.id,
                active_tasks = agent.active_tasks,
                last_heartbeat = %agent.last_heartbeat,
                "Agent missed heartbeat"
            );
            publish_status_change(agent, from, &self.events);
            stale.push(agent.id.clone());
        }
        stale
    }

    /// Drops finished tasks that completed at least `retention` ago.
    ///
    /// Pending and running tasks are never removed.
    ///
    /// # Returns
    /// The number of tasks removed.
    pub async fn purge_finished(&self, retention: Duration) -> usize {
        let Some(cutoff) =
            chrono::Duration::from_std(retention).ok().and_then(|r| Utc::now().checked_sub_signed(r))
        else {
            return 0;
        };

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let before = state.tasks.len();
        state.tasks.retain(|_, task| {
            !(task.status.is_terminal() && task.completed_at.is_some_and(|at| at <= cutoff))
        });
        let removed = before - state.tasks.len();
        if removed > 0 {
            let tasks = &state.tasks;
            state.task_order.retain(|id| tasks.contains_key(id));
            debug!(removed, remaining = state.tasks.len(), "Purged finished tasks");
        }
        removed
    }

    /// Agent and task counts.
    pub async fn stats(&self) -> CoordinatorStats {
        let state = self.state.lock().await;
        let mut stats = CoordinatorStats {
            agents: state.agents.len(),
            tasks: state.tasks.len(),
            queued: state.queue.len(),
            ..CoordinatorStats::default()
        };
        for agent in state.agents.values() {
            *stats.agents_by_status.entry(agent.status).or_default() += 1;
        }
        for task in state.tasks.values() {
            *stats.tasks_by_status.entry(task.status).or_default() += 1;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::PayloadSchema;
    use serde_json::json;

    fn coordinator() -> AgentCoordinator {
        AgentCoordinator::new(TaskSchemaRegistry::default(), EventBus::new(64), Duration::from_secs(90))
    }

    async fn tutor(coordinator: &AgentCoordinator, id: &str, max: u32) -> Agent {
        coordinator
            .register_agent(AgentRegistration::new(id, "tutor").with_id(id).with_max_concurrency(max))
            .await
            .unwrap()
    }

    fn task(priority: u32) -> NewTask {
        NewTask::new("tutor", "explain", json!({"topic": "fractions"})).with_priority(priority)
    }

    #[tokio::test]
    async fn test_purge_drops_only_old_finished_tasks() {
        let coordinator = coordinator();
        tutor(&coordinator, "a1", 1).await;
        let done = coordinator.create_task(task(5)).await.unwrap();
        let queued = coordinator.create_task(task(5)).await.unwrap();
        coordinator.assign_pending().await.unwrap();
        coordinator.complete_task(&done.id, TaskOutcome::Succeeded(None)).await.unwrap();

        assert_eq!(coordinator.purge_finished(Duration::from_secs(3600)).await, 0);
        assert_eq!(coordinator.list_tasks(None).await.len(), 2);

        assert_eq!(coordinator.purge_finished(Duration::ZERO).await, 1);
        assert!(coordinator.get_task(&done.id).await.unwrap_err().is_not_found());
        let remaining: Vec<String> = coordinator.list_tasks(None).await.into_iter().map(|t| t.id).collect();
        assert_eq!(remaining, vec![queued.id.clone()]);
        assert_eq!(coordinator.stats().await.tasks, 1);

        let assignments = coordinator.assign_pending().await.unwrap();
        assert_eq!(assignments[0].task_id, queued.id);
    }

    #[tokio::test]
    async fn test_register_validation() {
        let coordinator = coordinator();
        assert!(coordinator.register_agent(AgentRegistration::new("", "tutor")).await.is_err());
        assert!(
            coordinator
                .register_agent(AgentRegistration::new("a", "tutor").with_max_concurrency(0))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_assigns_highest_priority_first() {
        let coordinator = coordinator();
        let low = coordinator.create_task(task(1)).await.unwrap();
        let high = coordinator.create_task(task(9)).await.unwrap();
        tutor(&coordinator, "a1", 1).await;

        let assignments = coordinator.assign_pending().await.unwrap();
        assert_eq!(assignments, vec![Assignment { task_id: high.id.clone(), agent_id: "a1".into() }]);

        let queued: Vec<String> = coordinator.queue_snapshot().await.into_iter().map(|t| t.id).collect();
        assert_eq!(queued, vec![low.id]);
        assert_eq!(coordinator.get_agent("a1").await.unwrap().status, AgentStatus::Busy);
    }

    #[tokio::test]
    async fn test_unassignable_tasks_stay_queued() {
        let coordinator = coordinator();
        coordinator
            .register_agent(AgentRegistration::new("grader", "grader").with_id("g1"))
            .await
            .unwrap();
        coordinator.create_task(task(5)).await.unwrap();

        assert!(coordinator.assign_pending().await.unwrap().is_empty());
        assert_eq!(coordinator.queue_snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn test_least_loaded_agent_wins() {
        let coordinator = coordinator();
        tutor(&coordinator, "a1", 3).await;
        tutor(&coordinator, "a2", 3).await;
        for _ in 0..4 {
            coordinator.create_task(task(5)).await.unwrap();
        }

        coordinator.assign_pending().await.unwrap();
        assert_eq!(coordinator.get_agent("a1").await.unwrap().active_tasks, 2);
        assert_eq!(coordinator.get_agent("a2").await.unwrap().active_tasks, 2);
    }

    #[tokio::test]
    async fn test_cancelled_pending_task_is_never_assigned() {
        let coordinator = coordinator();
        let doomed = coordinator.create_task(task(9)).await.unwrap();
        coordinator.cancel_task(&doomed.id).await.unwrap();
        tutor(&coordinator, "a1", 5).await;

        assert!(coordinator.assign_pending().await.unwrap().is_empty());
        assert_eq!(coordinator.get_task(&doomed.id).await.unwrap().status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_complete_frees_capacity() {
        let coordinator = coordinator();
        tutor(&coordinator, "a1", 1).await;
        let first = coordinator.create_task(task(5)).await.unwrap();
        let second = coordinator.create_task(task(5)).await.unwrap();

        coordinator.assign_pending().await.unwrap();
        let done = coordinator
            .complete_task(&first.id, TaskOutcome::Succeeded(Some(json!({"ok": true}))))
            .await
            .unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.result, Some(json!({"ok": true})));

        let assignments = coordinator.assign_pending().await.unwrap();
        assert_eq!(assignments[0].task_id, second.id);
    }

    #[tokio::test]
    async fn test_invalid_transitions() {
        let coordinator = coordinator();
        let pending = coordinator.create_task(task(5)).await.unwrap();
        let err = coordinator.complete_task(&pending.id, TaskOutcome::Succeeded(None)).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_TRANSITION");

        coordinator.cancel_task(&pending.id).await.unwrap();
        assert!(coordinator.cancel_task(&pending.id).await.is_err());
        assert!(coordinator.complete_task(&pending.id, TaskOutcome::Failed("x".into())).await.is_err());
        assert!(coordinator.get_task("missing").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_cancel_running_task_marks_only() {
        let coordinator = coordinator();
        tutor(&coordinator, "a1", 1).await;
        let running = coordinator.create_task(task(5)).await.unwrap();
        coordinator.assign_pending().await.unwrap();

        let cancelled = coordinator.cancel_task(&running.id).await.unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        assert_eq!(cancelled.agent_id.as_deref(), Some("a1"));
        assert_eq!(coordinator.get_agent("a1").await.unwrap().active_tasks, 0);
        assert!(coordinator.complete_task(&running.id, TaskOutcome::Succeeded(None)).await.is_err());
    }

    #[tokio::test]
    async fn test_unregister_cancels_owned_tasks() {
        let coordinator = coordinator();
        tutor(&coordinator, "a1", 1).await;
        let running = coordinator.create_task(task(5)).await.unwrap();
        coordinator.assign_pending().await.unwrap();
        let pinned = coordinator.create_task(task(5).pinned_to("a1")).await.unwrap();
        let unrelated = coordinator.create_task(task(1)).await.unwrap();

        let mut cancelled = coordinator.unregister_agent("a1").await.unwrap();
        cancelled.sort();
        let mut expected = vec![running.id.clone(), pinned.id.clone()];
        expected.sort();
        assert_eq!(cancelled, expected);

        assert_eq!(coordinator.get_task(&unrelated.id).await.unwrap().status, TaskStatus::Pending);
        assert_eq!(coordinator.queue_snapshot().await.len(), 1);
        assert!(coordinator.unregister_agent("a1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_heartbeat_timeout_and_recovery() {
        let coordinator =
            AgentCoordinator::new(TaskSchemaRegistry::default(), EventBus::new(64), Duration::ZERO);
        let mut events = coordinator.subscribe();
        tutor(&coordinator, "a1", 1).await;
        let running = coordinator.create_task(task(5)).await.unwrap();
        coordinator.assign_pending().await.unwrap();

        assert_eq!(coordinator.check_heartbeats().await, vec!["a1".to_string()]);
        let agent = coordinator.get_agent("a1").await.unwrap();
        assert_eq!(agent.status, AgentStatus::Error);
        // At-most-once: the running task keeps its assignment.
        let assigned = coordinator.get_task(&running.id).await.unwrap();
        assert_eq!(assigned.status, TaskStatus::Running);
        assert_eq!(assigned.agent_id.as_deref(), Some("a1"));

        coordinator.create_task(task(5)).await.unwrap();
        coordinator.complete_task(&running.id, TaskOutcome::Succeeded(None)).await.unwrap();
        assert!(coordinator.assign_pending().await.unwrap().is_empty());

        let agent = coordinator.heartbeat("a1", HeartbeatReport::default()).await.unwrap();
        assert_eq!(agent.status, AgentStatus::Active);
        assert_eq!(coordinator.assign_pending().await.unwrap().len(), 1);

        let mut saw_error = false;
        while let Ok(event) = events.try_recv() {
            if let CoordinatorEvent::AgentStatusChanged { to: AgentStatus::Error, .. } = event {
                saw_error = true;
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn test_inactive_agent_receives_nothing() {
        let coordinator = coordinator();
        tutor(&coordinator, "a1", 1).await;
        let agent = coordinator
            .heartbeat("a1", HeartbeatReport { accepting_tasks: Some(false) })
            .await
            .unwrap();
        assert_eq!(agent.status, AgentStatus::Inactive);

        coordinator.create_task(task(5)).await.unwrap();
        assert!(coordinator.assign_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_held_task_waits_for_release() {
        let coordinator = coordinator();
        tutor(&coordinator, "a1", 1).await;
        let held = coordinator.prepare_task(task(5)).await.unwrap();
        assert!(!held.released);
        assert!(coordinator.assign_pending().await.unwrap().is_empty());

        coordinator.release_task(&held.id).await.unwrap();
        let assignments = coordinator.assign_pending().await.unwrap();
        assert_eq!(assignments[0].task_id, held.id);
    }

    #[tokio::test]
    async fn test_schema_validation() {
        let mut schemas = TaskSchemaRegistry::default();
        schemas.register("explain", PayloadSchema::requiring(["topic"]));
        let coordinator = AgentCoordinator::new(schemas, EventBus::new(8), Duration::from_secs(90));

        assert!(coordinator.create_task(task(5)).await.is_ok());
        let err = coordinator
            .create_task(NewTask::new("tutor", "explain", json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_concurrency_limit_under_concurrent_creation() {
        let coordinator = Arc::new(coordinator());
        tutor(&coordinator, "a1", 2).await;
        tutor(&coordinator, "a2", 3).await;

        let handles: Vec<_> = (0..40)
            .map(|i| {
                let coordinator = Arc::clone(&coordinator);
                tokio::spawn(async move {
                    coordinator.create_task(task(i % 4)).await.unwrap();
                    coordinator.assign_pending().await.unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let running = coordinator.list_tasks(Some(TaskStatus::Running)).await;
        assert_eq!(running.len(), 5);
        let on_a1 = running.iter().filter(|t| t.agent_id.as_deref() == Some("a1")).count();
        assert_eq!(on_a1, 2);
        assert_eq!(coordinator.stats().await.queued, 35);
    }
}
