//! Agent and task records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::queue::Priority;

/// Priority applied when a task is submitted without one.
pub const DEFAULT_PRIORITY: Priority = 5;

/// Agent availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    /// Accepting tasks with spare capacity.
    Active,
    /// Running `maxConcurrency` tasks.
    Busy,
    /// Reported itself as not accepting tasks.
    Inactive,
    /// Missed its heartbeat window.
    Error,
}

/// A registered worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    /// Agent ID.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Agent type matched against task agent types.
    #[serde(rename = "type")]
    pub agent_type: String,
    /// Current status.
    pub status: AgentStatus,
    /// Advertised capabilities.
    pub capabilities: Vec<String>,
    /// Maximum concurrently running tasks.
    pub max_concurrency: u32,
    /// Tasks currently running on the agent.
    pub active_tasks: u32,
    /// Whether the agent reported itself available.
    pub accepting_tasks: bool,
    /// Last heartbeat (or registration) time.
    pub last_heartbeat: DateTime<Utc>,
    /// Registration time.
    pub registered_at: DateTime<Utc>,
}

impl Agent {
    /// Whether the agent can take one more task.
    #[must_use]
    pub fn has_capacity(&self) -> bool {
        self.status == AgentStatus::Active && self.active_tasks < self.max_concurrency
    }

    /// Recomputes the status from availability and load. Errored agents stay errored.
    pub(crate) fn refresh_status(&mut self) {
        if self.status == AgentStatus::Error {
            return;
        }
        self.status = if !self.accepting_tasks {
            AgentStatus::Inactive
        } else if self.active_tasks >= self.max_concurrency {
            AgentStatus::Busy
        } else {
            AgentStatus::Active
        };
    }
}

fn default_max_concurrency() -> u32 {
    1
}

/// Registration payload for an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRegistration {
    /// Stable ID; generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    /// Display name.
    pub name: String,
    /// Agent type.
    #[serde(rename = "type")]
    pub agent_type: String,
    /// Advertised capabilities.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Maximum concurrently running tasks.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: u32,
}

impl AgentRegistration {
    /// Registration with a generated ID and concurrency 1.
    #[must_use]
    pub fn new(name: impl Into<String>, agent_type: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            agent_type: agent_type.into(),
            capabilities: Vec::new(),
            max_concurrency: default_max_concurrency(),
        }
    }

    /// Sets a fixed ID.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Sets the concurrency limit.
    #[must_use]
    pub fn with_max_concurrency(mut self, max_concurrency: u32) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }
}

/// Optional state reported with a heartbeat.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatReport {
    /// Switches the agent between ACTIVE and INACTIVE.
    #[serde(default)]
    pub accepting_tasks: Option<bool>,
}

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Whether no further transition is possible.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown task status '{other}'")),
        }
    }
}

/// A unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Task ID.
    pub id: String,
    /// Agent running (or pinned to run) the task.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Agent type that may run the task.
    pub agent_type: String,
    /// Task type.
    #[serde(rename = "type")]
    pub task_type: String,
    /// Priority (higher first).
    pub priority: Priority,
    /// Task payload.
    pub data: serde_json::Value,
    /// Lifecycle status.
    pub status: TaskStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// When an agent picked the task up.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Result reported on completion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Error reported on failure or cancellation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Context the task works in.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
    /// False while a workflow holds the task back from assignment.
    pub released: bool,
}

/// Task submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTask {
    /// Agent type that may run the task.
    pub agent_type: String,
    /// Task type.
    #[serde(rename = "type")]
    pub task_type: String,
    /// Task payload.
    #[serde(default)]
    pub data: serde_json::Value,
    /// Priority (higher first).
    #[serde(default)]
    pub priority: Option<Priority>,
    /// Context the task works in.
    #[serde(default)]
    pub context_id: Option<String>,
    /// Restricts assignment to one agent.
    #[serde(default)]
    pub agent_id: Option<String>,
}

impl NewTask {
    /// Task of `task_type` for agents of `agent_type`.
    #[must_use]
    pub fn new(
        agent_type: impl Into<String>,
        task_type: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            agent_type: agent_type.into(),
            task_type: task_type.into(),
            data,
            priority: None,
            context_id: None,
            agent_id: None,
        }
    }

    /// Sets the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Sets the context.
    #[must_use]
    pub fn with_context(mut self, context_id: impl Into<String>) -> Self {
        self.context_id = Some(context_id.into());
        self
    }

    /// Pins the task to one agent.
    #[must_use]
    pub fn pinned_to(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }
}

/// Outcome reported when a task finishes.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// The task succeeded.
    Succeeded(Option<serde_json::Value>),
    /// The task failed.
    Failed(String),
}

/// A task handed to an agent by one scheduler pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    /// Task ID.
    pub task_id: String,
    /// Agent ID.
    pub agent_id: String,
}
