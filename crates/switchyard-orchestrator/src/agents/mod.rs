//! Agent registry and task scheduling.

pub mod coordinator;
pub mod types;

pub use coordinator::{AgentCoordinator, CoordinatorStats};
pub use types::{
    Agent, AgentRegistration, AgentStatus, Assignment, DEFAULT_PRIORITY, HeartbeatReport, NewTask,
    Task, TaskOutcome, TaskStatus,
};
