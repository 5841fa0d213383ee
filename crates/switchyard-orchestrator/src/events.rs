//! Coordinator event channel.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::agents::{AgentStatus, TaskStatus};

/// State change published by the agent coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum CoordinatorEvent {
    /// A task was handed to an agent.
    #[serde(rename_all = "camelCase")]
    TaskAssigned { task_id: String, agent_id: String },
    /// A task reached a terminal status.
    #[serde(rename_all = "camelCase")]
    TaskFinished { task_id: String, status: TaskStatus },
    /// An agent's status changed.
    #[serde(rename_all = "camelCase")]
    AgentStatusChanged { agent_id: String, from: AgentStatus, to: AgentStatus },
}

/// Bounded broadcast of coordinator events.
///
/// Slow subscribers lose the oldest events rather than blocking publishers.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoordinatorEvent>,
}

impl EventBus {
    /// Creates a bus holding at most `capacity` undelivered events per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes an event. Publishing with no subscribers is not an error.
    pub fn publish(&self, event: CoordinatorEvent) {
        trace!(event = ?event, "Publishing coordinator event");
        let _ = self.sender.send(event);
    }

    /// Subscribes to events published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
