// Error types for the control plane

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for orchestration operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

/// Orchestration errors
#[derive(Debug, Error)]
pub enum OrchestrationError {
    /// No healthy instance is registered for the service
    #[error("No healthy instance available for service '{0}'")]
    ServiceUnavailable(String),

    /// Every candidate instance has a circuit breaker refusing calls
    #[error("Circuit open for service '{service}'{}", instance_suffix(.instance))]
    CircuitOpen {
        /// Logical service name
        service: String,
        /// Instance whose breaker rejected the call, if a single one was tried
        instance: Option<String>,
    },

    /// Task lookup failed
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Context lookup failed (expired contexts included)
    #[error("Context not found: {0}")]
    ContextNotFound(String),

    /// Agent lookup failed
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    /// Workflow lookup failed
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    /// Workflow execution lookup failed
    #[error("Workflow execution not found: {0}")]
    ExecutionNotFound(String),

    /// A workflow step did not complete before its deadline
    #[error("Step '{step}' of workflow '{workflow}' timed out after {timeout_ms}ms")]
    WorkflowStepTimeout {
        /// Workflow ID
        workflow: String,
        /// Step ID
        step: String,
        /// Configured timeout
        timeout_ms: u64,
    },

    /// Malformed request or payload
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Lifecycle transition not allowed from the current state
    #[error("Invalid transition for {entity} '{id}': {reason}")]
    InvalidTransition {
        /// Entity kind (task, execution, ...)
        entity: &'static str,
        /// Entity ID
        id: String,
        /// Why the transition was refused
        reason: String,
    },

    /// Downstream call failed
    #[error("Downstream call failed: {0}")]
    Downstream(String),

    /// Internal invariant violated
    #[error("Internal error: {0}")]
    Internal(String),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl OrchestrationError {
    /// Stable machine-readable code for API responses.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            Self::CircuitOpen { .. } => "CIRCUIT_OPEN",
            Self::TaskNotFound(_) => "TASK_NOT_FOUND",
            Self::ContextNotFound(_) => "CONTEXT_NOT_FOUND",
            Self::AgentNotFound(_) => "AGENT_NOT_FOUND",
            Self::WorkflowNotFound(_) => "WORKFLOW_NOT_FOUND",
            Self::ExecutionNotFound(_) => "EXECUTION_NOT_FOUND",
            Self::WorkflowStepTimeout { .. } => "WORKFLOW_STEP_TIMEOUT",
            Self::Validation(_) | Self::Json(_) => "VALIDATION_ERROR",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::Downstream(_) => "DOWNSTREAM_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Returns `true` for the lookup-failure variants.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::TaskNotFound(_)
                | Self::ContextNotFound(_)
                | Self::AgentNotFound(_)
                | Self::WorkflowNotFound(_)
                | Self::ExecutionNotFound(_)
        )
    }

    /// Converts the error into its serializable API form.
    #[must_use]
    pub fn to_detail(&self) -> ErrorDetail {
        ErrorDetail { code: self.code().to_string(), message: self.to_string() }
    }
}

fn instance_suffix(instance: &Option<String>) -> String {
    instance.as_deref().map(|url| format!(" (instance {url})")).unwrap_or_default()
}

/// Serializable error body shared by route outcomes and API responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Machine-readable code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl From<&OrchestrationError> for ErrorDetail {
    fn from(err: &OrchestrationError) -> Self {
        err.to_detail()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(
            OrchestrationError::ServiceUnavailable("orders".into()).code(),
            "SERVICE_UNAVAILABLE"
        );
        assert_eq!(
            OrchestrationError::CircuitOpen { service: "orders".into(), instance: None }.code(),
            "CIRCUIT_OPEN"
        );
        assert_eq!(OrchestrationError::Validation("bad".into()).code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_circuit_open_message_includes_instance() {
        let err = OrchestrationError::CircuitOpen {
            service: "orders".into(),
            instance: Some("http://u1".into()),
        };
        assert_eq!(err.to_string(), "Circuit open for service 'orders' (instance http://u1)");

        let err = OrchestrationError::CircuitOpen { service: "orders".into(), instance: None };
        assert_eq!(err.to_string(), "Circuit open for service 'orders'");
    }

    #[test]
    fn test_not_found_classification() {
        assert!(OrchestrationError::ContextNotFound("c".into()).is_not_found());
        assert!(OrchestrationError::TaskNotFound("t".into()).is_not_found());
        assert!(!OrchestrationError::Internal("x".into()).is_not_found());
    }

    #[test]
    fn test_detail_round_trip_fields() {
        let detail = OrchestrationError::AgentNotFound("a-1".into()).to_detail();
        assert_eq!(detail.code, "AGENT_NOT_FOUND");
        assert_eq!(detail.message, "Agent not found: a-1");
    }
}
