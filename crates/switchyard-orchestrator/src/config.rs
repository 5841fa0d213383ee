//! Configuration for the control plane components.
//!
//! Every duration is expressed in milliseconds so the structs deserialize from
//! plain TOML or environment variables without a duration parser.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{OrchestrationError, Result};
use crate::routing::LoadBalancingStrategy;
use crate::schema::PayloadSchema;

/// Root configuration for the orchestrator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Health monitor settings.
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    /// Default settings for every instance circuit breaker.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    /// Routing settings.
    #[serde(default)]
    pub routing: RoutingConfig,
    /// Context store settings.
    #[serde(default)]
    pub context: ContextConfig,
    /// Task scheduler settings.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Workflow engine settings.
    #[serde(default)]
    pub workflow: WorkflowConfig,
    /// Payload schemas keyed by task type.
    #[serde(default)]
    pub task_schemas: HashMap<String, PayloadSchema>,
}

impl OrchestratorConfig {
    /// Rejects settings the components cannot run with.
    ///
    /// Intervals feed `tokio::time::interval`, which panics on zero, and a
    /// breaker with no probe slots never leaves OPEN.
    ///
    /// # Errors
    /// Returns `Validation` naming the first setting that must be at least 1.
    pub fn validate(&self) -> Result<()> {
        let at_least_one = [
            ("health_check.interval_ms", self.health_check.interval_ms),
            ("health_check.timeout_ms", self.health_check.timeout_ms),
            ("circuit_breaker.failure_threshold", u64::from(self.circuit_breaker.failure_threshold)),
            ("circuit_breaker.half_open_max_probes", u64::from(self.circuit_breaker.half_open_max_probes)),
            ("circuit_breaker.success_threshold", u64::from(self.circuit_breaker.success_threshold)),
            ("routing.request_timeout_ms", self.routing.request_timeout_ms),
            ("context.sweep_interval_ms", self.context.sweep_interval_ms),
            ("scheduler.tick_interval_ms", self.scheduler.tick_interval_ms),
            (
                "scheduler.event_capacity",
                u64::try_from(self.scheduler.event_capacity).unwrap_or(u64::MAX),
            ),
            ("workflow.poll_interval_ms", self.workflow.poll_interval_ms),
        ];

        match at_least_one.iter().find(|(_, value)| *value == 0) {
            Some((name, _)) => {
                Err(OrchestrationError::Validation(format!("{name} must be at least 1")))
            }
            None => Ok(()),
        }
    }
}

/// Health monitor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    /// Interval between health sweeps.
    #[serde(default = "default_health_interval_ms")]
    pub interval_ms: u64,
    /// Timeout for a single probe.
    #[serde(default = "default_health_timeout_ms")]
    pub timeout_ms: u64,
    /// Probe latency above which a healthy instance is reported as degraded.
    #[serde(default = "default_degraded_threshold_ms")]
    pub degraded_threshold_ms: u64,
}

fn default_health_interval_ms() -> u64 {
    30_000
}

fn default_health_timeout_ms() -> u64 {
    5_000
}

fn default_degraded_threshold_ms() -> u64 {
    2_000
}

impl HealthCheckConfig {
    /// Interval between sweeps.
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Probe timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_health_interval_ms(),
            timeout_ms: default_health_timeout_ms(),
            degraded_threshold_ms: default_degraded_threshold_ms(),
        }
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open a closed circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Time after the last failure before a probe is allowed.
    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,
    /// Maximum concurrent probes while half-open.
    #[serde(default = "default_half_open_max_probes")]
    pub half_open_max_probes: u32,
    /// Consecutive probe successes that close a half-open circuit.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_ms() -> u64 {
    60_000
}

fn default_half_open_max_probes() -> u32 {
    1
}

fn default_success_threshold() -> u32 {
    1
}

impl CircuitBreakerConfig {
    /// Recovery timeout as a duration.
    #[must_use]
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
            half_open_max_probes: default_half_open_max_probes(),
            success_threshold: default_success_threshold(),
        }
    }
}

/// Routing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Timeout for one downstream call.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Strategy used for services without an override.
    #[serde(default)]
    pub default_strategy: LoadBalancingStrategy,
    /// Per-service strategy overrides.
    #[serde(default)]
    pub strategies: HashMap<String, LoadBalancingStrategy>,
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

impl RoutingConfig {
    /// Downstream call timeout.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            default_strategy: LoadBalancingStrategy::default(),
            strategies: HashMap::new(),
        }
    }
}

/// Context store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// TTL applied when a context is created without one.
    #[serde(default = "default_context_ttl_ms")]
    pub default_ttl_ms: u64,
    /// Interval between expiry sweeps.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

fn default_context_ttl_ms() -> u64 {
    60 * 60 * 1000
}

fn default_sweep_interval_ms() -> u64 {
    60_000
}

impl ContextConfig {
    /// Default TTL.
    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    /// Sweep interval.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: default_context_ttl_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

/// Task scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Interval between assignment passes.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Silence after which an agent is marked as errored.
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    /// Capacity of the coordinator event channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// How long finished tasks stay queryable before they are purged.
    #[serde(default = "default_retention_ms")]
    pub task_retention_ms: u64,
}

fn default_tick_interval_ms() -> u64 {
    1_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    90_000
}

fn default_event_capacity() -> usize {
    256
}

fn default_retention_ms() -> u64 {
    60 * 60 * 1000
}

impl SchedulerConfig {
    /// Tick interval.
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Heartbeat timeout.
    #[must_use]
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    /// Retention of finished tasks.
    #[must_use]
    pub fn task_retention(&self) -> Duration {
        Duration::from_millis(self.task_retention_ms)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            event_capacity: default_event_capacity(),
            task_retention_ms: default_retention_ms(),
        }
    }
}

/// Workflow engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Interval between readiness passes.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Step timeout applied when a step declares none.
    #[serde(default = "default_step_timeout_ms")]
    pub default_step_timeout_ms: u64,
    /// How long finished executions stay queryable before they are purged.
    #[serde(default = "default_retention_ms")]
    pub execution_retention_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_step_timeout_ms() -> u64 {
    5 * 60 * 1000
}

impl WorkflowConfig {
    /// Poll interval.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Default step timeout.
    #[must_use]
    pub fn default_step_timeout(&self) -> Duration {
        Duration::from_millis(self.default_step_timeout_ms)
    }

    /// Retention of finished executions.
    #[must_use]
    pub fn execution_retention(&self) -> Duration {
        Duration::from_millis(self.execution_retention_ms)
    }
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            default_step_timeout_ms: default_step_timeout_ms(),
            execution_retention_ms: default_retention_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.circuit_breaker.half_open_max_probes, 1);
        assert_eq!(config.context.default_ttl(), Duration::from_secs(3600));
        assert_eq!(config.routing.default_strategy, LoadBalancingStrategy::RoundRobin);
        assert!(config.task_schemas.is_empty());
    }

    #[test]
    fn test_deserialize_partial() {
        let json = r#"{
            "circuit_breaker": {"failure_threshold": 3, "recovery_timeout_ms": 500},
            "routing": {"strategies": {"orders": "LEAST_CONNECTIONS"}}
        }"#;
        let config: OrchestratorConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.circuit_breaker.recovery_timeout(), Duration::from_millis(500));
        assert_eq!(config.circuit_breaker.success_threshold, 1);
        assert_eq!(
            config.routing.strategies.get("orders"),
            Some(&LoadBalancingStrategy::LeastConnections)
        );
        assert_eq!(config.scheduler.tick_interval(), Duration::from_secs(1));
        assert_eq!(config.scheduler.task_retention(), Duration::from_secs(3600));
    }

    #[test]
    fn test_validate_accepts_defaults() {
        assert!(OrchestratorConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_intervals_and_half_open_slots() {
        let cases: [fn(&mut OrchestratorConfig); 6] = [
            |c| c.scheduler.tick_interval_ms = 0,
            |c| c.health_check.interval_ms = 0,
            |c| c.context.sweep_interval_ms = 0,
            |c| c.workflow.poll_interval_ms = 0,
            |c| c.circuit_breaker.half_open_max_probes = 0,
            |c| c.scheduler.event_capacity = 0,
        ];
        for mutate in cases {
            let mut config = OrchestratorConfig::default();
            mutate(&mut config);
            let err = config.validate().unwrap_err();
            assert_eq!(err.code(), "VALIDATION_ERROR");
            assert!(err.to_string().contains("must be at least 1"));
        }

        let mut config = OrchestratorConfig::default();
        config.scheduler.tick_interval_ms = 0;
        assert!(config.validate().unwrap_err().to_string().contains("scheduler.tick_interval_ms"));
    }
}
