//! Health probing for service instances.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::types::InstanceStatus;
use crate::error::{OrchestrationError, Result};

/// Probes a single health endpoint.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Probes `health_check_url` and returns the observed latency.
    ///
    /// # Errors
    /// Returns an error when the endpoint is unreachable, times out, or answers
    /// with a non-success status.
    async fn probe(&self, health_check_url: &str) -> Result<Duration>;
}

/// HTTP GET health probe with a bounded timeout.
#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpHealthProbe {
    /// Creates a probe whose requests give up after `timeout`.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| OrchestrationError::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, timeout })
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, health_check_url: &str) -> Result<Duration> {
        let started = Instant::now();
        let response = self.client.get(health_check_url).send().await.map_err(|e| {
            if e.is_timeout() {
                OrchestrationError::Downstream(format!(
                    "health check timed out after {}ms",
                    self.timeout.as_millis()
                ))
            } else {
                OrchestrationError::Downstream(format!("health check failed: {e}"))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(OrchestrationError::Downstream(format!(
                "health check returned HTTP {status}"
            )));
        }
        Ok(started.elapsed())
    }
}

/// Outcome of one health check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckResult {
    /// Service name.
    pub name: String,
    /// Instance URL.
    pub url: String,
    /// Status after applying the result.
    pub status: InstanceStatus,
    /// Probe latency, when the probe succeeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    /// Failure reason, when the probe failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the check finished.
    pub checked_at: DateTime<Utc>,
}

impl HealthCheckResult {
    /// Whether the instance passed.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.error.is_none()
    }
}
