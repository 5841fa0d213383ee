//! Types shared by the routing components.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorDetail, OrchestrationError, Result};

use super::circuit_breaker::CircuitState;

/// Health status of a service instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    /// Passing health checks; eligible for routing.
    #[default]
    Active,
    /// Administratively out of rotation.
    Inactive,
    /// Healthy but slow to answer its health probe.
    Degraded,
    /// Failing health checks.
    Error,
}

/// One concrete endpoint implementing a logical service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstance {
    /// Logical service name.
    pub name: String,
    /// Base URL of the instance.
    pub url: String,
    /// URL probed by the health monitor.
    pub health_check_url: String,
    /// Capabilities advertised at registration.
    pub capabilities: Vec<String>,
    /// Current health status.
    pub status: InstanceStatus,
    /// Weight for the weighted strategy.
    pub weight: u32,
    /// When the instance was registered.
    pub registered_at: DateTime<Utc>,
    /// When the last health check finished.
    pub last_health_check: Option<DateTime<Utc>>,
    /// Latency of the last successful call or probe.
    pub response_time_ms: u64,
    /// Errors since the last success.
    pub error_count: u64,
    /// Calls routed to this instance.
    pub request_count: u64,
    /// Failed calls since registration.
    pub failure_total: u64,
    /// Breaker state at the time the snapshot was taken.
    pub circuit_state: CircuitState,
}

impl ServiceInstance {
    /// Failure ratio over routed calls, in `0.0..=1.0`.
    #[must_use]
    pub fn error_rate(&self) -> f64 {
        if self.request_count == 0 {
            return 0.0;
        }
        (self.failure_total as f64 / self.request_count as f64).min(1.0)
    }
}

/// Registration payload for a service instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRegistration {
    /// Logical service name.
    pub name: String,
    /// Base URL (scheme and host, optionally port).
    pub url: String,
    /// Port appended to `url` when given.
    #[serde(default)]
    pub port: Option<u16>,
    /// Advertised capabilities.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Health endpoint; defaults to `{url}/health`.
    #[serde(default)]
    pub health_check_url: Option<String>,
    /// Weight for the weighted strategy (default 1).
    #[serde(default)]
    pub weight: Option<u32>,
}

impl ServiceRegistration {
    /// Creates a registration for `name` at `url`.
    #[must_use]
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            port: None,
            capabilities: Vec::new(),
            health_check_url: None,
            weight: None,
        }
    }

    /// Sets the weight.
    #[must_use]
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = Some(weight);
        self
    }

    /// Sets the capabilities.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Validates the registration and resolves the instance URL.
    ///
    /// Returns the normalized base URL (no trailing slash).
    pub fn resolve_url(&self) -> Result<String> {
        if self.name.trim().is_empty() {
            return Err(OrchestrationError::Validation("service name is required".into()));
        }
        let mut url = reqwest::Url::parse(&self.url).map_err(|e| {
            OrchestrationError::Validation(format!("invalid service url '{}': {e}", self.url))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(OrchestrationError::Validation(format!(
                "unsupported url scheme '{}'",
                url.scheme()
            )));
        }
        if let Some(port) = self.port {
            url.set_port(Some(port)).map_err(|()| {
                OrchestrationError::Validation(format!("cannot set port on '{}'", self.url))
            })?;
        }
        if self.weight == Some(0) {
            return Err(OrchestrationError::Validation("weight must be at least 1".into()));
        }
        Ok(url.as_str().trim_end_matches('/').to_string())
    }
}

/// A logical routing request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteRequest {
    /// Logical service name.
    pub service: String,
    /// Action appended as `/api/{action}`.
    pub action: String,
    /// JSON body forwarded downstream.
    #[serde(default, alias = "data")]
    pub payload: serde_json::Value,
    /// Context the call belongs to.
    #[serde(default, alias = "context")]
    pub context_id: Option<String>,
}

impl RouteRequest {
    /// Creates a request without a context.
    #[must_use]
    pub fn new(
        service: impl Into<String>,
        action: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self { service: service.into(), action: action.into(), payload, context_id: None }
    }

    /// Attaches a context ID.
    #[must_use]
    pub fn with_context(mut self, context_id: impl Into<String>) -> Self {
        self.context_id = Some(context_id.into());
        self
    }

    /// Validates that the request can be routed.
    pub fn validate(&self) -> Result<()> {
        if self.service.trim().is_empty() {
            return Err(OrchestrationError::Validation("service is required".into()));
        }
        let action = self.action.trim_matches('/');
        if action.is_empty() {
            return Err(OrchestrationError::Validation("action is required".into()));
        }
        if action.split('/').any(|segment| segment.is_empty() || segment == "..") {
            return Err(OrchestrationError::Validation(format!(
                "invalid action '{}'",
                self.action
            )));
        }
        if let Some(context_id) = &self.context_id {
            if reqwest::header::HeaderValue::from_str(context_id).is_err() {
                return Err(OrchestrationError::Validation(
                    "contextId contains characters not allowed in a header".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Outcome of a routed call. Failures are data, not errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteResponse {
    /// Whether the downstream call succeeded.
    pub success: bool,
    /// Service that was routed to.
    pub service: String,
    /// Action that was invoked.
    pub action: String,
    /// Instance that handled (or failed) the call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_url: Option<String>,
    /// Downstream response body.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<serde_json::Value>,
    /// Failure detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    /// Wall-clock latency of the route call.
    pub latency_ms: u64,
    /// Echoed context ID.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_url_appends_port() {
        let mut reg = ServiceRegistration::new("orders", "http://localhost");
        reg.port = Some(8081);
        assert_eq!(reg.resolve_url().unwrap(), "http://localhost:8081");
    }

    #[test]
    fn test_resolve_url_strips_trailing_slash() {
        let reg = ServiceRegistration::new("orders", "http://orders.internal:9000/");
        assert_eq!(reg.resolve_url().unwrap(), "http://orders.internal:9000");
    }

    #[test]
    fn test_resolve_url_rejects_bad_input() {
        assert!(ServiceRegistration::new("orders", "not a url").resolve_url().is_err());
        assert!(ServiceRegistration::new("", "http://localhost").resolve_url().is_err());
        assert!(ServiceRegistration::new("orders", "ftp://localhost").resolve_url().is_err());
        assert!(
            ServiceRegistration::new("orders", "http://localhost")
                .with_weight(0)
                .resolve_url()
                .is_err()
        );
    }

    #[test]
    fn test_route_request_accepts_api_field_names() {
        let json = r#"{"service": "courses", "action": "list", "data": {"page": 1}, "context": "ctx-1"}"#;
        let req: RouteRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.payload["page"], 1);
        assert_eq!(req.context_id.as_deref(), Some("ctx-1"));
    }

    #[test]
    fn test_route_request_validation() {
        assert!(RouteRequest::new("courses", "list", serde_json::Value::Null).validate().is_ok());
        assert!(RouteRequest::new("courses", "a/b", serde_json::Value::Null).validate().is_ok());
        assert!(RouteRequest::new("", "list", serde_json::Value::Null).validate().is_err());
        assert!(RouteRequest::new("courses", "", serde_json::Value::Null).validate().is_err());
        assert!(RouteRequest::new("courses", "../admin", serde_json::Value::Null).validate().is_err());
    }

    #[test]
    fn test_route_request_rejects_context_id_unfit_for_header() {
        let ok = RouteRequest::new("courses", "list", serde_json::Value::Null).with_context("ctx-1");
        assert!(ok.validate().is_ok());

        let err = RouteRequest::new("courses", "list", serde_json::Value::Null)
            .with_context("bad\nid")
            .validate()
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_error_rate() {
        let instance = ServiceInstance {
            name: "orders".into(),
            url: "http://u1".into(),
            health_check_url: "http://u1/health".into(),
            capabilities: vec![],
            status: InstanceStatus::Active,
            weight: 1,
            registered_at: Utc::now(),
            last_health_check: None,
            response_time_ms: 0,
            error_count: 0,
            request_count: 4,
            failure_total: 1,
            circuit_state: CircuitState::Closed,
        };
        assert!((instance.error_rate() - 0.25).abs() < f64::EPSILON);
    }
}
