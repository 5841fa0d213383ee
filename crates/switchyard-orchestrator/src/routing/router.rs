//! Routing service: resolves a logical service call to one healthy instance.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use super::invoker::ServiceInvoker;
use super::load_balancer::LoadBalancer;
use super::registry::{RoutableInstance, ServiceRegistry};
use super::types::{RouteRequest, RouteResponse};
use crate::error::{OrchestrationError, Result};

/// Routes logical requests through registry, breakers and load balancer.
pub struct RoutingService {
    registry: Arc<ServiceRegistry>,
    balancer: Arc<LoadBalancer>,
    invoker: Arc<dyn ServiceInvoker>,
    request_timeout: Duration,
}

impl fmt::Debug for RoutingService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutingService")
            .field("registry", &self.registry)
            .field("balancer", &self.balancer)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl RoutingService {
    /// Creates a routing service.
    ///
    /// # Arguments
    /// * `registry` - Source of healthy instances and their breakers
    /// * `balancer` - Instance selection
    /// * `invoker` - Downstream call implementation
    /// * `request_timeout` - Upper bound on one downstream call
    #[must_use]
    pub fn new(
        registry: Arc<ServiceRegistry>,
        balancer: Arc<LoadBalancer>,
        invoker: Arc<dyn ServiceInvoker>,
        request_timeout: Duration,
    ) -> Self {
        Self { registry, balancer, invoker, request_timeout }
    }

    /// The registry this service routes over.
    #[must_use]
    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// The load balancer in use.
    #[must_use]
    pub fn balancer(&self) -> &Arc<LoadBalancer> {
        &self.balancer
    }

    /// Routes one request.
    ///
    /// Never fails: routing and downstream errors are reported in the
    /// response with `success = false`.
    pub async fn route(&self, request: RouteRequest) -> RouteResponse {
        let started = Instant::now();
        let mut instance_url = None;
        let outcome = self.dispatch(&request, &mut instance_url).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let (success, response, error) = match outcome {
            Ok(body) => (true, Some(body), None),
            Err(err) => {
                debug!(
                    service = %request.service,
                    action = %request.action,
                    code = err.code(),
                    error = %err,
                    "Route failed"
                );
                (false, None, Some(err.to_detail()))
            }
        };

        RouteResponse {
            success,
            service: request.service,
            action: request.action,
            instance_url,
            response,
            error,
            latency_ms,
            context_id: request.context_id,
        }
    }

    async fn dispatch(
        &self,
        request: &RouteRequest,
        instance_url: &mut Option<String>,
    ) -> Result<serde_json::Value> {
        request.validate()?;
        let service = request.service.as_str();

        let healthy = self.registry.list_healthy(service).await;
        if healthy.is_empty() {
            return Err(OrchestrationError::ServiceUnavailable(service.to_string()));
        }

        let admitted: Vec<RoutableInstance> =
            healthy.into_iter().filter(|c| c.breaker.is_call_permitted()).collect();
        if admitted.is_empty() {
            warn!(service = %service, "All instance breakers are refusing calls");
            return Err(OrchestrationError::CircuitOpen { service: service.to_string(), instance: None });
        }

        let candidates: Vec<_> = admitted.iter().map(|c| c.instance.clone()).collect();
        let selected = self
            .balancer
            .select(service, &candidates)
            .ok_or_else(|| OrchestrationError::ServiceUnavailable(service.to_string()))?;
        *instance_url = Some(selected.url.clone());

        let breaker = admitted
            .iter()
            .find(|c| c.instance.url == selected.url)
            .map(|c| c.breaker.clone())
            .ok_or_else(|| {
                OrchestrationError::Internal(format!(
                    "load balancer selected unknown instance {}",
                    selected.url
                ))
            })?;

        // Another caller may have taken the last half-open probe slot since filtering.
        let permit = breaker.try_acquire().map_err(|rejected| {
            debug!(instance = %selected.url, state = ?rejected.state, "Breaker rejected call");
            OrchestrationError::CircuitOpen {
                service: service.to_string(),
                instance: Some(selected.url.clone()),
            }
        })?;

        let _connection = self.balancer.begin_call(&selected.url);
        let started = Instant::now();
        let outcome =
            match tokio::time::timeout(self.request_timeout, self.invoker.invoke(&selected.url, request))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(OrchestrationError::Downstream(format!(
                    "request to {} timed out after {}ms",
                    selected.url,
                    self.request_timeout.as_millis()
                ))),
            };

        match outcome {
            Ok(body) => {
                permit.succeed();
                self.registry.record_success(service, &selected.url, started.elapsed()).await;
                Ok(body)
            }
            Err(err @ OrchestrationError::Validation(_)) => {
                // Dropping the permit without an outcome frees its half-open slot.
                drop(permit);
                debug!(service = %service, instance = %selected.url, error = %err, "Request rejected before dispatch");
                Err(err)
            }
            Err(err) => {
                permit.fail();
                self.registry.record_failure(service, &selected.url).await;
                warn!(service = %service, instance = %selected.url, error = %err, "Downstream call failed");
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CircuitBreakerConfig, HealthCheckConfig};
    use crate::routing::{
        CircuitState, HealthProbe, InstanceStatus, LoadBalancingStrategy, ServiceRegistration,
    };
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct AlwaysHealthy;

    #[async_trait]
    impl HealthProbe for AlwaysHealthy {
        async fn probe(&self, _url: &str) -> Result<Duration> {
            Ok(Duration::from_millis(1))
        }
    }

    /// Invoker that records call targets and fails for configured URLs.
    #[derive(Default)]
    struct RecordingInvoker {
        calls: Mutex<Vec<String>>,
        failing: Mutex<Vec<String>>,
        delay: Option<Duration>,
        reject_requests: bool,
    }

    impl RecordingInvoker {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn fail(&self, url: &str) {
            self.failing.lock().unwrap().push(url.to_string());
        }

        fn heal(&self) {
            self.failing.lock().unwrap().clear();
        }
    }

    #[async_trait]
    impl ServiceInvoker for RecordingInvoker {
        async fn invoke(
            &self,
            instance_url: &str,
            request: &RouteRequest,
        ) -> Result<serde_json::Value> {
            self.calls.lock().unwrap().push(instance_url.to_string());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.reject_requests {
                return Err(OrchestrationError::Validation("cannot build request".into()));
            }
            if self.failing.lock().unwrap().iter().any(|u| u == instance_url) {
                return Err(OrchestrationError::Downstream("boom".into()));
            }
            Ok(serde_json::json!({"instance": instance_url, "action": request.action}))
        }
    }

    async fn service_with(
        urls: &[&str],
        invoker: Arc<RecordingInvoker>,
        timeout: Duration,
    ) -> RoutingService {
        let breaker = CircuitBreakerConfig {
            failure_threshold: 3,
            recovery_timeout_ms: 1_000,
            half_open_max_probes: 1,
            success_threshold: 1,
        };
        let registry =
            Arc::new(ServiceRegistry::new(breaker, HealthCheckConfig::default(), Arc::new(AlwaysHealthy)));
        for url in urls {
            registry.register(ServiceRegistration::new("orders", *url)).await.unwrap();
        }
        let balancer = Arc::new(LoadBalancer::new(LoadBalancingStrategy::RoundRobin, HashMap::new()));
        RoutingService::new(registry, balancer, invoker, timeout)
    }

    fn request() -> RouteRequest {
        RouteRequest::new("orders", "list", serde_json::json!({}))
    }

    #[tokio::test]
    async fn test_round_robin_routes_in_registration_order() {
        let invoker = Arc::new(RecordingInvoker::default());
        let service =
            service_with(&["http://u1", "http://u2", "http://u3"], Arc::clone(&invoker), Duration::from_secs(5))
                .await;

        for _ in 0..6 {
            assert!(service.route(request()).await.success);
        }
        assert_eq!(
            invoker.calls(),
            vec!["http://u1", "http://u2", "http://u3", "http://u1", "http://u2", "http://u3"]
        );
    }

    #[tokio::test]
    async fn test_unknown_service_is_unavailable() {
        let invoker = Arc::new(RecordingInvoker::default());
        let service = service_with(&[], Arc::clone(&invoker), Duration::from_secs(5)).await;

        let response = service.route(request()).await;
        assert!(!response.success);
        assert_eq!(response.error.unwrap().code, "SERVICE_UNAVAILABLE");
        assert!(response.instance_url.is_none());
    }

    #[tokio::test]
    async fn test_invalid_request_is_validation_error() {
        let invoker = Arc::new(RecordingInvoker::default());
        let service = service_with(&["http://u1"], Arc::clone(&invoker), Duration::from_secs(5)).await;

        let response = service.route(RouteRequest::new("orders", "", serde_json::Value::Null)).await;
        assert_eq!(response.error.unwrap().code, "VALIDATION_ERROR");
        assert!(invoker.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_opens_then_recovers() {
        let invoker = Arc::new(RecordingInvoker::default());
        invoker.fail("http://u1");
        let service = service_with(&["http://u1"], Arc::clone(&invoker), Duration::from_secs(5)).await;

        for _ in 0..3 {
            let response = service.route(request()).await;
            assert_eq!(response.error.unwrap().code, "DOWNSTREAM_ERROR");
        }

        let response = service.route(request()).await;
        assert_eq!(response.error.unwrap().code, "CIRCUIT_OPEN");
        assert_eq!(invoker.calls().len(), 3);

        tokio::time::advance(Duration::from_millis(1_000)).await;
        invoker.heal();
        let response = service.route(request()).await;
        assert!(response.success);

        let breaker = service.registry().breaker("orders", "http://u1").await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().failure_count, 0);
    }

    #[tokio::test]
    async fn test_open_instance_is_skipped() {
        let invoker = Arc::new(RecordingInvoker::default());
        invoker.fail("http://u1");
        let service =
            service_with(&["http://u1", "http://u2"], Arc::clone(&invoker), Duration::from_secs(5)).await;

        // u1 fails three times while alternating with u2, opening its breaker.
        for _ in 0..6 {
            service.route(request()).await;
        }
        let before = invoker.calls().len();
        for _ in 0..4 {
            let response = service.route(request()).await;
            assert_eq!(response.instance_url.as_deref(), Some("http://u2"));
            assert!(response.success);
        }
        assert_eq!(invoker.calls().len(), before + 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_instance_times_out() {
        let invoker =
            Arc::new(RecordingInvoker { delay: Some(Duration::from_secs(30)), ..Default::default() });
        let service = service_with(&["http://u1"], Arc::clone(&invoker), Duration::from_secs(1)).await;

        let response = service.route(request()).await;
        assert!(!response.success);
        assert_eq!(response.error.unwrap().code, "DOWNSTREAM_ERROR");
        assert_eq!(service.registry().list("orders").await[0].error_count, 1);
    }

    #[tokio::test]
    async fn test_bad_context_id_never_reaches_instance() {
        let invoker = Arc::new(RecordingInvoker::default());
        let service = service_with(&["http://u1"], Arc::clone(&invoker), Duration::from_secs(5)).await;

        for _ in 0..5 {
            let response = service.route(request().with_context("bad\nid")).await;
            assert_eq!(response.error.unwrap().code, "VALIDATION_ERROR");
        }
        assert!(invoker.calls().is_empty());
        assert!(service.route(request()).await.success);
    }

    #[tokio::test]
    async fn test_unbuildable_request_is_not_a_breaker_failure() {
        let invoker = Arc::new(RecordingInvoker { reject_requests: true, ..Default::default() });
        let service = service_with(&["http://u1"], Arc::clone(&invoker), Duration::from_secs(5)).await;

        for _ in 0..5 {
            let response = service.route(request()).await;
            assert_eq!(response.error.unwrap().code, "VALIDATION_ERROR");
        }
        assert_eq!(invoker.calls().len(), 5);

        let breaker = service.registry().breaker("orders", "http://u1").await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().failure_count, 0);
        assert_eq!(service.registry().list("orders").await[0].error_count, 0);
    }

    #[tokio::test]
    async fn test_context_id_is_echoed() {
        let invoker = Arc::new(RecordingInvoker::default());
        let service = service_with(&["http://u1"], Arc::clone(&invoker), Duration::from_secs(5)).await;

        let response = service.route(request().with_context("ctx-9")).await;
        assert_eq!(response.context_id.as_deref(), Some("ctx-9"));
        assert_eq!(response.response.unwrap()["action"], "list");
    }

    #[tokio::test]
    async fn test_degraded_instance_still_routes() {
        let health = HealthCheckConfig { degraded_threshold_ms: 0, ..HealthCheckConfig::default() };
        let registry = Arc::new(ServiceRegistry::new(
            CircuitBreakerConfig::default(),
            health,
            Arc::new(AlwaysHealthy),
        ));
        registry.register(ServiceRegistration::new("orders", "http://u1")).await.unwrap();
        registry.check_all().await;
        assert_eq!(registry.list("orders").await[0].status, InstanceStatus::Degraded);

        let invoker = Arc::new(RecordingInvoker::default());
        let balancer = Arc::new(LoadBalancer::new(LoadBalancingStrategy::RoundRobin, HashMap::new()));
        let service =
            RoutingService::new(registry, balancer, invoker.clone(), Duration::from_secs(5));

        let response = service.route(request()).await;
        assert!(response.success, "route failed: {:?}", response.error);
        assert_eq!(invoker.calls(), vec!["http://u1"]);
    }
}
