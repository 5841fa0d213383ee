//! Service registry.
//!
//! Tracks every instance of every logical service, in registration order,
//! together with the circuit breaker that guards it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::circuit_breaker::CircuitBreaker;
use super::health::{HealthCheckResult, HealthProbe};
use super::types::{InstanceStatus, ServiceInstance, ServiceRegistration};
use crate::config::{CircuitBreakerConfig, HealthCheckConfig};
use crate::error::Result;

#[derive(Debug)]
struct InstanceEntry {
    instance: ServiceInstance,
    breaker: CircuitBreaker,
}

impl InstanceEntry {
    fn snapshot(&self) -> ServiceInstance {
        let mut instance = self.instance.clone();
        instance.circuit_state = self.breaker.state();
        instance
    }
}

/// An instance eligible for routing, paired with its breaker.
#[derive(Debug, Clone)]
pub struct RoutableInstance {
    /// Instance snapshot.
    pub instance: ServiceInstance,
    /// Breaker guarding the instance.
    pub breaker: CircuitBreaker,
}

/// Registry of service instances.
pub struct ServiceRegistry {
    /// Instances keyed by service name, in registration order.
    services: Arc<RwLock<HashMap<String, Vec<InstanceEntry>>>>,
    breaker_config: CircuitBreakerConfig,
    health_config: HealthCheckConfig,
    probe: Arc<dyn HealthProbe>,
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("service_count", &self.services.try_read().map(|s| s.len()).unwrap_or(0))
            .finish_non_exhaustive()
    }
}

impl ServiceRegistry {
    /// Creates an empty registry.
    ///
    /// # Arguments
    /// * `breaker_config` - Thresholds for every instance breaker
    /// * `health_config` - Health monitor settings
    /// * `probe` - Health probe used by [`Self::health_check`]
    #[must_use]
    pub fn new(
        breaker_config: CircuitBreakerConfig,
        health_config: HealthCheckConfig,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        Self {
            services: Arc::new(RwLock::new(HashMap::new())),
            breaker_config,
            health_config,
            probe,
        }
    }

    /// Registers an instance, or updates it in place if its URL is already known.
    ///
    /// Re-registration keeps the instance statistics and breaker.
    ///
    /// # Errors
    /// Returns a validation error for a malformed registration.
    pub async fn register(&self, registration: ServiceRegistration) -> Result<ServiceInstance> {
        let url = registration.resolve_url()?;
        let health_check_url =
            registration.health_check_url.clone().unwrap_or_else(|| format!("{url}/health"));
        let weight = registration.weight.unwrap_or(1);

        let mut services = self.services.write().await;
        let entries = services.entry(registration.name.clone()).or_default();

        if let Some(entry) = entries.iter_mut().find(|e| e.instance.url == url) {
            entry.instance.capabilities = registration.capabilities;
            entry.instance.health_check_url = health_check_url;
            entry.instance.weight = weight;
            debug!(service = %registration.name, instance = %url, "Updated registered instance");
            return Ok(entry.snapshot());
        }

        let entry = InstanceEntry {
            instance: ServiceInstance {
                name: registration.name.clone(),
                url: url.clone(),
                health_check_url,
                capabilities: registration.capabilities,
                status: InstanceStatus::Active,
                weight,
                registered_at: Utc::now(),
                last_health_check: None,
                response_time_ms: 0,
                error_count: 0,
                request_count: 0,
                failure_total: 0,
                circuit_state: super::CircuitState::Closed,
            },
            breaker: CircuitBreaker::new(url.clone(), self.breaker_config),
        };
        let snapshot = entry.snapshot();
        entries.push(entry);

        info!(service = %registration.name, instance = %url, "Registered service instance");
        Ok(snapshot)
    }

    /// Removes an instance.
    ///
    /// # Returns
    /// Returns `true` if the instance was found and removed.
    pub async fn deregister(&self, name: &str, url: &str) -> bool {
        let url = url.trim_end_matches('/');
        let mut services = self.services.write().await;
        let Some(entries) = services.get_mut(name) else {
            warn!(service = %name, "Attempted to deregister from unknown service");
            return false;
        };

        let before = entries.len();
        entries.retain(|e| e.instance.url != url);
        let removed = entries.len() < before;
        if entries.is_empty() {
            services.remove(name);
        }

        if removed {
            info!(service = %name, instance = %url, "Deregistered service instance");
        } else {
            warn!(service = %name, instance = %url, "Attempted to deregister unknown instance");
        }
        removed
    }

    /// All instances of `name`, in registration order.
    pub async fn list(&self, name: &str) -> Vec<ServiceInstance> {
        let services = self.services.read().await;
        services
            .get(name)
            .map(|entries| entries.iter().map(InstanceEntry::snapshot).collect())
            .unwrap_or_default()
    }

    /// Instances of `name` that may receive traffic, in registration order.
    ///
    /// Active and degraded instances are routable; breakers are not consulted.
    pub async fn list_healthy(&self, name: &str) -> Vec<RoutableInstance> {
        let services = self.services.read().await;
        services
            .get(name)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| {
                        matches!(e.instance.status, InstanceStatus::Active | InstanceStatus::Degraded)
                    })
                    .map(|e| RoutableInstance { instance: e.snapshot(), breaker: e.breaker.clone() })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Registered service names, sorted.
    pub async fn services(&self) -> Vec<String> {
        let services = self.services.read().await;
        let mut names: Vec<String> = services.keys().cloned().collect();
        names.sort();
        names
    }

    /// Every instance of every service, grouped by service name.
    pub async fn snapshot(&self) -> HashMap<String, Vec<ServiceInstance>> {
        let services = self.services.read().await;
        services
            .iter()
            .map(|(name, entries)| {
                (name.clone(), entries.iter().map(InstanceEntry::snapshot).collect())
            })
            .collect()
    }

    /// Total number of registered instances.
    pub async fn instance_count(&self) -> usize {
        let services = self.services.read().await;
        services.values().map(Vec::len).sum()
    }

    /// Breaker for one instance.
    pub async fn breaker(&self, name: &str, url: &str) -> Option<CircuitBreaker> {
        let services = self.services.read().await;
        services
            .get(name)?
            .iter()
            .find(|e| e.instance.url == url)
            .map(|e| e.breaker.clone())
    }

    /// Records a successful routed call.
    pub async fn record_success(&self, name: &str, url: &str, latency: Duration) {
        let mut services = self.services.write().await;
        if let Some(entry) = find_entry(&mut services, name, url) {
            entry.instance.request_count += 1;
            entry.instance.response_time_ms = latency.as_millis() as u64;
            entry.instance.error_count = 0;
        }
    }

    /// Records a failed routed call.
    pub async fn record_failure(&self, name: &str, url: &str) {
        let mut services = self.services.write().await;
        if let Some(entry) = find_entry(&mut services, name, url) {
            entry.instance.request_count += 1;
            entry.instance.failure_total += 1;
            entry.instance.error_count += 1;
        }
    }

    /// Probes one instance and applies the result.
    ///
    /// # Returns
    /// Returns `None` if the instance is not registered.
    pub async fn health_check(&self, name: &str, url: &str) -> Option<HealthCheckResult> {
        let health_check_url = {
            let services = self.services.read().await;
            services
                .get(name)?
                .iter()
                .find(|e| e.instance.url == url)
                .map(|e| e.instance.health_check_url.clone())?
        };

        let outcome = self.probe.probe(&health_check_url).await;
        self.apply_health_result(name, url, outcome).await
    }

    /// Probes every instance of every service concurrently.
    pub async fn check_all(&self) -> Vec<HealthCheckResult> {
        let targets: Vec<(String, String)> = {
            let services = self.services.read().await;
            services
                .iter()
                .flat_map(|(name, entries)| {
                    entries.iter().map(move |e| (name.clone(), e.instance.url.clone()))
                })
                .collect()
        };

        debug!(instances = targets.len(), "Running health checks");
        join_all(targets.iter().map(|(name, url)| self.health_check(name, url)))
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    /// Probes every instance of one service.
    pub async fn check_service(&self, name: &str) -> Vec<HealthCheckResult> {
        let urls: Vec<String> = self.list(name).await.into_iter().map(|i| i.url).collect();
        join_all(urls.iter().map(|url| self.health_check(name, url)))
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    async fn apply_health_result(
        &self,
        name: &str,
        url: &str,
        outcome: Result<Duration>,
    ) -> Option<HealthCheckResult> {
        let mut services = self.services.write().await;
        // The instance may have been deregistered while the probe was in flight.
        let entry = find_entry(&mut services, name, url)?;
        let checked_at = Utc::now();
        entry.instance.last_health_check = Some(checked_at);

        match outcome {
            Ok(latency) => {
                let latency_ms = latency.as_millis() as u64;
                let status = if latency_ms > self.health_config.degraded_threshold_ms {
                    InstanceStatus::Degraded
                } else {
                    InstanceStatus::Active
                };
                if entry.instance.status != status {
                    info!(
                        service = %name,
                        instance = %url,
                        from = ?entry.instance.status,
                        to = ?status,
                        "Instance status changed"
                    );
                }
                entry.instance.status = status;
                entry.instance.error_count = 0;
                entry.instance.response_time_ms = latency_ms;
                Some(HealthCheckResult {
                    name: name.to_string(),
                    url: url.to_string(),
                    status,
                    latency_ms: Some(latency_ms),
                    error: None,
                    checked_at,
                })
            }
            Err(err) => {
                entry.instance.status = InstanceStatus::Error;
                entry.instance.error_count += 1;
                entry.breaker.record_external_failure();
                warn!(
                    service = %name,
                    instance = %url,
                    error_count = entry.instance.error_count,
                    error = %err,
                    "Health check failed"
                );
                Some(HealthCheckResult {
                    name: name.to_string(),
                    url: url.to_string(),
                    status: InstanceStatus::Error,
                    latency_ms: None,
                    error: Some(err.to_string()),
                    checked_at,
                })
            }
        }
    }
}

fn find_entry<'a>(
    services: &'a mut HashMap<String, Vec<InstanceEntry>>,
    name: &str,
    url: &str,
) -> Option<&'a mut InstanceEntry> {
    services.get_mut(name)?.iter_mut().find(|e| e.instance.url == url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OrchestrationError;
    use crate::routing::CircuitState;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Probe returning scripted outcomes per health URL.
    #[derive(Default)]
    struct ScriptedProbe {
        outcomes: Mutex<HashMap<String, std::result::Result<u64, String>>>,
    }

    impl ScriptedProbe {
        fn set(&self, url: &str, outcome: std::result::Result<u64, String>) {
            self.outcomes.lock().unwrap().insert(url.to_string(), outcome);
        }
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn probe(&self, health_check_url: &str) -> Result<Duration> {
            match self.outcomes.lock().unwrap().get(health_check_url).cloned() {
                Some(Ok(ms)) => Ok(Duration::from_millis(ms)),
                Some(Err(msg)) => Err(OrchestrationError::Downstream(msg)),
                None => Ok(Duration::from_millis(1)),
            }
        }
    }

    fn registry_with(probe: Arc<ScriptedProbe>) -> ServiceRegistry {
        let breaker = CircuitBreakerConfig { failure_threshold: 2, ..Default::default() };
        ServiceRegistry::new(breaker, HealthCheckConfig::default(), probe)
    }

    fn registry() -> ServiceRegistry {
        registry_with(Arc::new(ScriptedProbe::default()))
    }

    #[tokio::test]
    async fn test_register_keeps_registration_order() {
        let registry = registry();
        for url in ["http://u1", "http://u2", "http://u3"] {
            registry.register(ServiceRegistration::new("orders", url)).await.unwrap();
        }

        let urls: Vec<String> = registry.list("orders").await.into_iter().map(|i| i.url).collect();
        assert_eq!(urls, vec!["http://u1", "http://u2", "http://u3"]);
        assert_eq!(registry.instance_count().await, 3);
        assert_eq!(registry.services().await, vec!["orders".to_string()]);
    }

    #[tokio::test]
    async fn test_reregister_updates_in_place() {
        let registry = registry();
        registry.register(ServiceRegistration::new("orders", "http://u1")).await.unwrap();
        registry.record_failure("orders", "http://u1").await;

        let updated = registry
            .register(ServiceRegistration::new("orders", "http://u1/").with_weight(5))
            .await
            .unwrap();
        assert_eq!(updated.weight, 5);
        assert_eq!(updated.request_count, 1);
        assert_eq!(registry.list("orders").await.len(), 1);
    }

    #[tokio::test]
    async fn test_default_health_url() {
        let registry = registry();
        let instance =
            registry.register(ServiceRegistration::new("orders", "http://u1")).await.unwrap();
        assert_eq!(instance.health_check_url, "http://u1/health");
    }

    #[tokio::test]
    async fn test_deregister() {
        let registry = registry();
        registry.register(ServiceRegistration::new("orders", "http://u1")).await.unwrap();
        assert!(registry.deregister("orders", "http://u1").await);
        assert!(!registry.deregister("orders", "http://u1").await);
        assert!(registry.services().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_health_check_marks_error_and_feeds_breaker() {
        let probe = Arc::new(ScriptedProbe::default());
        probe.set("http://u1/health", Err("connection refused".into()));
        let registry = registry_with(Arc::clone(&probe));
        registry.register(ServiceRegistration::new("orders", "http://u1")).await.unwrap();
        registry.register(ServiceRegistration::new("orders", "http://u2")).await.unwrap();

        let results = registry.check_all().await;
        assert_eq!(results.len(), 2);
        assert_eq!(results.iter().filter(|r| !r.is_healthy()).count(), 1);

        let healthy = registry.list_healthy("orders").await;
        assert_eq!(healthy.len(), 1);
        assert_eq!(healthy[0].instance.url, "http://u2");

        let failed = registry.health_check("orders", "http://u1").await.unwrap();
        assert_eq!(failed.status, InstanceStatus::Error);
        let breaker = registry.breaker("orders", "http://u1").await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(registry.list("orders").await[0].error_count, 2);
    }

    #[tokio::test]
    async fn test_health_check_recovery_and_degraded() {
        let probe = Arc::new(ScriptedProbe::default());
        probe.set("http://u1/health", Err("down".into()));
        let registry = registry_with(Arc::clone(&probe));
        registry.register(ServiceRegistration::new("orders", "http://u1")).await.unwrap();
        registry.health_check("orders", "http://u1").await.unwrap();
        assert!(registry.list_healthy("orders").await.is_empty());

        probe.set("http://u1/health", Ok(5_000));
        let result = registry.health_check("orders", "http://u1").await.unwrap();
        assert_eq!(result.status, InstanceStatus::Degraded);
        assert_eq!(registry.list_healthy("orders").await.len(), 1);

        probe.set("http://u1/health", Ok(10));
        let result = registry.health_check("orders", "http://u1").await.unwrap();
        assert_eq!(result.status, InstanceStatus::Active);
        let instance = &registry.list("orders").await[0];
        assert_eq!(instance.error_count, 0);
        assert_eq!(instance.response_time_ms, 10);
        assert!(instance.last_health_check.is_some());
    }

    #[tokio::test]
    async fn test_health_check_unknown_instance() {
        let registry = registry();
        assert!(registry.health_check("orders", "http://nowhere").await.is_none());
    }

    #[tokio::test]
    async fn test_record_outcomes() {
        let registry = registry();
        registry.register(ServiceRegistration::new("orders", "http://u1")).await.unwrap();
        registry.record_failure("orders", "http://u1").await;
        registry.record_success("orders", "http://u1", Duration::from_millis(42)).await;

        let instance = &registry.list("orders").await[0];
        assert_eq!(instance.request_count, 2);
        assert_eq!(instance.failure_total, 1);
        assert_eq!(instance.error_count, 0);
        assert_eq!(instance.response_time_ms, 42);
    }
}
