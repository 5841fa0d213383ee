//! Switchyard orchestration control plane.
//!
//! Routes requests to downstream service instances (registry, health checks,
//! circuit breakers, load balancing), stores TTL-bound shared contexts,
//! schedules prioritized tasks onto agents, and runs DAG workflows on top of
//! the scheduler.

pub mod agents;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod queue;
pub mod routing;
pub mod schema;
pub mod worker;
pub mod workflow;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

pub use agents::{AgentCoordinator, CoordinatorStats};
pub use config::OrchestratorConfig;
pub use context::{ContextStats, ContextStore};
pub use error::{ErrorDetail, OrchestrationError, Result};
pub use events::{CoordinatorEvent, EventBus};
pub use routing::{
    HealthProbe, HttpHealthProbe, HttpInvoker, LoadBalancer, RoutingService, ServiceInvoker,
    ServiceRegistry,
};
pub use schema::TaskSchemaRegistry;
pub use worker::Workers;
pub use workflow::{ExecutionStatus, WorkflowEngine};

/// Component counts reported by the health endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSummary {
    /// Always `"ok"` while the process answers.
    pub status: &'static str,
    /// Whether the background jobs are running.
    pub background_jobs: bool,
    /// Registered service names.
    pub services: usize,
    /// Registered instances across services.
    pub instances: usize,
    /// Context counts.
    pub contexts: ContextStats,
    /// Agent and task counts.
    pub scheduler: CoordinatorStats,
    /// Stored workflows.
    pub workflows: usize,
    /// Executions per status.
    pub executions: HashMap<ExecutionStatus, usize>,
    /// When the orchestrator was constructed.
    pub started_at: DateTime<Utc>,
}

/// Owns every control plane component.
///
/// Handlers get `Arc` handles through the accessors; background jobs run
/// between [`Orchestrator::start`] and [`Orchestrator::shutdown`].
pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: Arc<ServiceRegistry>,
    balancer: Arc<LoadBalancer>,
    routing: Arc<RoutingService>,
    contexts: Arc<ContextStore>,
    coordinator: Arc<AgentCoordinator>,
    workflows: Arc<WorkflowEngine>,
    workers: Mutex<Option<Workers>>,
    started_at: DateTime<Utc>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("registry", &self.registry)
            .field("coordinator", &self.coordinator)
            .field("workflows", &self.workflows)
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Builds every component with HTTP transports.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or an HTTP client
    /// cannot be built.
    pub fn new(config: OrchestratorConfig) -> Result<Self> {
        config.validate()?;
        let probe = Arc::new(HttpHealthProbe::new(config.health_check.timeout())?);
        let invoker = Arc::new(HttpInvoker::new(config.routing.request_timeout())?);
        Self::with_transports(config, probe, invoker)
    }

    /// Builds every component with the given probe and invoker.
    ///
    /// # Arguments
    /// * `config` - Component settings
    /// * `probe` - Health check transport
    /// * `invoker` - Downstream call transport
    ///
    /// # Errors
    /// Returns `Validation` if the configuration is invalid.
    pub fn with_transports(
        config: OrchestratorConfig,
        probe: Arc<dyn HealthProbe>,
        invoker: Arc<dyn ServiceInvoker>,
    ) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(ServiceRegistry::new(
            config.circuit_breaker,
            config.health_check.clone(),
            probe,
        ));
        let balancer = Arc::new(LoadBalancer::new(
            config.routing.default_strategy,
            config.routing.strategies.clone(),
        ));
        let routing = Arc::new(RoutingService::new(
            Arc::clone(&registry),
            Arc::clone(&balancer),
            invoker,
            config.routing.request_timeout(),
        ));
        let contexts = Arc::new(ContextStore::new(config.context.default_ttl()));
        let coordinator = Arc::new(AgentCoordinator::new(
            TaskSchemaRegistry::new(config.task_schemas.clone()),
            EventBus::new(config.scheduler.event_capacity),
            config.scheduler.heartbeat_timeout(),
        ));
        let workflows = Arc::new(WorkflowEngine::new(
            Arc::clone(&coordinator),
            Arc::clone(&contexts),
            config.workflow.default_step_timeout(),
        ));

        Ok(Self {
            config,
            registry,
            balancer,
            routing,
            contexts,
            coordinator,
            workflows,
            workers: Mutex::new(None),
            started_at: Utc::now(),
        })
    }

    /// Settings the orchestrator was built with.
    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Service registry.
    #[must_use]
    pub fn registry(&self) -> Arc<ServiceRegistry> {
        Arc::clone(&self.registry)
    }

    /// Load balancer.
    #[must_use]
    pub fn balancer(&self) -> Arc<LoadBalancer> {
        Arc::clone(&self.balancer)
    }

    /// Routing service.
    #[must_use]
    pub fn routing(&self) -> Arc<RoutingService> {
        Arc::clone(&self.routing)
    }

    /// Context store.
    #[must_use]
    pub fn contexts(&self) -> Arc<ContextStore> {
        Arc::clone(&self.contexts)
    }

    /// Agent coordinator.
    #[must_use]
    pub fn coordinator(&self) -> Arc<AgentCoordinator> {
        Arc::clone(&self.coordinator)
    }

    /// Workflow engine.
    #[must_use]
    pub fn workflows(&self) -> Arc<WorkflowEngine> {
        Arc::clone(&self.workflows)
    }

    /// Starts the background jobs: health monitor, scheduler, coordinator
    /// event log, context sweeper and workflow driver.
    ///
    /// # Errors
    /// Returns `InvalidTransition` if the jobs are already running.
    pub async fn start(&self) -> Result<()> {
        let mut slot = self.workers.lock().await;
        if slot.is_some() {
            return Err(OrchestrationError::InvalidTransition {
                entity: "orchestrator",
                id: "background-jobs".into(),
                reason: "already running".into(),
            });
        }

        let mut workers = Workers::new();

        let registry = Arc::clone(&self.registry);
        workers.spawn_periodic("health-monitor", self.config.health_check.interval(), move || {
            let registry = Arc::clone(&registry);
            async move {
                let results = registry.check_all().await;
                let unhealthy = results.iter().filter(|r| !r.is_healthy()).count();
                if unhealthy > 0 {
                    warn!(checked = results.len(), unhealthy, "Health sweep found unhealthy instances");
                } else {
                    debug!(checked = results.len(), "Health sweep complete");
                }
            }
        });

        let coordinator = Arc::clone(&self.coordinator);
        let task_retention = self.config.scheduler.task_retention();
        workers.spawn_periodic("scheduler", self.config.scheduler.tick_interval(), move || {
            let coordinator = Arc::clone(&coordinator);
            async move {
                let stale = coordinator.check_heartbeats().await;
                if !stale.is_empty() {
                    warn!(agents = ?stale, "Agents missed their heartbeat");
                }
                if let Err(err) = coordinator.assign_pending().await {
                    error!(error = %err, "Task assignment pass failed");
                }
                coordinator.purge_finished(task_retention).await;
            }
        });

        workers.spawn_subscriber("event-log", self.coordinator.subscribe(), |event| async move {
            match event {
                CoordinatorEvent::TaskAssigned { task_id, agent_id } => {
                    debug!(task_id = %task_id, agent_id = %agent_id, "Task assigned");
                }
                CoordinatorEvent::TaskFinished { task_id, status } => {
                    info!(task_id = %task_id, status = ?status, "Task finished");
                }
                CoordinatorEvent::AgentStatusChanged { agent_id, from, to } => {
                    info!(agent_id = %agent_id, from = ?from, to = ?to, "Agent status changed");
                }
            }
        });

        let contexts = Arc::clone(&self.contexts);
        workers.spawn_periodic("context-sweeper", self.config.context.sweep_interval(), move || {
            let contexts = Arc::clone(&contexts);
            async move {
                let removed = contexts.sweep().await;
                if removed > 0 {
                    debug!(removed, "Swept expired contexts");
                }
            }
        });

        let engine = Arc::clone(&self.workflows);
        let execution_retention = self.config.workflow.execution_retention();
        workers.spawn_periodic("workflow-driver", self.config.workflow.poll_interval(), move || {
            let engine = Arc::clone(&engine);
            async move {
                engine.tick().await;
                engine.purge_finished(execution_retention).await;
            }
        });

        info!(jobs = workers.len(), "Orchestrator background jobs started");
        *slot = Some(workers);
        Ok(())
    }

    /// Whether the background jobs are running.
    pub async fn is_running(&self) -> bool {
        self.workers.lock().await.is_some()
    }

    /// Stops the background jobs and waits for them. Idempotent.
    pub async fn shutdown(&self) {
        let workers = self.workers.lock().await.take();
        if let Some(workers) = workers {
            workers.shutdown().await;
            info!("Orchestrator stopped");
        }
    }

    /// Collects component counts.
    pub async fn health(&self) -> HealthSummary {
        HealthSummary {
            status: "ok",
            background_jobs: self.is_running().await,
            services: self.registry.services().await.len(),
            instances: self.registry.instance_count().await,
            contexts: self.contexts.stats().await,
            scheduler: self.coordinator.stats().await,
            workflows: self.workflows.workflow_count().await,
            executions: self.workflows.execution_counts().await,
            started_at: self.started_at,
        }
    }
}
