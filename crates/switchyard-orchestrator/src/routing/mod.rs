//! Service routing: registry, health checks, circuit breakers and load balancing.
//!
//! A [`RoutingService`] asks the [`ServiceRegistry`] for healthy instances,
//! drops those whose [`CircuitBreaker`] refuses calls, lets the
//! [`LoadBalancer`] pick one, and invokes it through a [`ServiceInvoker`].

pub mod circuit_breaker;
pub mod health;
pub mod invoker;
pub mod load_balancer;
pub mod registry;
pub mod router;
pub mod types;

pub use circuit_breaker::{
    CallPermit, CircuitBreaker, CircuitCallError, CircuitRejected, CircuitSnapshot, CircuitState,
};
pub use health::{HealthCheckResult, HealthProbe, HttpHealthProbe};
pub use invoker::{CONTEXT_ID_HEADER, HttpInvoker, ServiceInvoker};
pub use load_balancer::{ConnectionGuard, LoadBalancer, LoadBalancingStrategy};
pub use registry::{RoutableInstance, ServiceRegistry};
pub use router::RoutingService;
pub use types::{InstanceStatus, RouteRequest, RouteResponse, ServiceInstance, ServiceRegistration};
