//! Load balancer for choosing among healthy service instances.
//!
//! The balancer never filters: it only picks among the candidates the router
//! hands it, which are already healthy and admitted by their breakers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::types::ServiceInstance;

/// Weight of the response-time term in the intelligent score.
const RESPONSE_TIME_WEIGHT: f64 = 0.7;
/// Weight of the error-rate term in the intelligent score.
const ERROR_RATE_WEIGHT: f64 = 0.3;

/// Instance selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadBalancingStrategy {
    /// Cycle through instances in registration order.
    #[default]
    RoundRobin,
    /// Pick the instance with the fewest in-flight calls.
    LeastConnections,
    /// Random draw proportional to instance weight.
    Weighted,
    /// Score by response time and error rate.
    Intelligent,
}

/// Last instance round robin picked for a service.
#[derive(Debug, Clone)]
struct RoundRobinCursor {
    url: String,
    registered_at: DateTime<Utc>,
}

/// Load balancer shared by all routed services.
pub struct LoadBalancer {
    /// Strategy for services without an override.
    default_strategy: LoadBalancingStrategy,
    /// Per-service strategy overrides.
    strategies: RwLock<HashMap<String, LoadBalancingStrategy>>,
    /// Round-robin position per service.
    cursors: Mutex<HashMap<String, RoundRobinCursor>>,
    /// In-flight calls per instance URL.
    connections: Arc<Mutex<HashMap<String, usize>>>,
}

impl std::fmt::Debug for LoadBalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadBalancer")
            .field("default_strategy", &self.default_strategy)
            .finish_non_exhaustive()
    }
}

impl LoadBalancer {
    /// Creates a load balancer.
    ///
    /// # Arguments
    /// * `default_strategy` - Strategy for services without an override
    /// * `overrides` - Per-service strategies
    #[must_use]
    pub fn new(
        default_strategy: LoadBalancingStrategy,
        overrides: HashMap<String, LoadBalancingStrategy>,
    ) -> Self {
        Self {
            default_strategy,
            strategies: RwLock::new(overrides),
            cursors: Mutex::new(HashMap::new()),
            connections: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Sets the strategy for one service.
    pub fn set_strategy(&self, service: &str, strategy: LoadBalancingStrategy) {
        debug!(service = %service, strategy = ?strategy, "Setting load balancing strategy");
        self.strategies
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(service.to_string(), strategy);
    }

    /// Returns the strategy in effect for `service`.
    pub fn strategy_for(&self, service: &str) -> LoadBalancingStrategy {
        self.strategies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(service)
            .copied()
            .unwrap_or(self.default_strategy)
    }

    /// Selects one instance among `candidates`.
    ///
    /// # Returns
    /// Returns `None` only when `candidates` is empty.
    pub fn select(&self, service: &str, candidates: &[ServiceInstance]) -> Option<ServiceInstance> {
        if candidates.is_empty() {
            return None;
        }

        let strategy = self.strategy_for(service);
        let index = match strategy {
            LoadBalancingStrategy::RoundRobin => self.next_round_robin(service, candidates),
            LoadBalancingStrategy::LeastConnections => self.least_connections(candidates),
            LoadBalancingStrategy::Weighted => weighted_index(candidates, &mut rand::thread_rng()),
            LoadBalancingStrategy::Intelligent => intelligent_index(candidates),
        };

        let selected = candidates[index].clone();
        debug!(
            service = %service,
            strategy = ?strategy,
            instance = %selected.url,
            candidates = candidates.len(),
            "Selected instance"
        );
        Some(selected)
    }

    /// Picks the candidate after the last one chosen, in registration order.
    ///
    /// When the last pick is no longer a candidate, the rotation resumes at
    /// the first candidate registered after it, so removals never repeat or
    /// skip a turn.
    fn next_round_robin(&self, service: &str, candidates: &[ServiceInstance]) -> usize {
        let mut cursors = self.cursors.lock().unwrap_or_else(PoisonError::into_inner);
        let index = cursors.get(service).map_or(0, |last| {
            match candidates.iter().position(|c| c.url == last.url) {
                Some(position) => (position + 1) % candidates.len(),
                None => candidates
                    .iter()
                    .position(|c| c.registered_at > last.registered_at)
                    .unwrap_or(0),
            }
        });

        let chosen = &candidates[index];
        cursors.insert(
            service.to_string(),
            RoundRobinCursor { url: chosen.url.clone(), registered_at: chosen.registered_at },
        );
        index
    }

    fn least_connections(&self, candidates: &[ServiceInstance]) -> usize {
        let loads = self.connections.lock().unwrap_or_else(PoisonError::into_inner);
        let mut best: Option<(usize, usize)> = None;
        for (index, instance) in candidates.iter().enumerate() {
            let load = loads.get(&instance.url).copied().unwrap_or(0);
            match best {
                Some((_, best_load)) if load >= best_load => {}
                _ => best = Some((index, load)),
            }
        }
        best.map_or(0, |(index, _)| index)
    }

    /// Marks a call to `url` as in flight until the guard is dropped.
    pub fn begin_call(&self, url: &str) -> ConnectionGuard {
        let mut loads = self.connections.lock().unwrap_or_else(PoisonError::into_inner);
        let load = loads.entry(url.to_string()).or_insert(0);
        *load += 1;
        debug!(instance = %url, load = *load, "Incremented instance load");
        ConnectionGuard { connections: Arc::clone(&self.connections), url: url.to_string() }
    }

    /// In-flight calls for `url`.
    pub fn active_connections(&self, url: &str) -> usize {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(url)
            .copied()
            .unwrap_or(0)
    }

    /// Drops all bookkeeping for a deregistered instance.
    pub fn forget_instance(&self, url: &str) {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner).remove(url);
    }
}

impl Default for LoadBalancer {
    fn default() -> Self {
        Self::new(LoadBalancingStrategy::default(), HashMap::new())
    }
}

/// Tracks one in-flight call; decrements the instance load on drop.
#[derive(Debug)]
pub struct ConnectionGuard {
    connections: Arc<Mutex<HashMap<String, usize>>>,
    url: String,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let mut loads = self.connections.lock().unwrap_or_else(PoisonError::into_inner);
        match loads.get_mut(&self.url) {
            Some(load) if *load > 0 => {
                *load -= 1;
                debug!(instance = %self.url, load = *load, "Decremented instance load");
            }
            // Instance was deregistered while the call was in flight.
            None => {}
            Some(_) => warn!(instance = %self.url, "Attempted to decrement load below zero"),
        }
    }
}

fn weighted_index<R: Rng>(candidates: &[ServiceInstance], rng: &mut R) -> usize {
    let total: u64 = candidates.iter().map(|c| u64::from(c.weight.max(1))).sum();
    let mut draw = rng.gen_range(0..total);
    for (index, instance) in candidates.iter().enumerate() {
        let weight = u64::from(instance.weight.max(1));
        if draw < weight {
            return index;
        }
        draw -= weight;
    }
    candidates.len() - 1
}

fn intelligent_index(candidates: &[ServiceInstance]) -> usize {
    let inverse_rt: Vec<f64> =
        candidates.iter().map(|c| 1.0 / (1.0 + c.response_time_ms as f64)).collect();
    let inverse_err: Vec<f64> = candidates.iter().map(|c| 1.0 / (1.0 + c.error_rate())).collect();
    let max_rt = inverse_rt.iter().copied().fold(f64::MIN_POSITIVE, f64::max);
    let max_err = inverse_err.iter().copied().fold(f64::MIN_POSITIVE, f64::max);

    let mut best = (0, f64::MIN);
    for index in 0..candidates.len() {
        let score = RESPONSE_TIME_WEIGHT * (inverse_rt[index] / max_rt)
            + ERROR_RATE_WEIGHT * (inverse_err[index] / max_err);
        if score > best.1 {
            best = (index, score);
        }
    }
    best.0
}
