//! Circuit breaker guarding calls to a single service instance.
//!
//! All state lives behind one mutex, so every transition (including probe
//! admission while half-open) is decided by exactly one caller at a time.
//! Callers obtain a [`CallPermit`] before dispatching and settle it with the
//! call outcome; a permit dropped unsettled simply gives its probe slot back.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::CircuitBreakerConfig;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Failing target; calls are rejected until the recovery timeout elapses.
    Open,
    /// Recovery is being tested with a bounded number of probes.
    HalfOpen,
}

/// Rejection returned when the breaker refuses a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitRejected {
    /// State at the time of the rejection.
    pub state: CircuitState,
    /// Remaining time before a probe is allowed, when open.
    pub retry_after: Option<Duration>,
}

/// Error from [`CircuitBreaker::call`].
#[derive(Debug)]
pub enum CircuitCallError<E> {
    /// The breaker refused the call; the operation was not run.
    Rejected(CircuitRejected),
    /// The operation ran and failed.
    Inner(E),
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitSnapshot {
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failures counted while closed.
    pub failure_count: u32,
    /// Consecutive probe successes while half-open.
    pub success_count: u32,
    /// Probes currently in flight.
    pub probes_in_flight: u32,
    /// Milliseconds since the last recorded failure.
    pub ms_since_last_failure: Option<u64>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
    probes_in_flight: u32,
    /// Bumped on every state transition; outcomes from older permits are ignored.
    generation: u64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure: None,
            probes_in_flight: 0,
            generation: 0,
        }
    }

    fn transition(&mut self, to: CircuitState) {
        self.state = to;
        self.generation += 1;
        self.success_count = 0;
        self.probes_in_flight = 0;
        if to == CircuitState::Closed {
            self.failure_count = 0;
        }
    }

    fn recovery_elapsed(&self, recovery_timeout: Duration) -> bool {
        self.last_failure.is_none_or(|at| at.elapsed() >= recovery_timeout)
    }
}

#[derive(Debug)]
struct Shared {
    target: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_failure(&self, generation: Option<u64>) {
        let mut state = self.lock();
        if generation.is_some_and(|g| g != state.generation) {
            debug!(target_url = %self.target, "Ignoring stale failure outcome");
            return;
        }

        state.last_failure = Some(Instant::now());
        match state.state {
            CircuitState::Closed => {
                state.failure_count += 1;
                if state.failure_count >= self.config.failure_threshold {
                    state.transition(CircuitState::Open);
                    warn!(
                        target_url = %self.target,
                        failures = state.failure_count,
                        threshold = self.config.failure_threshold,
                        "Circuit breaker: Closed -> Open"
                    );
                }
            }
            CircuitState::HalfOpen => {
                state.transition(CircuitState::Open);
                warn!(target_url = %self.target, "Circuit breaker: HalfOpen -> Open (probe failed)");
            }
            CircuitState::Open => {}
        }
    }

    fn record_success(&self, generation: u64) {
        let mut state = self.lock();
        if generation != state.generation {
            debug!(target_url = %self.target, "Ignoring stale success outcome");
            return;
        }

        match state.state {
            CircuitState::Closed => state.failure_count = 0,
            CircuitState::HalfOpen => {
                state.success_count += 1;
                if state.success_count >= self.config.success_threshold {
                    state.transition(CircuitState::Closed);
                    info!(target_url = %self.target, "Circuit breaker: HalfOpen -> Closed (recovered)");
                }
            }
            CircuitState::Open => {}
        }
    }

    fn release_probe(&self, generation: u64) {
        let mut state = self.lock();
        if generation == state.generation && state.probes_in_flight > 0 {
            state.probes_in_flight -= 1;
        }
    }
}

/// Circuit breaker for one guarded target.
#[derive(Clone)]
pub struct CircuitBreaker {
    shared: Arc<Shared>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("target", &self.shared.target)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    /// Creates a closed breaker for `target`.
    #[must_use]
    pub fn new(target: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                target: target.into(),
                config,
                state: Mutex::new(BreakerState::new()),
            }),
        }
    }

    /// Asks for permission to issue one call.
    ///
    /// An open breaker whose recovery timeout has elapsed moves to half-open
    /// here, and the caller becomes its first probe.
    pub fn try_acquire(&self) -> Result<CallPermit, CircuitRejected> {
        let config = &self.shared.config;
        let mut state = self.shared.lock();

        if state.state == CircuitState::Open {
            if !state.recovery_elapsed(config.recovery_timeout()) {
                let retry_after = state
                    .last_failure
                    .map(|at| config.recovery_timeout().saturating_sub(at.elapsed()));
                return Err(CircuitRejected { state: CircuitState::Open, retry_after });
            }
            state.transition(CircuitState::HalfOpen);
            info!(target_url = %self.shared.target, "Circuit breaker: Open -> HalfOpen");
        }

        match state.state {
            CircuitState::Closed => Ok(self.permit(state.generation, false)),
            CircuitState::HalfOpen => {
                if state.probes_in_flight >= config.half_open_max_probes {
                    return Err(CircuitRejected { state: CircuitState::HalfOpen, retry_after: None });
                }
                state.probes_in_flight += 1;
                debug!(
                    target_url = %self.shared.target,
                    probes_in_flight = state.probes_in_flight,
                    "Admitted half-open probe"
                );
                Ok(self.permit(state.generation, true))
            }
            CircuitState::Open => Err(CircuitRejected { state: CircuitState::Open, retry_after: None }),
        }
    }

    fn permit(&self, generation: u64, probe: bool) -> CallPermit {
        CallPermit { shared: Arc::clone(&self.shared), generation, probe, settled: false }
    }

    /// Returns `true` if a call attempted now would be admitted.
    ///
    /// Does not change state; used to filter routing candidates.
    pub fn is_call_permitted(&self) -> bool {
        let config = &self.shared.config;
        let state = self.shared.lock();
        match state.state {
            CircuitState::Closed => true,
            CircuitState::Open => state.recovery_elapsed(config.recovery_timeout()),
            CircuitState::HalfOpen => state.probes_in_flight < config.half_open_max_probes,
        }
    }

    /// Feeds a failure observed outside a call (for example a failed health check).
    pub fn record_external_failure(&self) {
        self.shared.record_failure(None);
    }

    /// Runs `operation` through the breaker and records its outcome.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitCallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.try_acquire().map_err(CircuitCallError::Rejected)?;
        match operation().await {
            Ok(value) => {
                permit.succeed();
                Ok(value)
            }
            Err(err) => {
                permit.fail();
                Err(CircuitCallError::Inner(err))
            }
        }
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        self.shared.lock().state
    }

    /// Snapshot of the counters.
    pub fn snapshot(&self) -> CircuitSnapshot {
        let state = self.shared.lock();
        CircuitSnapshot {
            state: state.state,
            failure_count: state.failure_count,
            success_count: state.success_count,
            probes_in_flight: state.probes_in_flight,
            ms_since_last_failure: state.last_failure.map(|at| at.elapsed().as_millis() as u64),
        }
    }

    /// Forces the breaker back to closed.
    pub fn reset(&self) {
        let mut state = self.shared.lock();
        state.transition(CircuitState::Closed);
        state.last_failure = None;
    }

    /// The guarded target.
    pub fn target(&self) -> &str {
        &self.shared.target
    }
}

/// Permission to issue one call through a [`CircuitBreaker`].
#[must_use = "settle the permit with succeed() or fail()"]
pub struct CallPermit {
    shared: Arc<Shared>,
    generation: u64,
    probe: bool,
    settled: bool,
}

impl fmt::Debug for CallPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallPermit")
            .field("target", &self.shared.target)
            .field("generation", &self.generation)
            .field("probe", &self.probe)
            .finish_non_exhaustive()
    }
}

impl CallPermit {
    /// Whether this permit was admitted as a half-open probe.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// Records a successful call.
    pub fn succeed(mut self) {
        self.settle();
        self.shared.record_success(self.generation);
    }

    /// Records a failed call.
    pub fn fail(mut self) {
        self.settle();
        self.shared.record_failure(Some(self.generation));
    }

    fn settle(&mut self) {
        self.settled = true;
        if self.probe {
            self.shared.release_probe(self.generation);
        }
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            self.shared.release_probe(self.generation);
        }
    }
}
