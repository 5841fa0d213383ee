//! Background jobs.
//!
//! Each job runs on its own tokio task, either ticking on a fixed interval or
//! draining a broadcast channel, until the shared cancellation token fires.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A set of background jobs sharing one shutdown signal.
pub struct Workers {
    token: CancellationToken,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl fmt::Debug for Workers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workers")
            .field("jobs", &self.handles.iter().map(|(name, _)| *name).collect::<Vec<_>>())
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

impl Workers {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self { token: CancellationToken::new(), handles: Vec::new() }
    }

    /// Spawns `job` to run every `period`, starting immediately.
    ///
    /// A tick that overruns delays the next one instead of bursting.
    ///
    /// # Arguments
    /// * `name` - Job name used in logs
    /// * `period` - Time between ticks
    /// * `job` - Produces the future run on each tick
    pub fn spawn_periodic<F, Fut>(&mut self, name: &'static str, period: Duration, mut job: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.token.clone();
        let handle = tokio::spawn(async move {
            debug!(job = name, period_ms = period.as_millis() as u64, "Background job started");
            let mut interval = time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = interval.tick() => job().await,
                }
            }
            debug!(job = name, "Background job stopped");
        });
        self.handles.push((name, handle));
    }

    /// Spawns `handler` for every message received on `receiver`.
    ///
    /// Messages dropped because the job fell behind are logged and skipped.
    /// The job ends on shutdown or when every sender is gone.
    pub fn spawn_subscriber<T, F, Fut>(
        &mut self,
        name: &'static str,
        mut receiver: broadcast::Receiver<T>,
        mut handler: F,
    ) where
        T: Clone + Send + 'static,
        F: FnMut(T) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.token.clone();
        let handle = tokio::spawn(async move {
            debug!(job = name, "Background subscriber started");
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    received = receiver.recv() => match received {
                        Ok(message) => handler(message).await,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(job = name, skipped, "Subscriber fell behind");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            debug!(job = name, "Background subscriber stopped");
        });
        self.handles.push((name, handle));
    }

    /// Number of spawned jobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether no job has been spawned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Signals every job to stop and waits for them to finish.
    pub async fn shutdown(self) {
        self.token.cancel();
        for (name, handle) in self.handles {
            if let Err(err) = handle.await {
                warn!(job = name, error = %err, "Background job ended abnormally");
            }
        }
        info!("Background jobs stopped");
    }
}

impl Default for Workers {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_job_ticks_until_shutdown() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let mut workers = Workers::new();
        let counter = Arc::clone(&ticks);
        workers.spawn_periodic("counter", Duration::from_millis(100), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert_eq!(workers.len(), 1);

        tokio::time::sleep(Duration::from_millis(350)).await;
        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen >= 3, "expected at least 3 ticks, saw {seen}");

        workers.shutdown().await;
        let after = ticks.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), after);
    }

    #[tokio::test]
    async fn test_subscriber_handles_messages_until_shutdown() {
        let (sender, receiver) = broadcast::channel(8);
        let seen = Arc::new(AtomicUsize::new(0));
        let mut workers = Workers::new();
        let counter = Arc::clone(&seen);
        workers.spawn_subscriber("counter", receiver, move |value: usize| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(value, Ordering::SeqCst);
            }
        });

        sender.send(2).unwrap();
        sender.send(3).unwrap();
        for _ in 0..100 {
            if seen.load(Ordering::SeqCst) == 5 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(seen.load(Ordering::SeqCst), 5);

        workers.shutdown().await;
        assert_eq!(sender.receiver_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_without_jobs() {
        let workers = Workers::default();
        assert!(workers.is_empty());
        workers.shutdown().await;
    }
}
