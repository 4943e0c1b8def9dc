//! Cancellable periodic task.
//!
//! Runs a tick function on a fixed interval until its token is cancelled. A
//! tick in progress always runs to completion; cancellation is only observed
//! between ticks.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Handle for a running periodic task (trigger hook + join).
#[derive(Debug)]
pub struct PeriodicHandle {
    name: String,
    trigger: Arc<Notify>,
    shutdown: CancellationToken,
    join: JoinHandle<()>,
}

impl PeriodicHandle {
    /// Run a tick as soon as the current one (if any) finishes.
    ///
    /// Triggers are coalesced: several calls before the next tick cause one tick.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cancel and wait for the in-flight tick to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.join().await;
    }

    /// Wait for the task to exit (after its token is cancelled).
    pub async fn join(self) {
        if let Err(e) = self.join.await {
            error!(task = %self.name, error = %e, "periodic task panicked");
        }
    }
}

#[derive(Debug)]
pub struct PeriodicTask;

impl PeriodicTask {
    /// Spawn `tick` on the current runtime, first immediately, then every `interval`.
    ///
    /// Missed ticks are skipped rather than bunched up when a tick overruns.
    pub fn spawn<F, Fut>(
        name: impl Into<String>,
        interval: Duration,
        shutdown: CancellationToken,
        mut tick: F,
    ) -> PeriodicHandle
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let trigger = Arc::new(Notify::new());

        let join = {
            let name = name.clone();
            let trigger = trigger.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                info!(task = %name, interval_ms = interval.as_millis() as u64, "periodic task started");

                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break,
                        _ = ticker.tick() => {}
                        _ = trigger.notified() => {
                            debug!(task = %name, "tick triggered");
                            ticker.reset();
                        }
                    }
                    tick().await;
                }

                info!(task = %name, "periodic task stopped");
            })
        };

        PeriodicHandle {
            name,
            trigger,
            shutdown,
            join,
        }
    }
}
