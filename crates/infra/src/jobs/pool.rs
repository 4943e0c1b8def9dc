//! Consumer pool: N workers pulling deliveries from one broker channel.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use outboxsync_events::{Broker, Delivery, JobHandler, NackOutcome};

/// Consumer pool configuration.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Number of concurrent workers.
    pub concurrency: usize,
    /// How long one `next_delivery` call may block.
    pub poll_wait: Duration,
    /// Pause after a broker error before polling again.
    pub error_backoff: Duration,
    /// Name for logging.
    pub name: String,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_wait: Duration::from_secs(1),
            error_backoff: Duration::from_secs(1),
            name: "outbox-consumer".to_string(),
        }
    }
}

impl ConsumerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_poll_wait(mut self, poll_wait: Duration) -> Self {
        self.poll_wait = poll_wait;
        self
    }
}

/// Pool runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_retried: u64,
    pub jobs_failed: u64,
    pub current_running: usize,
}

/// Handle to a running pool.
#[derive(Debug)]
pub struct ConsumerPoolHandle {
    workers: Vec<JoinHandle<()>>,
    stats: Arc<Mutex<ConsumerStats>>,
    shutdown: CancellationToken,
}

impl ConsumerPoolHandle {
    pub fn stats(&self) -> ConsumerStats {
        match self.stats.lock() {
            Ok(stats) => stats.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Stop polling and wait for in-flight jobs to be acked or nacked.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.join().await;
    }

    /// Wait for the workers to exit (after the token passed at spawn is cancelled).
    pub async fn join(self) {
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!(error = %e, "consumer worker panicked");
            }
        }
    }
}

/// Spawns consumer workers over one broker channel.
#[derive(Debug)]
pub struct ConsumerPool;

impl ConsumerPool {
    /// Spawn `config.concurrency` workers on the current runtime.
    ///
    /// `handler` must be idempotent (at-least-once delivery).
    pub fn spawn(
        broker: Arc<dyn Broker>,
        handler: Arc<dyn JobHandler>,
        config: ConsumerConfig,
        shutdown: CancellationToken,
    ) -> ConsumerPoolHandle {
        let stats = Arc::new(Mutex::new(ConsumerStats::default()));
        let workers = (0..config.concurrency.max(1))
            .map(|n| {
                let worker = Worker {
                    name: format!("{}-{n}", config.name),
                    broker: broker.clone(),
                    handler: handler.clone(),
                    config: config.clone(),
                    stats: stats.clone(),
                };
                tokio::spawn(worker.run(shutdown.clone()))
            })
            .collect();

        info!(
            consumer = %config.name,
            channel = %broker.channel(),
            concurrency = config.concurrency,
            "consumer pool started"
        );

        ConsumerPoolHandle {
            workers,
            stats,
            shutdown,
        }
    }
}

struct Worker {
    name: String,
    broker: Arc<dyn Broker>,
    handler: Arc<dyn JobHandler>,
    config: ConsumerConfig,
    stats: Arc<Mutex<ConsumerStats>>,
}

impl Worker {
    async fn run(self, shutdown: CancellationToken) {
        debug!(worker = %self.name, "consumer worker started");

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = self.broker.next_delivery(self.config.poll_wait) => next,
            };

            match next {
                Ok(Some(delivery)) => self.process(delivery).await,
                Ok(None) => continue,
                Err(e) => {
                    warn!(worker = %self.name, error = %e, "failed to poll broker");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.error_backoff) => {}
                    }
                }
            }
        }

        debug!(worker = %self.name, "consumer worker stopped");
    }

    /// Handle one delivery to completion. Not interrupted by shutdown.
    async fn process(&self, delivery: Delivery) {
        self.update(|s| s.current_running += 1);

        let result = self.handler.handle(&delivery.job).await;

        let counted = match result {
            Ok(()) => match self.broker.ack(&delivery).await {
                Ok(()) => {
                    debug!(
                        worker = %self.name,
                        job_id = %delivery.job_id,
                        ledger_entry_id = %delivery.job.ledger_entry_id,
                        "job completed"
                    );
                    Outcome::Succeeded
                }
                Err(e) => {
                    // The broker will redeliver; the handler is idempotent.
                    warn!(worker = %self.name, job_id = %delivery.job_id, error = %e, "ack failed");
                    Outcome::Unknown
                }
            },
            Err(handler_err) => match self.broker.nack(&delivery, &handler_err).await {
                Ok(NackOutcome::RetryScheduled { attempt, delay }) => {
                    warn!(
                        worker = %self.name,
                        job_id = %delivery.job_id,
                        event_type = %delivery.job.event_type,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %handler_err,
                        "job failed, retry scheduled"
                    );
                    Outcome::Retried
                }
                Ok(NackOutcome::Exhausted { attempts }) => {
                    error!(
                        worker = %self.name,
                        job_id = %delivery.job_id,
                        ledger_entry_id = %delivery.job.ledger_entry_id,
                        event_type = %delivery.job.event_type,
                        attempts,
                        error = %handler_err,
                        "job failed terminally"
                    );
                    Outcome::Failed
                }
                Err(e) => {
                    warn!(worker = %self.name, job_id = %delivery.job_id, error = %e, "nack failed");
                    Outcome::Unknown
                }
            },
        };

        self.update(|s| {
            s.current_running = s.current_running.saturating_sub(1);
            s.jobs_processed += 1;
            match counted {
                Outcome::Succeeded => s.jobs_succeeded += 1,
                Outcome::Retried => s.jobs_retried += 1,
                Outcome::Failed => s.jobs_failed += 1,
                Outcome::Unknown => {}
            }
        });
    }

    fn update(&self, f: impl FnOnce(&mut ConsumerStats)) {
        match self.stats.lock() {
            Ok(mut stats) => f(&mut stats),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

enum Outcome {
    Succeeded,
    Retried,
    Failed,
    Unknown,
}
