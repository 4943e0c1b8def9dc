//! Outbox dispatcher: forwards unprocessed ledger rows to the broker.
//!
//! Each tick claims the oldest unprocessed rows (skipping rows another
//! instance holds), enqueues them one by one, and marks each forwarded row
//! processed inside the claim. A row whose enqueue fails stays unprocessed for
//! the next tick. Any other error rolls the whole claim back, so rows already
//! enqueued in that tick are forwarded again later.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use outboxsync_events::Broker;

use crate::ledger::{ClaimedBatch, Ledger, LedgerError};
use crate::scheduler::{PeriodicHandle, PeriodicTask};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    pub interval: Duration,
    pub batch_size: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            batch_size: 100,
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Outcome of one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub claimed: usize,
    pub forwarded: usize,
    /// Rows whose enqueue failed; left unprocessed.
    pub failed: usize,
}

#[derive(Debug)]
pub struct OutboxDispatcher<L, B> {
    ledger: L,
    broker: B,
    config: DispatcherConfig,
}

impl<L, B> OutboxDispatcher<L, B>
where
    L: Ledger + 'static,
    B: Broker + 'static,
{
    pub fn new(ledger: L, broker: B, config: DispatcherConfig) -> Self {
        Self {
            ledger,
            broker,
            config,
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Run one claim-and-forward cycle.
    #[instrument(skip(self), fields(channel = %self.broker.channel(), batch_size = self.config.batch_size), err)]
    pub async fn dispatch_once(&self) -> Result<TickReport, DispatchError> {
        let mut batch = self.ledger.claim_batch(self.config.batch_size).await?;
        let entries = batch.entries().to_vec();

        let mut report = TickReport {
            claimed: entries.len(),
            ..Default::default()
        };
        if entries.is_empty() {
            batch.commit().await?;
            return Ok(report);
        }

        for entry in &entries {
            match self.broker.enqueue(entry.to_job()).await {
                Ok(job_id) => {
                    if let Err(e) = batch.mark_processed(entry.id).await {
                        error!(
                            ledger_entry_id = %entry.id,
                            error = %e,
                            "failed to mark ledger entry processed, rolling back batch"
                        );
                        if let Err(rollback_err) = batch.rollback().await {
                            warn!(error = %rollback_err, "rollback after failed mark also failed");
                        }
                        return Err(e.into());
                    }
                    debug!(ledger_entry_id = %entry.id, job_id = %job_id, event_type = %entry.event_type, "ledger entry forwarded");
                    report.forwarded += 1;
                }
                Err(e) => {
                    warn!(
                        ledger_entry_id = %entry.id,
                        event_type = %entry.event_type,
                        error = %e,
                        "failed to enqueue ledger entry, leaving it for the next tick"
                    );
                    report.failed += 1;
                }
            }
        }

        batch.commit().await?;
        Ok(report)
    }

    /// Run `dispatch_once` every `config.interval` until `shutdown` is cancelled.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> PeriodicHandle {
        let interval = self.config.interval;
        PeriodicTask::spawn("outbox-dispatcher", interval, shutdown, move || {
            let dispatcher = self.clone();
            async move {
                match dispatcher.dispatch_once().await {
                    Ok(report) if report.claimed > 0 => info!(
                        claimed = report.claimed,
                        forwarded = report.forwarded,
                        failed = report.failed,
                        "dispatch tick finished"
                    ),
                    Ok(_) => debug!("no pending ledger entries"),
                    // Claims were rolled back; the next tick retries.
                    Err(e) => error!(error = %e, "dispatch tick failed"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Database, InMemoryDatabase, Transaction};
    use crate::jobs::{InMemoryBroker, RetryPolicy};
    use crate::recorder::EventRecorder;
    use async_trait::async_trait;
    use outboxsync_core::{AggregateId, JobId};
    use outboxsync_events::{
        BrokerError, Delivery, EventKind, HandlerError, NackOutcome, OUTBOX_EVENTS, OutboxJob,
    };
    use outboxsync_programs::program_event;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn record(db: &InMemoryDatabase, n: i64) {
        let mut tx = db.begin().await.unwrap();
        for id in 1..=n {
            let (event_type, payload) = program_event(EventKind::Updated, AggregateId::new(id));
            tx.record_event(event_type, payload).await.unwrap();
        }
        tx.commit().await.unwrap();
    }

    fn config(batch_size: usize) -> DispatcherConfig {
        DispatcherConfig {
            batch_size,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn forwards_and_marks_in_batches() {
        let db = InMemoryDatabase::new();
        record(&db, 3).await;
        let broker = InMemoryBroker::arc(OUTBOX_EVENTS, RetryPolicy::default());
        let dispatcher = OutboxDispatcher::new(db.clone(), broker.clone(), config(2));

        let first = dispatcher.dispatch_once().await.unwrap();
        assert_eq!(first, TickReport { claimed: 2, forwarded: 2, failed: 0 });
        assert_eq!(db.pending_count().await.unwrap(), 1);

        let second = dispatcher.dispatch_once().await.unwrap();
        assert_eq!(second.forwarded, 1);
        assert_eq!(db.pending_count().await.unwrap(), 0);
        assert_eq!(broker.stats().unwrap().pending, 3);

        let idle = dispatcher.dispatch_once().await.unwrap();
        assert_eq!(idle, TickReport::default());
    }

    #[tokio::test]
    async fn forwards_oldest_first() {
        let db = InMemoryDatabase::new();
        record(&db, 3).await;
        let broker = InMemoryBroker::arc(OUTBOX_EVENTS, RetryPolicy::default());
        OutboxDispatcher::new(db.clone(), broker.clone(), config(10))
            .dispatch_once()
            .await
            .unwrap();

        let mut ids = Vec::new();
        while let Some(d) = broker.next_delivery(Duration::ZERO).await.unwrap() {
            ids.push(d.job.payload["id"].as_i64().unwrap());
        }
        assert_eq!(ids, vec![1, 2, 3]);
    }

    /// Rejects every enqueue of the given aggregate id.
    struct Rejecting {
        inner: Arc<InMemoryBroker>,
        reject_id: i64,
    }

    #[async_trait]
    impl Broker for Rejecting {
        fn channel(&self) -> &str {
            self.inner.channel()
        }

        async fn enqueue(&self, job: OutboxJob) -> Result<JobId, BrokerError> {
            if job.payload["id"] == self.reject_id {
                return Err(BrokerError::Connection("refused".into()));
            }
            self.inner.enqueue(job).await
        }

        async fn next_delivery(&self, wait: Duration) -> Result<Option<Delivery>, BrokerError> {
            self.inner.next_delivery(wait).await
        }

        async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
            self.inner.ack(delivery).await
        }

        async fn nack(
            &self,
            delivery: &Delivery,
            error: &HandlerError,
        ) -> Result<NackOutcome, BrokerError> {
            self.inner.nack(delivery, error).await
        }
    }

    #[tokio::test]
    async fn failed_enqueue_leaves_only_that_row_pending() {
        let db = InMemoryDatabase::new();
        record(&db, 3).await;
        let broker = Rejecting {
            inner: InMemoryBroker::arc(OUTBOX_EVENTS, RetryPolicy::default()),
            reject_id: 2,
        };
        let dispatcher = OutboxDispatcher::new(db.clone(), broker, config(10));

        let report = dispatcher.dispatch_once().await.unwrap();
        assert_eq!(report, TickReport { claimed: 3, forwarded: 2, failed: 1 });

        let pending: Vec<_> = db
            .ledger_entries()
            .unwrap()
            .into_iter()
            .filter(|e| !e.processed)
            .map(|e| e.payload["id"].as_i64().unwrap())
            .collect();
        assert_eq!(pending, vec![2]);
    }

    #[tokio::test]
    async fn unavailable_ledger_fails_the_tick_without_forwarding() {
        let db = InMemoryDatabase::new();
        record(&db, 1).await;
        let broker = InMemoryBroker::arc(OUTBOX_EVENTS, RetryPolicy::default());
        let dispatcher = OutboxDispatcher::new(db.clone(), broker.clone(), config(10));

        db.set_available(false);
        assert!(dispatcher.dispatch_once().await.is_err());
        assert_eq!(broker.stats().unwrap().pending, 0);

        db.set_available(true);
        assert_eq!(dispatcher.dispatch_once().await.unwrap().forwarded, 1);
    }

    /// Takes the store offline right after its `after`-th successful enqueue.
    struct StoreOutageAfter {
        inner: Arc<InMemoryBroker>,
        db: InMemoryDatabase,
        after: usize,
        enqueued: AtomicUsize,
    }

    #[async_trait]
    impl Broker for StoreOutageAfter {
        fn channel(&self) -> &str {
            self.inner.channel()
        }

        async fn enqueue(&self, job: OutboxJob) -> Result<JobId, BrokerError> {
            let job_id = self.inner.enqueue(job).await?;
            if self.enqueued.fetch_add(1, Ordering::SeqCst) + 1 == self.after {
                self.db.set_available(false);
            }
            Ok(job_id)
        }

        async fn next_delivery(&self, wait: Duration) -> Result<Option<Delivery>, BrokerError> {
            self.inner.next_delivery(wait).await
        }

        async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
            self.inner.ack(delivery).await
        }

        async fn nack(
            &self,
            delivery: &Delivery,
            error: &HandlerError,
        ) -> Result<NackOutcome, BrokerError> {
            self.inner.nack(delivery, error).await
        }
    }

    #[tokio::test]
    async fn store_failure_mid_batch_rolls_back_rows_already_forwarded() {
        let db = InMemoryDatabase::new();
        record(&db, 3).await;
        let inner = InMemoryBroker::arc(OUTBOX_EVENTS, RetryPolicy::default());
        let broker = StoreOutageAfter {
            inner: inner.clone(),
            db: db.clone(),
            after: 2,
            enqueued: AtomicUsize::new(0),
        };
        let dispatcher = OutboxDispatcher::new(db.clone(), broker, config(10));

        assert!(dispatcher.dispatch_once().await.is_err());
        assert_eq!(inner.stats().unwrap().pending, 2);

        db.set_available(true);
        assert_eq!(db.pending_count().await.unwrap(), 3);

        let report = dispatcher.dispatch_once().await.unwrap();
        assert_eq!(report, TickReport { claimed: 3, forwarded: 3, failed: 0 });
        assert_eq!(db.pending_count().await.unwrap(), 0);

        // The two rows forwarded before the failure are delivered twice.
        let mut ids = Vec::new();
        while let Some(d) = inner.next_delivery(Duration::ZERO).await.unwrap() {
            ids.push(d.job.payload["id"].as_i64().unwrap());
        }
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 1, 2, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_dispatcher_ticks_until_cancelled() {
        let db = InMemoryDatabase::new();
        let broker = InMemoryBroker::arc(OUTBOX_EVENTS, RetryPolicy::default());
        let dispatcher = Arc::new(OutboxDispatcher::new(
            db.clone(),
            broker.clone(),
            DispatcherConfig::default(),
        ));
        let token = CancellationToken::new();
        let handle = dispatcher.spawn(token.clone());

        record(&db, 2).await;
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(db.pending_count().await.unwrap(), 0);
        assert_eq!(broker.stats().unwrap().pending, 2);

        token.cancel();
        handle.join().await;
    }
}
