//! In-process broker.
//!
//! Single-process only: jobs do not survive a restart. Intended for tests/dev
//! and for wiring the pipeline without Redis.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use outboxsync_core::JobId;
use outboxsync_events::{Broker, BrokerError, Delivery, HandlerError, NackOutcome, OutboxJob};

use super::types::{BrokerStats, FailedJob, JobRecord, JobStatus, RetryPolicy};

#[derive(Debug)]
struct Slot {
    record: JobRecord,
    available_at: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    /// Keyed by time-ordered job id, so iteration order is enqueue order.
    jobs: BTreeMap<JobId, Slot>,
    completed: usize,
}

/// In-memory broker with retry/backoff and a terminal `Failed` state.
#[derive(Debug)]
pub struct InMemoryBroker {
    channel: String,
    policy: RetryPolicy,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl InMemoryBroker {
    pub fn new(channel: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            channel: channel.into(),
            policy,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    pub fn arc(channel: impl Into<String>, policy: RetryPolicy) -> Arc<Self> {
        Arc::new(Self::new(channel, policy))
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn lock(&self) -> Result<MutexGuard<'_, QueueState>, BrokerError> {
        self.state.lock().map_err(|_| BrokerError::Poisoned)
    }

    pub fn stats(&self) -> Result<BrokerStats, BrokerError> {
        let state = self.lock()?;
        let mut stats = BrokerStats {
            completed: state.completed,
            ..Default::default()
        };
        for slot in state.jobs.values() {
            match slot.record.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Retrying { .. } => stats.retrying += 1,
                JobStatus::Failed { .. } => stats.failed += 1,
                JobStatus::Completed => {}
            }
        }
        Ok(stats)
    }

    /// Terminally failed jobs, oldest first.
    pub fn failed_jobs(&self, limit: usize) -> Result<Vec<FailedJob>, BrokerError> {
        let state = self.lock()?;
        Ok(state
            .jobs
            .values()
            .filter_map(|slot| match &slot.record.status {
                JobStatus::Failed { error, attempts } => Some(FailedJob {
                    job_id: slot.record.id,
                    job: slot.record.job.clone(),
                    attempts: *attempts,
                    error: error.clone(),
                    failed_at: slot.record.updated_at,
                }),
                _ => None,
            })
            .take(limit)
            .collect())
    }

    pub fn job(&self, id: JobId) -> Result<Option<JobRecord>, BrokerError> {
        let state = self.lock()?;
        Ok(state.jobs.get(&id).map(|slot| slot.record.clone()))
    }

    /// Claim the oldest ready job, or report when the next one becomes ready.
    fn try_claim(&self) -> Result<Result<Delivery, Option<Instant>>, BrokerError> {
        let mut state = self.lock()?;
        let now = Instant::now();

        let mut next_ready: Option<Instant> = None;
        let mut ready: Option<JobId> = None;
        for (id, slot) in &state.jobs {
            if !slot.record.status.is_deliverable() {
                continue;
            }
            if slot.available_at <= now {
                ready = Some(*id);
                break;
            }
            next_ready = Some(next_ready.map_or(slot.available_at, |t| t.min(slot.available_at)));
        }

        let Some(id) = ready else {
            return Ok(Err(next_ready));
        };
        let Some(slot) = state.jobs.get_mut(&id) else {
            return Ok(Err(next_ready));
        };
        slot.record.mark_running();
        Ok(Ok(Delivery {
            job_id: id,
            job: slot.record.job.clone(),
            attempt: slot.record.attempt,
            receipt: id.to_string(),
        }))
    }

    fn running_slot<'a>(
        state: &'a mut QueueState,
        delivery: &Delivery,
    ) -> Result<&'a mut Slot, BrokerError> {
        match state.jobs.get_mut(&delivery.job_id) {
            Some(slot)
                if slot.record.status == JobStatus::Running
                    && slot.record.attempt == delivery.attempt =>
            {
                Ok(slot)
            }
            _ => Err(BrokerError::UnknownDelivery(delivery.receipt.clone())),
        }
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    fn channel(&self) -> &str {
        &self.channel
    }

    async fn enqueue(&self, job: OutboxJob) -> Result<JobId, BrokerError> {
        let record = JobRecord::new(job);
        let id = record.id;
        {
            let mut state = self.lock()?;
            state.jobs.insert(
                id,
                Slot {
                    record,
                    available_at: Instant::now(),
                },
            );
        }
        self.notify.notify_waiters();
        debug!(channel = %self.channel, job_id = %id, "job enqueued");
        Ok(id)
    }

    async fn next_delivery(&self, wait: Duration) -> Result<Option<Delivery>, BrokerError> {
        let deadline = Instant::now() + wait;
        loop {
            // Register interest before looking, so an enqueue in between is not missed.
            let notified = self.notify.notified();

            let next_ready = match self.try_claim()? {
                Ok(delivery) => return Ok(Some(delivery)),
                Err(next_ready) => next_ready,
            };

            if Instant::now() >= deadline {
                return Ok(None);
            }
            let wake_at = next_ready.map_or(deadline, |t| t.min(deadline));
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut state = self.lock()?;
        let slot = Self::running_slot(&mut state, delivery)?;
        slot.record.mark_completed();
        state.jobs.remove(&delivery.job_id);
        state.completed += 1;
        Ok(())
    }

    async fn nack(
        &self,
        delivery: &Delivery,
        error: &HandlerError,
    ) -> Result<NackOutcome, BrokerError> {
        let outcome = {
            let mut state = self.lock()?;
            let slot = Self::running_slot(&mut state, delivery)?;
            let outcome = slot.record.mark_failed(error.to_string(), &self.policy);
            if let NackOutcome::RetryScheduled { delay, .. } = outcome {
                slot.available_at = Instant::now() + delay;
            }
            outcome
        };

        if let NackOutcome::Exhausted { attempts } = outcome {
            warn!(
                channel = %self.channel,
                job_id = %delivery.job_id,
                attempts,
                failed_at = %Utc::now(),
                "job failed terminally"
            );
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outboxsync_core::LedgerEntryId;
    use outboxsync_events::{EventType, OUTBOX_EVENTS};

    fn job(id: i64) -> OutboxJob {
        OutboxJob::new(
            LedgerEntryId::new(),
            EventType::updated("PROGRAM"),
            serde_json::json!({ "id": id }),
        )
    }

    #[tokio::test]
    async fn delivers_in_enqueue_order() {
        let broker = InMemoryBroker::new(OUTBOX_EVENTS, RetryPolicy::default());
        broker.enqueue(job(1)).await.unwrap();
        broker.enqueue(job(2)).await.unwrap();

        let first = broker.next_delivery(Duration::ZERO).await.unwrap().unwrap();
        let second = broker.next_delivery(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(first.job.payload["id"], 1);
        assert_eq!(second.job.payload["id"], 2);
        assert!(broker.next_delivery(Duration::ZERO).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn a_job_is_handed_to_one_attempt_at_a_time() {
        let broker = InMemoryBroker::new(OUTBOX_EVENTS, RetryPolicy::default());
        broker.enqueue(job(1)).await.unwrap();

        let delivery = broker.next_delivery(Duration::ZERO).await.unwrap().unwrap();
        assert!(broker.next_delivery(Duration::ZERO).await.unwrap().is_none());

        broker.ack(&delivery).await.unwrap();
        assert_eq!(broker.stats().unwrap().completed, 1);
        assert!(matches!(
            broker.ack(&delivery).await,
            Err(BrokerError::UnknownDelivery(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_jobs_back_off_then_fail_terminally() {
        let broker = InMemoryBroker::new(OUTBOX_EVENTS, RetryPolicy::default());
        let id = broker.enqueue(job(1)).await.unwrap();
        let err = HandlerError::transient("index down");

        let d1 = broker.next_delivery(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(
            broker.nack(&d1, &err).await.unwrap(),
            NackOutcome::RetryScheduled {
                attempt: 1,
                delay: Duration::from_secs(2)
            }
        );
        // Not ready before the backoff elapses.
        assert!(broker.next_delivery(Duration::from_millis(1_900)).await.unwrap().is_none());

        let d2 = broker.next_delivery(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(d2.attempt, 2);
        broker.nack(&d2, &err).await.unwrap();

        assert!(broker.next_delivery(Duration::from_millis(3_900)).await.unwrap().is_none());
        let d3 = broker.next_delivery(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(d3.attempt, 3);
        assert_eq!(
            broker.nack(&d3, &err).await.unwrap(),
            NackOutcome::Exhausted { attempts: 3 }
        );

        // Terminal: never delivered again, but inspectable.
        assert!(broker.next_delivery(Duration::from_secs(60)).await.unwrap().is_none());
        let failed = broker.failed_jobs(10).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].job_id, id);
        assert_eq!(failed[0].attempts, 3);
        assert_eq!(broker.stats().unwrap().failed, 1);
    }

    #[tokio::test]
    async fn waiting_consumer_wakes_on_enqueue() {
        let broker = InMemoryBroker::arc(OUTBOX_EVENTS, RetryPolicy::default());
        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.next_delivery(Duration::from_secs(5)).await })
        };

        tokio::task::yield_now().await;
        broker.enqueue(job(7)).await.unwrap();

        let delivery = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(delivery.job.payload["id"], 7);
    }

    #[tokio::test]
    async fn stale_delivery_cannot_be_nacked() {
        let broker = InMemoryBroker::new(OUTBOX_EVENTS, RetryPolicy::default());
        broker.enqueue(job(1)).await.unwrap();
        let mut delivery = broker.next_delivery(Duration::ZERO).await.unwrap().unwrap();
        delivery.attempt += 1;
        assert!(matches!(
            broker.nack(&delivery, &HandlerError::permanent("bad")).await,
            Err(BrokerError::UnknownDelivery(_))
        ));
    }
}
