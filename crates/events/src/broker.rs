//! Broker and handler contracts.
//!
//! A broker is a durable, at-least-once channel of [`OutboxJob`]s. Each job is
//! handed to one consumer attempt at a time; the consumer reports back with
//! [`Broker::ack`] or [`Broker::nack`], and the broker owns the retry schedule.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use outboxsync_core::JobId;
use thiserror::Error;

use crate::job::OutboxJob;

/// Channel carrying ledger entries to the projection consumer.
pub const OUTBOX_EVENTS: &str = "outbox-events";

/// One delivery attempt of a job.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub job_id: JobId,
    pub job: OutboxJob,
    /// 1-based attempt number of this delivery.
    pub attempt: u32,
    /// Broker-specific handle used to ack/nack this delivery (e.g. a stream entry id).
    pub receipt: String,
}

/// What the broker did with a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    /// The job will be delivered again after `delay`.
    RetryScheduled { attempt: u32, delay: Duration },
    /// Attempts are used up; the job is terminally failed and stays inspectable.
    Exhausted { attempts: u32 },
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("broker command error: {0}")]
    Command(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("unknown delivery: {0}")]
    UnknownDelivery(String),

    #[error("broker lock poisoned")]
    Poisoned,
}

impl BrokerError {
    /// Whether retrying the same call later might succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Connection(_) | BrokerError::Command(_))
    }
}

/// Failure reported by a job handler.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Infrastructure was unavailable (store, index). Likely to succeed later.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The job itself is bad (e.g. malformed payload). Retrying will not help.
    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Channel name this broker serves.
    fn channel(&self) -> &str;

    /// Durably queue a job. Returns once the job will survive a broker restart.
    async fn enqueue(&self, job: OutboxJob) -> Result<JobId, BrokerError>;

    /// Wait up to `wait` for the next ready delivery.
    async fn next_delivery(&self, wait: Duration) -> Result<Option<Delivery>, BrokerError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError>;

    async fn nack(
        &self,
        delivery: &Delivery,
        error: &HandlerError,
    ) -> Result<NackOutcome, BrokerError>;
}

#[async_trait]
impl<B: Broker + ?Sized> Broker for Arc<B> {
    fn channel(&self) -> &str {
        (**self).channel()
    }

    async fn enqueue(&self, job: OutboxJob) -> Result<JobId, BrokerError> {
        (**self).enqueue(job).await
    }

    async fn next_delivery(&self, wait: Duration) -> Result<Option<Delivery>, BrokerError> {
        (**self).next_delivery(wait).await
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        (**self).ack(delivery).await
    }

    async fn nack(
        &self,
        delivery: &Delivery,
        error: &HandlerError,
    ) -> Result<NackOutcome, BrokerError> {
        (**self).nack(delivery, error).await
    }
}

/// Applies one job. Must be idempotent: the broker may deliver a job more than once.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &OutboxJob) -> Result<(), HandlerError>;
}

#[async_trait]
impl<H: JobHandler + ?Sized> JobHandler for Arc<H> {
    async fn handle(&self, job: &OutboxJob) -> Result<(), HandlerError> {
        (**self).handle(job).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_infra_failures_are_transient() {
        assert!(BrokerError::Connection("refused".into()).is_transient());
        assert!(BrokerError::Command("XADD".into()).is_transient());
        assert!(!BrokerError::Serialization("bad".into()).is_transient());
        assert!(!BrokerError::UnknownDelivery("1-0".into()).is_transient());
    }

    #[test]
    fn handler_error_classification() {
        assert!(HandlerError::permanent("bad payload").is_permanent());
        assert!(!HandlerError::transient("index down").is_permanent());
    }
}
