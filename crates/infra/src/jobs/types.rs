//! Job records, retry policy and broker statistics.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use outboxsync_core::JobId;
use outboxsync_events::{NackOutcome, OutboxJob};

/// Retry policy applied by a broker to failed deliveries.
///
/// Backoff is exponential: the delay after failed attempt `n` (1-indexed) is
/// `base_delay * 2^(n-1)`, capped at `max_delay`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total delivery attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(5 * 60),
        }
    }
}

impl RetryPolicy {
    pub fn exponential(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            ..Default::default()
        }
    }

    /// A single attempt; failures are terminal immediately.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delay before the attempt following failed attempt `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Whether a job that just failed attempt `attempt` gets another one.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Lifecycle of a job inside a broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum JobStatus {
    /// Queued, never attempted.
    Pending,
    /// Handed to a consumer.
    Running,
    /// Failed, waiting out its backoff before the next attempt.
    Retrying { error: String, attempt: u32 },
    Completed,
    /// Attempts exhausted. Kept for inspection; never re-queued automatically.
    Failed { error: String, attempts: u32 },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed { .. })
    }

    pub fn is_deliverable(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Retrying { .. })
    }
}

/// Record of one delivery attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobAttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// A job as tracked by a broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub job: OutboxJob,
    pub status: JobStatus,
    /// Attempts started so far.
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Start of the attempt in progress, if any.
    pub started_at: Option<DateTime<Utc>>,
    pub history: Vec<JobAttemptRecord>,
}

impl JobRecord {
    pub fn new(job: OutboxJob) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            job,
            status: JobStatus::Pending,
            attempt: 0,
            enqueued_at: now,
            updated_at: now,
            started_at: None,
            history: Vec::new(),
        }
    }

    pub fn mark_running(&mut self) {
        let now = Utc::now();
        self.status = JobStatus::Running;
        self.attempt += 1;
        self.started_at = Some(now);
        self.updated_at = now;
    }

    pub fn mark_completed(&mut self) {
        let now = Utc::now();
        self.record_attempt(now, None);
        self.status = JobStatus::Completed;
        self.updated_at = now;
    }

    /// Record a failed attempt and decide what happens next.
    pub fn mark_failed(&mut self, error: String, policy: &RetryPolicy) -> NackOutcome {
        let now = Utc::now();
        self.record_attempt(now, Some(error.clone()));
        self.updated_at = now;

        if policy.should_retry(self.attempt) {
            self.status = JobStatus::Retrying {
                error,
                attempt: self.attempt,
            };
            NackOutcome::RetryScheduled {
                attempt: self.attempt,
                delay: policy.delay_for_attempt(self.attempt),
            }
        } else {
            self.status = JobStatus::Failed {
                error,
                attempts: self.attempt,
            };
            NackOutcome::Exhausted {
                attempts: self.attempt,
            }
        }
    }

    fn record_attempt(&mut self, now: DateTime<Utc>, error: Option<String>) {
        let started_at = self.started_at.take().unwrap_or(now);
        self.history.push(JobAttemptRecord {
            attempt: self.attempt,
            started_at,
            finished_at: now,
            success: error.is_none(),
            error,
            duration_ms: (now - started_at).num_milliseconds().max(0) as u64,
        });
    }
}

/// A terminally failed job, as listed for inspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedJob {
    pub job_id: JobId,
    pub job: OutboxJob,
    pub attempts: u32,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// Point-in-time broker counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BrokerStats {
    pub pending: usize,
    pub running: usize,
    pub retrying: usize,
    pub completed: usize,
    pub failed: usize,
}
