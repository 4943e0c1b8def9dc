//! Redis Streams broker (durable, at-least-once delivery).
//!
//! ## Keys
//!
//! - **Stream** `{prefix}:{channel}`: ready jobs, read through one consumer group
//! - **Delayed** `{stream}:delayed`: sorted set of jobs waiting out their backoff,
//!   scored by ready-at (unix ms)
//! - **Failed** `{stream}:failed`: stream of terminally failed jobs (inspection only)
//! - **Completed** `{stream}:completed`: counter of acked jobs
//!
//! ## Delivery
//!
//! Each poll first promotes due delayed jobs back onto the stream, then
//! reclaims entries left pending by a consumer that stopped without acking
//! (XPENDING + XCLAIM), then reads new entries (XREADGROUP). Acked and failed
//! entries are deleted from the stream so it stays small.
//!
//! A promotion removes the member from the delayed set and appends it to the
//! stream in one Lua script, so a dropped connection never loses the job.
//! Deliveries of a stream entry that were never acked count as attempts: an
//! entry reclaimed past `max_attempts` goes to the failed stream.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamClaimReply, StreamId, StreamPendingCountReply, StreamRangeReply, StreamReadReply};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use outboxsync_core::JobId;
use outboxsync_events::{Broker, BrokerError, Delivery, HandlerError, NackOutcome, OutboxJob};

use super::types::{BrokerStats, FailedJob, RetryPolicy};

/// Default key prefix.
const DEFAULT_PREFIX: &str = "outboxsync";

/// Default consumer group.
const DEFAULT_GROUP: &str = "outboxsync-consumers";

/// Pending entries idle longer than this are reclaimed from their consumer.
const DEFAULT_RECLAIM_IDLE: Duration = Duration::from_secs(60);

/// Max delayed jobs promoted per poll.
const PROMOTE_BATCH: isize = 32;

/// Idle blocking-read connections kept for reuse.
const MAX_IDLE_BLOCKING: usize = 16;

/// Move `ARGV[1]` from the sorted set `KEYS[1]` to the stream `KEYS[2]`, with
/// the remaining ARGV as field/value pairs. Only the caller that removed the
/// member appends it; everyone else gets nil.
const MOVE_MEMBER_SCRIPT: &str = r#"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then
    return false
end
return redis.call('XADD', KEYS[2], '*', unpack(ARGV, 2))
"#;

#[derive(Debug, Clone)]
pub struct RedisStreamsConfig {
    pub url: String,
    pub channel: String,
    pub prefix: String,
    pub group: String,
    /// Unique per process (e.g. `consumer-<uuid>`).
    pub consumer: String,
    pub retry: RetryPolicy,
    pub reclaim_idle: Duration,
}

impl RedisStreamsConfig {
    pub fn new(url: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            channel: channel.into(),
            prefix: DEFAULT_PREFIX.to_string(),
            group: DEFAULT_GROUP.to_string(),
            consumer: format!("consumer-{}", uuid::Uuid::now_v7()),
            retry: RetryPolicy::default(),
            reclaim_idle: DEFAULT_RECLAIM_IDLE,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn stream_key(&self) -> String {
        format!("{}:{}", self.prefix, self.channel)
    }
}

type StreamFields = Vec<(&'static str, String)>;

/// Fields of a job entry on the ready stream.
fn job_fields(job_id: JobId, attempts: u32, job: &OutboxJob) -> Result<StreamFields, BrokerError> {
    let payload =
        serde_json::to_string(job).map_err(|e| BrokerError::Serialization(e.to_string()))?;
    Ok(vec![
        ("job_id", job_id.to_string()),
        ("attempts", attempts.to_string()),
        ("payload", payload),
    ])
}

/// Fields of a terminally failed job on the failed stream.
fn failed_fields(
    job_id: JobId,
    attempts: u32,
    error: &str,
    job: &OutboxJob,
) -> Result<StreamFields, BrokerError> {
    let payload =
        serde_json::to_string(job).map_err(|e| BrokerError::Serialization(e.to_string()))?;
    Ok(vec![
        ("job_id", job_id.to_string()),
        ("attempts", attempts.to_string()),
        ("error", error.to_string()),
        ("failed_at", Utc::now().to_rfc3339()),
        ("payload", payload),
    ])
}

/// Where a due delayed member goes.
#[derive(Debug)]
enum Promotion {
    /// Back onto the ready stream.
    Requeue(StreamFields),
    /// Undecodable; parked in the failed stream.
    Quarantine(StreamFields),
}

fn plan_promotion(member: &str) -> Promotion {
    let requeue = serde_json::from_str::<DelayedJob>(member)
        .map_err(|e| BrokerError::Serialization(e.to_string()))
        .and_then(|d| job_fields(d.job_id, d.attempts, &d.job));
    match requeue {
        Ok(fields) => Promotion::Requeue(fields),
        Err(e) => Promotion::Quarantine(vec![
            ("error", format!("undecodable delayed job: {e}")),
            ("failed_at", Utc::now().to_rfc3339()),
            ("payload", member.to_string()),
        ]),
    }
}

/// Attempt number of a delivery. `prior_deliveries` counts earlier
/// deliveries of the same stream entry, none of which were acked or nacked.
fn delivery_attempt(stored_attempts: u32, prior_deliveries: u32) -> u32 {
    stored_attempts
        .saturating_add(prior_deliveries)
        .saturating_add(1)
}

fn to_delivery(entry: &StreamId, prior_deliveries: u32) -> Result<Delivery, BrokerError> {
    let job_id: String = entry
        .get("job_id")
        .ok_or_else(|| BrokerError::Serialization(format!("{}: missing job_id", entry.id)))?;
    let job_id: JobId = job_id
        .parse()
        .map_err(|e| BrokerError::Serialization(format!("{}: {e}", entry.id)))?;
    let attempts: u32 = entry.get("attempts").unwrap_or(0);
    let payload: String = entry
        .get("payload")
        .ok_or_else(|| BrokerError::Serialization(format!("{}: missing payload", entry.id)))?;
    let job: OutboxJob = serde_json::from_str(&payload)
        .map_err(|e| BrokerError::Serialization(format!("{}: {e}", entry.id)))?;

    Ok(Delivery {
        job_id,
        job,
        attempt: delivery_attempt(attempts, prior_deliveries),
        receipt: entry.id.clone(),
    })
}

/// Connections reserved for blocking reads, reused across polls.
struct IdleConnections<C> {
    idle: Mutex<Vec<C>>,
}

impl<C> IdleConnections<C> {
    fn new() -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
        }
    }

    fn take(&self) -> Option<C> {
        self.idle.lock().ok()?.pop()
    }

    /// Keep `conn` for the next read unless enough are idle already.
    fn put_back(&self, conn: C) {
        if let Ok(mut idle) = self.idle.lock() {
            if idle.len() < MAX_IDLE_BLOCKING {
                idle.push(conn);
            }
        }
    }

    fn idle_count(&self) -> usize {
        self.idle.lock().map(|idle| idle.len()).unwrap_or(0)
    }
}

/// Job waiting out its backoff in the delayed set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DelayedJob {
    job_id: JobId,
    /// Attempts already made.
    attempts: u32,
    job: OutboxJob,
}

#[derive(Clone)]
pub struct RedisStreamsBroker {
    client: redis::Client,
    conn: MultiplexedConnection,
    blocking: Arc<IdleConnections<MultiplexedConnection>>,
    move_member: redis::Script,
    config: RedisStreamsConfig,
    stream_key: String,
    delayed_key: String,
    failed_key: String,
    completed_key: String,
}

impl core::fmt::Debug for RedisStreamsBroker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisStreamsBroker")
            .field("stream_key", &self.stream_key)
            .field("group", &self.config.group)
            .field("consumer", &self.config.consumer)
            .field("idle_blocking_connections", &self.blocking.idle_count())
            .finish()
    }
}

fn map_redis_error(operation: &str, err: redis::RedisError) -> BrokerError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() {
        BrokerError::Connection(format!("{operation}: {err}"))
    } else {
        BrokerError::Command(format!("{operation}: {err}"))
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

impl RedisStreamsBroker {
    /// Connect and make sure the consumer group exists.
    pub async fn connect(config: RedisStreamsConfig) -> Result<Self, BrokerError> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| map_redis_error("connect", e))?;
        let blocking = Arc::new(IdleConnections::new());
        blocking.put_back(
            client
                .get_multiplexed_tokio_connection()
                .await
                .map_err(|e| map_redis_error("connect", e))?,
        );

        let stream_key = config.stream_key();
        let broker = Self {
            client,
            conn,
            blocking,
            move_member: redis::Script::new(MOVE_MEMBER_SCRIPT),
            delayed_key: format!("{stream_key}:delayed"),
            failed_key: format!("{stream_key}:failed"),
            completed_key: format!("{stream_key}:completed"),
            stream_key,
            config,
        };
        broker.ensure_consumer_group().await?;
        Ok(broker)
    }

    /// XGROUP CREATE ... MKSTREAM; an existing group is fine.
    async fn ensure_consumer_group(&self) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(&self.config.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match created {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(map_redis_error("XGROUP CREATE", e)),
        }
    }

    async fn add_to_stream(
        &self,
        conn: &mut MultiplexedConnection,
        job_id: JobId,
        attempts: u32,
        job: &OutboxJob,
    ) -> Result<String, BrokerError> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(&self.stream_key).arg("*");
        for (field, value) in job_fields(job_id, attempts, job)? {
            cmd.arg(field).arg(value);
        }
        cmd.query_async(conn)
            .await
            .map_err(|e| map_redis_error("XADD", e))
    }

    /// Move delayed jobs whose backoff elapsed back onto the stream.
    async fn promote_due(&self, conn: &mut MultiplexedConnection) -> Result<(), BrokerError> {
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&self.delayed_key)
            .arg("-inf")
            .arg(now_ms())
            .arg("LIMIT")
            .arg(0)
            .arg(PROMOTE_BATCH)
            .query_async(conn)
            .await
            .map_err(|e| map_redis_error("ZRANGEBYSCORE", e))?;

        for member in due {
            let (target, fields) = match plan_promotion(&member) {
                Promotion::Requeue(fields) => (&self.stream_key, fields),
                Promotion::Quarantine(fields) => {
                    warn!("undecodable delayed job moved to failed stream");
                    (&self.failed_key, fields)
                }
            };

            let mut invocation = self.move_member.key(&self.delayed_key);
            invocation.key(target).arg(&member);
            for (field, value) in fields {
                invocation.arg(field).arg(value);
            }
            let moved: Option<String> = invocation
                .invoke_async(conn)
                .await
                .map_err(|e| map_redis_error("promote delayed job", e))?;
            if let Some(entry_id) = moved {
                debug!(entry_id = %entry_id, key = %target, "delayed job promoted");
            }
        }
        Ok(())
    }

    /// Claim one entry another consumer left pending for too long, with the
    /// number of times it was delivered before.
    async fn reclaim_stale(
        &self,
        conn: &mut MultiplexedConnection,
    ) -> Result<Option<(StreamId, u32)>, BrokerError> {
        let idle_ms = self.config.reclaim_idle.as_millis() as u64;
        let pending: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(&self.config.group)
            .arg("IDLE")
            .arg(idle_ms)
            .arg("-")
            .arg("+")
            .arg(1)
            .query_async(conn)
            .await
            .map_err(|e| map_redis_error("XPENDING", e))?;

        let Some(stale) = pending.ids.first() else {
            return Ok(None);
        };

        let claimed: StreamClaimReply = redis::cmd("XCLAIM")
            .arg(&self.stream_key)
            .arg(&self.config.group)
            .arg(&self.config.consumer)
            .arg(idle_ms)
            .arg(&stale.id)
            .query_async(conn)
            .await
            .map_err(|e| map_redis_error("XCLAIM", e))?;

        if let Some(entry) = claimed.ids.into_iter().next() {
            warn!(
                entry_id = %entry.id,
                previous_consumer = %stale.consumer,
                times_delivered = stale.times_delivered,
                "reclaimed stale pending entry"
            );
            let prior = u32::try_from(stale.times_delivered).unwrap_or(u32::MAX);
            return Ok(Some((entry, prior)));
        }
        Ok(None)
    }

    /// XREADGROUP for one new entry. Blocking reads use their own connection so
    /// they never stall commands multiplexed on the shared one.
    async fn read_new(&self, wait: Duration) -> Result<Option<StreamId>, BrokerError> {
        let block_ms = wait.as_millis() as u64;

        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.config.group)
            .arg(&self.config.consumer)
            .arg("COUNT")
            .arg(1);
        // BLOCK 0 would block forever.
        if block_ms > 0 {
            cmd.arg("BLOCK").arg(block_ms);
        }
        cmd.arg("STREAMS").arg(&self.stream_key).arg(">");

        let reply: redis::RedisResult<Option<StreamReadReply>> = if block_ms > 0 {
            let mut blocking = match self.blocking.take() {
                Some(conn) => conn,
                None => self
                    .client
                    .get_multiplexed_tokio_connection()
                    .await
                    .map_err(|e| map_redis_error("connect", e))?,
            };
            let reply = cmd.query_async(&mut blocking).await;
            // A failed connection is dropped; the next read opens a fresh one.
            if reply.is_ok() {
                self.blocking.put_back(blocking);
            }
            reply
        } else {
            let mut conn = self.conn.clone();
            cmd.query_async(&mut conn).await
        };
        let reply = reply.map_err(|e| map_redis_error("XREADGROUP", e))?;

        Ok(reply
            .and_then(|r| r.keys.into_iter().next())
            .and_then(|k| k.ids.into_iter().next()))
    }

    /// Park an entry that cannot even be decoded in the failed stream.
    async fn quarantine(&self, entry: &StreamId, reason: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = entry.get("payload");
        redis::pipe()
            .atomic()
            .cmd("XADD")
            .arg(&self.failed_key)
            .arg("*")
            .arg("entry_id")
            .arg(&entry.id)
            .arg("error")
            .arg(reason)
            .arg("failed_at")
            .arg(Utc::now().to_rfc3339())
            .arg("payload")
            .arg(raw.unwrap_or_default())
            .ignore()
            .cmd("XACK")
            .arg(&self.stream_key)
            .arg(&self.config.group)
            .arg(&entry.id)
            .ignore()
            .cmd("XDEL")
            .arg(&self.stream_key)
            .arg(&entry.id)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| map_redis_error("quarantine", e))
    }

    pub async fn stats(&self) -> Result<BrokerStats, BrokerError> {
        let mut conn = self.conn.clone();
        let (stream_len, delayed, failed, completed): (usize, usize, usize, Option<usize>) =
            redis::pipe()
                .cmd("XLEN")
                .arg(&self.stream_key)
                .cmd("ZCARD")
                .arg(&self.delayed_key)
                .cmd("XLEN")
                .arg(&self.failed_key)
                .cmd("GET")
                .arg(&self.completed_key)
                .query_async(&mut conn)
                .await
                .map_err(|e| map_redis_error("stats", e))?;

        let pending: redis::Value = redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(&self.config.group)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("XPENDING", e))?;
        let running = match pending {
            redis::Value::Bulk(ref items) => match items.first() {
                Some(redis::Value::Int(n)) => *n as usize,
                _ => 0,
            },
            _ => 0,
        };

        Ok(BrokerStats {
            pending: stream_len.saturating_sub(running),
            running,
            retrying: delayed,
            completed: completed.unwrap_or(0),
            failed,
        })
    }

    /// Terminally failed jobs, oldest first.
    pub async fn failed_jobs(&self, limit: usize) -> Result<Vec<FailedJob>, BrokerError> {
        let mut conn = self.conn.clone();
        let range: StreamRangeReply = redis::cmd("XRANGE")
            .arg(&self.failed_key)
            .arg("-")
            .arg("+")
            .arg("COUNT")
            .arg(limit)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("XRANGE", e))?;

        Ok(range.ids.iter().filter_map(failed_job_from_entry).collect())
    }

    /// Move a delivery to the failed stream and drop it from the ready one.
    async fn fail_terminally(&self, delivery: &Delivery, error: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        self.push_failed(&mut pipe, delivery, error)?;
        self.push_release(&mut pipe, &delivery.receipt);
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| map_redis_error("fail job", e))
    }

    fn push_failed(
        &self,
        pipe: &mut redis::Pipeline,
        delivery: &Delivery,
        error: &str,
    ) -> Result<(), BrokerError> {
        let fields = failed_fields(delivery.job_id, delivery.attempt, error, &delivery.job)?;
        let xadd = pipe.cmd("XADD").arg(&self.failed_key).arg("*");
        for (field, value) in fields {
            xadd.arg(field).arg(value);
        }
        xadd.ignore();
        Ok(())
    }

    /// XACK + XDEL of a stream entry.
    fn push_release(&self, pipe: &mut redis::Pipeline, receipt: &str) {
        pipe.cmd("XACK")
            .arg(&self.stream_key)
            .arg(&self.config.group)
            .arg(receipt)
            .ignore()
            .cmd("XDEL")
            .arg(&self.stream_key)
            .arg(receipt)
            .ignore();
    }
}

/// Entries without a job id (quarantined raw entries) or with an undecodable
/// payload are skipped.
fn failed_job_from_entry(entry: &StreamId) -> Option<FailedJob> {
    let job_id: JobId = entry.get::<String>("job_id")?.parse().ok()?;
    let payload: String = entry.get("payload")?;
    let job = serde_json::from_str::<OutboxJob>(&payload).ok()?;
    let failed_at = entry
        .get::<String>("failed_at")
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);
    Some(FailedJob {
        job_id,
        job,
        attempts: entry.get("attempts").unwrap_or(0),
        error: entry.get("error").unwrap_or_default(),
        failed_at,
    })
}

#[async_trait]
impl Broker for RedisStreamsBroker {
    fn channel(&self) -> &str {
        &self.config.channel
    }

    #[instrument(skip(self, job), fields(stream_key = %self.stream_key, ledger_entry_id = %job.ledger_entry_id), err)]
    async fn enqueue(&self, job: OutboxJob) -> Result<JobId, BrokerError> {
        let mut conn = self.conn.clone();
        let job_id = JobId::new();
        let entry_id = self.add_to_stream(&mut conn, job_id, 0, &job).await?;
        debug!(job_id = %job_id, entry_id = %entry_id, "job enqueued");
        Ok(job_id)
    }

    async fn next_delivery(&self, wait: Duration) -> Result<Option<Delivery>, BrokerError> {
        let mut conn = self.conn.clone();
        self.promote_due(&mut conn).await?;

        let entry = match self.reclaim_stale(&mut conn).await? {
            Some(reclaimed) => Some(reclaimed),
            None => self.read_new(wait).await?.map(|entry| (entry, 0)),
        };
        let Some((entry, prior_deliveries)) = entry else {
            return Ok(None);
        };

        match to_delivery(&entry, prior_deliveries) {
            Ok(delivery) if delivery.attempt > self.config.retry.max_attempts => {
                let attempts = delivery.attempt - 1;
                warn!(
                    job_id = %delivery.job_id,
                    entry_id = %entry.id,
                    attempts,
                    "job abandoned by its consumers too often, moved to failed stream"
                );
                let failed = Delivery {
                    attempt: attempts,
                    ..delivery
                };
                self.fail_terminally(
                    &failed,
                    &format!("no ack after {attempts} deliveries"),
                )
                .await?;
                Ok(None)
            }
            Ok(delivery) => Ok(Some(delivery)),
            Err(e) => {
                warn!(entry_id = %entry.id, error = %e, "undecodable stream entry moved to failed stream");
                self.quarantine(&entry, &e.to_string()).await?;
                Ok(None)
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let (acked,): (i64,) = redis::pipe()
            .atomic()
            .cmd("XACK")
            .arg(&self.stream_key)
            .arg(&self.config.group)
            .arg(&delivery.receipt)
            .cmd("XDEL")
            .arg(&self.stream_key)
            .arg(&delivery.receipt)
            .ignore()
            .cmd("INCR")
            .arg(&self.completed_key)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("XACK", e))?;

        if acked == 0 {
            return Err(BrokerError::UnknownDelivery(delivery.receipt.clone()));
        }
        Ok(())
    }

    async fn nack(
        &self,
        delivery: &Delivery,
        error: &HandlerError,
    ) -> Result<NackOutcome, BrokerError> {
        let policy = &self.config.retry;
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();

        let outcome = if policy.should_retry(delivery.attempt) {
            let delay = policy.delay_for_attempt(delivery.attempt);
            let member = serde_json::to_string(&DelayedJob {
                job_id: delivery.job_id,
                attempts: delivery.attempt,
                job: delivery.job.clone(),
            })
            .map_err(|e| BrokerError::Serialization(e.to_string()))?;
            pipe.cmd("ZADD")
                .arg(&self.delayed_key)
                .arg(now_ms() + delay.as_millis() as i64)
                .arg(member)
                .ignore();
            NackOutcome::RetryScheduled {
                attempt: delivery.attempt,
                delay,
            }
        } else {
            self.push_failed(&mut pipe, delivery, &error.to_string())?;
            NackOutcome::Exhausted {
                attempts: delivery.attempt,
            }
        };
        self.push_release(&mut pipe, &delivery.receipt);

        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| map_redis_error("nack", e))?;

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outboxsync_core::LedgerEntryId;
    use outboxsync_events::{EventType, OUTBOX_EVENTS};

    #[test]
    fn keys_derive_from_prefix_and_channel() {
        let config = RedisStreamsConfig::new("redis://localhost:6379", OUTBOX_EVENTS);
        assert_eq!(config.stream_key(), "outboxsync:outbox-events");
        assert!(config.consumer.starts_with("consumer-"));
    }

    #[test]
    fn delayed_job_member_round_trips_with_attempts() {
        let member = DelayedJob {
            job_id: JobId::new(),
            attempts: 2,
            job: OutboxJob::new(
                LedgerEntryId::new(),
                EventType::deleted("PROGRAM"),
                serde_json::json!({ "id": 3 }),
            ),
        };
        let json = serde_json::to_value(&member).unwrap();
        assert_eq!(json["attempts"], 2);
        assert_eq!(json["job"]["eventType"], "PROGRAM_DELETED");
    }

    fn entry(id: &str, fields: &[(&str, String)]) -> StreamId {
        StreamId {
            id: id.to_string(),
            map: fields
                .iter()
                .map(|(k, v)| (k.to_string(), redis::Value::Data(v.as_bytes().to_vec())))
                .collect(),
        }
    }

    fn broker_config() -> RedisStreamsConfig {
        RedisStreamsConfig::new("redis://localhost:6379", OUTBOX_EVENTS)
    }

    fn sample_job() -> OutboxJob {
        OutboxJob::new(
            LedgerEntryId::new(),
            EventType::updated("PROGRAM"),
            serde_json::json!({ "id": 9 }),
        )
    }

    #[test]
    fn promoted_job_keeps_its_identity_and_attempt_count() {
        let job_id = JobId::new();
        let job = sample_job();
        let member = serde_json::to_string(&DelayedJob {
            job_id,
            attempts: 2,
            job: job.clone(),
        })
        .unwrap();

        let Promotion::Requeue(fields) = plan_promotion(&member) else {
            panic!("expected requeue");
        };
        let promoted = entry("5-0", &fields);
        assert_eq!(promoted.get::<String>("job_id"), Some(job_id.to_string()));
        assert_eq!(promoted.get::<u32>("attempts"), Some(2));
        let payload: String = promoted.get("payload").unwrap();
        assert_eq!(serde_json::from_str::<OutboxJob>(&payload).unwrap(), job);
    }

    #[test]
    fn undecodable_delayed_member_is_quarantined_not_dropped() {
        let Promotion::Quarantine(fields) = plan_promotion("{not json") else {
            panic!("expected quarantine");
        };
        assert!(fields.contains(&("payload", "{not json".to_string())));
        assert!(fields.iter().any(|(k, _)| *k == "error"));
    }

    #[test]
    fn move_script_appends_only_after_removing_the_member() {
        let zrem = MOVE_MEMBER_SCRIPT.find("ZREM").unwrap();
        let xadd = MOVE_MEMBER_SCRIPT.find("XADD").unwrap();
        assert!(zrem < xadd);
        assert!(MOVE_MEMBER_SCRIPT[..xadd].contains("return false"));
    }

    #[test]
    fn unacked_deliveries_count_as_attempts() {
        assert_eq!(delivery_attempt(0, 0), 1);
        assert_eq!(delivery_attempt(2, 0), 3);
        // Entry delivered twice without an ack after one earlier failed attempt.
        assert_eq!(delivery_attempt(1, 2), 4);
        assert_eq!(delivery_attempt(u32::MAX, 5), u32::MAX);

        let policy = RetryPolicy::default();
        // A fresh job whose consumer died on each of its three deliveries.
        assert!(delivery_attempt(0, 3) > policy.max_attempts);
        assert!(delivery_attempt(0, 2) <= policy.max_attempts);
    }

    #[test]
    fn reclaimed_entry_delivery_carries_the_counted_attempt() {
        let job_id = JobId::new();
        let job = sample_job();
        let raw = entry(
            "7-0",
            &[
                ("job_id", job_id.to_string()),
                ("attempts", "1".to_string()),
                ("payload", serde_json::to_string(&job).unwrap()),
            ],
        );

        let fresh = to_delivery(&raw, 0).unwrap();
        assert_eq!(fresh.attempt, 2);
        assert_eq!(fresh.job_id, job_id);
        assert_eq!(fresh.job, job);
        assert_eq!(fresh.receipt, "7-0");

        let reclaimed = to_delivery(&raw, 2).unwrap();
        assert_eq!(reclaimed.attempt, 4);
        assert!(reclaimed.attempt > broker_config().retry.max_attempts);
    }

    #[test]
    fn entry_without_payload_is_undecodable() {
        let raw = entry("8-0", &[("job_id", JobId::new().to_string())]);
        assert!(matches!(to_delivery(&raw, 0), Err(BrokerError::Serialization(_))));
    }

    #[test]
    fn failed_listing_skips_entries_without_a_job_id() {
        let job = sample_job();
        let job_id = JobId::new();
        let failed = entry(
            "1-0",
            &failed_fields(job_id, 3, "index unavailable", &job).unwrap(),
        );
        let quarantined = entry(
            "2-0",
            &[
                ("entry_id", "0-1".to_string()),
                ("error", "missing job_id".to_string()),
                ("payload", serde_json::to_string(&job).unwrap()),
            ],
        );

        let listed = failed_job_from_entry(&failed).unwrap();
        assert_eq!(listed.job_id, job_id);
        assert_eq!(listed.attempts, 3);
        assert_eq!(listed.error, "index unavailable");
        assert!(failed_job_from_entry(&quarantined).is_none());
    }

    #[test]
    fn blocking_connections_are_reused_and_capped() {
        let pool = IdleConnections::new();
        assert_eq!(pool.take(), None::<u32>);

        pool.put_back(1);
        assert_eq!(pool.take(), Some(1));
        assert_eq!(pool.take(), None);

        for conn in 0..(MAX_IDLE_BLOCKING as u32 + 4) {
            pool.put_back(conn);
        }
        assert_eq!(pool.idle_count(), MAX_IDLE_BLOCKING);
    }

    #[test]
    fn io_failures_map_to_connection_errors() {
        let io = redis::RedisError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert!(map_redis_error("XADD", io).is_transient());
    }
}
