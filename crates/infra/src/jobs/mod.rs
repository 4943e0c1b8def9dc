//! Broker implementations and the consumer pool.
//!
//! ## Components
//!
//! - `RetryPolicy`, `JobRecord`: attempt bookkeeping and exponential backoff
//! - `InMemoryBroker`: single-process broker for tests/dev
//! - `RedisStreamsBroker` (feature `redis`): durable broker on Redis Streams
//! - `ConsumerPool`: concurrent workers applying a `JobHandler` to deliveries
//!
//! Jobs that exhaust their attempts end in a terminal `Failed` state. They are
//! listed for inspection but never re-queued automatically.

pub mod pool;
pub mod queue;
#[cfg(feature = "redis")]
pub mod redis_streams;
pub mod types;

pub use pool::{ConsumerConfig, ConsumerPool, ConsumerPoolHandle, ConsumerStats};
pub use queue::InMemoryBroker;
#[cfg(feature = "redis")]
pub use redis_streams::{RedisStreamsBroker, RedisStreamsConfig};
pub use types::{BrokerStats, FailedJob, JobAttemptRecord, JobRecord, JobStatus, RetryPolicy};
