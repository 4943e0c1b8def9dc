//! Process wiring: stores, broker, registry and the loops each role runs.

use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use outboxsync_events::Broker;
use outboxsync_infra::config::Settings;
use outboxsync_infra::consumer::ProgramProjector;
use outboxsync_infra::db::PgDatabase;
use outboxsync_infra::dispatcher::OutboxDispatcher;
use outboxsync_infra::registry::QueueRegistry;
use outboxsync_infra::search::{ElasticsearchIndex, SearchIndex};

const MAX_DB_CONNECTIONS: u32 = 10;

#[cfg(feature = "redis")]
async fn build_broker(settings: &Settings) -> anyhow::Result<Arc<dyn Broker>> {
    use outboxsync_infra::jobs::{RedisStreamsBroker, RedisStreamsConfig};

    let config = RedisStreamsConfig::new(settings.redis.connection_url(), &settings.outbox.queue)
        .with_retry(settings.outbox.retry_policy());
    let broker = RedisStreamsBroker::connect(config)
        .await
        .context("failed to connect to Redis")?;
    info!(broker = ?broker, "redis streams broker ready");
    let broker: Arc<dyn Broker> = Arc::new(broker);
    Ok(broker)
}

#[cfg(not(feature = "redis"))]
async fn build_broker(settings: &Settings) -> anyhow::Result<Arc<dyn Broker>> {
    use outboxsync_infra::jobs::InMemoryBroker;

    warn!("built without redis: using the in-process broker, queued jobs do not survive a restart");
    let broker: Arc<dyn Broker> =
        InMemoryBroker::arc(&settings.outbox.queue, settings.outbox.retry_policy());
    Ok(broker)
}

/// Run the configured roles until `shutdown` is cancelled, then wait for
/// in-flight ticks and jobs to finish.
pub async fn run(settings: Settings, shutdown: CancellationToken) -> anyhow::Result<()> {
    for warning in settings.warnings() {
        warn!(%warning, "configuration warning");
    }
    info!(
        environment = ?settings.environment,
        role = ?settings.role,
        queue = %settings.outbox.queue,
        "starting outboxsync"
    );

    let pool = PgPoolOptions::new()
        .max_connections(MAX_DB_CONNECTIONS)
        .connect(&settings.database.connection_url())
        .await
        .context("failed to connect to Postgres")?;
    let db = PgDatabase::new(pool);
    db.migrate().await.context("failed to apply schema")?;

    let mut registry = QueueRegistry::new();
    registry.register_channel(build_broker(&settings).await?)?;

    let consumers = if settings.role.runs_consumer() {
        let index = Arc::new(
            ElasticsearchIndex::new(settings.search.elasticsearch())
                .context("failed to build search client")?,
        );
        index
            .initialize_index()
            .await
            .context("failed to initialize search index")?;
        let projector = Arc::new(ProgramProjector::new(db.clone(), index));
        Some(registry.start_consumers(
            &settings.outbox.queue,
            projector,
            settings.outbox.consumer(),
            shutdown.clone(),
        )?)
    } else {
        None
    };

    let dispatcher = if settings.role.runs_dispatcher() {
        let dispatcher = Arc::new(OutboxDispatcher::new(
            db.clone(),
            registry.channel(&settings.outbox.queue)?,
            settings.outbox.dispatcher(),
        ));
        Some(dispatcher.spawn(shutdown.clone()))
    } else {
        None
    };

    shutdown.cancelled().await;

    if let Some(handle) = dispatcher {
        handle.join().await;
    }
    if let Some(handle) = consumers {
        let stats = handle.stats();
        handle.join().await;
        info!(
            processed = stats.jobs_processed,
            succeeded = stats.jobs_succeeded,
            retried = stats.jobs_retried,
            failed = stats.jobs_failed,
            "consumers stopped"
        );
    }
    db.pool().close().await;

    info!("outboxsync stopped");
    Ok(())
}
