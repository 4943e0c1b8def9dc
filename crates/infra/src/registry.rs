//! Queue registry: the one place broker channels and their consumers are wired.
//!
//! Built once at startup and passed explicitly to the dispatcher and consumer
//! roles. A channel may have at most one consumer pool per process.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use outboxsync_events::{Broker, JobHandler};

use crate::jobs::{ConsumerConfig, ConsumerPool, ConsumerPoolHandle};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("channel already registered: {0}")]
    DuplicateChannel(String),

    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    #[error("channel {0} already has a consumer")]
    DuplicateConsumer(String),

    #[error("registry lock poisoned")]
    Poisoned,
}

#[derive(Default)]
pub struct QueueRegistry {
    channels: HashMap<String, Arc<dyn Broker>>,
    consumers: Mutex<HashSet<String>>,
}

impl core::fmt::Debug for QueueRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("QueueRegistry")
            .field("channels", &self.channels.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a broker under its own channel name.
    pub fn register_channel(&mut self, broker: Arc<dyn Broker>) -> Result<(), RegistryError> {
        let name = broker.channel().to_string();
        if self.channels.contains_key(&name) {
            return Err(RegistryError::DuplicateChannel(name));
        }
        info!(channel = %name, "channel registered");
        self.channels.insert(name, broker);
        Ok(())
    }

    pub fn channel(&self, name: &str) -> Result<Arc<dyn Broker>, RegistryError> {
        self.channels
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownChannel(name.to_string()))
    }

    pub fn channels(&self) -> impl Iterator<Item = &str> {
        self.channels.keys().map(String::as_str)
    }

    /// Start the consumer pool for `channel`. Fails if one was already started.
    pub fn start_consumers(
        &self,
        channel: &str,
        handler: Arc<dyn JobHandler>,
        config: ConsumerConfig,
        shutdown: CancellationToken,
    ) -> Result<ConsumerPoolHandle, RegistryError> {
        let broker = self.channel(channel)?;
        {
            let mut consumers = self.consumers.lock().map_err(|_| RegistryError::Poisoned)?;
            if !consumers.insert(channel.to_string()) {
                return Err(RegistryError::DuplicateConsumer(channel.to_string()));
            }
        }
        Ok(ConsumerPool::spawn(broker, handler, config, shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{InMemoryBroker, RetryPolicy};
    use async_trait::async_trait;
    use outboxsync_events::{HandlerError, OUTBOX_EVENTS, OutboxJob};

    struct Noop;

    #[async_trait]
    impl JobHandler for Noop {
        async fn handle(&self, _job: &OutboxJob) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    fn registry() -> QueueRegistry {
        let mut registry = QueueRegistry::new();
        registry
            .register_channel(InMemoryBroker::arc(OUTBOX_EVENTS, RetryPolicy::default()))
            .unwrap();
        registry
    }

    #[test]
    fn duplicate_and_unknown_channels_are_rejected() {
        let mut registry = registry();
        assert_eq!(
            registry.register_channel(InMemoryBroker::arc(OUTBOX_EVENTS, RetryPolicy::default())),
            Err(RegistryError::DuplicateChannel(OUTBOX_EVENTS.into()))
        );
        assert!(matches!(
            registry.channel("nope"),
            Err(RegistryError::UnknownChannel(_))
        ));
        assert_eq!(registry.channels().collect::<Vec<_>>(), vec![OUTBOX_EVENTS]);
    }

    #[tokio::test]
    async fn second_consumer_for_a_channel_is_rejected() {
        let registry = registry();
        let token = CancellationToken::new();

        let handle = registry
            .start_consumers(OUTBOX_EVENTS, Arc::new(Noop), ConsumerConfig::default(), token.clone())
            .unwrap();
        let second = registry.start_consumers(
            OUTBOX_EVENTS,
            Arc::new(Noop),
            ConsumerConfig::default(),
            token.clone(),
        );
        assert!(matches!(second, Err(RegistryError::DuplicateConsumer(_))));

        handle.shutdown().await;
    }
}
