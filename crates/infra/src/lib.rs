//! Infrastructure layer: primary store, outbox ledger, brokers, search index,
//! and the dispatcher and consumer loops connecting them.

pub mod config;
pub mod consumer;
pub mod db;
pub mod dispatcher;
pub mod jobs;
pub mod ledger;
pub mod programs;
pub mod recorder;
pub mod registry;
pub mod scheduler;
pub mod search;
