//! `outboxsync-daemon`: runs the outbox dispatcher and/or the projection
//! consumer against Postgres, the broker and Elasticsearch.

pub mod app;
pub mod signal;
