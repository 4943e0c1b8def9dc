//! Outbox event vocabulary and delivery contracts (mechanics only).
//!
//! - `event`: event type tags (`PROGRAM_CREATED`, ...), forward compatible
//! - `payload`: the payload carried by ledger rows, decoded into a tagged union
//! - `job`: the message shape handed to the broker
//! - `broker`: at-least-once channel and handler contracts
//!
//! Storage and transport live in `outboxsync-infra`.

pub mod broker;
pub mod event;
pub mod job;
pub mod payload;

pub use broker::{
    Broker, BrokerError, Delivery, HandlerError, JobHandler, NackOutcome, OUTBOX_EVENTS,
};
pub use event::{EventKind, EventType};
pub use job::OutboxJob;
pub use payload::{EventPayload, LedgerEvent, PayloadError};
