//! Outbox ledger: append-only record of side effects still owed to the broker.
//!
//! Rows are appended through [`crate::recorder::EventRecorder`] inside the
//! writer's transaction and claimed in batches by the dispatcher. The only
//! mutation after insert is `processed` flipping to `true`.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryClaim;
pub use postgres::PgClaim;
pub use r#trait::{ClaimedBatch, Ledger, LedgerEntry, LedgerError};
