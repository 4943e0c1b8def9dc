use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use outboxsync_core::LedgerEntryId;
use outboxsync_events::{EventType, OutboxJob};

use crate::db::StoreError;

/// One row of the outbox ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub id: LedgerEntryId,
    pub event_type: EventType,
    pub payload: JsonValue,
    pub created_at: DateTime<Utc>,
    pub processed: bool,
}

impl LedgerEntry {
    /// A fresh, unprocessed entry.
    pub fn pending(event_type: EventType, payload: JsonValue) -> Self {
        Self {
            id: LedgerEntryId::new(),
            event_type,
            payload,
            created_at: Utc::now(),
            processed: false,
        }
    }

    pub fn to_job(&self) -> OutboxJob {
        OutboxJob::new(self.id, self.event_type.clone(), self.payload.clone())
    }
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("ledger entry {0} is not part of this claim")]
    NotClaimed(LedgerEntryId),

    #[error("invalid ledger payload: {0}")]
    InvalidPayload(String),
}

impl LedgerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Store(e) if e.is_transient())
    }
}

/// A set of rows exclusively claimed by one dispatcher tick.
///
/// Rows stay claimed until [`ClaimedBatch::commit`] or [`ClaimedBatch::rollback`];
/// dropping the batch rolls back.
#[async_trait]
pub trait ClaimedBatch: Send {
    fn entries(&self) -> &[LedgerEntry];

    /// Flip `processed` for a claimed row. Takes effect on commit.
    async fn mark_processed(&mut self, id: LedgerEntryId) -> Result<(), LedgerError>;

    async fn commit(self) -> Result<(), LedgerError>;

    async fn rollback(self) -> Result<(), LedgerError>;
}

/// Read side of the ledger used by the dispatcher.
#[async_trait]
pub trait Ledger: Send + Sync {
    type Batch: ClaimedBatch;

    /// Claim up to `limit` of the oldest unprocessed rows.
    ///
    /// Rows already claimed by a concurrent caller are skipped, never waited on.
    async fn claim_batch(&self, limit: usize) -> Result<Self::Batch, LedgerError>;

    /// Number of rows not yet forwarded.
    async fn pending_count(&self) -> Result<u64, LedgerError>;

    async fn entry(&self, id: LedgerEntryId) -> Result<Option<LedgerEntry>, LedgerError>;
}

#[async_trait]
impl<L> Ledger for Arc<L>
where
    L: Ledger + ?Sized,
{
    type Batch = L::Batch;

    async fn claim_batch(&self, limit: usize) -> Result<Self::Batch, LedgerError> {
        (**self).claim_batch(limit).await
    }

    async fn pending_count(&self) -> Result<u64, LedgerError> {
        (**self).pending_count().await
    }

    async fn entry(&self, id: LedgerEntryId) -> Result<Option<LedgerEntry>, LedgerError> {
        (**self).entry(id).await
    }
}
