//! Postgres ledger claims.
//!
//! A claim is an open transaction holding `FOR UPDATE SKIP LOCKED` row locks on
//! the selected outbox rows. Concurrent dispatchers skip those rows instead of
//! waiting, so each row is forwarded by at most one claim at a time. Locks are
//! released when the claim commits or rolls back.

use async_trait::async_trait;
use sqlx::{Postgres, Row};
use tracing::{debug, instrument};

use outboxsync_core::LedgerEntryId;

use super::r#trait::{ClaimedBatch, Ledger, LedgerEntry, LedgerError};
use crate::db::postgres::decode_ledger_row;
use crate::db::{PgDatabase, map_sqlx_error};

#[async_trait]
impl Ledger for PgDatabase {
    type Batch = PgClaim;

    #[instrument(skip(self), err)]
    async fn claim_batch(&self, limit: usize) -> Result<PgClaim, LedgerError> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_claim", e))?;

        let rows = sqlx::query(
            r#"
            SELECT id, event_type, payload, created_at, processed
            FROM outbox
            WHERE processed = FALSE
            ORDER BY created_at ASC, id ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("claim_batch", e))?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in &rows {
            entries.push(decode_ledger_row(row)?);
        }

        debug!(claimed = entries.len(), "claimed outbox rows");
        Ok(PgClaim { tx, entries })
    }

    async fn pending_count(&self) -> Result<u64, LedgerError> {
        let row = sqlx::query("SELECT COUNT(*) AS pending FROM outbox WHERE processed = FALSE")
            .fetch_one(self.pool())
            .await
            .map_err(|e| map_sqlx_error("pending_count", e))?;
        let pending: i64 = row
            .try_get("pending")
            .map_err(|e| map_sqlx_error("pending_count", e))?;
        Ok(pending.max(0) as u64)
    }

    async fn entry(&self, id: LedgerEntryId) -> Result<Option<LedgerEntry>, LedgerError> {
        let row = sqlx::query(
            "SELECT id, event_type, payload, created_at, processed FROM outbox WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(self.pool())
        .await
        .map_err(|e| map_sqlx_error("load_ledger_entry", e))?;

        Ok(row.map(|r| decode_ledger_row(&r)).transpose()?)
    }
}

/// Rows claimed from the Postgres outbox.
pub struct PgClaim {
    tx: sqlx::Transaction<'static, Postgres>,
    entries: Vec<LedgerEntry>,
}

#[async_trait]
impl ClaimedBatch for PgClaim {
    fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    async fn mark_processed(&mut self, id: LedgerEntryId) -> Result<(), LedgerError> {
        if !self.entries.iter().any(|e| e.id == id) {
            return Err(LedgerError::NotClaimed(id));
        }
        sqlx::query("UPDATE outbox SET processed = TRUE WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("mark_processed", e))?;
        Ok(())
    }

    async fn commit(self) -> Result<(), LedgerError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_claim", e))?;
        Ok(())
    }

    async fn rollback(self) -> Result<(), LedgerError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback_claim", e))?;
        Ok(())
    }
}
