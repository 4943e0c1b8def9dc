//! Postgres-backed primary store.
//!
//! Tables are created by [`PgDatabase::migrate`] from the embedded schema in
//! `migrations/0001_init.sql`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, Row};
use tracing::{debug, instrument};

use outboxsync_core::{AggregateId, LedgerEntryId};
use outboxsync_events::EventType;
use outboxsync_programs::{NewProgram, Program};

use super::{Database, StoreError, Transaction, map_sqlx_error};
use crate::ledger::{LedgerEntry, LedgerError};
use crate::programs::{ProgramReader, ProgramWriter};
use crate::recorder::{EventRecorder, validate_payload};

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

const PROGRAM_COLUMNS: &str =
    "id, title, description, publish_date, type, language, tags, created_at, updated_at";

/// Postgres primary store. Cheap to clone (the pool is reference counted).
#[derive(Debug, Clone)]
pub struct PgDatabase {
    pool: PgPool,
}

impl PgDatabase {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded schema. Idempotent.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        debug!("schema applied");
        Ok(())
    }
}

#[async_trait]
impl Database for PgDatabase {
    type Tx = PgTx;

    async fn begin(&self) -> Result<PgTx, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(PgTx { tx })
    }
}

#[async_trait]
impl ProgramReader for PgDatabase {
    #[instrument(skip(self), fields(program_id = %id), err)]
    async fn load_by_id(&self, id: AggregateId) -> Result<Option<Program>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {PROGRAM_COLUMNS} FROM programs WHERE id = $1"
        ))
        .bind(id.get())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_program", e))?;

        row.map(|r| decode_program(&r)).transpose()
    }
}

/// Open Postgres transaction. Dropped without commit means rolled back.
pub struct PgTx {
    tx: sqlx::Transaction<'static, Postgres>,
}

#[async_trait]
impl Transaction for PgTx {
    async fn commit(self) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

#[async_trait]
impl ProgramWriter for PgTx {
    #[instrument(skip(self, program), err)]
    async fn insert_program(
        &mut self,
        program: NewProgram,
        now: DateTime<Utc>,
    ) -> Result<Program, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO programs (title, description, publish_date, type, language, tags, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
            RETURNING {PROGRAM_COLUMNS}
            "#
        ))
        .bind(&program.title)
        .bind(&program.description)
        .bind(program.publish_date)
        .bind(&program.program_type)
        .bind(&program.language)
        .bind(&program.tags)
        .bind(now)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_program", e))?;

        decode_program(&row)
    }

    #[instrument(skip(self), fields(program_id = %id), err)]
    async fn find_program_for_update(
        &mut self,
        id: AggregateId,
    ) -> Result<Option<Program>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {PROGRAM_COLUMNS} FROM programs WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.get())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("lock_program", e))?;

        row.map(|r| decode_program(&r)).transpose()
    }

    #[instrument(skip(self, program), fields(program_id = %program.id), err)]
    async fn save_program(&mut self, program: &Program) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE programs
            SET title = $2, description = $3, publish_date = $4, type = $5,
                language = $6, tags = $7, updated_at = $8
            WHERE id = $1
            "#,
        )
        .bind(program.id.get())
        .bind(&program.title)
        .bind(&program.description)
        .bind(program.publish_date)
        .bind(&program.program_type)
        .bind(&program.language)
        .bind(&program.tags)
        .bind(program.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("save_program", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Database(format!(
                "save_program: program {} does not exist",
                program.id
            )));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(program_id = %id), err)]
    async fn delete_program(&mut self, id: AggregateId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM programs WHERE id = $1")
            .bind(id.get())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("delete_program", e))?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl EventRecorder for PgTx {
    #[instrument(skip(self, event_type, payload), fields(event_type = %event_type), err)]
    async fn record_event(
        &mut self,
        event_type: EventType,
        payload: JsonValue,
    ) -> Result<LedgerEntryId, LedgerError> {
        validate_payload(&event_type, &payload)?;
        let entry = LedgerEntry::pending(event_type, payload);

        insert_ledger_entry(&mut self.tx, &entry).await?;
        Ok(entry.id)
    }
}

async fn insert_ledger_entry(
    tx: &mut sqlx::Transaction<'static, Postgres>,
    entry: &LedgerEntry,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO outbox (id, event_type, payload, created_at, processed)
        VALUES ($1, $2, $3, $4, FALSE)
        "#,
    )
    .bind(entry.id.as_uuid())
    .bind(entry.event_type.to_string())
    .bind(&entry.payload)
    .bind(entry.created_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("insert_ledger_entry", e))?;
    Ok(())
}

fn decode_program(row: &PgRow) -> Result<Program, StoreError> {
    ProgramRow::from_row(row)
        .map(Into::into)
        .map_err(|e| StoreError::Decode(format!("program row: {e}")))
}

#[derive(Debug)]
struct ProgramRow {
    id: i64,
    title: String,
    description: String,
    publish_date: DateTime<Utc>,
    program_type: String,
    language: String,
    tags: Vec<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for ProgramRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(ProgramRow {
            id: row.try_get("id")?,
            title: row.try_get("title")?,
            description: row.try_get("description")?,
            publish_date: row.try_get("publish_date")?,
            program_type: row.try_get("type")?,
            language: row.try_get("language")?,
            tags: row.try_get("tags")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl From<ProgramRow> for Program {
    fn from(row: ProgramRow) -> Self {
        Program {
            id: AggregateId::new(row.id),
            title: row.title,
            description: row.description,
            publish_date: row.publish_date,
            program_type: row.program_type,
            language: row.language,
            tags: row.tags,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

pub(crate) struct LedgerRow {
    id: uuid::Uuid,
    event_type: String,
    payload: JsonValue,
    created_at: DateTime<Utc>,
    processed: bool,
}

impl<'r> FromRow<'r, PgRow> for LedgerRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(LedgerRow {
            id: row.try_get("id")?,
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            created_at: row.try_get("created_at")?,
            processed: row.try_get("processed")?,
        })
    }
}

impl From<LedgerRow> for LedgerEntry {
    fn from(row: LedgerRow) -> Self {
        LedgerEntry {
            id: LedgerEntryId::from_uuid(row.id),
            event_type: EventType::from(row.event_type),
            payload: row.payload,
            created_at: row.created_at,
            processed: row.processed,
        }
    }
}

pub(crate) fn decode_ledger_row(row: &PgRow) -> Result<LedgerEntry, StoreError> {
    LedgerRow::from_row(row)
        .map(Into::into)
        .map_err(|e| StoreError::Decode(format!("outbox row: {e}")))
}
