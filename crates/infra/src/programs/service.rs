use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, instrument, warn};

use outboxsync_core::{AggregateId, DomainError, LedgerEntryId};
use outboxsync_events::EventKind;
use outboxsync_programs::{NewProgram, Program, ProgramChanges, program_event};

use super::ProgramWriter;
use crate::db::{Database, StoreError, Transaction};
use crate::ledger::LedgerError;
use crate::recorder::EventRecorder;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl ServiceError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ServiceError::Domain(e) if e.is_not_found())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkItemError {
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<AggregateId>,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkCreateReport {
    pub created: Vec<Program>,
    pub errors: Vec<BulkItemError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkDeleteReport {
    pub deleted: usize,
    pub errors: Vec<BulkItemError>,
}

/// Program write path.
///
/// Each mutation and the ledger row describing it commit in one transaction.
/// Bulk operations run one transaction per item and report per-item failures.
#[derive(Debug, Clone)]
pub struct ProgramService<D> {
    db: D,
}

impl<D> ProgramService<D>
where
    D: Database,
    D::Tx: ProgramWriter + EventRecorder,
{
    pub fn new(db: D) -> Self {
        Self { db }
    }

    #[instrument(skip(self, cmd), err)]
    pub async fn create(&self, cmd: NewProgram) -> Result<Program, ServiceError> {
        let cmd = cmd.validate()?;

        let mut tx = self.db.begin().await?;
        let program = tx.insert_program(cmd, Utc::now()).await?;
        let entry_id = record(&mut tx, EventKind::Created, program.id).await?;
        tx.commit().await?;

        info!(program_id = %program.id, ledger_entry_id = %entry_id, "program created");
        Ok(program)
    }

    #[instrument(skip(self, changes), fields(program_id = %id), err)]
    pub async fn update(
        &self,
        id: AggregateId,
        changes: ProgramChanges,
    ) -> Result<Program, ServiceError> {
        let changes = changes.validate()?;

        let mut tx = self.db.begin().await?;
        let Some(mut program) = tx.find_program_for_update(id).await? else {
            tx.rollback().await?;
            return Err(DomainError::not_found(format!("program {id}")).into());
        };

        program.apply(changes, Utc::now());
        tx.save_program(&program).await?;
        let entry_id = record(&mut tx, EventKind::Updated, id).await?;
        tx.commit().await?;

        info!(ledger_entry_id = %entry_id, "program updated");
        Ok(program)
    }

    #[instrument(skip(self), fields(program_id = %id), err)]
    pub async fn delete(&self, id: AggregateId) -> Result<(), ServiceError> {
        let mut tx = self.db.begin().await?;
        if tx.find_program_for_update(id).await?.is_none() {
            tx.rollback().await?;
            return Err(DomainError::not_found(format!("program {id}")).into());
        }

        tx.delete_program(id).await?;
        let entry_id = record(&mut tx, EventKind::Deleted, id).await?;
        tx.commit().await?;

        info!(ledger_entry_id = %entry_id, "program deleted");
        Ok(())
    }

    pub async fn bulk_create(&self, cmds: Vec<NewProgram>) -> BulkCreateReport {
        let mut report = BulkCreateReport {
            created: Vec::with_capacity(cmds.len()),
            errors: Vec::new(),
        };

        for (index, cmd) in cmds.into_iter().enumerate() {
            match self.create(cmd).await {
                Ok(program) => report.created.push(program),
                Err(e) => {
                    warn!(index, error = %e, "bulk create item failed");
                    report.errors.push(BulkItemError {
                        index,
                        id: None,
                        error: e.to_string(),
                    });
                }
            }
        }
        report
    }

    pub async fn bulk_delete(&self, ids: &[AggregateId]) -> BulkDeleteReport {
        let mut report = BulkDeleteReport {
            deleted: 0,
            errors: Vec::new(),
        };

        for (index, id) in ids.iter().copied().enumerate() {
            match self.delete(id).await {
                Ok(()) => report.deleted += 1,
                Err(e) => {
                    warn!(index, program_id = %id, error = %e, "bulk delete item failed");
                    report.errors.push(BulkItemError {
                        index,
                        id: Some(id),
                        error: e.to_string(),
                    });
                }
            }
        }
        report
    }
}

async fn record<T: EventRecorder>(
    tx: &mut T,
    kind: EventKind,
    id: AggregateId,
) -> Result<LedgerEntryId, LedgerError> {
    let (event_type, payload) = program_event(kind, id);
    tx.record_event(event_type, payload).await
}
