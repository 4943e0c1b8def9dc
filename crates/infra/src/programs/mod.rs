//! Primary-store access for programs: the read path the consumer re-fetches
//! through, and the transactional write path that records ledger events.

pub mod service;

pub use service::{BulkCreateReport, BulkDeleteReport, ProgramService, ServiceError};

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use outboxsync_core::AggregateId;
use outboxsync_programs::{NewProgram, Program};

use crate::db::StoreError;

/// Committed-state reads.
#[async_trait]
pub trait ProgramReader: Send + Sync {
    async fn load_by_id(&self, id: AggregateId) -> Result<Option<Program>, StoreError>;
}

#[async_trait]
impl<R> ProgramReader for Arc<R>
where
    R: ProgramReader + ?Sized,
{
    async fn load_by_id(&self, id: AggregateId) -> Result<Option<Program>, StoreError> {
        (**self).load_by_id(id).await
    }
}

/// Writes performed inside an open transaction.
#[async_trait]
pub trait ProgramWriter: Send {
    /// Insert and return the stored row (with its assigned id).
    async fn insert_program(
        &mut self,
        program: NewProgram,
        now: DateTime<Utc>,
    ) -> Result<Program, StoreError>;

    /// Load a row and hold it until the transaction ends.
    async fn find_program_for_update(
        &mut self,
        id: AggregateId,
    ) -> Result<Option<Program>, StoreError>;

    async fn save_program(&mut self, program: &Program) -> Result<(), StoreError>;

    /// Returns whether a row was deleted.
    async fn delete_program(&mut self, id: AggregateId) -> Result<bool, StoreError>;
}
