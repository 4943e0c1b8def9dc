//! Projection applier: turns outbox jobs into search index writes.
//!
//! The job only says *which* program changed. Current state is always re-read
//! from the primary store, so applying a job twice, or applying several jobs
//! for the same program in any order, converges to what the store holds when
//! the last one runs.

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use outboxsync_core::AggregateId;
use outboxsync_events::{HandlerError, JobHandler, LedgerEvent, OutboxJob};
use outboxsync_programs::{AGGREGATE_TYPE, ProgramDocument};

use crate::db::StoreError;
use crate::programs::ProgramReader;
use crate::search::{DeleteOutcome, SearchError, SearchIndex};

/// What applying one job did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Document written from current state.
    Indexed(AggregateId),
    /// The program no longer exists; a later DELETED job removes the document.
    SkippedMissing(AggregateId),
    Removed(AggregateId),
    /// DELETED for a document that was never indexed or is already gone.
    AlreadyAbsent(AggregateId),
    /// Event for another aggregate or an unknown tag; acknowledged as is.
    Ignored(String),
}

impl From<StoreError> for HandlerError {
    fn from(err: StoreError) -> Self {
        HandlerError::transient(format!("primary store: {err}"))
    }
}

impl From<SearchError> for HandlerError {
    fn from(err: SearchError) -> Self {
        match err {
            SearchError::Serialization(_) => HandlerError::permanent(err.to_string()),
            _ => HandlerError::transient(format!("search index: {err}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProgramProjector<R, I> {
    reader: R,
    index: I,
}

impl<R, I> ProgramProjector<R, I>
where
    R: ProgramReader,
    I: SearchIndex,
{
    pub fn new(reader: R, index: I) -> Self {
        Self { reader, index }
    }

    #[instrument(
        skip(self, job),
        fields(ledger_entry_id = %job.ledger_entry_id, event_type = %job.event_type),
        err
    )]
    pub async fn apply(&self, job: &OutboxJob) -> Result<ApplyOutcome, HandlerError> {
        let event = job
            .decode()
            .map_err(|e| HandlerError::permanent(e.to_string()))?;

        match event {
            LedgerEvent::Created { aggregate, id } | LedgerEvent::Updated { aggregate, id }
                if aggregate == AGGREGATE_TYPE =>
            {
                self.upsert(id).await
            }
            LedgerEvent::Deleted { aggregate, id } if aggregate == AGGREGATE_TYPE => {
                self.remove(id).await
            }
            LedgerEvent::Unrecognized { event_type, .. } => {
                warn!(%event_type, "unknown event type, acknowledging without changes");
                Ok(ApplyOutcome::Ignored(event_type))
            }
            other => {
                let tag = job.event_type.to_string();
                debug!(event = ?other, "event for another aggregate, ignoring");
                Ok(ApplyOutcome::Ignored(tag))
            }
        }
    }

    async fn upsert(&self, id: AggregateId) -> Result<ApplyOutcome, HandlerError> {
        let Some(program) = self.reader.load_by_id(id).await? else {
            warn!(program_id = %id, "program not found, skipping index update");
            return Ok(ApplyOutcome::SkippedMissing(id));
        };

        self.index.put(id, &ProgramDocument::from(&program)).await?;
        info!(program_id = %id, "program indexed");
        Ok(ApplyOutcome::Indexed(id))
    }

    async fn remove(&self, id: AggregateId) -> Result<ApplyOutcome, HandlerError> {
        match self.index.delete(id).await? {
            DeleteOutcome::Deleted => {
                info!(program_id = %id, "program removed from index");
                Ok(ApplyOutcome::Removed(id))
            }
            DeleteOutcome::NotFound => {
                debug!(program_id = %id, "program already absent from index");
                Ok(ApplyOutcome::AlreadyAbsent(id))
            }
        }
    }
}

#[async_trait]
impl<R, I> JobHandler for ProgramProjector<R, I>
where
    R: ProgramReader,
    I: SearchIndex,
{
    async fn handle(&self, job: &OutboxJob) -> Result<(), HandlerError> {
        self.apply(job).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::InMemoryDatabase;
    use crate::programs::ProgramService;
    use crate::search::InMemorySearchIndex;
    use chrono::{TimeZone, Utc};
    use outboxsync_core::LedgerEntryId;
    use outboxsync_events::{EventKind, EventType};
    use outboxsync_programs::{NewProgram, program_event};
    use serde_json::json;
    use std::sync::Arc;

    fn new_program(title: &str) -> NewProgram {
        NewProgram {
            title: title.to_string(),
            description: "desc".to_string(),
            publish_date: Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
            program_type: "podcast".to_string(),
            language: "ar".to_string(),
            tags: vec!["culture".to_string()],
        }
    }

    fn job(kind: EventKind, id: AggregateId) -> OutboxJob {
        let (event_type, payload) = program_event(kind, id);
        OutboxJob::new(LedgerEntryId::new(), event_type, payload)
    }

    fn setup() -> (
        InMemoryDatabase,
        Arc<InMemorySearchIndex>,
        ProgramProjector<InMemoryDatabase, Arc<InMemorySearchIndex>>,
    ) {
        let db = InMemoryDatabase::new();
        let index = Arc::new(InMemorySearchIndex::new());
        let projector = ProgramProjector::new(db.clone(), index.clone());
        (db, index, projector)
    }

    #[tokio::test]
    async fn upsert_writes_current_state_and_is_idempotent() {
        let (db, index, projector) = setup();
        let program = ProgramService::new(db.clone())
            .create(new_program("Hello"))
            .await
            .unwrap();

        let created = job(EventKind::Created, program.id);
        assert_eq!(projector.apply(&created).await.unwrap(), ApplyOutcome::Indexed(program.id));
        let first = index.get(program.id).unwrap();
        projector.apply(&created).await.unwrap();

        assert_eq!(index.get(program.id).unwrap(), first);
        assert_eq!(first, Some(ProgramDocument::from(&program)));
        assert_eq!(index.len().unwrap(), 1);
    }

    #[tokio::test]
    async fn missing_program_is_a_benign_skip() {
        let (_db, index, projector) = setup();
        let id = AggregateId::new(42);
        assert_eq!(
            projector.apply(&job(EventKind::Updated, id)).await.unwrap(),
            ApplyOutcome::SkippedMissing(id)
        );
        assert!(index.is_empty().unwrap());
    }

    #[tokio::test]
    async fn delete_of_absent_document_succeeds() {
        let (_db, _index, projector) = setup();
        let id = AggregateId::new(9);
        assert_eq!(
            projector.apply(&job(EventKind::Deleted, id)).await.unwrap(),
            ApplyOutcome::AlreadyAbsent(id)
        );
    }

    #[tokio::test]
    async fn unknown_and_foreign_events_are_acknowledged() {
        let (_db, _index, projector) = setup();

        let unknown = OutboxJob::new(LedgerEntryId::new(), EventType::from("PROGRAM_ARCHIVED"), json!({ "id": 1 }));
        assert_eq!(
            projector.apply(&unknown).await.unwrap(),
            ApplyOutcome::Ignored("PROGRAM_ARCHIVED".into())
        );

        let foreign = OutboxJob::new(LedgerEntryId::new(), EventType::created("EPISODE"), json!({ "id": 1 }));
        assert!(matches!(projector.apply(&foreign).await.unwrap(), ApplyOutcome::Ignored(_)));
    }

    #[tokio::test]
    async fn malformed_payload_is_permanent() {
        let (_db, _index, projector) = setup();
        let bad = OutboxJob::new(LedgerEntryId::new(), EventType::created("PROGRAM"), json!({ "title": "no id" }));
        let err = projector.apply(&bad).await.unwrap_err();
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn index_outage_is_transient() {
        let (db, index, projector) = setup();
        let program = ProgramService::new(db.clone())
            .create(new_program("Hello"))
            .await
            .unwrap();
        index.set_available(false);

        let err = projector.apply(&job(EventKind::Updated, program.id)).await.unwrap_err();
        assert!(!err.is_permanent());
    }
}
