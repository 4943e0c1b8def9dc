use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use outboxsync_core::{AggregateId, LedgerEntryId};
use outboxsync_events::EventType;
use outboxsync_programs::{NewProgram, Program};

use super::{Database, StoreError, Transaction};
use crate::ledger::{LedgerEntry, LedgerError};
use crate::programs::{ProgramReader, ProgramWriter};
use crate::recorder::{EventRecorder, validate_payload};

/// Shared state behind [`InMemoryDatabase`].
#[derive(Debug)]
pub(crate) struct MemoryState {
    pub(crate) programs: BTreeMap<AggregateId, Program>,
    pub(crate) next_program_id: i64,
    pub(crate) ledger: BTreeMap<LedgerEntryId, LedgerEntry>,
    /// Ledger rows currently held by an open claim.
    pub(crate) claimed: HashSet<LedgerEntryId>,
    pub(crate) available: bool,
}

impl Default for MemoryState {
    fn default() -> Self {
        Self {
            programs: BTreeMap::new(),
            next_program_id: 1,
            ledger: BTreeMap::new(),
            claimed: HashSet::new(),
            available: true,
        }
    }
}

pub(crate) fn lock_state(
    state: &Mutex<MemoryState>,
) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
    let guard = state.lock().map_err(|_| StoreError::Poisoned)?;
    if !guard.available {
        return Err(StoreError::Unavailable("in-memory store is offline".to_string()));
    }
    Ok(guard)
}

/// In-memory primary store and ledger.
///
/// Intended for tests/dev. Transactions stage their writes and apply them on
/// commit, so an uncommitted or rolled-back transaction leaves no trace.
/// Program rows are not locked; concurrent writers to the same program resolve
/// last-commit-wins.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDatabase {
    pub(crate) state: Arc<Mutex<MemoryState>>,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every operation fails with `StoreError::Unavailable`
    /// until switched back on.
    pub fn set_available(&self, available: bool) {
        match self.state.lock() {
            Ok(mut state) => state.available = available,
            Err(poisoned) => poisoned.into_inner().available = available,
        }
    }

    /// Snapshot of every ledger row in creation order.
    pub fn ledger_entries(&self) -> Result<Vec<LedgerEntry>, StoreError> {
        let state = lock_state(&self.state)?;
        let mut rows: Vec<LedgerEntry> = state.ledger.values().cloned().collect();
        rows.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        Ok(rows)
    }

    pub fn programs(&self) -> Result<Vec<Program>, StoreError> {
        let state = lock_state(&self.state)?;
        Ok(state.programs.values().cloned().collect())
    }
}

#[async_trait]
impl Database for InMemoryDatabase {
    type Tx = InMemoryTx;

    async fn begin(&self) -> Result<InMemoryTx, StoreError> {
        // Fail fast like a connection error would.
        drop(lock_state(&self.state)?);
        Ok(InMemoryTx {
            state: self.state.clone(),
            programs: BTreeMap::new(),
            ledger: Vec::new(),
        })
    }
}

#[async_trait]
impl ProgramReader for InMemoryDatabase {
    async fn load_by_id(&self, id: AggregateId) -> Result<Option<Program>, StoreError> {
        let state = lock_state(&self.state)?;
        Ok(state.programs.get(&id).cloned())
    }
}

/// Transaction over [`InMemoryDatabase`].
#[derive(Debug)]
pub struct InMemoryTx {
    state: Arc<Mutex<MemoryState>>,
    /// Staged program writes; `None` marks a delete.
    programs: BTreeMap<AggregateId, Option<Program>>,
    ledger: Vec<LedgerEntry>,
}

impl InMemoryTx {
    fn visible(&self, id: AggregateId) -> Result<Option<Program>, StoreError> {
        if let Some(staged) = self.programs.get(&id) {
            return Ok(staged.clone());
        }
        let state = lock_state(&self.state)?;
        Ok(state.programs.get(&id).cloned())
    }
}

#[async_trait]
impl Transaction for InMemoryTx {
    async fn commit(self) -> Result<(), StoreError> {
        let mut state = lock_state(&self.state)?;
        for (id, staged) in self.programs {
            match staged {
                Some(program) => {
                    state.programs.insert(id, program);
                }
                None => {
                    state.programs.remove(&id);
                }
            }
        }
        for entry in self.ledger {
            state.ledger.insert(entry.id, entry);
        }
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl ProgramWriter for InMemoryTx {
    async fn insert_program(
        &mut self,
        program: NewProgram,
        now: DateTime<Utc>,
    ) -> Result<Program, StoreError> {
        // Ids are consumed even if the transaction rolls back, like a serial column.
        let id = {
            let mut state = lock_state(&self.state)?;
            let id = state.next_program_id;
            state.next_program_id += 1;
            AggregateId::new(id)
        };
        let program = Program::from_new(id, program, now);
        self.programs.insert(id, Some(program.clone()));
        Ok(program)
    }

    async fn find_program_for_update(
        &mut self,
        id: AggregateId,
    ) -> Result<Option<Program>, StoreError> {
        self.visible(id)
    }

    async fn save_program(&mut self, program: &Program) -> Result<(), StoreError> {
        if self.visible(program.id)?.is_none() {
            return Err(StoreError::Database(format!(
                "save_program: program {} does not exist",
                program.id
            )));
        }
        self.programs.insert(program.id, Some(program.clone()));
        Ok(())
    }

    async fn delete_program(&mut self, id: AggregateId) -> Result<bool, StoreError> {
        let existed = self.visible(id)?.is_some();
        if existed {
            self.programs.insert(id, None);
        }
        Ok(existed)
    }
}

#[async_trait]
impl EventRecorder for InMemoryTx {
    async fn record_event(
        &mut self,
        event_type: EventType,
        payload: JsonValue,
    ) -> Result<LedgerEntryId, LedgerError> {
        validate_payload(&event_type, &payload)?;
        let entry = LedgerEntry::pending(event_type, payload);
        let id = entry.id;
        self.ledger.push(entry);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn new_program(title: &str) -> NewProgram {
        NewProgram {
            title: title.to_string(),
            description: String::new(),
            publish_date: Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
            program_type: "podcast".to_string(),
            language: "en".to_string(),
            tags: vec![],
        }
    }

    #[tokio::test]
    async fn committed_writes_become_visible_together() {
        let db = InMemoryDatabase::new();
        let mut tx = db.begin().await.unwrap();
        let program = tx.insert_program(new_program("A"), Utc::now()).await.unwrap();
        tx.record_event(EventType::created("PROGRAM"), json!({ "id": program.id.get() }))
            .await
            .unwrap();

        assert!(db.load_by_id(program.id).await.unwrap().is_none());
        assert!(db.ledger_entries().unwrap().is_empty());

        tx.commit().await.unwrap();

        assert_eq!(db.load_by_id(program.id).await.unwrap(), Some(program));
        assert_eq!(db.ledger_entries().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rolled_back_or_dropped_transactions_leave_nothing() {
        let db = InMemoryDatabase::new();

        let mut tx = db.begin().await.unwrap();
        tx.insert_program(new_program("A"), Utc::now()).await.unwrap();
        tx.record_event(EventType::created("PROGRAM"), json!({ "id": 1 }))
            .await
            .unwrap();
        tx.rollback().await.unwrap();

        {
            let mut tx = db.begin().await.unwrap();
            tx.record_event(EventType::created("PROGRAM"), json!({ "id": 2 }))
                .await
                .unwrap();
        }

        assert!(db.programs().unwrap().is_empty());
        assert!(db.ledger_entries().unwrap().is_empty());
    }

    #[tokio::test]
    async fn transaction_reads_its_own_staged_writes() {
        let db = InMemoryDatabase::new();
        let mut tx = db.begin().await.unwrap();
        let program = tx.insert_program(new_program("A"), Utc::now()).await.unwrap();

        assert!(tx.find_program_for_update(program.id).await.unwrap().is_some());
        assert!(tx.delete_program(program.id).await.unwrap());
        assert!(tx.find_program_for_update(program.id).await.unwrap().is_none());
        assert!(!tx.delete_program(program.id).await.unwrap());
    }

    #[tokio::test]
    async fn offline_store_rejects_work() {
        let db = InMemoryDatabase::new();
        db.set_available(false);
        assert!(matches!(db.begin().await, Err(StoreError::Unavailable(_))));
        assert!(db.load_by_id(AggregateId::new(1)).await.is_err());

        db.set_available(true);
        assert!(db.begin().await.is_ok());
    }
}
