use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use outboxsync_core::LedgerEntryId;

use super::r#trait::{ClaimedBatch, Ledger, LedgerEntry, LedgerError};
use crate::db::in_memory::{MemoryState, lock_state};
use crate::db::{InMemoryDatabase, StoreError};

#[async_trait]
impl Ledger for InMemoryDatabase {
    type Batch = InMemoryClaim;

    async fn claim_batch(&self, limit: usize) -> Result<InMemoryClaim, LedgerError> {
        let mut state = lock_state(&self.state)?;

        let mut candidates: Vec<&LedgerEntry> = state
            .ledger
            .values()
            .filter(|e| !e.processed && !state.claimed.contains(&e.id))
            .collect();
        candidates.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        candidates.truncate(limit);

        let entries: Vec<LedgerEntry> = candidates.into_iter().cloned().collect();
        for e in &entries {
            state.claimed.insert(e.id);
        }

        Ok(InMemoryClaim {
            state: self.state.clone(),
            entries,
            marked: HashSet::new(),
            released: false,
        })
    }

    async fn pending_count(&self) -> Result<u64, LedgerError> {
        let state = lock_state(&self.state)?;
        Ok(state.ledger.values().filter(|e| !e.processed).count() as u64)
    }

    async fn entry(&self, id: LedgerEntryId) -> Result<Option<LedgerEntry>, LedgerError> {
        let state = lock_state(&self.state)?;
        Ok(state.ledger.get(&id).cloned())
    }
}

/// Rows claimed from an [`InMemoryDatabase`].
///
/// Claimed ids sit in a shared lock set so a concurrent claim skips them, the
/// way `FOR UPDATE SKIP LOCKED` does.
#[derive(Debug)]
pub struct InMemoryClaim {
    state: Arc<Mutex<MemoryState>>,
    entries: Vec<LedgerEntry>,
    marked: HashSet<LedgerEntryId>,
    released: bool,
}

impl InMemoryClaim {
    fn release(&mut self, state: &mut MemoryState) {
        for e in &self.entries {
            state.claimed.remove(&e.id);
        }
        self.released = true;
    }
}

#[async_trait]
impl ClaimedBatch for InMemoryClaim {
    fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    async fn mark_processed(&mut self, id: LedgerEntryId) -> Result<(), LedgerError> {
        if !self.entries.iter().any(|e| e.id == id) {
            return Err(LedgerError::NotClaimed(id));
        }
        // Fails like the row update would when the store is down.
        lock_state(&self.state)?;
        self.marked.insert(id);
        Ok(())
    }

    async fn commit(mut self) -> Result<(), LedgerError> {
        let state = self.state.clone();
        let mut guard = lock_state(&state)?;
        for id in &self.marked {
            if let Some(entry) = guard.ledger.get_mut(id) {
                entry.processed = true;
            }
        }
        self.release(&mut guard);
        Ok(())
    }

    async fn rollback(mut self) -> Result<(), LedgerError> {
        let state = self.state.clone();
        let mut guard = state.lock().map_err(|_| StoreError::Poisoned)?;
        self.release(&mut guard);
        Ok(())
    }
}

impl Drop for InMemoryClaim {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let state = self.state.clone();
        let mut guard = match state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        self.release(&mut guard);
    }
}
