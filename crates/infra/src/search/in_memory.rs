use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use outboxsync_core::AggregateId;
use outboxsync_programs::ProgramDocument;

use super::query::{SearchHits, SearchQuery, SortField, SortOrder};
use super::{DeleteOutcome, SearchError, SearchIndex};

/// In-memory search index (tests/dev).
///
/// Free text is a case-insensitive substring match of any query term against
/// title, description and tags.
#[derive(Debug)]
pub struct InMemorySearchIndex {
    docs: RwLock<BTreeMap<AggregateId, ProgramDocument>>,
    available: AtomicBool,
}

impl Default for InMemorySearchIndex {
    fn default() -> Self {
        Self {
            docs: RwLock::new(BTreeMap::new()),
            available: AtomicBool::new(true),
        }
    }
}

impl InMemorySearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every call fails with `Unavailable` while false.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, AtomicOrdering::SeqCst);
    }

    pub fn get(&self, id: AggregateId) -> Result<Option<ProgramDocument>, SearchError> {
        Ok(self.read()?.get(&id).cloned())
    }

    pub fn len(&self) -> Result<usize, SearchError> {
        Ok(self.read()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, SearchError> {
        Ok(self.read()?.is_empty())
    }

    fn check_available(&self) -> Result<(), SearchError> {
        if self.available.load(AtomicOrdering::SeqCst) {
            Ok(())
        } else {
            Err(SearchError::Unavailable("in-memory index offline".into()))
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, BTreeMap<AggregateId, ProgramDocument>>, SearchError> {
        self.check_available()?;
        self.docs.read().map_err(|_| SearchError::Poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<AggregateId, ProgramDocument>>, SearchError> {
        self.check_available()?;
        self.docs.write().map_err(|_| SearchError::Poisoned)
    }
}

fn matches(doc: &ProgramDocument, query: &SearchQuery) -> bool {
    if query.program_type.as_ref().is_some_and(|t| &doc.program_type != t) {
        return false;
    }
    if query.language.as_ref().is_some_and(|l| &doc.language != l) {
        return false;
    }
    if !query.tags.is_empty() && !query.tags.iter().any(|t| doc.tags.contains(t)) {
        return false;
    }

    let Some(text) = query.search_text() else {
        return true;
    };
    let haystack = [
        doc.title.to_lowercase(),
        doc.description.to_lowercase(),
        doc.tags.join(" ").to_lowercase(),
    ];
    text.split_whitespace()
        .map(str::to_lowercase)
        .any(|term| haystack.iter().any(|field| field.contains(&term)))
}

fn compare(a: &ProgramDocument, b: &ProgramDocument, field: SortField) -> Ordering {
    // Timestamps share one RFC 3339 format, so string order is time order.
    let ord = match field {
        SortField::PublishDate => a.publish_date.cmp(&b.publish_date),
        SortField::Title => a.title.cmp(&b.title),
        SortField::CreatedAt => a.created_at.cmp(&b.created_at),
        SortField::UpdatedAt => a.updated_at.cmp(&b.updated_at),
    };
    ord.then(a.id.cmp(&b.id))
}

#[async_trait]
impl SearchIndex for InMemorySearchIndex {
    async fn initialize_index(&self) -> Result<(), SearchError> {
        self.check_available()
    }

    async fn put(&self, id: AggregateId, document: &ProgramDocument) -> Result<(), SearchError> {
        self.write()?.insert(id, document.clone());
        Ok(())
    }

    async fn delete(&self, id: AggregateId) -> Result<DeleteOutcome, SearchError> {
        Ok(match self.write()?.remove(&id) {
            Some(_) => DeleteOutcome::Deleted,
            None => DeleteOutcome::NotFound,
        })
    }

    async fn search(&self, query: &SearchQuery) -> Result<SearchHits, SearchError> {
        let docs = self.read()?;
        let mut found: Vec<&ProgramDocument> = docs.values().filter(|d| matches(d, query)).collect();
        found.sort_by(|a, b| match query.sort_order {
            SortOrder::Asc => compare(a, b, query.sort_by),
            SortOrder::Desc => compare(b, a, query.sort_by),
        });

        let total = found.len() as u64;
        let hits = found
            .into_iter()
            .skip(query.offset() as usize)
            .take(query.effective_limit() as usize)
            .cloned()
            .collect();

        Ok(SearchHits {
            hits,
            total,
            page: query.effective_page(),
            limit: query.effective_limit(),
        })
    }
}
