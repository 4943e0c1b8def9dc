//! Search projection of programs.
//!
//! Documents are always written whole and keyed by program id, so `put` and
//! `delete` are idempotent and re-applying a job converges.

pub mod elasticsearch;
pub mod in_memory;
pub mod query;

pub use elasticsearch::{ElasticsearchConfig, ElasticsearchIndex};
pub use in_memory::InMemorySearchIndex;
pub use query::{SearchHits, SearchQuery, SortField, SortOrder};

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use outboxsync_core::AggregateId;
use outboxsync_programs::ProgramDocument;

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("search index unavailable: {0}")]
    Unavailable(String),

    #[error("search request rejected: {0}")]
    Request(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("search index lock poisoned")]
    Poisoned,
}

impl SearchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SearchError::Unavailable(_))
    }
}

/// Result of removing a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// Nothing was indexed under that id.
    NotFound,
}

#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Create the index with its mapping if it does not exist yet.
    async fn initialize_index(&self) -> Result<(), SearchError>;

    /// Insert or fully replace the document for `id`.
    async fn put(&self, id: AggregateId, document: &ProgramDocument) -> Result<(), SearchError>;

    async fn delete(&self, id: AggregateId) -> Result<DeleteOutcome, SearchError>;

    async fn search(&self, query: &SearchQuery) -> Result<SearchHits, SearchError>;
}

#[async_trait]
impl<S> SearchIndex for Arc<S>
where
    S: SearchIndex + ?Sized,
{
    async fn initialize_index(&self) -> Result<(), SearchError> {
        (**self).initialize_index().await
    }

    async fn put(&self, id: AggregateId, document: &ProgramDocument) -> Result<(), SearchError> {
        (**self).put(id, document).await
    }

    async fn delete(&self, id: AggregateId) -> Result<DeleteOutcome, SearchError> {
        (**self).delete(id).await
    }

    async fn search(&self, query: &SearchQuery) -> Result<SearchHits, SearchError> {
        (**self).search(query).await
    }
}
