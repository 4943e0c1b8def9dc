//! Primary store: transactions, the program tables and their in-memory twin.
//!
//! Every write goes through a [`Transaction`] so the state mutation and the
//! ledger row describing it commit or roll back together.

pub mod in_memory;
pub mod postgres;

pub use in_memory::{InMemoryDatabase, InMemoryTx};
pub use postgres::{PgDatabase, PgTx};

use async_trait::async_trait;
use thiserror::Error;

/// Primary store error.
///
/// ## SQLx mapping
///
/// | SQLx error | SQLSTATE | StoreError |
/// |------------|----------|------------|
/// | Database (unique violation) | `23505` | `Conflict` |
/// | Database (check / not-null) | `23514`, `23502` | `Constraint` |
/// | Database (data exception, e.g. value too long) | `22xxx` | `Constraint` |
/// | Database (other) | any | `Database` |
/// | Io, Tls, PoolTimedOut, PoolClosed | n/a | `Unavailable` |
/// | ColumnDecode, Decode | n/a | `Decode` |
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("constraint violated: {0}")]
    Constraint(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("failed to decode row: {0}")]
    Decode(String),

    #[error("in-memory store lock poisoned")]
    Poisoned,
}

impl StoreError {
    /// Whether the same operation might succeed if retried later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Unavailable(_) | StoreError::Conflict(_) | StoreError::Database(_)
        )
    }
}

pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("{operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Conflict(msg),
                Some("23514") | Some("23502") => StoreError::Constraint(msg),
                Some(code) if code.starts_with("22") => StoreError::Constraint(msg),
                _ => StoreError::Database(msg),
            }
        }
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut => {
            StoreError::Unavailable(format!("{operation}: connection pool unavailable"))
        }
        sqlx::Error::Io(e) => StoreError::Unavailable(format!("{operation}: {e}")),
        sqlx::Error::Tls(e) => StoreError::Unavailable(format!("{operation}: {e}")),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Decode(format!("{operation}: {err}"))
        }
        _ => StoreError::Database(format!("{operation}: {err}")),
    }
}

/// A unit of work against the primary store.
///
/// Dropping a transaction without calling [`Transaction::commit`] rolls it back.
#[async_trait]
pub trait Transaction: Send {
    async fn commit(self) -> Result<(), StoreError>;

    async fn rollback(self) -> Result<(), StoreError>;
}

/// Something that can open transactions.
#[async_trait]
pub trait Database: Send + Sync {
    type Tx: Transaction;

    async fn begin(&self) -> Result<Self::Tx, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_exhaustion_is_transient() {
        let err = map_sqlx_error("begin", sqlx::Error::PoolTimedOut);
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert!(err.is_transient());
    }

    #[test]
    fn decode_failures_are_not_transient() {
        let err = map_sqlx_error("load", sqlx::Error::Decode("bad tags".into()));
        assert!(matches!(err, StoreError::Decode(_)));
        assert!(!err.is_transient());
    }
}
