//! Write-path contract: record a ledger row inside the caller's transaction.
//!
//! ```ignore
//! let mut tx = db.begin().await?;
//! let program = tx.insert_program(cmd, Utc::now()).await?;
//! let (event_type, payload) = program_event(EventKind::Created, program.id);
//! tx.record_event(event_type, payload).await?;
//! tx.commit().await?;
//! ```
//!
//! The ledger row and the mutation share fate: both commit or neither does.

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use outboxsync_core::LedgerEntryId;
use outboxsync_events::{EventType, LedgerEvent};

use crate::ledger::LedgerError;

#[async_trait]
pub trait EventRecorder: Send {
    /// Append an unprocessed ledger row as part of this transaction.
    async fn record_event(
        &mut self,
        event_type: EventType,
        payload: JsonValue,
    ) -> Result<LedgerEntryId, LedgerError>;
}

/// Reject payloads the consumer would refuse anyway.
///
/// Known event types must carry the aggregate id; unknown ones only need to be
/// a JSON object.
pub(crate) fn validate_payload(event_type: &EventType, payload: &JsonValue) -> Result<(), LedgerError> {
    if !payload.is_object() {
        return Err(LedgerError::InvalidPayload(format!(
            "{event_type}: payload must be a JSON object"
        )));
    }
    LedgerEvent::decode(event_type, payload)
        .map(|_| ())
        .map_err(|e| LedgerError::InvalidPayload(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn known_events_need_an_aggregate_id() {
        let ty = EventType::updated("PROGRAM");
        assert!(validate_payload(&ty, &json!({ "id": 5 })).is_ok());
        assert!(matches!(
            validate_payload(&ty, &json!({ "title": "x" })),
            Err(LedgerError::InvalidPayload(_))
        ));
    }

    #[test]
    fn unknown_events_only_need_an_object() {
        let ty = EventType::from("PROGRAM_REINDEX_REQUESTED");
        assert!(validate_payload(&ty, &json!({})).is_ok());
        assert!(validate_payload(&ty, &json!([1, 2])).is_err());
    }
}
