use outboxsync_core::LedgerEntryId;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::event::EventType;
use crate::payload::{LedgerEvent, PayloadError};

/// The message the dispatcher hands to the broker for one ledger entry.
///
/// Wire shape: `{"ledgerEntryId": ..., "eventType": ..., "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxJob {
    pub ledger_entry_id: LedgerEntryId,
    pub event_type: EventType,
    pub payload: JsonValue,
}

impl OutboxJob {
    pub fn new(ledger_entry_id: LedgerEntryId, event_type: EventType, payload: JsonValue) -> Self {
        Self {
            ledger_entry_id,
            event_type,
            payload,
        }
    }

    pub fn decode(&self) -> Result<LedgerEvent, PayloadError> {
        LedgerEvent::decode(&self.event_type, &self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_shape_is_camel_case() {
        let id = LedgerEntryId::new();
        let job = OutboxJob::new(id, EventType::created("PROGRAM"), json!({ "id": 1 }));
        let wire = serde_json::to_value(&job).unwrap();

        assert_eq!(wire["ledgerEntryId"], json!(id.to_string()));
        assert_eq!(wire["eventType"], json!("PROGRAM_CREATED"));
        assert_eq!(wire["payload"], json!({ "id": 1 }));
    }

    #[test]
    fn reads_jobs_from_older_writers() {
        let raw = json!({
            "ledgerEntryId": "0190f0e4-9a4e-7c1a-8f7a-3f2d8a0b1c2d",
            "eventType": "PROGRAM_UPDATED",
            "payload": { "programId": 9 }
        });
        let job: OutboxJob = serde_json::from_value(raw).unwrap();
        assert_eq!(job.decode().unwrap().aggregate_id().map(|id| id.get()), Some(9));
    }
}
