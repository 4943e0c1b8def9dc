//! Ledger payloads.
//!
//! Payloads are stored as JSON so the ledger schema never changes when a new
//! aggregate starts recording events. They are validated on read: a payload for
//! a known event kind must carry the aggregate id.

use outboxsync_core::AggregateId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

use crate::event::{EventKind, EventType};

/// Minimal payload every known event carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    #[serde(alias = "programId")]
    pub id: AggregateId,

    /// Anything else the writer attached. Readers never depend on it.
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl EventPayload {
    pub fn new(id: AggregateId) -> Self {
        Self {
            id,
            extra: Map::new(),
        }
    }

    pub fn to_json(&self) -> JsonValue {
        // A struct with an AggregateId and a string-keyed map always serializes.
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({ "id": self.id.get() }))
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PayloadError {
    #[error("payload for {event_type} is not a JSON object")]
    NotAnObject { event_type: String },

    #[error("payload for {event_type} is invalid: {reason}")]
    Invalid { event_type: String, reason: String },
}

/// A ledger event, decoded.
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerEvent {
    Created { aggregate: String, id: AggregateId },
    Updated { aggregate: String, id: AggregateId },
    Deleted { aggregate: String, id: AggregateId },
    /// A tag this build does not know. Kept opaque.
    Unrecognized {
        event_type: String,
        payload: JsonValue,
    },
}

impl LedgerEvent {
    pub fn decode(event_type: &EventType, payload: &JsonValue) -> Result<Self, PayloadError> {
        let (aggregate, kind) = match event_type {
            EventType::Known { aggregate, kind } => (aggregate.clone(), *kind),
            EventType::Other(raw) => {
                return Ok(LedgerEvent::Unrecognized {
                    event_type: raw.clone(),
                    payload: payload.clone(),
                });
            }
        };

        if !payload.is_object() {
            return Err(PayloadError::NotAnObject {
                event_type: event_type.to_string(),
            });
        }

        let decoded: EventPayload =
            serde_json::from_value(payload.clone()).map_err(|e| PayloadError::Invalid {
                event_type: event_type.to_string(),
                reason: e.to_string(),
            })?;
        let id = decoded.id;

        Ok(match kind {
            EventKind::Created => LedgerEvent::Created { aggregate, id },
            EventKind::Updated => LedgerEvent::Updated { aggregate, id },
            EventKind::Deleted => LedgerEvent::Deleted { aggregate, id },
        })
    }

    pub fn aggregate_id(&self) -> Option<AggregateId> {
        match self {
            LedgerEvent::Created { id, .. }
            | LedgerEvent::Updated { id, .. }
            | LedgerEvent::Deleted { id, .. } => Some(*id),
            LedgerEvent::Unrecognized { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_known_kinds() {
        let ev = LedgerEvent::decode(&EventType::from("PROGRAM_UPDATED"), &json!({ "id": 7 }))
            .unwrap();
        assert_eq!(
            ev,
            LedgerEvent::Updated {
                aggregate: "PROGRAM".into(),
                id: AggregateId::new(7)
            }
        );
    }

    #[test]
    fn accepts_program_id_alias_and_extra_fields() {
        let ev = LedgerEvent::decode(
            &EventType::from("PROGRAM_DELETED"),
            &json!({ "programId": 3, "reason": "takedown" }),
        )
        .unwrap();
        assert_eq!(ev.aggregate_id(), Some(AggregateId::new(3)));
    }

    #[test]
    fn unknown_tags_stay_opaque() {
        let payload = json!({ "anything": true });
        let ev = LedgerEvent::decode(&EventType::from("PROGRAM_ARCHIVED"), &payload).unwrap();
        assert!(matches!(ev, LedgerEvent::Unrecognized { ref event_type, .. } if event_type == "PROGRAM_ARCHIVED"));
        assert_eq!(ev.aggregate_id(), None);
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        let ty = EventType::from("PROGRAM_CREATED");
        assert!(matches!(
            LedgerEvent::decode(&ty, &json!("7")),
            Err(PayloadError::NotAnObject { .. })
        ));
        assert!(matches!(
            LedgerEvent::decode(&ty, &json!({ "id": "seven" })),
            Err(PayloadError::Invalid { .. })
        ));
        assert!(matches!(
            LedgerEvent::decode(&ty, &json!({})),
            Err(PayloadError::Invalid { .. })
        ));
    }

    #[test]
    fn payload_writes_canonical_id_key() {
        let json = EventPayload::new(AggregateId::new(11)).to_json();
        assert_eq!(json, json!({ "id": 11 }));
    }
}
