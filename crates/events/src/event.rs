use serde::{Deserialize, Serialize};

/// What happened to an aggregate.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Created => "CREATED",
            EventKind::Updated => "UPDATED",
            EventKind::Deleted => "DELETED",
        }
    }

    fn parse(suffix: &str) -> Option<Self> {
        match suffix {
            "CREATED" => Some(EventKind::Created),
            "UPDATED" => Some(EventKind::Updated),
            "DELETED" => Some(EventKind::Deleted),
            _ => None,
        }
    }

    /// Whether applying this event means re-reading and upserting current state.
    pub fn is_upsert(&self) -> bool {
        matches!(self, EventKind::Created | EventKind::Updated)
    }
}

impl core::fmt::Display for EventKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event type tag stored on ledger rows and carried on jobs.
///
/// The wire form is `<AGGREGATE>_<KIND>` (e.g. `PROGRAM_UPDATED`). Tags that do
/// not follow that shape are kept verbatim in `Other` so newer writers never
/// break older readers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum EventType {
    Known { aggregate: String, kind: EventKind },
    Other(String),
}

impl EventType {
    pub fn new(aggregate: impl Into<String>, kind: EventKind) -> Self {
        Self::Known {
            aggregate: aggregate.into().to_ascii_uppercase(),
            kind,
        }
    }

    pub fn created(aggregate: impl Into<String>) -> Self {
        Self::new(aggregate, EventKind::Created)
    }

    pub fn updated(aggregate: impl Into<String>) -> Self {
        Self::new(aggregate, EventKind::Updated)
    }

    pub fn deleted(aggregate: impl Into<String>) -> Self {
        Self::new(aggregate, EventKind::Deleted)
    }

    pub fn kind(&self) -> Option<EventKind> {
        match self {
            EventType::Known { kind, .. } => Some(*kind),
            EventType::Other(_) => None,
        }
    }

    pub fn aggregate(&self) -> Option<&str> {
        match self {
            EventType::Known { aggregate, .. } => Some(aggregate),
            EventType::Other(_) => None,
        }
    }
}

impl From<&str> for EventType {
    fn from(value: &str) -> Self {
        match value.rsplit_once('_') {
            Some((aggregate, suffix)) if !aggregate.is_empty() => match EventKind::parse(suffix) {
                Some(kind) => EventType::Known {
                    aggregate: aggregate.to_string(),
                    kind,
                },
                None => EventType::Other(value.to_string()),
            },
            _ => EventType::Other(value.to_string()),
        }
    }
}

impl From<String> for EventType {
    fn from(value: String) -> Self {
        EventType::from(value.as_str())
    }
}

impl From<EventType> for String {
    fn from(value: EventType) -> Self {
        value.to_string()
    }
}

impl core::fmt::Display for EventType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            EventType::Known { aggregate, kind } => write!(f, "{aggregate}_{kind}"),
            EventType::Other(raw) => f.write_str(raw),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_aggregate_qualified_tags() {
        let ty = EventType::from("PROGRAM_DELETED");
        assert_eq!(ty.kind(), Some(EventKind::Deleted));
        assert_eq!(ty.aggregate(), Some("PROGRAM"));
        assert_eq!(ty.to_string(), "PROGRAM_DELETED");
    }

    #[test]
    fn multi_word_aggregates_split_on_last_underscore() {
        let ty = EventType::from("PODCAST_EPISODE_UPDATED");
        assert_eq!(ty.aggregate(), Some("PODCAST_EPISODE"));
        assert_eq!(ty.kind(), Some(EventKind::Updated));
    }

    #[test]
    fn unrecognized_tags_are_preserved_verbatim() {
        for raw in ["PROGRAM_ARCHIVED", "CREATED", "_CREATED", "reindex"] {
            let ty = EventType::from(raw);
            assert_eq!(ty, EventType::Other(raw.to_string()));
            assert_eq!(ty.to_string(), raw);
        }
    }

    #[test]
    fn constructor_normalizes_aggregate_case() {
        assert_eq!(EventType::created("program").to_string(), "PROGRAM_CREATED");
    }

    #[test]
    fn serializes_as_plain_string() {
        let json = serde_json::to_value(EventType::updated("PROGRAM")).unwrap();
        assert_eq!(json, serde_json::json!("PROGRAM_UPDATED"));

        let back: EventType = serde_json::from_value(json).unwrap();
        assert_eq!(back.kind(), Some(EventKind::Updated));
    }
}
