use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};

use crate::program::Program;

/// Search projection of a [`Program`]. Timestamps are RFC 3339 strings.
///
/// Always written whole; there are no partial updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgramDocument {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub publish_date: String,
    #[serde(rename = "type")]
    pub program_type: String,
    pub language: String,
    pub tags: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<&Program> for ProgramDocument {
    fn from(program: &Program) -> Self {
        let ts = |t: &chrono::DateTime<chrono::Utc>| t.to_rfc3339_opts(SecondsFormat::Millis, true);
        Self {
            id: program.id.get(),
            title: program.title.clone(),
            description: program.description.clone(),
            publish_date: ts(&program.publish_date),
            program_type: program.program_type.clone(),
            language: program.language.clone(),
            tags: program.tags.clone(),
            created_at: ts(&program.created_at),
            updated_at: ts(&program.updated_at),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use outboxsync_core::AggregateId;

    #[test]
    fn renders_iso_timestamps_and_type_key() {
        let at = Utc.with_ymd_and_hms(2024, 1, 15, 8, 30, 0).unwrap();
        let program = Program {
            id: AggregateId::new(12),
            title: "Morning Show".into(),
            description: "Daily".into(),
            publish_date: at,
            program_type: "podcast".into(),
            language: "en".into(),
            tags: vec!["news".into()],
            created_at: at,
            updated_at: at,
        };

        let doc = ProgramDocument::from(&program);
        assert_eq!(doc.publish_date, "2024-01-15T08:30:00.000Z");

        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json["type"], "podcast");
        assert_eq!(json["publishDate"], "2024-01-15T08:30:00.000Z");
        assert_eq!(json["id"], 12);
    }
}
