use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use outboxsync_core::{AggregateId, DomainError, DomainResult};
use outboxsync_events::{EventKind, EventPayload, EventType};

/// Aggregate tag used in event types (`PROGRAM_CREATED`, ...).
pub const AGGREGATE_TYPE: &str = "PROGRAM";

/// Column widths of the `programs` table, in characters.
pub const TITLE_MAX_LEN: usize = 255;
pub const TYPE_MAX_LEN: usize = 50;
pub const LANGUAGE_MAX_LEN: usize = 10;

/// Event type and payload describing a change to one program.
pub fn program_event(kind: EventKind, id: AggregateId) -> (EventType, JsonValue) {
    (
        EventType::new(AGGREGATE_TYPE, kind),
        EventPayload::new(id).to_json(),
    )
}

/// A program as stored in the primary store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Program {
    pub id: AggregateId,
    pub title: String,
    pub description: String,
    pub publish_date: DateTime<Utc>,
    #[serde(rename = "type")]
    pub program_type: String,
    pub language: String,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Program {
    /// Materialize a validated `NewProgram` under a store-assigned id.
    pub fn from_new(id: AggregateId, new: NewProgram, now: DateTime<Utc>) -> Self {
        Self {
            id,
            title: new.title,
            description: new.description,
            publish_date: new.publish_date,
            program_type: new.program_type,
            language: new.language,
            tags: new.tags,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a validated patch. `updated_at` moves even when the patch is empty.
    pub fn apply(&mut self, changes: ProgramChanges, now: DateTime<Utc>) {
        if let Some(title) = changes.title {
            self.title = title;
        }
        if let Some(description) = changes.description {
            self.description = description;
        }
        if let Some(publish_date) = changes.publish_date {
            self.publish_date = publish_date;
        }
        if let Some(program_type) = changes.program_type {
            self.program_type = program_type;
        }
        if let Some(language) = changes.language {
            self.language = language;
        }
        if let Some(tags) = changes.tags {
            self.tags = tags;
        }
        // Keep timestamps monotonic even if the clock steps back.
        self.updated_at = now.max(self.updated_at);
    }
}

/// Command: create a program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProgram {
    pub title: String,
    pub description: String,
    pub publish_date: DateTime<Utc>,
    #[serde(rename = "type")]
    pub program_type: String,
    pub language: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl NewProgram {
    /// Validate and normalize (trimmed strings, deduplicated non-empty tags).
    pub fn validate(self) -> DomainResult<Self> {
        Ok(Self {
            title: required("title", self.title, TITLE_MAX_LEN)?,
            description: self.description.trim().to_string(),
            publish_date: self.publish_date,
            program_type: required("type", self.program_type, TYPE_MAX_LEN)?,
            language: required("language", self.language, LANGUAGE_MAX_LEN)?,
            tags: normalize_tags(self.tags),
        })
    }
}

/// Command: patch a program. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgramChanges {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub publish_date: Option<DateTime<Utc>>,
    #[serde(default, rename = "type")]
    pub program_type: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

impl ProgramChanges {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn validate(self) -> DomainResult<Self> {
        Ok(Self {
            title: self.title.map(|v| required("title", v, TITLE_MAX_LEN)).transpose()?,
            description: self.description.map(|v| v.trim().to_string()),
            publish_date: self.publish_date,
            program_type: self
                .program_type
                .map(|v| required("type", v, TYPE_MAX_LEN))
                .transpose()?,
            language: self
                .language
                .map(|v| required("language", v, LANGUAGE_MAX_LEN))
                .transpose()?,
            tags: self.tags.map(normalize_tags),
        })
    }
}

fn required(field: &str, value: String, max_len: usize) -> DomainResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(DomainError::validation(format!("{field} cannot be empty")));
    }
    if trimmed.chars().count() > max_len {
        return Err(DomainError::validation(format!(
            "{field} must be at most {max_len} characters"
        )));
    }
    Ok(trimmed.to_string())
}

fn normalize_tags(tags: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(tags.len());
    for tag in tags {
        let tag = tag.trim();
        if !tag.is_empty() && !out.iter().any(|t| t == tag) {
            out.push(tag.to_string());
        }
    }
    out
}
