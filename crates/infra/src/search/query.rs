use serde::{Deserialize, Serialize};
use tracing::warn;

use outboxsync_programs::ProgramDocument;

pub const DEFAULT_PAGE_SIZE: u32 = 10;
pub const MAX_PAGE_SIZE: u32 = 100;

/// Sortable fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortField {
    #[default]
    PublishDate,
    Title,
    CreatedAt,
    UpdatedAt,
}

impl SortField {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "publishDate" => Some(SortField::PublishDate),
            "title" => Some(SortField::Title),
            "createdAt" => Some(SortField::CreatedAt),
            "updatedAt" => Some(SortField::UpdatedAt),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SortField::PublishDate => "publishDate",
            SortField::Title => "title",
            SortField::CreatedAt => "createdAt",
            SortField::UpdatedAt => "updatedAt",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortOrder::Asc => "asc",
            SortOrder::Desc => "desc",
        }
    }
}

/// Search request: free text, exact filters, sort and pagination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchQuery {
    pub text: Option<String>,
    #[serde(rename = "type")]
    pub program_type: Option<String>,
    pub language: Option<String>,
    /// Matches documents carrying any of these tags.
    pub tags: Vec<String>,
    /// 1-based.
    pub page: u32,
    pub limit: u32,
    pub sort_by: SortField,
    pub sort_order: SortOrder,
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self {
            text: None,
            program_type: None,
            language: None,
            tags: Vec::new(),
            page: 1,
            limit: DEFAULT_PAGE_SIZE,
            sort_by: SortField::default(),
            sort_order: SortOrder::default(),
        }
    }
}

impl SearchQuery {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    /// Apply a caller-supplied sort field; unknown fields fall back to the default.
    pub fn sorted_by(mut self, raw: &str, order: SortOrder) -> Self {
        self.sort_by = SortField::parse(raw).unwrap_or_else(|| {
            warn!(sort_by = raw, fallback = SortField::default().as_str(), "invalid sort field");
            SortField::default()
        });
        self.sort_order = order;
        self
    }

    pub fn paged(mut self, page: u32, limit: u32) -> Self {
        self.page = page;
        self.limit = limit;
        self
    }

    pub fn effective_page(&self) -> u32 {
        self.page.max(1)
    }

    pub fn effective_limit(&self) -> u32 {
        if self.limit == 0 {
            DEFAULT_PAGE_SIZE
        } else {
            self.limit.min(MAX_PAGE_SIZE)
        }
    }

    /// Offset of the first hit.
    pub fn offset(&self) -> u64 {
        u64::from(self.effective_page() - 1) * u64::from(self.effective_limit())
    }

    /// Non-blank free text, trimmed.
    pub fn search_text(&self) -> Option<&str> {
        self.text.as_deref().map(str::trim).filter(|t| !t.is_empty())
    }

    pub fn has_filters(&self) -> bool {
        self.program_type.is_some() || self.language.is_some() || !self.tags.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHits {
    pub hits: Vec<ProgramDocument>,
    /// Matches across all pages.
    pub total: u64,
    pub page: u32,
    pub limit: u32,
}
