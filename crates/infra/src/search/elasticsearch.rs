//! Elasticsearch adapter over its REST API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use tracing::{debug, info, instrument};

use outboxsync_core::AggregateId;
use outboxsync_programs::ProgramDocument;

use super::query::{SearchHits, SearchQuery, SortField};
use super::{DeleteOutcome, SearchError, SearchIndex};

#[derive(Debug, Clone)]
pub struct ElasticsearchConfig {
    pub url: String,
    pub index: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Make writes visible to search before returning (`refresh=wait_for`).
    pub refresh_on_write: bool,
    /// Upper bound on one request, connect included.
    pub request_timeout: Duration,
}

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

impl ElasticsearchConfig {
    pub fn new(url: impl Into<String>, index: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            index: index.into(),
            username: None,
            password: None,
            refresh_on_write: false,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }
}

/// Index mapping. `title` carries a keyword subfield so it can be sorted on.
pub fn program_mapping() -> JsonValue {
    json!({
        "mappings": {
            "properties": {
                "id": { "type": "integer" },
                "title": {
                    "type": "text",
                    "analyzer": "standard",
                    "fields": { "keyword": { "type": "keyword", "ignore_above": 256 } }
                },
                "description": { "type": "text", "analyzer": "standard" },
                "publishDate": { "type": "date" },
                "type": { "type": "keyword" },
                "language": { "type": "keyword" },
                "tags": { "type": "keyword" },
                "createdAt": { "type": "date" },
                "updatedAt": { "type": "date" }
            }
        }
    })
}

fn sort_path(field: SortField) -> &'static str {
    match field {
        SortField::PublishDate => "publishDate",
        SortField::Title => "title.keyword",
        SortField::CreatedAt => "createdAt",
        SortField::UpdatedAt => "updatedAt",
    }
}

/// `_search` request body for a query.
pub fn search_body(query: &SearchQuery) -> JsonValue {
    let mut filter = Vec::new();
    if let Some(t) = &query.program_type {
        filter.push(json!({ "term": { "type": t } }));
    }
    if let Some(l) = &query.language {
        filter.push(json!({ "term": { "language": l } }));
    }
    if !query.tags.is_empty() {
        filter.push(json!({ "terms": { "tags": query.tags } }));
    }

    let es_query = match query.search_text() {
        None if filter.is_empty() => json!({ "match_all": {} }),
        None => json!({ "bool": { "filter": filter } }),
        Some(text) => json!({
            "bool": {
                "must": [{
                    "multi_match": {
                        "query": text,
                        "fields": ["title^2", "description", "tags"],
                        "type": "best_fields",
                        "fuzziness": "AUTO"
                    }
                }],
                "filter": filter
            }
        }),
    };

    let mut sort = serde_json::Map::new();
    sort.insert(
        sort_path(query.sort_by).to_string(),
        json!({ "order": query.sort_order.as_str() }),
    );

    json!({
        "query": es_query,
        "from": query.offset(),
        "size": query.effective_limit(),
        "sort": [sort]
    })
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    hits: HitsEnvelope,
}

#[derive(Debug, Deserialize)]
struct HitsEnvelope {
    total: Option<Total>,
    hits: Vec<Hit>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Total {
    Count(u64),
    Object { value: u64 },
}

#[derive(Debug, Deserialize)]
struct Hit {
    #[serde(rename = "_source")]
    source: ProgramDocument,
}

fn map_reqwest_error(operation: &str, err: reqwest::Error) -> SearchError {
    if err.is_connect() || err.is_timeout() {
        SearchError::Unavailable(format!("{operation}: {err}"))
    } else if err.is_decode() {
        SearchError::Serialization(format!("{operation}: {err}"))
    } else {
        SearchError::Request(format!("{operation}: {err}"))
    }
}

async fn status_error(operation: &str, response: Response) -> SearchError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        SearchError::Unavailable(format!("{operation}: {status}: {body}"))
    } else {
        SearchError::Request(format!("{operation}: {status}: {body}"))
    }
}

#[derive(Debug, Clone)]
pub struct ElasticsearchIndex {
    client: Client,
    config: ElasticsearchConfig,
}

impl ElasticsearchIndex {
    pub fn new(config: ElasticsearchConfig) -> Result<Self, SearchError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| SearchError::Request(format!("build client: {e}")))?;
        Ok(Self { client, config })
    }

    pub fn index_name(&self) -> &str {
        &self.config.index
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}{}", self.config.url.trim_end_matches('/'), self.config.index, path)
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.config.username {
            Some(user) => req.basic_auth(user, self.config.password.as_deref()),
            None => req,
        }
    }

    async fn send(&self, operation: &str, req: RequestBuilder) -> Result<Response, SearchError> {
        self.authed(req)
            .send()
            .await
            .map_err(|e| map_reqwest_error(operation, e))
    }

    /// Whether the cluster answers at all.
    pub async fn ping(&self) -> bool {
        let req = self.client.get(self.config.url.trim_end_matches('/'));
        matches!(self.send("ping", req).await, Ok(r) if r.status().is_success())
    }
}

#[async_trait]
impl SearchIndex for ElasticsearchIndex {
    #[instrument(skip(self), fields(index = %self.config.index), err)]
    async fn initialize_index(&self) -> Result<(), SearchError> {
        let exists = self.send("index exists", self.client.head(self.url(""))).await?;
        match exists.status() {
            s if s.is_success() => {
                debug!("index already exists");
                return Ok(());
            }
            StatusCode::NOT_FOUND => {}
            _ => return Err(status_error("index exists", exists).await),
        }

        let created = self
            .send("create index", self.client.put(self.url("")).json(&program_mapping()))
            .await?;
        if created.status().is_success() {
            info!("index created");
            return Ok(());
        }

        // Another instance created it first.
        let err = status_error("create index", created).await;
        if matches!(&err, SearchError::Request(msg) if msg.contains("resource_already_exists_exception")) {
            return Ok(());
        }
        Err(err)
    }

    #[instrument(skip(self, document), fields(index = %self.config.index, program_id = %id), err)]
    async fn put(&self, id: AggregateId, document: &ProgramDocument) -> Result<(), SearchError> {
        let mut req = self.client.put(self.url(&format!("/_doc/{id}"))).json(document);
        if self.config.refresh_on_write {
            req = req.query(&[("refresh", "wait_for")]);
        }
        let response = self.send("index document", req).await?;
        if !response.status().is_success() {
            return Err(status_error("index document", response).await);
        }
        Ok(())
    }

    #[instrument(skip(self), fields(index = %self.config.index, program_id = %id), err)]
    async fn delete(&self, id: AggregateId) -> Result<DeleteOutcome, SearchError> {
        let mut req = self.client.delete(self.url(&format!("/_doc/{id}")));
        if self.config.refresh_on_write {
            req = req.query(&[("refresh", "wait_for")]);
        }
        let response = self.send("delete document", req).await?;
        match response.status() {
            s if s.is_success() => Ok(DeleteOutcome::Deleted),
            StatusCode::NOT_FOUND => Ok(DeleteOutcome::NotFound),
            _ => Err(status_error("delete document", response).await),
        }
    }

    #[instrument(skip(self, query), fields(index = %self.config.index), err)]
    async fn search(&self, query: &SearchQuery) -> Result<SearchHits, SearchError> {
        let req = self.client.post(self.url("/_search")).json(&search_body(query));
        let response = self.send("search", req).await?;
        if !response.status().is_success() {
            return Err(status_error("search", response).await);
        }

        let parsed: SearchResponse = response
            .json()
            .await
            .map_err(|e| map_reqwest_error("search", e))?;
        let total = match parsed.hits.total {
            Some(Total::Count(n)) | Some(Total::Object { value: n }) => n,
            None => parsed.hits.hits.len() as u64,
        };

        Ok(SearchHits {
            hits: parsed.hits.hits.into_iter().map(|h| h.source).collect(),
            total,
            page: query.effective_page(),
            limit: query.effective_limit(),
        })
    }
}
