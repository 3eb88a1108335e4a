//! CouchDB-compatible document server over HTTP.

use crate::error::{StorageError, StorageResult};
use crate::store::{
    BulkDocsOptions, BulkGetRequest, BulkGetResponse, ChangesRequest, ChangesResponse,
    DatabaseInfo, DocumentStore, GetOptions, PutOptions, RevsDiffRequest, RevsDiffResponse,
    WriteResult,
};
use async_trait::async_trait;
use docmesh_types::{DocId, Document, LOCAL_PREFIX};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::debug;

/// Connection settings for an [`HttpDocumentStore`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpStoreConfig {
    /// Server root, e.g. `http://127.0.0.1:5984`.
    pub base_url: String,
    /// Database name.
    pub database: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    60
}

impl Default for HttpStoreConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:5984".to_string(),
            database: "docmesh".to_string(),
            username: None,
            password: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    reason: String,
}

/// A replica reached through a CouchDB-compatible REST API.
pub struct HttpDocumentStore {
    config: HttpStoreConfig,
    client: Client,
    name: String,
}

impl HttpDocumentStore {
    /// Creates a store for the configured database. No request is made yet.
    pub fn new(config: HttpStoreConfig) -> StorageResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| StorageError::InvalidData(format!("failed to create HTTP client: {e}")))?;
        let name = format!(
            "{}/{}",
            config.base_url.trim_end_matches('/'),
            config.database
        );
        Ok(Self {
            config,
            client,
            name,
        })
    }

    fn db_url(&self) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            urlencoding::encode(&self.config.database)
        )
    }

    fn doc_url(&self, id: &DocId) -> String {
        let encoded = match id.as_str().strip_prefix(LOCAL_PREFIX) {
            Some(rest) => format!("{LOCAL_PREFIX}{}", urlencoding::encode(rest)),
            None => urlencoding::encode(id.as_str()).into_owned(),
        };
        format!("{}/{encoded}", self.db_url())
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.username {
            Some(user) => request.basic_auth(user, self.config.password.as_ref()),
            None => request,
        }
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder, what: &str) -> StorageResult<T> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| StorageError::Unreachable(format!("{what}: {e}")))?;
        let response = check_status(response, what).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| StorageError::InvalidData(format!("{what}: {e}")))
    }
}

async fn check_status(response: Response, what: &str) -> StorageResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&body)
        .map(|e| format!("{what}: {} ({})", e.error, e.reason))
        .unwrap_or_else(|_| format!("{what}: {body}"));

    Err(match status {
        StatusCode::NOT_FOUND => StorageError::NotFound(message),
        StatusCode::CONFLICT => StorageError::Conflict(message),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => StorageError::Unauthorized(message),
        _ => StorageError::Http {
            status: status.as_u16(),
            message,
        },
    })
}

#[async_trait]
impl DocumentStore for HttpDocumentStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn info(&self) -> StorageResult<DatabaseInfo> {
        self.send(self.client.get(self.db_url()), "info").await
    }

    async fn changes(&self, request: &ChangesRequest) -> StorageResult<ChangesResponse> {
        let mut query: Vec<(&str, String)> = vec![("style", request.style.as_str().to_string())];
        if !request.since.is_start() {
            query.push(("since", request.since.to_string()));
        }
        if let Some(limit) = request.limit {
            query.push(("limit", limit.to_string()));
        }

        let url = format!("{}/_changes", self.db_url());
        let response: ChangesResponse = self
            .send(self.client.get(url).query(&query), "changes")
            .await?;
        debug!(
            store = %self.name,
            since = %request.since,
            count = response.results.len(),
            "fetched changes"
        );
        Ok(response)
    }

    async fn revs_diff(&self, revs: &RevsDiffRequest) -> StorageResult<RevsDiffResponse> {
        let url = format!("{}/_revs_diff", self.db_url());
        self.send(self.client.post(url).json(revs), "revs_diff").await
    }

    async fn bulk_docs(
        &self,
        docs: Vec<Document>,
        options: BulkDocsOptions,
    ) -> StorageResult<Vec<WriteResult>> {
        let url = format!("{}/_bulk_docs", self.db_url());
        let body = json!({ "docs": docs, "new_edits": options.new_edits });
        self.send(self.client.post(url).json(&body), "bulk_docs").await
    }

    async fn bulk_get(&self, request: &BulkGetRequest) -> StorageResult<BulkGetResponse> {
        let url = format!("{}/_bulk_get", self.db_url());
        let body = json!({ "docs": request.docs });
        let mut builder = self.client.post(url).json(&body);
        if request.revs {
            builder = builder.query(&[("revs", "true")]);
        }
        self.send(builder, "bulk_get").await
    }

    async fn put(&self, doc: Document, options: PutOptions) -> StorageResult<WriteResult> {
        let mut builder = self.client.put(self.doc_url(&doc.id)).json(&doc);
        if !options.new_edits {
            builder = builder.query(&[("new_edits", "false")]);
        }
        let mut result: WriteResult = self.send(builder, "put").await?;
        if result.id.as_str().is_empty() {
            result.id = doc.id;
        }
        Ok(result)
    }

    async fn get(&self, id: &DocId, options: &GetOptions) -> StorageResult<Document> {
        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(rev) = &options.rev {
            query.push(("rev", rev.to_string()));
        }
        if options.revs {
            query.push(("revs", "true".to_string()));
        }
        if options.conflicts {
            query.push(("conflicts", "true".to_string()));
        }
        self.send(self.client.get(self.doc_url(id)).query(&query), "get")
            .await
    }
}
