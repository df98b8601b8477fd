//! Key-column row store contract + REST row store client.

use std::sync::LazyLock;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use regex::Regex;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "intel-storage";

/// One row as exchanged with the store: column name to JSON value.
pub type Row = Map<String, Value>;

/// Separator placed between the message, details and hint of a store error.
pub const MESSAGE_SEPARATOR: &str = " | ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    /// Network, auth or availability failure. Never retried by the engine.
    Unavailable,
    /// The store refused the payload itself (unknown column, bad type, constraint).
    RejectedPayload,
}

pub fn classify_status(status: StatusCode) -> StoreErrorKind {
    if status.is_server_error()
        || status == StatusCode::UNAUTHORIZED
        || status == StatusCode::FORBIDDEN
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        StoreErrorKind::Unavailable
    } else {
        StoreErrorKind::RejectedPayload
    }
}

/// Structured failure reported by a [`KeyColumnStore`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", render_message(.message, .details, .hint))]
pub struct StoreError {
    pub kind: StoreErrorKind,
    pub status: Option<u16>,
    pub code: Option<String>,
    pub message: String,
    pub details: Option<String>,
    pub hint: Option<String>,
}

fn render_message(message: &str, details: &Option<String>, hint: &Option<String>) -> String {
    [Some(message), details.as_deref(), hint.as_deref()]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(MESSAGE_SEPARATOR)
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    details: Option<String>,
    #[serde(default)]
    hint: Option<String>,
    #[serde(default)]
    code: Option<String>,
}

impl StoreError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Unavailable, message)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::RejectedPayload, message)
    }

    fn new(kind: StoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            code: None,
            message: message.into(),
            details: None,
            hint: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Builds an error from a non-success HTTP response. JSON bodies of the
    /// `{message, details, hint, code}` shape are unpacked; anything else
    /// becomes the message verbatim.
    pub fn from_response(status: StatusCode, body: &str) -> Self {
        let parsed = serde_json::from_str::<ErrorBody>(body)
            .ok()
            .filter(|b| b.message.is_some() || b.details.is_some() || b.hint.is_some());
        let ErrorBody {
            message,
            details,
            hint,
            code,
        } = parsed.unwrap_or_default();
        let message = message.unwrap_or_else(|| {
            let trimmed = body.trim();
            if trimmed.is_empty() || details.is_some() || hint.is_some() {
                format!("http status {}", status.as_u16())
            } else {
                trimmed.to_string()
            }
        });
        Self {
            kind: classify_status(status),
            status: Some(status.as_u16()),
            code,
            message,
            details,
            hint,
        }
    }

    pub fn from_transport(err: &reqwest::Error) -> Self {
        let mut out = Self::unavailable(format!("store request failed: {err}"));
        out.status = err.status().map(|s| s.as_u16());
        out
    }

    pub fn is_unavailable(&self) -> bool {
        self.kind == StoreErrorKind::Unavailable
    }

    /// Column the store blamed for the failure, if one can be read out of
    /// the message, details or hint.
    pub fn offending_column(&self) -> Option<String> {
        [Some(self.message.as_str()), self.details.as_deref(), self.hint.as_deref()]
            .into_iter()
            .flatten()
            .find_map(extract_column_name)
    }
}

static QUOTED_AFTER_COLUMN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)\bcolumn\s+["'`]([^"'`]+)["'`]"#).expect("valid regex"));
static QUOTED_BEFORE_COLUMN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)["'`]([^"'`]+)["'`]\s+column\b"#).expect("valid regex"));
static BARE_AFTER_COLUMN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bcolumn\s+([a-z_][a-z0-9_]*(?:\.[a-z_][a-z0-9_]*)*)").expect("valid regex")
});

const NOT_A_COLUMN: &[&str] = &["of", "in", "is", "does", "named", "reference", "references"];

/// Best-effort extraction of a column name from a store error text.
///
/// Recognizes `column "name"`, `'name' column` and `column table.name`;
/// a relation qualifier is stripped.
pub fn extract_column_name(text: &str) -> Option<String> {
    let captured = QUOTED_AFTER_COLUMN
        .captures(text)
        .or_else(|| QUOTED_BEFORE_COLUMN.captures(text))
        .map(|c| c[1].to_string())
        .or_else(|| {
            BARE_AFTER_COLUMN
                .captures(text)
                .map(|c| c[1].to_string())
                .filter(|name| !NOT_A_COLUMN.contains(&name.to_ascii_lowercase().as_str()))
        })?;
    let name = captured.rsplit('.').next().unwrap_or(&captured).trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// Generic key-column relational store consumed by the engine.
#[async_trait]
pub trait KeyColumnStore: Send + Sync {
    async fn select_all(&self, table: &str, columns: &[&str]) -> Result<Vec<Row>, StoreError>;

    /// Inserts `rows`, merging on `conflict_columns` when any are given.
    async fn upsert(
        &self,
        table: &str,
        rows: &[Row],
        conflict_columns: &[&str],
    ) -> Result<(), StoreError>;

    async fn update(&self, table: &str, row: &Row, id: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

pub fn build_http_client(config: &HttpClientConfig) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(config.timeout);

    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }

    builder.build().context("building reqwest client")
}

/// Row store reached over REST with bearer-token authorization.
#[derive(Debug, Clone)]
pub struct RestRowStore {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

const SELECT_LIMIT: &str = "5000";

impl RestRowStore {
    /// `project_url` is the service root; the REST path is appended.
    pub fn new(
        project_url: &str,
        api_key: impl Into<String>,
        config: &HttpClientConfig,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            client: build_http_client(config)?,
            base_url: format!("{}/rest/v1", project_url.trim_end_matches('/')),
            api_key: api_key.into(),
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/{}", self.base_url, table)
    }

    fn request(&self, method: reqwest::Method, table: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, self.table_url(table))
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response, StoreError> {
        let resp = builder
            .send()
            .await
            .map_err(|err| StoreError::from_transport(&err))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(StoreError::from_response(status, &body))
    }
}

#[async_trait]
impl KeyColumnStore for RestRowStore {
    async fn select_all(&self, table: &str, columns: &[&str]) -> Result<Vec<Row>, StoreError> {
        debug!(table, columns = %columns.join(","), "store select");
        let builder = self
            .request(reqwest::Method::GET, table)
            .query(&[("select", columns.join(",").as_str()), ("limit", SELECT_LIMIT)]);
        let resp = self.send(builder).await?;
        resp.json::<Vec<Row>>()
            .await
            .map_err(|err| StoreError::from_transport(&err))
    }

    async fn upsert(
        &self,
        table: &str,
        rows: &[Row],
        conflict_columns: &[&str],
    ) -> Result<(), StoreError> {
        debug!(table, rows = rows.len(), "store upsert");
        let mut builder = self.request(reqwest::Method::POST, table);
        if conflict_columns.is_empty() {
            builder = builder.header("Prefer", "return=minimal");
        } else {
            builder = builder
                .query(&[("on_conflict", conflict_columns.join(","))])
                .header("Prefer", "resolution=merge-duplicates,return=minimal");
        }
        self.send(builder.json(rows)).await.map(|_| ())
    }

    async fn update(&self, table: &str, row: &Row, id: &str) -> Result<(), StoreError> {
        debug!(table, id, "store update");
        let builder = self
            .request(reqwest::Method::PATCH, table)
            .query(&[("id", format!("eq.{id}"))])
            .header("Prefer", "return=minimal")
            .json(row);
        self.send(builder).await.map(|_| ())
    }
}
