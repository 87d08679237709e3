//! Judicial registry adapter: wire client, token cache, and response parsers.

use std::sync::Arc;

use async_trait::async_trait;
use judsync_storage::{classify_reqwest_error, classify_status, HttpClientConfig, RetryDisposition, RetryPolicy};
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

mod list;
mod parse;
mod token;

pub use list::{collect_ids, DatedGroup, IdSet, ListResponse};
pub use parse::{
    classify_case_type, extract_court_name, extract_parties, parse_judgment, roc_date_to_gregorian,
    truncate_chars, MAX_FULL_TEXT_CHARS, MAX_PARTY_LINES, SUMMARY_CHARS,
};
pub use token::{AuthToken, Credentials, TokenManager, TOKEN_TTL_HOURS};

pub const CRATE_NAME: &str = "judsync-adapters";

pub const DEFAULT_API_BASE: &str = "https://data.judicial.gov.tw/jdg/api";

/// Default cap on identifiers taken from one list response.
pub const DEFAULT_LIST_LIMIT: usize = 50;

/// Markers the registry uses in `{"error": ...}` when a JID has no record.
const NOT_FOUND_MARKERS: [&str; 3] = ["查無資料", "not found", "no data"];

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("http status {status} from {endpoint}")]
    HttpStatus { status: u16, endpoint: &'static str },
    #[error("registry reported an error: {0}")]
    Remote(String),
    #[error("could not decode {endpoint} response: {message}")]
    Decode { endpoint: &'static str, message: String },
    #[error("unrecognized list response shape: {0}")]
    UnrecognizedListShape(String),
}

impl RegistryError {
    /// Network failures, timeouts, 5xx, and throttling are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            RegistryError::Transport(err) => classify_reqwest_error(err) == RetryDisposition::Retryable,
            RegistryError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(|s| classify_status(s) == RetryDisposition::Retryable)
                .unwrap_or(false),
            _ => false,
        }
    }

    /// The registry refused the token itself, so the cached one must not be reused.
    pub fn invalidates_token(&self) -> bool {
        match self {
            RegistryError::Auth(_) | RegistryError::Remote(_) => true,
            RegistryError::HttpStatus { status, .. } => matches!(status, 401 | 403),
            _ => false,
        }
    }
}

/// Result of a detail request that reached the registry.
#[derive(Debug, Clone, PartialEq)]
pub enum DetailOutcome {
    Found(JsonValue),
    /// The registry no longer has (or never had) this JID.
    NotFound,
}

/// One attempt per call against the registry's endpoints. Retries live in
/// [`RegistryClient`].
#[async_trait]
pub trait RegistryApi: Send + Sync {
    async fn authenticate(&self, credentials: &Credentials) -> Result<String, RegistryError>;

    async fn list_changed(&self, token: &str) -> Result<JsonValue, RegistryError>;

    async fn fetch_detail(&self, token: &str, jid: &str) -> Result<DetailOutcome, RegistryError>;

    async fn search(&self, token: &str, keyword: &str, limit: usize) -> Result<JsonValue, RegistryError>;
}

/// Paths below `base_url`. Errors and spans always name the logical endpoint
/// (`Auth`, `JList`, `JDoc`, `JSearch`) whatever path it is served at.
#[derive(Debug, Clone)]
pub struct RegistryEndpoints {
    pub base_url: String,
    pub auth: String,
    pub list: String,
    pub detail: String,
    pub search: String,
}

impl RegistryEndpoints {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            auth: "Auth".to_string(),
            list: "JList".to_string(),
            detail: "JDoc".to_string(),
            search: "JSearch".to_string(),
        }
    }

    pub fn with_search(mut self, path: impl Into<String>) -> Self {
        self.search = path.into();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path.trim_start_matches('/'))
    }
}

impl Default for RegistryEndpoints {
    fn default() -> Self {
        Self::new(DEFAULT_API_BASE)
    }
}

#[derive(Serialize)]
struct AuthRequest<'a> {
    account: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct TokenRequest<'a> {
    token: &'a str,
}

#[derive(Serialize)]
struct DetailRequest<'a> {
    token: &'a str,
    jid: &'a str,
}

#[derive(Serialize)]
struct SearchRequest<'a> {
    token: &'a str,
    keyword: &'a str,
    limit: usize,
}

/// `reqwest` implementation of [`RegistryApi`]; every endpoint is a JSON POST.
#[derive(Debug, Clone)]
pub struct HttpRegistry {
    client: reqwest::Client,
    endpoints: RegistryEndpoints,
}

impl HttpRegistry {
    pub fn new(endpoints: RegistryEndpoints, config: &HttpClientConfig) -> Result<Self, RegistryError> {
        Ok(Self {
            client: config.build_client()?,
            endpoints,
        })
    }

    async fn post_json<B: Serialize + ?Sized>(
        &self,
        endpoint: &'static str,
        path: &str,
        body: &B,
    ) -> Result<(StatusCode, JsonValue), RegistryError> {
        let url = self.endpoints.url(path);
        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .instrument(info_span!("registry_call", endpoint))
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Ok((status, JsonValue::Null));
        }
        let bytes = resp.bytes().await?;
        let value = serde_json::from_slice(&bytes).map_err(|e| RegistryError::Decode {
            endpoint,
            message: e.to_string(),
        })?;
        Ok((status, value))
    }
}

#[async_trait]
impl RegistryApi for HttpRegistry {
    async fn authenticate(&self, credentials: &Credentials) -> Result<String, RegistryError> {
        let body = AuthRequest {
            account: &credentials.account,
            password: credentials.password(),
        };
        let (status, value) = self
            .post_json("Auth", &self.endpoints.auth, &body)
            .await
            .map_err(|e| RegistryError::Auth(e.to_string()))?;
        if !status.is_success() {
            return Err(RegistryError::Auth(format!("http status {}", status.as_u16())));
        }
        token_from_auth_response(&value)
    }

    async fn list_changed(&self, token: &str) -> Result<JsonValue, RegistryError> {
        let endpoint = "JList";
        let (status, value) = self
            .post_json(endpoint, &self.endpoints.list, &TokenRequest { token })
            .await?;
        if !status.is_success() {
            return Err(RegistryError::HttpStatus {
                status: status.as_u16(),
                endpoint,
            });
        }
        Ok(value)
    }

    async fn fetch_detail(&self, token: &str, jid: &str) -> Result<DetailOutcome, RegistryError> {
        let endpoint = "JDoc";
        let (status, value) = self
            .post_json(endpoint, &self.endpoints.detail, &DetailRequest { token, jid })
            .await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(DetailOutcome::NotFound);
        }
        if !status.is_success() {
            return Err(RegistryError::HttpStatus {
                status: status.as_u16(),
                endpoint,
            });
        }
        detail_outcome_from_response(value)
    }

    async fn search(&self, token: &str, keyword: &str, limit: usize) -> Result<JsonValue, RegistryError> {
        let endpoint = "JSearch";
        let (status, value) = self
            .post_json(endpoint, &self.endpoints.search, &SearchRequest { token, keyword, limit })
            .await?;
        if !status.is_success() {
            return Err(RegistryError::HttpStatus {
                status: status.as_u16(),
                endpoint,
            });
        }
        Ok(value)
    }
}

/// Accepts `{"Token": ...}` or `{"token": ...}`; anything else is an auth failure.
pub fn token_from_auth_response(value: &JsonValue) -> Result<String, RegistryError> {
    if let Some(message) = value.get("error").and_then(JsonValue::as_str) {
        return Err(RegistryError::Auth(message.to_string()));
    }
    value
        .get("Token")
        .or_else(|| value.get("token"))
        .and_then(JsonValue::as_str)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(ToString::to_string)
        .ok_or_else(|| RegistryError::Auth("response carried no token".to_string()))
}

pub fn detail_outcome_from_response(value: JsonValue) -> Result<DetailOutcome, RegistryError> {
    if let Some(message) = value.get("error").and_then(JsonValue::as_str) {
        let lower = message.to_lowercase();
        if NOT_FOUND_MARKERS.iter().any(|m| lower.contains(m)) {
            return Ok(DetailOutcome::NotFound);
        }
        return Err(RegistryError::Remote(message.to_string()));
    }
    if value.is_null() {
        return Ok(DetailOutcome::NotFound);
    }
    if !value.is_object() {
        return Err(RegistryError::Decode {
            endpoint: "JDoc",
            message: "detail payload is not an object".to_string(),
        });
    }
    Ok(DetailOutcome::Found(value))
}

/// List/detail/search calls with the shared retry policy applied.
#[derive(Clone)]
pub struct RegistryClient {
    api: Arc<dyn RegistryApi>,
    retry: RetryPolicy,
    list_limit: usize,
}

impl RegistryClient {
    pub fn new(api: Arc<dyn RegistryApi>, retry: RetryPolicy, list_limit: usize) -> Self {
        Self {
            api,
            retry,
            list_limit: list_limit.max(1),
        }
    }

    pub fn api(&self) -> &Arc<dyn RegistryApi> {
        &self.api
    }

    pub fn list_limit(&self) -> usize {
        self.list_limit
    }

    /// Changed identifiers in list order, deduplicated, capped at `limit`
    /// (or the configured list limit when `None`).
    pub async fn list_changed_ids(&self, token: &str, limit: Option<usize>) -> Result<Vec<String>, RegistryError> {
        let raw = self
            .retry
            .retry("JList", RegistryError::is_transient, |_| self.api.list_changed(token))
            .await?;
        let ids = collect_ids(&raw, limit.unwrap_or(self.list_limit))?;
        debug!(count = ids.len(), "list response flattened");
        Ok(ids)
    }

    /// `Ok(None)` when the registry reports the record as removed.
    pub async fn fetch_detail(&self, token: &str, jid: &str) -> Result<Option<JsonValue>, RegistryError> {
        let outcome = self
            .retry
            .retry("JDoc", RegistryError::is_transient, |_| self.api.fetch_detail(token, jid))
            .await?;
        Ok(match outcome {
            DetailOutcome::Found(value) => Some(value),
            DetailOutcome::NotFound => None,
        })
    }

    pub async fn search_ids(&self, token: &str, keyword: &str, limit: usize) -> Result<Vec<String>, RegistryError> {
        let limit = limit.max(1);
        let raw = self
            .retry
            .retry("JSearch", RegistryError::is_transient, |_| self.api.search(token, keyword, limit))
            .await?;
        collect_ids(&raw, limit)
    }
}
