//! Axum JSON control surface over the judgment sync service.

use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use judsync_core::{CaseType, JudgmentQuery, RiskLevel};
use judsync_sync::{SyncService, TriggerAck};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "judsync-web";

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<SyncService>,
}

impl AppState {
    pub fn new(service: Arc<SyncService>) -> Self {
        Self { service }
    }
}

#[derive(Debug, Default, Deserialize)]
struct TriggerParams {
    #[serde(default)]
    force: bool,
}

#[derive(Debug, Default, Deserialize)]
struct SearchParams {
    q: Option<String>,
    risk: Option<String>,
    case_type: Option<String>,
    from: Option<String>,
    to: Option<String>,
    page: Option<usize>,
    per_page: Option<usize>,
}

impl SearchParams {
    fn into_query(self) -> Result<JudgmentQuery, String> {
        Ok(JudgmentQuery {
            text: self.q.map(|q| q.trim().to_string()).filter(|q| !q.is_empty()),
            risk_level: parse_opt::<RiskLevel>(self.risk.as_deref())?,
            case_type: parse_opt::<CaseType>(self.case_type.as_deref())?,
            date_from: parse_date(self.from.as_deref())?,
            date_to: parse_date(self.to.as_deref())?,
            page: self.page.unwrap_or(1).max(1),
            per_page: self
                .per_page
                .map(|n| n.clamp(1, JudgmentQuery::MAX_PER_PAGE))
                .unwrap_or(0),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct CompanyParams {
    name: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/judgments/status", get(status_handler))
        .route("/api/judgments/sync", post(trigger_handler))
        .route("/api/judgments/search", get(search_handler))
        .route("/api/judgments/stats", get(stats_handler))
        .route("/api/judgments/company", get(company_handler))
        .route("/api/judgments/{jid}", get(lookup_handler))
        .with_state(Arc::new(state))
}

/// Serve until `shutdown` resolves.
pub async fn serve<F>(service: Arc<SyncService>, port: u16, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "control surface listening");
    axum::serve(listener, app(AppState::new(service)))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.service.status().await {
        Ok(status) => Json(status).into_response(),
        Err(err) => server_error(err),
    }
}

async fn trigger_handler(State(state): State<Arc<AppState>>, Query(params): Query<TriggerParams>) -> Response {
    match state.service.trigger(params.force).await {
        Ok(ack) => {
            let status = match ack {
                TriggerAck::Started { .. } => StatusCode::ACCEPTED,
                TriggerAck::AlreadyRunning => StatusCode::CONFLICT,
                TriggerAck::ServiceWindowClosed => StatusCode::SERVICE_UNAVAILABLE,
            };
            (status, Json(ack)).into_response()
        }
        Err(err) => server_error(err),
    }
}

async fn search_handler(State(state): State<Arc<AppState>>, Query(params): Query<SearchParams>) -> Response {
    let query = match params.into_query() {
        Ok(query) => query,
        Err(message) => return bad_request(message),
    };
    match state.service.search(&query).await {
        Ok(page) => Json(page).into_response(),
        Err(err) => server_error(err),
    }
}

async fn lookup_handler(State(state): State<Arc<AppState>>, Path(jid): Path<String>) -> Response {
    match state.service.lookup(&jid).await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, Json(json!({ "error": "judgment not found", "jid": jid }))).into_response(),
        Err(err) => server_error(err),
    }
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.service.stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(err) => server_error(err),
    }
}

async fn company_handler(State(state): State<Arc<AppState>>, Query(params): Query<CompanyParams>) -> Response {
    let Some(name) = params.name.filter(|n| !n.trim().is_empty()) else {
        return bad_request("name is required".to_string());
    };
    match state.service.company_profile(&name).await {
        Ok(profile) => Json(profile).into_response(),
        Err(err) => server_error(err),
    }
}

fn parse_opt<T: FromStr>(raw: Option<&str>) -> Result<Option<T>, String>
where
    T::Err: std::fmt::Display,
{
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        Some(value) => value.parse().map(Some).map_err(|e: T::Err| e.to_string()),
        None => Ok(None),
    }
}

fn parse_date(raw: Option<&str>) -> Result<Option<NaiveDate>, String> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        Some(value) => NaiveDate::parse_from_str(value, "%Y-%m-%d")
            .map(Some)
            .map_err(|_| format!("invalid date {value:?}, expected YYYY-MM-DD")),
        None => Ok(None),
    }
}

fn bad_request(message: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

fn server_error(err: impl std::fmt::Display) -> Response {
    error!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": format!("Server error: {err}") })),
    )
        .into_response()
}
