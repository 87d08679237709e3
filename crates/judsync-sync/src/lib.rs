//! Judgment sync pipeline: gate, list, detail, parse, classify, reconcile.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use judsync_adapters::{
    parse_judgment, Credentials, HttpRegistry, RegistryApi, RegistryClient, RegistryEndpoints, RegistryError,
    TokenManager, DEFAULT_API_BASE, DEFAULT_LIST_LIMIT,
};
use judsync_core::{
    CompanySearchResult, ItemOutcome, JudgmentQuery, JudgmentRecord, JudgmentStats, Page, RiskLevel, RunCounters,
    ServiceWindow, SyncRun, SyncStatus,
};
use judsync_storage::{HttpClientConfig, JudgmentStore, RetryPolicy, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

mod backfill;
mod reconcile;
mod risk;
mod scheduler;
mod tracker;

pub use backfill::{BackfillOptions, BackfillReport, BackfillStop, CompanyBackfillOptions, CompanyBackfillReport};
pub use reconcile::Reconciler;
pub use risk::{classify_risk, keyword_hits, KeywordHits, HIGH_RISK_KEYWORDS, MEDIUM_RISK_KEYWORDS};
pub use scheduler::SyncScheduler;
pub use tracker::{RunGuard, RunHandle, RunKind, RunTracker, SingleFlight};

pub const CRATE_NAME: &str = "judsync-sync";

/// Runs listed in status and stats responses.
pub const RECENT_RUNS: usize = 10;

/// Matches returned in a company profile.
pub const COMPANY_RECENT_MATCHES: usize = 20;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub api_base: String,
    /// Path of the company search endpoint below `api_base`.
    pub search_endpoint: String,
    pub account: String,
    pub password: String,
    pub database_url: Option<String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub list_limit: usize,
    pub item_delay_ms: u64,
    pub progress_every: usize,
    pub max_retries: usize,
    pub retry_base_ms: u64,
    pub force_window: bool,
    pub stale_run_minutes: i64,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub web_port: u16,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            search_endpoint: "JSearch".to_string(),
            account: String::new(),
            password: String::new(),
            database_url: None,
            user_agent: "judsync/0.1".to_string(),
            http_timeout_secs: 30,
            list_limit: DEFAULT_LIST_LIMIT,
            item_delay_ms: 1000,
            progress_every: 10,
            max_retries: 3,
            retry_base_ms: 1000,
            force_window: false,
            stale_run_minutes: 30,
            scheduler_enabled: false,
            sync_cron: "0 30 16 * * *".to_string(),
            web_port: 8000,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api_base: std::env::var("JUDICIAL_API_BASE").unwrap_or(defaults.api_base),
            search_endpoint: std::env::var("JUDICIAL_SEARCH_ENDPOINT")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.search_endpoint),
            account: std::env::var("JUDICIAL_ACCOUNT").unwrap_or_default(),
            password: std::env::var("JUDICIAL_PASSWORD").unwrap_or_default(),
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.trim().is_empty()),
            user_agent: std::env::var("JUDSYNC_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("JUDSYNC_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            list_limit: env_parse("JUDSYNC_LIST_LIMIT", defaults.list_limit),
            item_delay_ms: env_parse("JUDSYNC_ITEM_DELAY_MS", defaults.item_delay_ms),
            progress_every: env_parse("JUDSYNC_PROGRESS_EVERY", defaults.progress_every),
            max_retries: env_parse("JUDSYNC_MAX_RETRIES", defaults.max_retries),
            retry_base_ms: env_parse("JUDSYNC_RETRY_BASE_MS", defaults.retry_base_ms),
            force_window: env_flag("JUDSYNC_FORCE_WINDOW"),
            stale_run_minutes: env_parse("JUDSYNC_STALE_RUN_MINUTES", defaults.stale_run_minutes),
            scheduler_enabled: env_flag("JUDSYNC_SCHEDULER_ENABLED"),
            sync_cron: std::env::var("JUDSYNC_SYNC_CRON").unwrap_or(defaults.sync_cron),
            web_port: env_parse("JUDSYNC_WEB_PORT", defaults.web_port),
        }
    }

    pub fn registry_endpoints(&self) -> RegistryEndpoints {
        RegistryEndpoints::new(self.api_base.clone()).with_search(self.search_endpoint.trim())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.retry_base_ms),
            ..RetryPolicy::default()
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            retry: self.retry_policy(),
        }
    }

    pub fn credentials(&self) -> Credentials {
        Credentials::new(self.account.clone(), self.password.clone())
    }

    pub fn item_delay(&self) -> Duration {
        Duration::from_millis(self.item_delay_ms)
    }

    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.stale_run_minutes.max(1))
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false)
}

/// Run-level failures. Per-item failures are counted, not raised.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("registry authentication failed: {0}")]
    Auth(#[source] RegistryError),
    #[error("listing changed judgments failed: {0}")]
    List(#[source] RegistryError),
    #[error("persistence failed: {0}")]
    Persistence(#[from] StoreError),
    #[error("a run is already in progress")]
    AlreadyRunning,
}

/// Immediate answer to a manual or scheduled trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TriggerAck {
    Started { run_id: Uuid, sync_date: NaiveDate },
    AlreadyRunning,
    ServiceWindowClosed,
}

/// Result of a run awaited to completion.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Finished(SyncRun),
    AlreadyRunning,
    ServiceWindowClosed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub active_run: Option<RunKind>,
    pub today: Option<SyncRun>,
    pub recent_runs: Vec<SyncRun>,
    pub registry_available: bool,
    pub last_backfill: Option<BackfillReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    pub judgments: JudgmentStats,
    pub recent_runs: Vec<SyncRun>,
}

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

enum Admission {
    Ready(RunGuard, RunHandle),
    Busy,
    Closed,
}

/// Entry point shared by the scheduler, the control surface, and the CLI.
pub struct SyncService {
    config: SyncConfig,
    window: ServiceWindow,
    store: Arc<dyn JudgmentStore>,
    registry: RegistryClient,
    tokens: TokenManager,
    reconciler: Reconciler,
    tracker: RunTracker,
    latch: SingleFlight,
    clock: Clock,
    last_backfill: Mutex<Option<BackfillReport>>,
}

impl SyncService {
    pub fn new(config: SyncConfig, store: Arc<dyn JudgmentStore>, api: Arc<dyn RegistryApi>) -> Self {
        let window = ServiceWindow::default();
        Self {
            registry: RegistryClient::new(Arc::clone(&api), config.retry_policy(), config.list_limit),
            tokens: TokenManager::new(api, config.credentials()),
            reconciler: Reconciler::new(Arc::clone(&store)),
            tracker: RunTracker::new(Arc::clone(&store), window, config.stale_after()),
            latch: SingleFlight::new(),
            clock: Arc::new(Utc::now),
            last_backfill: Mutex::new(None),
            window,
            store,
            config,
        }
    }

    /// Service backed by the live registry over HTTP.
    pub fn from_config(config: SyncConfig, store: Arc<dyn JudgmentStore>) -> Result<Self, RegistryError> {
        let api = HttpRegistry::new(config.registry_endpoints(), &config.http_client_config())?;
        Ok(Self::new(config, store, Arc::new(api)))
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn JudgmentStore> {
        &self.store
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    pub fn registry_available(&self) -> bool {
        self.window.is_available(self.now(), false)
    }

    /// Run a sync and wait for it to finish.
    pub async fn run_now(&self, force: bool) -> Result<RunOutcome, SyncError> {
        match self.admit(force).await? {
            Admission::Closed => Ok(RunOutcome::ServiceWindowClosed),
            Admission::Busy => Ok(RunOutcome::AlreadyRunning),
            Admission::Ready(_guard, handle) => Ok(RunOutcome::Finished(self.execute(handle).await?)),
        }
    }

    /// Open today's run and continue it in the background. Returns as soon
    /// as the run row is written; poll [`SyncService::status`] for the result.
    pub async fn trigger(self: &Arc<Self>, force: bool) -> Result<TriggerAck, SyncError> {
        let (guard, handle) = match self.admit(force).await? {
            Admission::Closed => return Ok(TriggerAck::ServiceWindowClosed),
            Admission::Busy => return Ok(TriggerAck::AlreadyRunning),
            Admission::Ready(guard, handle) => (guard, handle),
        };
        let ack = TriggerAck::Started {
            run_id: handle.run().run_id,
            sync_date: handle.run().sync_date,
        };
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let _guard = guard;
            if let Err(err) = service.execute(handle).await {
                error!(error = %err, "background sync run could not record its result");
            }
        });
        Ok(ack)
    }

    async fn admit(&self, force: bool) -> Result<Admission, SyncError> {
        let now = self.now();
        if !self.window.is_available(now, force || self.config.force_window) {
            info!(%now, "registry service window closed; sync not started");
            return Ok(Admission::Closed);
        }
        let Some(guard) = self.latch.try_acquire(RunKind::Sync) else {
            info!(active = ?self.latch.active(), "run already in progress; sync not started");
            return Ok(Admission::Busy);
        };
        match self.tracker.begin(now).await {
            Ok(handle) => Ok(Admission::Ready(guard, handle)),
            Err(SyncError::AlreadyRunning) => {
                warn!("another instance holds a fresh running row; sync not started");
                Ok(Admission::Busy)
            }
            Err(err) => Err(err),
        }
    }

    async fn execute(&self, handle: RunHandle) -> Result<SyncRun, SyncError> {
        let span = info_span!("sync_run", run_id = %handle.run().run_id, sync_date = %handle.run().sync_date);
        async move {
            let mut handle = handle;
            let mut counters = RunCounters::default();
            info!("sync run started");
            let result = self.sync_changed(&mut handle, &mut counters).await;
            let run = match result {
                Ok(()) => handle.finish(counters, SyncStatus::Completed, None, self.now()).await?,
                Err(err) => {
                    error!(error = %err, "sync run failed");
                    handle
                        .finish(counters, SyncStatus::Failed, Some(err.to_string()), self.now())
                        .await?
                }
            };
            info!(
                status = run.status.as_str(),
                total_fetched = run.counters.total_fetched,
                new_records = run.counters.new_records,
                updated_records = run.counters.updated_records,
                skipped_records = run.counters.skipped_records,
                errors = run.counters.errors,
                "sync run finished"
            );
            Ok(run)
        }
        .instrument(span)
        .await
    }

    async fn sync_changed(&self, handle: &mut RunHandle, counters: &mut RunCounters) -> Result<(), SyncError> {
        let token = self.tokens.get_token().await.map_err(SyncError::Auth)?;
        let ids = self
            .registry
            .list_changed_ids(&token, None)
            .await
            .map_err(SyncError::List)?;
        info!(count = ids.len(), "changed judgments listed");

        let progress_every = self.config.progress_every.max(1);
        for (index, jid) in ids.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.config.item_delay()).await;
            }
            let outcome = self.process_item(jid).await?;
            counters.record(outcome);
            if (index + 1) % progress_every == 0 {
                handle.record_progress(*counters, self.now()).await?;
            }
        }
        Ok(())
    }

    /// Detail, parse, classify, reconcile for one JID. Fetch failures and
    /// removals are item outcomes; auth and store failures end the run.
    pub(crate) async fn process_item(&self, jid: &str) -> Result<ItemOutcome, SyncError> {
        let token = self.tokens.get_token().await.map_err(SyncError::Auth)?;
        let raw = match self.registry.fetch_detail(&token, jid).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                debug!(jid, "judgment removed upstream; skipped");
                return Ok(ItemOutcome::Skipped);
            }
            Err(err) => {
                if err.invalidates_token() {
                    self.tokens.invalidate().await;
                }
                warn!(jid, error = %err, "detail fetch failed");
                return Ok(ItemOutcome::Error);
            }
        };
        let parsed = parse_judgment(&raw, jid);
        let outcome = self.reconciler.reconcile(parsed, self.now()).await?;
        debug!(jid, ?outcome, "judgment reconciled");
        Ok(outcome)
    }

    pub async fn status(&self) -> Result<ServiceStatus, StoreError> {
        let now = self.now();
        Ok(ServiceStatus {
            active_run: self.latch.active(),
            today: self.store.get_sync_run(self.window.local_date(now)).await?,
            recent_runs: self.store.recent_sync_runs(RECENT_RUNS).await?,
            registry_available: self.window.is_available(now, false),
            last_backfill: self.last_backfill(),
        })
    }

    pub async fn search(&self, query: &JudgmentQuery) -> Result<Page<JudgmentRecord>, StoreError> {
        self.store.search_judgments(query).await
    }

    pub async fn lookup(&self, external_id: &str) -> Result<Option<JudgmentRecord>, StoreError> {
        self.store.get_judgment(external_id).await
    }

    pub async fn stats(&self) -> Result<StatsReport, StoreError> {
        Ok(StatsReport {
            judgments: self.store.judgment_stats().await?,
            recent_runs: self.store.recent_sync_runs(RECENT_RUNS).await?,
        })
    }

    /// Stored judgments mentioning `company_name`, with per-risk counts.
    pub async fn company_profile(&self, company_name: &str) -> Result<CompanySearchResult, StoreError> {
        let company_name = company_name.trim().to_string();
        let base = JudgmentQuery {
            text: Some(company_name.clone()),
            per_page: COMPANY_RECENT_MATCHES,
            ..Default::default()
        };
        let recent = self.store.search_judgments(&base).await?;

        let mut by_risk_level = std::collections::BTreeMap::new();
        for risk in RiskLevel::ALL {
            let count = self
                .store
                .search_judgments(&JudgmentQuery {
                    risk_level: Some(risk),
                    per_page: 1,
                    ..base.clone()
                })
                .await?
                .total;
            by_risk_level.insert(risk, count);
        }
        let highest_risk = by_risk_level
            .iter()
            .rev()
            .find(|(_, count)| **count > 0)
            .map(|(risk, _)| *risk);

        Ok(CompanySearchResult {
            company_name,
            total_matches: recent.total,
            by_risk_level,
            highest_risk,
            recent: recent.items,
        })
    }

    pub fn last_backfill(&self) -> Option<BackfillReport> {
        self.last_backfill
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn remember_backfill(&self, report: &BackfillReport) {
        *self.last_backfill.lock().unwrap_or_else(PoisonError::into_inner) = Some(report.clone());
    }
}
