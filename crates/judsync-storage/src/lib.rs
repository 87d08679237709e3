//! Keyed judgment/run storage plus the shared HTTP retry policy.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use judsync_core::{JudgmentQuery, JudgmentRecord, JudgmentStats, Page, SyncRun};
use rand::Rng;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::warn;

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "judsync-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("judgment {0} already exists")]
    Duplicate(String),
    #[error("judgment {0} does not exist")]
    Missing(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Persistence seam for judgments (keyed by external id) and sync runs
/// (keyed by calendar date).
#[async_trait]
pub trait JudgmentStore: Send + Sync {
    async fn get_judgment(&self, external_id: &str) -> Result<Option<JudgmentRecord>, StoreError>;

    /// Fails with [`StoreError::Duplicate`] when the id is already present.
    async fn insert_judgment(&self, record: &JudgmentRecord) -> Result<(), StoreError>;

    /// Fails with [`StoreError::Missing`] when the id is not present.
    async fn update_judgment(&self, record: &JudgmentRecord) -> Result<(), StoreError>;

    async fn judgment_exists(&self, external_id: &str) -> Result<bool, StoreError> {
        Ok(self.get_judgment(external_id).await?.is_some())
    }

    /// Ordered by judgment date (newest first, undated last), then id.
    async fn search_judgments(&self, query: &JudgmentQuery) -> Result<Page<JudgmentRecord>, StoreError>;

    async fn judgment_stats(&self) -> Result<JudgmentStats, StoreError>;

    /// Insert-or-update on `sync_date`; never creates a second row for a day.
    async fn upsert_sync_run(&self, run: &SyncRun) -> Result<(), StoreError>;

    async fn get_sync_run(&self, sync_date: NaiveDate) -> Result<Option<SyncRun>, StoreError>;

    /// Newest first.
    async fn recent_sync_runs(&self, limit: usize) -> Result<Vec<SyncRun>, StoreError>;

    async fn running_sync_runs(&self) -> Result<Vec<SyncRun>, StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else if let Some(status) = err.status() {
        classify_status(status)
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Bounded exponential backoff shared by every registry call site.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub multiplier: u32,
    pub max_delay: Duration,
    /// Upper bound of the uniform random delay added to each backoff.
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            multiplier: 2,
            max_delay: Duration::from_secs(30),
            jitter: Duration::ZERO,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let exponent = u32::try_from(attempt_index).unwrap_or(u32::MAX);
        let factor = self.multiplier.max(1).checked_pow(exponent).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    fn with_jitter(&self, delay: Duration) -> Duration {
        let bound = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        if bound == 0 {
            return delay;
        }
        let extra = rand::thread_rng().gen_range(0..=bound);
        delay.saturating_add(Duration::from_millis(extra))
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// retry budget is spent. `op` receives the zero-based attempt index.
    pub async fn retry<T, E, F, Fut, P>(&self, label: &str, is_retryable: P, mut op: F) -> Result<T, E>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let mut attempt = 0usize;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.max_retries && is_retryable(&err) => {
                    let delay = self.with_jitter(self.delay_for_attempt(attempt));
                    warn!(
                        label,
                        attempt = attempt + 1,
                        max_retries = self.max_retries,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "transient failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl HttpClientConfig {
    pub fn build_client(&self) -> Result<reqwest::Client, reqwest::Error> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(self.timeout);
        if let Some(user_agent) = &self.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        builder.build()
    }
}
