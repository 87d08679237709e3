use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use judsync_core::{BackfillStats, CompanySearchResult, ItemOutcome};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};

use crate::{RunKind, SyncError, SyncService};

#[derive(Debug, Clone)]
pub struct BackfillOptions {
    pub batch_size: usize,
    pub max_batches: u32,
    pub batch_delay: Duration,
    pub item_delay: Duration,
    pub force: bool,
    /// Re-fetch identifiers that are already stored instead of skipping them.
    pub refresh_existing: bool,
}

impl Default for BackfillOptions {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_batches: 10,
            batch_delay: Duration::from_secs(5),
            item_delay: Duration::from_millis(1000),
            force: false,
            refresh_existing: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompanyBackfillOptions {
    pub company_name: String,
    pub max_records: usize,
    pub item_delay: Duration,
    pub force: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackfillStop {
    /// Every configured batch ran.
    BatchLimit,
    /// A batch found no identifiers not already handled.
    Exhausted,
    ServiceWindowClosed,
    AlreadyRunning,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackfillReport {
    pub mode: String,
    pub stats: BackfillStats,
    pub stopped: BackfillStop,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompanyBackfillReport {
    pub report: BackfillReport,
    pub profile: Option<CompanySearchResult>,
}

impl SyncService {
    /// Walk the registry list batch by batch, skipping identifiers already
    /// stored unless `refresh_existing` is set. Only one backfill or sync runs
    /// at a time.
    pub async fn backfill_batches(&self, options: &BackfillOptions) -> Result<BackfillReport, SyncError> {
        let started_at = self.now();
        let mode = "batch";
        if !self.window_open(options.force) {
            return Ok(self.early_report(mode, BackfillStop::ServiceWindowClosed, started_at));
        }
        let Some(_guard) = self.latch.try_acquire(RunKind::Backfill) else {
            return Ok(self.early_report(mode, BackfillStop::AlreadyRunning, started_at));
        };
        match self.tracker.ensure_idle(started_at).await {
            Err(SyncError::AlreadyRunning) => return Ok(self.early_report(mode, BackfillStop::AlreadyRunning, started_at)),
            other => other?,
        }

        let span = info_span!("backfill", mode, batch_size = options.batch_size, max_batches = options.max_batches);
        let (stats, stopped) = self.run_batches(options).instrument(span).await?;
        let report = BackfillReport {
            mode: mode.to_string(),
            stats,
            stopped,
            started_at,
            finished_at: self.now(),
        };
        self.remember_backfill(&report);
        Ok(report)
    }

    async fn run_batches(&self, options: &BackfillOptions) -> Result<(BackfillStats, BackfillStop), SyncError> {
        let batch_size = options.batch_size.max(1);
        let mut stats = BackfillStats::default();
        let mut seen = HashSet::new();

        for batch in 0..options.max_batches {
            if batch > 0 {
                tokio::time::sleep(options.batch_delay).await;
                if !self.window_open(options.force) {
                    warn!(batch, "service window closed mid-backfill; stopping");
                    return Ok((stats, BackfillStop::ServiceWindowClosed));
                }
            }

            let token = self.tokens.get_token().await.map_err(SyncError::Auth)?;
            let listed = self
                .registry
                .list_changed_ids(&token, Some(seen.len() + batch_size))
                .await
                .map_err(SyncError::List)?;
            let fresh = listed
                .into_iter()
                .filter(|jid| !seen.contains(jid))
                .take(batch_size)
                .collect::<Vec<_>>();
            if fresh.is_empty() {
                info!(batch, "no unseen identifiers left; backfill exhausted");
                return Ok((stats, BackfillStop::Exhausted));
            }

            stats.batches += 1;
            for (index, jid) in fresh.iter().enumerate() {
                seen.insert(jid.clone());
                if !options.refresh_existing && self.store.judgment_exists(jid).await? {
                    stats.record(ItemOutcome::Skipped);
                    continue;
                }
                if index > 0 {
                    tokio::time::sleep(options.item_delay).await;
                }
                stats.record(self.process_item(jid).await?);
            }
            info!(
                batch = stats.batches,
                processed = stats.processed,
                new_records = stats.new_records,
                updated_records = stats.updated_records,
                skipped = stats.skipped,
                errors = stats.errors,
                "backfill batch finished"
            );
        }
        Ok((stats, BackfillStop::BatchLimit))
    }

    /// Ingest the registry's search results for `company_name`, then profile
    /// what the store holds for it.
    pub async fn backfill_company(&self, options: &CompanyBackfillOptions) -> Result<CompanyBackfillReport, SyncError> {
        let started_at = self.now();
        let mode = "company";
        let early = |stop| CompanyBackfillReport {
            report: self.early_report(mode, stop, started_at),
            profile: None,
        };
        if !self.window_open(options.force) {
            return Ok(early(BackfillStop::ServiceWindowClosed));
        }
        let Some(_guard) = self.latch.try_acquire(RunKind::Backfill) else {
            return Ok(early(BackfillStop::AlreadyRunning));
        };
        match self.tracker.ensure_idle(started_at).await {
            Err(SyncError::AlreadyRunning) => return Ok(early(BackfillStop::AlreadyRunning)),
            other => other?,
        }

        let span = info_span!("backfill", mode, company = %options.company_name);
        let stats = self.run_company(options).instrument(span).await?;
        let report = BackfillReport {
            mode: mode.to_string(),
            stats,
            stopped: BackfillStop::Exhausted,
            started_at,
            finished_at: self.now(),
        };
        self.remember_backfill(&report);
        let profile = self.company_profile(&options.company_name).await?;
        Ok(CompanyBackfillReport {
            report,
            profile: Some(profile),
        })
    }

    async fn run_company(&self, options: &CompanyBackfillOptions) -> Result<BackfillStats, SyncError> {
        let token = self.tokens.get_token().await.map_err(SyncError::Auth)?;
        let ids = self
            .registry
            .search_ids(&token, options.company_name.trim(), options.max_records)
            .await
            .map_err(SyncError::List)?;
        info!(count = ids.len(), "company search returned identifiers");

        let mut stats = BackfillStats {
            batches: 1,
            ..Default::default()
        };
        for (index, jid) in ids.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(options.item_delay).await;
            }
            stats.record(self.process_item(jid).await?);
        }
        Ok(stats)
    }

    fn window_open(&self, force: bool) -> bool {
        self.window.is_available(self.now(), force || self.config.force_window)
    }

    fn early_report(&self, mode: &str, stopped: BackfillStop, started_at: DateTime<Utc>) -> BackfillReport {
        info!(mode, ?stopped, "backfill not started");
        BackfillReport {
            mode: mode.to_string(),
            stats: BackfillStats::default(),
            stopped,
            started_at,
            finished_at: started_at,
        }
    }
}
