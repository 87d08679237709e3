use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use judsync_core::{RunCounters, ServiceWindow, SyncRun, SyncStatus};
use judsync_storage::JudgmentStore;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::SyncError;

const STALE_RUN_MESSAGE: &str = "superseded: run heartbeat went stale";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunKind {
    Sync,
    Backfill,
}

impl fmt::Display for RunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunKind::Sync => "sync",
            RunKind::Backfill => "backfill",
        })
    }
}

/// Process-wide "a run is active" latch shared by sync and backfill.
#[derive(Debug, Clone, Default)]
pub struct SingleFlight {
    active: Arc<Mutex<Option<RunKind>>>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` while another run holds the latch.
    pub fn try_acquire(&self, kind: RunKind) -> Option<RunGuard> {
        let mut active = self.lock();
        if active.is_some() {
            return None;
        }
        *active = Some(kind);
        Some(RunGuard {
            active: Arc::clone(&self.active),
            kind,
        })
    }

    pub fn active(&self) -> Option<RunKind> {
        *self.lock()
    }

    fn lock(&self) -> MutexGuard<'_, Option<RunKind>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases the latch on drop, including when the owning task panics.
#[derive(Debug)]
pub struct RunGuard {
    active: Arc<Mutex<Option<RunKind>>>,
    kind: RunKind,
}

impl RunGuard {
    pub fn kind(&self) -> RunKind {
        self.kind
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

/// Owns the one-row-per-day run log.
#[derive(Clone)]
pub struct RunTracker {
    store: Arc<dyn JudgmentStore>,
    window: ServiceWindow,
    stale_after: Duration,
}

impl RunTracker {
    pub fn new(store: Arc<dyn JudgmentStore>, window: ServiceWindow, stale_after: Duration) -> Self {
        Self {
            store,
            window,
            stale_after,
        }
    }

    /// Fails with [`SyncError::AlreadyRunning`] when a `running` row with a
    /// fresh heartbeat exists. Stale rows are closed as failed (or reset, for
    /// today's date) before today's row is written as `running`.
    pub async fn begin(&self, now: DateTime<Utc>) -> Result<RunHandle, SyncError> {
        self.ensure_idle(now).await?;
        let sync_date = self.window.local_date(now);
        let run = SyncRun::started(sync_date, Uuid::new_v4(), now);
        self.store.upsert_sync_run(&run).await?;
        info!(run_id = %run.run_id, %sync_date, "sync run row opened");
        Ok(RunHandle {
            store: Arc::clone(&self.store),
            run,
        })
    }

    /// Rejects when another instance holds a fresh `running` row and closes
    /// any stale ones.
    pub async fn ensure_idle(&self, now: DateTime<Utc>) -> Result<(), SyncError> {
        let running = self.store.running_sync_runs().await?;
        if running.iter().any(|run| !run.is_stale(now, self.stale_after)) {
            return Err(SyncError::AlreadyRunning);
        }
        for mut stale in running {
            warn!(
                run_id = %stale.run_id,
                sync_date = %stale.sync_date,
                heartbeat_at = %stale.heartbeat_at,
                "superseding stale running row"
            );
            stale.status = SyncStatus::Failed;
            stale.completed_at = Some(now);
            stale.error_message = Some(STALE_RUN_MESSAGE.to_string());
            self.store.upsert_sync_run(&stale).await?;
        }
        Ok(())
    }
}

/// A `running` row owned by the current process. Consumed by
/// [`RunHandle::finish`], so a run ends exactly once.
pub struct RunHandle {
    store: Arc<dyn JudgmentStore>,
    run: SyncRun,
}

impl RunHandle {
    pub fn run(&self) -> &SyncRun {
        &self.run
    }

    /// Persist cumulative counters and refresh the heartbeat.
    pub async fn record_progress(&mut self, counters: RunCounters, now: DateTime<Utc>) -> Result<(), SyncError> {
        self.run.counters = counters;
        self.run.heartbeat_at = now;
        self.store.upsert_sync_run(&self.run).await?;
        Ok(())
    }

    pub async fn finish(
        mut self,
        counters: RunCounters,
        status: SyncStatus,
        error_message: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<SyncRun, SyncError> {
        self.run.counters = counters;
        self.run.status = status;
        self.run.error_message = error_message;
        self.run.heartbeat_at = now;
        self.run.completed_at = Some(now);
        self.store.upsert_sync_run(&self.run).await?;
        Ok(self.run)
    }
}
