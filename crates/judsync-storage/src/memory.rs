use std::collections::BTreeMap;
use std::cmp::Reverse;

use async_trait::async_trait;
use chrono::NaiveDate;
use judsync_core::{
    JudgmentQuery, JudgmentRecord, JudgmentStats, Page, SyncRun, SyncStatus,
};
use tokio::sync::RwLock;

use crate::{JudgmentStore, StoreError};

/// Process-local store used by tests and by the CLI when no database is
/// configured.
#[derive(Debug, Default)]
pub struct MemoryStore {
    judgments: RwLock<BTreeMap<String, JudgmentRecord>>,
    runs: RwLock<BTreeMap<NaiveDate, SyncRun>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn judgment_count(&self) -> usize {
        self.judgments.read().await.len()
    }

    pub async fn sync_run_count(&self) -> usize {
        self.runs.read().await.len()
    }
}

#[async_trait]
impl JudgmentStore for MemoryStore {
    async fn get_judgment(&self, external_id: &str) -> Result<Option<JudgmentRecord>, StoreError> {
        Ok(self.judgments.read().await.get(external_id).cloned())
    }

    async fn insert_judgment(&self, record: &JudgmentRecord) -> Result<(), StoreError> {
        let mut judgments = self.judgments.write().await;
        if judgments.contains_key(&record.external_id) {
            return Err(StoreError::Duplicate(record.external_id.clone()));
        }
        judgments.insert(record.external_id.clone(), record.clone());
        Ok(())
    }

    async fn update_judgment(&self, record: &JudgmentRecord) -> Result<(), StoreError> {
        let mut judgments = self.judgments.write().await;
        match judgments.get_mut(&record.external_id) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(StoreError::Missing(record.external_id.clone())),
        }
    }

    async fn judgment_exists(&self, external_id: &str) -> Result<bool, StoreError> {
        Ok(self.judgments.read().await.contains_key(external_id))
    }

    async fn search_judgments(&self, query: &JudgmentQuery) -> Result<Page<JudgmentRecord>, StoreError> {
        let judgments = self.judgments.read().await;
        let mut matched = judgments
            .values()
            .filter(|record| query.matches(record))
            .collect::<Vec<_>>();
        matched.sort_by_key(|record| {
            (
                record.judgment_date.is_none(),
                Reverse(record.judgment_date),
                record.external_id.clone(),
            )
        });

        let total = matched.len();
        let per_page = query.normalized_per_page();
        let items = matched
            .into_iter()
            .skip(query.offset())
            .take(per_page)
            .cloned()
            .collect();
        Ok(Page::new(items, total, query.normalized_page(), per_page))
    }

    async fn judgment_stats(&self) -> Result<JudgmentStats, StoreError> {
        let judgments = self.judgments.read().await;
        let mut stats = JudgmentStats::default();
        for record in judgments.values() {
            stats.total += 1;
            *stats.by_risk_level.entry(record.risk_level).or_default() += 1;
            *stats.by_case_type.entry(record.case_type).or_default() += 1;
        }
        Ok(stats)
    }

    async fn upsert_sync_run(&self, run: &SyncRun) -> Result<(), StoreError> {
        self.runs.write().await.insert(run.sync_date, run.clone());
        Ok(())
    }

    async fn get_sync_run(&self, sync_date: NaiveDate) -> Result<Option<SyncRun>, StoreError> {
        Ok(self.runs.read().await.get(&sync_date).cloned())
    }

    async fn recent_sync_runs(&self, limit: usize) -> Result<Vec<SyncRun>, StoreError> {
        Ok(self
            .runs
            .read()
            .await
            .values()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn running_sync_runs(&self) -> Result<Vec<SyncRun>, StoreError> {
        Ok(self
            .runs
            .read()
            .await
            .values()
            .filter(|run| run.status == SyncStatus::Running)
            .cloned()
            .collect())
    }
}
