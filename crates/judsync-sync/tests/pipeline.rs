use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use judsync_adapters::{Credentials, DetailOutcome, RegistryApi, RegistryError};
use judsync_core::{
    CaseType, JudgmentQuery, JudgmentRecord, JudgmentStats, Page, ParsedJudgment, RiskLevel, SyncRun, SyncStatus,
};
use judsync_storage::{JudgmentStore, MemoryStore, StoreError};
use judsync_sync::{
    BackfillOptions, BackfillStop, CompanyBackfillOptions, RunKind, RunOutcome, SyncConfig, SyncService, TriggerAck,
};
use serde_json::{json, Value as JsonValue};
use tokio::sync::Notify;

enum Detail {
    Found(JsonValue),
    Removed,
    Status(u16),
}

#[derive(Default)]
struct Calls {
    auth: AtomicUsize,
    list: AtomicUsize,
    detail: AtomicUsize,
    search: AtomicUsize,
}

impl Calls {
    fn total(&self) -> usize {
        self.auth.load(Ordering::SeqCst)
            + self.list.load(Ordering::SeqCst)
            + self.detail.load(Ordering::SeqCst)
            + self.search.load(Ordering::SeqCst)
    }
}

/// Scripted registry that counts every upstream call.
#[derive(Default)]
struct FakeRegistry {
    list: JsonValue,
    search: JsonValue,
    details: HashMap<String, Detail>,
    fail_auth: bool,
    list_gate: Option<Arc<Notify>>,
    calls: Calls,
    detail_calls: Mutex<HashMap<String, usize>>,
}

impl FakeRegistry {
    fn with_list(ids: &[&str]) -> Self {
        Self {
            list: json!([{ "date": "2024-01-02", "list": ids }]),
            ..Default::default()
        }
    }

    fn detail(mut self, jid: &str, detail: Detail) -> Self {
        self.details.insert(jid.to_string(), detail);
        self
    }

    fn detail_calls_for(&self, jid: &str) -> usize {
        self.detail_calls.lock().unwrap().get(jid).copied().unwrap_or(0)
    }
}

#[async_trait]
impl RegistryApi for FakeRegistry {
    async fn authenticate(&self, credentials: &Credentials) -> Result<String, RegistryError> {
        self.calls.auth.fetch_add(1, Ordering::SeqCst);
        if self.fail_auth {
            return Err(RegistryError::Auth("invalid password".into()));
        }
        Ok(format!("token-for-{}", credentials.account))
    }

    async fn list_changed(&self, _token: &str) -> Result<JsonValue, RegistryError> {
        self.calls.list.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.list_gate {
            gate.notified().await;
        }
        Ok(self.list.clone())
    }

    async fn fetch_detail(&self, _token: &str, jid: &str) -> Result<DetailOutcome, RegistryError> {
        self.calls.detail.fetch_add(1, Ordering::SeqCst);
        *self.detail_calls.lock().unwrap().entry(jid.to_string()).or_default() += 1;
        match self.details.get(jid) {
            Some(Detail::Found(raw)) => Ok(DetailOutcome::Found(raw.clone())),
            Some(Detail::Status(status)) => Err(RegistryError::HttpStatus {
                status: *status,
                endpoint: "JDoc",
            }),
            Some(Detail::Removed) | None => Ok(DetailOutcome::NotFound),
        }
    }

    async fn search(&self, _token: &str, _keyword: &str, _limit: usize) -> Result<JsonValue, RegistryError> {
        self.calls.search.fetch_add(1, Ordering::SeqCst);
        Ok(self.search.clone())
    }
}

/// Memory store whose judgment writes always fail.
#[derive(Default)]
struct FailingStore {
    inner: MemoryStore,
}

#[async_trait]
impl JudgmentStore for FailingStore {
    async fn get_judgment(&self, external_id: &str) -> Result<Option<JudgmentRecord>, StoreError> {
        self.inner.get_judgment(external_id).await
    }

    async fn insert_judgment(&self, _record: &JudgmentRecord) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("connection reset".into()))
    }

    async fn update_judgment(&self, _record: &JudgmentRecord) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("connection reset".into()))
    }

    async fn search_judgments(&self, query: &JudgmentQuery) -> Result<Page<JudgmentRecord>, StoreError> {
        self.inner.search_judgments(query).await
    }

    async fn judgment_stats(&self) -> Result<JudgmentStats, StoreError> {
        self.inner.judgment_stats().await
    }

    async fn upsert_sync_run(&self, run: &SyncRun) -> Result<(), StoreError> {
        self.inner.upsert_sync_run(run).await
    }

    async fn get_sync_run(&self, sync_date: NaiveDate) -> Result<Option<SyncRun>, StoreError> {
        self.inner.get_sync_run(sync_date).await
    }

    async fn recent_sync_runs(&self, limit: usize) -> Result<Vec<SyncRun>, StoreError> {
        self.inner.recent_sync_runs(limit).await
    }

    async fn running_sync_runs(&self) -> Result<Vec<SyncRun>, StoreError> {
        self.inner.running_sync_runs().await
    }
}

/// 00:30 in Taipei.
fn inside_window() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 16, 30, 0).single().unwrap()
}

/// Noon in Taipei.
fn outside_window() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 4, 0, 0).single().unwrap()
}

fn config() -> SyncConfig {
    SyncConfig {
        account: "acct".into(),
        password: "secret".into(),
        item_delay_ms: 0,
        retry_base_ms: 1,
        max_retries: 2,
        progress_every: 2,
        ..SyncConfig::default()
    }
}

fn service(store: Arc<dyn JudgmentStore>, api: Arc<FakeRegistry>, now: DateTime<Utc>) -> Arc<SyncService> {
    Arc::new(SyncService::new(config(), store, api).with_clock(Arc::new(move || now)))
}

fn judgment(jid: &str, body: &str) -> JsonValue {
    json!({
        "JID": jid,
        "JYEAR": "112",
        "JCASE": "訴",
        "JNO": "1",
        "JDATE": "1130101",
        "JFULLX": { "JFULLCONTENT": format!("臺灣臺北地方法院民事判決\n原　告　甲\n被　告　乙\n主　文\n{body}") }
    })
}

fn fixture(name: &str) -> JsonValue {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/judicial")
        .join(name);
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

fn finished(outcome: RunOutcome) -> SyncRun {
    match outcome {
        RunOutcome::Finished(run) => run,
        other => panic!("expected a finished run, got {other:?}"),
    }
}

async fn wait_until_idle(service: &SyncService) {
    for _ in 0..500 {
        if service.status().await.unwrap().active_run.is_none() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("run never released the latch");
}

#[tokio::test]
async fn removed_items_are_skipped_not_errors() {
    let api = Arc::new(
        FakeRegistry::with_list(&["A", "B", "C"])
            .detail("A", Detail::Found(judgment("A", "請求返還借款")))
            .detail("B", Detail::Found(judgment("B", "請求返還押金")))
            .detail("C", Detail::Removed),
    );
    let store = Arc::new(MemoryStore::new());
    let run = finished(service(store.clone(), api, inside_window()).run_now(false).await.unwrap());

    assert_eq!(run.status, SyncStatus::Completed);
    assert_eq!(run.counters.total_fetched, 3);
    assert_eq!(run.counters.new_records, 2);
    assert_eq!(run.counters.errors, 0);
    assert_eq!(run.counters.skipped_records, 1);
    assert!(run.counters.is_conserved());
    assert_eq!(store.judgment_count().await, 2);
    assert!(store.get_judgment("C").await.unwrap().is_none());
    assert_eq!(store.get_sync_run(run.sync_date).await.unwrap(), Some(run));
}

#[tokio::test]
async fn rerun_over_unchanged_upstream_is_idempotent() {
    let api = Arc::new(
        FakeRegistry::with_list(&["A", "B"])
            .detail("A", Detail::Found(judgment("A", "詐欺")))
            .detail("B", Detail::Found(judgment("B", "違約"))),
    );
    let store = Arc::new(MemoryStore::new());
    let service = service(store.clone(), api, inside_window());

    let first = finished(service.run_now(false).await.unwrap());
    let before = store.search_judgments(&JudgmentQuery::default()).await.unwrap().items;
    let second = finished(service.run_now(false).await.unwrap());
    let after = store.search_judgments(&JudgmentQuery::default()).await.unwrap().items;

    assert_eq!(first.counters.new_records, 2);
    assert_eq!(second.counters.new_records, 0);
    assert_eq!(second.counters.updated_records, 2);
    assert_eq!(before, after);
    assert_eq!(store.judgment_count().await, 2);
    assert_eq!(store.sync_run_count().await, 1);
}

#[tokio::test]
async fn closed_window_makes_no_upstream_calls() {
    let api = Arc::new(FakeRegistry::with_list(&["A"]).detail("A", Detail::Found(judgment("A", "x"))));
    let store = Arc::new(MemoryStore::new());
    let service = service(store.clone(), api.clone(), outside_window());

    assert_eq!(service.run_now(false).await.unwrap(), RunOutcome::ServiceWindowClosed);
    assert_eq!(service.trigger(false).await.unwrap(), TriggerAck::ServiceWindowClosed);
    assert_eq!(api.calls.total(), 0);
    assert_eq!(store.sync_run_count().await, 0);

    let run = finished(service.run_now(true).await.unwrap());
    assert_eq!(run.status, SyncStatus::Completed);
    assert_eq!(run.counters.new_records, 1);
}

#[tokio::test]
async fn auth_failure_fails_the_run_before_any_fetch() {
    let api = Arc::new(FakeRegistry {
        fail_auth: true,
        ..FakeRegistry::with_list(&["A"])
    });
    let store = Arc::new(MemoryStore::new());
    let run = finished(service(store, api.clone(), inside_window()).run_now(false).await.unwrap());

    assert_eq!(run.status, SyncStatus::Failed);
    assert!(run.error_message.unwrap().contains("authentication"));
    assert!(run.completed_at.is_some());
    assert_eq!(api.calls.list.load(Ordering::SeqCst), 0);
    assert_eq!(api.calls.detail.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn exhausted_retries_count_as_errors_and_the_batch_continues() {
    let api = Arc::new(
        FakeRegistry::with_list(&["A", "B", "C"])
            .detail("A", Detail::Found(judgment("A", "x")))
            .detail("B", Detail::Status(503))
            .detail("C", Detail::Found(judgment("C", "y"))),
    );
    let store = Arc::new(MemoryStore::new());
    let run = finished(service(store.clone(), api.clone(), inside_window()).run_now(false).await.unwrap());

    assert_eq!(run.status, SyncStatus::Completed);
    assert_eq!(run.counters.errors, 1);
    assert_eq!(run.counters.new_records, 2);
    assert!(run.counters.is_conserved());
    assert_eq!(api.detail_calls_for("B"), 3);
    assert_eq!(store.judgment_count().await, 2);
}

#[tokio::test]
async fn rejected_token_is_dropped_and_the_next_item_logs_in_again() {
    let api = Arc::new(
        FakeRegistry::with_list(&["A", "B"])
            .detail("A", Detail::Status(401))
            .detail("B", Detail::Found(judgment("B", "y"))),
    );
    let store = Arc::new(MemoryStore::new());
    let run = finished(service(store.clone(), api.clone(), inside_window()).run_now(false).await.unwrap());

    assert_eq!(run.status, SyncStatus::Completed);
    assert_eq!(run.counters.errors, 1);
    assert_eq!(run.counters.new_records, 1);
    assert_eq!(api.detail_calls_for("A"), 1);
    assert_eq!(api.calls.auth.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn persistence_failure_fails_the_whole_run() {
    let api = Arc::new(
        FakeRegistry::with_list(&["A", "B"])
            .detail("A", Detail::Found(judgment("A", "x")))
            .detail("B", Detail::Found(judgment("B", "y"))),
    );
    let store = Arc::new(FailingStore::default());
    let run = finished(service(store.clone(), api.clone(), inside_window()).run_now(false).await.unwrap());

    assert_eq!(run.status, SyncStatus::Failed);
    assert!(run.error_message.unwrap().contains("connection reset"));
    assert_eq!(api.detail_calls_for("B"), 0);
    assert_eq!(store.inner.sync_run_count().await, 1);
}

#[tokio::test]
async fn fixtures_are_classified_by_keyword_hits() {
    let api = Arc::new(
        FakeRegistry::with_list(&["FRAUD", "CIVIL"])
            .detail("FRAUD", Detail::Found(fixture("jdoc_criminal_fraud.json")))
            .detail("CIVIL", Detail::Found(fixture("jdoc_civil.json"))),
    );
    let store = Arc::new(MemoryStore::new());
    finished(service(store.clone(), api, inside_window()).run_now(false).await.unwrap());

    let fraud = store.get_judgment("FRAUD").await.unwrap().unwrap();
    assert_eq!(fraud.risk_level, RiskLevel::High);
    assert_eq!(fraud.case_type, CaseType::Criminal);
    assert_eq!(fraud.judgment_date, NaiveDate::from_ymd_opt(2024, 1, 1));

    let civil = store.get_judgment("CIVIL").await.unwrap().unwrap();
    assert_eq!(civil.risk_level, RiskLevel::Medium);
    assert_eq!(civil.case_type, CaseType::Civil);
}

#[tokio::test]
async fn second_trigger_while_running_is_rejected() {
    let gate = Arc::new(Notify::new());
    let api = Arc::new(FakeRegistry {
        list_gate: Some(gate.clone()),
        ..FakeRegistry::with_list(&["A"]).detail("A", Detail::Found(judgment("A", "x")))
    });
    let store = Arc::new(MemoryStore::new());
    let service = service(store.clone(), api, inside_window());

    let first = service.trigger(false).await.unwrap();
    assert!(matches!(first, TriggerAck::Started { .. }));
    assert_eq!(service.trigger(false).await.unwrap(), TriggerAck::AlreadyRunning);
    assert_eq!(service.status().await.unwrap().active_run, Some(RunKind::Sync));

    let backfill = service.backfill_batches(&BackfillOptions::default()).await.unwrap();
    assert_eq!(backfill.stopped, BackfillStop::AlreadyRunning);

    gate.notify_one();
    wait_until_idle(&service).await;

    assert_eq!(store.sync_run_count().await, 1);
    let status = service.status().await.unwrap();
    let today = status.today.unwrap();
    assert_eq!(today.status, SyncStatus::Completed);
    assert_eq!(today.counters.new_records, 1);
    assert_eq!(status.recent_runs.len(), 1);
}

#[tokio::test]
async fn batch_backfill_skips_stored_ids_and_stops_when_exhausted() {
    let ids = ["A", "B", "C", "D", "E"];
    let mut registry = FakeRegistry::with_list(&ids);
    for jid in ids {
        registry = registry.detail(jid, Detail::Found(judgment(jid, "x")));
    }
    let api = Arc::new(registry);
    let store = Arc::new(MemoryStore::new());
    let existing = ParsedJudgment {
        jid: "A".into(),
        case_number: None,
        judgment_date: None,
        case_type: CaseType::Other,
        court_name: None,
        full_text: None,
        parties: None,
        summary: None,
        raw_payload: json!({}),
    };
    store
        .insert_judgment(&JudgmentRecord::from_parsed(existing, RiskLevel::Low, inside_window()))
        .await
        .unwrap();

    let service = service(store.clone(), api.clone(), inside_window());
    let report = service
        .backfill_batches(&BackfillOptions {
            batch_size: 2,
            max_batches: 5,
            batch_delay: Duration::ZERO,
            item_delay: Duration::ZERO,
            force: false,
            refresh_existing: false,
        })
        .await
        .unwrap();

    assert_eq!(report.stopped, BackfillStop::Exhausted);
    assert_eq!(report.stats.batches, 3);
    assert_eq!(report.stats.processed, 5);
    assert_eq!(report.stats.new_records, 4);
    assert_eq!(report.stats.skipped, 1);
    assert_eq!(api.detail_calls_for("A"), 0);
    assert_eq!(store.judgment_count().await, 5);
    assert_eq!(service.status().await.unwrap().last_backfill, Some(report));
}

#[tokio::test]
async fn company_backfill_ingests_search_results_and_profiles_them() {
    let api = Arc::new(FakeRegistry {
        search: json!(["FRAUD", "CIVIL"]),
        ..FakeRegistry::default()
            .detail("FRAUD", Detail::Found(fixture("jdoc_criminal_fraud.json")))
            .detail("CIVIL", Detail::Found(fixture("jdoc_civil.json")))
    });
    let store = Arc::new(MemoryStore::new());
    let service = service(store, api.clone(), outside_window());

    let report = service
        .backfill_company(&CompanyBackfillOptions {
            company_name: "光明科技股份有限公司".into(),
            max_records: 10,
            item_delay: Duration::ZERO,
            force: true,
        })
        .await
        .unwrap();

    assert_eq!(report.report.stats.new_records, 2);
    assert_eq!(api.calls.list.load(Ordering::SeqCst), 0);
    let profile = report.profile.unwrap();
    assert_eq!(profile.total_matches, 2);
    assert_eq!(profile.highest_risk, Some(RiskLevel::High));
    assert_eq!(profile.by_risk_level.get(&RiskLevel::Medium), Some(&1));
    assert_eq!(profile.recent.len(), 2);
}
