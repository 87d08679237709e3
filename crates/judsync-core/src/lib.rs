//! Core domain model for judgment synchronization and risk classification.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Offset, Timelike, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "judsync-core";

/// Registry local time (Asia/Taipei, no DST) as seconds east of UTC.
pub const REGISTRY_UTC_OFFSET_SECS: i32 = 8 * 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaseType {
    Civil,
    Criminal,
    Administrative,
    Other,
}

impl CaseType {
    pub const ALL: [CaseType; 4] = [
        CaseType::Civil,
        CaseType::Criminal,
        CaseType::Administrative,
        CaseType::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CaseType::Civil => "civil",
            CaseType::Criminal => "criminal",
            CaseType::Administrative => "administrative",
            CaseType::Other => "other",
        }
    }
}

impl fmt::Display for CaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CaseType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "civil" => Ok(CaseType::Civil),
            "criminal" => Ok(CaseType::Criminal),
            "administrative" => Ok(CaseType::Administrative),
            "other" => Ok(CaseType::Other),
            _ => Err(UnknownVariant(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub const ALL: [RiskLevel; 3] = [RiskLevel::Low, RiskLevel::Medium, RiskLevel::High];

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LOW" => Ok(RiskLevel::Low),
            "MEDIUM" => Ok(RiskLevel::Medium),
            "HIGH" => Ok(RiskLevel::High),
            _ => Err(UnknownVariant(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant(pub String);

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown variant {:?}", self.0)
    }
}

impl std::error::Error for UnknownVariant {}

/// Normalized detail payload handed from the parser into reconciliation.
///
/// Every field other than `jid` and `case_type` is optional: a field that is
/// absent or malformed upstream is `None`, never a parse failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedJudgment {
    pub jid: String,
    pub case_number: Option<String>,
    pub judgment_date: Option<NaiveDate>,
    pub case_type: CaseType,
    pub court_name: Option<String>,
    pub full_text: Option<String>,
    pub parties: Option<String>,
    pub summary: Option<String>,
    pub raw_payload: serde_json::Value,
}

/// Persisted judgment keyed by the registry's JID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgmentRecord {
    pub external_id: String,
    pub case_number: Option<String>,
    pub judgment_date: Option<NaiveDate>,
    pub case_type: CaseType,
    pub court_name: Option<String>,
    pub full_text: Option<String>,
    pub parties: Option<String>,
    pub summary: Option<String>,
    pub risk_level: RiskLevel,
    pub raw_payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JudgmentRecord {
    pub fn from_parsed(parsed: ParsedJudgment, risk_level: RiskLevel, now: DateTime<Utc>) -> Self {
        Self {
            external_id: parsed.jid,
            case_number: parsed.case_number,
            judgment_date: parsed.judgment_date,
            case_type: parsed.case_type,
            court_name: parsed.court_name,
            full_text: parsed.full_text,
            parties: parsed.parties,
            summary: parsed.summary,
            risk_level,
            raw_payload: parsed.raw_payload,
            created_at: now,
            updated_at: now,
        }
    }

    /// Overwrite every derived field in place. `created_at` is kept and
    /// `updated_at` never moves backwards.
    pub fn apply_update(&mut self, parsed: ParsedJudgment, risk_level: RiskLevel, now: DateTime<Utc>) {
        self.case_number = parsed.case_number;
        self.judgment_date = parsed.judgment_date;
        self.case_type = parsed.case_type;
        self.court_name = parsed.court_name;
        self.full_text = parsed.full_text;
        self.parties = parsed.parties;
        self.summary = parsed.summary;
        self.risk_level = risk_level;
        self.raw_payload = parsed.raw_payload;
        self.updated_at = now.max(self.updated_at).max(self.created_at);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Running,
    Completed,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Running => "running",
            SyncStatus::Completed => "completed",
            SyncStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, SyncStatus::Running)
    }
}

impl FromStr for SyncStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(SyncStatus::Running),
            "completed" => Ok(SyncStatus::Completed),
            "failed" => Ok(SyncStatus::Failed),
            _ => Err(UnknownVariant(s.to_string())),
        }
    }
}

/// Terminal outcome of processing one identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemOutcome {
    New,
    Updated,
    Skipped,
    Error,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    pub total_fetched: i64,
    pub new_records: i64,
    pub updated_records: i64,
    pub skipped_records: i64,
    pub errors: i64,
}

impl RunCounters {
    pub fn record(&mut self, outcome: ItemOutcome) {
        self.total_fetched += 1;
        match outcome {
            ItemOutcome::New => self.new_records += 1,
            ItemOutcome::Updated => self.updated_records += 1,
            ItemOutcome::Skipped => self.skipped_records += 1,
            ItemOutcome::Error => self.errors += 1,
        }
    }

    pub fn merge(&mut self, other: &RunCounters) {
        self.total_fetched += other.total_fetched;
        self.new_records += other.new_records;
        self.updated_records += other.updated_records;
        self.skipped_records += other.skipped_records;
        self.errors += other.errors;
    }

    /// `total_fetched = new + updated + skipped + errors`.
    pub fn is_conserved(&self) -> bool {
        self.total_fetched
            == self.new_records + self.updated_records + self.skipped_records + self.errors
    }
}

/// One row per calendar day (registry local time).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRun {
    pub sync_date: NaiveDate,
    pub run_id: Uuid,
    pub status: SyncStatus,
    pub counters: RunCounters,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub heartbeat_at: DateTime<Utc>,
    pub error_message: Option<String>,
}

impl SyncRun {
    pub fn started(sync_date: NaiveDate, run_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            sync_date,
            run_id,
            status: SyncStatus::Running,
            counters: RunCounters::default(),
            started_at: now,
            completed_at: None,
            heartbeat_at: now,
            error_message: None,
        }
    }

    /// A `running` row whose heartbeat is older than `threshold` is treated as
    /// left behind by a crashed process.
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.status == SyncStatus::Running && now - self.heartbeat_at > threshold
    }
}

/// Running totals for a historical backfill across all of its batches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillStats {
    pub batches: u32,
    pub processed: i64,
    pub new_records: i64,
    pub updated_records: i64,
    pub skipped: i64,
    pub errors: i64,
}

impl BackfillStats {
    pub fn record(&mut self, outcome: ItemOutcome) {
        self.processed += 1;
        match outcome {
            ItemOutcome::New => self.new_records += 1,
            ItemOutcome::Updated => self.updated_records += 1,
            ItemOutcome::Skipped => self.skipped += 1,
            ItemOutcome::Error => self.errors += 1,
        }
    }
}

/// Daily window during which the upstream registry accepts requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceWindow {
    /// Inclusive start hour in registry local time.
    pub start_hour: u32,
    /// Exclusive end hour in registry local time.
    pub end_hour: u32,
    pub utc_offset_secs: i32,
}

impl Default for ServiceWindow {
    fn default() -> Self {
        Self {
            start_hour: 0,
            end_hour: 6,
            utc_offset_secs: REGISTRY_UTC_OFFSET_SECS,
        }
    }
}

impl ServiceWindow {
    fn offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_secs).unwrap_or_else(|| Utc.fix())
    }

    pub fn is_available(&self, now: DateTime<Utc>, force_override: bool) -> bool {
        if force_override {
            return true;
        }
        let hour = now.with_timezone(&self.offset()).hour();
        if self.start_hour <= self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }

    /// Calendar day in registry local time; sync runs are keyed by it.
    pub fn local_date(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.offset()).date_naive()
    }
}

/// Search parameters over stored judgments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JudgmentQuery {
    pub text: Option<String>,
    pub risk_level: Option<RiskLevel>,
    pub case_type: Option<CaseType>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    pub page: usize,
    pub per_page: usize,
}

impl JudgmentQuery {
    pub const MAX_PER_PAGE: usize = 100;

    pub fn normalized_page(&self) -> usize {
        self.page.max(1)
    }

    pub fn normalized_per_page(&self) -> usize {
        if self.per_page == 0 {
            20
        } else {
            self.per_page.min(Self::MAX_PER_PAGE)
        }
    }

    pub fn offset(&self) -> usize {
        (self.normalized_page() - 1) * self.normalized_per_page()
    }

    pub fn matches(&self, record: &JudgmentRecord) -> bool {
        if let Some(risk) = self.risk_level {
            if record.risk_level != risk {
                return false;
            }
        }
        if let Some(case_type) = self.case_type {
            if record.case_type != case_type {
                return false;
            }
        }
        if self.date_from.is_some() || self.date_to.is_some() {
            let Some(date) = record.judgment_date else {
                return false;
            };
            if self.date_from.is_some_and(|from| date < from) {
                return false;
            }
            if self.date_to.is_some_and(|to| date > to) {
                return false;
            }
        }
        match self.text.as_deref().map(str::trim) {
            Some(needle) if !needle.is_empty() => [
                record.case_number.as_deref(),
                record.court_name.as_deref(),
                record.parties.as_deref(),
                record.full_text.as_deref(),
            ]
            .into_iter()
            .flatten()
            .any(|haystack| haystack.contains(needle)),
            _ => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub page: usize,
    pub per_page: usize,
    pub total_pages: usize,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: usize, page: usize, per_page: usize) -> Self {
        let per_page = per_page.max(1);
        Self {
            items,
            total,
            page,
            per_page,
            total_pages: total.max(1).div_ceil(per_page),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JudgmentStats {
    pub total: i64,
    pub by_risk_level: BTreeMap<RiskLevel, i64>,
    pub by_case_type: BTreeMap<CaseType, i64>,
}

/// Query-time projection over judgments matching a company name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanySearchResult {
    pub company_name: String,
    pub total_matches: usize,
    pub by_risk_level: BTreeMap<RiskLevel, usize>,
    pub highest_risk: Option<RiskLevel>,
    pub recent: Vec<JudgmentRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).single().unwrap()
    }

    #[test]
    fn service_window_uses_registry_local_time() {
        let window = ServiceWindow::default();
        // 16:30 UTC is 00:30 in Taipei.
        assert!(window.is_available(utc(2024, 1, 1, 16, 30), false));
        // 21:59 UTC is 05:59 in Taipei.
        assert!(window.is_available(utc(2024, 1, 1, 21, 59), false));
        // 22:00 UTC is 06:00 in Taipei, outside the window.
        assert!(!window.is_available(utc(2024, 1, 1, 22, 0), false));
        assert!(!window.is_available(utc(2024, 1, 1, 4, 0), false));
    }

    #[test]
    fn force_override_opens_the_window() {
        let window = ServiceWindow::default();
        assert!(window.is_available(utc(2024, 1, 1, 4, 0), true));
    }

    #[test]
    fn local_date_rolls_over_at_registry_midnight() {
        let window = ServiceWindow::default();
        assert_eq!(
            window.local_date(utc(2024, 1, 1, 16, 0)),
            NaiveDate::from_ymd_opt(2024, 1, 2).unwrap()
        );
        assert_eq!(
            window.local_date(utc(2024, 1, 1, 15, 59)),
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
        );
    }

    #[test]
    fn counters_stay_conserved() {
        let mut counters = RunCounters::default();
        for outcome in [
            ItemOutcome::New,
            ItemOutcome::New,
            ItemOutcome::Skipped,
            ItemOutcome::Error,
            ItemOutcome::Updated,
        ] {
            counters.record(outcome);
        }
        assert_eq!(counters.total_fetched, 5);
        assert_eq!(counters.new_records, 2);
        assert!(counters.is_conserved());
    }

    #[test]
    fn apply_update_keeps_created_at_and_never_rewinds_updated_at() {
        let created = utc(2024, 1, 2, 0, 0);
        let parsed = ParsedJudgment {
            jid: "TPDV,112,訴,1,20240101,1".into(),
            case_number: None,
            judgment_date: None,
            case_type: CaseType::Civil,
            court_name: None,
            full_text: Some("text".into()),
            parties: None,
            summary: None,
            raw_payload: serde_json::json!({}),
        };
        let mut record = JudgmentRecord::from_parsed(parsed.clone(), RiskLevel::Low, created);
        record.apply_update(parsed, RiskLevel::High, utc(2024, 1, 1, 0, 0));
        assert_eq!(record.created_at, created);
        assert_eq!(record.updated_at, created);
        assert_eq!(record.risk_level, RiskLevel::High);
    }

    #[test]
    fn stale_detection_only_applies_to_running_rows() {
        let start = utc(2024, 1, 1, 16, 0);
        let mut run = SyncRun::started(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(), Uuid::new_v4(), start);
        let later = start + Duration::minutes(45);
        assert!(run.is_stale(later, Duration::minutes(30)));
        run.status = SyncStatus::Completed;
        assert!(!run.is_stale(later, Duration::minutes(30)));
    }

    #[test]
    fn risk_level_and_case_type_round_trip_through_strings() {
        assert_eq!("high".parse::<RiskLevel>().unwrap(), RiskLevel::High);
        assert_eq!("Criminal".parse::<CaseType>().unwrap(), CaseType::Criminal);
        assert!("severe".parse::<RiskLevel>().is_err());
        assert_eq!(serde_json::to_string(&RiskLevel::Medium).unwrap(), "\"MEDIUM\"");
    }

    #[test]
    fn query_filters_by_date_range_and_text() {
        let parsed = ParsedJudgment {
            jid: "X".into(),
            case_number: Some("112年度訴字第1號".into()),
            judgment_date: NaiveDate::from_ymd_opt(2024, 1, 1),
            case_type: CaseType::Civil,
            court_name: Some("臺灣臺北地方法院".into()),
            full_text: Some("原告甲公司".into()),
            parties: None,
            summary: None,
            raw_payload: serde_json::json!({}),
        };
        let record = JudgmentRecord::from_parsed(parsed, RiskLevel::Low, utc(2024, 1, 1, 0, 0));
        let query = JudgmentQuery {
            text: Some("甲公司".into()),
            date_from: NaiveDate::from_ymd_opt(2023, 12, 1),
            date_to: NaiveDate::from_ymd_opt(2024, 1, 1),
            ..Default::default()
        };
        assert!(query.matches(&record));
        let query = JudgmentQuery {
            date_from: NaiveDate::from_ymd_opt(2024, 1, 2),
            ..Default::default()
        };
        assert!(!query.matches(&record));
    }
}
