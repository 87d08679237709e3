use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use judsync_core::{
    CaseType, JudgmentQuery, JudgmentRecord, JudgmentStats, Page, RiskLevel, RunCounters, SyncRun,
    SyncStatus,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::info;
use uuid::Uuid;

use crate::{JudgmentStore, StoreError};

const JUDGMENT_COLUMNS: &str = "external_id, case_number, judgment_date, case_type, court_name, \
     full_text, parties, summary, risk_level, raw_payload, created_at, updated_at";

const SYNC_RUN_COLUMNS: &str = "sync_date, run_id, status, total_fetched, new_records, \
     updated_records, skipped_records, errors, started_at, completed_at, heartbeat_at, error_message";

/// PostgreSQL backend; the two tables live in `migrations/`.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("judgment store migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn judgment_from_row(row: &PgRow) -> Result<JudgmentRecord, StoreError> {
    let case_type: String = row.try_get("case_type")?;
    let risk_level: String = row.try_get("risk_level")?;
    Ok(JudgmentRecord {
        external_id: row.try_get("external_id")?,
        case_number: row.try_get("case_number")?,
        judgment_date: row.try_get("judgment_date")?,
        case_type: case_type
            .parse::<CaseType>()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?,
        court_name: row.try_get("court_name")?,
        full_text: row.try_get("full_text")?,
        parties: row.try_get("parties")?,
        summary: row.try_get("summary")?,
        risk_level: risk_level
            .parse::<RiskLevel>()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?,
        raw_payload: row.try_get("raw_payload")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn sync_run_from_row(row: &PgRow) -> Result<SyncRun, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(SyncRun {
        sync_date: row.try_get("sync_date")?,
        run_id: row.try_get::<Uuid, _>("run_id")?,
        status: status
            .parse::<SyncStatus>()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?,
        counters: RunCounters {
            total_fetched: row.try_get("total_fetched")?,
            new_records: row.try_get("new_records")?,
            updated_records: row.try_get("updated_records")?,
            skipped_records: row.try_get("skipped_records")?,
            errors: row.try_get("errors")?,
        },
        started_at: row.try_get::<DateTime<Utc>, _>("started_at")?,
        completed_at: row.try_get("completed_at")?,
        heartbeat_at: row.try_get("heartbeat_at")?,
        error_message: row.try_get("error_message")?,
    })
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[async_trait]
impl JudgmentStore for PgStore {
    async fn get_judgment(&self, external_id: &str) -> Result<Option<JudgmentRecord>, StoreError> {
        let sql = format!("SELECT {JUDGMENT_COLUMNS} FROM judgments WHERE external_id = $1");
        let row = sqlx::query(&sql)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(judgment_from_row).transpose()
    }

    async fn insert_judgment(&self, record: &JudgmentRecord) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO judgments (
                external_id, case_number, judgment_date, case_type, court_name,
                full_text, parties, summary, risk_level, raw_payload, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (external_id) DO NOTHING
            "#,
        )
        .bind(&record.external_id)
        .bind(&record.case_number)
        .bind(record.judgment_date)
        .bind(record.case_type.as_str())
        .bind(&record.court_name)
        .bind(&record.full_text)
        .bind(&record.parties)
        .bind(&record.summary)
        .bind(record.risk_level.as_str())
        .bind(&record.raw_payload)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Duplicate(record.external_id.clone()));
        }
        Ok(())
    }

    async fn update_judgment(&self, record: &JudgmentRecord) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE judgments
               SET case_number = $2,
                   judgment_date = $3,
                   case_type = $4,
                   court_name = $5,
                   full_text = $6,
                   parties = $7,
                   summary = $8,
                   risk_level = $9,
                   raw_payload = $10,
                   updated_at = GREATEST(updated_at, $11)
             WHERE external_id = $1
            "#,
        )
        .bind(&record.external_id)
        .bind(&record.case_number)
        .bind(record.judgment_date)
        .bind(record.case_type.as_str())
        .bind(&record.court_name)
        .bind(&record.full_text)
        .bind(&record.parties)
        .bind(&record.summary)
        .bind(record.risk_level.as_str())
        .bind(&record.raw_payload)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Missing(record.external_id.clone()));
        }
        Ok(())
    }

    async fn judgment_exists(&self, external_id: &str) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT EXISTS(SELECT 1 FROM judgments WHERE external_id = $1) AS present")
            .bind(external_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<bool, _>("present")?)
    }

    async fn search_judgments(&self, query: &JudgmentQuery) -> Result<Page<JudgmentRecord>, StoreError> {
        const FILTER: &str = r#"
             WHERE ($1::text IS NULL
                    OR strpos(coalesce(case_number, ''), $1) > 0
                    OR strpos(coalesce(court_name, ''), $1) > 0
                    OR strpos(coalesce(parties, ''), $1) > 0
                    OR strpos(coalesce(full_text, ''), $1) > 0)
               AND ($2::text IS NULL OR risk_level = $2)
               AND ($3::text IS NULL OR case_type = $3)
               AND ($4::date IS NULL OR judgment_date >= $4)
               AND ($5::date IS NULL OR judgment_date <= $5)
        "#;

        let text = query
            .text
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty());
        let risk = query.risk_level.map(|r| r.as_str());
        let case_type = query.case_type.map(|c| c.as_str());
        let per_page = query.normalized_per_page();

        let count_sql = format!("SELECT COUNT(*) AS total FROM judgments {FILTER}");
        let total: i64 = sqlx::query(&count_sql)
            .bind(text)
            .bind(risk)
            .bind(case_type)
            .bind(query.date_from)
            .bind(query.date_to)
            .fetch_one(&self.pool)
            .await?
            .try_get("total")?;

        let page_sql = format!(
            "SELECT {JUDGMENT_COLUMNS} FROM judgments {FILTER} \
             ORDER BY judgment_date DESC NULLS LAST, external_id ASC \
             LIMIT $6 OFFSET $7"
        );
        let rows = sqlx::query(&page_sql)
            .bind(text)
            .bind(risk)
            .bind(case_type)
            .bind(query.date_from)
            .bind(query.date_to)
            .bind(to_i64(per_page))
            .bind(to_i64(query.offset()))
            .fetch_all(&self.pool)
            .await?;

        let items = rows
            .iter()
            .map(judgment_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Page::new(
            items,
            usize::try_from(total).unwrap_or_default(),
            query.normalized_page(),
            per_page,
        ))
    }

    async fn judgment_stats(&self) -> Result<JudgmentStats, StoreError> {
        let mut stats = JudgmentStats::default();

        let rows = sqlx::query("SELECT risk_level, COUNT(*) AS n FROM judgments GROUP BY risk_level")
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            let level: String = row.try_get("risk_level")?;
            let n: i64 = row.try_get("n")?;
            let level = level
                .parse::<RiskLevel>()
                .map_err(|e| StoreError::Corrupt(e.to_string()))?;
            stats.by_risk_level.insert(level, n);
            stats.total += n;
        }

        let rows = sqlx::query("SELECT case_type, COUNT(*) AS n FROM judgments GROUP BY case_type")
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            let case_type: String = row.try_get("case_type")?;
            let n: i64 = row.try_get("n")?;
            let case_type = case_type
                .parse::<CaseType>()
                .map_err(|e| StoreError::Corrupt(e.to_string()))?;
            stats.by_case_type.insert(case_type, n);
        }

        Ok(stats)
    }

    async fn upsert_sync_run(&self, run: &SyncRun) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO judgment_sync_runs (
                sync_date, run_id, status, total_fetched, new_records, updated_records,
                skipped_records, errors, started_at, completed_at, heartbeat_at, error_message
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (sync_date) DO UPDATE
               SET run_id = EXCLUDED.run_id,
                   status = EXCLUDED.status,
                   total_fetched = EXCLUDED.total_fetched,
                   new_records = EXCLUDED.new_records,
                   updated_records = EXCLUDED.updated_records,
                   skipped_records = EXCLUDED.skipped_records,
                   errors = EXCLUDED.errors,
                   started_at = EXCLUDED.started_at,
                   completed_at = EXCLUDED.completed_at,
                   heartbeat_at = EXCLUDED.heartbeat_at,
                   error_message = EXCLUDED.error_message
            "#,
        )
        .bind(run.sync_date)
        .bind(run.run_id)
        .bind(run.status.as_str())
        .bind(run.counters.total_fetched)
        .bind(run.counters.new_records)
        .bind(run.counters.updated_records)
        .bind(run.counters.skipped_records)
        .bind(run.counters.errors)
        .bind(run.started_at)
        .bind(run.completed_at)
        .bind(run.heartbeat_at)
        .bind(&run.error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_sync_run(&self, sync_date: NaiveDate) -> Result<Option<SyncRun>, StoreError> {
        let sql = format!("SELECT {SYNC_RUN_COLUMNS} FROM judgment_sync_runs WHERE sync_date = $1");
        let row = sqlx::query(&sql)
            .bind(sync_date)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(sync_run_from_row).transpose()
    }

    async fn recent_sync_runs(&self, limit: usize) -> Result<Vec<SyncRun>, StoreError> {
        let sql = format!(
            "SELECT {SYNC_RUN_COLUMNS} FROM judgment_sync_runs ORDER BY sync_date DESC LIMIT $1"
        );
        let rows = sqlx::query(&sql)
            .bind(to_i64(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(sync_run_from_row).collect()
    }

    async fn running_sync_runs(&self) -> Result<Vec<SyncRun>, StoreError> {
        let sql = format!(
            "SELECT {SYNC_RUN_COLUMNS} FROM judgment_sync_runs WHERE status = 'running' ORDER BY sync_date"
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(sync_run_from_row).collect()
    }
}
