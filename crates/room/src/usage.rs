//! Per-project usage counters (spec.md §4.8), persisted as two small
//! SQLite tables rather than the source's string-keyed KV layout;
//! SQLite is the same durable collaborator [`crate::log_store`] already
//! uses for per-tenant data.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::error::Result;

const DAILY_REPORT_LIMIT: i64 = 30;

#[derive(Debug, Clone)]
pub struct DailyCount {
    pub date: String,
    pub count: i64,
}

#[derive(Debug, Clone)]
pub struct UsageReport {
    pub project_id: String,
    pub total_requests: i64,
    /// Newest-first, capped at 30 entries.
    pub daily_requests: Vec<DailyCount>,
}

#[async_trait]
pub trait UsageCounterStore: Send + Sync {
    /// Record one inbound application message for `project_id` on `day`
    /// (`YYYY-MM-DD`, UTC).
    async fn record(&self, project_id: &str, day: &str) -> Result<()>;

    async fn report(&self, project_id: &str) -> Result<UsageReport>;
}

pub struct SqliteUsageCounterStore {
    pool: SqlitePool,
}

impl SqliteUsageCounterStore {
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

/// UTC day key, e.g. `2026-07-29`.
pub fn day_key(timestamp: DateTime<Utc>) -> String {
    timestamp.format("%Y-%m-%d").to_string()
}

#[async_trait]
impl UsageCounterStore for SqliteUsageCounterStore {
    async fn record(&self, project_id: &str, day: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO usage_total (project_id, count) VALUES (?, 1)
             ON CONFLICT(project_id) DO UPDATE SET count = count + 1",
        )
        .bind(project_id)
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "INSERT INTO usage_daily (project_id, day, count) VALUES (?, ?, 1)
             ON CONFLICT(project_id, day) DO UPDATE SET count = count + 1",
        )
        .bind(project_id)
        .bind(day)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn report(&self, project_id: &str) -> Result<UsageReport> {
        let total: Option<(i64,)> = sqlx::query_as("SELECT count FROM usage_total WHERE project_id = ?")
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await?;

        let daily: Vec<(String, i64)> = sqlx::query_as(
            "SELECT day, count FROM usage_daily
             WHERE project_id = ?
             ORDER BY day DESC
             LIMIT ?",
        )
        .bind(project_id)
        .bind(DAILY_REPORT_LIMIT)
        .fetch_all(&self.pool)
        .await?;

        Ok(UsageReport {
            project_id: project_id.to_string(),
            total_requests: total.map(|(count,)| count).unwrap_or(0),
            daily_requests: daily
                .into_iter()
                .map(|(date, count)| DailyCount { date, count })
                .collect(),
        })
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> SqliteUsageCounterStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        SqliteUsageCounterStore::new(pool).await.unwrap()
    }

    #[tokio::test]
    async fn record_increments_total_and_daily() {
        let store = store().await;
        store.record("proj", "2026-07-29").await.unwrap();
        store.record("proj", "2026-07-29").await.unwrap();
        store.record("proj", "2026-07-28").await.unwrap();

        let report = store.report("proj").await.unwrap();
        assert_eq!(report.total_requests, 3);
        assert_eq!(report.daily_requests.len(), 2);
        assert_eq!(report.daily_requests[0].date, "2026-07-29");
        assert_eq!(report.daily_requests[0].count, 2);
    }

    #[tokio::test]
    async fn report_for_unknown_project_is_zeroed() {
        let store = store().await;
        let report = store.report("ghost").await.unwrap();
        assert_eq!(report.total_requests, 0);
        assert!(report.daily_requests.is_empty());
    }

    #[tokio::test]
    async fn daily_report_is_capped_at_thirty_entries() {
        let store = store().await;
        for day in 0..40 {
            let label = format!("2026-01-{:02}", (day % 28) + 1);
            store.record("proj", &label).await.unwrap();
        }
        let report = store.report("proj").await.unwrap();
        assert!(report.daily_requests.len() <= 30);
    }
}
