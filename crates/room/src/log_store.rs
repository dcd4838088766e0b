//! Hour-keyed, newest-first log buckets (spec.md §4.5), persisted to
//! SQLite: one append-only table, one writer per tenant, read path
//! scoped by a tenant key.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use sqlx::SqlitePool;

use roombus_protocol::{LOG_RETENTION_HOURS, MAX_LOGS_PER_HOUR};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::Incoming => "incoming",
            Direction::Outgoing => "outgoing",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "outgoing" => Direction::Outgoing,
            _ => Direction::Incoming,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoredLog {
    pub id: i64,
    pub timestamp: i64,
    pub message_type: String,
    pub direction: Direction,
    pub envelope: Value,
    pub client_id: Option<String>,
    pub client_role: Option<String>,
    pub project_id: String,
    pub from_client_id: Option<String>,
}

/// The Room's single durable collaborator for log history. Writes are
/// fire-and-forget from the Room's perspective (spec.md §7 storage-error
/// rule) but must never silently swallow an unrelated bug; implementors
/// still return `Result` and let the caller decide to log-and-continue.
#[async_trait]
pub trait LogBucketStore: Send + Sync {
    async fn append(&self, entry: NewLog<'_>) -> Result<()>;

    /// Replay entries within the retention window, newest-first, capped
    /// at `limit`.
    async fn replay(&self, project_id: &str, limit: usize) -> Result<HistoricalReplay>;

    /// Delete buckets older than the retention window, as of `now`.
    async fn compact(&self, now: DateTime<Utc>) -> Result<u64>;
}

/// Result of a replay: the capped newest-first batch plus the total
/// number of entries considered within the retention window.
pub struct HistoricalReplay {
    pub logs: Vec<StoredLog>,
    pub total: usize,
}

pub struct NewLog<'a> {
    pub project_id: &'a str,
    pub timestamp: i64,
    pub message_type: &'a str,
    pub direction: Direction,
    pub envelope: &'a Value,
    pub client_id: Option<&'a str>,
    pub client_role: Option<&'a str>,
    pub from_client_id: Option<&'a str>,
}

/// UTC floor-to-hour key, e.g. `2026-07-29-14`. Log bucket membership and
/// the retention cutoff both derive from this function, so there is zero
/// clock skew between a log's timestamp and its bucket (spec.md §8).
pub fn hour_key(timestamp_ms: i64) -> String {
    let dt = Utc
        .timestamp_millis_opt(timestamp_ms)
        .single()
        .unwrap_or_else(Utc::now);
    dt.format("%Y-%m-%d-%H").to_string()
}

pub struct SqliteLogBucketStore {
    pool: SqlitePool,
}

impl SqliteLogBucketStore {
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LogBucketStore for SqliteLogBucketStore {
    async fn append(&self, entry: NewLog<'_>) -> Result<()> {
        let bucket = hour_key(entry.timestamp);
        let envelope_text = serde_json::to_string(entry.envelope)?;

        sqlx::query(
            "INSERT INTO log_entries
                (project_id, hour_key, timestamp_ms, message_type, direction,
                 envelope, client_id, client_role, from_client_id)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(entry.project_id)
        .bind(&bucket)
        .bind(entry.timestamp)
        .bind(entry.message_type)
        .bind(entry.direction.as_str())
        .bind(envelope_text)
        .bind(entry.client_id)
        .bind(entry.client_role)
        .bind(entry.from_client_id)
        .execute(&self.pool)
        .await?;

        // Trim the bucket to MAX_LOGS_PER_HOUR newest-first entries.
        sqlx::query(
            "DELETE FROM log_entries
             WHERE project_id = ? AND hour_key = ?
               AND id NOT IN (
                   SELECT id FROM log_entries
                   WHERE project_id = ? AND hour_key = ?
                   ORDER BY id DESC
                   LIMIT ?
               )",
        )
        .bind(entry.project_id)
        .bind(&bucket)
        .bind(entry.project_id)
        .bind(&bucket)
        .bind(MAX_LOGS_PER_HOUR as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn replay(&self, project_id: &str, limit: usize) -> Result<HistoricalReplay> {
        let cutoff = (Utc::now() - chrono::Duration::hours(LOG_RETENTION_HOURS)).timestamp_millis();
        let limit_i64 = limit as i64;

        type Row = (
            i64,
            i64,
            String,
            String,
            String,
            Option<String>,
            Option<String>,
            String,
            Option<String>,
        );

        let rows: Vec<Row> = sqlx::query_as(
            "SELECT id, timestamp_ms, message_type, direction, envelope,
                    client_id, client_role, project_id, from_client_id
             FROM log_entries
             WHERE project_id = ? AND timestamp_ms >= ?
             ORDER BY timestamp_ms DESC
             LIMIT ?",
        )
        .bind(project_id)
        .bind(cutoff)
        .bind(limit_i64)
        .fetch_all(&self.pool)
        .await?;

        let (total,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM log_entries WHERE project_id = ? AND timestamp_ms >= ?",
        )
        .bind(project_id)
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await?;

        let logs = rows
            .into_iter()
            .map(
                |(id, timestamp_ms, message_type, direction, envelope, client_id, client_role, project_id, from_client_id)| {
                    StoredLog {
                        id,
                        timestamp: timestamp_ms,
                        message_type,
                        direction: Direction::parse(&direction),
                        envelope: serde_json::from_str(&envelope).unwrap_or(Value::Null),
                        client_id,
                        client_role,
                        project_id,
                        from_client_id,
                    }
                },
            )
            .collect();

        Ok(HistoricalReplay {
            logs,
            total: total as usize,
        })
    }

    async fn compact(&self, now: DateTime<Utc>) -> Result<u64> {
        let cutoff = (now - chrono::Duration::hours(LOG_RETENTION_HOURS)).timestamp_millis();
        let result = sqlx::query("DELETE FROM log_entries WHERE timestamp_ms < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> SqliteLogBucketStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        SqliteLogBucketStore::new(pool).await.unwrap()
    }

    fn sample<'a>(project_id: &'a str, timestamp: i64, envelope: &'a Value) -> NewLog<'a> {
        NewLog {
            project_id,
            timestamp,
            message_type: "graphql_query",
            direction: Direction::Incoming,
            envelope,
            client_id: None,
            client_role: None,
            from_client_id: None,
        }
    }

    #[tokio::test]
    async fn append_then_replay_newest_first() {
        let store = store().await;
        let now = Utc::now().timestamp_millis();
        let envelope = serde_json::json!({ "type": "graphql_query" });

        store.append(sample("proj", now - 2000, &envelope)).await.unwrap();
        store.append(sample("proj", now - 1000, &envelope)).await.unwrap();
        store.append(sample("proj", now, &envelope)).await.unwrap();

        let replay = store.replay("proj", 500).await.unwrap();
        let (logs, total) = (replay.logs, replay.total);
        assert_eq!(total, 3);
        assert_eq!(logs.len(), 3);
        assert!(logs[0].timestamp >= logs[1].timestamp);
        assert!(logs[1].timestamp >= logs[2].timestamp);
    }

    #[tokio::test]
    async fn replay_is_scoped_per_project() {
        let store = store().await;
        let now = Utc::now().timestamp_millis();
        let envelope = serde_json::json!({ "type": "graphql_query" });
        store.append(sample("a", now, &envelope)).await.unwrap();
        store.append(sample("b", now, &envelope)).await.unwrap();

        let replay = store.replay("a", 500).await.unwrap();
        assert_eq!(replay.total, 1);
        assert_eq!(replay.logs[0].project_id, "a");
    }

    #[tokio::test]
    async fn compact_drops_entries_older_than_retention() {
        let store = store().await;
        let now = Utc::now();
        let stale = now - chrono::Duration::hours(LOG_RETENTION_HOURS + 1);
        let envelope = serde_json::json!({ "type": "graphql_query" });

        store
            .append(sample("proj", stale.timestamp_millis(), &envelope))
            .await
            .unwrap();
        store
            .append(sample("proj", now.timestamp_millis(), &envelope))
            .await
            .unwrap();

        let removed = store.compact(now).await.unwrap();
        assert_eq!(removed, 1);

        let replay = store.replay("proj", 500).await.unwrap();
        assert_eq!(replay.total, 1);
        assert_eq!(replay.logs.len(), 1);
    }

    #[test]
    fn hour_key_floors_to_the_hour() {
        let t1 = Utc.with_ymd_and_hms(2026, 7, 29, 14, 5, 0).unwrap().timestamp_millis();
        let t2 = Utc.with_ymd_and_hms(2026, 7, 29, 14, 55, 0).unwrap().timestamp_millis();
        assert_eq!(hour_key(t1), hour_key(t2));
        assert_eq!(hour_key(t1), "2026-07-29-14");
    }
}
