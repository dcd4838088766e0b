//! The Credential Store Gateway (spec.md §4.7): issuing, hashing,
//! validating, describing, listing, and revoking project API keys.
//!
//! Backed by SQLite via `sqlx`: one table per concern, hash-at-rest,
//! show-plaintext-once.

pub mod routes;

use chrono::{DateTime, Utc};
use rand::RngCore;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;

use roombus_protocol::{API_KEY_PREFIX_LEN, API_KEY_RANDOM_BYTES};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("project {project_id} already has an active API key")]
    AlreadyExists { project_id: String },

    #[error("no active API key for project {project_id}")]
    NotFound { project_id: String },

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A freshly minted key. `api_key` is the plaintext secret, shown exactly
/// once, never persisted or returned again.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedApiKey {
    pub id: i64,
    pub project_id: String,
    pub api_key: String,
    pub key_prefix: String,
    pub created_at: DateTime<Utc>,
}

/// A listing/describe view of a key, never exposes the hash or plaintext.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyDescription {
    pub id: i64,
    pub project_id: String,
    pub key_prefix: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub created_by: Option<String>,
    pub description: Option<String>,
}

/// Outcome of validating a presented project id + API key pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validation {
    Valid,
    Invalid,
}

/// SQLite-backed API key store.
pub struct ApiKeyStore {
    pool: SqlitePool,
}

impl ApiKeyStore {
    /// Open a store against `pool`, running migrations if needed.
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    /// Construct a store without migrating, used by tests with a pool
    /// that has already been prepared by [`ApiKeyStore::new`] elsewhere,
    /// or by callers that manage migrations themselves.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Generate and persist a new key for `project_id`. Fails if an active
    /// key already exists for that project (spec.md §4.7, §8 idempotence).
    pub async fn create(
        &self,
        project_id: &str,
        created_by: Option<String>,
        description: Option<String>,
    ) -> Result<CreatedApiKey> {
        if self.describe(project_id).await?.is_some() {
            return Err(Error::AlreadyExists {
                project_id: project_id.to_string(),
            });
        }

        let api_key = generate_api_key();
        let key_prefix = api_key[..API_KEY_PREFIX_LEN.min(api_key.len())].to_string();
        let key_hash = sha256_hex(&api_key);

        let row: (i64, DateTime<Utc>) = sqlx::query_as(
            "INSERT INTO api_keys (project_id, key_hash, key_prefix, created_by, description, is_active)
             VALUES (?, ?, ?, ?, ?, 1)
             RETURNING id, created_at",
        )
        .bind(project_id)
        .bind(&key_hash)
        .bind(&key_prefix)
        .bind(&created_by)
        .bind(&description)
        .fetch_one(&self.pool)
        .await?;

        Ok(CreatedApiKey {
            id: row.0,
            project_id: project_id.to_string(),
            api_key,
            key_prefix,
            created_at: row.1,
        })
    }

    /// Describe the active key for `project_id`, if any.
    pub async fn describe(&self, project_id: &str) -> Result<Option<ApiKeyDescription>> {
        let row = sqlx::query_as::<_, ApiKeyRow>(
            "SELECT id, project_id, key_prefix, created_at, last_used_at,
                    is_active, created_by, description
             FROM api_keys
             WHERE project_id = ? AND is_active",
        )
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    /// List all currently active keys.
    pub async fn list(&self) -> Result<Vec<ApiKeyDescription>> {
        let rows = sqlx::query_as::<_, ApiKeyRow>(
            "SELECT id, project_id, key_prefix, created_at, last_used_at,
                    is_active, created_by, description
             FROM api_keys
             WHERE is_active
             ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Deactivate the active key for `project_id`. Returns whether a row
    /// was actually revoked.
    pub async fn revoke(&self, project_id: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE api_keys SET is_active = 0 WHERE project_id = ? AND is_active")
            .bind(project_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Validate a presented `(projectId, apiKey)` pair. On success,
    /// best-effort bumps `last_used_at`; failure to record that touch is
    /// logged, not propagated (spec.md §7 storage-error rule).
    pub async fn validate(&self, project_id: &str, raw_key: &str) -> Validation {
        if !is_well_formed_key(raw_key) {
            return Validation::Invalid;
        }
        let key_hash = sha256_hex(raw_key);

        let matched: std::result::Result<Option<(i64,)>, sqlx::Error> = sqlx::query_as(
            "SELECT id FROM api_keys WHERE project_id = ? AND key_hash = ? AND is_active",
        )
        .bind(project_id)
        .bind(&key_hash)
        .fetch_optional(&self.pool)
        .await;

        match matched {
            Ok(Some((id,))) => {
                if let Err(err) = sqlx::query(
                    "UPDATE api_keys SET last_used_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now') WHERE id = ?",
                )
                .bind(id)
                .execute(&self.pool)
                .await
                {
                    tracing::warn!(error = %err, project_id, "failed to record api key last_used_at");
                }
                Validation::Valid
            },
            Ok(None) => Validation::Invalid,
            Err(err) => {
                tracing::warn!(error = %err, project_id, "api key lookup failed");
                Validation::Invalid
            },
        }
    }
}

#[derive(sqlx::FromRow)]
struct ApiKeyRow {
    id: i64,
    project_id: String,
    key_prefix: String,
    created_at: DateTime<Utc>,
    last_used_at: Option<DateTime<Utc>>,
    is_active: bool,
    created_by: Option<String>,
    description: Option<String>,
}

impl From<ApiKeyRow> for ApiKeyDescription {
    fn from(row: ApiKeyRow) -> Self {
        Self {
            id: row.id,
            project_id: row.project_id,
            key_prefix: row.key_prefix,
            created_at: row.created_at,
            last_used_at: row.last_used_at,
            is_active: row.is_active,
            created_by: row.created_by,
            description: row.description,
        }
    }
}

/// `sa_live_` followed by 32 lowercase hex chars derived from 16
/// cryptographically random bytes.
fn generate_api_key() -> String {
    let mut bytes = [0u8; API_KEY_RANDOM_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    format!("sa_live_{}", hex::encode(bytes))
}

fn is_well_formed_key(raw_key: &str) -> bool {
    raw_key.starts_with("sa_live_") || raw_key.starts_with("sa_test_")
}

fn sha256_hex(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    hex::encode(hasher.finalize())
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> ApiKeyStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        ApiKeyStore::new(pool).await.unwrap()
    }

    #[tokio::test]
    async fn create_then_validate_round_trip() {
        let store = store().await;
        let created = store.create("proj-x", None, None).await.unwrap();
        assert!(created.api_key.starts_with("sa_live_"));
        assert_eq!(created.key_prefix.len(), API_KEY_PREFIX_LEN);

        assert_eq!(
            store.validate("proj-x", &created.api_key).await,
            Validation::Valid
        );
        assert_eq!(
            store.validate("proj-x", "sa_live_deadbeef").await,
            Validation::Invalid
        );
        assert_eq!(
            store.validate("other-project", &created.api_key).await,
            Validation::Invalid
        );
    }

    #[tokio::test]
    async fn malformed_key_is_rejected_without_a_query() {
        let store = store().await;
        assert_eq!(
            store.validate("proj-x", "not-a-key-at-all").await,
            Validation::Invalid
        );
    }

    #[tokio::test]
    async fn second_create_fails_while_first_is_active() {
        let store = store().await;
        store.create("proj-x", None, None).await.unwrap();
        let err = store.create("proj-x", None, None).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn revoke_then_recreate_succeeds_with_a_new_plaintext() {
        let store = store().await;
        let first = store.create("proj-x", None, None).await.unwrap();

        assert!(store.revoke("proj-x").await.unwrap());
        assert_eq!(
            store.validate("proj-x", &first.api_key).await,
            Validation::Invalid
        );

        let second = store.create("proj-x", None, None).await.unwrap();
        assert_ne!(first.api_key, second.api_key);
        assert_eq!(
            store.validate("proj-x", &second.api_key).await,
            Validation::Valid
        );
    }

    #[tokio::test]
    async fn revoke_unknown_project_is_a_no_op() {
        let store = store().await;
        assert!(!store.revoke("nope").await.unwrap());
    }

    #[tokio::test]
    async fn list_only_returns_active_keys() {
        let store = store().await;
        store.create("proj-a", None, None).await.unwrap();
        store.create("proj-b", None, None).await.unwrap();
        store.revoke("proj-b").await.unwrap();

        let active = store.list().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].project_id, "proj-a");
    }
}
