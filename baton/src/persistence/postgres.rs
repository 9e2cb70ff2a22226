use async_trait::async_trait;
use serde_json::Value;
use sqlx::{PgPool, Row};
use tracing::debug;

use super::{CasOutcome, KeyValueStore, Versioned};

/// PostgreSQL-backed key-value store.
///
/// Rows live in `baton_kv(key TEXT PRIMARY KEY, version BIGINT, value
/// JSONB)`. Compare-and-set is a conditional `UPDATE` (or an
/// `INSERT ... ON CONFLICT DO NOTHING` for creates), so the database row
/// lock provides per-key linearizability.
#[derive(Debug, Clone)]
pub struct PostgresKvStore {
    pool: PgPool,
}

impl PostgresKvStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the backing table if it does not exist.
    pub async fn ensure_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS baton_kv (
                key TEXT PRIMARY KEY,
                version BIGINT NOT NULL,
                value JSONB NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn current_version(&self, key: &str) -> anyhow::Result<Option<u64>> {
        let row = sqlx::query("SELECT version FROM baton_kv WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| to_version(row.try_get("version")?))
            .transpose()
    }
}

fn to_version(raw: i64) -> anyhow::Result<u64> {
    u64::try_from(raw).map_err(|_| anyhow::anyhow!("negative version {raw}"))
}

fn to_db_version(version: u64) -> anyhow::Result<i64> {
    i64::try_from(version)
        .map_err(|_| anyhow::anyhow!("version {version} out of range"))
}

#[async_trait]
impl KeyValueStore for PostgresKvStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Versioned>> {
        let row = sqlx::query("SELECT version, value FROM baton_kv WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(Versioned {
            version: to_version(row.try_get("version")?)?,
            value: row.try_get("value")?,
        }))
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected_version: Option<u64>,
        value: Value,
    ) -> anyhow::Result<CasOutcome> {
        let applied: Option<i64> = match expected_version {
            None => {
                sqlx::query_scalar(
                    r#"
                    INSERT INTO baton_kv (key, version, value)
                    VALUES ($1, 1, $2)
                    ON CONFLICT (key) DO NOTHING
                    RETURNING version
                    "#,
                )
                .bind(key)
                .bind(&value)
                .fetch_optional(&self.pool)
                .await?
            }
            Some(expected) => {
                sqlx::query_scalar(
                    r#"
                    UPDATE baton_kv
                    SET version = version + 1,
                        value = $3
                    WHERE key = $1
                      AND version = $2
                    RETURNING version
                    "#,
                )
                .bind(key)
                .bind(to_db_version(expected)?)
                .bind(&value)
                .fetch_optional(&self.pool)
                .await?
            }
        };

        match applied {
            Some(version) => Ok(CasOutcome::Applied {
                version: to_version(version)?,
            }),
            None => {
                let current = self.current_version(key).await?;
                debug!(key, ?expected_version, ?current, "cas mismatch");
                Ok(CasOutcome::Mismatch { current })
            }
        }
    }

    async fn delete(&self, key: &str, expected_version: u64) -> anyhow::Result<bool> {
        let result =
            sqlx::query("DELETE FROM baton_kv WHERE key = $1 AND version = $2")
                .bind(key)
                .bind(to_db_version(expected_version)?)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn scan_prefix(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> anyhow::Result<Vec<(String, Versioned)>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            r#"
            SELECT key, version, value
            FROM baton_kv
            WHERE left(key, length($1)) = $1
              AND ($2::TEXT IS NULL OR key COLLATE "C" > $2)
            ORDER BY key COLLATE "C" ASC
            LIMIT $3
            "#,
        )
        .bind(prefix)
        .bind(start_after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let key: String = row.try_get("key")?;
                let entry = Versioned {
                    version: to_version(row.try_get("version")?)?,
                    value: row.try_get("value")?,
                };
                Ok::<_, anyhow::Error>((key, entry))
            })
            .collect()
    }
}
