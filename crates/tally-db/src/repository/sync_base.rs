//! # Sync Base Repository
//!
//! Last content agreed with the remote for each record, keyed by natural
//! key. Three-way conflict detection compares local and remote against it.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};

use crate::error::DbResult;

#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct SyncBaseEntry {
    pub table_name: String,
    pub record_key: String,
    /// Record JSON.
    pub data: String,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SyncBaseRepository {
    pool: SqlitePool,
}

impl SyncBaseRepository {
    pub fn new(pool: SqlitePool) -> Self {
        SyncBaseRepository { pool }
    }

    pub async fn get(&self, table_name: &str, record_key: &str) -> DbResult<Option<SyncBaseEntry>> {
        let entry = sqlx::query_as::<_, SyncBaseEntry>(
            r#"
            SELECT table_name, record_key, data, version, updated_at
            FROM sync_base
            WHERE table_name = ?1 AND record_key = ?2
            "#,
        )
        .bind(table_name)
        .bind(record_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(entry)
    }

    pub async fn upsert(
        &self,
        table_name: &str,
        record_key: &str,
        data: &str,
        version: i64,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_base (table_name, record_key, data, version, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT (table_name, record_key) DO UPDATE SET
                data = excluded.data,
                version = excluded.version,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(table_name)
        .bind(record_key)
        .bind(data)
        .bind(version)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn count(&self) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_base")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
