//! # Conflict Repository
//!
//! Persists diverged record pairs found during merge. A conflict stays open
//! until `resolve` stamps `resolved_at`.

use chrono::Utc;
use sqlx::SqlitePool;

use crate::error::{DbError, DbResult};
use tally_core::{ConflictStrategy, SyncConflict};

const CONFLICT_COLUMNS: &str = "id, table_name, record_id, local_data, remote_data, local_version, \
     remote_version, created_at, resolution_strategy, resolved_data, resolved_at";

#[derive(Debug, Clone)]
pub struct ConflictRepository {
    pool: SqlitePool,
}

impl ConflictRepository {
    pub fn new(pool: SqlitePool) -> Self {
        ConflictRepository { pool }
    }

    pub async fn insert(&self, conflict: &SyncConflict) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_conflicts (
                id, table_name, record_id, local_data, remote_data, local_version,
                remote_version, created_at, resolution_strategy, resolved_data, resolved_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(&conflict.id)
        .bind(&conflict.table_name)
        .bind(&conflict.record_id)
        .bind(&conflict.local_data)
        .bind(&conflict.remote_data)
        .bind(conflict.local_version)
        .bind(conflict.remote_version)
        .bind(conflict.created_at)
        .bind(conflict.resolution_strategy)
        .bind(&conflict.resolved_data)
        .bind(conflict.resolved_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> DbResult<Option<SyncConflict>> {
        let sql = format!("SELECT {} FROM sync_conflicts WHERE id = ?1", CONFLICT_COLUMNS);
        let conflict = sqlx::query_as::<_, SyncConflict>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(conflict)
    }

    /// Unresolved conflicts, oldest first.
    pub async fn list_unresolved(&self) -> DbResult<Vec<SyncConflict>> {
        let sql = format!(
            "SELECT {} FROM sync_conflicts WHERE resolved_at IS NULL ORDER BY created_at ASC",
            CONFLICT_COLUMNS
        );
        let conflicts = sqlx::query_as::<_, SyncConflict>(&sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(conflicts)
    }

    /// Open conflict for the same record and remote version, if any.
    pub async fn find_open(
        &self,
        table_name: &str,
        record_id: &str,
        remote_version: i64,
    ) -> DbResult<Option<SyncConflict>> {
        let sql = format!(
            r#"
            SELECT {} FROM sync_conflicts
            WHERE table_name = ?1 AND record_id = ?2 AND remote_version = ?3
            AND resolved_at IS NULL
            LIMIT 1
            "#,
            CONFLICT_COLUMNS
        );
        let conflict = sqlx::query_as::<_, SyncConflict>(&sql)
            .bind(table_name)
            .bind(record_id)
            .bind(remote_version)
            .fetch_optional(&self.pool)
            .await?;
        Ok(conflict)
    }

    /// Marks a conflict resolved. Returns NotFound when the id is unknown or
    /// the conflict was already resolved.
    pub async fn resolve(
        &self,
        id: &str,
        strategy: ConflictStrategy,
        resolved_data: Option<&str>,
    ) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE sync_conflicts SET
                resolution_strategy = ?2,
                resolved_data = ?3,
                resolved_at = ?4
            WHERE id = ?1 AND resolved_at IS NULL
            "#,
        )
        .bind(id)
        .bind(strategy)
        .bind(resolved_data)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("SyncConflict", id));
        }
        Ok(())
    }

    pub async fn count_unresolved(&self) -> DbResult<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM sync_conflicts WHERE resolved_at IS NULL")
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}
