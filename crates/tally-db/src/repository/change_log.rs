//! # Change Log Repository
//!
//! Persistent journal of local mutations awaiting upload.
//!
//! ## The Outbox Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Outbox Pattern Implementation                        │
//! │                                                                         │
//! │  LOCAL OPERATION (e.g. insert product)                                 │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                   SINGLE TRANSACTION                            │   │
//! │  │                                                                 │   │
//! │  │  1. INSERT INTO products (...)                                  │   │
//! │  │                                                                 │   │
//! │  │  2. INSERT INTO change_log (..., version)                       │   │
//! │  │     SELECT ..., COALESCE(MAX(version), 0) + 1                   │   │
//! │  │     FROM change_log WHERE table_name = ? AND record_id = ?      │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  COMMIT ← entity and journal entry land together                       │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SYNC CYCLE                                                            │
//! │  1. drain_pending(limit)  PENDING/FAILED → SYNCING, oldest first       │
//! │  2. upload snapshot                                                    │
//! │  3. mark_synced(id) or mark_failed(id, error, max_retries)             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The version is computed by the INSERT statement itself, so two appends for
//! the same record can never observe the same maximum.

use chrono::{Duration as ChronoDuration, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{DbError, DbResult};
use tally_core::{ChangeCounts, ChangeRecord, ChangeStatus, NewChange};

const CHANGE_COLUMNS: &str = "id, table_name, record_id, operation, data_snapshot, created_at, \
     synced_at, device_id, sync_status, retry_count, version, last_error";

/// Repository for change log operations.
#[derive(Debug, Clone)]
pub struct ChangeLogRepository {
    pool: SqlitePool,
}

impl ChangeLogRepository {
    pub fn new(pool: SqlitePool) -> Self {
        ChangeLogRepository { pool }
    }

    /// Appends a PENDING record with the next version for its record.
    pub async fn append(&self, change: &NewChange) -> DbResult<ChangeRecord> {
        let mut tx = self.pool.begin().await?;
        let record = Self::append_in(&mut tx, change).await?;
        tx.commit().await?;
        Ok(record)
    }

    /// Appends inside a caller's transaction (outbox pattern).
    pub async fn append_in(conn: &mut SqliteConnection, change: &NewChange) -> DbResult<ChangeRecord> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        let version: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO change_log (
                id, table_name, record_id, operation, data_snapshot,
                created_at, device_id, sync_status, retry_count, version
            )
            SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, COALESCE(MAX(version), 0) + 1
            FROM change_log
            WHERE table_name = ?2 AND record_id = ?3
            RETURNING version
            "#,
        )
        .bind(&id)
        .bind(&change.table_name)
        .bind(&change.record_id)
        .bind(change.operation)
        .bind(&change.data_snapshot)
        .bind(now)
        .bind(&change.device_id)
        .bind(ChangeStatus::Pending)
        .fetch_one(&mut *conn)
        .await?;

        debug!(
            table = %change.table_name,
            record_id = %change.record_id,
            version,
            "Change recorded"
        );

        Ok(ChangeRecord {
            id,
            table_name: change.table_name.clone(),
            record_id: change.record_id.clone(),
            operation: change.operation,
            data_snapshot: change.data_snapshot.clone(),
            created_at: now,
            synced_at: None,
            device_id: change.device_id.clone(),
            sync_status: ChangeStatus::Pending,
            retry_count: 0,
            version,
            last_error: None,
        })
    }

    pub async fn get(&self, id: &str) -> DbResult<Option<ChangeRecord>> {
        let sql = format!("SELECT {} FROM change_log WHERE id = ?1", CHANGE_COLUMNS);
        let record = sqlx::query_as::<_, ChangeRecord>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    /// Claims up to `limit` PENDING/FAILED records, oldest first, and marks
    /// them SYNCING.
    pub async fn drain_pending(&self, limit: u32) -> DbResult<Vec<ChangeRecord>> {
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            r#"
            SELECT {} FROM change_log
            WHERE sync_status IN ('PENDING', 'FAILED')
            ORDER BY created_at ASC, rowid ASC
            LIMIT ?1
            "#,
            CHANGE_COLUMNS
        );
        let mut records = sqlx::query_as::<_, ChangeRecord>(&sql)
            .bind(limit)
            .fetch_all(&mut *tx)
            .await?;

        for record in &mut records {
            sqlx::query("UPDATE change_log SET sync_status = ?2 WHERE id = ?1")
                .bind(&record.id)
                .bind(ChangeStatus::Syncing)
                .execute(&mut *tx)
                .await?;
            record.sync_status = ChangeStatus::Syncing;
        }

        tx.commit().await?;

        debug!(count = records.len(), "Drained pending changes");
        Ok(records)
    }

    /// Returns records left SYNCING by an interrupted cycle to PENDING.
    pub async fn requeue_in_flight(&self) -> DbResult<u64> {
        let result = sqlx::query("UPDATE change_log SET sync_status = ?1 WHERE sync_status = ?2")
            .bind(ChangeStatus::Pending)
            .bind(ChangeStatus::Syncing)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn mark_synced(&self, id: &str) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE change_log SET sync_status = ?2, synced_at = ?3, last_error = NULL
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(ChangeStatus::Synced)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("ChangeRecord", id));
        }
        Ok(())
    }

    /// Records a failed upload attempt and returns the resulting status:
    /// FAILED, or DROPPED once `retry_count` reaches `max_retries`.
    pub async fn mark_failed(&self, id: &str, error: &str, max_retries: u32) -> DbResult<ChangeStatus> {
        let row: Option<(ChangeStatus, i64)> = sqlx::query_as(
            r#"
            UPDATE change_log SET
                retry_count = retry_count + 1,
                last_error = ?2,
                sync_status = CASE WHEN retry_count + 1 >= ?3 THEN ?4 ELSE ?5 END
            WHERE id = ?1
            RETURNING sync_status, retry_count
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(max_retries)
        .bind(ChangeStatus::Dropped)
        .bind(ChangeStatus::Failed)
        .fetch_optional(&self.pool)
        .await?;

        let (status, retry_count) = row.ok_or_else(|| DbError::not_found("ChangeRecord", id))?;
        if status == ChangeStatus::Dropped {
            warn!(
                change_id = %id,
                retry_count,
                error = %error,
                "Change record dropped after exhausting retries"
            );
        }
        Ok(status)
    }

    /// Sets the status of a record (CONFLICT / RESOLVED transitions).
    pub async fn set_status(&self, id: &str, status: ChangeStatus) -> DbResult<()> {
        let result = sqlx::query("UPDATE change_log SET sync_status = ?2 WHERE id = ?1")
            .bind(id)
            .bind(status)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("ChangeRecord", id));
        }
        Ok(())
    }

    /// Sets the status of every non-terminal record of one entity record.
    pub async fn set_status_for_record(
        &self,
        table_name: &str,
        record_id: &str,
        status: ChangeStatus,
    ) -> DbResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE change_log SET sync_status = ?3
            WHERE table_name = ?1 AND record_id = ?2
            AND sync_status NOT IN ('SYNCED', 'DROPPED')
            "#,
        )
        .bind(table_name)
        .bind(record_id)
        .bind(status)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Number of records per status.
    pub async fn counts(&self) -> DbResult<ChangeCounts> {
        let rows: Vec<(ChangeStatus, i64)> =
            sqlx::query_as("SELECT sync_status, COUNT(*) FROM change_log GROUP BY sync_status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = ChangeCounts::default();
        for (status, count) in rows {
            counts.add(status, count);
        }
        Ok(counts)
    }

    /// Full history of one record, oldest version first.
    pub async fn history(&self, table_name: &str, record_id: &str) -> DbResult<Vec<ChangeRecord>> {
        let sql = format!(
            "SELECT {} FROM change_log WHERE table_name = ?1 AND record_id = ?2 ORDER BY version ASC",
            CHANGE_COLUMNS
        );
        let records = sqlx::query_as::<_, ChangeRecord>(&sql)
            .bind(table_name)
            .bind(record_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(records)
    }

    /// Highest version recorded for a record, 0 when none.
    pub async fn latest_version(&self, table_name: &str, record_id: &str) -> DbResult<i64> {
        let version: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(version), 0) FROM change_log WHERE table_name = ?1 AND record_id = ?2",
        )
        .bind(table_name)
        .bind(record_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(version)
    }

    /// Deletes SYNCED records older than `days_old`. PENDING and FAILED
    /// records are never deleted.
    pub async fn cleanup_synced(&self, days_old: u32) -> DbResult<u64> {
        let cutoff = Utc::now() - ChronoDuration::days(i64::from(days_old));

        let result = sqlx::query(
            r#"
            DELETE FROM change_log
            WHERE sync_status = ?1
            AND synced_at IS NOT NULL
            AND synced_at < ?2
            "#,
        )
        .bind(ChangeStatus::Synced)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};
    use tally_core::ChangeOperation;

    fn change(record_id: &str) -> NewChange {
        NewChange::new(
            ChangeOperation::Update,
            "products",
            record_id,
            r#"{"sku":"A"}"#,
            "device-a",
        )
    }

    #[tokio::test]
    async fn test_versions_are_gapless_per_record() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.change_log();

        for _ in 0..5 {
            repo.append(&change("p-1")).await.unwrap();
        }
        repo.append(&change("p-2")).await.unwrap();

        let versions: Vec<i64> = repo
            .history("products", "p-1")
            .await
            .unwrap()
            .iter()
            .map(|r| r.version)
            .collect();
        assert_eq!(versions, vec![1, 2, 3, 4, 5]);
        assert_eq!(repo.latest_version("products", "p-2").await.unwrap(), 1);
        assert_eq!(repo.latest_version("products", "p-3").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_drain_marks_syncing_in_order() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.change_log();

        let first = repo.append(&change("p-1")).await.unwrap();
        let second = repo.append(&change("p-2")).await.unwrap();
        repo.append(&change("p-3")).await.unwrap();

        let drained = repo.drain_pending(2).await.unwrap();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].id, first.id);
        assert_eq!(drained[1].id, second.id);
        assert!(drained.iter().all(|r| r.sync_status == ChangeStatus::Syncing));

        // Only the remaining PENDING record is drainable now
        assert_eq!(repo.drain_pending(10).await.unwrap().len(), 1);
        assert!(repo.drain_pending(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mark_failed_drops_after_max_retries() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.change_log();
        let record = repo.append(&change("p-1")).await.unwrap();

        assert_eq!(
            repo.mark_failed(&record.id, "timeout", 3).await.unwrap(),
            ChangeStatus::Failed
        );
        assert_eq!(
            repo.mark_failed(&record.id, "timeout", 3).await.unwrap(),
            ChangeStatus::Failed
        );
        assert_eq!(
            repo.mark_failed(&record.id, "timeout", 3).await.unwrap(),
            ChangeStatus::Dropped
        );

        let stored = repo.get(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.retry_count, 3);
        assert_eq!(stored.last_error.as_deref(), Some("timeout"));
        assert!(repo.drain_pending(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_records_are_redrained() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.change_log();
        let record = repo.append(&change("p-1")).await.unwrap();

        repo.drain_pending(10).await.unwrap();
        repo.mark_failed(&record.id, "offline", 5).await.unwrap();

        let again = repo.drain_pending(10).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].retry_count, 1);
    }

    #[tokio::test]
    async fn test_counts_and_cleanup() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.change_log();

        let synced = repo.append(&change("p-1")).await.unwrap();
        repo.append(&change("p-2")).await.unwrap();
        repo.mark_synced(&synced.id).await.unwrap();

        let counts = repo.counts().await.unwrap();
        assert_eq!(counts.synced, 1);
        assert_eq!(counts.pending, 1);

        // Nothing is older than a day yet
        assert_eq!(repo.cleanup_synced(1).await.unwrap(), 0);
        assert_eq!(repo.cleanup_synced(0).await.unwrap(), 1);
        assert_eq!(repo.counts().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_requeue_in_flight() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.change_log();
        repo.append(&change("p-1")).await.unwrap();

        repo.drain_pending(10).await.unwrap();
        assert_eq!(repo.requeue_in_flight().await.unwrap(), 1);
        assert_eq!(repo.counts().await.unwrap().pending, 1);
    }
}
