//! # Backup Repository
//!
//! Stores backup payloads and the backup index.
//!
//! ## Atomic Index Updates
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  store(payload, index, evicted)          remove(id, index)              │
//! │  ┌────────────────────────────────┐     ┌────────────────────────────┐ │
//! │  │ BEGIN                          │     │ BEGIN                      │ │
//! │  │ INSERT backup_payloads (new)   │     │ DELETE backup_payloads(id) │ │
//! │  │ DELETE backup_payloads(evicted)│     │ UPSERT backup_index        │ │
//! │  │ UPSERT backup_index            │     │ COMMIT                     │ │
//! │  │ COMMIT                         │     └────────────────────────────┘ │
//! │  └────────────────────────────────┘                                     │
//! │  A completed index entry never points at a missing payload.             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::DbResult;
use crate::repository::settings::{keys, SettingsRepository};
use tally_core::BackupInfo;

#[derive(Debug, Clone)]
pub struct BackupRepository {
    pool: SqlitePool,
}

impl BackupRepository {
    pub fn new(pool: SqlitePool) -> Self {
        BackupRepository { pool }
    }

    /// Backup index, newest first as stored.
    pub async fn load_index(&self) -> DbResult<Vec<BackupInfo>> {
        let index = SettingsRepository::new(self.pool.clone())
            .get::<Vec<BackupInfo>>(keys::BACKUP_INDEX)
            .await?;
        Ok(index.unwrap_or_default())
    }

    /// Replaces the index without touching payloads (status transitions).
    pub async fn save_index(&self, index: &[BackupInfo]) -> DbResult<()> {
        SettingsRepository::new(self.pool.clone())
            .set(keys::BACKUP_INDEX, index)
            .await?;
        Ok(())
    }

    /// Raw payload JSON.
    pub async fn payload(&self, backup_id: &str) -> DbResult<Option<String>> {
        let payload: Option<String> =
            sqlx::query_scalar("SELECT payload FROM backup_payloads WHERE backup_id = ?1")
                .bind(backup_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(payload)
    }

    /// Writes a new payload, drops evicted payloads and replaces the index in
    /// one transaction.
    pub async fn store(
        &self,
        backup_id: &str,
        payload: &str,
        index: &[BackupInfo],
        evicted: &[String],
    ) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO backup_payloads (backup_id, payload, created_at) VALUES (?1, ?2, ?3)")
            .bind(backup_id)
            .bind(payload)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;

        for old in evicted {
            sqlx::query("DELETE FROM backup_payloads WHERE backup_id = ?1")
                .bind(old)
                .execute(&mut *tx)
                .await?;
        }

        SettingsRepository::set_in(&mut tx, keys::BACKUP_INDEX, index).await?;
        tx.commit().await?;

        debug!(backup_id = %backup_id, evicted = evicted.len(), "Backup stored");
        Ok(())
    }

    /// Deletes a payload and replaces the index in one transaction.
    /// Returns whether a payload existed.
    pub async fn remove(&self, backup_id: &str, index: &[BackupInfo]) -> DbResult<bool> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query("DELETE FROM backup_payloads WHERE backup_id = ?1")
            .bind(backup_id)
            .execute(&mut *tx)
            .await?;
        SettingsRepository::set_in(&mut tx, keys::BACKUP_INDEX, index).await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn count_payloads(&self) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM backup_payloads")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
