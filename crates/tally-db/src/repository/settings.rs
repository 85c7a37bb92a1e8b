//! # Settings Repository
//!
//! A small JSON key/value store for process-wide state that must survive
//! restarts.
//!
//! ## Stable Keys
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  device_identity        DeviceIdentity, minted once, never rewritten    │
//! │  sync_config            SyncConfig                                      │
//! │  backup_index           Vec<BackupInfo>, newest first                   │
//! │  last_merged_snapshot   MergeCheckpoint                                 │
//! │  snapshot_version       u64 upload counter                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::info;

use crate::error::DbResult;
use tally_core::DeviceIdentity;

/// Settings keys. Renaming one orphans existing installations' data.
pub mod keys {
    pub const DEVICE_IDENTITY: &str = "device_identity";
    pub const SYNC_CONFIG: &str = "sync_config";
    pub const BACKUP_INDEX: &str = "backup_index";
    pub const LAST_MERGED_SNAPSHOT: &str = "last_merged_snapshot";
    pub const SNAPSHOT_VERSION: &str = "snapshot_version";
}

#[derive(Debug, Clone)]
pub struct SettingsRepository {
    pool: SqlitePool,
}

impl SettingsRepository {
    pub fn new(pool: SqlitePool) -> Self {
        SettingsRepository { pool }
    }

    /// Reads and decodes a value; `None` when the key was never written.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> DbResult<Option<T>> {
        let raw: Option<String> = sqlx::query_scalar("SELECT value FROM app_settings WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> DbResult<()> {
        let mut conn = self.pool.acquire().await?;
        Self::set_in(&mut conn, key, value).await
    }

    /// Writes a value inside a caller's transaction.
    pub async fn set_in<T: Serialize + ?Sized>(
        conn: &mut SqliteConnection,
        key: &str,
        value: &T,
    ) -> DbResult<()> {
        let raw = serde_json::to_string(value)?;
        sqlx::query(
            r#"
            INSERT INTO app_settings (key, value, updated_at) VALUES (?1, ?2, ?3)
            ON CONFLICT (key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(raw)
        .bind(Utc::now())
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM app_settings WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Returns the persisted device identity, minting it on first call.
    ///
    /// `configured` seeds the identity only when none exists yet; a stored
    /// identity always wins.
    pub async fn load_or_create_identity(&self, configured: Option<&str>) -> DbResult<DeviceIdentity> {
        if let Some(identity) = self.get::<DeviceIdentity>(keys::DEVICE_IDENTITY).await? {
            return Ok(identity);
        }

        let candidate = match configured.map(str::trim).filter(|id| !id.is_empty()) {
            Some(id) => DeviceIdentity::with_id(id),
            None => DeviceIdentity::generate(),
        };

        // INSERT OR IGNORE: a concurrent first start keeps whichever identity
        // landed first.
        sqlx::query("INSERT OR IGNORE INTO app_settings (key, value, updated_at) VALUES (?1, ?2, ?3)")
            .bind(keys::DEVICE_IDENTITY)
            .bind(serde_json::to_string(&candidate)?)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;

        let identity = self
            .get::<DeviceIdentity>(keys::DEVICE_IDENTITY)
            .await?
            .unwrap_or(candidate);

        info!(device_id = %identity.device_id, "Device identity created");
        Ok(identity)
    }
}
