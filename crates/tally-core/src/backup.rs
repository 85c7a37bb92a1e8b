//! # Backup Records
//!
//! Self-describing backup payloads, their index entries, and restore
//! progress records.
//!
//! ## Payload Layout
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  BackupPayload                                                          │
//! │  ├── metadata   backup_id, timestamp, device_id, user_id,              │
//! │  │              schema_version, app_version, include_media             │
//! │  ├── entities   { "products": [...], "sales": [...], "users": [...],   │
//! │  │                "suppliers": [...], "inventory": [...] }             │
//! │  └── checksum   sha256(entities)                                       │
//! │                                                                         │
//! │  BackupInfo (index entry)                                               │
//! │  └── counts per entity, size, status  ──► must agree with the payload  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::sync::{checksum_tables, EntityTables};
use crate::types::EntityKind;
use crate::CURRENT_SCHEMA_VERSION;

// =============================================================================
// Entity Counts
// =============================================================================

/// Number of records per entity kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct EntityCounts {
    pub products: u64,
    pub sales: u64,
    pub users: u64,
    pub suppliers: u64,
    pub inventory: u64,
}

impl EntityCounts {
    pub fn get(&self, kind: EntityKind) -> u64 {
        match kind {
            EntityKind::Products => self.products,
            EntityKind::Sales => self.sales,
            EntityKind::Users => self.users,
            EntityKind::Suppliers => self.suppliers,
            EntityKind::Inventory => self.inventory,
        }
    }

    pub fn set(&mut self, kind: EntityKind, count: u64) {
        match kind {
            EntityKind::Products => self.products = count,
            EntityKind::Sales => self.sales = count,
            EntityKind::Users => self.users = count,
            EntityKind::Suppliers => self.suppliers = count,
            EntityKind::Inventory => self.inventory = count,
        }
    }

    pub fn total(&self) -> u64 {
        EntityKind::ALL.iter().map(|kind| self.get(*kind)).sum()
    }

    /// Counts the records actually present in a payload.
    pub fn of_tables(tables: &EntityTables) -> Self {
        let mut counts = EntityCounts::default();
        for kind in EntityKind::ALL {
            let count = tables.get(kind.table_name()).map_or(0, Vec::len);
            counts.set(kind, count as u64);
        }
        counts
    }
}

// =============================================================================
// Backup Info
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    Creating,
    Completed,
    Failed,
}

/// Index entry describing one backup artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct BackupInfo {
    pub backup_id: String,
    #[ts(as = "String")]
    pub timestamp: DateTime<Utc>,
    /// Stored payload size in bytes.
    pub size: u64,
    pub entities: EntityCounts,
    pub compression_ratio: f64,
    pub encryption_enabled: bool,
    pub device_id: String,
    pub user_id: String,
    pub status: BackupStatus,
    pub include_media: bool,
    pub checksum: String,
}

// =============================================================================
// Backup Payload
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub backup_id: String,
    pub timestamp: DateTime<Utc>,
    pub device_id: String,
    pub user_id: String,
    pub schema_version: u32,
    pub app_version: String,
    pub include_media: bool,
}

/// The stored artifact of a backup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupPayload {
    pub metadata: BackupMetadata,
    pub entities: EntityTables,
    pub checksum: String,
}

impl BackupPayload {
    /// Required metadata fields that are missing or empty.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let meta = &self.metadata;
        let mut missing = Vec::new();
        if meta.backup_id.trim().is_empty() {
            missing.push("backup_id");
        }
        if meta.device_id.trim().is_empty() {
            missing.push("device_id");
        }
        if meta.user_id.trim().is_empty() {
            missing.push("user_id");
        }
        if meta.app_version.trim().is_empty() {
            missing.push("app_version");
        }
        if self.checksum.trim().is_empty() {
            missing.push("checksum");
        }
        missing
    }

    /// Checks the payload against its index entry. Read-only.
    pub fn verify_against(&self, info: &BackupInfo) -> BackupVerification {
        let mut issues: Vec<String> = self
            .missing_fields()
            .into_iter()
            .map(|field| format!("missing metadata field: {}", field))
            .collect();

        if self.metadata.backup_id != info.backup_id {
            issues.push(format!(
                "payload belongs to backup {} not {}",
                self.metadata.backup_id, info.backup_id
            ));
        }

        if self.metadata.schema_version > CURRENT_SCHEMA_VERSION {
            issues.push(format!(
                "schema version {} is newer than supported {}",
                self.metadata.schema_version, CURRENT_SCHEMA_VERSION
            ));
        }

        for table in self.entities.keys() {
            if EntityKind::from_table(table).is_none() {
                issues.push(format!("unknown entity table: {}", table));
            }
        }

        let actual = EntityCounts::of_tables(&self.entities);
        for kind in EntityKind::ALL {
            if actual.get(kind) != info.entities.get(kind) {
                issues.push(format!(
                    "{} count mismatch: index records {}, payload holds {}",
                    kind,
                    info.entities.get(kind),
                    actual.get(kind)
                ));
            }
        }

        match checksum_tables(&self.entities) {
            Ok(sum) if sum == self.checksum && sum == info.checksum => {}
            Ok(sum) => issues.push(format!(
                "checksum mismatch: payload {}, index {}, computed {}",
                self.checksum, info.checksum, sum
            )),
            Err(e) => issues.push(format!("checksum could not be computed: {}", e)),
        }

        BackupVerification {
            backup_id: info.backup_id.clone(),
            valid: issues.is_empty(),
            issues,
        }
    }
}

/// Result of a read-only backup check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct BackupVerification {
    pub backup_id: String,
    pub valid: bool,
    pub issues: Vec<String>,
}

// =============================================================================
// Restore Info
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum RestoreStatus {
    InProgress,
    Completed,
    Failed,
}

/// Progress of one restore attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct RestoreInfo {
    pub restore_id: String,
    pub backup_id: String,
    #[ts(as = "String")]
    pub timestamp: DateTime<Utc>,
    pub status: RestoreStatus,
    /// 0..=100
    pub progress: u8,
    pub entities_restored: EntityCounts,
    /// Records skipped (invalid, unauthorized, or failed to write).
    pub skipped: EntityCounts,
    pub error_message: Option<String>,
}

impl RestoreInfo {
    pub fn start(backup_id: impl Into<String>) -> Self {
        RestoreInfo {
            restore_id: uuid::Uuid::new_v4().to_string(),
            backup_id: backup_id.into(),
            timestamp: Utc::now(),
            status: RestoreStatus::InProgress,
            progress: 0,
            entities_restored: EntityCounts::default(),
            skipped: EntityCounts::default(),
            error_message: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status != RestoreStatus::InProgress
    }
}

// =============================================================================
// Automatic Backup Interval
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum BackupInterval {
    Daily,
    Weekly,
    Monthly,
}

impl BackupInterval {
    /// Timer period; a month is 30 days.
    pub const fn period(&self) -> Duration {
        const DAY: u64 = 24 * 60 * 60;
        match self {
            BackupInterval::Daily => Duration::from_secs(DAY),
            BackupInterval::Weekly => Duration::from_secs(7 * DAY),
            BackupInterval::Monthly => Duration::from_secs(30 * DAY),
        }
    }
}

impl std::str::FromStr for BackupInterval {
    type Err = crate::error::CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "daily" => Ok(BackupInterval::Daily),
            "weekly" => Ok(BackupInterval::Weekly),
            "monthly" => Ok(BackupInterval::Monthly),
            other => Err(crate::error::CoreError::Malformed(format!(
                "Unknown backup interval: '{}'. Valid options: daily, weekly, monthly",
                other
            ))),
        }
    }
}
