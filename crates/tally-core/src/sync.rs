//! # Sync Records
//!
//! Types that describe local change tracking, remote snapshots, conflicts
//! and the persisted sync configuration.
//!
//! ## Record Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    ChangeRecord State Machine                           │
//! │                                                                         │
//! │   record()                                                              │
//! │      │                                                                  │
//! │      ▼                                                                  │
//! │  ┌────────┐ drain  ┌─────────┐ upload ok  ┌────────┐                   │
//! │  │PENDING │───────►│ SYNCING │───────────►│ SYNCED │                   │
//! │  └────────┘        └────┬────┘            └────────┘                   │
//! │      ▲                  │ upload failed                                 │
//! │      │ next drain       ▼                                               │
//! │      │             ┌────────┐ retry_count >= max  ┌─────────┐          │
//! │      └─────────────│ FAILED │────────────────────►│ DROPPED │          │
//! │                    └────────┘                     └─────────┘          │
//! │                                                                         │
//! │  CONFLICT / RESOLVED mark records touched by a conflict resolution.    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use ts_rs::TS;

use crate::error::{CoreError, CoreResult};
use crate::types::EntityKind;
use crate::CURRENT_SCHEMA_VERSION;

// =============================================================================
// Device Identity
// =============================================================================

/// Stable identifier of this installation.
///
/// Minted once, persisted, never rewritten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct DeviceIdentity {
    pub device_id: String,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
}

impl DeviceIdentity {
    /// Mints a fresh random identity.
    pub fn generate() -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string())
    }

    /// Wraps a preconfigured id.
    pub fn with_id(device_id: impl Into<String>) -> Self {
        DeviceIdentity {
            device_id: device_id.into(),
            created_at: Utc::now(),
        }
    }
}

// =============================================================================
// Change Records
// =============================================================================

/// Kind of local mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "UPPERCASE"))]
#[ts(export)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOperation {
    Create,
    Update,
    Delete,
}

/// Progress of a change record through the upload pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "UPPERCASE"))]
#[ts(export)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeStatus {
    Pending,
    Syncing,
    Synced,
    Failed,
    Conflict,
    Resolved,
    /// Retries exhausted; kept for inspection, never retried.
    Dropped,
}

impl ChangeStatus {
    /// Statuses picked up by the next drain.
    pub const fn is_drainable(&self) -> bool {
        matches!(self, ChangeStatus::Pending | ChangeStatus::Failed)
    }
}

/// One entry of the local change journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct ChangeRecord {
    pub id: String,
    pub table_name: String,
    pub record_id: String,
    pub operation: ChangeOperation,
    /// Serialized entity as it was after the mutation.
    pub data_snapshot: String,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
    #[ts(as = "Option<String>")]
    pub synced_at: Option<DateTime<Utc>>,
    pub device_id: String,
    pub sync_status: ChangeStatus,
    pub retry_count: i64,
    /// Monotonic per (table_name, record_id).
    pub version: i64,
    pub last_error: Option<String>,
}

/// Input for appending a change record; id and version are assigned on write.
#[derive(Debug, Clone)]
pub struct NewChange {
    pub operation: ChangeOperation,
    pub table_name: String,
    pub record_id: String,
    pub data_snapshot: String,
    pub device_id: String,
}

impl NewChange {
    pub fn new(
        operation: ChangeOperation,
        table_name: impl Into<String>,
        record_id: impl Into<String>,
        data_snapshot: impl Into<String>,
        device_id: impl Into<String>,
    ) -> Self {
        NewChange {
            operation,
            table_name: table_name.into(),
            record_id: record_id.into(),
            data_snapshot: data_snapshot.into(),
            device_id: device_id.into(),
        }
    }
}

/// Number of change records per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeCounts {
    pub pending: i64,
    pub syncing: i64,
    pub synced: i64,
    pub failed: i64,
    pub conflict: i64,
    pub resolved: i64,
    pub dropped: i64,
}

impl ChangeCounts {
    pub fn add(&mut self, status: ChangeStatus, count: i64) {
        match status {
            ChangeStatus::Pending => self.pending += count,
            ChangeStatus::Syncing => self.syncing += count,
            ChangeStatus::Synced => self.synced += count,
            ChangeStatus::Failed => self.failed += count,
            ChangeStatus::Conflict => self.conflict += count,
            ChangeStatus::Resolved => self.resolved += count,
            ChangeStatus::Dropped => self.dropped += count,
        }
    }
}

// =============================================================================
// Conflicts
// =============================================================================

/// How diverged records are reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "kebab-case"))]
#[ts(export)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    /// Keep the local record untouched.
    #[default]
    LocalWins,
    /// Overwrite local with the remote record.
    RemoteWins,
    /// Field-level reconciliation.
    Merge,
    /// Leave the conflict open for an operator.
    Manual,
}

impl std::fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictStrategy::LocalWins => write!(f, "local-wins"),
            ConflictStrategy::RemoteWins => write!(f, "remote-wins"),
            ConflictStrategy::Merge => write!(f, "merge"),
            ConflictStrategy::Manual => write!(f, "manual"),
        }
    }
}

impl std::str::FromStr for ConflictStrategy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "local-wins" | "local" => Ok(ConflictStrategy::LocalWins),
            "remote-wins" | "remote" => Ok(ConflictStrategy::RemoteWins),
            "merge" => Ok(ConflictStrategy::Merge),
            "manual" => Ok(ConflictStrategy::Manual),
            other => Err(CoreError::Malformed(format!(
                "Unknown conflict strategy: '{}'. Valid options: local-wins, remote-wins, merge, manual",
                other
            ))),
        }
    }
}

/// Two diverged versions of the same record.
///
/// `record_id` holds the natural key; surrogate ids differ per device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct SyncConflict {
    pub id: String,
    pub table_name: String,
    pub record_id: String,
    pub local_data: String,
    pub remote_data: String,
    pub local_version: i64,
    pub remote_version: i64,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
    pub resolution_strategy: Option<ConflictStrategy>,
    pub resolved_data: Option<String>,
    #[ts(as = "Option<String>")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl SyncConflict {
    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }
}

// =============================================================================
// Snapshots
// =============================================================================

/// Records per table name, as carried in snapshots and backups.
pub type EntityTables = BTreeMap<String, Vec<Value>>;

/// Integrity metadata attached to every snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SnapshotMetadata {
    pub total_records: u64,
    /// Lowercase hex SHA-256 over the canonical JSON of `data`.
    pub checksum: String,
    pub schema_version: u32,
}

/// A device's full point-in-time export of its syncable entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct CloudSyncData {
    pub device_id: String,
    #[ts(as = "String")]
    pub timestamp: DateTime<Utc>,
    /// Per-device upload counter.
    pub version: u64,
    #[ts(type = "Record<string, Array<unknown>>")]
    pub data: EntityTables,
    pub metadata: SnapshotMetadata,
}

/// Lowercase hex SHA-256 of the canonical JSON encoding of `tables`.
///
/// Object keys serialize in sorted order, so the digest is stable across a
/// serialize/deserialize round trip.
pub fn checksum_tables(tables: &EntityTables) -> CoreResult<String> {
    let bytes = serde_json::to_vec(tables)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

impl CloudSyncData {
    /// Builds a snapshot and stamps its integrity metadata.
    pub fn new(device_id: impl Into<String>, version: u64, data: EntityTables) -> CoreResult<Self> {
        let checksum = checksum_tables(&data)?;
        let total_records = data.values().map(|records| records.len() as u64).sum();

        Ok(CloudSyncData {
            device_id: device_id.into(),
            timestamp: Utc::now(),
            version,
            data,
            metadata: SnapshotMetadata {
                total_records,
                checksum,
                schema_version: CURRENT_SCHEMA_VERSION,
            },
        })
    }

    /// Records of one entity kind (empty when the table is absent).
    pub fn records(&self, kind: EntityKind) -> &[Value] {
        self.data
            .get(kind.table_name())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Recomputes the checksum and checks schema and record count.
    pub fn verify(&self) -> CoreResult<()> {
        if self.metadata.schema_version > CURRENT_SCHEMA_VERSION {
            return Err(CoreError::UnsupportedSchema {
                found: self.metadata.schema_version,
                supported: CURRENT_SCHEMA_VERSION,
            });
        }

        if self.device_id.trim().is_empty() {
            return Err(CoreError::Malformed("snapshot has no device_id".into()));
        }

        let actual = checksum_tables(&self.data)?;
        if actual != self.metadata.checksum {
            return Err(CoreError::ChecksumMismatch {
                expected: self.metadata.checksum.clone(),
                actual,
            });
        }

        let counted: u64 = self.data.values().map(|records| records.len() as u64).sum();
        if counted != self.metadata.total_records {
            return Err(CoreError::Malformed(format!(
                "snapshot declares {} records but carries {}",
                self.metadata.total_records, counted
            )));
        }

        Ok(())
    }

    /// Listing entry for this snapshot.
    pub fn summary(&self) -> SnapshotSummary {
        SnapshotSummary {
            device_id: self.device_id.clone(),
            timestamp: self.timestamp,
            version: self.version,
            total_records: self.metadata.total_records,
        }
    }
}

/// Lightweight description of a stored snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SnapshotSummary {
    pub device_id: String,
    #[ts(as = "String")]
    pub timestamp: DateTime<Utc>,
    pub version: u64,
    pub total_records: u64,
}

/// Identifies the last peer snapshot merged in full.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeCheckpoint {
    pub device_id: String,
    pub version: u64,
    pub checksum: String,
}

// =============================================================================
// Sync Configuration
// =============================================================================

/// Process-wide sync settings, persisted across restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SyncConfig {
    pub auto_sync_enabled: bool,
    pub sync_interval_minutes: u32,
    pub max_retry_attempts: u32,
    pub conflict_resolution_strategy: ConflictStrategy,
    pub device_id: String,
    #[ts(as = "Option<String>")]
    pub last_sync_timestamp: Option<DateTime<Utc>>,
    /// Skip background sync on metered connections.
    #[serde(default = "default_respect_metered")]
    pub respect_metered: bool,
}

fn default_respect_metered() -> bool {
    true
}

impl SyncConfig {
    /// Defaults for a device that has never synced.
    pub fn new(device_id: impl Into<String>) -> Self {
        SyncConfig {
            auto_sync_enabled: true,
            sync_interval_minutes: 15,
            max_retry_attempts: 5,
            conflict_resolution_strategy: ConflictStrategy::default(),
            device_id: device_id.into(),
            last_sync_timestamp: None,
            respect_metered: default_respect_metered(),
        }
    }
}

/// Partial update of [`SyncConfig`]; `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SyncConfigUpdate {
    pub auto_sync_enabled: Option<bool>,
    pub sync_interval_minutes: Option<u32>,
    pub max_retry_attempts: Option<u32>,
    pub conflict_resolution_strategy: Option<ConflictStrategy>,
    pub respect_metered: Option<bool>,
}

impl SyncConfigUpdate {
    /// Applies the update; returns true when the schedule must be re-armed.
    pub fn apply_to(&self, config: &mut SyncConfig) -> bool {
        let before = (
            config.auto_sync_enabled,
            config.sync_interval_minutes,
            config.respect_metered,
        );

        if let Some(enabled) = self.auto_sync_enabled {
            config.auto_sync_enabled = enabled;
        }
        if let Some(minutes) = self.sync_interval_minutes {
            config.sync_interval_minutes = minutes;
        }
        if let Some(max) = self.max_retry_attempts {
            config.max_retry_attempts = max;
        }
        if let Some(strategy) = self.conflict_resolution_strategy {
            config.conflict_resolution_strategy = strategy;
        }
        if let Some(respect) = self.respect_metered {
            config.respect_metered = respect;
        }

        before
            != (
                config.auto_sync_enabled,
                config.sync_interval_minutes,
                config.respect_metered,
            )
    }
}

// =============================================================================
// Engine State and Statistics
// =============================================================================

/// Sync engine state machine: `Idle → Syncing → {Idle, Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    #[default]
    Idle,
    Syncing,
    Failed,
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncState::Idle => write!(f, "idle"),
            SyncState::Syncing => write!(f, "syncing"),
            SyncState::Failed => write!(f, "failed"),
        }
    }
}

/// Aggregate counters exposed to the UI.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SyncStats {
    pub total_pending: i64,
    pub total_syncing: i64,
    pub total_synced: i64,
    pub total_failed: i64,
    pub total_dropped: i64,
    /// Unresolved conflicts.
    pub total_conflicts: i64,
    #[ts(as = "Option<String>")]
    pub last_sync_time: Option<DateTime<Utc>>,
}

// =============================================================================
// Network State
// =============================================================================

/// Physical link classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    Wifi,
    Cellular,
    Ethernet,
    #[default]
    Unknown,
}

/// Connectivity as last reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct NetworkState {
    pub is_online: bool,
    pub connection_type: ConnectionType,
    pub is_metered: bool,
    /// 0-100 where the platform reports it.
    pub signal_strength: Option<u8>,
}

impl NetworkState {
    /// Conservative state used when the platform cannot be queried.
    pub const fn offline() -> Self {
        NetworkState {
            is_online: false,
            connection_type: ConnectionType::Unknown,
            is_metered: false,
            signal_strength: None,
        }
    }

    pub const fn online(connection_type: ConnectionType, is_metered: bool) -> Self {
        NetworkState {
            is_online: true,
            connection_type,
            is_metered,
            signal_strength: None,
        }
    }

    /// True when a change from `other` is worth notifying subscribers about.
    pub fn differs_materially(&self, other: &NetworkState) -> bool {
        self.is_online != other.is_online
            || self.connection_type != other.connection_type
            || self.is_metered != other.is_metered
    }
}
