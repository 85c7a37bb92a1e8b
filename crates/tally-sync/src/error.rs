//! # Sync Error Types
//!
//! Error types for sync and backup operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │  Connectivity   │  │   Data Integrity        │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Offline        │  │  ChecksumMismatch       │ │
//! │  │  InvalidUrl     │  │  Unreachable    │  │  InvalidSnapshot        │ │
//! │  │  ConfigLoad/Save│  │  Http, Timeout  │  │  UnsupportedSchema      │ │
//! │  └─────────────────┘  └─────────────────┘  │  InvalidBackup          │ │
//! │                                            └─────────────────────────┘ │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Authorization  │  │     Retry       │  │   Engine State          │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  NotAuthent.    │  │ RetriesExhausted│  │  BackupInProgress       │ │
//! │  │  PermissionDen. │  │                 │  │  *NotFound              │ │
//! │  │                 │  │                 │  │  RestoreFailed          │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Conflicts are not errors: a diverged record becomes a
//! [`SyncConflict`](tally_core::SyncConflict) row.

use thiserror::Error;

use tally_core::CoreError;
use tally_db::DbError;

/// Result type alias for sync and backup operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering all sync and backup failures.
///
/// ## Propagation
/// - Background loops (periodic sync, scheduled backups) log and continue
/// - User-triggered operations return these to the caller
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid sync configuration.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Invalid cloud endpoint URL.
    #[error("Invalid endpoint URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Connectivity Errors
    // =========================================================================
    /// The device has no usable network connection.
    ///
    /// ## When This Occurs
    /// - `force_sync_now` while the monitor reports offline
    /// - Upload attempted with no connectivity
    #[error("Cannot sync while offline")]
    Offline,

    /// Online, but the storage backend cannot be reached.
    #[error("Cloud backend unreachable: {0}")]
    BackendUnreachable(String),

    /// Backend answered with a non-success status.
    #[error("Cloud backend returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// Request timeout.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    // =========================================================================
    // Data Integrity Errors
    // =========================================================================
    /// Recomputed checksum differs from the recorded one.
    ///
    /// ## When This Occurs
    /// - Snapshot altered in transit or at rest
    /// - Backup payload edited after completion
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// Snapshot structure is incomplete or inconsistent.
    #[error("Invalid snapshot: {0}")]
    InvalidSnapshot(String),

    /// Payload written by a newer schema.
    #[error("Unsupported schema version {found} (supported: {supported})")]
    UnsupportedSchema { found: u32, supported: u32 },

    /// Backup payload failed structural or count verification.
    #[error("Invalid backup {backup_id}: {reason}")]
    InvalidBackup { backup_id: String, reason: String },

    // =========================================================================
    // Authorization Errors
    // =========================================================================
    /// Cloud operation attempted before `authenticate`.
    #[error("Cloud storage is not authenticated")]
    NotAuthenticated,

    /// Acting principal lacks a capability.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    // =========================================================================
    // Retry Errors
    // =========================================================================
    /// Bounded retry loop ran out of attempts.
    #[error("Gave up after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    // =========================================================================
    // Database / Serialization Errors
    // =========================================================================
    /// Database query failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Failed to serialize or deserialize.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    // =========================================================================
    // Engine State Errors
    // =========================================================================
    /// A backup is already being created by this engine.
    #[error("A backup is already in progress")]
    BackupInProgress,

    #[error("Backup not found: {0}")]
    BackupNotFound(String),

    #[error("Conflict not found: {0}")]
    ConflictNotFound(String),

    #[error("Restore not found: {0}")]
    RestoreNotFound(String),

    /// A restore stopped part way; its status stays queryable.
    #[error("Restore {restore_id} failed: {reason}")]
    RestoreFailed { restore_id: String, reason: String },

    /// A conflict resolution request cannot be carried out.
    ///
    /// ## When This Occurs
    /// - Manual strategy chosen without a resolved record
    #[error("Invalid resolution: {0}")]
    InvalidResolution(String),

    /// Operation not supported for this entity kind.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Internal engine error.
    #[error("Internal error: {0}")]
    Internal(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<DbError> for SyncError {
    fn from(err: DbError) -> Self {
        SyncError::DatabaseError(err.to_string())
    }
}

impl From<CoreError> for SyncError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::ChecksumMismatch { expected, actual } => {
                SyncError::ChecksumMismatch { expected, actual }
            }
            CoreError::UnsupportedSchema { found, supported } => {
                SyncError::UnsupportedSchema { found, supported }
            }
            CoreError::Serialization(msg) => SyncError::SerializationFailed(msg),
            other => SyncError::InvalidSnapshot(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SyncError::Timeout(0)
        } else if let Some(status) = err.status() {
            SyncError::Http {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else if err.is_decode() {
            SyncError::SerializationFailed(err.to_string())
        } else {
            SyncError::BackendUnreachable(err.to_string())
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        SyncError::DatabaseError(err.to_string())
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Returns true if the operation may succeed on a later attempt.
    ///
    /// ## Retryable Errors
    /// - Offline / unreachable backend
    /// - Timeouts
    /// - 5xx and 429 responses
    ///
    /// ## Non-Retryable Errors
    /// - Configuration and authorization errors
    /// - Integrity failures (the same bytes will fail again)
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Offline | SyncError::BackendUnreachable(_) | SyncError::Timeout(_) => true,
            SyncError::Http { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }

    /// Returns true if the payload itself is untrustworthy.
    pub fn is_integrity_error(&self) -> bool {
        matches!(
            self,
            SyncError::ChecksumMismatch { .. }
                | SyncError::InvalidSnapshot(_)
                | SyncError::UnsupportedSchema { .. }
                | SyncError::InvalidBackup { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(SyncError::Offline.is_retryable());
        assert!(SyncError::BackendUnreachable("refused".into()).is_retryable());
        assert!(SyncError::Timeout(30).is_retryable());
        assert!(SyncError::Http { status: 503, message: "busy".into() }.is_retryable());

        assert!(!SyncError::Http { status: 400, message: "bad".into() }.is_retryable());
        assert!(!SyncError::NotAuthenticated.is_retryable());
        assert!(!SyncError::InvalidConfig("bad config".into()).is_retryable());
    }

    #[test]
    fn test_core_errors_map_to_integrity() {
        let err: SyncError = CoreError::ChecksumMismatch {
            expected: "aa".into(),
            actual: "bb".into(),
        }
        .into();
        assert!(err.is_integrity_error());

        let err: SyncError = CoreError::UnsupportedSchema { found: 9, supported: 1 }.into();
        assert!(matches!(err, SyncError::UnsupportedSchema { found: 9, .. }));
    }

    #[test]
    fn test_error_display() {
        let err = SyncError::RetriesExhausted {
            attempts: 3,
            last_error: "connection refused".into(),
        };
        assert!(err.to_string().contains("3 attempts"));
        assert!(SyncError::Offline.to_string().contains("offline"));
    }
}
