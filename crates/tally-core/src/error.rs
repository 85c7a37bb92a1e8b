//! # Error Types
//!
//! Domain-specific error types for tally-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  tally-core errors (this file)                                         │
//! │  ├── CoreError        - Snapshot / payload / record errors             │
//! │  └── ValidationError  - Entity validation failures                     │
//! │                                                                         │
//! │  tally-db errors (separate crate)                                      │
//! │  └── DbError          - Database operation failures                    │
//! │                                                                         │
//! │  tally-sync errors (separate crate)                                    │
//! │  └── SyncError        - What callers of the engines see                │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → SyncError → UI                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Errors raised while building or checking snapshots and records.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Recomputed checksum does not match the recorded one.
    ///
    /// ## When This Occurs
    /// - Snapshot payload altered in transit or at rest
    /// - Backup payload edited after completion
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// Payload written by a newer schema than this build understands.
    #[error("Unsupported schema version {found} (supported: {supported})")]
    UnsupportedSchema { found: u32, supported: u32 },

    /// Snapshot or payload structure is incomplete or inconsistent.
    #[error("Malformed payload: {0}")]
    Malformed(String),

    /// A single record could not be interpreted.
    ///
    /// ## When This Occurs
    /// - Remote record missing its natural key
    /// - Record JSON does not match the entity shape
    #[error("Invalid {table} record: {reason}")]
    InvalidRecord { table: String, reason: String },

    /// JSON encoding or decoding failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Serialization(err.to_string())
    }
}

// =============================================================================
// Validation Error
// =============================================================================

/// Entity validation errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Value must not be negative.
    #[error("{field} must not be negative")]
    Negative { field: String },

    /// Invalid format.
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;
