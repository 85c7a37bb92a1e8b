//! # tally-core: Pure Types for the Tally POS Sync Core
//!
//! Everything the sync and backup engines exchange, with zero I/O.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Tally POS Architecture                           │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │              UI / business layer (out of this workspace)        │   │
//! │  │    catalog, cart, checkout ──► local mutations                 │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │          tally-sync (SyncEngine, BackupEngine, ...)             │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ tally-core (THIS CRATE) ★                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │   sync    │  │  backup   │  │   merge   │  │   │
//! │  │   │  Product  │  │ ChangeRec │  │BackupInfo │  │ 3-way diff│  │   │
//! │  │   │   Sale    │  │ Snapshot  │  │RestoreInfo│  │field merge│  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                    tally-db (Database Layer)                    │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Entities (Product, Sale, User, Supplier, InventoryMovement)
//! - [`sync`] - Change records, conflicts, snapshots, sync configuration
//! - [`backup`] - Backup and restore records
//! - [`merge`] - Natural keys, content comparison and field-level merge
//! - [`validation`] - Business rule validation
//! - [`error`] - Domain error types

// =============================================================================
// Module Declarations
// =============================================================================

pub mod backup;
pub mod error;
pub mod merge;
pub mod sync;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use backup::*;
pub use error::{CoreError, CoreResult, ValidationError};
pub use sync::*;
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Schema version written into snapshots and backup payloads.
///
/// Payloads carrying a newer version are rejected instead of being
/// half-understood.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Application version recorded in backup metadata.
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
