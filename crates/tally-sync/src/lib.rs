//! # tally-sync: Sync and Backup Engines for Tally POS
//!
//! Keeps a device's local store and the cloud snapshot store in step, and
//! takes point-in-time backups, while the register keeps selling offline.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Core Architecture                           │
//! │                                                                         │
//! │  local mutations ──► DatabaseStore ──► entity row + ChangeRecord       │
//! │                                        (one transaction)               │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                   SyncEngine (orchestrator)                      │  │
//! │  │                                                                  │  │
//! │  │  scheduler armed while the connection allows syncing             │  │
//! │  │  one cycle at a time: upload → download → merge                  │  │
//! │  └────────┬──────────────────────┬───────────────────────┬──────────┘  │
//! │           ▼                      ▼                       ▼              │
//! │  ┌────────────────┐  ┌────────────────────┐  ┌────────────────────┐    │
//! │  │   ChangeLog    │  │   CloudStorage     │  │ ConflictResolver   │    │
//! │  │                │  │                    │  │                    │    │
//! │  │ pending →      │  │ CloudBackend trait │  │ local / remote /   │    │
//! │  │ syncing →      │  │ HTTP or in-memory  │  │ field merge /      │    │
//! │  │ synced/failed  │  │ retry with backoff │  │ manual             │    │
//! │  └────────────────┘  └─────────┬──────────┘  └────────────────────┘    │
//! │                                │                                        │
//! │                      ┌─────────▼──────────┐  ┌────────────────────┐    │
//! │                      │  NetworkMonitor    │  │   BackupEngine     │    │
//! │                      │                    │  │                    │    │
//! │                      │ probe + watch      │  │ create / restore / │    │
//! │                      │ channel of state   │  │ verify / schedule  │    │
//! │                      └────────────────────┘  └────────────────────┘    │
//! │                                                                         │
//! │  EVENTS (SyncEventEmitter):                                            │
//! │  • status   - Idle / Syncing / Failed / Offline                        │
//! │  • progress - pending and synced change counts                         │
//! │  • error    - cycle failures, with a retryable flag                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`engine`] - `SyncEngine`, its builder, reports and scheduler
//! - [`backup`] - `BackupEngine` and the automatic backup schedule
//! - [`change_log`] - Change record bookkeeping over the repository
//! - [`cloud`] - `CloudStorage` and its backends
//! - [`conflict`] - Built-in conflict resolvers
//! - [`network`] - Connectivity probes and `NetworkMonitor`
//! - [`store`] - Entity store and access control seams
//! - [`config`] - TOML + env configuration for the daemon
//! - [`error`] - Sync error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tally_sync::{CloudStorage, MemoryBackend, NetworkMonitor, SyncEngine, TcpProbe};
//!
//! let network = Arc::new(NetworkMonitor::new(TcpProbe::new("1.1.1.1:443", timeout)));
//! let cloud = Arc::new(CloudStorage::new(Arc::new(MemoryBackend::new()), network));
//! cloud.authenticate(MemoryBackend::TOKEN, None).await?;
//!
//! let engine = SyncEngine::builder(database, cloud).build().await?;
//! let report = engine.start_sync().await?;
//! println!("uploaded {} changes", report.changes_uploaded);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod backup;
pub mod change_log;
pub mod cloud;
pub mod config;
pub mod conflict;
pub mod engine;
pub mod error;
pub mod network;
pub mod store;

mod guard;

// =============================================================================
// Re-exports
// =============================================================================

pub use backup::BackupEngine;
pub use change_log::ChangeLog;
pub use cloud::{CloudBackend, CloudStorage, HttpBackend, MemoryBackend, StorageInfo, UploadReport};
pub use config::TallyConfig;
pub use conflict::{resolver_for, ConflictResolver, Resolution};
pub use engine::{
    CycleOutcome, EngineOptions, MergeStats, NoOpEmitter, PhaseOutcome, SyncEngine,
    SyncEngineBuilder, SyncEventEmitter, SyncKind, SyncReport,
};
pub use error::{SyncError, SyncResult};
pub use network::{ConnectivityProbe, NetworkMonitor, PollingHandle, StaticProbe, TcpProbe};
pub use store::{AccessControl, DatabaseStore, EntityStore, StaticAccess};
