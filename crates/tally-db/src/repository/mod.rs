//! # Repository Module
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  SyncEngine / BackupEngine                                             │
//! │       │  db.change_log().drain_pending(100)                            │
//! │       ▼                                                                 │
//! │  Repositories (SQL isolated here)                                      │
//! │  ├── entities:   product, sale, user, supplier, inventory              │
//! │  ├── sync:       change_log, conflict, sync_base                       │
//! │  └── state:      settings, backup                                      │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SQLite                                                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Entity repositories expose `*_in(conn, ..)` variants so callers can put an
//! entity write and its change record into one transaction.

pub mod backup;
pub mod change_log;
pub mod conflict;
pub mod inventory;
pub mod product;
pub mod sale;
pub mod settings;
pub mod supplier;
pub mod sync_base;
pub mod user;
