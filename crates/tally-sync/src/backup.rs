//! # Backup Engine
//!
//! Point-in-time exports of every entity table, kept apart from the sync
//! stream.
//!
//! ## Storage
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  create_backup()                                                        │
//! │    products ─┐                                                          │
//! │    suppliers ┤  each collected on its own; a failing table is backed    │
//! │    users ────┤  up as empty with a warning                              │
//! │    sales ────┤                                                          │
//! │    inventory ┘                                                          │
//! │         │                                                               │
//! │         ▼                                                               │
//! │  BackupPayload (JSON + sha256) ──► backup_payloads[backup_id]           │
//! │  BackupInfo ─────────────────────► settings["backup_index"]             │
//! │                                    newest first, capped at max_backups  │
//! │                                                                         │
//! │  payload write, index write and eviction commit in one transaction      │
//! │                                                                         │
//! │  index entry: creating ──► completed                                    │
//! │                        └─► failed (write error or interrupted run)      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use crate::guard::FlagGuard;
use crate::store::{AccessControl, EntityStore};
use tally_core::merge::natural_key;
use tally_core::{
    checksum_tables, BackupInfo, BackupInterval, BackupMetadata, BackupPayload, BackupStatus,
    BackupVerification, Capability, EntityCounts, EntityKind, EntityTables, RestoreInfo,
    RestoreStatus, APP_VERSION, CURRENT_SCHEMA_VERSION,
};
use tally_db::Database;

/// Recorded as the author of backups made without a signed-in user.
const SYSTEM_USER: &str = "system";

struct AutoBackupHandle {
    interval: BackupInterval,
    shutdown_tx: mpsc::Sender<()>,
}

pub struct BackupEngine {
    db: Database,
    store: Arc<dyn EntityStore>,
    access: Arc<dyn AccessControl>,
    device_id: String,
    max_backups: usize,
    creating: AtomicBool,
    /// Serializes read-modify-write of the backup index.
    index_lock: Mutex<()>,
    restores: RwLock<HashMap<String, RestoreInfo>>,
    auto: Mutex<Option<AutoBackupHandle>>,
}

impl BackupEngine {
    pub fn new(
        db: Database,
        store: Arc<dyn EntityStore>,
        access: Arc<dyn AccessControl>,
        device_id: impl Into<String>,
        max_backups: usize,
    ) -> Self {
        BackupEngine {
            db,
            store,
            access,
            device_id: device_id.into(),
            max_backups: max_backups.max(1),
            creating: AtomicBool::new(false),
            index_lock: Mutex::new(()),
            restores: RwLock::new(HashMap::new()),
            auto: Mutex::new(None),
        }
    }

    // =========================================================================
    // Create / List / Delete
    // =========================================================================

    /// Exports all entity tables. Fails with [`SyncError::BackupInProgress`]
    /// while another backup is being created.
    ///
    /// Media files are not part of the entity store; `include_media` is
    /// recorded in the metadata only.
    pub async fn create_backup(&self, include_media: bool) -> SyncResult<BackupInfo> {
        let _creating = FlagGuard::try_acquire(&self.creating).ok_or(SyncError::BackupInProgress)?;

        let user_id = self
            .access
            .current_user()
            .unwrap_or_else(|| SYSTEM_USER.to_string());
        let pending = BackupInfo {
            backup_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            size: 0,
            entities: EntityCounts::default(),
            compression_ratio: 1.0,
            encryption_enabled: false,
            device_id: self.device_id.clone(),
            user_id,
            status: BackupStatus::Creating,
            include_media,
            checksum: String::new(),
        };
        self.open_entry(&pending).await?;
        debug!(backup_id = %pending.backup_id, include_media, "Creating backup");

        match self.write_backup(pending.clone()).await {
            Ok(info) => Ok(info),
            Err(e) => {
                error!(backup_id = %pending.backup_id, %e, "Backup failed");
                if let Err(mark) = self.mark_failed(&pending.backup_id).await {
                    warn!(backup_id = %pending.backup_id, %mark, "Could not record backup failure");
                }
                Err(e)
            }
        }
    }

    /// Adds the CREATING index entry. Entries still CREATING at this point
    /// were left by an interrupted run (creation is serial) and become FAILED.
    async fn open_entry(&self, pending: &BackupInfo) -> SyncResult<()> {
        let _index = self.index_lock.lock().await;
        let backups = self.db.backups();
        let mut index = backups.load_index().await?;

        for stale in index.iter_mut().filter(|b| b.status == BackupStatus::Creating) {
            warn!(backup_id = %stale.backup_id, "Marking interrupted backup as failed");
            stale.status = BackupStatus::Failed;
        }
        index.insert(0, pending.clone());
        backups.save_index(&index).await?;
        Ok(())
    }

    async fn write_backup(&self, pending: BackupInfo) -> SyncResult<BackupInfo> {
        let mut entities = EntityTables::new();
        for kind in EntityKind::ALL {
            let records = match self.store.list(kind).await {
                Ok(records) => records,
                Err(e) => {
                    warn!(table = %kind, %e, "Could not export table, backing up no records");
                    Vec::new()
                }
            };
            entities.insert(kind.table_name().to_string(), records);
        }

        let checksum = checksum_tables(&entities)?;
        let payload = BackupPayload {
            metadata: BackupMetadata {
                backup_id: pending.backup_id.clone(),
                timestamp: pending.timestamp,
                device_id: pending.device_id.clone(),
                user_id: pending.user_id.clone(),
                schema_version: CURRENT_SCHEMA_VERSION,
                app_version: APP_VERSION.to_string(),
                include_media: pending.include_media,
            },
            entities,
            checksum: checksum.clone(),
        };
        let raw = serde_json::to_string(&payload)?;

        let info = BackupInfo {
            size: raw.len() as u64,
            entities: EntityCounts::of_tables(&payload.entities),
            status: BackupStatus::Completed,
            checksum,
            ..pending
        };

        let _index = self.index_lock.lock().await;
        let backups = self.db.backups();
        let mut index = backups.load_index().await?;
        index.retain(|b| b.backup_id != info.backup_id);
        index.push(info.clone());
        index.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        let evicted: Vec<String> = if index.len() > self.max_backups {
            index
                .split_off(self.max_backups)
                .into_iter()
                .map(|old| old.backup_id)
                .collect()
        } else {
            Vec::new()
        };
        backups.store(&info.backup_id, &raw, &index, &evicted).await?;

        info!(
            backup_id = %info.backup_id,
            size = info.size,
            records = info.entities.total(),
            evicted = evicted.len(),
            "Backup created"
        );
        Ok(info)
    }

    async fn mark_failed(&self, backup_id: &str) -> SyncResult<()> {
        let _index = self.index_lock.lock().await;
        let backups = self.db.backups();
        let mut index = backups.load_index().await?;
        if let Some(entry) = index.iter_mut().find(|b| b.backup_id == backup_id) {
            entry.status = BackupStatus::Failed;
            backups.save_index(&index).await?;
        }
        Ok(())
    }

    /// Newest first.
    pub async fn list_backups(&self) -> SyncResult<Vec<BackupInfo>> {
        let mut index = self.db.backups().load_index().await?;
        index.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(index)
    }

    pub async fn get_backup(&self, backup_id: &str) -> SyncResult<Option<BackupInfo>> {
        Ok(self
            .db
            .backups()
            .load_index()
            .await?
            .into_iter()
            .find(|b| b.backup_id == backup_id))
    }

    /// Removes the index entry and payload together.
    pub async fn delete_backup(&self, backup_id: &str) -> SyncResult<()> {
        self.require(Capability::ManageBackups, "delete backups")?;

        let _index = self.index_lock.lock().await;
        let backups = self.db.backups();
        let mut index = backups.load_index().await?;
        let before = index.len();
        index.retain(|b| b.backup_id != backup_id);
        if index.len() == before {
            return Err(SyncError::BackupNotFound(backup_id.to_string()));
        }

        backups.remove(backup_id, &index).await?;
        info!(backup_id = %backup_id, "Backup deleted");
        Ok(())
    }

    // =========================================================================
    // Verification
    // =========================================================================

    /// Checks structure, counts and checksum without changing anything.
    pub async fn verify_backup(&self, backup_id: &str) -> SyncResult<BackupVerification> {
        let info = self
            .get_backup(backup_id)
            .await?
            .ok_or_else(|| SyncError::BackupNotFound(backup_id.to_string()))?;

        if info.status != BackupStatus::Completed {
            return Ok(BackupVerification {
                valid: false,
                issues: vec![format!("backup status is {:?}", info.status).to_lowercase()],
                backup_id: info.backup_id,
            });
        }

        Ok(match self.load_payload(&info).await {
            Ok(payload) => payload.verify_against(&info),
            Err(e) => BackupVerification {
                backup_id: info.backup_id,
                valid: false,
                issues: vec![e.to_string()],
            },
        })
    }

    pub async fn validate_backup_integrity(&self, backup_id: &str) -> SyncResult<bool> {
        Ok(self.verify_backup(backup_id).await?.valid)
    }

    async fn load_payload(&self, info: &BackupInfo) -> SyncResult<BackupPayload> {
        let invalid = |reason: String| SyncError::InvalidBackup {
            backup_id: info.backup_id.clone(),
            reason,
        };

        let raw = self
            .db
            .backups()
            .payload(&info.backup_id)
            .await?
            .ok_or_else(|| invalid("payload missing".into()))?;
        serde_json::from_str(&raw).map_err(|e| invalid(format!("payload unreadable: {}", e)))
    }

    // =========================================================================
    // Restore
    // =========================================================================

    /// Restores a verified backup, table by table in dependency order.
    ///
    /// Records already present (by natural key) count as restored and are
    /// left untouched; records that cannot be written are skipped. Users are
    /// restored only when the caller may manage users.
    pub async fn restore_from_backup(&self, backup_id: &str) -> SyncResult<RestoreInfo> {
        self.require(Capability::ManageBackups, "restore backups")?;

        let info = self
            .get_backup(backup_id)
            .await?
            .ok_or_else(|| SyncError::BackupNotFound(backup_id.to_string()))?;
        let payload = self.load_payload(&info).await?;

        let verification = payload.verify_against(&info);
        if !verification.valid {
            warn!(backup_id = %backup_id, issues = ?verification.issues, "Refusing to restore backup");
            return Err(SyncError::InvalidBackup {
                backup_id: backup_id.to_string(),
                reason: verification.issues.join("; "),
            });
        }

        let mut restore = RestoreInfo::start(backup_id);
        self.track(&restore).await;
        info!(restore_id = %restore.restore_id, backup_id = %backup_id, "Restore started");

        let may_restore_users = self.access.has_permission(Capability::ManageUsers);
        let steps = EntityKind::ALL.len();

        for (step, kind) in EntityKind::ALL.into_iter().enumerate() {
            let records = payload
                .entities
                .get(kind.table_name())
                .map(Vec::as_slice)
                .unwrap_or(&[]);

            if kind == EntityKind::Users && !may_restore_users {
                if !records.is_empty() {
                    warn!(count = records.len(), "Skipping users: caller may not manage users");
                }
                restore.skipped.set(kind, records.len() as u64);
            } else {
                let (restored, skipped) = match self.restore_records(kind, records).await {
                    Ok(counts) => counts,
                    Err(e) => {
                        restore.status = RestoreStatus::Failed;
                        restore.error_message = Some(e.to_string());
                        self.track(&restore).await;
                        error!(restore_id = %restore.restore_id, table = %kind, %e, "Restore aborted");
                        return Err(SyncError::RestoreFailed {
                            restore_id: restore.restore_id,
                            reason: e.to_string(),
                        });
                    }
                };
                restore.entities_restored.set(kind, restored);
                restore.skipped.set(kind, skipped);
            }

            restore.progress = (((step + 1) * 100) / steps) as u8;
            self.track(&restore).await;
        }

        restore.status = RestoreStatus::Completed;
        self.track(&restore).await;

        info!(
            restore_id = %restore.restore_id,
            restored = restore.entities_restored.total(),
            skipped = restore.skipped.total(),
            "Restore completed"
        );
        Ok(restore)
    }

    /// Returns `(restored, skipped)`. A failed lookup means the store is
    /// unusable and aborts the restore; a failed write skips the record.
    async fn restore_records(&self, kind: EntityKind, records: &[Value]) -> SyncResult<(u64, u64)> {
        let mut restored = 0;
        let mut skipped = 0;

        for record in records {
            let key = match natural_key(kind, record) {
                Ok(key) => key,
                Err(e) => {
                    warn!(table = %kind, %e, "Skipping record without a natural key");
                    skipped += 1;
                    continue;
                }
            };

            let written = match self.store.find_by_key(kind, &key).await? {
                Some(_) => Ok(()),
                None => self.store.insert(kind, record).await,
            };
            match written {
                Ok(()) => restored += 1,
                Err(e) => {
                    warn!(table = %kind, key = %key, %e, "Skipping record");
                    skipped += 1;
                }
            }
        }
        Ok((restored, skipped))
    }

    async fn track(&self, restore: &RestoreInfo) {
        self.restores
            .write()
            .await
            .insert(restore.restore_id.clone(), restore.clone());
    }

    pub async fn get_restore_status(&self, restore_id: &str) -> SyncResult<RestoreInfo> {
        self.restores
            .read()
            .await
            .get(restore_id)
            .cloned()
            .ok_or_else(|| SyncError::RestoreNotFound(restore_id.to_string()))
    }

    fn require(&self, capability: Capability, action: &str) -> SyncResult<()> {
        if self.access.has_permission(capability) {
            Ok(())
        } else {
            Err(SyncError::PermissionDenied(format!(
                "not allowed to {}",
                action
            )))
        }
    }

    // =========================================================================
    // Automatic Backups
    // =========================================================================

    /// Replaces any existing automatic schedule. The first backup runs one
    /// period from now.
    pub async fn schedule_automatic_backup(self: &Arc<Self>, interval: BackupInterval) {
        let mut slot = self.auto.lock().await;
        if let Some(previous) = slot.take() {
            let _ = previous.shutdown_tx.send(()).await;
        }

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        tokio::spawn(auto_backup_loop(
            Arc::downgrade(self),
            interval.period(),
            shutdown_rx,
        ));
        *slot = Some(AutoBackupHandle {
            interval,
            shutdown_tx,
        });
        info!(?interval, "Automatic backup scheduled");
    }

    /// Idempotent.
    pub async fn cancel_automatic_backup(&self) {
        if let Some(handle) = self.auto.lock().await.take() {
            let _ = handle.shutdown_tx.send(()).await;
            info!(interval = ?handle.interval, "Automatic backup cancelled");
        }
    }

    pub async fn has_automatic_backup(&self) -> bool {
        self.auto.lock().await.is_some()
    }

    pub async fn automatic_backup_interval(&self) -> Option<BackupInterval> {
        self.auto.lock().await.as_ref().map(|handle| handle.interval)
    }
}

async fn auto_backup_loop(
    engine: Weak<BackupEngine>,
    period: Duration,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    let mut timer = interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = timer.tick() => {
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                match engine.create_backup(false).await {
                    Ok(info) => debug!(backup_id = %info.backup_id, "Automatic backup done"),
                    Err(SyncError::BackupInProgress) => debug!("Backup already running, tick skipped"),
                    Err(e) => error!(?e, "Automatic backup failed"),
                }
            }

            _ = shutdown_rx.recv() => {
                debug!("Automatic backup loop stopped");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change_log::ChangeLog;
    use crate::store::{DatabaseStore, StaticAccess};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use tally_core::{Product, UserRole};
    use tally_db::DbConfig;
    use tokio::sync::Notify;

    /// Database store that can hold the product export and fail lookups.
    struct HeldStore {
        inner: DatabaseStore,
        hold_export: Option<Arc<Notify>>,
        failing_lookups: Option<EntityKind>,
    }

    #[async_trait]
    impl EntityStore for HeldStore {
        async fn list(&self, kind: EntityKind) -> SyncResult<Vec<Value>> {
            if let (Some(hold), EntityKind::Products) = (&self.hold_export, kind) {
                hold.notified().await;
            }
            self.inner.list(kind).await
        }

        async fn find_by_key(&self, kind: EntityKind, key: &str) -> SyncResult<Option<Value>> {
            if self.failing_lookups == Some(kind) {
                return Err(SyncError::DatabaseError("database is locked".into()));
            }
            self.inner.find_by_key(kind, key).await
        }

        async fn insert(&self, kind: EntityKind, record: &Value) -> SyncResult<()> {
            self.inner.insert(kind, record).await
        }

        async fn replace(&self, kind: EntityKind, key: &str, record: &Value) -> SyncResult<()> {
            self.inner.replace(kind, key, record).await
        }
    }

    async fn held_engine(
        hold_export: Option<Arc<Notify>>,
        failing_lookups: Option<EntityKind>,
    ) -> (BackupEngine, DatabaseStore) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let inner = DatabaseStore::new(db.clone(), ChangeLog::new(&db, "device-a", 5));
        let store = HeldStore {
            inner: inner.clone(),
            hold_export,
            failing_lookups,
        };
        let engine = BackupEngine::new(
            db,
            Arc::new(store),
            Arc::new(StaticAccess::admin("owner")),
            "device-a",
            10,
        );
        (engine, inner)
    }

    async fn engine_with(access: StaticAccess, max_backups: usize) -> (BackupEngine, DatabaseStore, Database) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let store = DatabaseStore::new(db.clone(), ChangeLog::new(&db, "device-a", 5));
        let engine = BackupEngine::new(
            db.clone(),
            Arc::new(store.clone()),
            Arc::new(access),
            "device-a",
            max_backups,
        );
        (engine, store, db)
    }

    async fn engine() -> (BackupEngine, DatabaseStore, Database) {
        engine_with(StaticAccess::admin("owner"), 10).await
    }

    #[tokio::test]
    async fn test_create_backup_counts_entities() {
        let (engine, store, _db) = engine().await;
        for sku in ["A-1", "B-2", "C-3"] {
            store.insert_product(&Product::new(sku, "Item", 100)).await.unwrap();
        }

        let info = engine.create_backup(true).await.unwrap();
        assert_eq!(info.entities.products, 3);
        assert_eq!(info.entities.total(), 3);
        assert_eq!(info.status, BackupStatus::Completed);
        assert_eq!(info.user_id, "owner");
        assert!(info.include_media);
        assert!(info.size > 0);

        assert!(engine.validate_backup_integrity(&info.backup_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_second_concurrent_backup_is_rejected() {
        let (engine, _store, _db) = engine().await;

        let (first, second) = tokio::join!(engine.create_backup(false), engine.create_backup(false));
        let results = [first, second];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(SyncError::BackupInProgress))));
    }

    #[tokio::test]
    async fn test_index_is_capped_and_newest_first() {
        let (engine, _store, db) = engine_with(StaticAccess::admin("owner"), 2).await;

        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(engine.create_backup(false).await.unwrap().backup_id);
        }

        let listed: Vec<String> = engine
            .list_backups()
            .await
            .unwrap()
            .into_iter()
            .map(|b| b.backup_id)
            .collect();
        assert_eq!(listed, vec![ids[2].clone(), ids[1].clone()]);
        assert_eq!(db.backups().count_payloads().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_delete_backup() {
        let (engine, _store, db) = engine().await;
        let info = engine.create_backup(false).await.unwrap();

        engine.delete_backup(&info.backup_id).await.unwrap();
        assert!(engine.list_backups().await.unwrap().is_empty());
        assert_eq!(db.backups().count_payloads().await.unwrap(), 0);

        let err = engine.delete_backup(&info.backup_id).await.unwrap_err();
        assert!(matches!(err, SyncError::BackupNotFound(_)));
    }

    #[tokio::test]
    async fn test_cashier_cannot_delete_or_restore() {
        let (engine, _store, _db) = engine_with(StaticAccess::new("till-1", UserRole::Cashier), 10).await;
        let info = engine.create_backup(false).await.unwrap();

        assert!(matches!(
            engine.delete_backup(&info.backup_id).await,
            Err(SyncError::PermissionDenied(_))
        ));
        assert!(matches!(
            engine.restore_from_backup(&info.backup_id).await,
            Err(SyncError::PermissionDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_tampered_backup_fails_verification_and_restore() {
        let (engine, store, db) = engine().await;
        store.insert_product(&Product::new("A-1", "Apple", 50)).await.unwrap();
        let info = engine.create_backup(false).await.unwrap();

        let raw = db.backups().payload(&info.backup_id).await.unwrap().unwrap();
        let mut payload: BackupPayload = serde_json::from_str(&raw).unwrap();
        payload
            .entities
            .get_mut("products")
            .unwrap()
            .push(serde_json::to_value(Product::new("EXTRA", "Extra", 1)).unwrap());
        let tampered = serde_json::to_string(&payload).unwrap();

        let index = db.backups().load_index().await.unwrap();
        db.backups().remove(&info.backup_id, &index).await.unwrap();
        db.backups()
            .store(&info.backup_id, &tampered, &index, &[])
            .await
            .unwrap();

        let verification = engine.verify_backup(&info.backup_id).await.unwrap();
        assert!(!verification.valid);
        assert!(!verification.issues.is_empty());

        let err = engine.restore_from_backup(&info.backup_id).await.unwrap_err();
        assert!(err.is_integrity_error());
    }

    #[tokio::test]
    async fn test_missing_payload_reported_not_raised() {
        let (engine, _store, db) = engine().await;
        let info = engine.create_backup(false).await.unwrap();
        let index = db.backups().load_index().await.unwrap();
        db.backups().remove(&info.backup_id, &index).await.unwrap();

        let verification = engine.verify_backup(&info.backup_id).await.unwrap();
        assert!(!verification.valid);
        assert!(matches!(
            engine.verify_backup("unknown").await,
            Err(SyncError::BackupNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_restore_status_is_queryable() {
        let (engine, store, _db) = engine().await;
        store.insert_product(&Product::new("A-1", "Apple", 50)).await.unwrap();
        let info = engine.create_backup(false).await.unwrap();

        let restore = engine.restore_from_backup(&info.backup_id).await.unwrap();
        assert_eq!(restore.status, RestoreStatus::Completed);
        assert_eq!(restore.progress, 100);
        // Already present by SKU.
        assert_eq!(restore.entities_restored.products, 1);

        let status = engine.get_restore_status(&restore.restore_id).await.unwrap();
        assert_eq!(status, restore);
        assert!(matches!(
            engine.get_restore_status("nope").await,
            Err(SyncError::RestoreNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_manager_restore_skips_users() {
        let (engine, store, _db) =
            engine_with(StaticAccess::new("lead", UserRole::Manager), 10).await;
        let user = tally_core::User {
            id: Uuid::new_v4().to_string(),
            username: "till-2".into(),
            display_name: "Second Till".into(),
            role: UserRole::Cashier,
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store
            .insert(EntityKind::Users, &serde_json::to_value(&user).unwrap())
            .await
            .unwrap();
        let info = engine.create_backup(false).await.unwrap();
        assert_eq!(info.entities.users, 1);

        let restore = engine.restore_from_backup(&info.backup_id).await.unwrap();
        assert_eq!(restore.skipped.users, 1);
        assert_eq!(restore.entities_restored.users, 0);
    }

    #[tokio::test]
    async fn test_schedule_replaces_and_cancel_is_idempotent() {
        let (engine, _store, _db) = engine().await;
        let engine = Arc::new(engine);

        engine.schedule_automatic_backup(BackupInterval::Daily).await;
        engine.schedule_automatic_backup(BackupInterval::Weekly).await;
        assert_eq!(
            engine.automatic_backup_interval().await,
            Some(BackupInterval::Weekly)
        );

        engine.cancel_automatic_backup().await;
        engine.cancel_automatic_backup().await;
        assert!(!engine.has_automatic_backup().await);
    }

    #[tokio::test]
    async fn test_index_entry_is_creating_until_written() {
        let hold = Arc::new(Notify::new());
        let (engine, _store) = held_engine(Some(Arc::clone(&hold)), None).await;
        let engine = Arc::new(engine);

        let task = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.create_backup(false).await }
        });

        let pending = loop {
            if let Some(entry) = engine.list_backups().await.unwrap().into_iter().next() {
                break entry;
            }
            tokio::task::yield_now().await;
        };
        assert_eq!(pending.status, BackupStatus::Creating);
        assert!(!engine.validate_backup_integrity(&pending.backup_id).await.unwrap());

        hold.notify_one();
        let info = task.await.unwrap().unwrap();
        assert_eq!(info.backup_id, pending.backup_id);

        let listed = engine.list_backups().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, BackupStatus::Completed);
        assert!(engine.validate_backup_integrity(&info.backup_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_interrupted_backup_is_marked_failed() {
        let (engine, _store, db) = engine().await;
        let first = engine.create_backup(false).await.unwrap();

        // Left behind by a process that stopped mid-backup.
        let mut index = db.backups().load_index().await.unwrap();
        index[0].status = BackupStatus::Creating;
        db.backups().save_index(&index).await.unwrap();

        let second = engine.create_backup(false).await.unwrap();
        let listed = engine.list_backups().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].backup_id, second.backup_id);
        assert_eq!(listed[0].status, BackupStatus::Completed);
        assert_eq!(listed[1].backup_id, first.backup_id);
        assert_eq!(listed[1].status, BackupStatus::Failed);

        let verification = engine.verify_backup(&first.backup_id).await.unwrap();
        assert!(!verification.valid);
        assert_eq!(verification.issues, vec!["backup status is failed".to_string()]);
    }

    #[tokio::test]
    async fn test_restore_fails_when_store_lookups_fail() {
        let (engine, store) = held_engine(None, Some(EntityKind::Users)).await;
        store.insert_product(&Product::new("A-1", "Apple", 50)).await.unwrap();
        let user = tally_core::User {
            id: Uuid::new_v4().to_string(),
            username: "till-2".into(),
            display_name: "Second Till".into(),
            role: UserRole::Cashier,
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store
            .insert(EntityKind::Users, &serde_json::to_value(&user).unwrap())
            .await
            .unwrap();
        let info = engine.create_backup(false).await.unwrap();

        let err = engine.restore_from_backup(&info.backup_id).await.unwrap_err();
        let (restore_id, reason) = match err {
            SyncError::RestoreFailed { restore_id, reason } => (restore_id, reason),
            other => panic!("expected a failed restore, got {:?}", other),
        };
        assert!(reason.contains("database is locked"));

        let status = engine.get_restore_status(&restore_id).await.unwrap();
        assert_eq!(status.status, RestoreStatus::Failed);
        assert!(status.is_terminal());
        assert_eq!(status.entities_restored.products, 1);
        // Products and suppliers done before users failed.
        assert_eq!(status.progress, 40);
        assert!(status.error_message.is_some());
    }
}
