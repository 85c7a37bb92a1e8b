//! # Sync Engine
//!
//! Orchestrates upload, download and merge against the cloud store, and
//! keeps a periodic schedule armed while the connection allows syncing.
//!
//! ## Cycle Phases
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          One Sync Cycle                                 │
//! │                                                                         │
//! │  running flag (compare-exchange) ── taken? ──► report Skipped           │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  1. UPLOAD     drain change log → full snapshot of products + sales     │
//! │                → upload_with_retry → mark synced / mark failed          │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  2. DOWNLOAD   newest peer snapshot, checksum + schema verified          │
//! │                (incremental: skip if same as last merge checkpoint)     │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  3. MERGE      per record, by natural key, against the sync base:       │
//! │                  missing locally ........... insert                     │
//! │                  same content .............. unchanged                  │
//! │                  only remote moved ......... fast-forward               │
//! │                  only local moved .......... keep local                 │
//! │                  both moved ................ conflict → resolver        │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  4. BOOKKEEPING  last_sync_timestamp persisted, state Idle / Failed     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Phase failures are reported in [`SyncReport`] and never abort later
//! phases; a bad remote record is skipped without aborting the merge.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::time::{interval, interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::change_log::ChangeLog;
use crate::cloud::CloudStorage;
use crate::conflict::{resolver_for, ConflictResolver, Resolution};
use crate::error::{SyncError, SyncResult};
use crate::guard::FlagGuard;
use crate::store::{DatabaseStore, EntityStore};
use tally_core::merge::{
    classify, is_past_local_state, merge_fields, natural_key, record_version, same_content,
    MergeDecision,
};
use tally_core::{
    ChangeOperation, ChangeRecord, ChangeStatus, CloudSyncData, ConflictStrategy, EntityKind,
    EntityTables, MergeCheckpoint, NetworkState, SyncConfig, SyncConfigUpdate, SyncConflict,
    SyncState, SyncStats,
};
use tally_db::{keys, Database};

// =============================================================================
// Event Emitter Trait
// =============================================================================

/// Receives engine events (implemented by the UI integration).
pub trait SyncEventEmitter: Send + Sync {
    fn emit_status(&self, state: SyncState);

    /// Change log totals after a cycle.
    fn emit_progress(&self, pending: i64, synced: i64);

    fn emit_error(&self, message: &str, retryable: bool);
}

/// No-op event emitter for testing.
pub struct NoOpEmitter;

impl SyncEventEmitter for NoOpEmitter {
    fn emit_status(&self, _state: SyncState) {}
    fn emit_progress(&self, _pending: i64, _synced: i64) {}
    fn emit_error(&self, _message: &str, _retryable: bool) {}
}

// =============================================================================
// Reports
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncKind {
    /// Uploads unconditionally and re-merges the peer snapshot.
    Full,
    /// Uploads only when changes are pending; skips an already merged peer
    /// snapshot.
    Incremental,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    Completed,
    /// Another cycle was running, or the connection did not allow syncing.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "detail")]
pub enum PhaseOutcome {
    Succeeded,
    Skipped(String),
    Failed(String),
}

impl PhaseOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, PhaseOutcome::Failed(_))
    }
}

/// Per-record results of a merge phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeStats {
    pub inserted: u64,
    pub fast_forwarded: u64,
    pub kept_local: u64,
    pub unchanged: u64,
    /// Conflicts left open for manual resolution.
    pub conflicts: u64,
    pub auto_resolved: u64,
    /// Remote records skipped because they could not be applied.
    pub rejected: u64,
}

impl MergeStats {
    /// Records that changed local state.
    pub fn applied(&self) -> u64 {
        self.inserted + self.fast_forwarded + self.auto_resolved
    }

    fn record(&mut self, outcome: MergeOutcome) {
        match outcome {
            MergeOutcome::Inserted => self.inserted += 1,
            MergeOutcome::FastForwarded => self.fast_forwarded += 1,
            MergeOutcome::KeptLocal => self.kept_local += 1,
            MergeOutcome::Unchanged => self.unchanged += 1,
            MergeOutcome::Deferred => self.conflicts += 1,
            MergeOutcome::AutoResolved => self.auto_resolved += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MergeOutcome {
    Inserted,
    FastForwarded,
    KeptLocal,
    Unchanged,
    Deferred,
    AutoResolved,
}

/// What one sync cycle did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub kind: SyncKind,
    pub outcome: CycleOutcome,
    pub upload: PhaseOutcome,
    /// Change records acknowledged by the upload.
    pub changes_uploaded: usize,
    pub upload_attempts: u32,
    pub download: PhaseOutcome,
    pub remote_device_id: Option<String>,
    pub merge: MergeStats,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SyncReport {
    fn new(kind: SyncKind) -> Self {
        let now = Utc::now();
        SyncReport {
            kind,
            outcome: CycleOutcome::Completed,
            upload: PhaseOutcome::Skipped("not run".into()),
            changes_uploaded: 0,
            upload_attempts: 0,
            download: PhaseOutcome::Skipped("not run".into()),
            remote_device_id: None,
            merge: MergeStats::default(),
            started_at: now,
            finished_at: now,
        }
    }

    fn skipped(kind: SyncKind, reason: &str) -> Self {
        SyncReport {
            outcome: CycleOutcome::Skipped,
            upload: PhaseOutcome::Skipped(reason.to_string()),
            download: PhaseOutcome::Skipped(reason.to_string()),
            ..Self::new(kind)
        }
    }

    pub fn is_skipped(&self) -> bool {
        self.outcome == CycleOutcome::Skipped
    }

    pub fn has_failures(&self) -> bool {
        self.upload.is_failure() || self.download.is_failure()
    }
}

// =============================================================================
// Engine Options and Builder
// =============================================================================

/// Tuning that is not part of the persisted [`SyncConfig`].
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Change records drained per cycle.
    pub batch_size: u32,
    pub upload_max_retries: u32,
    pub upload_base_delay: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            batch_size: 500,
            upload_max_retries: 3,
            upload_base_delay: Duration::from_secs(1),
        }
    }
}

/// Builds a [`SyncEngine`], loading identity and persisted configuration.
pub struct SyncEngineBuilder {
    db: Database,
    cloud: Arc<CloudStorage>,
    store: Option<Arc<dyn EntityStore>>,
    emitter: Arc<dyn SyncEventEmitter>,
    resolver: Option<Arc<dyn ConflictResolver>>,
    seed: Option<SyncConfig>,
    device_id: Option<String>,
    options: EngineOptions,
}

impl SyncEngineBuilder {
    pub fn new(db: Database, cloud: Arc<CloudStorage>) -> Self {
        SyncEngineBuilder {
            db,
            cloud,
            store: None,
            emitter: Arc::new(NoOpEmitter),
            resolver: None,
            seed: None,
            device_id: None,
            options: EngineOptions::default(),
        }
    }

    /// Entity store; defaults to a [`DatabaseStore`] over the same database.
    pub fn store(mut self, store: Arc<dyn EntityStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn emitter(mut self, emitter: Arc<dyn SyncEventEmitter>) -> Self {
        self.emitter = emitter;
        self
    }

    /// Replaces the built-in resolver chosen by the configured strategy.
    pub fn resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Configuration used only when none has been persisted yet.
    pub fn seed_config(mut self, config: SyncConfig) -> Self {
        self.seed = Some(config);
        self
    }

    /// Device id used only when no identity has been persisted yet.
    pub fn device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub fn options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    pub async fn build(self) -> SyncResult<Arc<SyncEngine>> {
        let settings = self.db.settings();
        let identity = settings
            .load_or_create_identity(self.device_id.as_deref())
            .await?;
        let device_id = identity.device_id;

        let (mut config, mut persist) = match settings.get::<SyncConfig>(keys::SYNC_CONFIG).await? {
            Some(config) => (config, false),
            None => (
                self.seed.unwrap_or_else(|| SyncConfig::new(device_id.as_str())),
                true,
            ),
        };
        if config.device_id != device_id {
            config.device_id = device_id.clone();
            persist = true;
        }
        if persist {
            settings.set(keys::SYNC_CONFIG, &config).await?;
        }

        let change_log = ChangeLog::new(&self.db, device_id.as_str(), config.max_retry_attempts);
        change_log.recover_in_flight().await?;

        let store = match self.store {
            Some(store) => store,
            None => Arc::new(DatabaseStore::new(self.db.clone(), change_log.clone())),
        };

        info!(
            device_id = %device_id,
            strategy = %config.conflict_resolution_strategy,
            interval_minutes = config.sync_interval_minutes,
            "Sync engine ready"
        );

        Ok(Arc::new(SyncEngine {
            db: self.db,
            store,
            change_log,
            cloud: self.cloud,
            emitter: self.emitter,
            custom_resolver: self.resolver,
            config: RwLock::new(config),
            state: RwLock::new(SyncState::Idle),
            running: AtomicBool::new(false),
            started: AtomicBool::new(false),
            scheduler: Mutex::new(None),
            options: self.options,
        }))
    }
}

// =============================================================================
// Sync Engine
// =============================================================================

pub struct SyncEngine {
    db: Database,
    store: Arc<dyn EntityStore>,
    change_log: ChangeLog,
    cloud: Arc<CloudStorage>,
    emitter: Arc<dyn SyncEventEmitter>,
    custom_resolver: Option<Arc<dyn ConflictResolver>>,
    config: RwLock<SyncConfig>,
    state: RwLock<SyncState>,
    /// Set while a cycle runs.
    running: AtomicBool,
    /// Set between `start_sync` and `stop_sync`.
    started: AtomicBool,
    scheduler: Mutex<Option<SchedulerHandle>>,
    options: EngineOptions,
}

impl SyncEngine {
    pub fn builder(db: Database, cloud: Arc<CloudStorage>) -> SyncEngineBuilder {
        SyncEngineBuilder::new(db, cloud)
    }

    pub fn device_id(&self) -> &str {
        self.change_log.device_id()
    }

    pub fn change_log(&self) -> &ChangeLog {
        &self.change_log
    }

    pub fn store(&self) -> &Arc<dyn EntityStore> {
        &self.store
    }

    pub fn cloud(&self) -> &Arc<CloudStorage> {
        &self.cloud
    }

    pub async fn config(&self) -> SyncConfig {
        self.config.read().await.clone()
    }

    pub async fn state(&self) -> SyncState {
        *self.state.read().await
    }

    /// Whether a cycle is running right now.
    pub fn is_syncing(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Whether the periodic timer task is alive.
    pub async fn is_scheduled(&self) -> bool {
        self.scheduler.lock().await.is_some()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Arms the periodic schedule and runs one incremental cycle.
    ///
    /// A call made while a cycle is running returns a skipped report without
    /// starting another cycle.
    pub async fn start_sync(self: &Arc<Self>) -> SyncResult<SyncReport> {
        let Some(guard) = FlagGuard::try_acquire(&self.running) else {
            debug!("Sync cycle already running, start ignored");
            return Ok(SyncReport::skipped(SyncKind::Incremental, "cycle already running"));
        };

        self.started.store(true, Ordering::Release);
        self.arm_scheduler().await;

        let respect_metered = self.config.read().await.respect_metered;
        if !self
            .cloud
            .network()
            .should_sync_on_current_connection(respect_metered)
        {
            info!("Connection does not allow syncing, waiting for connectivity");
            return Ok(SyncReport::skipped(SyncKind::Incremental, "connection not allowed"));
        }

        Ok(self.run_cycle(SyncKind::Incremental, guard).await)
    }

    /// Clears the periodic timer and connectivity watcher. A running cycle is
    /// left to finish.
    pub async fn stop_sync(&self) {
        self.started.store(false, Ordering::Release);
        if let Some(handle) = self.scheduler.lock().await.take() {
            handle.stop().await;
            info!("Sync stopped");
        }
    }

    /// User-triggered full cycle; fails fast when offline.
    pub async fn force_sync_now(&self) -> SyncResult<SyncReport> {
        if !self.cloud.network().is_online() {
            return Err(SyncError::Offline);
        }
        self.perform_full_sync().await
    }

    pub async fn perform_full_sync(&self) -> SyncResult<SyncReport> {
        self.guarded_cycle(SyncKind::Full).await
    }

    pub async fn perform_incremental_sync(&self) -> SyncResult<SyncReport> {
        self.guarded_cycle(SyncKind::Incremental).await
    }

    async fn guarded_cycle(&self, kind: SyncKind) -> SyncResult<SyncReport> {
        match FlagGuard::try_acquire(&self.running) {
            Some(guard) => Ok(self.run_cycle(kind, guard).await),
            None => {
                debug!(?kind, "Sync cycle already running, skipped");
                Ok(SyncReport::skipped(kind, "cycle already running"))
            }
        }
    }

    // =========================================================================
    // Queries and Configuration
    // =========================================================================

    pub async fn get_sync_stats(&self) -> SyncResult<SyncStats> {
        let counts = self.change_log.stats().await?;
        Ok(SyncStats {
            total_pending: counts.pending,
            total_syncing: counts.syncing,
            total_synced: counts.synced,
            total_failed: counts.failed,
            total_dropped: counts.dropped,
            total_conflicts: self.db.conflicts().count_unresolved().await?,
            last_sync_time: self.config.read().await.last_sync_timestamp,
        })
    }

    /// Unresolved conflicts, oldest first.
    pub async fn get_conflicts(&self) -> SyncResult<Vec<SyncConflict>> {
        Ok(self.db.conflicts().list_unresolved().await?)
    }

    /// Persists a configuration change; re-arms the schedule when cadence,
    /// enablement or metered policy changed.
    pub async fn update_config(self: &Arc<Self>, update: SyncConfigUpdate) -> SyncResult<SyncConfig> {
        if update.sync_interval_minutes == Some(0) {
            return Err(SyncError::InvalidConfig(
                "sync_interval_minutes must be at least 1".into(),
            ));
        }
        if update.max_retry_attempts == Some(0) {
            return Err(SyncError::InvalidConfig(
                "max_retry_attempts must be at least 1".into(),
            ));
        }

        let (config, reschedule) = {
            let mut current = self.config.write().await;
            let mut next = current.clone();
            let reschedule = update.apply_to(&mut next);
            self.db.settings().set(keys::SYNC_CONFIG, &next).await?;
            *current = next.clone();
            (next, reschedule)
        };
        self.change_log.set_max_retry_attempts(config.max_retry_attempts);

        info!(
            auto_sync = config.auto_sync_enabled,
            interval_minutes = config.sync_interval_minutes,
            strategy = %config.conflict_resolution_strategy,
            "Sync configuration updated"
        );

        if reschedule && self.started.load(Ordering::Acquire) {
            if let Some(handle) = self.scheduler.lock().await.take() {
                handle.stop().await;
            }
            self.arm_scheduler().await;
        }
        Ok(config)
    }

    // =========================================================================
    // Conflict Resolution
    // =========================================================================

    /// Resolves an open conflict.
    ///
    /// `data`, when given, is written as the resolved record whatever the
    /// strategy; otherwise the strategy picks it (`Manual` then requires
    /// data). The written record gets a `sync_version` past both sides so it
    /// propagates on the next upload.
    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        strategy: ConflictStrategy,
        data: Option<Value>,
    ) -> SyncResult<SyncConflict> {
        let conflicts = self.db.conflicts();
        let conflict = conflicts
            .get(conflict_id)
            .await?
            .filter(|c| !c.is_resolved())
            .ok_or_else(|| SyncError::ConflictNotFound(conflict_id.to_string()))?;

        let kind = EntityKind::from_table(&conflict.table_name).ok_or_else(|| {
            SyncError::InvalidResolution(format!("unknown table '{}'", conflict.table_name))
        })?;
        let key = conflict.record_id.as_str();

        let remote: Value = serde_json::from_str(&conflict.remote_data)?;
        let current = self.store.find_by_key(kind, key).await?;
        let local = match &current {
            Some(record) => record.clone(),
            None => serde_json::from_str(&conflict.local_data)?,
        };
        let base = self.load_base(kind, key).await?;

        let mut chosen = match (data, strategy) {
            (Some(record), _) => record,
            (None, ConflictStrategy::LocalWins) => local.clone(),
            (None, ConflictStrategy::RemoteWins) => remote.clone(),
            (None, ConflictStrategy::Merge) => merge_fields(base.as_ref(), &local, &remote),
            (None, ConflictStrategy::Manual) => {
                return Err(SyncError::InvalidResolution(
                    "manual resolution requires the resolved record".into(),
                ))
            }
        };

        let version = record_version(&local)
            .max(conflict.local_version)
            .max(conflict.remote_version)
            + 1;
        match &mut chosen {
            Value::Object(map) => {
                map.insert("sync_version".into(), Value::from(version));
                map.insert("updated_at".into(), serde_json::to_value(Utc::now())?);
            }
            _ => {
                return Err(SyncError::InvalidResolution(
                    "resolved record must be a JSON object".into(),
                ))
            }
        }

        self.change_log.mark_resolved(&conflict.table_name, key).await?;
        match current {
            Some(_) => self.store.replace(kind, key, &chosen).await?,
            None => self.store.insert(kind, &chosen).await?,
        }
        self.save_base(kind, key, &remote).await?;
        conflicts
            .resolve(conflict_id, strategy, Some(chosen.to_string().as_str()))
            .await?;

        info!(
            conflict_id = %conflict_id,
            table = %kind,
            key = %key,
            %strategy,
            "Conflict resolved"
        );

        conflicts
            .get(conflict_id)
            .await?
            .ok_or_else(|| SyncError::ConflictNotFound(conflict_id.to_string()))
    }

    // =========================================================================
    // Cycle
    // =========================================================================

    async fn run_cycle(&self, kind: SyncKind, _guard: FlagGuard<'_>) -> SyncReport {
        self.set_state(SyncState::Syncing).await;
        info!(device_id = %self.device_id(), ?kind, "Sync cycle started");

        let mut report = SyncReport::new(kind);

        let upload = self.upload_phase(kind, &mut report).await;
        report.upload = upload;

        let download = self.download_phase(kind, &mut report).await;
        report.download = download;

        let bookkeeping = self.record_sync_time().await;
        report.finished_at = Utc::now();

        for outcome in [&report.upload, &report.download] {
            if let PhaseOutcome::Failed(message) = outcome {
                self.emitter.emit_error(message, true);
            }
        }
        if let Err(e) = &bookkeeping {
            error!(?e, "Failed to persist sync timestamp");
            self.emitter.emit_error(&e.to_string(), false);
        }

        let state = if report.has_failures() || bookkeeping.is_err() {
            SyncState::Failed
        } else {
            SyncState::Idle
        };
        self.set_state(state).await;

        if let Ok(counts) = self.change_log.stats().await {
            self.emitter.emit_progress(counts.pending + counts.failed, counts.synced);
        }

        info!(
            ?kind,
            %state,
            uploaded = report.changes_uploaded,
            inserted = report.merge.inserted,
            fast_forwarded = report.merge.fast_forwarded,
            conflicts = report.merge.conflicts,
            rejected = report.merge.rejected,
            "Sync cycle finished"
        );
        report
    }

    async fn set_state(&self, state: SyncState) {
        *self.state.write().await = state;
        self.emitter.emit_status(state);
    }

    /// Advances `last_sync_timestamp` (never backwards) and persists it.
    async fn record_sync_time(&self) -> SyncResult<()> {
        let mut config = self.config.write().await;
        let now = Utc::now();
        let next = config.last_sync_timestamp.map_or(now, |prev| prev.max(now));
        config.last_sync_timestamp = Some(next);
        self.db.settings().set(keys::SYNC_CONFIG, &*config).await?;
        Ok(())
    }

    // =========================================================================
    // Upload Phase
    // =========================================================================

    async fn upload_phase(&self, kind: SyncKind, report: &mut SyncReport) -> PhaseOutcome {
        if !self.cloud.network().is_online() {
            return PhaseOutcome::Failed(SyncError::Offline.to_string());
        }
        if !self.cloud.is_authenticated() {
            return PhaseOutcome::Skipped("not authenticated".into());
        }

        match self.upload_changes(kind, report).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(%e, "Upload phase failed");
                PhaseOutcome::Failed(e.to_string())
            }
        }
    }

    async fn upload_changes(&self, kind: SyncKind, report: &mut SyncReport) -> SyncResult<PhaseOutcome> {
        let settings = self.db.settings();
        let uploaded_version = settings.get::<u64>(keys::SNAPSHOT_VERSION).await?.unwrap_or(0);

        let drained = self.change_log.drain_pending(self.options.batch_size).await?;
        if drained.is_empty() && kind == SyncKind::Incremental && uploaded_version > 0 {
            return Ok(PhaseOutcome::Skipped("no pending changes".into()));
        }

        let snapshot = match self.build_snapshot(uploaded_version + 1).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.fail_changes(&drained, &e.to_string()).await;
                return Err(e);
            }
        };

        let upload = self
            .cloud
            .upload_with_retry(
                &snapshot,
                self.options.upload_max_retries,
                self.options.upload_base_delay,
            )
            .await;
        report.upload_attempts = upload.attempts;

        if !upload.success {
            let message = upload
                .last_error
                .clone()
                .unwrap_or_else(|| "upload failed".to_string());
            self.fail_changes(&drained, &message).await;
            return Err(SyncError::RetriesExhausted {
                attempts: upload.attempts,
                last_error: message,
            });
        }

        settings.set(keys::SNAPSHOT_VERSION, &snapshot.version).await?;
        for change in &drained {
            self.change_log.mark_synced(&change.id).await?;
        }
        self.seed_bases_for_created(&drained).await?;
        report.changes_uploaded = drained.len();

        info!(
            version = snapshot.version,
            records = snapshot.metadata.total_records,
            changes = drained.len(),
            attempts = upload.attempts,
            "Snapshot uploaded"
        );
        Ok(PhaseOutcome::Succeeded)
    }

    async fn build_snapshot(&self, version: u64) -> SyncResult<CloudSyncData> {
        let mut tables = EntityTables::new();
        for kind in EntityKind::SYNCABLE {
            tables.insert(kind.table_name().to_string(), self.store.list(kind).await?);
        }
        Ok(CloudSyncData::new(self.device_id(), version, tables)?)
    }

    async fn fail_changes(&self, changes: &[ChangeRecord], message: &str) {
        for change in changes {
            match self.change_log.mark_failed(&change.id, message).await {
                Ok(ChangeStatus::Dropped) => {
                    warn!(change_id = %change.id, "Change dropped from retry");
                }
                Ok(_) => {}
                Err(e) => error!(?e, change_id = %change.id, "Failed to record upload failure"),
            }
        }
    }

    /// Records created on this device become the sync base once uploaded, so
    /// a later local edit is not mistaken for a divergence.
    async fn seed_bases_for_created(&self, changes: &[ChangeRecord]) -> SyncResult<()> {
        let sync_base = self.db.sync_base();
        for change in changes {
            if change.operation != ChangeOperation::Create {
                continue;
            }
            let Some(kind) = EntityKind::from_table(&change.table_name) else {
                continue;
            };
            if sync_base.get(&change.table_name, &change.record_id).await?.is_some() {
                continue;
            }
            if let Some(record) = self.store.find_by_key(kind, &change.record_id).await? {
                self.save_base(kind, &change.record_id, &record).await?;
            }
        }
        Ok(())
    }

    // =========================================================================
    // Download and Merge Phases
    // =========================================================================

    async fn download_phase(&self, kind: SyncKind, report: &mut SyncReport) -> PhaseOutcome {
        if !self.cloud.network().is_online() {
            return PhaseOutcome::Failed(SyncError::Offline.to_string());
        }
        if !self.cloud.is_authenticated() {
            return PhaseOutcome::Skipped("not authenticated".into());
        }

        let snapshot = match self.cloud.download_latest_from_peers(self.device_id()).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return PhaseOutcome::Skipped("no peer snapshot available".into()),
            Err(e) if e.is_integrity_error() => {
                warn!(%e, "Discarding peer snapshot that failed verification");
                return PhaseOutcome::Failed(e.to_string());
            }
            Err(e) => {
                warn!(%e, "Download phase failed");
                return PhaseOutcome::Failed(e.to_string());
            }
        };
        report.remote_device_id = Some(snapshot.device_id.clone());

        let checkpoint = MergeCheckpoint {
            device_id: snapshot.device_id.clone(),
            version: snapshot.version,
            checksum: snapshot.metadata.checksum.clone(),
        };
        let settings = self.db.settings();

        if kind == SyncKind::Incremental {
            match settings.get::<MergeCheckpoint>(keys::LAST_MERGED_SNAPSHOT).await {
                Ok(Some(last)) if last == checkpoint => {
                    debug!(device_id = %checkpoint.device_id, version = checkpoint.version, "Peer snapshot already merged");
                    return PhaseOutcome::Skipped("peer snapshot already merged".into());
                }
                Ok(_) => {}
                Err(e) => warn!(?e, "Could not read merge checkpoint"),
            }
        }

        report.merge = self.merge_snapshot(&snapshot).await;

        if report.merge.rejected == 0 {
            if let Err(e) = settings.set(keys::LAST_MERGED_SNAPSHOT, &checkpoint).await {
                warn!(?e, "Could not persist merge checkpoint");
            }
        }
        PhaseOutcome::Succeeded
    }

    async fn merge_snapshot(&self, snapshot: &CloudSyncData) -> MergeStats {
        let resolver = self.resolver().await;
        let mut stats = MergeStats::default();

        for kind in EntityKind::SYNCABLE {
            for remote in snapshot.records(kind) {
                match self.merge_record(kind, remote, resolver.as_ref()).await {
                    Ok(outcome) => stats.record(outcome),
                    Err(e) => {
                        warn!(table = %kind, %e, "Skipping remote record");
                        stats.rejected += 1;
                    }
                }
            }
        }

        debug!(
            device_id = %snapshot.device_id,
            applied = stats.applied(),
            unchanged = stats.unchanged,
            "Peer snapshot merged"
        );
        stats
    }

    async fn resolver(&self) -> Arc<dyn ConflictResolver> {
        match &self.custom_resolver {
            Some(resolver) => Arc::clone(resolver),
            None => Arc::from(resolver_for(
                self.config.read().await.conflict_resolution_strategy,
            )),
        }
    }

    async fn merge_record(
        &self,
        kind: EntityKind,
        remote: &Value,
        resolver: &dyn ConflictResolver,
    ) -> SyncResult<MergeOutcome> {
        let key = natural_key(kind, remote)?;
        let local = self.store.find_by_key(kind, &key).await?;
        let base = self.load_base(kind, &key).await?;

        match (classify(local.as_ref(), remote, base.as_ref()), local) {
            (MergeDecision::Insert, _) => {
                self.store.insert(kind, remote).await?;
                self.save_base(kind, &key, remote).await?;
                Ok(MergeOutcome::Inserted)
            }
            (MergeDecision::Unchanged, _) => {
                if base.as_ref().map_or(true, |b| !same_content(b, remote)) {
                    self.save_base(kind, &key, remote).await?;
                }
                Ok(MergeOutcome::Unchanged)
            }
            (MergeDecision::FastForward, _) => {
                self.store.replace(kind, &key, remote).await?;
                self.save_base(kind, &key, remote).await?;
                Ok(MergeOutcome::FastForwarded)
            }
            (MergeDecision::KeepLocal, _) => Ok(MergeOutcome::KeptLocal),
            (MergeDecision::Conflict, Some(local)) => {
                if self.is_echo(kind, &key, &local, remote).await? {
                    // A peer re-published an older state of ours: it becomes
                    // the common ancestor and the local edit stands.
                    debug!(table = %kind, key = %key, "Peer echoed an earlier local state");
                    self.save_base(kind, &key, remote).await?;
                    return Ok(MergeOutcome::KeptLocal);
                }
                self.handle_conflict(kind, &key, &local, remote, base.as_ref(), resolver)
                    .await
            }
            (MergeDecision::Conflict, None) => Err(SyncError::Internal(format!(
                "conflict on {} '{}' without a local record",
                kind, key
            ))),
        }
    }

    async fn is_echo(
        &self,
        kind: EntityKind,
        key: &str,
        local: &Value,
        remote: &Value,
    ) -> SyncResult<bool> {
        let history = self.change_log.history(kind.table_name(), key).await?;
        let snapshots: Vec<Value> = history
            .iter()
            .filter_map(|change| serde_json::from_str(&change.data_snapshot).ok())
            .collect();
        Ok(is_past_local_state(local, remote, &snapshots))
    }

    async fn handle_conflict(
        &self,
        kind: EntityKind,
        key: &str,
        local: &Value,
        remote: &Value,
        base: Option<&Value>,
        resolver: &dyn ConflictResolver,
    ) -> SyncResult<MergeOutcome> {
        let table = kind.table_name();
        let conflicts = self.db.conflicts();
        let remote_version = record_version(remote);

        if conflicts.find_open(table, key, remote_version).await?.is_some() {
            debug!(table, key, remote_version, "Conflict already recorded");
            return Ok(MergeOutcome::Deferred);
        }

        let conflict = SyncConflict {
            id: Uuid::new_v4().to_string(),
            table_name: table.to_string(),
            record_id: key.to_string(),
            local_data: local.to_string(),
            remote_data: remote.to_string(),
            local_version: record_version(local),
            remote_version,
            created_at: Utc::now(),
            resolution_strategy: None,
            resolved_data: None,
            resolved_at: None,
        };
        conflicts.insert(&conflict).await?;

        let resolved = match resolver.resolve(base, local, remote) {
            Resolution::Defer => {
                self.change_log.mark_conflict(table, key).await?;
                info!(conflict_id = %conflict.id, table, key, "Conflict awaiting manual resolution");
                return Ok(MergeOutcome::Deferred);
            }
            Resolution::KeepLocal => local.clone(),
            Resolution::TakeRemote => {
                self.store.replace(kind, key, remote).await?;
                remote.clone()
            }
            Resolution::Write(record) => {
                self.store.replace(kind, key, &record).await?;
                record
            }
        };

        // The remote side is now accounted for: the next cycle sees it as
        // the base and keeps whatever was written locally.
        self.save_base(kind, key, remote).await?;
        let strategy = resolver.strategy();
        conflicts
            .resolve(&conflict.id, strategy, Some(resolved.to_string().as_str()))
            .await?;

        info!(conflict_id = %conflict.id, table, key, %strategy, "Conflict resolved automatically");
        Ok(MergeOutcome::AutoResolved)
    }

    async fn load_base(&self, kind: EntityKind, key: &str) -> SyncResult<Option<Value>> {
        match self.db.sync_base().get(kind.table_name(), key).await? {
            Some(entry) => Ok(Some(serde_json::from_str(&entry.data)?)),
            None => Ok(None),
        }
    }

    async fn save_base(&self, kind: EntityKind, key: &str, record: &Value) -> SyncResult<()> {
        self.db
            .sync_base()
            .upsert(kind.table_name(), key, &record.to_string(), record_version(record))
            .await?;
        Ok(())
    }

    // =========================================================================
    // Scheduling
    // =========================================================================

    async fn arm_scheduler(self: &Arc<Self>) {
        let (enabled, period, respect_metered) = {
            let config = self.config.read().await;
            (
                config.auto_sync_enabled,
                Duration::from_secs(u64::from(config.sync_interval_minutes.max(1)) * 60),
                config.respect_metered,
            )
        };

        let mut slot = self.scheduler.lock().await;
        if slot.is_some() {
            return;
        }
        if !enabled {
            info!("Automatic sync disabled, no schedule armed");
            return;
        }

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        tokio::spawn(schedule_loop(
            Arc::downgrade(self),
            period,
            respect_metered,
            self.cloud.network().subscribe(),
            shutdown_rx,
        ));
        *slot = Some(SchedulerHandle { shutdown_tx });
        info!(period_secs = period.as_secs(), "Sync schedule armed");
    }
}

struct SchedulerHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl SchedulerHandle {
    async fn stop(self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

fn ticker(first_tick: Instant, period: Duration) -> Interval {
    let mut ticker = interval_at(first_tick, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Periodic incremental sync, armed only while the connection allows it.
///
/// Losing connectivity disarms the timer; regaining it syncs at once and
/// re-arms the period from there.
async fn schedule_loop(
    engine: Weak<SyncEngine>,
    period: Duration,
    respect_metered: bool,
    mut network_rx: watch::Receiver<NetworkState>,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    let allowed = |state: &NetworkState| state.is_online && !(respect_metered && state.is_metered);

    let mut armed = allowed(&network_rx.borrow_and_update());
    let mut timer = ticker(Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = timer.tick(), if armed => {
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                match engine.perform_incremental_sync().await {
                    Ok(report) if report.is_skipped() => debug!("Scheduled sync skipped"),
                    Ok(_) => {}
                    Err(e) => warn!(%e, "Scheduled sync failed"),
                }
            }

            changed = network_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let now_allowed = allowed(&network_rx.borrow_and_update());
                if now_allowed && !armed {
                    info!("Connectivity restored, sync timer armed");
                    timer = interval(period);
                    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
                } else if !now_allowed && armed {
                    info!("Connectivity lost, sync timer disarmed");
                }
                armed = now_allowed;
            }

            _ = shutdown_rx.recv() => {
                debug!("Sync scheduler received shutdown");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::MemoryBackend;
    use crate::network::{NetworkMonitor, StaticProbe};
    use crate::store::DatabaseStore;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex as StdMutex;
    use tally_core::{ConnectionType, Product};
    use tally_db::DbConfig;

    struct RecordingEmitter {
        states: StdMutex<Vec<SyncState>>,
    }

    impl SyncEventEmitter for RecordingEmitter {
        fn emit_status(&self, state: SyncState) {
            self.states.lock().unwrap().push(state);
        }
        fn emit_progress(&self, _pending: i64, _synced: i64) {}
        fn emit_error(&self, _message: &str, _retryable: bool) {}
    }

    fn online() -> NetworkState {
        NetworkState::online(ConnectionType::Wifi, false)
    }

    async fn cloud(backend: &MemoryBackend, state: NetworkState) -> Arc<CloudStorage> {
        let network = Arc::new(NetworkMonitor::with_initial_state(StaticProbe::new(state), state));
        let cloud = Arc::new(CloudStorage::new(Arc::new(backend.clone()), network));
        cloud.authenticate(MemoryBackend::TOKEN, None).await.unwrap();
        cloud
    }

    async fn engine(backend: &MemoryBackend) -> (Arc<SyncEngine>, DatabaseStore) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let engine = SyncEngine::builder(db.clone(), cloud(backend, online()).await)
            .device_id("device-a")
            .options(EngineOptions {
                upload_base_delay: Duration::from_millis(1),
                ..Default::default()
            })
            .build()
            .await
            .unwrap();
        let store = DatabaseStore::new(db, engine.change_log().clone());
        (engine, store)
    }

    #[tokio::test]
    async fn test_builder_persists_identity_and_config() {
        let backend = MemoryBackend::new();
        let db = Database::new(DbConfig::in_memory()).await.unwrap();

        let first = SyncEngine::builder(db.clone(), cloud(&backend, online()).await)
            .device_id("till-1")
            .build()
            .await
            .unwrap();
        assert_eq!(first.device_id(), "till-1");
        assert_eq!(first.config().await.device_id, "till-1");

        let second = SyncEngine::builder(db, cloud(&backend, online()).await)
            .device_id("ignored")
            .build()
            .await
            .unwrap();
        assert_eq!(second.device_id(), "till-1");
    }

    #[tokio::test]
    async fn test_file_settings_seed_and_override_persisted_config() {
        use crate::config::TallyConfig;

        let backend = MemoryBackend::new();
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let mut file = TallyConfig::default();
        file.sync.conflict_strategy = ConflictStrategy::RemoteWins;
        file.sync.max_retry_attempts = 7;

        // No configured device id: the seed still applies.
        let first = SyncEngine::builder(db.clone(), cloud(&backend, online()).await)
            .seed_config(file.seed_sync_config(""))
            .build()
            .await
            .unwrap();
        let config = first.config().await;
        assert_eq!(config.conflict_resolution_strategy, ConflictStrategy::RemoteWins);
        assert_eq!(config.max_retry_attempts, 7);
        assert_eq!(config.device_id, first.device_id());
        assert!(!config.device_id.is_empty());

        // A later edit of the file wins over the persisted copy.
        file.sync.conflict_strategy = ConflictStrategy::Manual;
        let second = SyncEngine::builder(db, cloud(&backend, online()).await)
            .seed_config(file.seed_sync_config(""))
            .build()
            .await
            .unwrap();
        assert_eq!(
            second.config().await.conflict_resolution_strategy,
            ConflictStrategy::RemoteWins
        );
        let applied = second.update_config(file.sync_config_update()).await.unwrap();
        assert_eq!(applied.conflict_resolution_strategy, ConflictStrategy::Manual);
        assert_eq!(applied.device_id, first.device_id());
        assert_eq!(second.change_log().max_retry_attempts(), 7);
    }

    #[tokio::test]
    async fn test_incremental_cycle_uploads_pending_changes() {
        let backend = MemoryBackend::new();
        let (engine, store) = engine(&backend).await;
        store.insert_product(&Product::new("A-1", "Apple", 50)).await.unwrap();

        let report = engine.perform_incremental_sync().await.unwrap();
        assert_eq!(report.upload, PhaseOutcome::Succeeded);
        assert_eq!(report.changes_uploaded, 1);
        assert_eq!(backend.snapshot_count().await, 1);

        let stats = engine.get_sync_stats().await.unwrap();
        assert_eq!(stats.total_pending, 0);
        assert_eq!(stats.total_synced, 1);
        assert!(stats.last_sync_time.is_some());

        let again = engine.perform_incremental_sync().await.unwrap();
        assert_eq!(again.upload, PhaseOutcome::Skipped("no pending changes".into()));
        assert_eq!(backend.put_attempts().await, 1);
    }

    #[tokio::test]
    async fn test_failed_upload_marks_changes_failed() {
        let backend = MemoryBackend::new();
        let (engine, store) = engine(&backend).await;
        store.insert_product(&Product::new("A-1", "Apple", 50)).await.unwrap();
        backend.set_unavailable(true).await;

        let report = engine.perform_incremental_sync().await.unwrap();
        assert!(report.upload.is_failure());
        assert_eq!(report.upload_attempts, 3);
        assert_eq!(engine.state().await, SyncState::Failed);

        let stats = engine.get_sync_stats().await.unwrap();
        assert_eq!(stats.total_failed, 1);
        assert!(stats.last_sync_time.is_some());

        backend.set_unavailable(false).await;
        let report = engine.perform_incremental_sync().await.unwrap();
        assert_eq!(report.upload, PhaseOutcome::Succeeded);
        assert_eq!(engine.state().await, SyncState::Idle);
    }

    #[tokio::test]
    async fn test_force_sync_offline_is_an_error() {
        let backend = MemoryBackend::new();
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let engine = SyncEngine::builder(db, cloud(&backend, NetworkState::offline()).await)
            .build()
            .await
            .unwrap();

        assert!(matches!(engine.force_sync_now().await, Err(SyncError::Offline)));
        assert_eq!(backend.put_attempts().await, 0);
    }

    #[tokio::test]
    async fn test_last_sync_timestamp_never_moves_backwards() {
        let backend = MemoryBackend::new();
        let (engine, _store) = engine(&backend).await;

        engine.perform_full_sync().await.unwrap();
        let first = engine.config().await.last_sync_timestamp.unwrap();
        engine.perform_full_sync().await.unwrap();
        let second = engine.config().await.last_sync_timestamp.unwrap();
        assert!(second >= first);
    }

    #[tokio::test]
    async fn test_emitter_sees_state_transitions() {
        let backend = MemoryBackend::new();
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let emitter = Arc::new(RecordingEmitter {
            states: StdMutex::new(Vec::new()),
        });
        let engine = SyncEngine::builder(db, cloud(&backend, online()).await)
            .emitter(emitter.clone())
            .build()
            .await
            .unwrap();

        engine.perform_full_sync().await.unwrap();
        assert_eq!(
            *emitter.states.lock().unwrap(),
            vec![SyncState::Syncing, SyncState::Idle]
        );
    }

    #[tokio::test]
    async fn test_update_config_persists_and_reschedules() {
        let backend = MemoryBackend::new();
        let (engine, _store) = engine(&backend).await;

        engine
            .update_config(SyncConfigUpdate {
                auto_sync_enabled: Some(false),
                ..Default::default()
            })
            .await
            .unwrap();
        engine.start_sync().await.unwrap();
        assert!(!engine.is_scheduled().await);

        let config = engine
            .update_config(SyncConfigUpdate {
                auto_sync_enabled: Some(true),
                conflict_resolution_strategy: Some(ConflictStrategy::Manual),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(config.conflict_resolution_strategy, ConflictStrategy::Manual);
        assert!(engine.is_scheduled().await);

        let stored: SyncConfig = engine
            .db
            .settings()
            .get(keys::SYNC_CONFIG)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.conflict_resolution_strategy, ConflictStrategy::Manual);

        engine.stop_sync().await;
        engine.stop_sync().await;
        assert!(!engine.is_scheduled().await);
    }

    #[tokio::test]
    async fn test_update_config_rejects_zero_interval() {
        let backend = MemoryBackend::new();
        let (engine, _store) = engine(&backend).await;

        let err = engine
            .update_config(SyncConfigUpdate {
                sync_interval_minutes: Some(0),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(err.is_config_error());
    }

    #[tokio::test]
    async fn test_resolve_unknown_conflict() {
        let backend = MemoryBackend::new();
        let (engine, _store) = engine(&backend).await;

        let err = engine
            .resolve_conflict("missing", ConflictStrategy::LocalWins, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::ConflictNotFound(_)));
    }
}
