//! # Cloud Storage
//!
//! Versioned snapshot storage keyed by device id.
//!
//! ## Layers
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          CloudStorage                                   │
//! │                                                                         │
//! │   upload / upload_with_retry / download / test_connection              │
//! │     • offline        → SyncError::Offline (fail fast)                  │
//! │     • not signed in  → fail closed (NotAuthenticated / None / false)   │
//! │     • download       → checksum + schema verified before returning     │
//! │                                                                         │
//! │   ┌──────────────────────────┐   ┌──────────────────────────────────┐  │
//! │   │ dyn CloudBackend         │   │ NetworkMonitor                   │  │
//! │   │  HttpBackend (reqwest)   │   │  is the device online?           │  │
//! │   │  MemoryBackend (tests)   │   │                                  │  │
//! │   └──────────────────────────┘   └──────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Upload Retry Schedule
//! ```text
//! attempt 1 ──fail──► wait base ──► attempt 2 ──fail──► wait 2×base ──► attempt 3
//! ```
//! The loop is bounded by `max_retries` attempts and reports instead of
//! raising.

mod http;
mod memory;

pub use http::HttpBackend;
pub use memory::MemoryBackend;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::network::NetworkMonitor;
use tally_core::{CloudSyncData, SnapshotSummary};

/// Upper bound for a single backoff delay.
const MAX_BACKOFF: Duration = Duration::from_secs(15 * 60);

// =============================================================================
// Backend Contract
// =============================================================================

/// Aggregate size of stored snapshots against the provider quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageInfo {
    pub used: u64,
    pub available: u64,
}

/// Remote snapshot store.
///
/// Snapshots are superseded per device by later uploads and never mutated in
/// place.
#[async_trait]
pub trait CloudBackend: Send + Sync {
    /// Validates credentials. `Ok(false)` means the backend refused them.
    async fn authenticate(&self, token: &str, endpoint: Option<&str>) -> SyncResult<bool>;

    async fn put_snapshot(&self, snapshot: &CloudSyncData) -> SyncResult<()>;

    /// Latest snapshot uploaded by `device_id`.
    async fn get_snapshot(&self, device_id: &str) -> SyncResult<Option<CloudSyncData>>;

    /// One entry per device holding a snapshot.
    async fn list_snapshots(&self) -> SyncResult<Vec<SnapshotSummary>>;

    async fn storage_info(&self) -> SyncResult<StorageInfo>;

    /// Lightweight reachability check of the backend itself.
    async fn ping(&self) -> SyncResult<()>;
}

// =============================================================================
// Upload Report
// =============================================================================

/// Outcome of a bounded upload retry loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    pub success: bool,
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl UploadReport {
    /// Converts a failed report into [`SyncError::RetriesExhausted`].
    pub fn into_result(self) -> SyncResult<u32> {
        if self.success {
            Ok(self.attempts)
        } else {
            Err(SyncError::RetriesExhausted {
                attempts: self.attempts,
                last_error: self.last_error.unwrap_or_default(),
            })
        }
    }
}

// =============================================================================
// Cloud Storage
// =============================================================================

/// Authenticated, connectivity-aware access to a [`CloudBackend`].
pub struct CloudStorage {
    backend: Arc<dyn CloudBackend>,
    network: Arc<NetworkMonitor>,
    authenticated: AtomicBool,
}

impl CloudStorage {
    pub fn new(backend: Arc<dyn CloudBackend>, network: Arc<NetworkMonitor>) -> Self {
        CloudStorage {
            backend,
            network,
            authenticated: AtomicBool::new(false),
        }
    }

    pub fn network(&self) -> &Arc<NetworkMonitor> {
        &self.network
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    /// Signs in; a refused token leaves the storage unauthenticated.
    pub async fn authenticate(&self, token: &str, endpoint: Option<&str>) -> SyncResult<bool> {
        let accepted = self.backend.authenticate(token, endpoint).await?;
        self.authenticated.store(accepted, Ordering::Release);

        if accepted {
            info!("Cloud storage authenticated");
        } else {
            warn!("Cloud storage rejected credentials");
        }
        Ok(accepted)
    }

    /// Single upload attempt.
    pub async fn upload(&self, snapshot: &CloudSyncData) -> SyncResult<()> {
        if !self.network.is_online() {
            return Err(SyncError::Offline);
        }
        if !self.is_authenticated() {
            return Err(SyncError::NotAuthenticated);
        }

        self.backend.put_snapshot(snapshot).await?;
        debug!(
            device_id = %snapshot.device_id,
            version = snapshot.version,
            records = snapshot.metadata.total_records,
            "Snapshot uploaded"
        );
        Ok(())
    }

    /// Uploads with exponential backoff: the delay before attempt `n + 1` is
    /// `base_delay * 2^(n - 1)`. Stops after `max_retries` attempts, or at
    /// the first non-retryable error. Never returns an error.
    pub async fn upload_with_retry(
        &self,
        snapshot: &CloudSyncData,
        max_retries: u32,
        base_delay: Duration,
    ) -> UploadReport {
        let mut backoff = ExponentialBackoff {
            current_interval: base_delay,
            initial_interval: base_delay,
            multiplier: 2.0,
            randomization_factor: 0.0,
            max_interval: MAX_BACKOFF.max(base_delay),
            max_elapsed_time: None,
            ..Default::default()
        };

        let mut attempts = 0;
        let mut last_error = None;

        while attempts < max_retries {
            attempts += 1;

            match self.upload(snapshot).await {
                Ok(()) => {
                    return UploadReport {
                        success: true,
                        attempts,
                        last_error: None,
                    }
                }
                Err(e) => {
                    warn!(attempt = attempts, max_retries, %e, "Snapshot upload failed");
                    let retryable = e.is_retryable();
                    last_error = Some(e.to_string());
                    if !retryable {
                        break;
                    }
                }
            }

            if attempts < max_retries {
                if let Some(delay) = backoff.next_backoff() {
                    debug!(?delay, attempt = attempts, "Waiting before retry");
                    tokio::time::sleep(delay).await;
                }
            }
        }

        UploadReport {
            success: false,
            attempts,
            last_error,
        }
    }

    /// Fetches a verified snapshot.
    ///
    /// With `device_id`, that device's latest snapshot; without, the most
    /// recent snapshot of any device. `None` when nothing matches or when not
    /// authenticated.
    pub async fn download(&self, device_id: Option<&str>) -> SyncResult<Option<CloudSyncData>> {
        if !self.ready_for_read()? {
            return Ok(None);
        }

        let target = match device_id {
            Some(id) => Some(id.to_string()),
            None => self.newest_device(|_| true).await?,
        };

        match target {
            Some(id) => self.fetch_verified(&id).await,
            None => Ok(None),
        }
    }

    /// Most recent snapshot not authored by `own_device_id`.
    pub async fn download_latest_from_peers(
        &self,
        own_device_id: &str,
    ) -> SyncResult<Option<CloudSyncData>> {
        if !self.ready_for_read()? {
            return Ok(None);
        }

        match self.newest_device(|s| s.device_id != own_device_id).await? {
            Some(id) => self.fetch_verified(&id).await,
            None => Ok(None),
        }
    }

    /// `None` when not authenticated.
    pub async fn get_storage_info(&self) -> SyncResult<Option<StorageInfo>> {
        if !self.is_authenticated() {
            return Ok(None);
        }
        Ok(Some(self.backend.storage_info().await?))
    }

    /// Probes the backend itself, which may be down while the device is
    /// online.
    pub async fn test_connection(&self) -> bool {
        if !self.is_authenticated() {
            return false;
        }
        match self.backend.ping().await {
            Ok(()) => true,
            Err(e) => {
                debug!(%e, "Cloud backend ping failed");
                false
            }
        }
    }

    fn ready_for_read(&self) -> SyncResult<bool> {
        if !self.network.is_online() {
            return Err(SyncError::Offline);
        }
        if !self.is_authenticated() {
            debug!("Download skipped: not authenticated");
            return Ok(false);
        }
        Ok(true)
    }

    async fn newest_device<F>(&self, filter: F) -> SyncResult<Option<String>>
    where
        F: Fn(&SnapshotSummary) -> bool,
    {
        let summaries = self.backend.list_snapshots().await?;
        Ok(summaries
            .into_iter()
            .filter(|s| filter(s))
            .max_by_key(|s| s.timestamp)
            .map(|s| s.device_id))
    }

    async fn fetch_verified(&self, device_id: &str) -> SyncResult<Option<CloudSyncData>> {
        let Some(snapshot) = self.backend.get_snapshot(device_id).await? else {
            return Ok(None);
        };

        if let Err(e) = snapshot.verify() {
            warn!(device_id = %device_id, %e, "Rejected snapshot failing verification");
            return Err(e.into());
        }
        Ok(Some(snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::StaticProbe;
    use serde_json::json;
    use tally_core::{ConnectionType, EntityTables, NetworkState};

    fn online() -> Arc<NetworkMonitor> {
        let state = NetworkState::online(ConnectionType::Wifi, false);
        Arc::new(NetworkMonitor::with_initial_state(StaticProbe::new(state), state))
    }

    fn snapshot(device: &str) -> CloudSyncData {
        let mut data = EntityTables::new();
        data.insert(
            "products".into(),
            vec![json!({"sku": "A-1", "name": "Apple", "price_cents": 50})],
        );
        CloudSyncData::new(device, 1, data).unwrap()
    }

    async fn storage(backend: &MemoryBackend) -> CloudStorage {
        let storage = CloudStorage::new(Arc::new(backend.clone()), online());
        assert!(storage.authenticate(MemoryBackend::TOKEN, None).await.unwrap());
        storage
    }

    #[tokio::test]
    async fn test_upload_requires_authentication() {
        let backend = MemoryBackend::new();
        let storage = CloudStorage::new(Arc::new(backend.clone()), online());

        let err = storage.upload(&snapshot("a")).await.unwrap_err();
        assert!(matches!(err, SyncError::NotAuthenticated));
        assert_eq!(storage.download(None).await.unwrap(), None);
        assert!(!storage.test_connection().await);
        assert_eq!(storage.get_storage_info().await.unwrap(), None);

        assert!(!storage.authenticate("wrong", None).await.unwrap());
        assert!(!storage.is_authenticated());
    }

    #[tokio::test]
    async fn test_upload_fails_fast_offline() {
        let backend = MemoryBackend::new();
        let storage = storage(&backend).await;
        storage.network().set_state(NetworkState::offline());

        let err = storage.upload(&snapshot("a")).await.unwrap_err();
        assert!(matches!(err, SyncError::Offline));
        assert_eq!(backend.put_attempts().await, 0);
    }

    #[tokio::test]
    async fn test_checksum_round_trip() {
        let backend = MemoryBackend::new();
        let storage = storage(&backend).await;

        let uploaded = snapshot("device-a");
        storage.upload(&uploaded).await.unwrap();

        let fetched = storage.download(Some("device-a")).await.unwrap().unwrap();
        assert_eq!(fetched.metadata.checksum, uploaded.metadata.checksum);
        assert_eq!(
            tally_core::checksum_tables(&fetched.data).unwrap(),
            uploaded.metadata.checksum
        );
    }

    #[tokio::test]
    async fn test_tampered_snapshot_rejected() {
        let backend = MemoryBackend::new();
        let storage = storage(&backend).await;
        storage.upload(&snapshot("device-a")).await.unwrap();

        backend.tamper("device-a").await;

        let err = storage.download(Some("device-a")).await.unwrap_err();
        assert!(err.is_integrity_error());
    }

    #[tokio::test]
    async fn test_download_without_id_returns_newest() {
        let backend = MemoryBackend::new();
        let storage = storage(&backend).await;

        storage.upload(&snapshot("device-a")).await.unwrap();
        let mut newer = snapshot("device-b");
        newer.timestamp += chrono::Duration::seconds(10);
        storage.upload(&newer).await.unwrap();

        let latest = storage.download(None).await.unwrap().unwrap();
        assert_eq!(latest.device_id, "device-b");

        let peer = storage.download_latest_from_peers("device-b").await.unwrap().unwrap();
        assert_eq!(peer.device_id, "device-a");

        assert_eq!(storage.download(Some("device-z")).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gaps_double() {
        let backend = MemoryBackend::new();
        let storage = storage(&backend).await;
        backend.set_unavailable(true).await;

        let report = storage
            .upload_with_retry(&snapshot("a"), 3, Duration::from_millis(100))
            .await;

        assert!(!report.success);
        assert_eq!(report.attempts, 3);
        assert!(report.last_error.is_some());

        let times = backend.put_attempt_times().await;
        assert_eq!(times.len(), 3);
        let first_gap = times[1] - times[0];
        let second_gap = times[2] - times[1];
        assert!(first_gap >= Duration::from_millis(100));
        assert!(second_gap >= first_gap * 2);
        assert!(report.into_result().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_after_transient_failure() {
        let backend = MemoryBackend::new();
        let storage = storage(&backend).await;
        backend.fail_next_puts(1).await;

        let report = storage
            .upload_with_retry(&snapshot("a"), 3, Duration::from_millis(50))
            .await;

        assert!(report.success);
        assert_eq!(report.attempts, 2);
    }

    #[tokio::test]
    async fn test_storage_info_and_quota() {
        let backend = MemoryBackend::with_quota(1_000_000);
        let storage = storage(&backend).await;
        storage.upload(&snapshot("device-a")).await.unwrap();

        let info = storage.get_storage_info().await.unwrap().unwrap();
        assert!(info.used > 0);
        assert_eq!(info.used + info.available, 1_000_000);
        assert!(storage.test_connection().await);
    }
}
