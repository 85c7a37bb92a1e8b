//! In-memory [`CloudBackend`] double.
//!
//! Snapshots are kept as serialized JSON, the way a remote store holds them,
//! so tests can corrupt the stored bytes. Clones share one store, letting
//! several simulated devices talk to the same "cloud".

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::RwLock;
use tokio::time::Instant;

use super::{CloudBackend, StorageInfo};
use crate::error::{SyncError, SyncResult};
use tally_core::{CloudSyncData, SnapshotSummary};

const DEFAULT_QUOTA: u64 = 512 * 1024 * 1024;

#[derive(Debug, Default)]
struct MemoryState {
    snapshots: HashMap<String, String>,
    quota: u64,
    unavailable: bool,
    failures_remaining: u32,
    put_attempts: Vec<Instant>,
}

/// Shared in-memory snapshot store with quota and failure injection.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    state: Arc<RwLock<MemoryState>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// The only token `authenticate` accepts.
    pub const TOKEN: &'static str = "memory-token";

    pub fn new() -> Self {
        Self::with_quota(DEFAULT_QUOTA)
    }

    pub fn with_quota(quota: u64) -> Self {
        MemoryBackend {
            state: Arc::new(RwLock::new(MemoryState {
                quota,
                ..Default::default()
            })),
        }
    }

    /// Makes every call fail as unreachable until switched back.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.write().await.unavailable = unavailable;
    }

    /// Fails the next `count` uploads, then recovers.
    pub async fn fail_next_puts(&self, count: u32) {
        self.state.write().await.failures_remaining = count;
    }

    pub async fn put_attempts(&self) -> usize {
        self.state.read().await.put_attempts.len()
    }

    /// Instants at which uploads were attempted, oldest first.
    pub async fn put_attempt_times(&self) -> Vec<Instant> {
        self.state.read().await.put_attempts.clone()
    }

    pub async fn snapshot_count(&self) -> usize {
        self.state.read().await.snapshots.len()
    }

    /// Alters the stored payload of `device_id` without touching its
    /// checksum.
    pub async fn tamper(&self, device_id: &str) -> bool {
        let mut state = self.state.write().await;
        let Some(raw) = state.snapshots.get_mut(device_id) else {
            return false;
        };
        let Ok(mut snapshot) = serde_json::from_str::<CloudSyncData>(raw) else {
            return false;
        };

        snapshot
            .data
            .entry("products".to_string())
            .or_default()
            .push(json!({"sku": "INJECTED", "name": "Injected", "price_cents": 1}));
        snapshot.metadata.total_records += 1;

        match serde_json::to_string(&snapshot) {
            Ok(tampered) => {
                *raw = tampered;
                true
            }
            Err(_) => false,
        }
    }

    fn check_available(state: &MemoryState) -> SyncResult<()> {
        if state.unavailable {
            return Err(SyncError::BackendUnreachable("memory backend offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl CloudBackend for MemoryBackend {
    async fn authenticate(&self, token: &str, _endpoint: Option<&str>) -> SyncResult<bool> {
        Self::check_available(&*self.state.read().await)?;
        Ok(token == Self::TOKEN)
    }

    async fn put_snapshot(&self, snapshot: &CloudSyncData) -> SyncResult<()> {
        let mut state = self.state.write().await;
        state.put_attempts.push(Instant::now());
        Self::check_available(&state)?;

        if state.failures_remaining > 0 {
            state.failures_remaining -= 1;
            return Err(SyncError::BackendUnreachable("injected upload failure".into()));
        }

        let raw = serde_json::to_string(snapshot)?;
        let used: u64 = state
            .snapshots
            .iter()
            .filter(|(device, _)| device.as_str() != snapshot.device_id)
            .map(|(_, stored)| stored.len() as u64)
            .sum();
        if used + raw.len() as u64 > state.quota {
            return Err(SyncError::Http {
                status: 507,
                message: "storage quota exceeded".into(),
            });
        }

        state.snapshots.insert(snapshot.device_id.clone(), raw);
        Ok(())
    }

    async fn get_snapshot(&self, device_id: &str) -> SyncResult<Option<CloudSyncData>> {
        let state = self.state.read().await;
        Self::check_available(&state)?;

        match state.snapshots.get(device_id) {
            Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
            None => Ok(None),
        }
    }

    async fn list_snapshots(&self) -> SyncResult<Vec<SnapshotSummary>> {
        let state = self.state.read().await;
        Self::check_available(&state)?;

        let mut summaries = Vec::with_capacity(state.snapshots.len());
        for raw in state.snapshots.values() {
            let snapshot: CloudSyncData = serde_json::from_str(raw)?;
            summaries.push(snapshot.summary());
        }
        Ok(summaries)
    }

    async fn storage_info(&self) -> SyncResult<StorageInfo> {
        let state = self.state.read().await;
        Self::check_available(&state)?;

        let used: u64 = state.snapshots.values().map(|raw| raw.len() as u64).sum();
        Ok(StorageInfo {
            used,
            available: state.quota.saturating_sub(used),
        })
    }

    async fn ping(&self) -> SyncResult<()> {
        Self::check_available(&*self.state.read().await)
    }
}
