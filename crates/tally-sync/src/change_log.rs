//! # Change Log
//!
//! Device-aware front of the change journal. Stamps every record with this
//! device's id and applies the configured retry ceiling.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};

use crate::error::SyncResult;
use tally_core::{ChangeCounts, ChangeOperation, ChangeRecord, ChangeStatus, NewChange};
use tally_db::{ChangeLogRepository, Database};

/// Journal of local mutations for this device.
#[derive(Debug, Clone)]
pub struct ChangeLog {
    repo: ChangeLogRepository,
    device_id: String,
    max_retry_attempts: Arc<AtomicU32>,
}

impl ChangeLog {
    pub fn new(db: &Database, device_id: impl Into<String>, max_retry_attempts: u32) -> Self {
        ChangeLog {
            repo: db.change_log(),
            device_id: device_id.into(),
            max_retry_attempts: Arc::new(AtomicU32::new(max_retry_attempts)),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Retry ceiling; shared by every clone of this log.
    pub fn max_retry_attempts(&self) -> u32 {
        self.max_retry_attempts.load(Ordering::Relaxed)
    }

    pub fn set_max_retry_attempts(&self, max: u32) {
        self.max_retry_attempts.store(max, Ordering::Relaxed);
    }

    /// Appends a PENDING record with the next version for
    /// `(table, record_id)`.
    pub async fn record(
        &self,
        operation: ChangeOperation,
        table: &str,
        record_id: &str,
        data_snapshot: &Value,
    ) -> SyncResult<ChangeRecord> {
        let change = NewChange::new(
            operation,
            table,
            record_id,
            data_snapshot.to_string(),
            self.device_id.as_str(),
        );
        Ok(self.repo.append(&change).await?)
    }

    /// Claims PENDING/FAILED records, oldest first, and marks them SYNCING.
    pub async fn drain_pending(&self, limit: u32) -> SyncResult<Vec<ChangeRecord>> {
        let drained = self.repo.drain_pending(limit).await?;
        if !drained.is_empty() {
            debug!(count = drained.len(), "Drained pending changes");
        }
        Ok(drained)
    }

    pub async fn mark_synced(&self, id: &str) -> SyncResult<()> {
        Ok(self.repo.mark_synced(id).await?)
    }

    /// Records a failed attempt; returns DROPPED once the retry ceiling is
    /// reached.
    pub async fn mark_failed(&self, id: &str, error: &str) -> SyncResult<ChangeStatus> {
        Ok(self
            .repo
            .mark_failed(id, error, self.max_retry_attempts())
            .await?)
    }

    /// Flags the open records of an entity as part of a conflict.
    pub async fn mark_conflict(&self, table: &str, record_id: &str) -> SyncResult<u64> {
        Ok(self
            .repo
            .set_status_for_record(table, record_id, ChangeStatus::Conflict)
            .await?)
    }

    /// Closes the conflict-flagged records of an entity.
    pub async fn mark_resolved(&self, table: &str, record_id: &str) -> SyncResult<u64> {
        Ok(self
            .repo
            .set_status_for_record(table, record_id, ChangeStatus::Resolved)
            .await?)
    }

    pub async fn stats(&self) -> SyncResult<ChangeCounts> {
        Ok(self.repo.counts().await?)
    }

    pub async fn history(&self, table: &str, record_id: &str) -> SyncResult<Vec<ChangeRecord>> {
        Ok(self.repo.history(table, record_id).await?)
    }

    pub async fn latest_version(&self, table: &str, record_id: &str) -> SyncResult<i64> {
        Ok(self.repo.latest_version(table, record_id).await?)
    }

    /// Returns SYNCING records left behind by an interrupted process.
    pub async fn recover_in_flight(&self) -> SyncResult<u64> {
        let requeued = self.repo.requeue_in_flight().await?;
        if requeued > 0 {
            info!(requeued, "Requeued changes left in flight");
        }
        Ok(requeued)
    }

    pub async fn cleanup_synced(&self, older_than_days: u32) -> SyncResult<u64> {
        let removed = self.repo.cleanup_synced(older_than_days).await?;
        if removed > 0 {
            info!(removed, older_than_days, "Cleaned up synced changes");
        }
        Ok(removed)
    }
}
