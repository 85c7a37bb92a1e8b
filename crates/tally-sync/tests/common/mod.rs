//! Shared fixtures: two devices against one in-memory cloud.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tally_core::{ConflictStrategy, ConnectionType, NetworkState, Sale, SaleStatus, SyncConfig};
use tally_db::{Database, DbConfig};
use tally_sync::{
    CloudStorage, ConflictResolver, DatabaseStore, EngineOptions, MemoryBackend, NetworkMonitor,
    StaticProbe, SyncEngine, SyncEngineBuilder,
};

pub struct Device {
    pub db: Database,
    pub engine: Arc<SyncEngine>,
    pub store: DatabaseStore,
}

pub fn online() -> NetworkState {
    NetworkState::online(ConnectionType::Wifi, false)
}

pub async fn cloud(backend: &MemoryBackend) -> Arc<CloudStorage> {
    let network = Arc::new(NetworkMonitor::with_initial_state(
        StaticProbe::new(online()),
        online(),
    ));
    let cloud = Arc::new(CloudStorage::new(Arc::new(backend.clone()), network));
    cloud.authenticate(MemoryBackend::TOKEN, None).await.unwrap();
    cloud
}

pub async fn device(backend: &MemoryBackend, id: &str) -> Device {
    device_with(backend, id, None).await
}

pub async fn device_with(
    backend: &MemoryBackend,
    id: &str,
    resolver: Option<Arc<dyn ConflictResolver>>,
) -> Device {
    let db = Database::new(DbConfig::in_memory()).await.unwrap();
    let mut builder = builder(&db, backend, id).await;
    if let Some(resolver) = resolver {
        builder = builder.resolver(resolver);
    }
    finish(db, builder).await
}

/// Device whose first persisted config carries `strategy`.
pub async fn device_with_strategy(
    backend: &MemoryBackend,
    id: &str,
    strategy: ConflictStrategy,
) -> Device {
    let db = Database::new(DbConfig::in_memory()).await.unwrap();
    let seed = SyncConfig {
        conflict_resolution_strategy: strategy,
        ..SyncConfig::new(id)
    };
    let builder = builder(&db, backend, id).await.seed_config(seed);
    finish(db, builder).await
}

async fn builder(db: &Database, backend: &MemoryBackend, id: &str) -> SyncEngineBuilder {
    SyncEngine::builder(db.clone(), cloud(backend).await)
        .device_id(id)
        .options(EngineOptions {
            upload_base_delay: Duration::from_millis(1),
            ..Default::default()
        })
}

async fn finish(db: Database, builder: SyncEngineBuilder) -> Device {
    let engine = builder.build().await.unwrap();
    let store = DatabaseStore::new(db.clone(), engine.change_log().clone());
    Device { db, engine, store }
}

pub fn sale(receipt: &str, total_cents: i64, device_id: &str) -> Sale {
    let now = Utc::now();
    Sale {
        id: uuid::Uuid::new_v4().to_string(),
        receipt_number: receipt.to_string(),
        status: SaleStatus::Completed,
        subtotal_cents: total_cents,
        tax_cents: 0,
        discount_cents: 0,
        total_cents,
        user_id: "cashier-1".to_string(),
        device_id: device_id.to_string(),
        notes: None,
        created_at: now,
        updated_at: now,
        completed_at: Some(now),
        sync_version: 1,
    }
}
