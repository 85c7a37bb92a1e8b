//! Multi-device sync scenarios over a shared in-memory cloud.

mod common;

use std::sync::Arc;

use common::{device, device_with, device_with_strategy, sale, Device};
use pretty_assertions::assert_eq;
use tally_core::{ConflictStrategy, Product, SyncConfigUpdate, SyncState};
use tally_sync::conflict::Manual;
use tally_sync::{CycleOutcome, MemoryBackend, PhaseOutcome, SyncError};

#[tokio::test]
async fn test_two_devices_converge() {
    let backend = MemoryBackend::new();
    let a = device(&backend, "device-a").await;
    let b = device(&backend, "device-b").await;

    for i in 0..5 {
        a.store
            .insert_product(&Product::new(format!("A-{}", i), "From A", 100 + i))
            .await
            .unwrap();
    }
    a.store.insert_sale(&sale("R-0001", 500, "device-a")).await.unwrap();
    for i in 0..3 {
        b.store
            .insert_product(&Product::new(format!("B-{}", i), "From B", 200 + i))
            .await
            .unwrap();
    }

    let first = a.engine.perform_incremental_sync().await.unwrap();
    assert_eq!(first.upload, PhaseOutcome::Succeeded);
    assert_eq!(first.download, PhaseOutcome::Skipped("no peer snapshot available".into()));

    let second = b.engine.perform_incremental_sync().await.unwrap();
    assert_eq!(second.merge.inserted, 6);
    assert_eq!(second.remote_device_id.as_deref(), Some("device-a"));

    let third = a.engine.perform_incremental_sync().await.unwrap();
    assert_eq!(third.merge.inserted, 3);

    for dev in [&a, &b] {
        assert_eq!(dev.db.products().count().await.unwrap(), 8);
        assert!(dev.db.sales().get_by_receipt("R-0001").await.unwrap().is_some());
        assert!(dev.engine.get_conflicts().await.unwrap().is_empty());
    }
}

#[tokio::test]
async fn test_repeated_full_sync_changes_nothing() {
    let backend = MemoryBackend::new();
    let a = device(&backend, "device-a").await;
    let b = device(&backend, "device-b").await;

    a.store.insert_product(&Product::new("A-1", "Apple", 50)).await.unwrap();
    a.engine.perform_full_sync().await.unwrap();
    b.engine.perform_full_sync().await.unwrap();

    let before = b.db.products().get_by_sku("A-1").await.unwrap().unwrap();
    let report = b.engine.perform_full_sync().await.unwrap();
    let after = b.db.products().get_by_sku("A-1").await.unwrap().unwrap();

    assert_eq!(report.merge.applied(), 0);
    assert_eq!(report.merge.unchanged, 1);
    assert_eq!(before, after);
    assert_eq!(b.db.products().count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_incremental_skips_already_merged_snapshot() {
    let backend = MemoryBackend::new();
    let a = device(&backend, "device-a").await;
    let b = device(&backend, "device-b").await;

    a.store.insert_product(&Product::new("A-1", "Apple", 50)).await.unwrap();
    a.engine.perform_incremental_sync().await.unwrap();
    b.engine.perform_incremental_sync().await.unwrap();

    let again = b.engine.perform_incremental_sync().await.unwrap();
    assert_eq!(again.download, PhaseOutcome::Skipped("peer snapshot already merged".into()));
}

#[tokio::test]
async fn test_concurrent_start_runs_one_cycle() {
    let backend = MemoryBackend::new();
    let a = device(&backend, "device-a").await;
    a.store.insert_product(&Product::new("A-1", "Apple", 50)).await.unwrap();

    let (first, second) = tokio::join!(a.engine.start_sync(), a.engine.start_sync());
    let outcomes = [first.unwrap().outcome, second.unwrap().outcome];

    assert!(outcomes.contains(&CycleOutcome::Completed));
    assert!(outcomes.contains(&CycleOutcome::Skipped));
    assert_eq!(backend.put_attempts().await, 1);
    assert!(a.engine.is_scheduled().await);

    a.engine.stop_sync().await;
    a.engine.stop_sync().await;
    assert!(!a.engine.is_scheduled().await);
}

#[tokio::test]
async fn test_manual_conflict_is_recorded_once_and_resolved() {
    let backend = MemoryBackend::new();
    let a = device(&backend, "device-a").await;
    let b = device(&backend, "device-b").await;
    a.engine
        .update_config(SyncConfigUpdate {
            conflict_resolution_strategy: Some(ConflictStrategy::Manual),
            ..Default::default()
        })
        .await
        .unwrap();

    a.store.insert_product(&Product::new("X-1", "Widget", 100)).await.unwrap();
    a.engine.perform_full_sync().await.unwrap();
    b.engine.perform_full_sync().await.unwrap();

    // Disjoint edits to the same product on both devices.
    let mut on_a = a.db.products().get_by_sku("X-1").await.unwrap().unwrap();
    on_a.name = "Blue Widget".into();
    a.store.update_product(&on_a).await.unwrap();

    let mut on_b = b.db.products().get_by_sku("X-1").await.unwrap().unwrap();
    on_b.price_cents = 150;
    b.store.update_product(&on_b).await.unwrap();

    b.engine.perform_incremental_sync().await.unwrap();
    let report = a.engine.perform_incremental_sync().await.unwrap();
    assert_eq!(report.merge.conflicts, 1);

    let conflicts = a.engine.get_conflicts().await.unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].record_id, "X-1");

    // Local record untouched while the conflict is open.
    let local = a.db.products().get_by_sku("X-1").await.unwrap().unwrap();
    assert_eq!(local.name, "Blue Widget");
    assert_eq!(local.price_cents, 100);

    a.engine.perform_full_sync().await.unwrap();
    assert_eq!(a.engine.get_conflicts().await.unwrap().len(), 1);

    let err = a
        .engine
        .resolve_conflict(&conflicts[0].id, ConflictStrategy::Manual, None)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::InvalidResolution(_)));

    let resolved = a
        .engine
        .resolve_conflict(&conflicts[0].id, ConflictStrategy::Merge, None)
        .await
        .unwrap();
    assert!(resolved.is_resolved());
    assert!(a.engine.get_conflicts().await.unwrap().is_empty());

    let merged = a.db.products().get_by_sku("X-1").await.unwrap().unwrap();
    assert_eq!(merged.name, "Blue Widget");
    assert_eq!(merged.price_cents, 150);
    assert_eq!(merged.sync_version, 3);
}

#[tokio::test]
async fn test_local_wins_keeps_local_record() {
    let backend = MemoryBackend::new();
    let a = device(&backend, "device-a").await;
    let b = device(&backend, "device-b").await;

    a.store.insert_product(&Product::new("X-1", "Widget", 100)).await.unwrap();
    a.engine.perform_full_sync().await.unwrap();
    b.engine.perform_full_sync().await.unwrap();

    let mut on_a = a.db.products().get_by_sku("X-1").await.unwrap().unwrap();
    on_a.price_cents = 110;
    a.store.update_product(&on_a).await.unwrap();
    let mut on_b = b.db.products().get_by_sku("X-1").await.unwrap().unwrap();
    on_b.price_cents = 120;
    b.store.update_product(&on_b).await.unwrap();

    b.engine.perform_incremental_sync().await.unwrap();
    let report = a.engine.perform_incremental_sync().await.unwrap();

    assert_eq!(report.merge.auto_resolved, 1);
    assert!(a.engine.get_conflicts().await.unwrap().is_empty());
    let local = a.db.products().get_by_sku("X-1").await.unwrap().unwrap();
    assert_eq!(local.price_cents, 110);
}

#[tokio::test]
async fn test_tampered_snapshot_is_not_merged() {
    let backend = MemoryBackend::new();
    let a = device(&backend, "device-a").await;
    let b = device(&backend, "device-b").await;

    a.store.insert_product(&Product::new("A-1", "Apple", 50)).await.unwrap();
    a.engine.perform_full_sync().await.unwrap();
    assert!(backend.tamper("device-a").await);

    let report = b.engine.perform_full_sync().await.unwrap();
    assert!(report.download.is_failure());
    assert_eq!(b.engine.state().await, SyncState::Failed);
    assert_eq!(b.db.products().count().await.unwrap(), 0);
}

/// A publishes X at v1 and v2; B fast-forwards to each and re-publishes them.
/// A then edits to v3 while B's last snapshot still carries v2.
async fn echo_of_older_local_edit(a: &Device, b: &Device) {
    a.store.insert_product(&Product::new("X-1", "Widget", 100)).await.unwrap();
    a.engine.perform_incremental_sync().await.unwrap();
    b.engine.perform_incremental_sync().await.unwrap();
    b.engine.perform_incremental_sync().await.unwrap();

    let mut on_a = a.db.products().get_by_sku("X-1").await.unwrap().unwrap();
    on_a.price_cents = 110;
    let on_a = a.store.update_product(&on_a).await.unwrap();
    assert_eq!(on_a.sync_version, 2);
    a.engine.perform_incremental_sync().await.unwrap();

    let fast_forward = b.engine.perform_incremental_sync().await.unwrap();
    assert_eq!(fast_forward.merge.fast_forwarded, 1);
    b.engine.perform_incremental_sync().await.unwrap();

    let mut on_a = a.db.products().get_by_sku("X-1").await.unwrap().unwrap();
    on_a.price_cents = 120;
    a.store.update_product(&on_a).await.unwrap();
}

#[tokio::test]
async fn test_echo_of_own_edit_keeps_newer_local_under_remote_wins() {
    let backend = MemoryBackend::new();
    let a = device_with_strategy(&backend, "device-a", ConflictStrategy::RemoteWins).await;
    let b = device(&backend, "device-b").await;
    assert_eq!(a.engine.config().await.conflict_resolution_strategy, ConflictStrategy::RemoteWins);

    echo_of_older_local_edit(&a, &b).await;
    let report = a.engine.perform_incremental_sync().await.unwrap();

    assert_eq!(report.remote_device_id.as_deref(), Some("device-b"));
    assert_eq!(report.merge.auto_resolved, 0);
    assert_eq!(report.merge.kept_local, 1);
    assert!(a.engine.get_conflicts().await.unwrap().is_empty());

    let local = a.db.products().get_by_sku("X-1").await.unwrap().unwrap();
    assert_eq!(local.price_cents, 120);
    assert_eq!(local.sync_version, 3);

    // The newest edit reaches the peer as a plain fast-forward.
    let peer = b.engine.perform_incremental_sync().await.unwrap();
    assert_eq!(peer.merge.fast_forwarded, 1);
    let on_b = b.db.products().get_by_sku("X-1").await.unwrap().unwrap();
    assert_eq!(on_b.price_cents, 120);
}

#[tokio::test]
async fn test_echo_of_own_edit_opens_no_manual_conflict() {
    let backend = MemoryBackend::new();
    let a = device_with(&backend, "device-a", Some(Arc::new(Manual))).await;
    let b = device(&backend, "device-b").await;

    echo_of_older_local_edit(&a, &b).await;
    let report = a.engine.perform_incremental_sync().await.unwrap();

    assert_eq!(report.merge.conflicts, 0);
    assert!(a.engine.get_conflicts().await.unwrap().is_empty());
    let local = a.db.products().get_by_sku("X-1").await.unwrap().unwrap();
    assert_eq!(local.price_cents, 120);
}

#[tokio::test]
async fn test_peer_edit_after_echo_still_conflicts() {
    let backend = MemoryBackend::new();
    let a = device_with_strategy(&backend, "device-a", ConflictStrategy::Manual).await;
    let b = device(&backend, "device-b").await;

    echo_of_older_local_edit(&a, &b).await;
    a.engine.perform_incremental_sync().await.unwrap();

    // B edits its v2 copy independently of A's v3.
    let mut on_b = b.db.products().get_by_sku("X-1").await.unwrap().unwrap();
    on_b.name = "Red Widget".into();
    b.store.update_product(&on_b).await.unwrap();
    b.engine.perform_incremental_sync().await.unwrap();

    let report = a.engine.perform_incremental_sync().await.unwrap();
    assert_eq!(report.merge.conflicts, 1);
    let conflicts = a.engine.get_conflicts().await.unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].record_id, "X-1");
}
