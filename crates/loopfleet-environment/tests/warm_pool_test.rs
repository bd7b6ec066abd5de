// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for warm pool maintenance, hand-out, rotation and reconciliation.

mod common;

use chrono::Utc;
use common::{Fleet, settle, test_config};
use loopfleet_core::{InstanceRecord, InstanceStatus, InstanceStore, MarketType};
use loopfleet_environment::provider::{MockProvider, ProviderEvent, ProviderState};
use loopfleet_environment::warm_pool::PoolHealth;

/// Insert a warm, available instance created `hours` ago that the provider
/// knows as running.
async fn insert_aged_warm(fleet: &Fleet, instance_id: &str, hours: i64) {
    let created = Utc::now() - chrono::Duration::hours(hours);
    let record = InstanceRecord::launching(instance_id, MarketType::Spot, true, created);
    fleet.registry.insert_instance(&record).await.unwrap();
    assert!(
        fleet
            .registry
            .mark_instance_ready(instance_id, Some("10.0.0.9"), None, Utc::now())
            .await
            .unwrap()
    );
    fleet
        .provider
        .adopt(instance_id, ProviderState::Running)
        .await;
}

#[tokio::test]
async fn test_maintain_fills_pool_and_is_idempotent() {
    let fleet = Fleet::new(5, 3).await;

    let report = fleet.warm_pool.maintain().await.unwrap();
    assert_eq!(report.provisioned.len(), 3);
    assert_eq!(report.failures, 0);
    assert_eq!(fleet.count_warm(&[InstanceStatus::Available]).await, 3);

    let report = fleet.warm_pool.maintain().await.unwrap();
    assert!(report.provisioned.is_empty());
    assert!(report.rotated.is_empty());

    let events = fleet.provider.events().await;
    assert_eq!(events.len(), 3);
    assert!(
        events
            .iter()
            .all(|e| matches!(e, ProviderEvent::Launch { warm: true, .. }))
    );
}

#[tokio::test]
async fn test_maintain_stops_at_ceiling() {
    let fleet = Fleet::new(2, 3).await;

    let report = fleet.warm_pool.maintain().await.unwrap();

    assert_eq!(report.provisioned.len(), 2);
    assert_eq!(report.failures, 1);
    assert_eq!(fleet.count(&InstanceStatus::ACTIVE).await, 2);
}

#[tokio::test]
async fn test_single_launch_failure_does_not_abort_maintenance() {
    let fleet =
        Fleet::with_provider(MockProvider::with_launch_failures(1), test_config(5, 3)).await;

    let report = fleet.warm_pool.maintain().await.unwrap();

    assert_eq!(report.provisioned.len(), 2);
    assert_eq!(report.failures, 1);
    assert_eq!(fleet.count_warm(&[InstanceStatus::Available]).await, 2);

    // The next pass closes the gap.
    let report = fleet.warm_pool.maintain().await.unwrap();
    assert_eq!(report.provisioned.len(), 1);
    assert_eq!(report.failures, 0);
    assert_eq!(fleet.count_warm(&[InstanceStatus::Available]).await, 3);
}

#[tokio::test]
async fn test_warm_handouts_are_distinct_and_backfilled() {
    let fleet = Fleet::new(5, 2).await;
    fleet.warm_pool.maintain().await.unwrap();

    let a = fleet.warm_pool.get_warm_instance("exec-a").await.unwrap();
    let b = fleet.warm_pool.get_warm_instance("exec-b").await.unwrap();
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_ne!(a, b);

    settle().await;
    assert_eq!(fleet.count_warm(&[InstanceStatus::Available]).await, 2);
    assert_eq!(fleet.count(&[InstanceStatus::Busy]).await, 2);
}

#[tokio::test]
async fn test_empty_pool_hands_out_nothing() {
    let fleet = Fleet::new(5, 0).await;

    assert!(
        fleet
            .warm_pool
            .get_warm_instance("exec-1")
            .await
            .unwrap()
            .is_none()
    );
    settle().await;
    assert!(fleet.provider.events().await.is_empty());
}

#[tokio::test]
async fn test_rotation_launches_replacement_before_terminating() {
    let fleet = Fleet::new(5, 1).await;
    insert_aged_warm(&fleet, "i-aged", 25).await;

    let report = fleet.warm_pool.maintain().await.unwrap();
    assert_eq!(report.rotated, vec!["i-aged".to_string()]);
    assert_eq!(report.provisioned.len(), 1);

    let events = fleet.provider.events().await;
    let launch = events
        .iter()
        .position(|e| matches!(e, ProviderEvent::Launch { warm: true, .. }))
        .unwrap();
    let terminate = events
        .iter()
        .position(|e| matches!(e, ProviderEvent::Terminate { instance_id } if instance_id == "i-aged"))
        .unwrap();
    assert!(launch < terminate);

    assert_eq!(
        fleet.instance("i-aged").await.status,
        InstanceStatus::Terminating
    );
    assert_eq!(fleet.count_warm(&[InstanceStatus::Available]).await, 1);
}

#[tokio::test]
async fn test_rotation_keeps_aged_instance_when_replacement_fails() {
    let fleet = Fleet::new(1, 1).await;
    insert_aged_warm(&fleet, "i-aged", 30).await;

    let report = fleet.warm_pool.maintain().await.unwrap();

    assert!(report.rotated.is_empty());
    assert_eq!(report.failures, 1);
    assert!(fleet.provider.terminated().await.is_empty());
    assert_eq!(
        fleet.instance("i-aged").await.status,
        InstanceStatus::Available
    );
}

#[tokio::test]
async fn test_young_instances_are_not_rotated() {
    let fleet = Fleet::new(5, 1).await;
    insert_aged_warm(&fleet, "i-young", 2).await;

    let report = fleet.warm_pool.maintain().await.unwrap();

    assert!(report.rotated.is_empty());
    assert!(report.provisioned.is_empty());
}

#[tokio::test]
async fn test_status_reports_health() {
    // Ceiling equal to the pool so the backfill after a claim cannot launch.
    let fleet = Fleet::new(3, 3).await;
    fleet.warm_pool.maintain().await.unwrap();

    let status = fleet.warm_pool.get_status().await.unwrap();
    assert_eq!(status.total, 3);
    assert_eq!(status.available, 3);
    assert_eq!(status.target, 3);
    assert_eq!(status.health, PoolHealth::Healthy);
    assert_eq!(status.instances.len(), 3);
    assert!(status.instances.iter().all(|i| i.age_display == "0h 0m"));

    fleet.warm_pool.get_warm_instance("exec-1").await.unwrap();
    settle().await;

    let status = fleet.warm_pool.get_status().await.unwrap();
    assert_eq!(status.available, 2);
    assert_eq!(status.busy, 1);
    assert_eq!(status.launching, 0);
    assert_eq!(status.health, PoolHealth::Degraded);

    fleet.warm_pool.get_warm_instance("exec-2").await.unwrap();
    settle().await;
    let status = fleet.warm_pool.get_status().await.unwrap();
    assert_eq!(status.health, PoolHealth::NeedsAttention);
}

#[tokio::test]
async fn test_reconcile_removes_stale_records_and_refills() {
    let fleet = Fleet::new(5, 2).await;
    let report = fleet.warm_pool.maintain().await.unwrap();
    let (gone, stopped) = (&report.provisioned[0], &report.provisioned[1]);

    fleet.provider.forget(gone).await;
    fleet
        .provider
        .set_state(stopped, ProviderState::Terminated)
        .await;

    let reconcile = fleet.warm_pool.reconcile().await.unwrap();

    let mut removed = reconcile.removed.clone();
    removed.sort();
    let mut expected = vec![gone.clone(), stopped.clone()];
    expected.sort();
    assert_eq!(removed, expected);
    assert_eq!(reconcile.maintenance.provisioned.len(), 2);
    assert!(fleet.registry.get_instance(gone).await.unwrap().is_none());
    assert_eq!(fleet.count_warm(&[InstanceStatus::Available]).await, 2);
}
