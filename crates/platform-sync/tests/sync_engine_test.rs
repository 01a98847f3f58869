// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end engine scenarios against the in-memory store and mock client.
//!
//! These tests drive the worker, status poller and reconciler together the
//! way the runtime does, without a database.

use std::sync::Arc;
use std::time::Duration;

use platform_sync::SyncConfig;
use platform_sync::external::{
    MockExternalClient, MockOperation, RecordedCall, ResourceState, ResourceStatus,
};
use platform_sync::model::{
    NodePoolSpec, OutboxStatus, OutboxSubject, SyncEventKind, SyncOperation,
};
use platform_sync::notify::InMemoryNotifications;
use platform_sync::reconciler::Reconciler;
use platform_sync::status_poller::StatusPoller;
use platform_sync::store::{MemorySyncStore, SyncStore};
use platform_sync::worker::SyncWorker;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

struct Engine {
    store: MemorySyncStore,
    client: MockExternalClient,
    notifications: InMemoryNotifications,
    config: SyncConfig,
    wake: Arc<Notify>,
}

impl Engine {
    fn new() -> Self {
        Self::with_config(SyncConfig {
            max_retries: 3,
            poll_interval: Duration::from_secs(3600),
            reconnect_backoff: Duration::from_millis(50),
            ..SyncConfig::default()
        })
    }

    fn with_config(config: SyncConfig) -> Self {
        Self {
            store: MemorySyncStore::new(),
            client: MockExternalClient::new(),
            notifications: InMemoryNotifications::new(config.channel.clone()),
            config,
            wake: Arc::new(Notify::new()),
        }
    }

    fn worker(&self) -> SyncWorker {
        SyncWorker::new(
            Arc::new(self.store.clone()),
            Arc::new(self.client.clone()),
            Arc::new(self.notifications.clone()),
            self.config.clone(),
        )
        .with_wake(self.wake.clone())
    }

    fn reconciler(&self) -> Reconciler {
        Reconciler::new(
            Arc::new(self.store.clone()),
            Arc::new(self.client.clone()),
            self.config.clone(),
            self.wake.clone(),
        )
    }

    fn poller(&self) -> StatusPoller {
        StatusPoller::new(
            Arc::new(self.store.clone()),
            Arc::new(self.client.clone()),
            self.config.clone(),
        )
    }

    async fn create_cluster(&self, name: &str) -> Uuid {
        let org = self.store.insert_organization("Acme Corp");
        let cluster = self.store.insert_cluster(org, name, "eu-west-1", "1.30");
        self.store
            .enqueue(OutboxSubject::Organization(org), SyncOperation::Upsert)
            .await
            .unwrap();
        self.store
            .enqueue(OutboxSubject::Cluster(cluster), SyncOperation::Upsert)
            .await
            .unwrap();
        cluster
    }
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

fn all_succeeded(store: &MemorySyncStore) -> bool {
    store
        .items()
        .iter()
        .all(|i| i.status == OutboxStatus::Succeeded)
}

// ============================================================================
// Drift healing
// ============================================================================

#[tokio::test]
async fn test_lost_resource_is_recreated() {
    let engine = Engine::new();
    let worker = engine.worker();
    let cluster = engine.create_cluster("payments").await;
    worker.drain().await.unwrap();
    assert_eq!(engine.client.resources_for(cluster).await.len(), 1);

    // someone removes the resource behind our back
    engine.client.drop_resource(cluster).await;

    let report = engine.reconciler().reconcile().await.unwrap();
    assert_eq!(report.missing, vec![cluster]);
    assert_eq!(report.requeued, 1);

    worker.drain().await.unwrap();
    assert_eq!(engine.client.resources_for(cluster).await.len(), 1);
    assert!(all_succeeded(&engine.store));

    let report = engine.reconciler().reconcile().await.unwrap();
    assert_eq!(report.corrective_actions(), 0);
    assert!(!report.has_drift());
}

#[tokio::test]
async fn test_orphan_from_interrupted_delete_is_removed_and_confirmed() {
    let engine = Engine::new();
    let worker = engine.worker();
    let cluster = engine.create_cluster("payments").await;
    worker.drain().await.unwrap();

    // deleted relationally, but the delete never reached the control plane
    engine.store.soft_delete_cluster(cluster);

    let report = engine.reconciler().reconcile().await.unwrap();
    assert_eq!(report.orphans, vec![cluster]);
    assert_eq!(report.deleted, 1);
    assert!(engine.client.resources_for(cluster).await.is_empty());

    let tick = engine.poller().tick().await.unwrap();
    assert_eq!(tick.confirmed_deleted, 1);
    assert!(engine.store.is_deletion_confirmed(cluster));
}

#[tokio::test]
async fn test_reconcile_is_idempotent_on_consistent_state() {
    let engine = Engine::new();
    let worker = engine.worker();
    for name in ["payments", "search", "ledger"] {
        engine.create_cluster(name).await;
    }
    worker.drain().await.unwrap();
    engine.client.clear_calls().await;

    let reconciler = engine.reconciler();
    for _ in 0..2 {
        let report = reconciler.reconcile().await.unwrap();
        assert_eq!(report.corrective_actions(), 0);
    }

    // only listing, no writes
    assert!(
        engine
            .client
            .calls()
            .await
            .iter()
            .all(|c| matches!(c, RecordedCall::ListResources))
    );
}

// ============================================================================
// Apply semantics
// ============================================================================

#[tokio::test]
async fn test_reapply_keeps_one_resource_per_cluster() {
    let engine = Engine::new();
    let worker = engine.worker();
    let cluster = engine.create_cluster("payments").await;
    worker.drain().await.unwrap();

    engine.store.set_cluster_version(cluster, "1.31");
    engine
        .store
        .enqueue(OutboxSubject::Cluster(cluster), SyncOperation::Upsert)
        .await
        .unwrap();
    worker.drain().await.unwrap();

    let resources = engine.client.resources_for(cluster).await;
    assert_eq!(resources.len(), 1);
    assert_eq!(resources[0].kubernetes_version, "1.31");
}

#[tokio::test]
async fn test_node_pool_change_reapplies_cluster() {
    let engine = Engine::new();
    let worker = engine.worker();
    let cluster = engine.create_cluster("payments").await;
    worker.drain().await.unwrap();

    let pool = engine.store.insert_node_pool(
        cluster,
        NodePoolSpec {
            name: "workers".into(),
            machine_type: "m5.large".into(),
            min_nodes: 1,
            max_nodes: 5,
        },
    );
    engine
        .store
        .enqueue(OutboxSubject::NodePool(pool), SyncOperation::Upsert)
        .await
        .unwrap();
    worker.drain().await.unwrap();

    let resources = engine.client.resources_for(cluster).await;
    assert_eq!(resources.len(), 1);
    assert_eq!(resources[0].node_pools.len(), 1);
    assert_eq!(resources[0].node_pools[0].max_nodes, 5);
}

#[tokio::test]
async fn test_retries_until_exhausted() {
    let engine = Engine::new();
    let worker = engine.worker();
    let cluster = engine.create_cluster("payments").await;
    for _ in 0..3 {
        engine
            .client
            .fail_next(MockOperation::Apply, "admission webhook denied")
            .await;
    }

    for _ in 0..3 {
        worker.drain().await.unwrap();
        engine.store.advance(Duration::from_secs(3600));
    }

    let items = engine.store.items_for(OutboxSubject::Cluster(cluster));
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].status, OutboxStatus::Failed);
    assert_eq!(items[0].attempts, 3);
    assert!(
        items[0]
            .last_error
            .as_deref()
            .unwrap()
            .contains("admission webhook denied")
    );
    assert!(engine.client.resources_for(cluster).await.is_empty());
    assert!(
        engine
            .store
            .events()
            .iter()
            .any(|e| e.kind == SyncEventKind::Failed)
    );

    // nothing left to claim
    assert_eq!(worker.drain().await.unwrap(), 0);
}

#[tokio::test]
async fn test_status_reaches_ready_after_apply() {
    let engine = Engine::new();
    let worker = engine.worker();
    let cluster = engine.create_cluster("payments").await;
    worker.drain().await.unwrap();
    engine
        .client
        .script_status(
            cluster,
            vec![
                ResourceStatus::new(ResourceState::Pending, "queued"),
                ResourceStatus::new(ResourceState::Ready, "reconciled"),
            ],
        )
        .await;

    let poller = engine.poller();
    poller.tick().await.unwrap();
    poller.tick().await.unwrap();

    assert_eq!(
        engine.store.cluster_status(cluster).unwrap().state,
        ResourceState::Ready
    );
    let changes = engine
        .store
        .events()
        .iter()
        .filter(|e| e.kind == SyncEventKind::StatusChanged)
        .count();
    assert_eq!(changes, 2);
}

// ============================================================================
// Event loop
// ============================================================================

#[tokio::test]
async fn test_event_loop_processes_notifications() {
    let engine = Engine::new();
    let shutdown = CancellationToken::new();
    let worker = engine.worker().with_shutdown(shutdown.clone());
    let health = worker.health();
    let handle = tokio::spawn(worker.run());

    wait_until(|| health.is_ready()).await;

    let cluster = engine.create_cluster("payments").await;
    engine.notifications.notify(&cluster.to_string());

    wait_until(|| all_succeeded(&engine.store)).await;
    assert_eq!(engine.client.resources_for(cluster).await.len(), 1);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("worker did not stop")
        .unwrap();
    assert!(!health.is_ready());
}

#[tokio::test]
async fn test_event_loop_recovers_from_lost_subscription() {
    let engine = Engine::new();
    let shutdown = CancellationToken::new();
    let worker = engine.worker().with_shutdown(shutdown.clone());
    let health = worker.health();
    let handle = tokio::spawn(worker.run());

    wait_until(|| health.is_ready()).await;
    assert_eq!(engine.notifications.subscriptions(), 1);

    engine.notifications.fail_next_subscribes(2);
    engine.notifications.disconnect();
    wait_until(|| !health.is_ready()).await;

    wait_until(|| engine.notifications.subscriptions() == 2 && health.is_ready()).await;

    // work enqueued while offline or after reconnecting is still picked up
    let cluster = engine.create_cluster("payments").await;
    engine.notifications.notify(&cluster.to_string());
    wait_until(|| all_succeeded(&engine.store)).await;

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("worker did not stop")
        .unwrap();
}

#[tokio::test]
async fn test_reconciler_wakes_idle_worker() {
    let engine = Engine::new();
    let shutdown = CancellationToken::new();
    let worker = engine.worker().with_shutdown(shutdown.clone());
    let health = worker.health();
    let handle = tokio::spawn(worker.run());
    wait_until(|| health.is_ready()).await;

    // cluster exists but nobody enqueued it and no notification fired
    let org = engine.store.insert_organization("Acme Corp");
    let cluster = engine
        .store
        .insert_cluster(org, "payments", "eu-west-1", "1.30");

    let report = engine.reconciler().reconcile().await.unwrap();
    assert_eq!(report.requeued, 1);

    wait_until(|| all_succeeded(&engine.store)).await;
    assert_eq!(engine.client.resources_for(cluster).await.len(), 1);

    shutdown.cancel();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_poll_interval_picks_up_unannounced_work() {
    let engine = Engine::with_config(SyncConfig {
        max_retries: 3,
        poll_interval: Duration::from_secs(30),
        reconnect_backoff: Duration::from_millis(50),
        ..SyncConfig::default()
    });
    let shutdown = CancellationToken::new();
    let worker = engine.worker().with_shutdown(shutdown.clone());
    let health = worker.health();
    let handle = tokio::spawn(worker.run());
    wait_until(|| health.is_ready()).await;

    // committed without a notification or a wake
    let cluster = engine.create_cluster("payments").await;

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(engine.client.resources_for(cluster).await.is_empty());

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(all_succeeded(&engine.store));
    assert_eq!(engine.client.resources_for(cluster).await.len(), 1);

    shutdown.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_duplicate_and_garbage_notifications_are_harmless() {
    let engine = Engine::new();
    let shutdown = CancellationToken::new();
    let worker = engine.worker().with_shutdown(shutdown.clone());
    let health = worker.health();
    let handle = tokio::spawn(worker.run());
    wait_until(|| health.is_ready()).await;

    let cluster = engine.create_cluster("payments").await;
    engine.notifications.notify("not-a-uuid");
    engine.notifications.notify("");
    for _ in 0..3 {
        engine.notifications.notify(&cluster.to_string());
    }

    wait_until(|| all_succeeded(&engine.store)).await;
    // let the queued notifications drain
    tokio::time::sleep(Duration::from_millis(100)).await;

    let applies = engine
        .client
        .calls()
        .await
        .iter()
        .filter(|c| matches!(c, RecordedCall::ApplyResource(_)))
        .count();
    assert_eq!(applies, 1);
    assert!(health.is_ready());
    assert_eq!(engine.notifications.subscriptions(), 1);

    shutdown.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_exhausted_cluster_stays_failed_across_reconciles() {
    let engine = Engine::new();
    let worker = engine.worker();
    let reconciler = engine.reconciler();
    let cluster = engine.create_cluster("payments").await;
    for _ in 0..12 {
        engine
            .client
            .fail_next(MockOperation::Apply, "admission webhook denied")
            .await;
    }

    for _ in 0..4 {
        worker.drain().await.unwrap();
        reconciler.reconcile().await.unwrap();
        engine.store.advance(Duration::from_secs(3600));
    }

    let applies = engine
        .client
        .calls()
        .await
        .iter()
        .filter(|c| matches!(c, RecordedCall::ApplyResource(_)))
        .count();
    assert_eq!(applies, 3);

    let items = engine.store.items_for(OutboxSubject::Cluster(cluster));
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].status, OutboxStatus::Failed);

    let report = reconciler.reconcile().await.unwrap();
    assert_eq!(report.exhausted, vec![cluster]);
    assert_eq!(report.requeued, 0);
}
