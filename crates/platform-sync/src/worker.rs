// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Sync worker event loop.
//!
//! ```text
//!              subscribe ok
//!  Disconnected ───────────► Listening ──┐ notify / wake / poll timeout
//!       ▲                        │   ▲   │ (drain all pending work)
//!       │  connection lost       │   └───┘
//!       └────────────────────────┘
//! ```
//!
//! Every claimed item goes through three independently committed steps:
//! claim, external call, outcome record. No database lock is held while the
//! external system is being called.

use std::sync::Arc;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::BackoffPolicy;
use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::external::{ExternalClient, ResourceSpec};
use crate::health::Health;
use crate::model::{
    ClusterToSync, OrganizationToSync, OutboxItem, SyncEvent, SyncEventKind, SyncSnapshot,
};
use crate::notify::NotificationSource;
use crate::store::SyncStore;

/// Drives outbox items through claim, external apply and outcome record.
pub struct SyncWorker {
    store: Arc<dyn SyncStore>,
    client: Arc<dyn ExternalClient>,
    source: Arc<dyn NotificationSource>,
    config: SyncConfig,
    backoff: BackoffPolicy,
    health: Arc<Health>,
    shutdown: CancellationToken,
    wake: Arc<Notify>,
}

impl SyncWorker {
    /// Create a worker with its own health flags, shutdown token and wake handle.
    pub fn new(
        store: Arc<dyn SyncStore>,
        client: Arc<dyn ExternalClient>,
        source: Arc<dyn NotificationSource>,
        config: SyncConfig,
    ) -> Self {
        let backoff = config.backoff();
        Self {
            store,
            client,
            source,
            config,
            backoff,
            health: Arc::new(Health::new()),
            shutdown: CancellationToken::new(),
            wake: Arc::new(Notify::new()),
        }
    }

    /// Share health flags with a probe server.
    pub fn with_health(mut self, health: Arc<Health>) -> Self {
        self.health = health;
        self
    }

    /// Stop when `shutdown` is cancelled.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Drain whenever `wake` is notified.
    pub fn with_wake(mut self, wake: Arc<Notify>) -> Self {
        self.wake = wake;
        self
    }

    /// Health flags this worker updates.
    pub fn health(&self) -> Arc<Health> {
        self.health.clone()
    }

    /// Handle that triggers an immediate drain.
    pub fn wake_handle(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    /// Run until the shutdown token is cancelled.
    pub async fn run(self) {
        info!(
            worker_id = %self.config.worker_id,
            channel = %self.config.channel,
            poll_interval_secs = self.config.poll_interval.as_secs(),
            max_retries = self.config.max_retries,
            "Sync worker started"
        );

        while !self.shutdown.is_cancelled() {
            match self.listen().await {
                Ok(()) => break,
                Err(e) => {
                    self.health.set_ready(false);
                    warn!(
                        error = %e,
                        reconnect_secs = self.config.reconnect_backoff.as_secs(),
                        "Sync worker disconnected"
                    );
                    tokio::select! {
                        biased;
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.reconnect_backoff) => {}
                    }
                }
            }
        }

        self.health.set_ready(false);
        info!(worker_id = %self.config.worker_id, "Sync worker stopped");
    }

    /// One `Listening` session. Returns `Ok` on shutdown, `Err` on connection loss.
    async fn listen(&self) -> Result<()> {
        let mut subscription = self.source.subscribe().await?;
        self.health.set_ready(true);
        info!(channel = %self.config.channel, "Sync worker listening");

        // Catch up on anything enqueued while we were offline.
        self.drain().await?;

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Ok(()),
                _ = self.wake.notified() => {
                    debug!("Drain requested");
                }
                notification = subscription.recv() => {
                    let notification = notification?;
                    debug!(payload = %notification.payload, "Notification received");
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    debug!("Poll interval elapsed");
                }
            }

            self.drain().await?;
        }
    }

    /// Claim and process items until none are eligible.
    ///
    /// Stops early when shutdown is requested; the item in hand is finished
    /// first. Only connection errors are returned; per-item failures are
    /// recorded on the item.
    pub async fn drain(&self) -> Result<usize> {
        let mut processed = 0;

        while !self.shutdown.is_cancelled() {
            let claimed = self
                .store
                .claim_next(
                    &self.config.worker_id,
                    self.config.max_retries,
                    self.config.visibility_timeout,
                )
                .await?;

            let Some(item) = claimed else {
                break;
            };

            match self.process(&item).await {
                Ok(()) => {}
                Err(e) if e.is_connection_error() => return Err(e),
                // Our claim expired and someone else took the item over.
                Err(Error::ClaimLost { .. }) => {
                    warn!(
                        item_id = item.id,
                        subject = %item.subject,
                        "Claim lost before the outcome was recorded; outcome discarded"
                    );
                }
                Err(e) => {
                    error!(item_id = item.id, error = %e, "Failed to record sync outcome");
                }
            }
            processed += 1;
        }

        if processed > 0 {
            debug!(processed, "Drained outbox");
        }
        Ok(processed)
    }

    async fn process(&self, item: &OutboxItem) -> Result<()> {
        debug!(
            item_id = item.id,
            subject = %item.subject,
            attempt = item.attempts,
            "Processing outbox item"
        );

        match self.dispatch(item).await {
            Ok(()) => {
                self.store
                    .mark_succeeded(item.id, &self.config.worker_id)
                    .await?;
                info!(item_id = item.id, subject = %item.subject, "Sync succeeded");
                self.emit(
                    SyncEvent::new(item.subject, SyncEventKind::Succeeded).with_outbox_id(item.id),
                )
                .await;
                Ok(())
            }
            // The claim expires on its own; the item is retried after reconnect.
            Err(e) if e.is_connection_error() => Err(e),
            Err(e) => self.record_failure(item, &e).await,
        }
    }

    async fn record_failure(&self, item: &OutboxItem, failure: &Error) -> Result<()> {
        let message = failure.to_string();
        let retry_after = self.backoff.retry_delay(item.attempts);
        let attempts = self
            .store
            .mark_failed(item.id, &self.config.worker_id, &message, retry_after)
            .await?;

        if attempts < self.config.max_retries {
            warn!(
                item_id = item.id,
                subject = %item.subject,
                attempts,
                max_retries = self.config.max_retries,
                retry_in_secs = retry_after.as_secs(),
                error = %message,
                "Sync failed, will retry"
            );
            return Ok(());
        }

        self.store
            .mark_exhausted(item.id, &self.config.worker_id, &message)
            .await?;
        error!(
            alert = true,
            item_id = item.id,
            subject = %item.subject,
            attempts,
            error = %message,
            "Sync retries exhausted; operator intervention required"
        );
        self.emit(
            SyncEvent::new(item.subject, SyncEventKind::Failed)
                .with_outbox_id(item.id)
                .with_message(message),
        )
        .await;
        Ok(())
    }

    async fn dispatch(&self, item: &OutboxItem) -> Result<()> {
        let snapshot = self
            .store
            .load_snapshot(item.subject, item.attempts)
            .await?
            .ok_or(Error::SubjectNotFound(item.subject))?;

        match snapshot {
            SyncSnapshot::Organization(org) => self.sync_organization(&org).await,
            SyncSnapshot::Cluster(cluster) => self.sync_cluster(&cluster).await,
        }
    }

    async fn sync_organization(&self, org: &OrganizationToSync) -> Result<()> {
        if org.deleted {
            // Projects outlive their organization until an operator removes them.
            debug!(
                organization_id = %org.organization_id,
                "Organization deleted, nothing to apply"
            );
            return Ok(());
        }
        self.ensure_container(&org.project_name(), org.organization_id)
            .await
            .map(|_| ())
    }

    async fn sync_cluster(&self, cluster: &ClusterToSync) -> Result<()> {
        if cluster.deleted {
            self.client
                .delete_resource_by_owner_id(cluster.cluster_id)
                .await?;
            info!(cluster_id = %cluster.cluster_id, "External cluster deletion requested");
            return Ok(());
        }

        let namespace = self
            .ensure_container(&cluster.project_name(), cluster.organization_id)
            .await?;
        let spec = ResourceSpec::for_cluster(cluster, &namespace);
        self.client.apply_resource(&spec).await?;
        self.store.mark_cluster_applied(cluster.cluster_id).await?;

        debug!(
            cluster_id = %cluster.cluster_id,
            namespace = %namespace,
            node_pools = cluster.node_pools.len(),
            "Cluster spec applied"
        );
        Ok(())
    }

    async fn ensure_container(&self, name: &str, organization_id: uuid::Uuid) -> Result<String> {
        let namespace = self.client.ensure_container(name, organization_id).await?;
        if namespace.is_empty() {
            return Err(Error::ContainerNotReady(name.to_string()));
        }
        Ok(namespace)
    }

    async fn emit(&self, event: SyncEvent) {
        if let Err(e) = self.store.record_event(&event).await {
            warn!(
                subject = %event.subject,
                kind = event.kind.as_str(),
                error = %e,
                "Failed to record sync event"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::external::{MockExternalClient, MockOperation, RecordedCall};
    use crate::model::{NodePoolSpec, OutboxStatus, OutboxSubject, SyncOperation};
    use crate::notify::InMemoryNotifications;
    use crate::store::MemorySyncStore;

    struct Fixture {
        store: MemorySyncStore,
        client: MockExternalClient,
        worker: SyncWorker,
    }

    fn fixture(max_retries: i32) -> Fixture {
        let store = MemorySyncStore::new();
        let client = MockExternalClient::new();
        let config = SyncConfig {
            worker_id: "test-worker".to_string(),
            max_retries,
            ..SyncConfig::default()
        };
        let worker = SyncWorker::new(
            Arc::new(store.clone()),
            Arc::new(client.clone()),
            Arc::new(InMemoryNotifications::new("sync_outbox")),
            config,
        );
        Fixture {
            store,
            client,
            worker,
        }
    }

    fn seed_cluster(store: &MemorySyncStore) -> (uuid::Uuid, uuid::Uuid) {
        let org = store.insert_organization("Acme Corp");
        let cluster = store.insert_cluster(org, "payments", "eu-west-1", "1.30");
        (org, cluster)
    }

    #[tokio::test]
    async fn test_drain_applies_cluster() {
        let f = fixture(5);
        let (org, cluster) = seed_cluster(&f.store);
        let id = f
            .store
            .enqueue(OutboxSubject::Cluster(cluster), SyncOperation::Upsert)
            .await
            .unwrap();

        assert_eq!(f.worker.drain().await.unwrap(), 1);

        let item = f.store.get_item(id).await.unwrap().unwrap();
        assert_eq!(item.status, OutboxStatus::Succeeded);

        let calls = f.client.calls().await;
        assert!(matches!(
            &calls[0],
            RecordedCall::EnsureContainer { owner_id, .. } if *owner_id == org
        ));
        assert!(matches!(&calls[1], RecordedCall::ApplyResource(spec) if spec.owner_id == cluster));
        assert_eq!(f.client.resources_for(cluster).await.len(), 1);

        let events = f.store.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, SyncEventKind::Succeeded);
        assert_eq!(events[0].outbox_id, Some(id));

        // applied clusters get status checks
        assert_eq!(f.store.list_status_candidates(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_after_max_retries() {
        let f = fixture(3);
        let (_, cluster) = seed_cluster(&f.store);
        let id = f
            .store
            .enqueue(OutboxSubject::Cluster(cluster), SyncOperation::Upsert)
            .await
            .unwrap();
        for _ in 0..3 {
            f.client.fail_next(MockOperation::Apply, "gateway 503").await;
        }

        f.worker.drain().await.unwrap();
        let item = f.store.get_item(id).await.unwrap().unwrap();
        assert_eq!(item.status, OutboxStatus::Pending);
        assert_eq!(item.attempts, 1);

        // backoff: first retry waits the base delay
        assert_eq!(f.worker.drain().await.unwrap(), 0);
        f.store.advance(Duration::from_secs(31));
        f.worker.drain().await.unwrap();
        assert_eq!(f.store.get_item(id).await.unwrap().unwrap().attempts, 2);

        f.store.advance(Duration::from_secs(61));
        f.worker.drain().await.unwrap();

        let item = f.store.get_item(id).await.unwrap().unwrap();
        assert_eq!(item.status, OutboxStatus::Failed);
        assert_eq!(item.attempts, 3);
        assert!(item.last_error.unwrap().contains("gateway 503"));

        // never claimed again
        f.store.advance(Duration::from_secs(3600));
        assert_eq!(f.worker.drain().await.unwrap(), 0);

        let failed: Vec<_> = f
            .store
            .events()
            .into_iter()
            .filter(|e| e.kind == SyncEventKind::Failed)
            .collect();
        assert_eq!(failed.len(), 1);
    }

    #[tokio::test]
    async fn test_container_not_ready_is_retried() {
        let f = fixture(5);
        let (_, cluster) = seed_cluster(&f.store);
        f.client.set_container_delay(1).await;
        let id = f
            .store
            .enqueue(OutboxSubject::Cluster(cluster), SyncOperation::Upsert)
            .await
            .unwrap();

        f.worker.drain().await.unwrap();
        let item = f.store.get_item(id).await.unwrap().unwrap();
        assert_eq!(item.status, OutboxStatus::Pending);
        assert!(item.last_error.unwrap().contains("not ready"));
        assert!(f.client.resources_for(cluster).await.is_empty());

        f.store.advance(Duration::from_secs(31));
        f.worker.drain().await.unwrap();
        let item = f.store.get_item(id).await.unwrap().unwrap();
        assert_eq!(item.status, OutboxStatus::Succeeded);
        assert_eq!(f.client.resources_for(cluster).await.len(), 1);
    }

    #[tokio::test]
    async fn test_deleted_cluster_is_deleted_externally() {
        let f = fixture(5);
        let (_, cluster) = seed_cluster(&f.store);
        let subject = OutboxSubject::Cluster(cluster);
        f.store.enqueue(subject, SyncOperation::Upsert).await.unwrap();
        f.worker.drain().await.unwrap();
        assert_eq!(f.client.resources_for(cluster).await.len(), 1);

        f.store.soft_delete_cluster(cluster);
        f.store.enqueue(subject, SyncOperation::Delete).await.unwrap();
        f.client.clear_calls().await;
        f.worker.drain().await.unwrap();

        assert_eq!(f.client.calls().await, vec![RecordedCall::DeleteResource(cluster)]);
        assert!(f.client.resources_for(cluster).await.is_empty());
    }

    #[tokio::test]
    async fn test_stale_delete_does_not_remove_live_cluster() {
        let f = fixture(5);
        let (_, cluster) = seed_cluster(&f.store);
        f.store
            .enqueue(OutboxSubject::Cluster(cluster), SyncOperation::Delete)
            .await
            .unwrap();

        f.worker.drain().await.unwrap();

        assert_eq!(f.client.resources_for(cluster).await.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_subject_is_a_failure() {
        let f = fixture(5);
        let ghost = uuid::Uuid::new_v4();
        let id = f
            .store
            .enqueue(OutboxSubject::Cluster(ghost), SyncOperation::Upsert)
            .await
            .unwrap();

        f.worker.drain().await.unwrap();

        let item = f.store.get_item(id).await.unwrap().unwrap();
        assert_eq!(item.status, OutboxStatus::Pending);
        assert!(item.last_error.unwrap().contains("Subject not found"));
        assert!(f.client.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_node_pool_reapplies_cluster() {
        let f = fixture(5);
        let (_, cluster) = seed_cluster(&f.store);
        let pool = f.store.insert_node_pool(
            cluster,
            NodePoolSpec {
                name: "workers".into(),
                machine_type: "m5.large".into(),
                min_nodes: 2,
                max_nodes: 5,
            },
        );
        f.store
            .enqueue(OutboxSubject::NodePool(pool), SyncOperation::Upsert)
            .await
            .unwrap();

        f.worker.drain().await.unwrap();

        let resources = f.client.resources_for(cluster).await;
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].node_pools.len(), 1);
        assert_eq!(resources[0].node_pools[0].max_nodes, 5);
    }

    #[tokio::test]
    async fn test_organization_ensures_container() {
        let f = fixture(5);
        let org = f.store.insert_organization("Acme Corp");
        f.store
            .enqueue(OutboxSubject::Organization(org), SyncOperation::Upsert)
            .await
            .unwrap();

        f.worker.drain().await.unwrap();

        let calls = f.client.calls().await;
        assert_eq!(calls.len(), 1);
        assert!(matches!(
            &calls[0],
            RecordedCall::EnsureContainer { name, owner_id }
                if name.starts_with("acmeco") && *owner_id == org
        ));
    }

    #[tokio::test]
    async fn test_claim_connection_error_ends_drain() {
        let f = fixture(5);
        let (_, cluster) = seed_cluster(&f.store);
        f.store
            .enqueue(OutboxSubject::Cluster(cluster), SyncOperation::Upsert)
            .await
            .unwrap();
        f.store.fail_next_claims(1);

        let err = f.worker.drain().await.unwrap_err();
        assert!(err.is_connection_error());

        assert_eq!(f.worker.drain().await.unwrap(), 1);
    }

    /// Lets another worker take over the claim while the apply is in flight.
    struct SlowApplyClient {
        inner: MockExternalClient,
        store: MemorySyncStore,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl ExternalClient for SlowApplyClient {
        fn client_type(&self) -> &'static str {
            "slow"
        }

        async fn ensure_container(
            &self,
            name: &str,
            owner_id: uuid::Uuid,
        ) -> crate::external::Result<String> {
            self.inner.ensure_container(name, owner_id).await
        }

        async fn apply_resource(&self, spec: &ResourceSpec) -> crate::external::Result<()> {
            self.store.advance(Duration::from_secs(301));
            self.store
                .claim_next("other-worker", 5, Duration::from_secs(300))
                .await
                .unwrap()
                .expect("expired claim should be reclaimable");
            if self.fail {
                return Err(crate::external::ExternalError::Unavailable("gateway 503".into()));
            }
            self.inner.apply_resource(spec).await
        }

        async fn delete_resource_by_owner_id(
            &self,
            owner_id: uuid::Uuid,
        ) -> crate::external::Result<()> {
            self.inner.delete_resource_by_owner_id(owner_id).await
        }

        async fn list_resources(
            &self,
        ) -> crate::external::Result<Vec<crate::external::ExternalResource>> {
            self.inner.list_resources().await
        }

        async fn get_status(
            &self,
            spec: &ResourceSpec,
        ) -> crate::external::Result<crate::external::ResourceStatus> {
            self.inner.get_status(spec).await
        }
    }

    fn slow_worker(store: &MemorySyncStore, fail: bool, max_retries: i32) -> SyncWorker {
        let client = SlowApplyClient {
            inner: MockExternalClient::new(),
            store: store.clone(),
            fail,
        };
        SyncWorker::new(
            Arc::new(store.clone()),
            Arc::new(client),
            Arc::new(InMemoryNotifications::new("sync_outbox")),
            SyncConfig {
                worker_id: "test-worker".to_string(),
                max_retries,
                ..SyncConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn test_success_after_claim_lost_is_discarded() {
        let store = MemorySyncStore::new();
        let (_, cluster) = seed_cluster(&store);
        let id = store
            .enqueue(OutboxSubject::Cluster(cluster), SyncOperation::Upsert)
            .await
            .unwrap();

        assert_eq!(slow_worker(&store, false, 5).drain().await.unwrap(), 1);

        // the new owner still holds a live claim
        let item = store.get_item(id).await.unwrap().unwrap();
        assert_eq!(item.status, OutboxStatus::Claimed);
        assert_eq!(item.claimed_by.as_deref(), Some("other-worker"));
        assert!(
            store
                .claim_next("third-worker", 5, Duration::from_secs(300))
                .await
                .unwrap()
                .is_none()
        );
        assert!(store.events().is_empty());

        store.mark_succeeded(id, "other-worker").await.unwrap();
        let item = store.get_item(id).await.unwrap().unwrap();
        assert_eq!(item.status, OutboxStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_failure_after_claim_lost_does_not_exhaust() {
        let store = MemorySyncStore::new();
        let (_, cluster) = seed_cluster(&store);
        let id = store
            .enqueue(OutboxSubject::Cluster(cluster), SyncOperation::Upsert)
            .await
            .unwrap();

        // the takeover is attempt 2 of 2; a stale writer must not fail it
        slow_worker(&store, true, 2).drain().await.unwrap();

        let item = store.get_item(id).await.unwrap().unwrap();
        assert_eq!(item.status, OutboxStatus::Claimed);
        assert_eq!(item.claimed_by.as_deref(), Some("other-worker"));
        assert_eq!(item.attempts, 2);
        assert!(item.last_error.is_none());
        assert!(store.events().is_empty());

        store.mark_succeeded(id, "other-worker").await.unwrap();
        let item = store.get_item(id).await.unwrap().unwrap();
        assert_eq!(item.status, OutboxStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_drain_stops_after_shutdown() {
        let f = fixture(5);
        let (_, cluster) = seed_cluster(&f.store);
        f.store
            .enqueue(OutboxSubject::Cluster(cluster), SyncOperation::Upsert)
            .await
            .unwrap();
        let token = CancellationToken::new();
        let worker = f.worker.with_shutdown(token.clone());

        token.cancel();
        assert_eq!(worker.drain().await.unwrap(), 0);
    }
}
