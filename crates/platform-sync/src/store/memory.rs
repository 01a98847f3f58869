// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory sync store.
//!
//! Mirrors the PostgreSQL claim semantics under a single mutex so engine
//! behaviour can be exercised without a database. The clock can be moved
//! forward with [`MemorySyncStore::advance`] to expire claims and backoff.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{ABANDONED_MESSAGE, ResyncOutcome, SyncStore};
use crate::error::{Error, Result};
use crate::external::{ResourceState, ResourceStatus};
use crate::model::{
    ClusterToSync, NodePoolSpec, OrganizationToSync, OutboxItem, OutboxStatus, OutboxSubject,
    StatusCandidate, SyncEvent, SyncOperation, SyncSnapshot,
};

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

fn claim_lost(id: i64, worker_id: &str) -> Error {
    Error::ClaimLost {
        id,
        worker_id: worker_id.to_string(),
    }
}

#[derive(Debug, Clone)]
struct OrganizationRecord {
    name: String,
    deleted: bool,
}

#[derive(Debug, Clone)]
struct ClusterRecord {
    organization_id: Uuid,
    name: String,
    region: String,
    kubernetes_version: String,
    deleted: bool,
    status: Option<ResourceStatus>,
    status_checked_at: Option<DateTime<Utc>>,
    status_check_pending: bool,
    deletion_confirmed: bool,
}

#[derive(Debug, Clone)]
struct NodePoolRecord {
    cluster_id: Uuid,
    spec: NodePoolSpec,
    deleted: bool,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    outbox: BTreeMap<i64, OutboxItem>,
    organizations: HashMap<Uuid, OrganizationRecord>,
    clusters: HashMap<Uuid, ClusterRecord>,
    node_pools: HashMap<Uuid, NodePoolRecord>,
    events: Vec<SyncEvent>,
    offset: Duration,
    failing_claims: u32,
}

impl MemoryState {
    fn now(&self) -> DateTime<Utc> {
        Utc::now() + to_chrono(self.offset)
    }

    fn insert_item(&mut self, subject: OutboxSubject, operation: SyncOperation) -> i64 {
        self.next_id += 1;
        let id = self.next_id;
        let now = self.now();
        self.outbox.insert(
            id,
            OutboxItem {
                id,
                subject,
                operation,
                status: OutboxStatus::Pending,
                attempts: 0,
                claimed_by: None,
                claim_expiry: None,
                available_at: now,
                last_error: None,
                created_at: now,
            },
        );
        id
    }

    fn item_mut(&mut self, id: i64) -> Result<&mut OutboxItem> {
        self.outbox.get_mut(&id).ok_or(Error::OutboxItemNotFound(id))
    }

    fn cluster_snapshot(&self, cluster_id: Uuid, attempt: i32) -> Option<ClusterToSync> {
        let cluster = self.clusters.get(&cluster_id)?;
        let organization = self.organizations.get(&cluster.organization_id)?;

        let mut node_pools: Vec<NodePoolSpec> = self
            .node_pools
            .values()
            .filter(|p| p.cluster_id == cluster_id && !p.deleted)
            .map(|p| p.spec.clone())
            .collect();
        node_pools.sort_by(|a, b| a.name.cmp(&b.name));

        Some(ClusterToSync {
            cluster_id,
            cluster_name: cluster.name.clone(),
            organization_id: cluster.organization_id,
            organization_name: organization.name.clone(),
            region: cluster.region.clone(),
            kubernetes_version: cluster.kubernetes_version.clone(),
            node_pools,
            deleted: cluster.deleted,
            attempt,
        })
    }

    fn candidates<F>(&self, filter: F, limit: i64) -> Vec<StatusCandidate>
    where
        F: Fn(&ClusterRecord) -> bool,
    {
        let mut matching: Vec<(&Uuid, &ClusterRecord)> =
            self.clusters.iter().filter(|(_, c)| filter(c)).collect();
        // NULLS FIRST, then oldest check.
        matching.sort_by_key(|(id, c)| (c.status_checked_at.is_some(), c.status_checked_at, **id));

        matching
            .into_iter()
            .take(limit.max(0) as usize)
            .filter_map(|(id, c)| {
                Some(StatusCandidate {
                    snapshot: self.cluster_snapshot(*id, 0)?,
                    recorded: c.status.as_ref().map(|s| s.state),
                })
            })
            .collect()
    }
}

/// In-memory store for tests and local runs.
#[derive(Clone, Default)]
pub struct MemorySyncStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemorySyncStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        // A panic while holding the lock leaves plain data behind; keep going.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Move the store's clock forward.
    pub fn advance(&self, by: Duration) {
        let mut state = self.lock();
        state.offset += by;
    }

    /// Make the next `n` claims fail as if the connection dropped.
    pub fn fail_next_claims(&self, n: u32) {
        self.lock().failing_claims = n;
    }

    /// Insert an organization.
    pub fn insert_organization(&self, name: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.lock().organizations.insert(
            id,
            OrganizationRecord {
                name: name.to_string(),
                deleted: false,
            },
        );
        id
    }

    /// Soft-delete an organization.
    pub fn soft_delete_organization(&self, id: Uuid) {
        if let Some(org) = self.lock().organizations.get_mut(&id) {
            org.deleted = true;
        }
    }

    /// Insert a cluster.
    pub fn insert_cluster(
        &self,
        organization_id: Uuid,
        name: &str,
        region: &str,
        kubernetes_version: &str,
    ) -> Uuid {
        let id = Uuid::new_v4();
        self.lock().clusters.insert(
            id,
            ClusterRecord {
                organization_id,
                name: name.to_string(),
                region: region.to_string(),
                kubernetes_version: kubernetes_version.to_string(),
                deleted: false,
                status: None,
                status_checked_at: None,
                status_check_pending: false,
                deletion_confirmed: false,
            },
        );
        id
    }

    /// Change a cluster's Kubernetes version.
    pub fn set_cluster_version(&self, id: Uuid, kubernetes_version: &str) {
        if let Some(cluster) = self.lock().clusters.get_mut(&id) {
            cluster.kubernetes_version = kubernetes_version.to_string();
        }
    }

    /// Soft-delete a cluster.
    pub fn soft_delete_cluster(&self, id: Uuid) {
        if let Some(cluster) = self.lock().clusters.get_mut(&id) {
            cluster.deleted = true;
        }
    }

    /// Insert a node pool.
    pub fn insert_node_pool(&self, cluster_id: Uuid, spec: NodePoolSpec) -> Uuid {
        let id = Uuid::new_v4();
        self.lock().node_pools.insert(
            id,
            NodePoolRecord {
                cluster_id,
                spec,
                deleted: false,
            },
        );
        id
    }

    /// Soft-delete a node pool.
    pub fn soft_delete_node_pool(&self, id: Uuid) {
        if let Some(pool) = self.lock().node_pools.get_mut(&id) {
            pool.deleted = true;
        }
    }

    /// All outbox items, oldest first.
    pub fn items(&self) -> Vec<OutboxItem> {
        self.lock().outbox.values().cloned().collect()
    }

    /// Outbox items for one subject, oldest first.
    pub fn items_for(&self, subject: OutboxSubject) -> Vec<OutboxItem> {
        self.lock()
            .outbox
            .values()
            .filter(|item| item.subject == subject)
            .cloned()
            .collect()
    }

    /// Recorded audit events.
    pub fn events(&self) -> Vec<SyncEvent> {
        self.lock().events.clone()
    }

    /// Last recorded external status of a cluster.
    pub fn cluster_status(&self, id: Uuid) -> Option<ResourceStatus> {
        self.lock().clusters.get(&id).and_then(|c| c.status.clone())
    }

    /// Whether a deleted cluster has been confirmed gone.
    pub fn is_deletion_confirmed(&self, id: Uuid) -> bool {
        self.lock()
            .clusters
            .get(&id)
            .is_some_and(|c| c.deletion_confirmed)
    }
}

#[async_trait]
impl SyncStore for MemorySyncStore {
    async fn enqueue(&self, subject: OutboxSubject, operation: SyncOperation) -> Result<i64> {
        Ok(self.lock().insert_item(subject, operation))
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        max_attempts: i32,
        visibility: Duration,
    ) -> Result<Option<OutboxItem>> {
        let mut state = self.lock();
        if state.failing_claims > 0 {
            state.failing_claims -= 1;
            return Err(Error::Database(sqlx::Error::PoolTimedOut));
        }

        let now = state.now();
        let next = state
            .outbox
            .values()
            .filter(|item| item.attempts < max_attempts)
            .filter(|item| match item.status {
                OutboxStatus::Pending => item.available_at <= now,
                OutboxStatus::Claimed => item.claim_expiry.is_some_and(|expiry| expiry < now),
                _ => false,
            })
            .min_by_key(|item| {
                (
                    item.operation == SyncOperation::Delete,
                    item.created_at,
                    item.id,
                )
            })
            .map(|item| item.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let expiry = now + to_chrono(visibility);
        let item = state.item_mut(id)?;
        item.status = OutboxStatus::Claimed;
        item.claimed_by = Some(worker_id.to_string());
        item.claim_expiry = Some(expiry);
        item.attempts += 1;
        Ok(Some(item.clone()))
    }

    async fn mark_succeeded(&self, id: i64, worker_id: &str) -> Result<()> {
        let mut state = self.lock();
        let item = state.item_mut(id)?;
        match item.status {
            OutboxStatus::Claimed if item.claimed_by.as_deref() == Some(worker_id) => {
                item.status = OutboxStatus::Succeeded;
                item.claimed_by = None;
                item.claim_expiry = None;
                item.last_error = None;
                Ok(())
            }
            OutboxStatus::Succeeded => Ok(()),
            _ => Err(claim_lost(id, worker_id)),
        }
    }

    async fn mark_failed(
        &self,
        id: i64,
        worker_id: &str,
        error: &str,
        retry_after: Duration,
    ) -> Result<i32> {
        let mut state = self.lock();
        let available_at = state.now() + to_chrono(retry_after);
        let item = state.item_mut(id)?;
        if item.status != OutboxStatus::Claimed || item.claimed_by.as_deref() != Some(worker_id) {
            return Err(claim_lost(id, worker_id));
        }
        item.status = OutboxStatus::Pending;
        item.claimed_by = None;
        item.claim_expiry = None;
        item.last_error = Some(error.to_string());
        item.available_at = available_at;
        Ok(item.attempts)
    }

    async fn mark_exhausted(&self, id: i64, worker_id: &str, error: &str) -> Result<()> {
        let mut state = self.lock();
        let item = state.item_mut(id)?;
        let owned = match item.status {
            OutboxStatus::Claimed => item.claimed_by.as_deref() == Some(worker_id),
            OutboxStatus::Pending => item.claimed_by.is_none(),
            OutboxStatus::Failed => return Ok(()),
            OutboxStatus::Succeeded => false,
        };
        if !owned {
            return Err(claim_lost(id, worker_id));
        }
        item.status = OutboxStatus::Failed;
        item.claimed_by = None;
        item.claim_expiry = None;
        item.last_error = Some(error.to_string());
        Ok(())
    }

    async fn reset_for_resync(&self, subject: OutboxSubject) -> Result<ResyncOutcome> {
        let mut state = self.lock();
        let now = state.now();

        let active = state.outbox.values_mut().rev().find(|item| {
            item.subject == subject
                && matches!(item.status, OutboxStatus::Pending | OutboxStatus::Claimed)
        });

        match active {
            Some(item)
                if item.status == OutboxStatus::Claimed
                    && item.claim_expiry.is_some_and(|expiry| expiry < now) =>
            {
                item.status = OutboxStatus::Pending;
                item.claimed_by = None;
                item.claim_expiry = None;
                item.available_at = now;
                Ok(ResyncOutcome::Released)
            }
            Some(_) => Ok(ResyncOutcome::AlreadyQueued),
            None => {
                let latest = state
                    .outbox
                    .values()
                    .rev()
                    .find(|item| item.subject == subject);
                if let Some(item) = latest.filter(|i| i.status == OutboxStatus::Failed) {
                    return Ok(ResyncOutcome::Exhausted(item.id));
                }
                state.insert_item(subject, SyncOperation::Upsert);
                Ok(ResyncOutcome::Enqueued)
            }
        }
    }

    async fn sweep_abandoned(&self, max_attempts: i32) -> Result<Vec<OutboxItem>> {
        let mut state = self.lock();
        let now = state.now();

        let mut swept = Vec::new();
        for item in state.outbox.values_mut() {
            let abandoned = item.attempts >= max_attempts
                && match item.status {
                    OutboxStatus::Pending => true,
                    OutboxStatus::Claimed => item.claim_expiry.is_some_and(|e| e < now),
                    _ => false,
                };
            if abandoned {
                item.status = OutboxStatus::Failed;
                item.claimed_by = None;
                item.claim_expiry = None;
                item.last_error
                    .get_or_insert_with(|| ABANDONED_MESSAGE.to_string());
                swept.push(item.clone());
            }
        }
        Ok(swept)
    }

    async fn get_item(&self, id: i64) -> Result<Option<OutboxItem>> {
        Ok(self.lock().outbox.get(&id).cloned())
    }

    async fn load_snapshot(
        &self,
        subject: OutboxSubject,
        attempt: i32,
    ) -> Result<Option<SyncSnapshot>> {
        let state = self.lock();
        let snapshot = match subject {
            OutboxSubject::Organization(id) => state.organizations.get(&id).map(|org| {
                SyncSnapshot::Organization(OrganizationToSync {
                    organization_id: id,
                    name: org.name.clone(),
                    deleted: org.deleted,
                    attempt,
                })
            }),
            OutboxSubject::Cluster(id) => state
                .cluster_snapshot(id, attempt)
                .map(SyncSnapshot::Cluster),
            OutboxSubject::NodePool(id) => state
                .node_pools
                .get(&id)
                .and_then(|pool| state.cluster_snapshot(pool.cluster_id, attempt))
                .map(SyncSnapshot::Cluster),
        };
        Ok(snapshot)
    }

    async fn list_active_clusters(&self) -> Result<Vec<ClusterToSync>> {
        let state = self.lock();
        let mut ids: Vec<Uuid> = state
            .clusters
            .iter()
            .filter(|(_, c)| !c.deleted)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        Ok(ids
            .into_iter()
            .filter_map(|id| state.cluster_snapshot(id, 0))
            .collect())
    }

    async fn list_status_candidates(&self, limit: i64) -> Result<Vec<StatusCandidate>> {
        Ok(self
            .lock()
            .candidates(|c| !c.deleted && c.status_check_pending, limit))
    }

    async fn list_deletion_candidates(&self, limit: i64) -> Result<Vec<StatusCandidate>> {
        Ok(self
            .lock()
            .candidates(|c| c.deleted && !c.deletion_confirmed, limit))
    }

    async fn record_cluster_status(
        &self,
        cluster_id: Uuid,
        status: &ResourceStatus,
    ) -> Result<()> {
        let mut state = self.lock();
        let now = state.now();
        if let Some(cluster) = state.clusters.get_mut(&cluster_id) {
            cluster.status = Some(status.clone());
            cluster.status_checked_at = Some(now);
            cluster.status_check_pending = status.state != ResourceState::Ready;
        }
        Ok(())
    }

    async fn mark_cluster_applied(&self, cluster_id: Uuid) -> Result<()> {
        if let Some(cluster) = self.lock().clusters.get_mut(&cluster_id) {
            cluster.status_check_pending = true;
        }
        Ok(())
    }

    async fn confirm_cluster_deleted(&self, cluster_id: Uuid) -> Result<()> {
        let mut state = self.lock();
        let now = state.now();
        if let Some(cluster) = state.clusters.get_mut(&cluster_id) {
            cluster.deletion_confirmed = true;
            cluster.status = Some(ResourceStatus::new(ResourceState::Deleted, ""));
            cluster.status_checked_at = Some(now);
            cluster.status_check_pending = false;
        }
        Ok(())
    }

    async fn record_event(&self, event: &SyncEvent) -> Result<()> {
        self.lock().events.push(event.clone());
        Ok(())
    }
}
