// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock external client for testing.
//!
//! Keeps resources in memory, records every call in order, and lets tests
//! script failures, slow containers and status sequences.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::traits::*;

/// A call made against the mock, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedCall {
    /// `ensure_container(name, owner_id)`
    EnsureContainer {
        /// Container name.
        name: String,
        /// Organization UUID.
        owner_id: Uuid,
    },
    /// `apply_resource(spec)`
    ApplyResource(ResourceSpec),
    /// `delete_resource_by_owner_id(owner_id)`
    DeleteResource(Uuid),
    /// `list_resources()`
    ListResources,
    /// `get_status(spec)`
    GetStatus(Uuid),
}

/// Operations that can be scripted to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOperation {
    /// `ensure_container`
    EnsureContainer,
    /// `apply_resource`
    Apply,
    /// `delete_resource_by_owner_id`
    Delete,
    /// `list_resources`
    List,
    /// `get_status`
    Status,
}

#[derive(Debug, Clone)]
struct MockContainer {
    namespace: String,
    pending_polls: u32,
}

#[derive(Debug, Default)]
struct MockState {
    containers: HashMap<String, MockContainer>,
    resources: Vec<ExternalResource>,
    calls: Vec<RecordedCall>,
    failures: HashMap<MockOperation, VecDeque<String>>,
    statuses: HashMap<Uuid, VecDeque<ResourceStatus>>,
    container_delay: u32,
}

impl MockState {
    fn take_failure(&mut self, op: MockOperation) -> Result<()> {
        match self.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(message) => Err(ExternalError::Unavailable(message)),
            None => Ok(()),
        }
    }
}

/// In-memory external client.
#[derive(Clone, Default)]
pub struct MockExternalClient {
    state: Arc<Mutex<MockState>>,
}

impl MockExternalClient {
    /// Create an empty mock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Newly created containers report "not ready" for the first `polls`
    /// `ensure_container` calls.
    pub async fn set_container_delay(&self, polls: u32) {
        self.state.lock().await.container_delay = polls;
    }

    /// Make the next call to `op` fail with `message`. Stacks.
    pub async fn fail_next(&self, op: MockOperation, message: &str) {
        self.state
            .lock()
            .await
            .failures
            .entry(op)
            .or_default()
            .push_back(message.to_string());
    }

    /// Script the statuses returned for `owner_id`, in order. The last one
    /// repeats once the sequence runs out.
    pub async fn script_status(&self, owner_id: Uuid, statuses: Vec<ResourceStatus>) {
        self.state
            .lock()
            .await
            .statuses
            .insert(owner_id, statuses.into());
    }

    /// Insert a resource directly, bypassing call recording.
    pub async fn seed_resource(&self, resource: ExternalResource) {
        self.state.lock().await.resources.push(resource);
    }

    /// Remove every resource carrying `owner_id`, bypassing call recording.
    pub async fn drop_resource(&self, owner_id: Uuid) {
        self.state
            .lock()
            .await
            .resources
            .retain(|r| r.owner_id() != Some(owner_id));
    }

    /// Snapshot of all stored resources.
    pub async fn resources(&self) -> Vec<ExternalResource> {
        self.state.lock().await.resources.clone()
    }

    /// Resources carrying `owner_id`.
    pub async fn resources_for(&self, owner_id: Uuid) -> Vec<ExternalResource> {
        self.state
            .lock()
            .await
            .resources
            .iter()
            .filter(|r| r.owner_id() == Some(owner_id))
            .cloned()
            .collect()
    }

    /// Calls recorded so far.
    pub async fn calls(&self) -> Vec<RecordedCall> {
        self.state.lock().await.calls.clone()
    }

    /// Forget recorded calls.
    pub async fn clear_calls(&self) {
        self.state.lock().await.calls.clear();
    }
}

#[async_trait]
impl ExternalClient for MockExternalClient {
    fn client_type(&self) -> &'static str {
        "mock"
    }

    async fn ensure_container(&self, name: &str, owner_id: Uuid) -> Result<String> {
        let mut state = self.state.lock().await;
        state.calls.push(RecordedCall::EnsureContainer {
            name: name.to_string(),
            owner_id,
        });
        state.take_failure(MockOperation::EnsureContainer)?;

        let delay = state.container_delay;
        let container = state
            .containers
            .entry(name.to_string())
            .or_insert_with(|| MockContainer {
                namespace: format!("garden-{}", name),
                pending_polls: delay,
            });

        if container.pending_polls > 0 {
            container.pending_polls -= 1;
            return Ok(String::new());
        }
        Ok(container.namespace.clone())
    }

    async fn apply_resource(&self, spec: &ResourceSpec) -> Result<()> {
        let mut state = self.state.lock().await;
        state.calls.push(RecordedCall::ApplyResource(spec.clone()));
        state.take_failure(MockOperation::Apply)?;

        let existing = state
            .resources
            .iter_mut()
            .find(|r| r.owner_id() == Some(spec.owner_id));

        match existing {
            Some(resource) => {
                resource.namespace = spec.namespace.clone();
                resource.labels = spec.labels.clone();
                resource.region = spec.region.clone();
                resource.kubernetes_version = spec.kubernetes_version.clone();
                resource.node_pools = spec.node_pools.clone();
            }
            None => state.resources.push(ExternalResource {
                name: spec.name.clone(),
                namespace: spec.namespace.clone(),
                labels: spec.labels.clone(),
                region: spec.region.clone(),
                kubernetes_version: spec.kubernetes_version.clone(),
                node_pools: spec.node_pools.clone(),
            }),
        }
        Ok(())
    }

    async fn delete_resource_by_owner_id(&self, owner_id: Uuid) -> Result<()> {
        let mut state = self.state.lock().await;
        state.calls.push(RecordedCall::DeleteResource(owner_id));
        state.take_failure(MockOperation::Delete)?;

        state.resources.retain(|r| r.owner_id() != Some(owner_id));
        Ok(())
    }

    async fn list_resources(&self) -> Result<Vec<ExternalResource>> {
        let mut state = self.state.lock().await;
        state.calls.push(RecordedCall::ListResources);
        state.take_failure(MockOperation::List)?;

        Ok(state
            .resources
            .iter()
            .filter(|r| r.is_managed())
            .cloned()
            .collect())
    }

    async fn get_status(&self, spec: &ResourceSpec) -> Result<ResourceStatus> {
        let mut state = self.state.lock().await;
        state.calls.push(RecordedCall::GetStatus(spec.owner_id));
        state.take_failure(MockOperation::Status)?;

        if let Some(queue) = state.statuses.get_mut(&spec.owner_id) {
            let next = if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            };
            if let Some(status) = next {
                return Ok(status);
            }
        }

        let exists = state
            .resources
            .iter()
            .any(|r| r.owner_id() == Some(spec.owner_id));
        if exists {
            Ok(ResourceStatus::new(ResourceState::Ready, "reconciled"))
        } else {
            Ok(ResourceStatus::not_found())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ClusterToSync;

    fn spec(owner: Uuid, version: &str) -> ResourceSpec {
        let cluster = ClusterToSync {
            cluster_id: owner,
            cluster_name: "edge".to_string(),
            organization_id: Uuid::nil(),
            organization_name: "Acme".to_string(),
            region: "eu-west-1".to_string(),
            kubernetes_version: version.to_string(),
            node_pools: vec![],
            deleted: false,
            attempt: 1,
        };
        ResourceSpec::for_cluster(&cluster, "garden-acme")
    }

    #[tokio::test]
    async fn test_apply_twice_keeps_one_resource_with_latest_spec() {
        let client = MockExternalClient::new();
        let owner = Uuid::new_v4();

        client.apply_resource(&spec(owner, "1.29")).await.unwrap();
        let first_name = client.resources_for(owner).await[0].name.clone();
        client.apply_resource(&spec(owner, "1.30")).await.unwrap();

        let resources = client.resources_for(owner).await;
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].kubernetes_version, "1.30");
        assert_eq!(resources[0].name, first_name);
    }

    #[tokio::test]
    async fn test_delete_absent_is_ok() {
        let client = MockExternalClient::new();
        client
            .delete_resource_by_owner_id(Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(client.calls().await.len(), 1);
    }

    #[tokio::test]
    async fn test_container_delay() {
        let client = MockExternalClient::new();
        client.set_container_delay(2).await;
        let org = Uuid::new_v4();

        assert_eq!(client.ensure_container("acme", org).await.unwrap(), "");
        assert_eq!(client.ensure_container("acme", org).await.unwrap(), "");
        assert_eq!(
            client.ensure_container("acme", org).await.unwrap(),
            "garden-acme"
        );
    }

    #[tokio::test]
    async fn test_fail_next_applies_once() {
        let client = MockExternalClient::new();
        client.fail_next(MockOperation::List, "gateway down").await;

        assert!(client.list_resources().await.is_err());
        assert!(client.list_resources().await.is_ok());
    }

    #[tokio::test]
    async fn test_list_filters_unmanaged() {
        let client = MockExternalClient::new();
        client.apply_resource(&spec(Uuid::new_v4(), "1.30")).await.unwrap();
        client
            .seed_resource(ExternalResource {
                name: "foreign".into(),
                namespace: "garden-other".into(),
                labels: Default::default(),
                region: String::new(),
                kubernetes_version: String::new(),
                node_pools: vec![],
            })
            .await;

        assert_eq!(client.resources().await.len(), 2);
        assert_eq!(client.list_resources().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_status_script_then_default() {
        let client = MockExternalClient::new();
        let owner = Uuid::new_v4();
        let s = spec(owner, "1.30");

        assert!(client.get_status(&s).await.unwrap().is_not_found());

        client
            .script_status(
                owner,
                vec![
                    ResourceStatus::new(ResourceState::Progressing, "creating"),
                    ResourceStatus::new(ResourceState::Ready, "done"),
                ],
            )
            .await;
        assert_eq!(
            client.get_status(&s).await.unwrap().state,
            ResourceState::Progressing
        );
        assert_eq!(client.get_status(&s).await.unwrap().state, ResourceState::Ready);
        assert_eq!(client.get_status(&s).await.unwrap().state, ResourceState::Ready);
    }
}
