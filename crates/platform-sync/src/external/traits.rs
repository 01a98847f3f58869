// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! External client trait definitions.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::model::{ClusterToSync, NodePoolSpec};
use crate::naming;

/// Label marking resources owned by this platform.
pub const MANAGED_BY_LABEL: &str = "platform.sync/managed-by";

/// Value of [`MANAGED_BY_LABEL`] on resources this engine created.
pub const MANAGED_BY_VALUE: &str = "platform-sync";

/// Label carrying the owning cluster's UUID. The only durable join key.
pub const OWNER_ID_LABEL: &str = "platform.sync/cluster-id";

/// Label carrying the owning organization's UUID.
pub const ORGANIZATION_ID_LABEL: &str = "platform.sync/organization-id";

/// Status message that, together with [`ResourceState::Pending`], means the
/// resource does not exist.
pub const NOT_FOUND_MESSAGE: &str = "not found";

/// Errors from external control plane operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExternalError {
    /// The request could not be sent or the response not read.
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The control plane answered with an unexpected status code.
    #[error("Unexpected status {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, for diagnostics.
        body: String,
    },

    /// The response body could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),

    /// The control plane refused the request as invalid.
    #[error("Rejected: {0}")]
    Rejected(String),

    /// The control plane is temporarily unavailable.
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// Other error.
    #[error("Other: {0}")]
    Other(String),
}

/// Result type for external operations.
pub type Result<T> = std::result::Result<T, ExternalError>;

/// Desired state of one external cluster resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// Name to use if the resource has to be created.
    pub name: String,
    /// Container namespace the resource lives in.
    pub namespace: String,
    /// Owning cluster UUID.
    pub owner_id: Uuid,
    /// Owning organization UUID.
    pub organization_id: Uuid,
    /// Target region.
    pub region: String,
    /// Target Kubernetes version.
    pub kubernetes_version: String,
    /// Worker pools.
    pub node_pools: Vec<NodePoolSpec>,
    /// Labels, including the ownership labels.
    pub labels: BTreeMap<String, String>,
}

impl ResourceSpec {
    /// Build the resource spec for a cluster snapshot.
    ///
    /// The name is freshly generated; the control plane keeps the name of an
    /// existing resource with the same owner label.
    pub fn for_cluster(cluster: &ClusterToSync, namespace: &str) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());
        labels.insert(OWNER_ID_LABEL.to_string(), cluster.cluster_id.to_string());
        labels.insert(
            ORGANIZATION_ID_LABEL.to_string(),
            cluster.organization_id.to_string(),
        );

        Self {
            name: naming::cluster_name(&cluster.cluster_name),
            namespace: namespace.to_string(),
            owner_id: cluster.cluster_id,
            organization_id: cluster.organization_id,
            region: cluster.region.clone(),
            kubernetes_version: cluster.kubernetes_version.clone(),
            node_pools: cluster.node_pools.clone(),
            labels,
        }
    }
}

/// A resource as reported by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalResource {
    /// Resource name.
    pub name: String,
    /// Container namespace.
    pub namespace: String,
    /// Resource labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Region.
    #[serde(default)]
    pub region: String,
    /// Kubernetes version.
    #[serde(default)]
    pub kubernetes_version: String,
    /// Worker pools.
    #[serde(default)]
    pub node_pools: Vec<NodePoolSpec>,
}

impl ExternalResource {
    /// Owning cluster UUID from the owner label, if present and well formed.
    pub fn owner_id(&self) -> Option<Uuid> {
        self.labels
            .get(OWNER_ID_LABEL)
            .and_then(|v| Uuid::parse_str(v).ok())
    }

    /// Whether this engine manages the resource.
    pub fn is_managed(&self) -> bool {
        self.labels.get(MANAGED_BY_LABEL).map(String::as_str) == Some(MANAGED_BY_VALUE)
    }
}

/// Reconciliation state reported by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    /// Accepted, not yet being worked on.
    Pending,
    /// Being reconciled.
    Progressing,
    /// Reconciled and healthy.
    Ready,
    /// Reconciliation failed.
    Error,
    /// Being torn down.
    Deleting,
    /// Torn down.
    Deleted,
}

impl ResourceState {
    /// State as stored in the `clusters.status` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Progressing => "progressing",
            Self::Ready => "ready",
            Self::Error => "error",
            Self::Deleting => "deleting",
            Self::Deleted => "deleted",
        }
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "progressing" => Ok(Self::Progressing),
            "ready" => Ok(Self::Ready),
            "error" => Ok(Self::Error),
            "deleting" => Ok(Self::Deleting),
            "deleted" => Ok(Self::Deleted),
            other => Err(format!("unknown resource state: {}", other)),
        }
    }
}

/// Status of one external resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceStatus {
    /// Current state.
    pub state: ResourceState,
    /// Human-readable detail.
    #[serde(default)]
    pub message: String,
}

impl ResourceStatus {
    /// Status with an arbitrary message.
    pub fn new(state: ResourceState, message: impl Into<String>) -> Self {
        Self {
            state,
            message: message.into(),
        }
    }

    /// The "resource does not exist" sentinel.
    pub fn not_found() -> Self {
        Self::new(ResourceState::Pending, NOT_FOUND_MESSAGE)
    }

    /// Whether this is the "resource does not exist" sentinel.
    pub fn is_not_found(&self) -> bool {
        self.state == ResourceState::Pending && self.message == NOT_FOUND_MESSAGE
    }
}

/// Contract the sync engine needs from the external control plane.
///
/// Implementations must be safe for concurrent use: the worker, the status
/// poller and the reconciler share one client.
#[async_trait]
pub trait ExternalClient: Send + Sync {
    /// Client type identifier, for logs.
    fn client_type(&self) -> &'static str;

    /// Ensure the container for an organization exists.
    ///
    /// Returns the namespace, or an empty string if the container was
    /// accepted but is not ready yet.
    async fn ensure_container(&self, name: &str, owner_id: Uuid) -> Result<String>;

    /// Create or update the resource carrying `spec.owner_id`.
    ///
    /// Applying the same spec twice must leave exactly one resource.
    async fn apply_resource(&self, spec: &ResourceSpec) -> Result<()>;

    /// Delete the resource carrying `owner_id`. Absent resources are fine.
    async fn delete_resource_by_owner_id(&self, owner_id: Uuid) -> Result<()>;

    /// List every resource carrying the platform ownership label.
    async fn list_resources(&self) -> Result<Vec<ExternalResource>>;

    /// Current status of the resource for `spec.owner_id`.
    async fn get_status(&self, spec: &ResourceSpec) -> Result<ResourceStatus>;
}
