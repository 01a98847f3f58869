// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Core value types shared by the store, the worker and the loops.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::external::ResourceState;
use crate::naming;

/// The single entity an outbox item refers to.
///
/// Stored as a `(subject_kind, subject_id)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum OutboxSubject {
    /// An organization; synced as an external container.
    Organization(Uuid),
    /// A cluster; synced as an external resource.
    Cluster(Uuid),
    /// A node pool; synced by re-applying its owning cluster.
    NodePool(Uuid),
}

impl OutboxSubject {
    /// Discriminant as stored in `subject_kind`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Organization(_) => "organization",
            Self::Cluster(_) => "cluster",
            Self::NodePool(_) => "node_pool",
        }
    }

    /// Entity UUID.
    pub fn id(&self) -> Uuid {
        match self {
            Self::Organization(id) | Self::Cluster(id) | Self::NodePool(id) => *id,
        }
    }

    /// Rebuild a subject from its stored parts.
    pub fn from_parts(kind: &str, id: Uuid) -> Option<Self> {
        match kind {
            "organization" => Some(Self::Organization(id)),
            "cluster" => Some(Self::Cluster(id)),
            "node_pool" => Some(Self::NodePool(id)),
            _ => None,
        }
    }
}

impl fmt::Display for OutboxSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind(), self.id())
    }
}

/// Outbox item lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    /// Waiting to be claimed.
    Pending,
    /// Held by a worker until its claim expires.
    Claimed,
    /// Terminal: applied successfully.
    Succeeded,
    /// Terminal: retry budget exhausted.
    Failed,
}

impl OutboxStatus {
    /// Status as stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    /// Whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl FromStr for OutboxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "claimed" => Ok(Self::Claimed),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown outbox status: {}", other)),
        }
    }
}

/// Kind of change that enqueued an item.
///
/// Only used for claim priority. Dispatch looks at the snapshot's deletion
/// marker, so a stale operation never deletes a live entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOperation {
    /// Create or update.
    Upsert,
    /// Soft delete.
    Delete,
}

impl SyncOperation {
    /// Operation as stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upsert => "upsert",
            Self::Delete => "delete",
        }
    }
}

impl FromStr for SyncOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upsert" => Ok(Self::Upsert),
            "delete" => Ok(Self::Delete),
            other => Err(format!("unknown sync operation: {}", other)),
        }
    }
}

/// A unit of pending synchronization work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxItem {
    /// Row identifier.
    pub id: i64,
    /// Owning entity.
    pub subject: OutboxSubject,
    /// Change kind that enqueued the row.
    pub operation: SyncOperation,
    /// Lifecycle status.
    pub status: OutboxStatus,
    /// Number of times the item has been claimed.
    pub attempts: i32,
    /// Worker currently holding the claim.
    pub claimed_by: Option<String>,
    /// When the current claim stops being honored.
    pub claim_expiry: Option<DateTime<Utc>>,
    /// Earliest time a pending item may be claimed.
    pub available_at: DateTime<Utc>,
    /// Last failure message.
    pub last_error: Option<String>,
    /// When the row was enqueued.
    pub created_at: DateTime<Utc>,
}

/// Desired node pool shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePoolSpec {
    /// Pool name, unique within its cluster.
    pub name: String,
    /// Machine type for the pool's nodes.
    pub machine_type: String,
    /// Autoscaler lower bound.
    pub min_nodes: i32,
    /// Autoscaler upper bound.
    pub max_nodes: i32,
}

/// Immutable snapshot of a cluster and its owning organization.
///
/// Built once per claim; every external call for that attempt reads from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterToSync {
    /// Cluster UUID, carried as the external owner label.
    pub cluster_id: Uuid,
    /// Human-facing cluster name.
    pub cluster_name: String,
    /// Owning organization UUID.
    pub organization_id: Uuid,
    /// Owning organization name.
    pub organization_name: String,
    /// Target region.
    pub region: String,
    /// Target Kubernetes version.
    pub kubernetes_version: String,
    /// Node pools, ordered by name.
    pub node_pools: Vec<NodePoolSpec>,
    /// Whether the cluster is soft-deleted.
    pub deleted: bool,
    /// Attempt count of the claim that produced this snapshot.
    pub attempt: i32,
}

impl ClusterToSync {
    /// Deterministic name of the organization's external container.
    pub fn project_name(&self) -> String {
        naming::project_name(&self.organization_name)
    }
}

/// Immutable snapshot of an organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganizationToSync {
    /// Organization UUID.
    pub organization_id: Uuid,
    /// Organization name.
    pub name: String,
    /// Whether the organization is soft-deleted.
    pub deleted: bool,
    /// Attempt count of the claim that produced this snapshot.
    pub attempt: i32,
}

impl OrganizationToSync {
    /// Deterministic name of the organization's external container.
    pub fn project_name(&self) -> String {
        naming::project_name(&self.name)
    }
}

/// Snapshot loaded for a claimed subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncSnapshot {
    /// Organization subject.
    Organization(OrganizationToSync),
    /// Cluster or node pool subject.
    Cluster(ClusterToSync),
}

/// A cluster whose external status needs checking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusCandidate {
    /// Current desired state.
    pub snapshot: ClusterToSync,
    /// Last recorded external state, if any.
    pub recorded: Option<ResourceState>,
}

/// Audit event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncEventKind {
    /// An item was applied.
    Succeeded,
    /// An item exhausted its retry budget.
    Failed,
    /// External status moved to a new state.
    StatusChanged,
    /// External resource confirmed gone after deletion.
    DeletionConfirmed,
}

impl SyncEventKind {
    /// Kind as stored in `sync_events`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::StatusChanged => "status_changed",
            Self::DeletionConfirmed => "deletion_confirmed",
        }
    }
}

/// An audit event row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncEvent {
    /// Entity the event concerns.
    pub subject: OutboxSubject,
    /// Outbox row that produced the event, if any.
    pub outbox_id: Option<i64>,
    /// Event kind.
    pub kind: SyncEventKind,
    /// Free-form detail.
    pub message: Option<String>,
}

impl SyncEvent {
    /// Create an event without an outbox reference.
    pub fn new(subject: OutboxSubject, kind: SyncEventKind) -> Self {
        Self {
            subject,
            outbox_id: None,
            kind,
            message: None,
        }
    }

    /// Attach the outbox row that produced the event.
    pub fn with_outbox_id(mut self, id: i64) -> Self {
        self.outbox_id = Some(id);
        self
    }

    /// Attach a message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}
