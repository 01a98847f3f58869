// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Claim store and entity persistence.
//!
//! The store is the only synchronization point between worker processes.
//! Every operation is a short, independently committed transaction; none is
//! ever held across an external call.
//!
//! ```text
//!   claim_next ──► external call ──► mark_succeeded / mark_failed
//!   (tx 1)         (no tx)            (tx 2)
//! ```

pub mod memory;
pub mod postgres;

pub use self::memory::MemorySyncStore;
pub use self::postgres::PgSyncStore;

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::external::ResourceStatus;
use crate::model::{
    ClusterToSync, OutboxItem, OutboxSubject, StatusCandidate, SyncEvent, SyncOperation,
    SyncSnapshot,
};

/// Message recorded on items failed by [`SyncStore::sweep_abandoned`].
pub const ABANDONED_MESSAGE: &str = "claim expired after final attempt";

/// What [`SyncStore::reset_for_resync`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncOutcome {
    /// A fresh upsert item was enqueued.
    Enqueued,
    /// An expired claim was released back to pending.
    Released,
    /// An item is already queued or in flight.
    AlreadyQueued,
    /// The latest item for the subject is terminally failed.
    Exhausted(i64),
}

impl ResyncOutcome {
    /// Whether new work was made claimable.
    pub fn requeued(self) -> bool {
        matches!(self, Self::Enqueued | Self::Released)
    }
}

/// Persistence operations used by the sync engine.
#[async_trait]
pub trait SyncStore: Send + Sync {
    // ------------------------------------------------------------------
    // Outbox
    // ------------------------------------------------------------------

    /// Insert a new pending item and return its id.
    async fn enqueue(&self, subject: OutboxSubject, operation: SyncOperation) -> Result<i64>;

    /// Atomically claim one eligible item.
    ///
    /// Eligible means `pending` and available, or `claimed` with an expired
    /// claim, and in both cases `attempts < max_attempts`. Upserts are
    /// claimed before deletes, then oldest first. The claim increments
    /// `attempts` and expires after `visibility`.
    async fn claim_next(
        &self,
        worker_id: &str,
        max_attempts: i32,
        visibility: Duration,
    ) -> Result<Option<OutboxItem>>;

    /// Mark an item succeeded.
    ///
    /// Only the worker holding the claim may record an outcome; anyone else
    /// gets [`Error::ClaimLost`](crate::Error::ClaimLost). Calling it twice
    /// is a no-op.
    async fn mark_succeeded(&self, id: i64, worker_id: &str) -> Result<()>;

    /// Record a failure and release the claim held by `worker_id`.
    ///
    /// The item becomes claimable again after `retry_after`. Returns the
    /// number of attempts made so far.
    async fn mark_failed(
        &self,
        id: i64,
        worker_id: &str,
        error: &str,
        retry_after: Duration,
    ) -> Result<i32>;

    /// Move an item to terminal `failed`.
    ///
    /// The item must still be claimed by `worker_id`, or have just been
    /// released by its final [`SyncStore::mark_failed`].
    async fn mark_exhausted(&self, id: i64, worker_id: &str, error: &str) -> Result<()>;

    /// Make sure `subject` gets synced again.
    ///
    /// Enqueues a fresh item unless one is already queued or in flight. An
    /// active item whose claim expired has its claim state cleared. A subject
    /// whose latest item exhausted its retries stays failed until an
    /// operator intervenes.
    async fn reset_for_resync(&self, subject: OutboxSubject) -> Result<ResyncOutcome>;

    /// Fail items that can never be claimed again: expired claims and
    /// pending rows that already used their final attempt.
    async fn sweep_abandoned(&self, max_attempts: i32) -> Result<Vec<OutboxItem>>;

    /// Fetch one item.
    async fn get_item(&self, id: i64) -> Result<Option<OutboxItem>>;

    // ------------------------------------------------------------------
    // Entities
    // ------------------------------------------------------------------

    /// Build the snapshot a claimed item acts on. `None` if the entity is gone.
    async fn load_snapshot(
        &self,
        subject: OutboxSubject,
        attempt: i32,
    ) -> Result<Option<SyncSnapshot>>;

    /// All clusters that are not soft-deleted.
    async fn list_active_clusters(&self) -> Result<Vec<ClusterToSync>>;

    /// Active clusters waiting for a status check, least recently checked first.
    async fn list_status_candidates(&self, limit: i64) -> Result<Vec<StatusCandidate>>;

    /// Deleted clusters not yet confirmed gone, least recently checked first.
    async fn list_deletion_candidates(&self, limit: i64) -> Result<Vec<StatusCandidate>>;

    /// Persist the latest external status of a cluster.
    ///
    /// Status checks stay scheduled until the cluster reports `ready`.
    async fn record_cluster_status(&self, cluster_id: Uuid, status: &ResourceStatus)
    -> Result<()>;

    /// Schedule status checks after a successful apply.
    async fn mark_cluster_applied(&self, cluster_id: Uuid) -> Result<()>;

    /// Record that a deleted cluster is gone externally.
    async fn confirm_cluster_deleted(&self, cluster_id: Uuid) -> Result<()>;

    /// Append an audit event.
    async fn record_event(&self, event: &SyncEvent) -> Result<()>;
}
