// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Periodic drift reconciliation.
//!
//! Compares the relational desired state with the control plane's actual
//! state, joined on the cluster UUID owner label:
//!
//! | Relational | External | Action |
//! |------------|----------|--------|
//! | active     | missing  | `reset_for_resync` (resource silently lost) |
//! | missing    | present  | delete (orphan left by a crash mid-delete) |
//! | active     | present  | nothing |
//!
//! A missing cluster whose latest outbox item exhausted its retries is not
//! requeued. It is reported with an alert and left for an operator.
//!
//! Running it against consistent state performs no corrective action. When
//! drift is found the sync worker is woken to drain immediately.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::error::Result;
use crate::external::{ExternalClient, ExternalResource};
use crate::model::{OutboxSubject, SyncEvent, SyncEventKind};
use crate::store::{ResyncOutcome, SyncStore};

/// Outcome of one reconciliation pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Active clusters with no external resource.
    pub missing: Vec<Uuid>,
    /// External resources with no active cluster.
    pub orphans: Vec<Uuid>,
    /// Missing clusters that were queued for resync.
    pub requeued: usize,
    /// Missing clusters left alone because their last sync exhausted its retries.
    pub exhausted: Vec<Uuid>,
    /// Owners carried by more than one external resource.
    pub duplicates: Vec<Uuid>,
    /// Orphans and duplicate resources deleted.
    pub deleted: usize,
    /// Outbox items failed by the abandoned-claim sweep.
    pub abandoned: usize,
}

impl ReconcileReport {
    /// Number of corrective actions taken.
    pub fn corrective_actions(&self) -> usize {
        self.requeued + self.deleted + self.abandoned
    }

    /// Whether any drift was detected.
    pub fn has_drift(&self) -> bool {
        !self.missing.is_empty() || !self.orphans.is_empty() || !self.duplicates.is_empty()
    }
}

/// Heals drift between relational and external state.
pub struct Reconciler {
    store: Arc<dyn SyncStore>,
    client: Arc<dyn ExternalClient>,
    config: SyncConfig,
    wake: Arc<Notify>,
    shutdown: CancellationToken,
}

impl Reconciler {
    /// Create a reconciler that wakes the sync worker through `wake`.
    pub fn new(
        store: Arc<dyn SyncStore>,
        client: Arc<dyn ExternalClient>,
        config: SyncConfig,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            store,
            client,
            config,
            wake,
            shutdown: CancellationToken::new(),
        }
    }

    /// Stop when `shutdown` is cancelled.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Run a pass immediately, then every reconcile interval.
    pub async fn run(self) {
        info!(
            interval_secs = self.config.reconcile_interval.as_secs(),
            "Reconciler started"
        );

        let mut interval = tokio::time::interval(self.config.reconcile_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    info!("Reconciler shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.reconcile().await {
                        error!(error = %e, "Reconciliation failed");
                    }
                }
            }
        }
    }

    /// Run one reconciliation pass.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        let desired: HashSet<Uuid> = self
            .store
            .list_active_clusters()
            .await?
            .into_iter()
            .map(|c| c.cluster_id)
            .collect();
        let (actual, duplicates) = index_by_owner(self.client.list_resources().await?);

        let mut missing: Vec<Uuid> = desired
            .iter()
            .filter(|id| !actual.contains_key(*id))
            .copied()
            .collect();
        missing.sort();
        let mut orphans: Vec<Uuid> = actual
            .keys()
            .filter(|id| !desired.contains(*id))
            .copied()
            .collect();
        orphans.sort();

        for cluster_id in &missing {
            match self.resync(*cluster_id, &mut report).await {
                Some(ResyncOutcome::AlreadyQueued) => {
                    debug!(
                        cluster_id = %cluster_id,
                        "External resource missing, sync already queued"
                    );
                }
                Some(outcome) if outcome.requeued() => {
                    info!(cluster_id = %cluster_id, "External resource missing, queued resync");
                }
                _ => {}
            }
        }

        for owner_id in &orphans {
            match self.client.delete_resource_by_owner_id(*owner_id).await {
                Ok(()) => {
                    report.deleted += 1;
                    info!(owner_id = %owner_id, "Deleted orphaned external resource");
                }
                Err(e) => warn!(owner_id = %owner_id, error = %e, "Failed to delete orphan"),
            }
        }

        // At most one resource per owner: drop them all and let the worker
        // recreate a single one.
        for owner_id in duplicates.iter().filter(|id| desired.contains(*id)) {
            warn!(owner_id = %owner_id, "Multiple external resources share an owner label");
            if let Err(e) = self.client.delete_resource_by_owner_id(*owner_id).await {
                warn!(owner_id = %owner_id, error = %e, "Failed to delete duplicates");
                continue;
            }
            report.deleted += 1;
            self.resync(*owner_id, &mut report).await;
        }
        report.duplicates = duplicates;

        let abandoned = self.store.sweep_abandoned(self.config.max_retries).await?;
        for item in &abandoned {
            error!(
                alert = true,
                item_id = item.id,
                subject = %item.subject,
                attempts = item.attempts,
                "Abandoned claim failed; operator intervention required"
            );
            let event = SyncEvent::new(item.subject, SyncEventKind::Failed)
                .with_outbox_id(item.id)
                .with_message(item.last_error.clone().unwrap_or_default());
            if let Err(e) = self.store.record_event(&event).await {
                warn!(item_id = item.id, error = %e, "Failed to record sync event");
            }
        }
        report.abandoned = abandoned.len();

        report.missing = missing;
        report.orphans = orphans;

        if report.has_drift() {
            self.wake.notify_one();
        }
        if report.has_drift() || report.abandoned > 0 {
            info!(
                missing = report.missing.len(),
                orphans = report.orphans.len(),
                duplicates = report.duplicates.len(),
                requeued = report.requeued,
                exhausted = report.exhausted.len(),
                deleted = report.deleted,
                abandoned = report.abandoned,
                "Reconciliation found drift"
            );
        } else {
            debug!(clusters = desired.len(), "Reconciliation found no drift");
        }

        Ok(report)
    }

    /// Queue a resync for `cluster_id`, recording the outcome in `report`.
    async fn resync(
        &self,
        cluster_id: Uuid,
        report: &mut ReconcileReport,
    ) -> Option<ResyncOutcome> {
        let outcome = match self
            .store
            .reset_for_resync(OutboxSubject::Cluster(cluster_id))
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(cluster_id = %cluster_id, error = %e, "Failed to queue resync");
                return None;
            }
        };

        if outcome.requeued() {
            report.requeued += 1;
        } else if let ResyncOutcome::Exhausted(item_id) = outcome {
            error!(
                alert = true,
                cluster_id = %cluster_id,
                item_id,
                "Cluster drifted but its sync exhausted retries; operator intervention required"
            );
            report.exhausted.push(cluster_id);
        }
        Some(outcome)
    }
}

/// Index resources by owner UUID and report owners seen more than once.
///
/// Resources without a usable owner label are not ours to judge and are
/// skipped.
fn index_by_owner(
    resources: Vec<ExternalResource>,
) -> (HashMap<Uuid, ExternalResource>, Vec<Uuid>) {
    let mut index = HashMap::with_capacity(resources.len());
    let mut duplicates = Vec::new();
    for resource in resources {
        let Some(owner_id) = resource.owner_id() else {
            debug!(
                name = %resource.name,
                namespace = %resource.namespace,
                "Skipping resource without owner label"
            );
            continue;
        };
        if index.insert(owner_id, resource).is_some() && !duplicates.contains(&owner_id) {
            duplicates.push(owner_id);
        }
    }
    duplicates.sort();
    (index, duplicates)
}
