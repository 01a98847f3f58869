// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background loop polling external reconciliation status.
//!
//! Status changes originate in the control plane, so there is nothing to
//! subscribe to; the poller runs on a fixed interval. Each tick:
//!
//! 1. Checks active clusters that are waiting for a status check and
//!    records every state transition.
//! 2. Checks deleted clusters until the control plane reports them gone,
//!    then confirms the deletion.
//!
//! Each half is bounded by the configured batch size.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::error::Result;
use crate::external::{ExternalClient, ResourceSpec};
use crate::model::{OutboxSubject, StatusCandidate, SyncEvent, SyncEventKind};
use crate::store::SyncStore;

/// Outcome of one poller tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatusTickReport {
    /// Status calls made.
    pub checked: usize,
    /// Clusters whose recorded state changed.
    pub changed: usize,
    /// Deleted clusters confirmed gone.
    pub confirmed_deleted: usize,
    /// Clusters skipped because of an error.
    pub errors: usize,
}

/// Polls the control plane for cluster status.
pub struct StatusPoller {
    store: Arc<dyn SyncStore>,
    client: Arc<dyn ExternalClient>,
    config: SyncConfig,
    shutdown: CancellationToken,
}

impl StatusPoller {
    /// Create a new status poller.
    pub fn new(
        store: Arc<dyn SyncStore>,
        client: Arc<dyn ExternalClient>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            client,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Stop when `shutdown` is cancelled.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Run the poller loop.
    pub async fn run(self) {
        info!(
            interval_secs = self.config.status_interval.as_secs(),
            batch_size = self.config.batch_size,
            "Status poller started"
        );

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    info!("Status poller shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.status_interval) => {
                    match self.tick().await {
                        Ok(report) if report.checked > 0 => debug!(?report, "Status poll complete"),
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Status poll failed"),
                    }
                }
            }
        }
    }

    /// Run a single poll.
    pub async fn tick(&self) -> Result<StatusTickReport> {
        let mut report = StatusTickReport::default();

        let active = self
            .store
            .list_status_candidates(self.config.batch_size)
            .await?;
        for candidate in active {
            if let Err(e) = self.check_active(&candidate, &mut report).await {
                report.errors += 1;
                warn!(
                    cluster_id = %candidate.snapshot.cluster_id,
                    error = %e,
                    "Status check failed"
                );
            }
        }

        let deleted = self
            .store
            .list_deletion_candidates(self.config.batch_size)
            .await?;
        for candidate in deleted {
            if let Err(e) = self.check_deleted(&candidate, &mut report).await {
                report.errors += 1;
                warn!(
                    cluster_id = %candidate.snapshot.cluster_id,
                    error = %e,
                    "Deletion check failed"
                );
            }
        }

        Ok(report)
    }

    async fn check_active(
        &self,
        candidate: &StatusCandidate,
        report: &mut StatusTickReport,
    ) -> Result<()> {
        let cluster_id = candidate.snapshot.cluster_id;
        let spec = ResourceSpec::for_cluster(&candidate.snapshot, "");
        let status = self.client.get_status(&spec).await?;
        report.checked += 1;

        self.store.record_cluster_status(cluster_id, &status).await?;

        if candidate.recorded != Some(status.state) {
            report.changed += 1;
            info!(
                cluster_id = %cluster_id,
                from = ?candidate.recorded,
                to = %status.state,
                message = %status.message,
                "Cluster status changed"
            );
            self.emit(
                SyncEvent::new(OutboxSubject::Cluster(cluster_id), SyncEventKind::StatusChanged)
                    .with_message(status.state.as_str()),
            )
            .await;
        }
        Ok(())
    }

    async fn check_deleted(
        &self,
        candidate: &StatusCandidate,
        report: &mut StatusTickReport,
    ) -> Result<()> {
        let cluster_id = candidate.snapshot.cluster_id;
        let spec = ResourceSpec::for_cluster(&candidate.snapshot, "");
        let status = self.client.get_status(&spec).await?;
        report.checked += 1;

        if status.is_not_found() {
            self.store.confirm_cluster_deleted(cluster_id).await?;
            report.confirmed_deleted += 1;
            info!(cluster_id = %cluster_id, "Cluster deletion confirmed");
            self.emit(SyncEvent::new(
                OutboxSubject::Cluster(cluster_id),
                SyncEventKind::DeletionConfirmed,
            ))
            .await;
            return Ok(());
        }

        self.store.record_cluster_status(cluster_id, &status).await?;
        if candidate.recorded != Some(status.state) {
            report.changed += 1;
            debug!(
                cluster_id = %cluster_id,
                state = %status.state,
                "Deleted cluster still present"
            );
        }
        Ok(())
    }

    async fn emit(&self, event: SyncEvent) {
        if let Err(e) = self.store.record_event(&event).await {
            warn!(subject = %event.subject, error = %e, "Failed to record sync event");
        }
    }
}
