// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed sync store.
//!
//! Claims use `FOR UPDATE SKIP LOCKED`, so any number of workers can poll the
//! same table without blocking each other or double-claiming a row.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{ABANDONED_MESSAGE, ResyncOutcome, SyncStore};
use crate::error::{Error, Result};
use crate::external::{ResourceState, ResourceStatus};
use crate::model::{
    ClusterToSync, NodePoolSpec, OrganizationToSync, OutboxItem, OutboxStatus, OutboxSubject,
    StatusCandidate, SyncEvent, SyncOperation, SyncSnapshot,
};

const OUTBOX_COLUMNS: &str = "id, subject_kind, subject_id, operation, status, attempts, \
     claimed_by, claim_expiry, available_at, last_error, created_at";

const CLUSTER_SELECT: &str = r#"
    SELECT c.id, c.name, c.region, c.kubernetes_version,
           c.deleted_at IS NOT NULL AS deleted, c.status,
           o.id AS organization_id, o.name AS organization_name
    FROM clusters c
    JOIN organizations o ON o.id = c.organization_id
"#;

#[derive(Debug, sqlx::FromRow)]
struct OutboxRow {
    id: i64,
    subject_kind: String,
    subject_id: Uuid,
    operation: String,
    status: String,
    attempts: i32,
    claimed_by: Option<String>,
    claim_expiry: Option<DateTime<Utc>>,
    available_at: DateTime<Utc>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<OutboxRow> for OutboxItem {
    type Error = Error;

    fn try_from(row: OutboxRow) -> Result<Self> {
        let subject = OutboxSubject::from_parts(&row.subject_kind, row.subject_id).ok_or_else(
            || Error::InvalidRecord(format!("unknown subject kind: {}", row.subject_kind)),
        )?;
        Ok(OutboxItem {
            id: row.id,
            subject,
            operation: row.operation.parse().map_err(Error::InvalidRecord)?,
            status: row.status.parse().map_err(Error::InvalidRecord)?,
            attempts: row.attempts,
            claimed_by: row.claimed_by,
            claim_expiry: row.claim_expiry,
            available_at: row.available_at,
            last_error: row.last_error,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ClusterRow {
    id: Uuid,
    name: String,
    region: String,
    kubernetes_version: String,
    deleted: bool,
    status: Option<String>,
    organization_id: Uuid,
    organization_name: String,
}

#[derive(Debug, sqlx::FromRow)]
struct NodePoolRow {
    cluster_id: Uuid,
    name: String,
    machine_type: String,
    min_nodes: i32,
    max_nodes: i32,
}

#[derive(Debug, sqlx::FromRow)]
struct OrganizationRow {
    id: Uuid,
    name: String,
    deleted: bool,
}

/// PostgreSQL sync store.
#[derive(Clone)]
pub struct PgSyncStore {
    pool: PgPool,
}

impl PgSyncStore {
    /// Create a store on an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Classify an outcome write that matched no row. Already being in
    /// `done` counts as success.
    async fn unowned(&self, id: i64, worker_id: &str, done: OutboxStatus) -> Result<()> {
        match self.get_item(id).await? {
            None => Err(Error::OutboxItemNotFound(id)),
            Some(item) if item.status == done => Ok(()),
            Some(_) => Err(Error::ClaimLost {
                id,
                worker_id: worker_id.to_string(),
            }),
        }
    }

    async fn node_pools_for(
        &self,
        cluster_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, Vec<NodePoolSpec>>> {
        let rows = sqlx::query_as::<_, NodePoolRow>(
            r#"
            SELECT cluster_id, name, machine_type, min_nodes, max_nodes
            FROM node_pools
            WHERE cluster_id = ANY($1) AND deleted_at IS NULL
            ORDER BY cluster_id, name
            "#,
        )
        .bind(cluster_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut pools: HashMap<Uuid, Vec<NodePoolSpec>> = HashMap::new();
        for row in rows {
            pools.entry(row.cluster_id).or_default().push(NodePoolSpec {
                name: row.name,
                machine_type: row.machine_type,
                min_nodes: row.min_nodes,
                max_nodes: row.max_nodes,
            });
        }
        Ok(pools)
    }

    async fn cluster_snapshots(
        &self,
        rows: Vec<ClusterRow>,
        attempt: i32,
    ) -> Result<Vec<(ClusterToSync, Option<ResourceState>)>> {
        let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();
        let mut pools = self.node_pools_for(&ids).await?;

        rows.into_iter()
            .map(|row| -> Result<(ClusterToSync, Option<ResourceState>)> {
                let recorded = row
                    .status
                    .as_deref()
                    .map(str::parse::<ResourceState>)
                    .transpose()
                    .map_err(Error::InvalidRecord)?;
                let snapshot = ClusterToSync {
                    node_pools: pools.remove(&row.id).unwrap_or_default(),
                    cluster_id: row.id,
                    cluster_name: row.name,
                    organization_id: row.organization_id,
                    organization_name: row.organization_name,
                    region: row.region,
                    kubernetes_version: row.kubernetes_version,
                    deleted: row.deleted,
                    attempt,
                };
                Ok((snapshot, recorded))
            })
            .collect()
    }

    async fn load_cluster(
        &self,
        cluster_id: Uuid,
        attempt: i32,
    ) -> Result<Option<ClusterToSync>> {
        let row = sqlx::query_as::<_, ClusterRow>(&format!("{} WHERE c.id = $1", CLUSTER_SELECT))
            .bind(cluster_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut snapshots = self.cluster_snapshots(vec![row], attempt).await?;
        Ok(snapshots.pop().map(|(snapshot, _)| snapshot))
    }

    async fn candidates(&self, filter: &str, limit: i64) -> Result<Vec<StatusCandidate>> {
        let sql = format!(
            "{} WHERE {} ORDER BY c.status_checked_at ASC NULLS FIRST, c.id LIMIT $1",
            CLUSTER_SELECT, filter
        );
        let rows = sqlx::query_as::<_, ClusterRow>(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(self
            .cluster_snapshots(rows, 0)
            .await?
            .into_iter()
            .map(|(snapshot, recorded)| StatusCandidate { snapshot, recorded })
            .collect())
    }
}

#[async_trait]
impl SyncStore for PgSyncStore {
    async fn enqueue(&self, subject: OutboxSubject, operation: SyncOperation) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO sync_outbox (subject_kind, subject_id, operation)
            VALUES ($1, $2, $3)
            RETURNING id
            "#,
        )
        .bind(subject.kind())
        .bind(subject.id())
        .bind(operation.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        max_attempts: i32,
        visibility: Duration,
    ) -> Result<Option<OutboxItem>> {
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            r#"
            UPDATE sync_outbox
            SET status = 'claimed',
                claimed_by = $1,
                claim_expiry = NOW() + make_interval(secs => $3),
                attempts = attempts + 1,
                updated_at = NOW()
            WHERE id = (
                SELECT id FROM sync_outbox
                WHERE attempts < $2
                  AND ((status = 'pending' AND available_at <= NOW())
                    OR (status = 'claimed' AND claim_expiry < NOW()))
                ORDER BY (operation = 'delete') ASC, created_at ASC, id ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING {}
            "#,
            OUTBOX_COLUMNS
        );
        let row = sqlx::query_as::<_, OutboxRow>(&sql)
            .bind(worker_id)
            .bind(max_attempts)
            .bind(visibility.as_secs_f64())
            .fetch_optional(&mut *tx)
            .await?;

        tx.commit().await?;

        row.map(OutboxItem::try_from).transpose()
    }

    async fn mark_succeeded(&self, id: i64, worker_id: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE sync_outbox
            SET status = 'succeeded', claimed_by = NULL, claim_expiry = NULL,
                last_error = NULL, updated_at = NOW()
            WHERE id = $1 AND status = 'claimed' AND claimed_by = $2
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return self.unowned(id, worker_id, OutboxStatus::Succeeded).await;
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: i64,
        worker_id: &str,
        error: &str,
        retry_after: Duration,
    ) -> Result<i32> {
        let attempts: Option<i32> = sqlx::query_scalar(
            r#"
            UPDATE sync_outbox
            SET status = 'pending', claimed_by = NULL, claim_expiry = NULL,
                last_error = $3,
                available_at = NOW() + make_interval(secs => $4),
                updated_at = NOW()
            WHERE id = $1 AND status = 'claimed' AND claimed_by = $2
            RETURNING attempts
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(error)
        .bind(retry_after.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        match attempts {
            Some(attempts) => Ok(attempts),
            None => match self.get_item(id).await? {
                None => Err(Error::OutboxItemNotFound(id)),
                Some(_) => Err(Error::ClaimLost {
                    id,
                    worker_id: worker_id.to_string(),
                }),
            },
        }
    }

    async fn mark_exhausted(&self, id: i64, worker_id: &str, error: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE sync_outbox
            SET status = 'failed', claimed_by = NULL, claim_expiry = NULL,
                last_error = $3, updated_at = NOW()
            WHERE id = $1
              AND ((status = 'claimed' AND claimed_by = $2)
                OR (status = 'pending' AND claimed_by IS NULL))
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return self.unowned(id, worker_id, OutboxStatus::Failed).await;
        }
        Ok(())
    }

    async fn reset_for_resync(&self, subject: OutboxSubject) -> Result<ResyncOutcome> {
        let mut tx = self.pool.begin().await?;

        let active = sqlx::query_as::<_, (i64, bool)>(
            r#"
            SELECT id, (status = 'claimed' AND claim_expiry < NOW()) AS expired
            FROM sync_outbox
            WHERE subject_kind = $1 AND subject_id = $2
              AND status IN ('pending', 'claimed')
            ORDER BY id DESC
            LIMIT 1
            FOR UPDATE
            "#,
        )
        .bind(subject.kind())
        .bind(subject.id())
        .fetch_optional(&mut *tx)
        .await?;

        let outcome = match active {
            Some((id, true)) => {
                sqlx::query(
                    r#"
                    UPDATE sync_outbox
                    SET status = 'pending', claimed_by = NULL, claim_expiry = NULL,
                        available_at = NOW(), updated_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(id)
                .execute(&mut *tx)
                .await?;
                ResyncOutcome::Released
            }
            Some((_, false)) => ResyncOutcome::AlreadyQueued,
            None => {
                let latest = sqlx::query_as::<_, (i64, String)>(
                    r#"
                    SELECT id, status
                    FROM sync_outbox
                    WHERE subject_kind = $1 AND subject_id = $2
                    ORDER BY id DESC
                    LIMIT 1
                    "#,
                )
                .bind(subject.kind())
                .bind(subject.id())
                .fetch_optional(&mut *tx)
                .await?;

                match latest {
                    Some((id, status)) if status == OutboxStatus::Failed.as_str() => {
                        ResyncOutcome::Exhausted(id)
                    }
                    _ => {
                        sqlx::query(
                            r#"
                            INSERT INTO sync_outbox (subject_kind, subject_id, operation)
                            VALUES ($1, $2, 'upsert')
                            "#,
                        )
                        .bind(subject.kind())
                        .bind(subject.id())
                        .execute(&mut *tx)
                        .await?;
                        ResyncOutcome::Enqueued
                    }
                }
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    async fn sweep_abandoned(&self, max_attempts: i32) -> Result<Vec<OutboxItem>> {
        let sql = format!(
            r#"
            UPDATE sync_outbox
            SET status = 'failed', claimed_by = NULL, claim_expiry = NULL,
                last_error = COALESCE(last_error, $2), updated_at = NOW()
            WHERE attempts >= $1
              AND ((status = 'claimed' AND claim_expiry < NOW())
                OR status = 'pending')
            RETURNING {}
            "#,
            OUTBOX_COLUMNS
        );
        let rows = sqlx::query_as::<_, OutboxRow>(&sql)
            .bind(max_attempts)
            .bind(ABANDONED_MESSAGE)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(OutboxItem::try_from).collect()
    }

    async fn get_item(&self, id: i64) -> Result<Option<OutboxItem>> {
        let row = sqlx::query_as::<_, OutboxRow>(&format!(
            "SELECT {} FROM sync_outbox WHERE id = $1",
            OUTBOX_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(OutboxItem::try_from).transpose()
    }

    async fn load_snapshot(
        &self,
        subject: OutboxSubject,
        attempt: i32,
    ) -> Result<Option<SyncSnapshot>> {
        match subject {
            OutboxSubject::Organization(id) => {
                let row = sqlx::query_as::<_, OrganizationRow>(
                    r#"
                    SELECT id, name, deleted_at IS NOT NULL AS deleted
                    FROM organizations
                    WHERE id = $1
                    "#,
                )
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

                Ok(row.map(|row| {
                    SyncSnapshot::Organization(OrganizationToSync {
                        organization_id: row.id,
                        name: row.name,
                        deleted: row.deleted,
                        attempt,
                    })
                }))
            }
            OutboxSubject::Cluster(id) => Ok(self
                .load_cluster(id, attempt)
                .await?
                .map(SyncSnapshot::Cluster)),
            OutboxSubject::NodePool(id) => {
                let cluster_id: Option<Uuid> =
                    sqlx::query_scalar("SELECT cluster_id FROM node_pools WHERE id = $1")
                        .bind(id)
                        .fetch_optional(&self.pool)
                        .await?;

                match cluster_id {
                    Some(cluster_id) => Ok(self
                        .load_cluster(cluster_id, attempt)
                        .await?
                        .map(SyncSnapshot::Cluster)),
                    None => Ok(None),
                }
            }
        }
    }

    async fn list_active_clusters(&self) -> Result<Vec<ClusterToSync>> {
        let rows = sqlx::query_as::<_, ClusterRow>(&format!(
            "{} WHERE c.deleted_at IS NULL ORDER BY c.id",
            CLUSTER_SELECT
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(self
            .cluster_snapshots(rows, 0)
            .await?
            .into_iter()
            .map(|(snapshot, _)| snapshot)
            .collect())
    }

    async fn list_status_candidates(&self, limit: i64) -> Result<Vec<StatusCandidate>> {
        self.candidates("c.deleted_at IS NULL AND c.status_check_pending", limit)
            .await
    }

    async fn list_deletion_candidates(&self, limit: i64) -> Result<Vec<StatusCandidate>> {
        self.candidates(
            "c.deleted_at IS NOT NULL AND c.deletion_confirmed_at IS NULL",
            limit,
        )
        .await
    }

    async fn record_cluster_status(
        &self,
        cluster_id: Uuid,
        status: &ResourceStatus,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE clusters
            SET status = $2, status_message = $3, status_checked_at = NOW(),
                status_check_pending = ($2 <> 'ready'), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(cluster_id)
        .bind(status.state.as_str())
        .bind(&status.message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_cluster_applied(&self, cluster_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE clusters
            SET status_check_pending = TRUE, synced_at = NOW(), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(cluster_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn confirm_cluster_deleted(&self, cluster_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE clusters
            SET deletion_confirmed_at = NOW(), status = 'deleted',
                status_message = NULL, status_checked_at = NOW(),
                status_check_pending = FALSE, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(cluster_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_event(&self, event: &SyncEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_events (subject_kind, subject_id, outbox_id, kind, message)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(event.subject.kind())
        .bind(event.subject.id())
        .bind(event.outbox_id)
        .bind(event.kind.as_str())
        .bind(event.message.as_deref())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
