// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for platform-sync integration tests.
//!
//! Postgres-backed tests need `TEST_PLATFORM_SYNC_DATABASE_URL` and are
//! skipped without it. They share one database, so each test holds
//! [`DB_LOCK`] for its whole run.

#![allow(dead_code)]

use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

/// Skip test if database URL is not set
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_PLATFORM_SYNC_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_PLATFORM_SYNC_DATABASE_URL not set");
            return;
        }
    };
}

/// Serializes tests that touch the shared database.
pub static DB_LOCK: Mutex<()> = Mutex::const_new(());

/// A migrated, emptied database reserved for one test.
pub struct TestDb {
    pub pool: PgPool,
    _guard: MutexGuard<'static, ()>,
}

impl TestDb {
    /// Connect, migrate and truncate every table.
    pub async fn new() -> Option<Self> {
        let database_url = std::env::var("TEST_PLATFORM_SYNC_DATABASE_URL").ok()?;
        let guard = DB_LOCK.lock().await;

        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(16)
            .connect(&database_url)
            .await
            .expect("Failed to connect to database");
        platform_sync::migrations::run(&pool)
            .await
            .expect("Failed to run migrations");
        sqlx::query(
            r#"
            TRUNCATE sync_events, sync_outbox, sync_settings, node_pools, clusters, organizations
            RESTART IDENTITY CASCADE
            "#,
        )
        .execute(&pool)
        .await
        .expect("Failed to truncate tables");

        Some(Self {
            pool,
            _guard: guard,
        })
    }

    pub async fn insert_organization(&self, name: &str) -> Uuid {
        let id = Uuid::new_v4();
        sqlx::query("INSERT INTO organizations (id, name) VALUES ($1, $2)")
            .bind(id)
            .bind(name)
            .execute(&self.pool)
            .await
            .expect("Failed to insert organization");
        id
    }

    pub async fn insert_cluster(&self, organization_id: Uuid, name: &str) -> Uuid {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO clusters (id, organization_id, name, region, kubernetes_version)
            VALUES ($1, $2, $3, 'eu-west-1', '1.30')
            "#,
        )
        .bind(id)
        .bind(organization_id)
        .bind(name)
        .execute(&self.pool)
        .await
        .expect("Failed to insert cluster");
        id
    }

    pub async fn insert_node_pool(&self, cluster_id: Uuid, name: &str) -> Uuid {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO node_pools (id, cluster_id, name, machine_type, min_nodes, max_nodes)
            VALUES ($1, $2, $3, 'm5.large', 1, 3)
            "#,
        )
        .bind(id)
        .bind(cluster_id)
        .bind(name)
        .execute(&self.pool)
        .await
        .expect("Failed to insert node pool");
        id
    }

    pub async fn soft_delete_cluster(&self, id: Uuid) {
        sqlx::query("UPDATE clusters SET deleted_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .expect("Failed to delete cluster");
    }

    /// Backdate an item so it sorts before newer ones.
    pub async fn backdate_item(&self, id: i64, by: Duration) {
        sqlx::query(
            r#"
            UPDATE sync_outbox
            SET created_at = created_at - make_interval(secs => $2)
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(by.as_secs_f64())
        .execute(&self.pool)
        .await
        .expect("Failed to backdate item");
    }

    /// Make a delayed retry claimable now.
    pub async fn make_available(&self, id: i64) {
        sqlx::query("UPDATE sync_outbox SET available_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .expect("Failed to update item");
    }
}
