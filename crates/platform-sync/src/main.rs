// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Platform Sync - Outbox Worker
//!
//! A background service responsible for:
//! - Draining the sync outbox into the external control plane
//! - Polling external reconciliation status
//! - Healing drift between relational and external state
//! - Serving readiness and liveness probes

use std::sync::Arc;
use tracing::{info, warn};

use platform_sync::config::Config;
use platform_sync::external::{ExternalClient, HttpExternalClient};
use platform_sync::migrations;
use platform_sync::notify::PgNotificationSource;
use platform_sync::runtime::SyncRuntime;
use platform_sync::store::PgSyncStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "platform_sync=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        worker_id = %config.sync.worker_id,
        external_url = %config.external_url,
        health_addr = %config.health_addr,
        "Starting Platform Sync"
    );

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(&config.database_url)
        .await?;

    info!("Connected to database");

    migrations::run(&pool).await?;
    migrations::set_notify_channel(&pool, &config.sync.channel).await?;

    info!(channel = %config.sync.channel, "Database schema verified");

    let client = Arc::new(HttpExternalClient::new(
        &config.external_url,
        config.external_token.clone(),
    )?);
    info!(client_type = client.client_type(), "External client initialized");

    let runtime = SyncRuntime::builder()
        .store(Arc::new(PgSyncStore::new(pool.clone())))
        .client(client)
        .notifications(Arc::new(PgNotificationSource::new(
            pool,
            config.sync.channel.clone(),
        )))
        .config(config.sync)
        .health_addr(config.health_addr)
        .build()?
        .start()
        .await?;

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("Platform Sync shut down");

    Ok(())
}
