// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for platform-sync.
//!
//! [`SyncRuntime`] wires the sync worker, status poller, reconciler and
//! optional health server together so the engine can run inside an existing
//! tokio application as well as from the bundled binary.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use platform_sync::SyncConfig;
//! use platform_sync::external::HttpExternalClient;
//! use platform_sync::notify::PgNotificationSource;
//! use platform_sync::runtime::SyncRuntime;
//! use platform_sync::store::PgSyncStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pool = sqlx::PgPool::connect("postgres://...").await?;
//!     let config = SyncConfig::from_env()?;
//!
//!     let runtime = SyncRuntime::builder()
//!         .store(Arc::new(PgSyncStore::new(pool.clone())))
//!         .client(Arc::new(HttpExternalClient::new("http://gardener:8080", None)?))
//!         .notifications(Arc::new(PgNotificationSource::new(pool, &config.channel)))
//!         .config(config)
//!         .health_addr("0.0.0.0:8080".parse()?)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::SyncConfig;
use crate::external::ExternalClient;
use crate::health::{self, Health};
use crate::notify::NotificationSource;
use crate::reconciler::Reconciler;
use crate::status_poller::StatusPoller;
use crate::store::SyncStore;
use crate::worker::SyncWorker;

/// Builder for creating a [`SyncRuntime`].
#[derive(Default)]
pub struct SyncRuntimeBuilder {
    store: Option<Arc<dyn SyncStore>>,
    client: Option<Arc<dyn ExternalClient>>,
    notifications: Option<Arc<dyn NotificationSource>>,
    config: SyncConfig,
    health_addr: Option<SocketAddr>,
}

impl SyncRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the outbox and relational store (required).
    pub fn store(mut self, store: Arc<dyn SyncStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the external control-plane client (required).
    pub fn client(mut self, client: Arc<dyn ExternalClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Set the push-notification source (required).
    pub fn notifications(mut self, source: Arc<dyn NotificationSource>) -> Self {
        self.notifications = Some(source);
        self
    }

    /// Set the engine configuration.
    ///
    /// Default: [`SyncConfig::default()`]
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Serve `/healthz` and `/readyz` on this address.
    ///
    /// Default: `None` (no health server)
    pub fn health_addr(mut self, addr: SocketAddr) -> Self {
        self.health_addr = Some(addr);
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing or the configuration
    /// is invalid.
    pub fn build(self) -> Result<SyncRuntimeConfig> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store is required"))?;
        let client = self
            .client
            .ok_or_else(|| anyhow::anyhow!("client is required"))?;
        let notifications = self
            .notifications
            .ok_or_else(|| anyhow::anyhow!("notifications is required"))?;
        self.config.validate()?;

        Ok(SyncRuntimeConfig {
            store,
            client,
            notifications,
            config: self.config,
            health_addr: self.health_addr,
        })
    }
}

/// Configuration for a [`SyncRuntime`].
pub struct SyncRuntimeConfig {
    store: Arc<dyn SyncStore>,
    client: Arc<dyn ExternalClient>,
    notifications: Arc<dyn NotificationSource>,
    config: SyncConfig,
    health_addr: Option<SocketAddr>,
}

impl SyncRuntimeConfig {
    /// Start the runtime, spawning every background task.
    pub async fn start(self) -> Result<SyncRuntime> {
        let shutdown = CancellationToken::new();
        let health = Arc::new(Health::new());
        let wake = Arc::new(Notify::new());

        let worker = SyncWorker::new(
            self.store.clone(),
            self.client.clone(),
            self.notifications,
            self.config.clone(),
        )
        .with_health(health.clone())
        .with_shutdown(shutdown.clone())
        .with_wake(wake.clone());
        let worker_handle = tokio::spawn(worker.run());

        let poller = StatusPoller::new(
            self.store.clone(),
            self.client.clone(),
            self.config.clone(),
        )
        .with_shutdown(shutdown.clone());
        let poller_handle = tokio::spawn(poller.run());

        let reconciler = Reconciler::new(
            self.store,
            self.client,
            self.config.clone(),
            wake.clone(),
        )
        .with_shutdown(shutdown.clone());
        let reconciler_handle = tokio::spawn(reconciler.run());

        let health_handle = match self.health_addr {
            Some(addr) => {
                let health = health.clone();
                let shutdown = shutdown.clone();
                Some(tokio::spawn(async move {
                    if let Err(e) = health::serve(addr, health, shutdown).await {
                        error!(error = %e, "Health server failed");
                    }
                }))
            }
            None => None,
        };

        info!(
            worker_id = %self.config.worker_id,
            channel = %self.config.channel,
            health_addr = ?self.health_addr,
            "SyncRuntime started"
        );

        Ok(SyncRuntime {
            handles: vec![
                ("sync worker", worker_handle),
                ("status poller", poller_handle),
                ("reconciler", reconciler_handle),
            ]
            .into_iter()
            .chain(health_handle.map(|h| ("health server", h)))
            .collect(),
            shutdown,
            health,
            wake,
            shutdown_timeout: self.config.shutdown_timeout,
        })
    }
}

/// A running sync engine.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct SyncRuntime {
    handles: Vec<(&'static str, JoinHandle<()>)>,
    shutdown: CancellationToken,
    health: Arc<Health>,
    wake: Arc<Notify>,
    shutdown_timeout: Duration,
}

impl SyncRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> SyncRuntimeBuilder {
        SyncRuntimeBuilder::new()
    }

    /// Shared health flags.
    pub fn health(&self) -> &Arc<Health> {
        &self.health
    }

    /// Wake the sync worker to drain the outbox now.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Check if every background task is still running.
    pub fn is_running(&self) -> bool {
        self.handles.iter().all(|(_, h)| !h.is_finished())
    }

    /// Gracefully shut down the runtime.
    ///
    /// Signals every task to stop and waits up to the configured shutdown
    /// timeout. Tasks still running after that are aborted; an in-flight
    /// outbox claim then expires and is retried by another worker.
    pub async fn shutdown(self) -> Result<()> {
        info!("SyncRuntime shutting down...");
        self.shutdown.cancel();
        self.health.set_ready(false);

        let deadline = tokio::time::Instant::now() + self.shutdown_timeout;
        let mut timed_out = Vec::new();

        for (name, mut handle) in self.handles {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(task = name, "Task panicked: {}", e),
                Err(_) => {
                    warn!(task = name, "Task did not stop in time, aborting");
                    handle.abort();
                    timed_out.push(name);
                }
            }
        }

        self.health.set_live(false);
        if timed_out.is_empty() {
            info!("SyncRuntime shutdown complete");
            Ok(())
        } else {
            Err(anyhow::anyhow!(
                "shutdown timed out waiting for: {}",
                timed_out.join(", ")
            ))
        }
    }
}
