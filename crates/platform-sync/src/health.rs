// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Readiness and liveness probes.
//!
//! Readiness is owned by the sync worker's event loop: it is true only while
//! the loop holds an active notification subscription. Liveness is
//! independent of readiness and stays true while the process serves.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Process health flags.
#[derive(Debug)]
pub struct Health {
    ready: AtomicBool,
    live: AtomicBool,
}

impl Default for Health {
    fn default() -> Self {
        Self::new()
    }
}

impl Health {
    /// Not ready, live.
    pub fn new() -> Self {
        Self {
            ready: AtomicBool::new(false),
            live: AtomicBool::new(true),
        }
    }

    /// Whether the event loop holds an active subscription.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Set readiness.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Whether the process is alive.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Set liveness.
    pub fn set_live(&self, live: bool) {
        self.live.store(live, Ordering::SeqCst);
    }
}

#[derive(Serialize)]
struct ProbeResponse {
    status: &'static str,
}

fn probe(ok: bool, up: &'static str, down: &'static str) -> (StatusCode, Json<ProbeResponse>) {
    if ok {
        (StatusCode::OK, Json(ProbeResponse { status: up }))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ProbeResponse { status: down }),
        )
    }
}

async fn liveness_handler(State(health): State<Arc<Health>>) -> (StatusCode, Json<ProbeResponse>) {
    probe(health.is_live(), "alive", "dead")
}

async fn readiness_handler(
    State(health): State<Arc<Health>>,
) -> (StatusCode, Json<ProbeResponse>) {
    probe(health.is_ready(), "ready", "not_ready")
}

/// Probe router: `GET /healthz` and `GET /readyz`.
pub fn router(health: Arc<Health>) -> Router {
    Router::new()
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .with_state(health)
}

/// Serve the probe router until `shutdown` is cancelled.
pub async fn serve(
    addr: SocketAddr,
    health: Arc<Health>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "Health server listening");

    axum::serve(listener, router(health))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
