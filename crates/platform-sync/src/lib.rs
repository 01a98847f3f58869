// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Platform Sync - Outbox-Driven Control Plane Synchronization
//!
//! This crate propagates relational tenant state (organizations, clusters,
//! node pools) to an external cluster-provisioning control plane. Writes to
//! the relational store enqueue rows into a database-backed outbox; any number
//! of worker processes compete for those rows, apply the latest snapshot of
//! the owning entity to the control plane, and record the outcome.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                 API write paths (enqueue outbox rows)                 │
//! └──────────────────────────────────────────────────────────────────────┘
//!                                   │ INSERT + pg_notify
//!                                   ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                              PostgreSQL                               │
//! │       organizations · clusters · node_pools · sync_outbox · events    │
//! └──────────────────────────────────────────────────────────────────────┘
//!        │ LISTEN / claim             │ status columns        │ full listing
//!        ▼                            ▼                       ▼
//! ┌──────────────┐          ┌──────────────────┐     ┌──────────────────┐
//! │ Sync Worker  │          │  Status Poller   │     │    Reconciler    │
//! │ (event loop) │          │  (fixed timer)   │     │ (coarse timer)   │
//! └──────┬───────┘          └────────┬─────────┘     └────────┬─────────┘
//!        │ ensure / apply / delete   │ get_status             │ list / delete
//!        ▼                           ▼                        ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                External control plane (ExternalClient)                │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Outbox Item State Machine
//!
//! ```text
//!              enqueue / reset_for_resync
//!                        │
//!                        ▼
//!                  ┌───────────┐   claim_next    ┌───────────┐
//!         ┌───────►│  PENDING  │────────────────►│  CLAIMED  │
//!         │        └───────────┘                 └─────┬─────┘
//!         │              ▲  visibility window expired  │
//!         │              └─────────────────────────────┤
//!         │  mark_failed (attempts < max)              │
//!         └────────────────────────────────────────────┤
//!                                                      │
//!                         mark_succeeded ┌─────────────┴─────────────┐ mark_exhausted
//!                                        ▼                           ▼
//!                                 ┌───────────┐               ┌──────────┐
//!                                 │ SUCCEEDED │               │  FAILED  │
//!                                 └───────────┘               └──────────┘
//! ```
//!
//! # Configuration
//!
//! See [`config`] for the full list of environment variables. The most
//! important ones:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `PLATFORM_SYNC_DATABASE_URL` | Yes* | - | PostgreSQL connection string |
//! | `DATABASE_URL` | Yes* | - | Fallback if above not set |
//! | `PLATFORM_SYNC_EXTERNAL_URL` | Yes | - | Control plane gateway base URL |
//! | `PLATFORM_SYNC_HEALTH_PORT` | No | `8080` | Health probe port |
//! | `PLATFORM_SYNC_MAX_RETRIES` | No | `5` | Attempts before an item is failed |
//!
//! # Modules
//!
//! - [`naming`]: Deterministic, length-bounded external identifiers
//! - [`backoff`]: Exponential retry delays
//! - [`model`]: Outbox items, subjects, entity snapshots and audit events
//! - [`external`]: External control plane client contract and adapters
//! - [`store`]: Claim store and entity reads (PostgreSQL and in-memory)
//! - [`notify`]: Push notification subscriptions
//! - [`worker`]: Sync worker event loop and dispatch
//! - [`status_poller`]: Asynchronous reconciliation progress polling
//! - [`reconciler`]: Periodic drift detection and healing
//! - [`health`]: Readiness and liveness probes
//! - [`runtime`]: Embeddable runtime wiring all loops together

#![deny(missing_docs)]

/// Database migrations for the sync schema.
///
/// ```ignore
/// use platform_sync::migrations;
///
/// let pool = PgPool::connect(&database_url).await?;
/// migrations::run(&pool).await?;
/// ```
pub mod migrations;

/// Configuration loaded from environment variables.
pub mod config;

/// Error types for sync operations.
pub mod error;

/// Deterministic and unique naming for external resources.
pub mod naming;

/// Exponential backoff policy for failed sync attempts.
pub mod backoff;

/// Outbox items, subjects, snapshots and audit events.
pub mod model;

/// External control plane client contract, HTTP adapter and mock.
pub mod external;

/// Claim store and entity persistence.
pub mod store;

/// Push notification subscriptions (PostgreSQL LISTEN, in-memory).
pub mod notify;

/// Readiness and liveness probes.
pub mod health;

/// Sync worker event loop.
pub mod worker;

/// Background loop polling external reconciliation status.
pub mod status_poller;

/// Background loop healing drift between relational and external state.
pub mod reconciler;

/// Embeddable runtime for the sync engine.
pub mod runtime;

pub use config::{Config, SyncConfig};
pub use error::Error;
