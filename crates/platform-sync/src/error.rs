// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for platform-sync.

use thiserror::Error;

use crate::model::OutboxSubject;

/// Sync engine errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failed.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// External control plane call failed.
    #[error("External error: {0}")]
    External(#[from] crate::external::ExternalError),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The entity referenced by an outbox item does not exist.
    #[error("Subject not found: {0}")]
    SubjectNotFound(OutboxSubject),

    /// Outbox item was not found.
    #[error("Outbox item not found: {0}")]
    OutboxItemNotFound(i64),

    /// The claim on an outbox item is now held by someone else, or was
    /// released, so the outcome was not recorded.
    #[error("Claim on outbox item {id} no longer held by {worker_id}")]
    ClaimLost {
        /// Outbox item id.
        id: i64,
        /// Worker that tried to record the outcome.
        worker_id: String,
    },

    /// The external container accepted the request but is not ready yet.
    #[error("Container not ready: {0}")]
    ContainerNotReady(String),

    /// A stored record could not be decoded.
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// The notification subscription was lost.
    #[error("Subscription lost: {0}")]
    SubscriptionLost(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether this error means the database connection (or the notification
    /// stream riding on it) is gone.
    ///
    /// Connection errors end the current listen iteration and send the worker
    /// back through reconnect-with-backoff. Everything else is charged to the
    /// outbox item being processed.
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::Database(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            Self::SubscriptionLost(_) => true,
            _ => false,
        }
    }
}

/// Result type using the sync Error.
pub type Result<T> = std::result::Result<T, Error>;
