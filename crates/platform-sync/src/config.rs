// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for platform-sync.
//!
//! [`Config`] holds deployment settings (database, control plane endpoint,
//! health port). [`SyncConfig`] holds the engine tunables and can be built
//! without touching the environment, which is how tests and embedders use it.
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `PLATFORM_SYNC_DATABASE_URL` | - | PostgreSQL URL (falls back to `DATABASE_URL`) |
//! | `PLATFORM_SYNC_EXTERNAL_URL` | - | Control plane gateway base URL |
//! | `PLATFORM_SYNC_EXTERNAL_TOKEN` | - | Bearer token for the gateway |
//! | `PLATFORM_SYNC_HEALTH_PORT` | `8080` | Health probe HTTP port |
//! | `PLATFORM_SYNC_DB_MAX_CONNECTIONS` | `10` | Connection pool size |
//! | `PLATFORM_SYNC_WORKER_ID` | `<hostname>-<random>` | Claim identity |
//! | `PLATFORM_SYNC_CHANNEL` | `sync_outbox` | Notification channel |
//! | `PLATFORM_SYNC_POLL_INTERVAL_SECS` | `30` | Poll fallback when no notification arrives |
//! | `PLATFORM_SYNC_RECONCILE_INTERVAL_SECS` | `300` | Drift reconciliation interval |
//! | `PLATFORM_SYNC_STATUS_INTERVAL_SECS` | `15` | Status poller interval |
//! | `PLATFORM_SYNC_BATCH_SIZE` | `20` | Status checks per poller tick |
//! | `PLATFORM_SYNC_MAX_RETRIES` | `5` | Attempts before an item is failed |
//! | `PLATFORM_SYNC_BASE_BACKOFF_SECS` | `30` | Backoff base delay |
//! | `PLATFORM_SYNC_MAX_BACKOFF_SECS` | `900` | Backoff cap |
//! | `PLATFORM_SYNC_VISIBILITY_TIMEOUT_SECS` | `300` | Claim visibility window |
//! | `PLATFORM_SYNC_RECONNECT_BACKOFF_SECS` | `5` | Sleep after losing the connection |
//! | `PLATFORM_SYNC_SHUTDOWN_TIMEOUT_SECS` | `30` | Grace period for in-flight work |

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::backoff::BackoffPolicy;

/// Channel the outbox insert trigger notifies on.
pub const DEFAULT_CHANNEL: &str = "sync_outbox";

/// Deployment configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection string.
    pub database_url: String,
    /// Base URL of the control plane gateway.
    pub external_url: String,
    /// Optional bearer token for the gateway.
    pub external_token: Option<String>,
    /// Address the health probe server binds to.
    pub health_addr: SocketAddr,
    /// Maximum connections in the database pool.
    pub db_max_connections: u32,
    /// Engine tunables.
    pub sync: SyncConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("PLATFORM_SYNC_DATABASE_URL")
            .or_else(|| lookup("DATABASE_URL"))
            .ok_or(ConfigError::Missing(
                "PLATFORM_SYNC_DATABASE_URL or DATABASE_URL",
            ))?;

        let external_url = lookup("PLATFORM_SYNC_EXTERNAL_URL")
            .ok_or(ConfigError::Missing("PLATFORM_SYNC_EXTERNAL_URL"))?;

        let external_token = lookup("PLATFORM_SYNC_EXTERNAL_TOKEN").filter(|t| !t.is_empty());

        let health_port: u16 = parse_var(&lookup, "PLATFORM_SYNC_HEALTH_PORT", 8080)?;
        let db_max_connections: u32 = parse_var(&lookup, "PLATFORM_SYNC_DB_MAX_CONNECTIONS", 10)?;

        let sync = SyncConfig::from_lookup(&lookup)?;

        Ok(Self {
            database_url,
            external_url,
            external_token,
            health_addr: SocketAddr::from(([0, 0, 0, 0], health_port)),
            db_max_connections,
            sync,
        })
    }
}

/// Engine tunables shared by the worker, status poller and reconciler.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Identity written to `claimed_by`; must be unique per worker process.
    pub worker_id: String,
    /// Notification channel to LISTEN on.
    pub channel: String,
    /// Fallback drain interval when no notification arrives.
    pub poll_interval: Duration,
    /// Interval between drift reconciliation passes.
    pub reconcile_interval: Duration,
    /// Interval between status poller ticks.
    pub status_interval: Duration,
    /// Maximum status checks per poller tick.
    pub batch_size: i64,
    /// Attempts allowed per outbox item before it becomes terminal.
    pub max_retries: i32,
    /// Base delay for retry backoff.
    pub base_backoff: Duration,
    /// Upper bound for retry backoff.
    pub max_backoff: Duration,
    /// How long a claim is honored before another worker may take the item.
    pub visibility_timeout: Duration,
    /// Sleep between losing the connection and resubscribing.
    pub reconnect_backoff: Duration,
    /// Grace period for in-flight work during shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            channel: DEFAULT_CHANNEL.to_string(),
            poll_interval: Duration::from_secs(30),
            reconcile_interval: Duration::from_secs(300), // 5 minutes
            status_interval: Duration::from_secs(15),
            batch_size: 20,
            max_retries: 5,
            base_backoff: Duration::from_secs(30),
            max_backoff: Duration::from_secs(900), // 15 minutes
            visibility_timeout: Duration::from_secs(300),
            reconnect_backoff: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl SyncConfig {
    /// Load engine tunables from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&|key: &str| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: &F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let config = Self {
            worker_id: lookup("PLATFORM_SYNC_WORKER_ID")
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.worker_id),
            channel: lookup("PLATFORM_SYNC_CHANNEL")
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.channel),
            poll_interval: secs_var(
                lookup,
                "PLATFORM_SYNC_POLL_INTERVAL_SECS",
                defaults.poll_interval,
            )?,
            reconcile_interval: secs_var(
                lookup,
                "PLATFORM_SYNC_RECONCILE_INTERVAL_SECS",
                defaults.reconcile_interval,
            )?,
            status_interval: secs_var(
                lookup,
                "PLATFORM_SYNC_STATUS_INTERVAL_SECS",
                defaults.status_interval,
            )?,
            batch_size: parse_var(lookup, "PLATFORM_SYNC_BATCH_SIZE", defaults.batch_size)?,
            max_retries: parse_var(lookup, "PLATFORM_SYNC_MAX_RETRIES", defaults.max_retries)?,
            base_backoff: secs_var(
                lookup,
                "PLATFORM_SYNC_BASE_BACKOFF_SECS",
                defaults.base_backoff,
            )?,
            max_backoff: secs_var(lookup, "PLATFORM_SYNC_MAX_BACKOFF_SECS", defaults.max_backoff)?,
            visibility_timeout: secs_var(
                lookup,
                "PLATFORM_SYNC_VISIBILITY_TIMEOUT_SECS",
                defaults.visibility_timeout,
            )?,
            reconnect_backoff: secs_var(
                lookup,
                "PLATFORM_SYNC_RECONNECT_BACKOFF_SECS",
                defaults.reconnect_backoff,
            )?,
            shutdown_timeout: secs_var(
                lookup,
                "PLATFORM_SYNC_SHUTDOWN_TIMEOUT_SECS",
                defaults.shutdown_timeout,
            )?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject combinations the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retries < 1 {
            return Err(ConfigError::Invalid(
                "PLATFORM_SYNC_MAX_RETRIES",
                "must be at least 1",
            ));
        }
        if self.batch_size < 1 {
            return Err(ConfigError::Invalid(
                "PLATFORM_SYNC_BATCH_SIZE",
                "must be at least 1",
            ));
        }
        if self.max_backoff < self.base_backoff {
            return Err(ConfigError::Invalid(
                "PLATFORM_SYNC_MAX_BACKOFF_SECS",
                "must not be smaller than the base backoff",
            ));
        }
        if self.poll_interval.is_zero() || self.visibility_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "PLATFORM_SYNC_POLL_INTERVAL_SECS",
                "intervals must be positive",
            ));
        }
        Ok(())
    }

    /// Retry backoff derived from the base and cap.
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.base_backoff, self.max_backoff)
    }
}

fn default_worker_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", host, &suffix[..8])
}

fn parse_var<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(key, "not a valid number")),
        None => Ok(default),
    }
}

fn secs_var<F>(lookup: &F, key: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    parse_var(lookup, key, default.as_secs()).map(Duration::from_secs)
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
