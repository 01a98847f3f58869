// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database migrations for platform-sync.
//!
//! Creates the tenant entity tables (`organizations`, `clusters`,
//! `node_pools`), the `sync_outbox` work queue with its notify trigger, and
//! the `sync_events` audit table.
//!
//! The trigger notifies on the channel stored in `sync_settings`, falling
//! back to `sync_outbox`. [`set_notify_channel`] points it at the channel
//! the workers listen on.
//!
//! # Example
//!
//! ```ignore
//! use sqlx::PgPool;
//! use platform_sync::migrations;
//!
//! let pool = PgPool::connect(&database_url).await?;
//! migrations::run(&pool).await?;
//! migrations::set_notify_channel(&pool, "sync_outbox").await?;
//! ```

use sqlx::PgPool;
use sqlx::migrate::{MigrateError, Migrator};

/// Migrations embedded at compile time.
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Run all migrations.
///
/// Safe to call multiple times; already-applied migrations are skipped.
pub async fn run(pool: &PgPool) -> Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}

/// Make the outbox insert trigger notify on `channel`.
pub async fn set_notify_channel(pool: &PgPool, channel: &str) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO sync_settings (name, value)
        VALUES ('notify_channel', $1)
        ON CONFLICT (name) DO UPDATE SET value = EXCLUDED.value
        "#,
    )
    .bind(channel)
    .execute(pool)
    .await?;
    Ok(())
}
