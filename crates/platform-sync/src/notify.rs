// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Push notification subscriptions.
//!
//! Notifications only wake the worker. Payloads are advisory and may be
//! missing, duplicated or coalesced; the worker always drains the whole
//! queue after waking.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Error, Result};

/// A received notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Channel the notification arrived on.
    pub channel: String,
    /// Advisory payload, usually an entity id.
    pub payload: String,
}

/// Source of push-notification subscriptions.
#[async_trait]
pub trait NotificationSource: Send + Sync {
    /// Open a new subscription. Each call opens a fresh connection.
    async fn subscribe(&self) -> Result<Box<dyn Subscription>>;
}

/// An active subscription.
#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next notification.
    ///
    /// Returns [`Error::SubscriptionLost`] (or another connection error) when
    /// the underlying connection is gone; the subscription is unusable after.
    async fn recv(&mut self) -> Result<Notification>;
}

// ============================================================================
// PostgreSQL LISTEN/NOTIFY
// ============================================================================

/// `LISTEN`-based notification source.
#[derive(Clone)]
pub struct PgNotificationSource {
    pool: PgPool,
    channel: String,
}

impl PgNotificationSource {
    /// Listen on `channel` using connections from `pool`.
    pub fn new(pool: PgPool, channel: impl Into<String>) -> Self {
        Self {
            pool,
            channel: channel.into(),
        }
    }
}

struct PgSubscription {
    listener: PgListener,
}

#[async_trait]
impl NotificationSource for PgNotificationSource {
    async fn subscribe(&self) -> Result<Box<dyn Subscription>> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(&self.channel).await?;
        debug!(channel = %self.channel, "LISTEN established");
        Ok(Box::new(PgSubscription { listener }))
    }
}

#[async_trait]
impl Subscription for PgSubscription {
    async fn recv(&mut self) -> Result<Notification> {
        // Ok(None) means the connection dropped; recv() would reconnect silently.
        match self.listener.try_recv().await? {
            Some(notification) => Ok(Notification {
                channel: notification.channel().to_string(),
                payload: notification.payload().to_string(),
            }),
            None => Err(Error::SubscriptionLost(
                "notification connection closed".to_string(),
            )),
        }
    }
}

// ============================================================================
// In-memory
// ============================================================================

#[derive(Default)]
struct InMemoryState {
    subscribers: Vec<mpsc::UnboundedSender<Notification>>,
    failing_subscribes: u32,
    subscriptions: usize,
}

/// In-process notification source for tests and embedding.
///
/// [`InMemoryNotifications::disconnect`] drops every live subscription, which
/// subscribers observe as a lost connection.
#[derive(Clone, Default)]
pub struct InMemoryNotifications {
    channel: String,
    state: Arc<Mutex<InMemoryState>>,
}

impl InMemoryNotifications {
    /// Create a source for `channel`.
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            state: Arc::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, InMemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Deliver a notification to every live subscription.
    pub fn notify(&self, payload: &str) {
        let notification = Notification {
            channel: self.channel.clone(),
            payload: payload.to_string(),
        };
        self.lock()
            .subscribers
            .retain(|tx| tx.send(notification.clone()).is_ok());
    }

    /// Drop every live subscription.
    pub fn disconnect(&self) {
        self.lock().subscribers.clear();
    }

    /// Make the next `n` subscribe attempts fail.
    pub fn fail_next_subscribes(&self, n: u32) {
        self.lock().failing_subscribes = n;
    }

    /// Number of successful subscribe calls so far.
    pub fn subscriptions(&self) -> usize {
        self.lock().subscriptions
    }
}

struct InMemorySubscription {
    rx: mpsc::UnboundedReceiver<Notification>,
}

#[async_trait]
impl NotificationSource for InMemoryNotifications {
    async fn subscribe(&self) -> Result<Box<dyn Subscription>> {
        let mut state = self.lock();
        if state.failing_subscribes > 0 {
            state.failing_subscribes -= 1;
            return Err(Error::SubscriptionLost("subscribe refused".to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.subscribers.push(tx);
        state.subscriptions += 1;
        Ok(Box::new(InMemorySubscription { rx }))
    }
}

#[async_trait]
impl Subscription for InMemorySubscription {
    async fn recv(&mut self) -> Result<Notification> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| Error::SubscriptionLost("subscription dropped".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_delivers_to_all_subscribers() {
        let source = InMemoryNotifications::new("sync_outbox");
        let mut a = source.subscribe().await.unwrap();
        let mut b = source.subscribe().await.unwrap();

        source.notify("abc");

        assert_eq!(a.recv().await.unwrap().payload, "abc");
        let n = b.recv().await.unwrap();
        assert_eq!(n.channel, "sync_outbox");
        assert_eq!(n.payload, "abc");
        assert_eq!(source.subscriptions(), 2);
    }

    #[tokio::test]
    async fn test_disconnect_is_a_connection_error() {
        let source = InMemoryNotifications::new("sync_outbox");
        let mut sub = source.subscribe().await.unwrap();

        source.disconnect();

        let err = sub.recv().await.unwrap_err();
        assert!(err.is_connection_error());
    }

    #[tokio::test]
    async fn test_failing_subscribes() {
        let source = InMemoryNotifications::new("sync_outbox");
        source.fail_next_subscribes(1);

        assert!(source.subscribe().await.is_err());
        assert!(source.subscribe().await.is_ok());
        assert_eq!(source.subscriptions(), 1);
    }
}
