//! Relay boundary.
//!
//! Branches reach the Nostr network only through [`RelayConnector`] and
//! [`RelayConnection`]. A connection is always held inside a
//! [`ConnectionGuard`] so it gets closed on every exit path, including a
//! branch future being dropped mid-await.

use crate::receipts::types::ReceiptFilter;
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use thiserror::Error;
use tracing::debug;

pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors raised by a relay. They never leave the branch that hit them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("connect to {relay} failed: {reason}")]
    Connect { relay: String, reason: String },
    #[error("subscription rejected: {0}")]
    Subscribe(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// One frame of a relay subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayFrame {
    /// Raw event object, not yet validated
    Event(String),
    /// End of stored events (`EOSE`)
    EndOfStoredEvents,
    Notice(String),
    /// Relay closed the subscription (`CLOSED`)
    Closed(String),
}

/// Frames of one subscription. Dropping it tears the subscription down.
pub struct RelaySubscription {
    inner: BoxStream<'static, Result<RelayFrame>>,
}

impl RelaySubscription {
    pub fn new(inner: BoxStream<'static, Result<RelayFrame>>) -> Self {
        Self { inner }
    }

    pub async fn next(&mut self) -> Option<Result<RelayFrame>> {
        self.inner.next().await
    }
}

/// Opens connections to relays by address.
#[async_trait]
pub trait RelayConnector: Send + Sync {
    async fn connect(&self, relay: &str) -> Result<Box<dyn RelayConnection>>;
}

/// An open relay connection.
#[async_trait]
pub trait RelayConnection: Send {
    async fn subscribe(&mut self, filter: &ReceiptFilter) -> Result<RelaySubscription>;

    /// Close the connection. Must be idempotent and must not block.
    fn close(&mut self);
}

/// Owns a connection for the lifetime of a branch and closes it on drop.
pub struct ConnectionGuard {
    relay: String,
    connection: Box<dyn RelayConnection>,
}

impl ConnectionGuard {
    pub fn new(relay: impl Into<String>, connection: Box<dyn RelayConnection>) -> Self {
        Self {
            relay: relay.into(),
            connection,
        }
    }

    pub async fn subscribe(&mut self, filter: &ReceiptFilter) -> Result<RelaySubscription> {
        self.connection.subscribe(filter).await
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.connection.close();
        debug!("Closed connection to {}", self.relay);
    }
}
