//! In-memory relay network.
//!
//! Scripted relays for the demo binary and for tests. Each relay decides how
//! it answers a connect and which frames it sends at which offset after a
//! subscription opens. The network counts opened and closed connections so
//! leaks show up in assertions.

use crate::receipts::relay::{
    RelayConnection, RelayConnector, RelayError, RelayFrame, RelaySubscription, Result,
};
use crate::receipts::types::ReceiptFilter;
use crate::types::NostrEvent;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, trace};

#[derive(Debug, Clone)]
enum ConnectBehaviour {
    Accept { delay: Duration },
    Refuse,
    Hang,
}

/// Script for one relay.
#[derive(Debug, Clone)]
pub struct MockRelay {
    connect: ConnectBehaviour,
    /// Frames with their offset from the moment the subscription opened
    script: Vec<(Duration, Result<RelayFrame>)>,
    /// Keep the subscription open after the script, like a live relay
    hold_open: bool,
}

impl Default for MockRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRelay {
    /// Accepts immediately, sends nothing and keeps the subscription open.
    pub fn new() -> Self {
        Self {
            connect: ConnectBehaviour::Accept { delay: Duration::ZERO },
            script: Vec::new(),
            hold_open: true,
        }
    }

    pub fn connect_after(mut self, delay: Duration) -> Self {
        self.connect = ConnectBehaviour::Accept { delay };
        self
    }

    /// Every connect attempt fails.
    pub fn refusing() -> Self {
        Self {
            connect: ConnectBehaviour::Refuse,
            ..Self::new()
        }
    }

    /// Connect attempts never complete.
    pub fn hanging() -> Self {
        Self {
            connect: ConnectBehaviour::Hang,
            ..Self::new()
        }
    }

    pub fn event_at(self, at: Duration, event: &NostrEvent) -> Self {
        // Serialising a plain struct of strings and integers cannot fail
        let raw = serde_json::to_string(event).unwrap_or_default();
        self.raw_at(at, raw)
    }

    /// Send an arbitrary event payload, including ones that do not parse.
    pub fn raw_at(mut self, at: Duration, raw: impl Into<String>) -> Self {
        self.script.push((at, Ok(RelayFrame::Event(raw.into()))));
        self
    }

    pub fn eose_at(mut self, at: Duration) -> Self {
        self.script.push((at, Ok(RelayFrame::EndOfStoredEvents)));
        self
    }

    pub fn notice_at(mut self, at: Duration, message: impl Into<String>) -> Self {
        self.script.push((at, Ok(RelayFrame::Notice(message.into()))));
        self
    }

    pub fn closed_at(mut self, at: Duration, reason: impl Into<String>) -> Self {
        self.script.push((at, Ok(RelayFrame::Closed(reason.into()))));
        self
    }

    /// Break the subscription with a protocol error.
    pub fn error_at(mut self, at: Duration, message: impl Into<String>) -> Self {
        self.script.push((at, Err(RelayError::Protocol(message.into()))));
        self
    }

    /// End the stream once the script is exhausted instead of holding it open.
    pub fn then_hang_up(mut self) -> Self {
        self.hold_open = false;
        self
    }
}

#[derive(Debug, Default)]
struct NetworkStats {
    opened: AtomicUsize,
    closed: AtomicUsize,
    filters: Mutex<Vec<(String, ReceiptFilter)>>,
    delivered: Mutex<HashMap<String, usize>>,
}

/// A set of scripted relays addressed by URL.
#[derive(Debug, Default)]
pub struct MockRelayNetwork {
    relays: Mutex<HashMap<String, MockRelay>>,
    stats: Arc<NetworkStats>,
}

impl MockRelayNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_relay(mut self, address: impl Into<String>, relay: MockRelay) -> Self {
        self.relays.get_mut().insert(address.into(), relay);
        self
    }

    /// Connections currently open.
    pub fn open_connections(&self) -> usize {
        self.opened_total() - self.closed_total()
    }

    pub fn opened_total(&self) -> usize {
        self.stats.opened.load(Ordering::SeqCst)
    }

    pub fn closed_total(&self) -> usize {
        self.stats.closed.load(Ordering::SeqCst)
    }

    /// Filters received by `address`, in subscription order.
    pub async fn filters_for(&self, address: &str) -> Vec<ReceiptFilter> {
        self.stats
            .filters
            .lock()
            .await
            .iter()
            .filter(|(relay, _)| relay == address)
            .map(|(_, filter)| filter.clone())
            .collect()
    }

    /// Frames `address` actually delivered to subscribers.
    pub async fn frames_delivered(&self, address: &str) -> usize {
        self.stats
            .delivered
            .lock()
            .await
            .get(address)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl RelayConnector for MockRelayNetwork {
    async fn connect(&self, relay: &str) -> Result<Box<dyn RelayConnection>> {
        let script = self.relays.lock().await.get(relay).cloned();
        let script = script.ok_or_else(|| RelayError::Connect {
            relay: relay.to_string(),
            reason: "unknown host".to_string(),
        })?;

        match script.connect {
            ConnectBehaviour::Refuse => Err(RelayError::Connect {
                relay: relay.to_string(),
                reason: "connection refused".to_string(),
            }),
            ConnectBehaviour::Hang => futures::future::pending().await,
            ConnectBehaviour::Accept { delay } => {
                if !delay.is_zero() {
                    sleep(delay).await;
                }
                self.stats.opened.fetch_add(1, Ordering::SeqCst);
                debug!("Mock relay {} accepted a connection", relay);
                Ok(Box::new(MockConnection {
                    relay: relay.to_string(),
                    script: script.script,
                    hold_open: script.hold_open,
                    stats: self.stats.clone(),
                    closed: false,
                }))
            }
        }
    }
}

struct MockConnection {
    relay: String,
    script: Vec<(Duration, Result<RelayFrame>)>,
    hold_open: bool,
    stats: Arc<NetworkStats>,
    closed: bool,
}

#[async_trait]
impl RelayConnection for MockConnection {
    async fn subscribe(&mut self, filter: &ReceiptFilter) -> Result<RelaySubscription> {
        if self.closed {
            return Err(RelayError::Subscribe("connection closed".to_string()));
        }
        self.stats
            .filters
            .lock()
            .await
            .push((self.relay.clone(), filter.clone()));

        let opened_at = Instant::now();
        let relay = self.relay.clone();
        let stats = self.stats.clone();
        let frames = stream::iter(self.script.clone()).then(move |(at, frame)| {
            let relay = relay.clone();
            let stats = stats.clone();
            async move {
                sleep_until(opened_at + at).await;
                *stats.delivered.lock().await.entry(relay.clone()).or_insert(0) += 1;
                trace!("Mock relay {} delivering {:?}", relay, frame);
                frame
            }
        });

        let frames = if self.hold_open {
            frames.chain(stream::pending()).boxed()
        } else {
            frames.boxed()
        };
        Ok(RelaySubscription::new(frames))
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.stats.closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}
