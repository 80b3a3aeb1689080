//! Pending zap store.
//!
//! When the wallet sends a zap it already knows who it zapped and why. That
//! metadata is recorded here under the invoice it paid, so outgoing zaps can
//! be enriched without asking any relay. Entries expire after a fixed TTL;
//! nothing survives a restart.

use crate::receipts::types::{LookupConfig, MatchResult};
use crate::types::{InvoiceFingerprint, Pubkey};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Locally known zap request metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingZap {
    pub sender: Pubkey,
    pub recipient: Pubkey,
    pub subject_event_id: Option<String>,
    pub comment: String,
    /// Unix timestamp in seconds
    pub created_at: i64,
}

impl PendingZap {
    pub fn new(sender: impl Into<Pubkey>, recipient: impl Into<Pubkey>) -> Self {
        Self {
            sender: sender.into(),
            recipient: recipient.into(),
            subject_event_id: None,
            comment: String::new(),
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn with_subject(mut self, event_id: impl Into<String>) -> Self {
        self.subject_event_id = Some(event_id.into());
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }
}

impl From<PendingZap> for MatchResult {
    fn from(zap: PendingZap) -> Self {
        MatchResult {
            sender: zap.sender,
            recipient: zap.recipient,
            subject_event_id: zap.subject_event_id,
            comment: zap.comment,
        }
    }
}

/// Caller-owned store of pending zaps keyed by invoice.
#[derive(Clone)]
pub struct PendingZapStore {
    entries: Cache<InvoiceFingerprint, PendingZap>,
}

impl PendingZapStore {
    pub fn new(ttl: Duration, max_entries: u64) -> Self {
        let entries = Cache::builder()
            .max_capacity(max_entries)
            .time_to_live(ttl)
            .build();
        Self { entries }
    }

    pub fn from_config(config: &LookupConfig) -> Self {
        Self::new(
            Duration::from_secs(config.pending_ttl_seconds),
            config.pending_max_entries,
        )
    }

    /// Remember the zap paid with `invoice`, replacing any earlier entry.
    pub async fn record(&self, invoice: InvoiceFingerprint, zap: PendingZap) {
        debug!("Recorded pending zap for {}", invoice);
        self.entries.insert(invoice, zap).await;
    }

    pub async fn get(&self, invoice: &InvoiceFingerprint) -> Option<PendingZap> {
        self.entries.get(invoice).await
    }

    /// Resolve `invoice` locally, as the relay lookup would have.
    pub async fn resolve(&self, invoice: &InvoiceFingerprint) -> Option<MatchResult> {
        self.get(invoice).await.map(MatchResult::from)
    }

    pub async fn remove(&self, invoice: &InvoiceFingerprint) -> Option<PendingZap> {
        self.entries.remove(invoice).await
    }

    pub fn clear(&self) {
        self.entries.invalidate_all();
    }

    /// Entries currently held. Approximate until pending maintenance has run.
    pub async fn len(&self) -> u64 {
        self.entries.run_pending_tasks().await;
        self.entries.entry_count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
