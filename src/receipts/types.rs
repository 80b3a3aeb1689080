//! Types for the receipt lookup: configuration, filters, results and reports.

use crate::types::{Pubkey, ZAP_RECEIPT_KIND};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Relays queried when the caller does not supply its own list.
pub const DEFAULT_RELAYS: [&str; 4] = [
    "wss://relay.damus.io",
    "wss://nos.lol",
    "wss://relay.nostr.band",
    "wss://relay.primal.net",
];

/// Decoded zap receipt, owned by the caller once returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchResult {
    /// Author of the zap request
    pub sender: Pubkey,
    /// Value of the receipt's `p` tag
    pub recipient: Pubkey,
    /// Zapped event; `None` for a profile zap
    pub subject_event_id: Option<String>,
    /// Zap request content, empty when the sender left none
    pub comment: String,
}

/// Result of a single lookup. Not finding a receipt is an ordinary outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiptLookup {
    Found(MatchResult),
    NotFound,
}

impl ReceiptLookup {
    pub fn into_match(self) -> Option<MatchResult> {
        match self {
            ReceiptLookup::Found(result) => Some(result),
            ReceiptLookup::NotFound => None,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, ReceiptLookup::Found(_))
    }
}

/// Why a candidate event was not accepted as the receipt.
///
/// Variants follow the order in which the matcher checks them; a record is
/// always rejected with the first gate it fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("no bolt11 tag")]
    MissingFingerprint,
    #[error("bolt11 does not match the invoice")]
    FingerprintMismatch,
    #[error("no description tag")]
    MissingDescription,
    #[error("description is not a zap request")]
    MalformedDescription,
    #[error("description has the wrong kind")]
    WrongKind,
    #[error("no p tag")]
    MissingRecipient,
    #[error("zap request has no pubkey")]
    MissingSender,
}

/// Input problems reported to the caller before any relay is contacted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("no relays to query")]
    EmptyRelayList,
    #[error("blank relay address at position {0}")]
    InvalidRelayAddress(usize),
    #[error("invoice fingerprint is empty or contains whitespace")]
    InvalidFingerprint,
    #[error("recipient pubkey is empty")]
    InvalidRecipient,
    #[error("{0} must be greater than zero")]
    ZeroLimit(&'static str),
}

/// The zap request embedded in a receipt's `description` tag.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ZapRequest {
    pub kind: u32,
    #[serde(default)]
    pub pubkey: Option<Pubkey>,
    #[serde(default)]
    pub content: Option<String>,
}

/// Subscription filter sent to every relay of a query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptFilter {
    pub kinds: Vec<u32>,
    #[serde(rename = "#p")]
    pub recipients: Vec<Pubkey>,
    pub limit: usize,
}

impl ReceiptFilter {
    /// Zap receipts addressed to `recipient`, capped at `limit` most recent.
    pub fn zap_receipts_for(recipient: &str, limit: usize) -> Self {
        Self {
            kinds: vec![ZAP_RECEIPT_KIND],
            recipients: vec![recipient.to_string()],
            limit,
        }
    }
}

/// Lookup configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LookupConfig {
    /// Relays queried by default
    pub relays: Vec<String>,
    /// Per-relay timeout in milliseconds
    pub per_relay_timeout_ms: u64,
    /// Overall query timeout in milliseconds
    pub overall_timeout_ms: u64,
    /// Most recent receipts requested from each relay
    pub result_limit: usize,
    /// Queries run at once by the batch variant
    pub max_parallel_queries: usize,
    /// Lifetime of a pending zap in seconds
    pub pending_ttl_seconds: u64,
    /// Maximum pending zaps kept
    pub pending_max_entries: u64,
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            relays: DEFAULT_RELAYS.iter().map(|relay| relay.to_string()).collect(),
            per_relay_timeout_ms: 5_000,
            overall_timeout_ms: 10_000,
            result_limit: 50,
            max_parallel_queries: 8,
            pending_ttl_seconds: 600,
            pending_max_entries: 1_000,
        }
    }
}

impl LookupConfig {
    /// Load a JSON configuration; absent fields keep their defaults.
    pub fn from_json_str(raw: &str) -> anyhow::Result<Self> {
        let config = serde_json::from_str(raw)?;
        Ok(config)
    }

    /// Per-call parameters seeded from this configuration.
    pub fn query_params(&self) -> QueryParams {
        QueryParams {
            relays: self.relays.clone(),
            per_relay_timeout: Duration::from_millis(self.per_relay_timeout_ms),
            overall_timeout: Duration::from_millis(self.overall_timeout_ms),
            result_limit: self.result_limit,
        }
    }
}

/// Parameters of one query. Every field can be overridden per call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryParams {
    pub relays: Vec<String>,
    pub per_relay_timeout: Duration,
    pub overall_timeout: Duration,
    pub result_limit: usize,
}

impl Default for QueryParams {
    fn default() -> Self {
        LookupConfig::default().query_params()
    }
}

impl QueryParams {
    pub fn with_relays<I, S>(mut self, relays: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.relays = relays.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeouts(mut self, per_relay: Duration, overall: Duration) -> Self {
        self.per_relay_timeout = per_relay;
        self.overall_timeout = overall;
        self
    }

    pub fn with_result_limit(mut self, limit: usize) -> Self {
        self.result_limit = limit;
        self
    }
}

/// Terminal state of one relay branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchOutcome {
    Matched(MatchResult),
    /// Relay sent end-of-stored-events (or hit the result cap) without a match
    Drained,
    /// Connect, subscribe or stream error
    Failed(String),
    TimedOut,
    Cancelled,
}

impl BranchOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            BranchOutcome::Matched(_) => "matched",
            BranchOutcome::Drained => "drained",
            BranchOutcome::Failed(_) => "failed",
            BranchOutcome::TimedOut => "timed_out",
            BranchOutcome::Cancelled => "cancelled",
        }
    }
}

/// Diagnostics for one relay branch.
#[derive(Debug, Clone)]
pub struct BranchReport {
    pub relay: String,
    pub outcome: BranchOutcome,
    /// Events received from the relay
    pub records_seen: usize,
    /// Events dropped as unparseable or rejected by the matcher
    pub records_rejected: usize,
    pub elapsed: Duration,
}

/// Diagnostics for a whole query.
#[derive(Debug, Clone)]
pub struct QueryReport {
    pub outcome: ReceiptLookup,
    /// Relay whose copy of the receipt won the race
    pub winning_relay: Option<String>,
    pub branches: Vec<BranchReport>,
    pub elapsed: Duration,
}

impl QueryReport {
    pub fn branch(&self, relay: &str) -> Option<&BranchReport> {
        self.branches.iter().find(|branch| branch.relay == relay)
    }
}
