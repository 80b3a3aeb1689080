//! Zap receipt lookup.
//!
//! Resolves a Lightning payment to the Nostr zap request that caused it. The
//! [`ReceiptCoordinator`] races a set of relays for the zap receipt whose
//! `bolt11` tag equals the paid invoice; [`match_receipt`] decides, for each
//! event a relay returns, whether it is that receipt. [`ZapEnricher`] applies
//! both to a wallet's payment history, consulting the [`PendingZapStore`]
//! first for zaps the wallet sent itself.

pub mod types;
pub mod matcher;
pub mod relay;
pub mod mock_relay;
pub mod metrics;
pub mod coordinator;
pub mod pending;
pub mod enricher;

pub use types::{
    BranchOutcome, BranchReport, LookupConfig, MatchResult, QueryError, QueryParams, QueryReport,
    ReceiptFilter, ReceiptLookup, RejectReason, DEFAULT_RELAYS,
};

pub use coordinator::ReceiptCoordinator;
pub use enricher::{EnrichedPayment, EnrichmentSource, ZapEnricher};
pub use matcher::match_receipt;
pub use metrics::{LookupMetrics, MetricsSnapshot};
pub use mock_relay::{MockRelay, MockRelayNetwork};
pub use pending::{PendingZap, PendingZapStore};
pub use relay::{RelayConnection, RelayConnector, RelayError, RelayFrame, RelaySubscription};

use std::sync::Arc;

/// Builder for a [`ReceiptCoordinator`] with sensible defaults.
pub struct LookupBuilder {
    config: LookupConfig,
}

impl LookupBuilder {
    /// Create a new builder with default configuration.
    pub fn new() -> Self {
        Self {
            config: LookupConfig::default(),
        }
    }

    /// Start from an existing configuration.
    pub fn from_config(config: LookupConfig) -> Self {
        Self { config }
    }

    /// Set the default relays.
    pub fn with_relays(mut self, relays: Vec<String>) -> Self {
        self.config.relays = relays;
        self
    }

    /// Set the per-relay and overall timeouts in milliseconds.
    pub fn with_timeouts(mut self, per_relay_ms: u64, overall_ms: u64) -> Self {
        self.config.per_relay_timeout_ms = per_relay_ms;
        self.config.overall_timeout_ms = overall_ms;
        self
    }

    /// Set how many receipts each relay is asked for.
    pub fn with_result_limit(mut self, limit: usize) -> Self {
        self.config.result_limit = limit;
        self
    }

    /// Set how many queries a batch runs at once.
    pub fn with_max_parallel_queries(mut self, max_queries: usize) -> Self {
        self.config.max_parallel_queries = max_queries;
        self
    }

    /// Set pending zap expiry and capacity.
    pub fn with_pending_store(mut self, ttl_seconds: u64, max_entries: u64) -> Self {
        self.config.pending_ttl_seconds = ttl_seconds;
        self.config.pending_max_entries = max_entries;
        self
    }

    /// Build the configuration.
    pub fn build_config(self) -> LookupConfig {
        self.config
    }

    /// Build a coordinator on top of `connector`.
    ///
    /// Fails if the configured defaults could never run a query.
    pub fn build(
        self,
        connector: Arc<dyn RelayConnector>,
    ) -> Result<ReceiptCoordinator, QueryError> {
        let params = self.config.query_params();
        if params.relays.iter().all(|relay| relay.trim().is_empty()) {
            return Err(QueryError::EmptyRelayList);
        }
        if params.per_relay_timeout.is_zero() {
            return Err(QueryError::ZeroLimit("per-relay timeout"));
        }
        if params.overall_timeout.is_zero() {
            return Err(QueryError::ZeroLimit("overall timeout"));
        }
        if params.result_limit == 0 {
            return Err(QueryError::ZeroLimit("result limit"));
        }
        Ok(ReceiptCoordinator::new(connector, self.config))
    }
}

impl Default for LookupBuilder {
    fn default() -> Self {
        Self::new()
    }
}
