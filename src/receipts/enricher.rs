//! Payment enrichment.
//!
//! Attaches zap sender/recipient metadata to wallet payments. Outgoing zaps
//! are resolved from the pending zap store, incoming ones by asking relays
//! for receipts addressed to the wallet owner. Payments that are not zaps are
//! passed through untouched.

use crate::receipts::coordinator::ReceiptCoordinator;
use crate::receipts::pending::PendingZapStore;
use crate::receipts::types::{MatchResult, QueryError, QueryParams};
use crate::types::{InvoiceFingerprint, PaymentRecord, PaymentType, Pubkey};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

/// Where a payment's zap metadata came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentSource {
    PendingStore,
    Relays,
}

/// A payment with whatever zap metadata could be found for it.
#[derive(Debug, Clone, Serialize)]
pub struct EnrichedPayment {
    pub payment: PaymentRecord,
    pub zap: Option<MatchResult>,
    pub source: Option<EnrichmentSource>,
}

impl EnrichedPayment {
    fn plain(payment: PaymentRecord) -> Self {
        Self {
            payment,
            zap: None,
            source: None,
        }
    }
}

/// Enriches the payment history of one wallet.
pub struct ZapEnricher {
    coordinator: ReceiptCoordinator,
    pending: PendingZapStore,
    /// Pubkey of the wallet owner; incoming zap receipts are addressed to it
    owner: Pubkey,
}

impl ZapEnricher {
    pub fn new(
        coordinator: ReceiptCoordinator,
        pending: PendingZapStore,
        owner: impl Into<Pubkey>,
    ) -> Self {
        Self {
            coordinator,
            pending,
            owner: owner.into(),
        }
    }

    pub fn pending(&self) -> &PendingZapStore {
        &self.pending
    }

    /// Enrich with the coordinator's configured relays and timeouts.
    pub async fn enrich(
        &self,
        payments: Vec<PaymentRecord>,
    ) -> Result<Vec<EnrichedPayment>, QueryError> {
        let params = self.coordinator.config().query_params();
        self.enrich_with(payments, &params).await
    }

    /// Enrich `payments`, keeping their order.
    #[instrument(skip_all, fields(payments = payments.len()))]
    pub async fn enrich_with(
        &self,
        payments: Vec<PaymentRecord>,
        params: &QueryParams,
    ) -> Result<Vec<EnrichedPayment>, QueryError> {
        let mut enriched = Vec::with_capacity(payments.len());
        let mut to_look_up: Vec<InvoiceFingerprint> = Vec::new();

        for payment in payments {
            if !payment.is_zap {
                enriched.push(EnrichedPayment::plain(payment));
                continue;
            }

            if let Some(result) = self.pending.resolve(&payment.invoice).await {
                debug!("Payment {} resolved from the pending store", payment.id);
                enriched.push(EnrichedPayment {
                    payment,
                    zap: Some(result),
                    source: Some(EnrichmentSource::PendingStore),
                });
                continue;
            }

            match payment.payment_type {
                PaymentType::Receive if payment.invoice.is_well_formed() => {
                    to_look_up.push(payment.invoice.clone());
                }
                PaymentType::Receive => {
                    warn!("Payment {} carries an unusable invoice, skipping lookup", payment.id);
                }
                PaymentType::Send => {
                    // The counterparty is unknown without the pending entry
                    debug!("Outgoing zap {} has no pending entry", payment.id);
                }
            }
            enriched.push(EnrichedPayment::plain(payment));
        }

        if to_look_up.is_empty() {
            return Ok(enriched);
        }

        let matches = self
            .coordinator
            .query_batch(&to_look_up, &self.owner, params)
            .await?;

        let awaiting_relays = |entry: &&mut EnrichedPayment| {
            entry.source.is_none()
                && entry.payment.is_zap
                && entry.payment.payment_type == PaymentType::Receive
        };
        for entry in enriched.iter_mut().filter(awaiting_relays) {
            if let Some(result) = matches.get(&entry.payment.invoice) {
                entry.zap = Some(result.clone());
                entry.source = Some(EnrichmentSource::Relays);
            }
        }

        info!(
            "Enriched {} incoming zaps from relays ({} looked up)",
            matches.len(),
            to_look_up.len()
        );
        Ok(enriched)
    }
}
