//! Core types shared by the zap receipt lookup.
//!
//! Nostr events as they arrive from relays, the invoice fingerprint used to
//! correlate them with payments, and the payment records handed over by the
//! wallet SDK.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A Nostr public key in hex (kept as a string, nothing here verifies it).
pub type Pubkey = String;

/// Kind of a zap request (NIP-57), embedded in a receipt's `description` tag.
pub const ZAP_REQUEST_KIND: u32 = 9734;

/// Kind of a zap receipt published by the recipient's LNURL server.
pub const ZAP_RECEIPT_KIND: u32 = 9735;

/// A BOLT-11 invoice used as an exact-match correlation key.
///
/// Nothing inside the crate decodes the invoice; equality is plain string equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvoiceFingerprint(String);

impl InvoiceFingerprint {
    pub fn new(invoice: impl Into<String>) -> Self {
        Self(invoice.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// A fingerprint is usable when it is non-empty and has no whitespace.
    pub fn is_well_formed(&self) -> bool {
        !self.0.is_empty() && !self.0.chars().any(char::is_whitespace)
    }
}

impl fmt::Display for InvoiceFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Invoices are long, the prefix is enough to tell them apart in logs
        let shown: String = self.0.chars().take(24).collect();
        if shown.len() < self.0.len() {
            write!(f, "{}…", shown)
        } else {
            f.write_str(&self.0)
        }
    }
}

impl From<&str> for InvoiceFingerprint {
    fn from(invoice: &str) -> Self {
        Self::new(invoice)
    }
}

impl From<String> for InvoiceFingerprint {
    fn from(invoice: String) -> Self {
        Self(invoice)
    }
}

/// Event tag preserving all of its fields: `["key", "value", ...]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tag(pub Vec<String>);

impl Tag {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(fields.into_iter().map(Into::into).collect())
    }

    pub fn key(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }
}

/// A Nostr event received from a relay.
///
/// Only `pubkey`, `kind`, `tags` and `content` are required on the wire.
/// Signatures are not verified here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NostrEvent {
    #[serde(default)]
    pub id: String,
    pub pubkey: Pubkey,
    #[serde(default)]
    pub created_at: u64,
    pub kind: u32,
    pub tags: Vec<Tag>,
    pub content: String,
    #[serde(default)]
    pub sig: String,
}

impl NostrEvent {
    /// Parse a raw event object as delivered inside a relay `EVENT` frame.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Value of the first tag with `key` that actually carries a value.
    pub fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .filter(|tag| tag.key() == Some(key))
            .find_map(Tag::value)
    }
}

/// Direction of a wallet payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentType {
    Send,
    Receive,
}

/// A payment as reported by the wallet SDK.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRecord {
    /// Wallet-side payment identifier
    pub id: String,
    /// BOLT-11 invoice the payment settled
    pub invoice: InvoiceFingerprint,
    pub payment_type: PaymentType,
    /// Whether the wallet flagged the payment as a zap
    pub is_zap: bool,
    pub amount_msat: u64,
    /// Unix timestamp in seconds
    pub timestamp: u64,
}
