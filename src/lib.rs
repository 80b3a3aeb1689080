//! zap-receipts - zap receipt lookup for a Nostr-enabled Lightning wallet
//!
//! This crate enriches wallet payment history with the sender, recipient and
//! comment of the Nostr zap that caused each payment, by racing several
//! relays for the matching zap receipt.

pub mod types;
pub mod receipts;

// Re-export main types for convenience
pub use types::{InvoiceFingerprint, NostrEvent, PaymentRecord, PaymentType, Tag};
