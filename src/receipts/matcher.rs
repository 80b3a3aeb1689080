//! Zap receipt matcher.
//!
//! Decides whether one event is the receipt for a given invoice and decodes
//! it. Pure and synchronous: the same inputs always give the same answer.

use crate::receipts::types::{MatchResult, RejectReason, ZapRequest};
use crate::types::{InvoiceFingerprint, NostrEvent, ZAP_REQUEST_KIND};

/// Match `record` against `fingerprint`.
///
/// The bolt11 comparison runs before any JSON parsing.
pub fn match_receipt(
    record: &NostrEvent,
    fingerprint: &InvoiceFingerprint,
) -> Result<MatchResult, RejectReason> {
    let bolt11 = record
        .tag_value("bolt11")
        .ok_or(RejectReason::MissingFingerprint)?;
    if bolt11 != fingerprint.as_str() {
        return Err(RejectReason::FingerprintMismatch);
    }

    let description = record
        .tag_value("description")
        .ok_or(RejectReason::MissingDescription)?;
    let request: ZapRequest =
        serde_json::from_str(description).map_err(|_| RejectReason::MalformedDescription)?;
    if request.kind != ZAP_REQUEST_KIND {
        return Err(RejectReason::WrongKind);
    }

    let recipient = record
        .tag_value("p")
        .ok_or(RejectReason::MissingRecipient)?;

    let sender = request
        .pubkey
        .filter(|pubkey| !pubkey.is_empty())
        .ok_or(RejectReason::MissingSender)?;

    Ok(MatchResult {
        sender,
        recipient: recipient.to_string(),
        subject_event_id: record.tag_value("e").map(str::to_string),
        comment: request.content.unwrap_or_default(),
    })
}
