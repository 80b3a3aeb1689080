//! Main entry point for the zap receipt lookup demo
//!
//! Runs the lookup and the payment enrichment against simulated relays.
//! Set `ZAP_RECEIPTS_CONFIG` to a JSON file to override the configuration.

use anyhow::{Context, Result};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use zap_receipts::receipts::metrics::{MATCHES_TOTAL, NOT_FOUND_TOTAL, QUERIES_TOTAL};
use zap_receipts::receipts::{
    LookupBuilder, LookupConfig, MockRelay, MockRelayNetwork, PendingZap, PendingZapStore,
    ZapEnricher,
};
use zap_receipts::types::{
    InvoiceFingerprint, NostrEvent, PaymentRecord, PaymentType, Tag, ZAP_RECEIPT_KIND,
};

const OWNER: &str = "abc123wallet";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    info!("Starting zap receipt lookup demo");

    let config = load_config()?;
    let network = Arc::new(build_network(&config.relays));
    let coordinator = LookupBuilder::from_config(config.clone()).build(network.clone())?;

    // Demo: a single lookup with per-relay diagnostics
    let incoming = InvoiceFingerprint::from("lnbc100n1pdemoincoming");
    let report = coordinator
        .query_with_report(&incoming, OWNER, &config.query_params())
        .await?;
    info!("Lookup finished in {:?}: {:?}", report.elapsed, report.outcome);
    for branch in &report.branches {
        info!(
            "  {} -> {} ({} events seen, {} rejected)",
            branch.relay,
            branch.outcome.label(),
            branch.records_seen,
            branch.records_rejected
        );
    }
    info!("Open relay connections after lookup: {}", network.open_connections());

    // Demo: enrich a small payment history
    let pending = PendingZapStore::from_config(&config);
    pending
        .record(
            "lnbc210n1pdemooutgoing".into(),
            PendingZap::new(OWNER, "friendpubkey").with_comment("great thread"),
        )
        .await;

    let enricher = ZapEnricher::new(coordinator.clone(), pending, OWNER);
    let enriched = enricher.enrich(demo_payments()).await?;
    info!("Enriched payments:\n{}", serde_json::to_string_pretty(&enriched)?);

    let snapshot = coordinator.metrics().get_metrics_snapshot().await;
    info!(
        "Metrics - queries: {}, matches: {}, not found: {}",
        snapshot.counter(QUERIES_TOTAL),
        snapshot.counter(MATCHES_TOTAL),
        snapshot.counter(NOT_FOUND_TOTAL)
    );

    Ok(())
}

fn load_config() -> Result<LookupConfig> {
    match std::env::var("ZAP_RECEIPTS_CONFIG") {
        Ok(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path))?;
            LookupConfig::from_json_str(&raw).context("Failed to parse config file")
        }
        Err(_) => Ok(LookupConfig::default()),
    }
}

/// Script one simulated relay per configured address, cycling through behaviours.
fn build_network(relays: &[String]) -> MockRelayNetwork {
    let mut rng = rand::thread_rng();
    let mut network = MockRelayNetwork::new();

    for (i, relay) in relays.iter().enumerate() {
        let latency = Duration::from_millis(rng.gen_range(100..600));
        let script = match i % 4 {
            0 => MockRelay::new()
                .connect_after(latency)
                .event_at(
                    latency,
                    &zap_receipt("lnbc1other", "stranger", "sorry, wrong invoice"),
                )
                .event_at(
                    latency * 2,
                    &zap_receipt("lnbc100n1pdemoincoming", "sender1", "gm"),
                )
                .eose_at(latency * 3),
            1 => MockRelay::new()
                .connect_after(latency)
                .event_at(latency, &zap_receipt("lnbc100n1pdemoincoming", "sender1", "gm"))
                .eose_at(latency * 2),
            2 => MockRelay::refusing(),
            _ => MockRelay::new().connect_after(latency),
        };
        info!("Simulating relay {} (latency {:?})", relay, latency);
        network = network.with_relay(relay.clone(), script);
    }

    network
}

fn zap_receipt(invoice: &str, sender: &str, comment: &str) -> NostrEvent {
    let request = serde_json::json!({
        "kind": 9734,
        "pubkey": sender,
        "content": comment,
        "tags": [["p", OWNER], ["amount", "10000"]],
    });

    NostrEvent {
        id: format!("receipt-{}", invoice),
        pubkey: "lnurlserverpubkey".to_string(),
        created_at: chrono::Utc::now().timestamp() as u64,
        kind: ZAP_RECEIPT_KIND,
        tags: vec![
            Tag::new(["p", OWNER]),
            Tag::new(["bolt11", invoice]),
            Tag::new(["description".to_string(), request.to_string()]),
        ],
        content: String::new(),
        sig: String::new(),
    }
}

fn demo_payments() -> Vec<PaymentRecord> {
    let now = chrono::Utc::now().timestamp() as u64;
    let payment = |id: &str, invoice: &str, payment_type: PaymentType, is_zap: bool| PaymentRecord {
        id: id.to_string(),
        invoice: invoice.into(),
        payment_type,
        is_zap,
        amount_msat: 10_000,
        timestamp: now,
    };

    vec![
        payment("p1", "lnbc100n1pdemoincoming", PaymentType::Receive, true),
        payment("p2", "lnbc210n1pdemooutgoing", PaymentType::Send, true),
        payment("p3", "lnbc500n1pdemoplain", PaymentType::Receive, false),
        payment("p4", "lnbc50n1pdemounknown", PaymentType::Receive, true),
    ]
}
