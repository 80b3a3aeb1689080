//! Tests for the multi-relay receipt coordinator

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use zap_receipts::receipts::metrics::{
    branch_counter, MATCHES_TOTAL, MAX_HISTOGRAM_SAMPLES, NOT_FOUND_TOTAL, QUERIES_TOTAL,
    QUERY_DURATION_SECONDS, RECORDS_REJECTED_TOTAL, RECORDS_SEEN_TOTAL,
};
use zap_receipts::receipts::{
    BranchOutcome, LookupConfig, MatchResult, MockRelay, MockRelayNetwork, QueryParams,
    ReceiptCoordinator, ReceiptFilter, ReceiptLookup,
};
use zap_receipts::types::{InvoiceFingerprint, NostrEvent, Tag, ZAP_RECEIPT_KIND};

const RECIPIENT: &str = "abc123...";
const INVOICE: &str = "lnbc100n1p...";

fn receipt(invoice: &str, sender: &str, comment: &str) -> NostrEvent {
    let description = serde_json::json!({
        "kind": 9734,
        "pubkey": sender,
        "tags": [["p", RECIPIENT]],
        "content": comment,
    });
    NostrEvent {
        id: format!("receipt-{}-{}", sender, invoice),
        pubkey: "lnurlserver".to_string(),
        created_at: 1_700_000_000,
        kind: ZAP_RECEIPT_KIND,
        tags: vec![
            Tag::new(["bolt11", invoice]),
            Tag::new(["description".to_string(), description.to_string()]),
            Tag::new(["p", RECIPIENT]),
        ],
        content: String::new(),
        sig: String::new(),
    }
}

fn setup(network: MockRelayNetwork) -> (ReceiptCoordinator, Arc<MockRelayNetwork>) {
    let network = Arc::new(network);
    let coordinator = ReceiptCoordinator::new(network.clone(), LookupConfig::default());
    (coordinator, network)
}

fn params(relays: &[&str], per_relay: Duration, overall: Duration) -> QueryParams {
    QueryParams::default()
        .with_relays(relays.iter().copied())
        .with_timeouts(per_relay, overall)
}

fn secs(s: u64) -> Duration {
    Duration::from_secs(s)
}

fn ms(m: u64) -> Duration {
    Duration::from_millis(m)
}

#[tokio::test(start_paused = true)]
async fn test_first_match_wins_and_cancels_the_rest() -> anyhow::Result<()> {
    let (coordinator, network) = setup(
        MockRelayNetwork::new()
            .with_relay(
                "wss://a",
                MockRelay::new().event_at(secs(2), &receipt(INVOICE, "alice", "first")),
            )
            .with_relay(
                "wss://b",
                MockRelay::new().event_at(secs(4), &receipt(INVOICE, "bob", "second")),
            ),
    );

    let started = Instant::now();
    let report = coordinator
        .query_with_report(
            &INVOICE.into(),
            RECIPIENT,
            &params(&["wss://a", "wss://b"], secs(5), secs(10)),
        )
        .await?;

    let result = report.outcome.clone().into_match().expect("relay a should match");
    assert_eq!(result.sender, "alice");
    assert_eq!(result.comment, "first");
    assert_eq!(report.winning_relay.as_deref(), Some("wss://a"));

    assert!(matches!(report.branch("wss://a").unwrap().outcome, BranchOutcome::Matched(_)));
    assert_eq!(report.branch("wss://b").unwrap().outcome, BranchOutcome::Cancelled);
    assert_eq!(network.frames_delivered("wss://b").await, 0);

    assert!(started.elapsed() < secs(3));
    assert_eq!(network.open_connections(), 0);
    assert_eq!(network.opened_total(), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_silent_relays_resolve_at_overall_timeout() -> anyhow::Result<()> {
    let (coordinator, network) = setup(
        MockRelayNetwork::new()
            .with_relay("wss://silent", MockRelay::new())
            .with_relay("wss://hanging", MockRelay::hanging()),
    );

    let overall = secs(3);
    let started = Instant::now();
    let report = coordinator
        .query_with_report(
            &INVOICE.into(),
            RECIPIENT,
            &params(&["wss://silent", "wss://hanging"], secs(5), overall),
        )
        .await?;
    let elapsed = started.elapsed();

    assert_eq!(report.outcome, ReceiptLookup::NotFound);
    assert!(elapsed >= overall);
    assert!(elapsed <= overall + ms(300), "took {:?}", elapsed);
    assert!(report
        .branches
        .iter()
        .all(|branch| branch.outcome == BranchOutcome::Cancelled));
    assert_eq!(network.open_connections(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_per_relay_timeout_ends_branch_early() -> anyhow::Result<()> {
    let (coordinator, network) =
        setup(MockRelayNetwork::new().with_relay("wss://slow", MockRelay::new()));

    let started = Instant::now();
    let report = coordinator
        .query_with_report(&INVOICE.into(), RECIPIENT, &params(&["wss://slow"], secs(1), secs(10)))
        .await?;

    assert_eq!(report.outcome, ReceiptLookup::NotFound);
    assert_eq!(report.branch("wss://slow").unwrap().outcome, BranchOutcome::TimedOut);
    assert!(started.elapsed() < secs(2));
    assert_eq!(network.open_connections(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_mismatching_relay_does_not_affect_result() -> anyhow::Result<()> {
    let expected = MatchResult {
        sender: "sender1".to_string(),
        recipient: RECIPIENT.to_string(),
        subject_event_id: None,
        comment: "gm".to_string(),
    };

    // relay-2 answering before and after relay-1 must not change the outcome
    for relay2_at in [ms(100), secs(3)] {
        let (coordinator, network) = setup(
            MockRelayNetwork::new()
                .with_relay(
                    "relay-1",
                    MockRelay::new()
                        .event_at(secs(1), &receipt(INVOICE, "sender1", "gm"))
                        .eose_at(secs(2)),
                )
                .with_relay(
                    "relay-2",
                    MockRelay::new()
                        .event_at(relay2_at, &receipt("lnbc999n1pother", "sender2", "hi"))
                        .eose_at(relay2_at + ms(10)),
                ),
        );

        let report = coordinator
            .query_with_report(
                &INVOICE.into(),
                RECIPIENT,
                &params(&["relay-1", "relay-2"], secs(5), secs(10)),
            )
            .await?;

        assert_eq!(report.outcome, ReceiptLookup::Found(expected.clone()));
        assert_eq!(report.winning_relay.as_deref(), Some("relay-1"));
        assert_eq!(network.open_connections(), 0);
    }
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_rejected_receipts_are_counted() -> anyhow::Result<()> {
    let (coordinator, _network) = setup(
        MockRelayNetwork::new().with_relay(
            "relay-2",
            MockRelay::new()
                .event_at(ms(10), &receipt("lnbc999n1pother", "sender2", "hi"))
                .eose_at(ms(20)),
        ),
    );

    let report = coordinator
        .query_with_report(&INVOICE.into(), RECIPIENT, &params(&["relay-2"], secs(5), secs(10)))
        .await?;

    let branch = report.branch("relay-2").unwrap();
    assert_eq!(branch.outcome, BranchOutcome::Drained);
    assert_eq!(branch.records_seen, 1);
    assert_eq!(branch.records_rejected, 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_notice_does_not_end_the_branch() -> anyhow::Result<()> {
    let (coordinator, network) = setup(
        MockRelayNetwork::new().with_relay(
            "wss://noisy",
            MockRelay::new()
                .notice_at(ms(1), "rate limit approaching")
                .event_at(ms(2), &receipt(INVOICE, "sender1", "gm")),
        ),
    );

    let report = coordinator
        .query_with_report(&INVOICE.into(), RECIPIENT, &params(&["wss://noisy"], secs(5), secs(10)))
        .await?;

    // The receipt after the notice is still read
    assert!(report.outcome.is_found());
    let branch = report.branch("wss://noisy").unwrap();
    assert_eq!(branch.records_seen, 1);
    assert_eq!(network.frames_delivered("wss://noisy").await, 2);

    let snapshot = coordinator.metrics().get_metrics_snapshot().await;
    assert_eq!(snapshot.counter(RECORDS_SEEN_TOTAL), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_every_relay_gets_the_same_filter() -> anyhow::Result<()> {
    let (coordinator, network) = setup(
        MockRelayNetwork::new()
            .with_relay("wss://a", MockRelay::new().eose_at(ms(5)))
            .with_relay("wss://b", MockRelay::new().eose_at(ms(5))),
    );

    coordinator
        .query(&INVOICE.into(), RECIPIENT, &params(&["wss://a", "wss://b"], secs(5), secs(10)))
        .await?;

    let expected = ReceiptFilter {
        kinds: vec![9735],
        recipients: vec![RECIPIENT.to_string()],
        limit: 50,
    };
    assert_eq!(network.filters_for("wss://a").await, vec![expected.clone()]);
    assert_eq!(network.filters_for("wss://b").await, vec![expected.clone()]);

    let wire = serde_json::to_value(&expected)?;
    assert_eq!(wire, serde_json::json!({"kinds": [9735], "#p": [RECIPIENT], "limit": 50}));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_relays_are_queried_once() -> anyhow::Result<()> {
    let (coordinator, network) =
        setup(MockRelayNetwork::new().with_relay("wss://a", MockRelay::new().eose_at(ms(5))));

    let report = coordinator
        .query_with_report(
            &INVOICE.into(),
            RECIPIENT,
            &params(&["wss://a", "wss://a"], secs(5), secs(10)),
        )
        .await?;

    assert_eq!(report.branches.len(), 1);
    assert_eq!(network.opened_total(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_protocol_error_fails_only_that_branch() -> anyhow::Result<()> {
    let (coordinator, network) = setup(
        MockRelayNetwork::new()
            .with_relay("wss://broken", MockRelay::new().error_at(ms(5), "bad frame"))
            .with_relay(
                "wss://good",
                MockRelay::new().event_at(secs(1), &receipt(INVOICE, "sender1", "gm")),
            ),
    );

    let report = coordinator
        .query_with_report(
            &INVOICE.into(),
            RECIPIENT,
            &params(&["wss://broken", "wss://good"], secs(5), secs(10)),
        )
        .await?;

    assert!(report.outcome.is_found());
    assert!(matches!(report.branch("wss://broken").unwrap().outcome, BranchOutcome::Failed(_)));
    assert_eq!(network.open_connections(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_outcome_agrees_with_branches_at_the_deadline() -> anyhow::Result<()> {
    // The receipt lands exactly when the overall timeout fires
    for at in [ms(2_990), secs(3), ms(3_010)] {
        let (coordinator, _network) = setup(MockRelayNetwork::new().with_relay(
            "wss://late",
            MockRelay::new().event_at(at, &receipt(INVOICE, "sender1", "gm")),
        ));

        let report = coordinator
            .query_with_report(
                &INVOICE.into(),
                RECIPIENT,
                &params(&["wss://late"], secs(5), secs(3)),
            )
            .await?;

        let any_matched = report
            .branches
            .iter()
            .any(|branch| matches!(branch.outcome, BranchOutcome::Matched(_)));
        assert_eq!(report.outcome.is_found(), any_matched, "receipt at {:?}", at);
        assert_eq!(report.winning_relay.is_some(), any_matched);
    }
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_no_connection_outlives_its_query() -> anyhow::Result<()> {
    let (coordinator, network) = setup(
        MockRelayNetwork::new()
            .with_relay(
                "wss://match",
                MockRelay::new().event_at(ms(50), &receipt(INVOICE, "sender1", "gm")),
            )
            .with_relay("wss://empty", MockRelay::new().eose_at(ms(10)))
            .with_relay("wss://silent", MockRelay::new())
            .with_relay("wss://slow-connect", MockRelay::new().connect_after(secs(2)))
            .with_relay("wss://closing", MockRelay::new().closed_at(ms(5), "auth-required")),
    );

    let everything = [
        "wss://match",
        "wss://empty",
        "wss://silent",
        "wss://slow-connect",
        "wss://closing",
    ];

    // A match, a miss and a miss made only of failures
    coordinator
        .query(&INVOICE.into(), RECIPIENT, &params(&everything, secs(5), secs(10)))
        .await?;
    assert_eq!(network.open_connections(), 0);

    coordinator
        .query(&"lnbc1pmissing".into(), RECIPIENT, &params(&everything, secs(1), secs(3)))
        .await?;
    assert_eq!(network.open_connections(), 0);

    coordinator
        .query(
            &INVOICE.into(),
            RECIPIENT,
            &params(&["wss://closing", "wss://unknown"], secs(1), secs(3)),
        )
        .await?;
    assert_eq!(network.open_connections(), 0);
    assert_eq!(network.opened_total(), network.closed_total());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_batch_returns_only_matches() -> anyhow::Result<()> {
    let (coordinator, network) = setup(
        MockRelayNetwork::new().with_relay(
            "wss://a",
            MockRelay::new()
                .event_at(ms(10), &receipt("lnbc1pone", "sender1", "one"))
                .event_at(ms(20), &receipt("lnbc1ptwo", "sender2", "two"))
                .eose_at(ms(30)),
        ),
    );

    let invoices: Vec<InvoiceFingerprint> = ["lnbc1pone", "lnbc1ptwo", "lnbc1pone", "lnbc1pthree"]
        .into_iter()
        .map(InvoiceFingerprint::from)
        .collect();
    let matches = coordinator
        .query_batch(&invoices, RECIPIENT, &params(&["wss://a"], secs(5), secs(10)))
        .await?;

    assert_eq!(matches.len(), 2);
    assert_eq!(matches[&InvoiceFingerprint::from("lnbc1pone")].comment, "one");
    assert_eq!(matches[&InvoiceFingerprint::from("lnbc1ptwo")].sender, "sender2");
    assert!(!matches.contains_key(&InvoiceFingerprint::from("lnbc1pthree")));

    // One query per distinct invoice
    assert_eq!(network.opened_total(), 3);
    assert_eq!(network.open_connections(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_batch_rejects_invalid_invoice_up_front() {
    let (coordinator, network) =
        setup(MockRelayNetwork::new().with_relay("wss://a", MockRelay::new().eose_at(ms(5))));

    let invoices = vec![InvoiceFingerprint::from("lnbc1pone"), InvoiceFingerprint::from("")];
    let result = coordinator
        .query_batch(&invoices, RECIPIENT, &params(&["wss://a"], secs(5), secs(10)))
        .await;

    assert!(result.is_err());
    assert_eq!(network.opened_total(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_metrics_track_queries() -> anyhow::Result<()> {
    let (coordinator, _network) = setup(
        MockRelayNetwork::new().with_relay(
            "wss://a",
            MockRelay::new()
                .event_at(ms(10), &receipt("lnbc999n1pother", "sender2", "hi"))
                .event_at(ms(20), &receipt(INVOICE, "sender1", "gm"))
                .eose_at(ms(30)),
        ),
    );
    let params = params(&["wss://a"], secs(5), secs(10));

    coordinator.query(&INVOICE.into(), RECIPIENT, &params).await?;
    coordinator.query(&"lnbc1pmissing".into(), RECIPIENT, &params).await?;

    let snapshot = coordinator.metrics().get_metrics_snapshot().await;
    assert_eq!(snapshot.counter(QUERIES_TOTAL), 2);
    assert_eq!(snapshot.counter(MATCHES_TOTAL), 1);
    assert_eq!(snapshot.counter(NOT_FOUND_TOTAL), 1);
    assert_eq!(snapshot.counter(&branch_counter(&BranchOutcome::Drained)), 1);
    // One mismatch in the first query, both receipts in the second
    assert_eq!(snapshot.counter(RECORDS_REJECTED_TOTAL), 3);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_query_durations_stay_bounded() -> anyhow::Result<()> {
    let (coordinator, _network) =
        setup(MockRelayNetwork::new().with_relay("wss://a", MockRelay::new().eose_at(ms(1))));
    let params = params(&["wss://a"], secs(5), secs(10));

    let queries = MAX_HISTOGRAM_SAMPLES + 50;
    for _ in 0..queries {
        coordinator.query(&INVOICE.into(), RECIPIENT, &params).await?;
    }

    let snapshot = coordinator.metrics().get_metrics_snapshot().await;
    assert_eq!(snapshot.counter(QUERIES_TOTAL), queries as u64);
    assert_eq!(snapshot.histograms[QUERY_DURATION_SECONDS].len(), MAX_HISTOGRAM_SAMPLES);
    Ok(())
}

#[tokio::test]
async fn test_lookup_uses_configured_relays() -> anyhow::Result<()> {
    let network = Arc::new(MockRelayNetwork::new().with_relay(
        "wss://configured",
        MockRelay::new().event_at(Duration::ZERO, &receipt(INVOICE, "sender1", "gm")),
    ));
    let raw = r#"{"relays": ["wss://configured"], "overall_timeout_ms": 2000}"#;
    let config = LookupConfig::from_json_str(raw)?;
    assert_eq!(config.per_relay_timeout_ms, 5_000);

    let coordinator = ReceiptCoordinator::new(network.clone(), config);
    let lookup = coordinator.lookup(&INVOICE.into(), RECIPIENT).await?;

    assert!(lookup.is_found());
    assert_eq!(network.filters_for("wss://configured").await.len(), 1);
    Ok(())
}
