//! Multi-relay query coordinator.
//!
//! A query fans out one branch per relay. Each branch connects, subscribes to
//! zap receipts for the recipient and feeds every event it receives to the
//! matcher. The first branch to produce a match wins; the query then issues a
//! single cancellation that every other branch observes, and it returns only
//! once all branches have released their connections.
//!
//! Branch failures never fail the query. A relay that refuses, stalls or
//! sends garbage simply contributes nothing.

use crate::receipts::matcher::match_receipt;
use crate::receipts::metrics::LookupMetrics;
use crate::receipts::relay::{ConnectionGuard, RelayConnector, RelayFrame};
use crate::receipts::types::{
    BranchOutcome, BranchReport, LookupConfig, MatchResult, QueryError, QueryParams, QueryReport,
    ReceiptFilter, ReceiptLookup,
};
use crate::types::{InvoiceFingerprint, NostrEvent};
use nonempty::NonEmpty;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::{self, JoinError, JoinSet};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, instrument, trace, warn};

/// How long cancelled branches get to report back before they are aborted.
const CANCEL_GRACE: Duration = Duration::from_millis(250);

/// Resolves invoices to zap receipts by racing a set of relays.
#[derive(Clone)]
pub struct ReceiptCoordinator {
    connector: Arc<dyn RelayConnector>,
    config: LookupConfig,
    metrics: Arc<LookupMetrics>,
    batch_semaphore: Arc<Semaphore>,
}

/// Query parameters after validation.
struct ValidatedParams {
    relays: NonEmpty<String>,
    per_relay_timeout: Duration,
    overall_timeout: Duration,
    result_limit: usize,
}

/// Everything one branch needs, owned so the branch can run as its own task.
struct BranchContext {
    relay: String,
    connector: Arc<dyn RelayConnector>,
    filter: ReceiptFilter,
    fingerprint: InvoiceFingerprint,
    per_relay_timeout: Duration,
}

#[derive(Debug, Default)]
struct BranchStats {
    records_seen: usize,
    records_rejected: usize,
}

/// Branch reports collected while a query is in flight.
struct Race<'a> {
    relays: &'a [String],
    tasks: HashMap<task::Id, usize>,
    started: Instant,
    reports: Vec<Option<BranchReport>>,
    winner: Option<(String, MatchResult)>,
}

impl Race<'_> {
    /// Store a finished branch. The first match seen becomes the winner.
    fn absorb(&mut self, joined: Result<(usize, BranchReport), JoinError>) {
        match joined {
            Ok((index, report)) => {
                if let (None, BranchOutcome::Matched(result)) = (&self.winner, &report.outcome) {
                    self.winner = Some((report.relay.clone(), result.clone()));
                }
                self.reports[index] = Some(report);
            }
            Err(e) => {
                warn!("Relay branch task failed: {}", e);
                if let Some(&index) = self.tasks.get(&e.id()) {
                    self.reports[index] = Some(BranchReport {
                        relay: self.relays[index].clone(),
                        outcome: BranchOutcome::Failed(e.to_string()),
                        records_seen: 0,
                        records_rejected: 0,
                        elapsed: self.started.elapsed(),
                    });
                }
            }
        }
    }
}

impl ReceiptCoordinator {
    pub fn new(connector: Arc<dyn RelayConnector>, config: LookupConfig) -> Self {
        let batch_semaphore = Arc::new(Semaphore::new(config.max_parallel_queries.max(1)));
        Self {
            connector,
            config,
            metrics: Arc::new(LookupMetrics::new()),
            batch_semaphore,
        }
    }

    pub fn config(&self) -> &LookupConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<LookupMetrics> {
        self.metrics.clone()
    }

    /// Look up a receipt with the configured relays and timeouts.
    pub async fn lookup(
        &self,
        fingerprint: &InvoiceFingerprint,
        recipient: &str,
    ) -> Result<ReceiptLookup, QueryError> {
        self.query(fingerprint, recipient, &self.config.query_params()).await
    }

    /// Look up the receipt for `fingerprint` among zaps sent to `recipient`.
    pub async fn query(
        &self,
        fingerprint: &InvoiceFingerprint,
        recipient: &str,
        params: &QueryParams,
    ) -> Result<ReceiptLookup, QueryError> {
        let report = self.query_with_report(fingerprint, recipient, params).await?;
        Ok(report.outcome)
    }

    /// Same as [`query`](Self::query), also returning what every branch did.
    #[instrument(skip(self, params), fields(invoice = %fingerprint))]
    pub async fn query_with_report(
        &self,
        fingerprint: &InvoiceFingerprint,
        recipient: &str,
        params: &QueryParams,
    ) -> Result<QueryReport, QueryError> {
        let validated = validate_params(params)?;
        validate_target(fingerprint, recipient)?;

        let started = Instant::now();
        let relays: Vec<String> = validated.relays.into();
        let filter = ReceiptFilter::zap_receipts_for(recipient, validated.result_limit);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let mut branches = JoinSet::new();
        let mut tasks = HashMap::with_capacity(relays.len());
        for (index, relay) in relays.iter().enumerate() {
            let context = BranchContext {
                relay: relay.clone(),
                connector: self.connector.clone(),
                filter: filter.clone(),
                fingerprint: fingerprint.clone(),
                per_relay_timeout: validated.per_relay_timeout,
            };
            let cancel = cancel_rx.clone();
            let handle = branches.spawn(async move { (index, run_branch(context, cancel).await) });
            tasks.insert(handle.id(), index);
        }
        debug!("Fanned out to {} relays", relays.len());

        let mut race = Race {
            relays: &relays,
            tasks,
            started,
            reports: vec![None; relays.len()],
            winner: None,
        };
        let deadline = sleep(validated.overall_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                // A branch finishing in the same tick as the deadline still counts
                biased;
                joined = branches.join_next() => match joined {
                    Some(joined) => {
                        race.absorb(joined);
                        if race.winner.is_some() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = &mut deadline => {
                    debug!("Overall timeout of {:?} elapsed", validated.overall_timeout);
                    break;
                }
            }
        }

        // Sent exactly once; every branch still running observes it
        cancel_tx.send_replace(true);
        let drained = timeout(CANCEL_GRACE, async {
            while let Some(joined) = branches.join_next().await {
                race.absorb(joined);
            }
        })
        .await;
        if drained.is_err() {
            warn!("Aborting {} branches that ignored cancellation", branches.len());
            branches.shutdown().await;
        }

        let Race { reports, winner, .. } = race;
        let branches: Vec<BranchReport> = reports
            .into_iter()
            .zip(relays)
            .map(|(report, relay)| {
                report.unwrap_or_else(|| BranchReport {
                    relay,
                    outcome: BranchOutcome::Cancelled,
                    records_seen: 0,
                    records_rejected: 0,
                    elapsed: started.elapsed(),
                })
            })
            .collect();

        let (outcome, winning_relay) = match winner {
            Some((relay, result)) => {
                info!("Found zap receipt on {} (sender {})", relay, result.sender);
                (ReceiptLookup::Found(result), Some(relay))
            }
            None => {
                info!("No zap receipt found across {} relays", branches.len());
                (ReceiptLookup::NotFound, None)
            }
        };

        let report = QueryReport {
            outcome,
            winning_relay,
            branches,
            elapsed: started.elapsed(),
        };
        self.metrics.record_query(&report).await;
        Ok(report)
    }

    /// Run independent queries for several invoices.
    ///
    /// Only invoices that resolved to a receipt appear in the result.
    #[instrument(skip_all, fields(invoices = fingerprints.len()))]
    pub async fn query_batch(
        &self,
        fingerprints: &[InvoiceFingerprint],
        recipient: &str,
        params: &QueryParams,
    ) -> Result<HashMap<InvoiceFingerprint, MatchResult>, QueryError> {
        validate_params(params)?;
        for fingerprint in fingerprints {
            validate_target(fingerprint, recipient)?;
        }

        let mut seen = HashSet::new();
        let mut queries = JoinSet::new();
        for fingerprint in fingerprints.iter().filter(|fp| seen.insert(*fp)) {
            let coordinator = self.clone();
            let fingerprint = fingerprint.clone();
            let recipient = recipient.to_string();
            let params = params.clone();
            queries.spawn(async move {
                let _permit = coordinator.batch_semaphore.clone().acquire_owned().await;
                let lookup = coordinator.query(&fingerprint, &recipient, &params).await;
                (fingerprint, lookup)
            });
        }

        let mut matches = HashMap::new();
        while let Some(joined) = queries.join_next().await {
            match joined {
                Ok((fingerprint, Ok(ReceiptLookup::Found(result)))) => {
                    matches.insert(fingerprint, result);
                }
                Ok((_, Ok(ReceiptLookup::NotFound))) => {}
                Ok((fingerprint, Err(e))) => warn!("Query for {} failed: {}", fingerprint, e),
                Err(e) => warn!("Batch query task failed: {}", e),
            }
        }

        info!("Batch resolved {} of {} invoices", matches.len(), seen.len());
        Ok(matches)
    }
}

/// Check relays, timeouts and limit. Blank addresses are rejected, duplicates collapsed.
fn validate_params(params: &QueryParams) -> Result<ValidatedParams, QueryError> {
    if params.per_relay_timeout.is_zero() {
        return Err(QueryError::ZeroLimit("per-relay timeout"));
    }
    if params.overall_timeout.is_zero() {
        return Err(QueryError::ZeroLimit("overall timeout"));
    }
    if params.result_limit == 0 {
        return Err(QueryError::ZeroLimit("result limit"));
    }

    let mut seen = HashSet::new();
    let mut relays = Vec::with_capacity(params.relays.len());
    for (position, relay) in params.relays.iter().enumerate() {
        let relay = relay.trim();
        if relay.is_empty() {
            return Err(QueryError::InvalidRelayAddress(position));
        }
        if seen.insert(relay) {
            relays.push(relay.to_string());
        }
    }

    Ok(ValidatedParams {
        relays: NonEmpty::from_vec(relays).ok_or(QueryError::EmptyRelayList)?,
        per_relay_timeout: params.per_relay_timeout,
        overall_timeout: params.overall_timeout,
        result_limit: params.result_limit,
    })
}

fn validate_target(fingerprint: &InvoiceFingerprint, recipient: &str) -> Result<(), QueryError> {
    if !fingerprint.is_well_formed() {
        return Err(QueryError::InvalidFingerprint);
    }
    if recipient.trim().is_empty() {
        return Err(QueryError::InvalidRecipient);
    }
    Ok(())
}

/// Resolves once the query has been resolved elsewhere.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    while !*cancel.borrow_and_update() {
        if cancel.changed().await.is_err() {
            // Query dropped without resolving
            return;
        }
    }
}

#[instrument(skip_all, fields(relay = %context.relay))]
async fn run_branch(context: BranchContext, mut cancel: watch::Receiver<bool>) -> BranchReport {
    let started = Instant::now();
    let mut stats = BranchStats::default();

    let outcome = tokio::select! {
        biased;
        _ = cancelled(&mut cancel) => BranchOutcome::Cancelled,
        driven = timeout(context.per_relay_timeout, drive_branch(&context, &mut stats)) => {
            driven.unwrap_or(BranchOutcome::TimedOut)
        }
    };

    match &outcome {
        BranchOutcome::TimedOut => debug!("Relay {} timed out", context.relay),
        BranchOutcome::Cancelled => trace!("Relay {} cancelled", context.relay),
        _ => {}
    }

    BranchReport {
        relay: context.relay,
        outcome,
        records_seen: stats.records_seen,
        records_rejected: stats.records_rejected,
        elapsed: started.elapsed(),
    }
}

/// Connect, subscribe and scan the relay's receipts until one matches or the relay runs dry.
async fn drive_branch(context: &BranchContext, stats: &mut BranchStats) -> BranchOutcome {
    let relay = context.relay.as_str();

    let connection = match context.connector.connect(relay).await {
        Ok(connection) => connection,
        Err(e) => {
            warn!("Relay {} unavailable: {}", relay, e);
            return BranchOutcome::Failed(e.to_string());
        }
    };
    let mut guard = ConnectionGuard::new(relay, connection);

    let mut subscription = match guard.subscribe(&context.filter).await {
        Ok(subscription) => subscription,
        Err(e) => {
            warn!("Relay {} rejected the subscription: {}", relay, e);
            return BranchOutcome::Failed(e.to_string());
        }
    };
    debug!("Subscribed to {}", relay);

    while let Some(frame) = subscription.next().await {
        match frame {
            Ok(RelayFrame::Event(raw)) => {
                stats.records_seen += 1;
                match NostrEvent::from_json(&raw) {
                    Ok(event) => match match_receipt(&event, &context.fingerprint) {
                        Ok(result) => {
                            debug!("Relay {} holds the receipt {}", relay, event.id);
                            return BranchOutcome::Matched(result);
                        }
                        Err(reason) => {
                            stats.records_rejected += 1;
                            trace!("Rejected {} from {}: {}", event.id, relay, reason);
                        }
                    },
                    Err(e) => {
                        stats.records_rejected += 1;
                        debug!("Relay {} sent an unparseable event: {}", relay, e);
                    }
                }
                if stats.records_seen >= context.filter.limit {
                    debug!("Relay {} reached the result limit of {}", relay, context.filter.limit);
                    return BranchOutcome::Drained;
                }
            }
            Ok(RelayFrame::EndOfStoredEvents) => {
                debug!("Relay {} drained after {} events", relay, stats.records_seen);
                return BranchOutcome::Drained;
            }
            Ok(RelayFrame::Notice(message)) => debug!("Notice from {}: {}", relay, message),
            Ok(RelayFrame::Closed(reason)) => {
                warn!("Relay {} closed the subscription: {}", relay, reason);
                return BranchOutcome::Failed(format!("closed by relay: {}", reason));
            }
            Err(e) => {
                warn!("Relay {} stream error: {}", relay, e);
                return BranchOutcome::Failed(e.to_string());
            }
        }
    }

    BranchOutcome::Failed("stream ended before end of stored events".to_string())
}
