//! In-process metrics for receipt lookups.
//!
//! Counters for query and branch outcomes plus a histogram of query
//! durations. Shared across queries behind an `Arc`.

use crate::receipts::types::{BranchOutcome, QueryReport};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

pub const QUERIES_TOTAL: &str = "lookup_queries_total";
pub const MATCHES_TOTAL: &str = "lookup_matches_total";
pub const NOT_FOUND_TOTAL: &str = "lookup_not_found_total";
pub const RECORDS_SEEN_TOTAL: &str = "lookup_records_seen_total";
pub const RECORDS_REJECTED_TOTAL: &str = "lookup_records_rejected_total";
pub const QUERY_DURATION_SECONDS: &str = "lookup_query_duration_seconds";

/// Most recent samples kept per histogram; older ones are dropped.
pub const MAX_HISTOGRAM_SAMPLES: usize = 1_024;

/// Metrics collector for the lookup.
#[derive(Debug, Default)]
pub struct LookupMetrics {
    inner: RwLock<InternalMetrics>,
}

#[derive(Debug, Default)]
struct InternalMetrics {
    counters: HashMap<String, u64>,
    histograms: HashMap<String, VecDeque<f64>>,
}

/// Snapshot of current metrics.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub counters: HashMap<String, u64>,
    pub histograms: HashMap<String, Vec<f64>>,
}

impl MetricsSnapshot {
    /// Counter value, zero when it was never touched.
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }
}

/// Counter name for branches ending in `outcome`.
pub fn branch_counter(outcome: &BranchOutcome) -> String {
    format!("lookup_branch_{}_total", outcome.label())
}

impl LookupMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn increment_counter(&self, name: &str) {
        self.add_to_counter(name, 1).await;
    }

    pub async fn add_to_counter(&self, name: &str, value: u64) {
        let mut metrics = self.inner.write().await;
        *metrics.counters.entry(name.to_string()).or_insert(0) += value;
    }

    pub async fn record_histogram(&self, name: &str, value: f64) {
        let mut metrics = self.inner.write().await;
        let samples = metrics.histograms.entry(name.to_string()).or_default();
        if samples.len() == MAX_HISTOGRAM_SAMPLES {
            samples.pop_front();
        }
        samples.push_back(value);
    }

    pub async fn record_query_time(&self, duration: Duration) {
        self.record_histogram(QUERY_DURATION_SECONDS, duration.as_secs_f64()).await;
    }

    /// Fold a finished query into the counters.
    pub async fn record_query(&self, report: &QueryReport) {
        {
            let mut metrics = self.inner.write().await;
            let counters = &mut metrics.counters;

            *counters.entry(QUERIES_TOTAL.to_string()).or_insert(0) += 1;
            let outcome = if report.outcome.is_found() { MATCHES_TOTAL } else { NOT_FOUND_TOTAL };
            *counters.entry(outcome.to_string()).or_insert(0) += 1;

            for branch in &report.branches {
                *counters.entry(branch_counter(&branch.outcome)).or_insert(0) += 1;
                *counters.entry(RECORDS_SEEN_TOTAL.to_string()).or_insert(0) +=
                    branch.records_seen as u64;
                *counters.entry(RECORDS_REJECTED_TOTAL.to_string()).or_insert(0) +=
                    branch.records_rejected as u64;
            }
        }
        self.record_query_time(report.elapsed).await;
        debug!("Recorded query metrics over {} branches", report.branches.len());
    }

    pub async fn get_metrics_snapshot(&self) -> MetricsSnapshot {
        let metrics = self.inner.read().await;
        MetricsSnapshot {
            counters: metrics.counters.clone(),
            histograms: metrics
                .histograms
                .iter()
                .map(|(name, samples)| (name.clone(), samples.iter().copied().collect()))
                .collect(),
        }
    }
}
