//! Router Metrics
//!
//! Lock-free counters for dispatch observability:
//! - Dispatch totals, cache hits, fallbacks and terminal failures
//! - Per-provider attempts, successes, failures by class, latency
//! - Prometheus text export
//!
//! Recording is infallible and never blocks a dispatch.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::ErrorClass;
use crate::provider::{ProviderId, ProviderTable};

// ============================================================================
// Histogram for Latency Tracking
// ============================================================================

/// A histogram for tracking latency distributions
#[derive(Debug)]
pub struct Histogram {
    /// Upper bucket bounds in milliseconds
    buckets: Vec<f64>,
    counts: Vec<AtomicU64>,
    total_count: AtomicU64,
    sum: AtomicU64,
    max: AtomicU64,
}

impl Histogram {
    /// Histogram with the given bucket bounds
    pub fn new(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            total_count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            max: AtomicU64::new(0),
        }
    }

    /// Default latency buckets (ms), tuned for hosted LLM round trips
    pub fn latency_default() -> Self {
        Self::new(vec![
            50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0, 30000.0, 60000.0,
        ])
    }

    /// Record one sample
    pub fn record(&self, value: f64) {
        let bucket_idx = self
            .buckets
            .iter()
            .position(|&b| value <= b)
            .unwrap_or(self.buckets.len().saturating_sub(1));

        if let Some(count) = self.counts.get(bucket_idx) {
            count.fetch_add(1, Ordering::Relaxed);
        }
        self.total_count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(value as u64, Ordering::Relaxed);
        self.max.fetch_max(value as u64, Ordering::Relaxed);
    }

    /// Record a duration in milliseconds
    pub fn record_duration(&self, d: Duration) {
        self.record(d.as_secs_f64() * 1000.0);
    }

    /// Point-in-time copy
    pub fn snapshot(&self) -> HistogramSnapshot {
        let total = self.total_count.load(Ordering::Relaxed);
        let sum = self.sum.load(Ordering::Relaxed);
        HistogramSnapshot {
            buckets: self.buckets.clone(),
            counts: self
                .counts
                .iter()
                .map(|c| c.load(Ordering::Relaxed))
                .collect(),
            total,
            sum,
            max: self.max.load(Ordering::Relaxed),
            mean: if total > 0 {
                sum as f64 / total as f64
            } else {
                0.0
            },
        }
    }
}

/// Snapshot of histogram data
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HistogramSnapshot {
    pub buckets: Vec<f64>,
    pub counts: Vec<u64>,
    pub total: u64,
    pub sum: u64,
    pub max: u64,
    pub mean: f64,
}

impl HistogramSnapshot {
    /// Upper bound of the bucket holding the `p` quantile
    pub fn percentile(&self, p: f64) -> f64 {
        if self.total == 0 {
            return 0.0;
        }

        let target = ((self.total as f64 * p).ceil() as u64).max(1);
        let mut cumulative = 0u64;
        for (i, &count) in self.counts.iter().enumerate() {
            cumulative += count;
            if cumulative >= target {
                return self.buckets[i];
            }
        }

        self.buckets.last().copied().unwrap_or(0.0)
    }

    pub fn p50(&self) -> f64 {
        self.percentile(0.5)
    }

    pub fn p99(&self) -> f64 {
        self.percentile(0.99)
    }
}

// ============================================================================
// Counter
// ============================================================================

/// A simple atomic counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Per-Provider Metrics
// ============================================================================

const TRACKED_CLASSES: [ErrorClass; 6] = [
    ErrorClass::Validation,
    ErrorClass::Authentication,
    ErrorClass::RateLimited,
    ErrorClass::Timeout,
    ErrorClass::Network,
    ErrorClass::Unknown,
];

fn class_slot(class: ErrorClass) -> usize {
    TRACKED_CLASSES
        .iter()
        .position(|c| *c == class)
        .unwrap_or(TRACKED_CLASSES.len() - 1)
}

/// Metrics for a single provider
#[derive(Debug)]
pub struct ProviderMetrics {
    pub attempts: Counter,
    pub successes: Counter,
    pub skipped: Counter,
    failures: [Counter; TRACKED_CLASSES.len()],
    pub tokens: Counter,
    pub latency: Histogram,
}

impl Default for ProviderMetrics {
    fn default() -> Self {
        Self {
            attempts: Counter::default(),
            successes: Counter::default(),
            skipped: Counter::default(),
            failures: Default::default(),
            tokens: Counter::default(),
            latency: Histogram::latency_default(),
        }
    }
}

impl ProviderMetrics {
    /// Failures of one class
    pub fn failures(&self, class: ErrorClass) -> u64 {
        self.failures[class_slot(class)].get()
    }

    /// All failures
    pub fn total_failures(&self) -> u64 {
        self.failures.iter().map(Counter::get).sum()
    }

    /// Failed share of attempts
    pub fn error_rate(&self) -> f64 {
        let attempts = self.attempts.get();
        if attempts == 0 {
            return 0.0;
        }
        self.total_failures() as f64 / attempts as f64
    }

    fn summary(&self, provider: ProviderId) -> ProviderMetricsSummary {
        let latency = self.latency.snapshot();
        ProviderMetricsSummary {
            provider,
            attempts: self.attempts.get(),
            successes: self.successes.get(),
            failures: self.total_failures(),
            skipped: self.skipped.get(),
            error_rate: self.error_rate(),
            tokens: self.tokens.get(),
            latency_p50_ms: latency.p50(),
            latency_p99_ms: latency.p99(),
        }
    }
}

/// Summary of provider metrics
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProviderMetricsSummary {
    pub provider: ProviderId,
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub skipped: u64,
    pub error_rate: f64,
    pub tokens: u64,
    pub latency_p50_ms: f64,
    pub latency_p99_ms: f64,
}

// ============================================================================
// Router Metrics
// ============================================================================

/// Centralized metrics for the router
#[derive(Debug)]
pub struct RouterMetrics {
    providers: ProviderTable<ProviderMetrics>,

    pub dispatches: Counter,
    pub cache_hits: Counter,
    pub fallbacks: Counter,
    pub dispatch_failures: Counter,
    pub dispatch_latency: Histogram,

    started_at: Instant,
}

impl Default for RouterMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl RouterMetrics {
    pub fn new() -> Self {
        Self {
            providers: ProviderTable::default(),
            dispatches: Counter::default(),
            cache_hits: Counter::default(),
            fallbacks: Counter::default(),
            dispatch_failures: Counter::default(),
            dispatch_latency: Histogram::latency_default(),
            started_at: Instant::now(),
        }
    }

    /// Metrics of one provider
    pub fn provider(&self, id: ProviderId) -> &ProviderMetrics {
        &self.providers[id]
    }

    pub fn record_attempt_success(&self, id: ProviderId, latency: Duration, tokens: u32) {
        let m = &self.providers[id];
        m.attempts.inc();
        m.successes.inc();
        m.tokens.add(u64::from(tokens));
        m.latency.record_duration(latency);
    }

    pub fn record_attempt_failure(&self, id: ProviderId, class: ErrorClass, latency: Duration) {
        let m = &self.providers[id];
        m.attempts.inc();
        m.failures[class_slot(class)].inc();
        m.latency.record_duration(latency);
    }

    pub fn record_skip(&self, id: ProviderId) {
        self.providers[id].skipped.inc();
    }

    /// Record a finished dispatch; `upstream_attempts > 1` counts as a fallback
    pub fn record_dispatch(&self, latency: Duration, cached: bool, upstream_attempts: usize, ok: bool) {
        self.dispatches.inc();
        self.dispatch_latency.record_duration(latency);
        if cached {
            self.cache_hits.inc();
        }
        if upstream_attempts > 1 {
            self.fallbacks.inc();
        }
        if !ok {
            self.dispatch_failures.inc();
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn provider_summaries(&self) -> Vec<ProviderMetricsSummary> {
        self.providers.iter().map(|(id, m)| m.summary(id)).collect()
    }

    /// Export as Prometheus text format
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str(&format!(
            "# HELP switchboard_dispatches_total Dispatches handled\n\
             # TYPE switchboard_dispatches_total counter\n\
             switchboard_dispatches_total {}\n\n",
            self.dispatches.get()
        ));
        output.push_str(&format!(
            "# HELP switchboard_cache_hits_total Dispatches served from cache\n\
             # TYPE switchboard_cache_hits_total counter\n\
             switchboard_cache_hits_total {}\n\n",
            self.cache_hits.get()
        ));
        output.push_str(&format!(
            "# HELP switchboard_fallbacks_total Dispatches that needed more than one provider\n\
             # TYPE switchboard_fallbacks_total counter\n\
             switchboard_fallbacks_total {}\n\n",
            self.fallbacks.get()
        ));
        output.push_str(&format!(
            "# HELP switchboard_dispatch_failures_total Dispatches that ended in an error\n\
             # TYPE switchboard_dispatch_failures_total counter\n\
             switchboard_dispatch_failures_total {}\n\n",
            self.dispatch_failures.get()
        ));

        output.push_str(
            "# HELP switchboard_provider_attempts_total Upstream attempts per provider\n\
             # TYPE switchboard_provider_attempts_total counter\n",
        );
        for (id, m) in self.providers.iter() {
            output.push_str(&format!(
                "switchboard_provider_attempts_total{{provider=\"{id}\"}} {}\n",
                m.attempts.get()
            ));
        }
        output.push('\n');

        output.push_str(
            "# HELP switchboard_provider_failures_total Upstream failures per provider and class\n\
             # TYPE switchboard_provider_failures_total counter\n",
        );
        for (id, m) in self.providers.iter() {
            for class in TRACKED_CLASSES {
                let n = m.failures(class);
                if n > 0 {
                    output.push_str(&format!(
                        "switchboard_provider_failures_total{{provider=\"{id}\",class=\"{class}\"}} {n}\n"
                    ));
                }
            }
        }
        output.push('\n');

        for (id, m) in self.providers.iter() {
            let latency = m.latency.snapshot();
            output.push_str(&format!(
                "switchboard_provider_latency_p50_ms{{provider=\"{id}\"}} {}\n\
                 switchboard_provider_latency_p99_ms{{provider=\"{id}\"}} {}\n",
                latency.p50(),
                latency.p99()
            ));
        }

        output
    }
}
