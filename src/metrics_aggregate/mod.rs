mod stats;

use crate::common::sync::lock;
use crate::config::ProbeKind;
use crate::events::EventSink;
use crate::metrics::{LatencyStats, StatsSnapshot, ThroughputStats};
use crate::probe::{ProbeEvent, ProbeOutcome, ProbeResult, ProgressSample};
use stats::{LatencyHistogram, RunningStat};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

/// Throughput values kept for display.
pub const THROUGHPUT_SAMPLE_LIMIT: usize = 10_000;

struct Aggregate {
    total: u64,
    success: u64,
    failed: u64,
    timeouts: u64,
    status_histogram: BTreeMap<String, u64>,
    latency: RunningStat,
    latency_histogram: LatencyHistogram,
    throughput: RunningStat,
    throughput_samples: VecDeque<f64>,
}

impl Aggregate {
    fn new() -> Self {
        Self {
            total: 0,
            success: 0,
            failed: 0,
            timeouts: 0,
            status_histogram: BTreeMap::new(),
            latency: RunningStat::default(),
            latency_histogram: LatencyHistogram::new(),
            throughput: RunningStat::default(),
            throughput_samples: VecDeque::new(),
        }
    }
}

/// Running statistics over the terminal results of a batch.
///
/// Every counter lives behind one mutex that is held only for the duration of
/// a single update or copy, so a snapshot never mixes the state before and
/// after a result.
pub struct StatsAggregator {
    inner: Mutex<Aggregate>,
    sample_limit: usize,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::with_sample_limit(THROUGHPUT_SAMPLE_LIMIT)
    }

    pub fn with_sample_limit(sample_limit: usize) -> Self {
        Self {
            inner: Mutex::new(Aggregate::new()),
            sample_limit: sample_limit.max(1),
        }
    }

    /// Folds one event in. Only terminal results change the counters.
    pub fn apply(&self, event: &ProbeEvent) {
        if let ProbeEvent::Result(result) = event {
            self.record(result);
        }
    }

    pub fn record(&self, result: &ProbeResult) {
        let mut agg = lock(&self.inner);
        agg.total += 1;
        *agg
            .status_histogram
            .entry(result.classification_key())
            .or_insert(0) += 1;

        if !result.outcome.is_success() {
            agg.failed += 1;
            if result.outcome == ProbeOutcome::Timeout {
                agg.timeouts += 1;
            }
            return;
        }

        agg.success += 1;
        match result.kind {
            ProbeKind::Latency => {
                let ms = result.elapsed.as_secs_f64() * 1000.0;
                agg.latency.record(ms);
                agg.latency_histogram.record_ms(ms);
            }
            ProbeKind::Throughput => {
                if let Some(speed) = result.speed_kbps {
                    agg.throughput.record(speed);
                    agg.throughput_samples.push_back(speed);
                    while agg.throughput_samples.len() > self.sample_limit {
                        agg.throughput_samples.pop_front();
                    }
                }
            }
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let agg = lock(&self.inner);
        StatsSnapshot {
            total: agg.total,
            success_count: agg.success,
            failed_count: agg.failed,
            timeout_count: agg.timeouts,
            status_histogram: agg.status_histogram.clone(),
            latency: LatencyStats {
                count: agg.latency.count(),
                avg_ms: agg.latency.mean(),
                min_ms: agg.latency.min(),
                max_ms: agg.latency.max(),
                p50_ms: agg.latency_histogram.quantile_ms(0.50),
                p90_ms: agg.latency_histogram.quantile_ms(0.90),
                p99_ms: agg.latency_histogram.quantile_ms(0.99),
            },
            throughput: ThroughputStats {
                count: agg.throughput.count(),
                avg_kbps: agg.throughput.mean(),
                min_kbps: agg.throughput.min(),
                max_kbps: agg.throughput.max(),
                samples: agg.throughput_samples.iter().copied().collect(),
            },
        }
    }
}

impl Default for StatsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for StatsAggregator {
    fn on_progress(&self, _sample: &ProgressSample) {}

    fn on_result(&self, result: &ProbeResult) {
        self.record(result);
    }
}
