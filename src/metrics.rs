use serde::Serialize;
use std::collections::BTreeMap;

/// Latency of successful latency probes, in milliseconds.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct LatencyStats {
    pub count: u64,
    pub avg_ms: Option<f64>,
    pub min_ms: Option<f64>,
    pub max_ms: Option<f64>,
    pub p50_ms: Option<f64>,
    pub p90_ms: Option<f64>,
    pub p99_ms: Option<f64>,
}

/// Whole-transfer speed of successful throughput probes, in KiB/s.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ThroughputStats {
    pub count: u64,
    pub avg_kbps: Option<f64>,
    pub min_kbps: Option<f64>,
    pub max_kbps: Option<f64>,
    /// Most recent speeds in completion order, for charting.
    pub samples: Vec<f64>,
}

/// Point-in-time copy of the aggregate counters.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub total: u64,
    pub success_count: u64,
    pub failed_count: u64,
    pub timeout_count: u64,
    /// Keyed by HTTP status, or by classification name when there was none.
    pub status_histogram: BTreeMap<String, u64>,
    pub latency: LatencyStats,
    pub throughput: ThroughputStats,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StatusShare {
    pub key: String,
    pub count: u64,
    pub percent: f64,
}

impl StatsSnapshot {
    pub fn success_rate(&self) -> f64 {
        percent(self.success_count, self.total)
    }

    pub fn failure_rate(&self) -> f64 {
        percent(self.failed_count, self.total)
    }

    pub fn timeout_rate(&self) -> f64 {
        percent(self.timeout_count, self.total)
    }

    pub fn status_share(&self, key: &str) -> f64 {
        percent(
            self.status_histogram.get(key).copied().unwrap_or(0),
            self.total,
        )
    }

    /// Histogram entries, most frequent first.
    pub fn status_shares(&self) -> Vec<StatusShare> {
        let mut shares: Vec<StatusShare> = self
            .status_histogram
            .iter()
            .map(|(key, count)| StatusShare {
                key: key.clone(),
                count: *count,
                percent: percent(*count, self.total),
            })
            .collect();
        shares.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));
        shares
    }

    pub fn histogram_total(&self) -> u64 {
        self.status_histogram.values().sum()
    }
}

fn percent(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64 * 100.0
    }
}
