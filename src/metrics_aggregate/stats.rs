use hdrhistogram::Histogram;

// Latency is recorded in microseconds, up to one hour.
const HISTOGRAM_LOW_US: u64 = 1;
const HISTOGRAM_HIGH_US: u64 = 3_600_000_000;
const HISTOGRAM_SIGFIG: u8 = 3;

/// Exact running count/sum/min/max.
#[derive(Clone, Debug, Default)]
pub(super) struct RunningStat {
    count: u64,
    sum: f64,
    min: Option<f64>,
    max: Option<f64>,
}

impl RunningStat {
    pub(super) fn record(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        self.count += 1;
        self.sum += value;
        self.min = Some(self.min.map_or(value, |min| min.min(value)));
        self.max = Some(self.max.map_or(value, |max| max.max(value)));
    }

    pub(super) fn count(&self) -> u64 {
        self.count
    }

    pub(super) fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    pub(super) fn min(&self) -> Option<f64> {
        self.min
    }

    pub(super) fn max(&self) -> Option<f64> {
        self.max
    }
}

/// Approximate latency percentiles backed by an HDR histogram.
pub(super) struct LatencyHistogram {
    histogram: Option<Histogram<u64>>,
}

impl LatencyHistogram {
    pub(super) fn new() -> Self {
        let histogram =
            Histogram::<u64>::new_with_bounds(HISTOGRAM_LOW_US, HISTOGRAM_HIGH_US, HISTOGRAM_SIGFIG)
                .ok();
        Self { histogram }
    }

    pub(super) fn record_ms(&mut self, ms: f64) {
        if let Some(histogram) = self.histogram.as_mut() {
            let micros = (ms * 1000.0).max(0.0) as u64;
            histogram.saturating_record(micros);
        }
    }

    /// Value at quantile `q` in milliseconds; `None` until something is recorded.
    pub(super) fn quantile_ms(&self, q: f64) -> Option<f64> {
        let histogram = self.histogram.as_ref()?;
        if histogram.is_empty() {
            return None;
        }
        Some(histogram.value_at_quantile(q) as f64 / 1000.0)
    }
}
