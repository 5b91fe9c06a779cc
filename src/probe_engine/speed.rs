use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Minimum spacing between two progress samples.
pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(100);
/// Number of smoothed readings kept for the rolling average.
pub const HISTORY_LEN: usize = 10;
/// Read buffer size requested from the transfer layer.
pub const CHUNK_SIZE: usize = 8 * 1024;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SpeedReading {
    pub bytes_so_far: u64,
    pub instantaneous_kbps: f64,
    pub smoothed_kbps: f64,
    pub rolling_avg_kbps: f64,
}

/// Windowed download speed estimator.
///
/// Bytes accumulate into the current window until at least
/// [`SAMPLE_INTERVAL`] has passed; the window then yields one reading and
/// restarts. Each reading is averaged with the previous smoothed value to damp
/// jitter, and the last [`HISTORY_LEN`] smoothed values feed a rolling mean.
#[derive(Clone, Debug)]
pub struct SpeedMeter {
    started: Instant,
    window_start: Instant,
    window_bytes: u64,
    total_bytes: u64,
    history: VecDeque<f64>,
}

impl SpeedMeter {
    pub fn new(now: Instant) -> Self {
        Self {
            started: now,
            window_start: now,
            window_bytes: 0,
            total_bytes: 0,
            history: VecDeque::with_capacity(HISTORY_LEN + 1),
        }
    }

    pub fn record(&mut self, bytes: usize, now: Instant) -> Option<SpeedReading> {
        let bytes = bytes as u64;
        self.total_bytes = self.total_bytes.saturating_add(bytes);
        self.window_bytes = self.window_bytes.saturating_add(bytes);

        let window = now.saturating_duration_since(self.window_start);
        if window < SAMPLE_INTERVAL {
            return None;
        }

        let instantaneous = kbps(self.window_bytes, window.as_secs_f64());
        let smoothed = match self.history.back() {
            Some(previous) => (instantaneous + previous) / 2.0,
            None => instantaneous,
        };
        self.history.push_back(smoothed);
        while self.history.len() > HISTORY_LEN {
            self.history.pop_front();
        }
        let rolling = self.history.iter().sum::<f64>() / self.history.len() as f64;

        self.window_start = now;
        self.window_bytes = 0;

        Some(SpeedReading {
            bytes_so_far: self.total_bytes,
            instantaneous_kbps: instantaneous,
            smoothed_kbps: smoothed,
            rolling_avg_kbps: rolling,
        })
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn average_kbps(&self, now: Instant) -> f64 {
        kbps(
            self.total_bytes,
            now.saturating_duration_since(self.started).as_secs_f64(),
        )
    }
}

/// KiB per second; zero when no time has elapsed.
pub fn kbps(bytes: u64, seconds: f64) -> f64 {
    if seconds > 0.0 {
        (bytes as f64 / 1024.0) / seconds
    } else {
        0.0
    }
}

pub fn progress_percent(bytes_so_far: u64, total: Option<u64>) -> Option<f64> {
    let total = total.filter(|total| *total > 0)?;
    Some((bytes_so_far as f64 / total as f64 * 100.0).min(100.0))
}
