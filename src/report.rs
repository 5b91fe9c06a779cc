use crate::common::units::{format_bytes, format_speed};
use crate::metrics::StatsSnapshot;
use crate::probe::{ProbeResult, ProgressSample};
use crate::runtime::BatchState;
use serde::Serialize;
use std::fmt::Write as _;

/// Final report as printed by `run --json`.
#[derive(Debug, Serialize)]
pub struct JsonReport<'a> {
    pub batch: &'a BatchState,
    pub stats: &'a StatsSnapshot,
    /// In completion order.
    pub results: &'a [ProbeResult],
}

pub fn progress_line(sample: &ProgressSample) -> String {
    let percent = sample
        .progress_percent
        .map(|pct| format!(" ({pct:.1}%)"))
        .unwrap_or_default();
    format!(
        "#{:<4} {}{percent}  now {}  avg {}",
        sample.probe_id,
        format_bytes(sample.bytes_so_far),
        format_speed(sample.smoothed_speed_kbps),
        format_speed(sample.rolling_avg_kbps),
    )
}

pub fn result_line(result: &ProbeResult) -> String {
    let mut line = format!(
        "#{:<4} {:<16} {:>8.0} ms",
        result.id,
        result.classification_key(),
        result.elapsed.as_secs_f64() * 1000.0,
    );
    if let Some(speed) = result.speed_kbps {
        let _ = write!(
            line,
            "  {} in {}",
            format_speed(speed),
            format_bytes(result.bytes_transferred)
        );
    }
    let summary = result.summary_line();
    if !summary.is_empty() && !result.outcome.is_success() {
        let _ = write!(line, "  {summary}");
    }
    line
}

pub fn render_text(state: &BatchState, stats: &StatsSnapshot) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "batch {}: {} ({}/{} completed, {} dropped)",
        state.batch_id, state.status, state.completed, state.total, state.dropped
    );
    let _ = writeln!(
        out,
        "success {} ({:.1}%)  failed {} ({:.1}%)  timeout {} ({:.1}%)",
        stats.success_count,
        stats.success_rate(),
        stats.failed_count,
        stats.failure_rate(),
        stats.timeout_count,
        stats.timeout_rate(),
    );

    if !stats.status_histogram.is_empty() {
        out.push_str("status codes:\n");
        for share in stats.status_shares() {
            let _ = writeln!(
                out,
                "  {:<16} {:>6}  {:>5.1}%",
                share.key, share.count, share.percent
            );
        }
    }

    let latency = &stats.latency;
    if let (Some(avg), Some(min), Some(max)) = (latency.avg_ms, latency.min_ms, latency.max_ms) {
        let _ = writeln!(
            out,
            "latency ms: avg {avg:.1}  min {min:.1}  max {max:.1}  p50 {}  p90 {}  p99 {}",
            optional_ms(latency.p50_ms),
            optional_ms(latency.p90_ms),
            optional_ms(latency.p99_ms),
        );
    }

    let throughput = &stats.throughput;
    if let (Some(avg), Some(min), Some(max)) =
        (throughput.avg_kbps, throughput.min_kbps, throughput.max_kbps)
    {
        let _ = writeln!(
            out,
            "throughput: avg {}  min {}  max {}",
            format_speed(avg),
            format_speed(min),
            format_speed(max),
        );
    }
    out
}

fn optional_ms(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |ms| format!("{ms:.1}"))
}

#[cfg(test)]
mod tests {
    use super::{JsonReport, progress_line, render_text, result_line};
    use crate::config::{ProbeKind, ProbeTarget};
    use crate::metrics::{LatencyStats, StatsSnapshot};
    use crate::probe::{ProbeOutcome, ProbeResult, ProgressSample};
    use crate::runtime::{BatchState, BatchStatus};
    use std::collections::BTreeMap;
    use std::time::{Duration, SystemTime};
    use url::Url;
    use uuid::Uuid;

    #[test]
    fn progress_line_shows_percent_when_known() {
        let sample = ProgressSample {
            probe_id: 3,
            bytes_so_far: 512 * 1024,
            total_bytes: Some(1024 * 1024),
            instantaneous_speed_kbps: 1000.0,
            smoothed_speed_kbps: 2048.0,
            rolling_avg_kbps: 1024.0,
            progress_percent: Some(50.0),
            timestamp: SystemTime::now(),
        };
        let line = progress_line(&sample);
        assert!(line.starts_with("#3"));
        assert!(line.contains("512.00 KB (50.0%)"));
        assert!(line.contains("now 2.00 MB/s"));
        assert!(line.contains("avg 1.00 MB/s"));
    }

    #[test]
    fn result_line_includes_failure_summary() {
        let target = ProbeTarget::new(
            9,
            Url::parse("http://127.0.0.1/").expect("url"),
            ProbeKind::Latency,
        );
        let result = ProbeResult::failure(
            &target,
            ProbeOutcome::NetworkError,
            "connection error: refused\nmore",
            Duration::from_millis(12),
        );
        let line = result_line(&result);
        assert!(line.contains("CONNECTION_ERROR"));
        assert!(line.contains("12 ms"));
        assert!(line.ends_with("connection error: refused"));
    }

    #[test]
    fn text_report_lists_rates_and_latency() {
        let mut status_histogram = BTreeMap::new();
        status_histogram.insert("200".to_string(), 3);
        status_histogram.insert("TIMEOUT".to_string(), 1);
        let stats = StatsSnapshot {
            total: 4,
            success_count: 3,
            failed_count: 1,
            timeout_count: 1,
            status_histogram,
            latency: LatencyStats {
                count: 3,
                avg_ms: Some(20.0),
                min_ms: Some(10.0),
                max_ms: Some(30.0),
                p50_ms: Some(20.0),
                p90_ms: None,
                p99_ms: None,
            },
            ..StatsSnapshot::default()
        };
        let state = BatchState {
            batch_id: Uuid::nil(),
            status: BatchStatus::Completed,
            total: 4,
            submitted: 4,
            completed: 4,
            dropped: 0,
            is_running: false,
            is_paused: false,
            cancel_requested: false,
        };

        let report = render_text(&state, &stats);
        assert!(report.contains("completed (4/4 completed, 0 dropped)"));
        assert!(report.contains("success 3 (75.0%)"));
        assert!(report.contains("timeout 1 (25.0%)"));
        assert!(report.contains("avg 20.0  min 10.0  max 30.0  p50 20.0  p90 -"));
        assert!(!report.contains("throughput"));
    }

    #[test]
    fn json_report_lists_results() {
        let target = ProbeTarget::new(
            2,
            Url::parse("http://127.0.0.1/").expect("url"),
            ProbeKind::Latency,
        );
        let results = vec![ProbeResult::failure(
            &target,
            ProbeOutcome::Timeout,
            "timed out",
            Duration::from_millis(10),
        )];
        let state = BatchState {
            batch_id: Uuid::nil(),
            status: BatchStatus::Completed,
            total: 1,
            submitted: 1,
            completed: 1,
            dropped: 0,
            is_running: false,
            is_paused: false,
            cancel_requested: false,
        };
        let stats = StatsSnapshot::default();

        let value = serde_json::to_value(JsonReport {
            batch: &state,
            stats: &stats,
            results: &results,
        })
        .expect("json");

        assert_eq!(value["batch"]["status"], "completed");
        assert_eq!(value["results"][0]["id"], 2);
        assert_eq!(value["results"][0]["outcome"], "timeout");
        assert_eq!(value["results"][0]["error_detail"], "timed out");
    }
}
