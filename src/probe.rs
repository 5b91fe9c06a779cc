use crate::config::{BatchId, ProbeId, ProbeKind, ProbeTarget};
use crate::runtime::BatchStatus;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeOutcome {
    Success,
    HttpError,
    Timeout,
    ProxyError,
    NetworkError,
    Cancelled,
}

impl ProbeOutcome {
    pub fn label(self) -> &'static str {
        match self {
            ProbeOutcome::Success => "success",
            ProbeOutcome::HttpError => "http_error",
            ProbeOutcome::Timeout => "timeout",
            ProbeOutcome::ProxyError => "proxy_error",
            ProbeOutcome::NetworkError => "network_error",
            ProbeOutcome::Cancelled => "cancelled",
        }
    }

    /// Histogram key used when no HTTP status was captured.
    pub fn classification_name(self) -> &'static str {
        match self {
            ProbeOutcome::Success => "OK",
            ProbeOutcome::HttpError => "HTTP_ERROR",
            ProbeOutcome::Timeout => "TIMEOUT",
            ProbeOutcome::ProxyError => "PROXY_ERROR",
            ProbeOutcome::NetworkError => "CONNECTION_ERROR",
            ProbeOutcome::Cancelled => "CANCELLED",
        }
    }

    pub fn is_success(self) -> bool {
        self == ProbeOutcome::Success
    }
}

impl fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Terminal record of one probe. Owned by whoever receives it; never mutated
/// after the prober returns it.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProbeResult {
    pub id: ProbeId,
    pub kind: ProbeKind,
    pub outcome: ProbeOutcome,
    pub http_status: Option<u16>,
    #[serde(rename = "elapsed_ms", serialize_with = "as_millis")]
    pub elapsed: Duration,
    pub bytes_transferred: u64,
    /// Whole-transfer speed of a successful throughput probe.
    pub speed_kbps: Option<f64>,
    pub body_preview: Option<String>,
    pub error_detail: Option<String>,
}

impl ProbeResult {
    pub fn failure(
        target: &ProbeTarget,
        outcome: ProbeOutcome,
        detail: impl Into<String>,
        elapsed: Duration,
    ) -> Self {
        Self {
            id: target.id(),
            kind: target.kind(),
            outcome,
            http_status: None,
            elapsed,
            bytes_transferred: 0,
            speed_kbps: None,
            body_preview: None,
            error_detail: Some(detail.into()),
        }
    }

    pub fn cancelled(target: &ProbeTarget, elapsed: Duration, bytes_transferred: u64) -> Self {
        Self {
            bytes_transferred,
            ..Self::failure(
                target,
                ProbeOutcome::Cancelled,
                "probe cancelled before completion",
                elapsed,
            )
        }
    }

    /// Status code when known, otherwise the outcome's classification name.
    pub fn classification_key(&self) -> String {
        match self.http_status {
            Some(status) => status.to_string(),
            None => self.outcome.classification_name().to_string(),
        }
    }

    /// First line of whatever diagnostics the probe captured.
    pub fn summary_line(&self) -> String {
        let text = self
            .error_detail
            .as_deref()
            .or(self.body_preview.as_deref())
            .unwrap_or("");
        text.lines().next().unwrap_or("").trim().to_string()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProgressSample {
    pub probe_id: ProbeId,
    pub bytes_so_far: u64,
    /// Content length announced by the server, if any.
    pub total_bytes: Option<u64>,
    pub instantaneous_speed_kbps: f64,
    pub smoothed_speed_kbps: f64,
    pub rolling_avg_kbps: f64,
    pub progress_percent: Option<f64>,
    pub timestamp: SystemTime,
}

/// Everything a batch publishes, in the order it happened for any one probe.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProbeEvent {
    Progress(ProgressSample),
    Result(ProbeResult),
    Status {
        batch_id: BatchId,
        status: BatchStatus,
    },
}

impl ProbeEvent {
    pub fn is_progress(&self) -> bool {
        matches!(self, ProbeEvent::Progress(_))
    }
}

fn as_millis<S: Serializer>(elapsed: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(elapsed.as_secs_f64() * 1000.0)
}

/// Shared cooperative cancellation flag. Clones observe the same flag.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub type ProgressFn = Arc<dyn Fn(ProgressSample) + Send + Sync>;

/// Executes one target synchronously. Expected network conditions resolve to
/// a `ProbeResult` outcome; implementations never panic on them.
pub trait Probe: Send {
    fn execute(
        &mut self,
        target: &ProbeTarget,
        cancel: &CancelToken,
        progress: Option<ProgressFn>,
    ) -> ProbeResult;
}
