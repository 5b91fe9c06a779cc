use super::helpers::{
    ProxyContext, classify_failure, decode_body_preview, fetch_connect_code, is_status_line,
    parse_content_length, proxy_address,
};
use super::speed::{CHUNK_SIZE, SpeedMeter, kbps, progress_percent};
use crate::common::net::redact_url;
use crate::config::{ProbeId, ProbeKind, ProbeTarget};
use crate::probe::{CancelToken, Probe, ProbeOutcome, ProbeResult, ProgressFn, ProgressSample};
use curl::Error as CurlError;
use curl::easy::{Easy2, Handler, WriteError};
use std::time::{Duration, Instant, SystemTime};

/// Body bytes retained for diagnostics, per probe kind.
const LATENCY_BODY_LIMIT: usize = 64 * 1024;
const THROUGHPUT_BODY_LIMIT: usize = 4 * 1024;
const MAX_REDIRECTS: u32 = 10;
const USER_AGENT: &str = concat!("proxyprobe/", env!("CARGO_PKG_VERSION"));

struct ProbeHandler {
    probe_id: ProbeId,
    kind: ProbeKind,
    cancel: CancelToken,
    progress: Option<ProgressFn>,
    cancelled: bool,
    bytes: u64,
    body: Vec<u8>,
    body_limit: usize,
    content_length: Option<u64>,
    header_blocks: Vec<String>,
    meter: Option<SpeedMeter>,
}

impl Default for ProbeHandler {
    fn default() -> Self {
        Self {
            probe_id: 0,
            kind: ProbeKind::Latency,
            cancel: CancelToken::new(),
            progress: None,
            cancelled: false,
            bytes: 0,
            body: Vec::new(),
            body_limit: LATENCY_BODY_LIMIT,
            content_length: None,
            header_blocks: Vec::new(),
            meter: None,
        }
    }
}

impl ProbeHandler {
    fn reset(&mut self, target: &ProbeTarget, cancel: &CancelToken, progress: Option<ProgressFn>) {
        self.probe_id = target.id();
        self.kind = target.kind();
        self.cancel = cancel.clone();
        self.progress = progress;
        self.cancelled = false;
        self.bytes = 0;
        self.body.clear();
        self.body_limit = match target.kind() {
            ProbeKind::Latency => LATENCY_BODY_LIMIT,
            ProbeKind::Throughput => THROUGHPUT_BODY_LIMIT,
        };
        self.content_length = None;
        self.header_blocks.clear();
        self.meter = None;
    }

    fn observe_cancel(&mut self) -> bool {
        if self.cancel.is_cancelled() {
            self.cancelled = true;
        }
        self.cancelled
    }

    fn emit_progress(&mut self, chunk: usize, now: Instant) {
        let meter = self.meter.get_or_insert_with(|| SpeedMeter::new(now));
        let Some(reading) = meter.record(chunk, now) else {
            return;
        };
        if let Some(progress) = &self.progress {
            progress(ProgressSample {
                probe_id: self.probe_id,
                bytes_so_far: reading.bytes_so_far,
                total_bytes: self.content_length,
                instantaneous_speed_kbps: reading.instantaneous_kbps,
                smoothed_speed_kbps: reading.smoothed_kbps,
                rolling_avg_kbps: reading.rolling_avg_kbps,
                progress_percent: progress_percent(reading.bytes_so_far, self.content_length),
                timestamp: SystemTime::now(),
            });
        }
    }
}

impl Handler for ProbeHandler {
    fn write(&mut self, data: &[u8]) -> Result<usize, WriteError> {
        // A short write makes curl abort the transfer with a write error.
        if self.observe_cancel() {
            return Ok(0);
        }

        self.bytes = self.bytes.saturating_add(data.len() as u64);
        let room = self.body_limit.saturating_sub(self.body.len());
        self.body.extend_from_slice(&data[..data.len().min(room)]);

        if self.kind == ProbeKind::Throughput {
            self.emit_progress(data.len(), Instant::now());
        }
        Ok(data.len())
    }

    fn header(&mut self, data: &[u8]) -> bool {
        let line = String::from_utf8_lossy(data);
        if is_status_line(&line) {
            self.header_blocks.push(String::new());
            self.content_length = None;
            self.meter = None;
        } else if line.trim().is_empty() {
            if self.kind == ProbeKind::Throughput {
                // Speed windows start once the final response head is in.
                self.meter = Some(SpeedMeter::new(Instant::now()));
            }
        } else if let Some(length) = parse_content_length(&line) {
            self.content_length = Some(length);
        }
        if let Some(block) = self.header_blocks.last_mut() {
            block.push_str(&line);
        }
        true
    }

    fn progress(&mut self, _dltotal: f64, _dlnow: f64, _ultotal: f64, _ulnow: f64) -> bool {
        !self.observe_cancel()
    }
}

/// libcurl-backed prober. One instance per worker thread; the handle is
/// reset between probes so connections can be reused.
pub struct Prober {
    easy: Easy2<ProbeHandler>,
}

impl Prober {
    pub fn new() -> Result<Self, CurlError> {
        let mut easy = Easy2::new(ProbeHandler::default());
        easy.useragent(USER_AGENT)?;
        Ok(Self { easy })
    }

    /// Runs `target` with a fresh cancellation token and no progress
    /// listener.
    pub fn execute_once(&mut self, target: &ProbeTarget) -> ProbeResult {
        self.execute(target, &CancelToken::new(), None)
    }

    fn configure(&mut self, target: &ProbeTarget) -> Result<(), CurlError> {
        self.easy.reset();
        self.easy.useragent(USER_AGENT)?;
        self.easy.url(target.url().as_str())?;
        // An empty proxy string also disables proxies taken from the environment.
        let proxy = target.proxy().map(proxy_address).unwrap_or_default();
        self.easy.proxy(&proxy)?;
        self.easy.timeout(target.timeout())?;
        self.easy.follow_location(true)?;
        self.easy.max_redirections(MAX_REDIRECTS)?;
        self.easy.buffer_size(CHUNK_SIZE)?;
        self.easy.progress(true)?;
        if target.kind() == ProbeKind::Latency {
            self.easy.accept_encoding("")?;
        }
        Ok(())
    }

    fn run(&mut self, target: &ProbeTarget) -> ProbeResult {
        let started = Instant::now();
        let perform_result = self.easy.perform();
        let elapsed = started.elapsed();

        let handler = self.easy.get_mut();
        let cancelled = handler.cancelled;
        let bytes = handler.bytes;
        let transferred = match target.kind() {
            ProbeKind::Latency => 0,
            ProbeKind::Throughput => bytes,
        };
        let body = std::mem::take(&mut handler.body);
        let proxy_text = handler.header_blocks.first().cloned();
        handler.progress = None;

        if cancelled {
            return ProbeResult::cancelled(target, elapsed, transferred);
        }

        if let Err(err) = perform_result {
            let proxy = ProxyContext {
                configured: target.proxy().is_some(),
                connect_code: fetch_connect_code(self.easy.raw()),
                response_text: proxy_text,
            };
            let failure = classify_failure(&err, &proxy);
            return ProbeResult {
                http_status: failure.http_status,
                bytes_transferred: transferred,
                ..ProbeResult::failure(target, failure.outcome, failure.detail, elapsed)
            };
        }

        let status = self
            .easy
            .response_code()
            .ok()
            .filter(|code| *code > 0)
            .and_then(|code| u16::try_from(code).ok());
        self.finish(target, status, body, transferred, elapsed)
    }

    fn finish(
        &self,
        target: &ProbeTarget,
        status: Option<u16>,
        body: Vec<u8>,
        bytes: u64,
        elapsed: Duration,
    ) -> ProbeResult {
        let mut result = ProbeResult {
            id: target.id(),
            kind: target.kind(),
            outcome: ProbeOutcome::Success,
            http_status: status,
            elapsed,
            bytes_transferred: bytes,
            speed_kbps: None,
            body_preview: None,
            error_detail: None,
        };

        match status {
            Some(200) => match target.kind() {
                ProbeKind::Latency => result.body_preview = Some(decode_body_preview(&body)),
                ProbeKind::Throughput => {
                    result.speed_kbps = Some(kbps(bytes, elapsed.as_secs_f64()));
                }
            },
            // Plain-http requests through a proxy see its auth demand as the response.
            Some(407) if target.proxy().is_some() => {
                result.outcome = ProbeOutcome::ProxyError;
                result.error_detail = Some(String::from_utf8_lossy(&body).into_owned());
            }
            Some(code) => {
                result.outcome = ProbeOutcome::HttpError;
                let text = String::from_utf8_lossy(&body);
                result.error_detail = Some(if text.trim().is_empty() {
                    format!("HTTP status {code}")
                } else {
                    text.into_owned()
                });
            }
            None => {
                result.outcome = ProbeOutcome::NetworkError;
                result.error_detail = Some("no HTTP response received".to_string());
            }
        }
        result
    }
}

impl Probe for Prober {
    fn execute(
        &mut self,
        target: &ProbeTarget,
        cancel: &CancelToken,
        progress: Option<ProgressFn>,
    ) -> ProbeResult {
        if cancel.is_cancelled() {
            return ProbeResult::cancelled(target, Duration::ZERO, 0);
        }

        self.easy.get_mut().reset(target, cancel, progress);
        if let Err(err) = self.configure(target) {
            self.easy.get_mut().progress = None;
            return ProbeResult::failure(
                target,
                ProbeOutcome::NetworkError,
                format!("request setup failed: {err}"),
                Duration::ZERO,
            );
        }

        let result = self.run(target);
        tracing::debug!(
            probe_id = result.id,
            proxy = ?target.proxy().map(redact_url),
            outcome = %result.outcome,
            status = ?result.http_status,
            elapsed_ms = result.elapsed.as_millis() as u64,
            "probe finished"
        );
        result
    }
}
