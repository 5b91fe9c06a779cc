use crate::config::{LATENCY_TIMEOUT, ProbeKind, ProbeTarget, parse_proxy_url, parse_target_url};
use crate::probe::{CancelToken, Probe, ProbeOutcome, ProbeResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RelayRequest {
    pub target_url: String,
    #[serde(default)]
    pub proxy_url: Option<String>,
    /// Opaque caller token, echoed back.
    #[serde(default)]
    pub request_id: Option<Value>,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RelayResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    /// Seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time: Option<f64>,
    pub details: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Value>,
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("malformed relay request: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("failed to encode relay response: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Runs one relay request as a latency probe.
pub fn handle(probe: &mut dyn Probe, request: &RelayRequest) -> RelayResponse {
    let target = match build_target(request) {
        Ok(target) => target,
        Err(reason) => {
            return RelayResponse {
                success: false,
                status_code: None,
                response_time: None,
                details: reason,
                error: Some("INVALID_REQUEST".to_string()),
                request_id: request.request_id.clone(),
            };
        }
    };

    let result = probe.execute(&target, &CancelToken::new(), None);
    tracing::debug!(
        url = %target.url(),
        outcome = %result.outcome,
        "relay request finished"
    );
    respond(request, &result)
}

/// Decodes one JSON request line and encodes the response as one line.
pub fn handle_line(probe: &mut dyn Probe, line: &str) -> Result<String, RelayError> {
    let request: RelayRequest = serde_json::from_str(line).map_err(RelayError::Malformed)?;
    let response = handle(probe, &request);
    serde_json::to_string(&response).map_err(RelayError::Encode)
}

/// Response for a line that could not be decoded at all.
pub fn malformed_response(err: &RelayError) -> RelayResponse {
    RelayResponse {
        success: false,
        status_code: None,
        response_time: None,
        details: err.to_string(),
        error: Some("INVALID_REQUEST".to_string()),
        request_id: None,
    }
}

fn build_target(request: &RelayRequest) -> Result<ProbeTarget, String> {
    let url = parse_target_url(&request.target_url).map_err(|err| err.to_string())?;
    let proxy = match request.proxy_url.as_deref().map(str::trim) {
        Some(proxy) if !proxy.is_empty() => {
            Some(parse_proxy_url(proxy).map_err(|err| err.to_string())?)
        }
        _ => None,
    };
    Ok(ProbeTarget::new(1, url, ProbeKind::Latency)
        .with_proxy(proxy)
        .with_timeout(LATENCY_TIMEOUT))
}

fn respond(request: &RelayRequest, result: &ProbeResult) -> RelayResponse {
    let seconds = result.elapsed.as_secs_f64();
    let request_id = request.request_id.clone();
    let request_label = request_id
        .as_ref()
        .map(|id| match id {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        })
        .unwrap_or_else(|| "-".to_string());

    if result.outcome == ProbeOutcome::Success {
        let status = result.http_status.unwrap_or(200);
        return RelayResponse {
            success: true,
            status_code: Some(status),
            response_time: Some(seconds),
            details: format!(
                "request id: {request_label}\nresponse time: {seconds:.2}s\nstatus: {status}\n\nresponse:\n{}",
                result.body_preview.as_deref().unwrap_or("")
            ),
            error: None,
            request_id,
        };
    }

    let detail = result.error_detail.as_deref().unwrap_or("");
    let (error, details) = match (result.outcome, result.http_status) {
        (ProbeOutcome::Timeout, _) => ("timeout".to_string(), "connection timed out".to_string()),
        (_, Some(status)) => (
            status.to_string(),
            format!("HTTP error: {status}\nresponse:\n{detail}"),
        ),
        (outcome, None) => (
            outcome.classification_name().to_string(),
            format!("connection error: {detail}"),
        ),
    };
    RelayResponse {
        success: false,
        status_code: result.http_status,
        response_time: Some(seconds),
        details,
        error: Some(error),
        request_id,
    }
}
