use crate::probe::ProbeOutcome;
use curl::Error as CurlError;
use url::Url;

// CURLINFO constants not exposed by curl-sys
// See: https://curl.se/libcurl/c/CURLINFO_HTTP_CONNECTCODE.html
// Use curl_sys::CURLINFO type for cross-platform compatibility (i32 on Windows, u32 on Unix)
const CURLINFO_LONG: curl_sys::CURLINFO = 0x200000;
const CURLINFO_HTTP_CONNECTCODE: curl_sys::CURLINFO = CURLINFO_LONG + 22;

// CURLE_PROXY, added in libcurl 7.73.0
const CURLE_PROXY: curl_sys::CURLcode = 97;

/// What the transfer learned about the proxy leg of a failed request.
#[derive(Clone, Debug, Default)]
pub(super) struct ProxyContext {
    pub configured: bool,
    /// Status the proxy answered the CONNECT request with, if it answered.
    pub connect_code: Option<u16>,
    /// Raw header block of the proxy's own response.
    pub response_text: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub(super) struct Failure {
    pub outcome: ProbeOutcome,
    pub http_status: Option<u16>,
    pub detail: String,
}

/// Maps a failed transfer onto a probe outcome.
///
/// A proxy failure carries an HTTP status only when the proxy itself answered
/// the tunnel request with a non-2xx status; every other proxy failure
/// (unresolvable, unreachable, dropped handshake) is a plain `ProxyError`.
pub(super) fn classify_failure(err: &CurlError, proxy: &ProxyContext) -> Failure {
    classify(
        err.code(),
        &err.to_string(),
        CurlFlags::from_error(err),
        proxy,
    )
}

#[derive(Clone, Copy, Debug, Default)]
struct CurlFlags {
    timed_out: bool,
    couldnt_resolve_proxy: bool,
    couldnt_connect: bool,
}

impl CurlFlags {
    fn from_error(err: &CurlError) -> Self {
        Self {
            timed_out: err.is_operation_timedout(),
            couldnt_resolve_proxy: err.is_couldnt_resolve_proxy(),
            couldnt_connect: err.is_couldnt_connect(),
        }
    }
}

fn classify(
    code: curl_sys::CURLcode,
    message: &str,
    flags: CurlFlags,
    proxy: &ProxyContext,
) -> Failure {
    if flags.timed_out {
        return Failure {
            outcome: ProbeOutcome::Timeout,
            http_status: None,
            detail: format!("request timed out: {message}"),
        };
    }

    if proxy.configured {
        if let Some(status) = proxy.connect_code
            && !(200..300).contains(&status)
        {
            let detail = proxy
                .response_text
                .as_deref()
                .map(str::trim)
                .filter(|text| !text.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| format!("proxy refused tunnel with status {status}"));
            return Failure {
                outcome: ProbeOutcome::ProxyError,
                http_status: Some(status),
                detail,
            };
        }

        if flags.couldnt_resolve_proxy
            || flags.couldnt_connect
            || code == CURLE_PROXY
            || is_tunnel_failure_message(message)
        {
            return Failure {
                outcome: ProbeOutcome::ProxyError,
                http_status: None,
                detail: format!("proxy connection failed: {message}"),
            };
        }
    }

    Failure {
        outcome: ProbeOutcome::NetworkError,
        http_status: None,
        detail: format!("connection error: {message}"),
    }
}

fn is_tunnel_failure_message(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("connect tunnel")
        || message.contains("proxy connect")
        || message.contains("socks")
        || message.contains("received http code") && message.contains("from proxy")
}

/// Status the proxy gave the CONNECT request; `None` when no tunnel was
/// attempted or the proxy never answered.
pub(super) fn fetch_connect_code(handle: *mut curl_sys::CURL) -> Option<u16> {
    if handle.is_null() {
        return None;
    }

    unsafe {
        let mut code: std::os::raw::c_long = 0;
        let rc = curl_sys::curl_easy_getinfo(
            handle,
            CURLINFO_HTTP_CONNECTCODE,
            &mut code as *mut std::os::raw::c_long,
        );
        if rc != curl_sys::CURLE_OK || code <= 0 {
            return None;
        }
        u16::try_from(code).ok()
    }
}

/// Pretty-printed JSON when the body parses as JSON, otherwise lossy UTF-8
/// text. Never fails.
pub(super) fn decode_body_preview(body: &[u8]) -> String {
    match serde_json::from_slice::<serde_json::Value>(body) {
        Ok(value) => serde_json::to_string_pretty(&value)
            .unwrap_or_else(|_| String::from_utf8_lossy(body).into_owned()),
        Err(_) => String::from_utf8_lossy(body).into_owned(),
    }
}

/// `scheme://[user[:pass]@]host[:port]` without the path `Url` always
/// carries, which is the form libcurl expects for CURLOPT_PROXY.
pub(super) fn proxy_address(proxy: &Url) -> String {
    let mut address = format!("{}://", proxy.scheme());
    if !proxy.username().is_empty() {
        address.push_str(proxy.username());
        if let Some(password) = proxy.password() {
            address.push(':');
            address.push_str(password);
        }
        address.push('@');
    }
    address.push_str(proxy.host_str().unwrap_or_default());
    if let Some(port) = proxy.port_or_known_default() {
        address.push_str(&format!(":{port}"));
    }
    address
}

pub(super) fn parse_content_length(line: &str) -> Option<u64> {
    let (name, value) = line.split_once(':')?;
    if !name.trim().eq_ignore_ascii_case("content-length") {
        return None;
    }
    value.trim().parse().ok()
}

pub(super) fn is_status_line(line: &str) -> bool {
    line.starts_with("HTTP/")
}
