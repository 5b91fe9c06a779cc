use crate::common::net::normalize_url;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use url::Url;
use uuid::Uuid;

pub type ProbeId = u64;
pub type BatchId = Uuid;

pub const LATENCY_TIMEOUT: Duration = Duration::from_secs(10);
pub const THROUGHPUT_TIMEOUT: Duration = Duration::from_secs(15);

pub const DEFAULT_LATENCY_URL: &str = "https://ipinfo.io/json";
pub const DEFAULT_THROUGHPUT_URL: &str = "https://speed.cloudflare.com/__down?bytes=10485760";

const TARGET_SCHEMES: [&str; 2] = ["http", "https"];
const PROXY_SCHEMES: [&str; 6] = ["http", "https", "socks4", "socks4a", "socks5", "socks5h"];

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    Latency,
    Throughput,
}

impl ProbeKind {
    pub fn label(self) -> &'static str {
        match self {
            ProbeKind::Latency => "latency",
            ProbeKind::Throughput => "throughput",
        }
    }

    pub fn default_timeout(self) -> Duration {
        match self {
            ProbeKind::Latency => LATENCY_TIMEOUT,
            ProbeKind::Throughput => THROUGHPUT_TIMEOUT,
        }
    }

    pub fn default_url(self) -> &'static str {
        match self {
            ProbeKind::Latency => DEFAULT_LATENCY_URL,
            ProbeKind::Throughput => DEFAULT_THROUGHPUT_URL,
        }
    }
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    #[error("request count must be greater than zero (got {value})")]
    InvalidCount { value: usize },
    #[error("concurrency must be greater than zero (got {value})")]
    InvalidConcurrency { value: usize },
    #[error("invalid {field} `{value}`: {reason}")]
    InvalidUrl {
        field: &'static str,
        value: String,
        reason: String,
    },
    #[error("timeout must be greater than zero")]
    InvalidTimeout,
    #[error("at least one target url is required")]
    NoTargets,
    #[error("target factory returned id {got} for slot {expected}")]
    TargetIdMismatch { expected: ProbeId, got: ProbeId },
}

impl ConfigError {
    /// Name of the offending configuration field.
    pub fn field(&self) -> &'static str {
        match self {
            ConfigError::InvalidCount { .. } => "count",
            ConfigError::InvalidConcurrency { .. } => "concurrency",
            ConfigError::InvalidUrl { field, .. } => field,
            ConfigError::InvalidTimeout => "timeout",
            ConfigError::NoTargets => "target",
            ConfigError::TargetIdMismatch { .. } => "id",
        }
    }
}

/// One unit of work. Built once, then shared read-only with the worker that
/// executes it.
#[derive(Clone, Debug, PartialEq)]
pub struct ProbeTarget {
    id: ProbeId,
    url: Url,
    proxy: Option<Url>,
    timeout: Duration,
    kind: ProbeKind,
}

impl ProbeTarget {
    pub fn new(id: ProbeId, url: Url, kind: ProbeKind) -> Self {
        Self {
            id,
            url,
            proxy: None,
            timeout: kind.default_timeout(),
            kind,
        }
    }

    pub fn with_proxy(mut self, proxy: Option<Url>) -> Self {
        self.proxy = proxy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn id(&self) -> ProbeId {
        self.id
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn proxy(&self) -> Option<&Url> {
        self.proxy.as_ref()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn kind(&self) -> ProbeKind {
        self.kind
    }
}

/// Stamps out targets for a batch. Target `id` uses `urls[(id - 1) % len]`,
/// so several download files can be rotated through one run.
#[derive(Clone, Debug, PartialEq)]
pub struct TargetTemplate {
    urls: Vec<Url>,
    proxy: Option<Url>,
    timeout: Duration,
    kind: ProbeKind,
}

impl TargetTemplate {
    pub fn new(urls: Vec<Url>, kind: ProbeKind) -> Result<Self, ConfigError> {
        if urls.is_empty() {
            return Err(ConfigError::NoTargets);
        }
        Ok(Self {
            urls,
            proxy: None,
            timeout: kind.default_timeout(),
            kind,
        })
    }

    pub fn with_proxy(mut self, proxy: Option<Url>) -> Self {
        self.proxy = proxy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self, ConfigError> {
        if timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout);
        }
        self.timeout = timeout;
        Ok(self)
    }

    pub fn kind(&self) -> ProbeKind {
        self.kind
    }

    pub fn urls(&self) -> &[Url] {
        &self.urls
    }

    pub fn proxy(&self) -> Option<&Url> {
        self.proxy.as_ref()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn target(&self, id: ProbeId) -> ProbeTarget {
        let slot = (id.saturating_sub(1) % self.urls.len() as u64) as usize;
        ProbeTarget::new(id, self.urls[slot].clone(), self.kind)
            .with_proxy(self.proxy.clone())
            .with_timeout(self.timeout)
    }
}

/// Source of the targets of one batch. Called once per slot with the id the
/// runner assigned, in ascending order.
pub trait TargetFactory {
    fn build(&mut self, id: ProbeId) -> ProbeTarget;
}

impl TargetFactory for TargetTemplate {
    fn build(&mut self, id: ProbeId) -> ProbeTarget {
        self.target(id)
    }
}

impl<F> TargetFactory for F
where
    F: FnMut(ProbeId) -> ProbeTarget,
{
    fn build(&mut self, id: ProbeId) -> ProbeTarget {
        self(id)
    }
}

pub fn parse_target_url(input: &str) -> Result<Url, ConfigError> {
    parse_with_schemes(input, "target url", &TARGET_SCHEMES, "https")
}

/// Accepts `scheme://[user:pass@]host:port`; a bare `host:port` is read as an
/// http proxy.
pub fn parse_proxy_url(input: &str) -> Result<Url, ConfigError> {
    parse_with_schemes(input, "proxy url", &PROXY_SCHEMES, "http")
}

fn parse_with_schemes(
    input: &str,
    field: &'static str,
    schemes: &[&str],
    default_scheme: &str,
) -> Result<Url, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidUrl {
        field,
        value: input.trim().to_string(),
        reason: reason.to_string(),
    };

    let url = normalize_url(input, default_scheme).ok_or_else(|| invalid("not a valid url"))?;
    if !schemes.contains(&url.scheme()) {
        return Err(invalid(&format!("unsupported scheme `{}`", url.scheme())));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(invalid("missing host"));
    }
    Ok(url)
}
