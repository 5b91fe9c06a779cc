use crate::config::{LATENCY_TIMEOUT, ProbeKind, ProbeTarget};
use crate::probe::{CancelToken, Probe};
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt::Write as _;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// IP information services, tried in order.
pub const IP_SERVICES: [&str; 4] = [
    "https://ipinfo.ipidea.io",
    "https://ipinfo.io/json",
    "https://api.ipify.org?format=json",
    "https://api.myip.com",
];

/// Where requests appear to come from, as reported by an IP info service.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct EgressInfo {
    pub service: String,
    pub ip: String,
    pub hostname: String,
    pub country: String,
    pub country_code: String,
    pub region: String,
    pub city: String,
    pub loc: String,
    pub postal: String,
    pub timezone: String,
    pub org: String,
    pub asn: String,
    pub asn_name: String,
    pub asn_domain: String,
    pub asn_route: String,
    pub asn_type: String,
}

#[derive(Debug, Error)]
pub enum EgressError {
    #[error("all IP services failed: {}", .attempts.join("; "))]
    AllFailed { attempts: Vec<String> },
}

impl EgressInfo {
    /// Reads the fields the known services use. `None` without an `ip`.
    pub fn from_json(service: &str, data: &Value) -> Option<Self> {
        let object = data.as_object()?;
        let ip = text(object, &["ip"]);
        if ip.is_empty() {
            return None;
        }
        // ipinfo nests ASN details in an object; other services flatten them.
        let asn_object = object.get("asn").and_then(Value::as_object);
        let asn_field = |nested: &str, flat: &str| match asn_object {
            Some(asn) => text(asn, &[nested]),
            None => text(object, &[flat]),
        };

        Some(Self {
            service: service.to_string(),
            ip,
            hostname: text(object, &["hostname"]),
            country: text(object, &["country_code", "country"]),
            country_code: text(object, &["country_code", "countryCode"]),
            region: text(object, &["province", "region"]),
            city: text(object, &["city"]),
            loc: text(object, &["loc"]),
            postal: text(object, &["postal"]),
            timezone: text(object, &["timezone"]),
            org: text(object, &["org"]),
            asn: asn_field("asn", "asn"),
            asn_name: asn_field("name", "asn_name"),
            asn_domain: asn_field("domain", "asn_domain"),
            asn_route: asn_field("route", "asn_route"),
            asn_type: asn_field("type", "asn_type"),
        })
    }

    /// Multi-line summary, omitting empty fields.
    pub fn render(&self) -> String {
        let mut out = format!("IP: {}", self.ip);
        let location = [&self.country, &self.region, &self.city]
            .iter()
            .filter(|part| !part.is_empty())
            .map(|part| part.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        let lines = [
            ("Hostname", self.hostname.as_str()),
            ("Location", location.as_str()),
            ("Coordinates", self.loc.as_str()),
            ("Postal", self.postal.as_str()),
            ("Timezone", self.timezone.as_str()),
            ("Org", self.org.as_str()),
            ("ASN", self.asn.as_str()),
            ("ASN name", self.asn_name.as_str()),
            ("ASN domain", self.asn_domain.as_str()),
            ("ASN route", self.asn_route.as_str()),
            ("ASN type", self.asn_type.as_str()),
        ];
        for (label, value) in lines {
            if !value.is_empty() {
                let _ = write!(out, "\n{label}: {value}");
            }
        }
        out
    }

    pub fn is_mainland_china(&self) -> bool {
        self.country_code.eq_ignore_ascii_case("CN")
    }
}

/// Queries `services` in order, through `proxy` when given, and returns the
/// first answer carrying an IP address.
pub fn lookup(
    probe: &mut dyn Probe,
    services: &[&str],
    proxy: Option<&Url>,
    timeout: Option<Duration>,
) -> Result<EgressInfo, EgressError> {
    let mut attempts = Vec::new();
    for (index, service) in services.iter().enumerate() {
        let url = match Url::parse(service) {
            Ok(url) => url,
            Err(err) => {
                attempts.push(format!("{service}: {err}"));
                continue;
            }
        };
        let target = ProbeTarget::new(index as u64 + 1, url, ProbeKind::Latency)
            .with_proxy(proxy.cloned())
            .with_timeout(timeout.unwrap_or(LATENCY_TIMEOUT));
        let result = probe.execute(&target, &CancelToken::new(), None);

        if !result.outcome.is_success() {
            tracing::debug!(service, outcome = %result.outcome, "ip service failed");
            attempts.push(format!("{service}: {}", result.classification_key()));
            continue;
        }
        let parsed = result
            .body_preview
            .as_deref()
            .and_then(|body| serde_json::from_str::<Value>(body).ok())
            .and_then(|data| EgressInfo::from_json(service, &data));
        match parsed {
            Some(info) => return Ok(info),
            None => attempts.push(format!("{service}: unrecognised response")),
        }
    }
    Err(EgressError::AllFailed { attempts })
}

fn text(object: &Map<String, Value>, keys: &[&str]) -> String {
    keys.iter()
        .filter_map(|key| object.get(*key))
        .find_map(|value| match value {
            Value::String(text) if !text.is_empty() => Some(text.clone()),
            Value::Number(number) => Some(number.to_string()),
            _ => None,
        })
        .unwrap_or_default()
}
