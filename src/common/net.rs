use url::Url;

pub fn normalize_url(input: &str, default_scheme: &str) -> Option<Url> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.contains("://") {
        Url::parse(trimmed).ok()
    } else {
        Url::parse(&format!("{default_scheme}://{trimmed}")).ok()
    }
}

/// Renders a URL with any userinfo password masked, for logs and reports.
pub fn redact_url(url: &Url) -> String {
    if url.password().is_none() {
        return url.to_string();
    }
    let mut masked = url.clone();
    let _ = masked.set_password(Some("****"));
    masked.to_string()
}
