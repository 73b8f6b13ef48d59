//! Domain extraction for per-domain rate limiting.
//!
//! Extraction never fails at runtime: values that carry no recognisable
//! domain fall through to [`DEFAULT_DOMAIN`], which the limiter always has a
//! configuration for. Domain strings are only validated when they enter the
//! configuration.

use std::sync::LazyLock;

use regex::Regex;
use url::Url;

/// Catch-all domain covering every value without an extractable domain.
pub const DEFAULT_DOMAIN: &str = "default";

static EMAIL_DOMAIN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9._%+-]+@([a-zA-Z0-9.-]+\.[a-zA-Z]{2,})$").unwrap());

static FQDN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?\.)+[a-zA-Z]{2,}$").unwrap());

/// Extract the rate-limiting domain from a trace value, in priority order:
/// email local-part domain, then `http(s)` URL `host[:port]`, then a bare
/// FQDN, else [`DEFAULT_DOMAIN`]. The result is lowercased.
pub fn extract_domain(value: &str) -> String {
    if let Some(caps) = EMAIL_DOMAIN_RE.captures(value) {
        return caps[1].to_lowercase();
    }

    if value.starts_with("http://") || value.starts_with("https://") {
        if let Ok(url) = Url::parse(value)
            && let Some(host) = url.host_str()
        {
            return match url.port() {
                Some(port) => format!("{}:{port}", host.to_lowercase()),
                None => host.to_lowercase(),
            };
        }
    }

    if FQDN_RE.is_match(value) {
        return value.to_lowercase();
    }

    DEFAULT_DOMAIN.to_string()
}

/// Validate a domain string for use in configuration. The default domain is
/// always accepted.
pub fn is_valid_domain(domain: &str) -> bool {
    if domain == DEFAULT_DOMAIN {
        return true;
    }
    FQDN_RE.is_match(domain)
}
