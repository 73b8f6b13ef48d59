//! URL and domain derivations.

use async_trait::async_trait;
use url::Url;

use deeper_core::error::AppError;
use deeper_core::plugin::Plugin;
use deeper_core::trace::{Trace, TraceKind};

/// url → domain (host name).
pub struct UrlHostExtractor;

#[async_trait]
impl Plugin for UrlHostExtractor {
    fn name(&self) -> &str {
        "url-host"
    }

    fn input_kind(&self) -> TraceKind {
        TraceKind::Url
    }

    async fn expand(&self, trace: &Trace) -> Result<Vec<Trace>, AppError> {
        let parsed = match Url::parse(&trace.value) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::debug!(url = %trace.value, error = %e, "Unparseable URL");
                return Ok(Vec::new());
            }
        };
        match parsed.host_str() {
            Some(host) => Ok(vec![Trace::new(host.to_lowercase(), TraceKind::Domain)]),
            None => Ok(Vec::new()),
        }
    }
}

const SCHEMES: [&str; 2] = ["http", "https"];

/// domain → url candidates for both schemes.
///
/// Emits both candidates unverified; reachability probing is a
/// network-plugin concern and the built-ins stay offline.
pub struct UrlBuilder;

#[async_trait]
impl Plugin for UrlBuilder {
    fn name(&self) -> &str {
        "url-builder"
    }

    fn input_kind(&self) -> TraceKind {
        TraceKind::Domain
    }

    async fn expand(&self, trace: &Trace) -> Result<Vec<Trace>, AppError> {
        Ok(SCHEMES
            .iter()
            .map(|scheme| Trace::new(format!("{scheme}://{}", trace.value), TraceKind::Url))
            .collect())
    }
}
