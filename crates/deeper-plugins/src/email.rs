//! Email-derived traces: the local part becomes a username, the part after
//! `@` becomes a domain.

use async_trait::async_trait;

use deeper_core::error::AppError;
use deeper_core::plugin::Plugin;
use deeper_core::trace::{Trace, TraceKind};

/// email → username (local part).
pub struct UsernameExtractor;

#[async_trait]
impl Plugin for UsernameExtractor {
    fn name(&self) -> &str {
        "username-extractor"
    }

    fn input_kind(&self) -> TraceKind {
        TraceKind::Email
    }

    async fn expand(&self, trace: &Trace) -> Result<Vec<Trace>, AppError> {
        let Some((local, _)) = trace.value.split_once('@') else {
            // The classifier should never hand us a non-email; emit nothing.
            return Ok(Vec::new());
        };
        Ok(vec![Trace::new(local, TraceKind::Username)])
    }
}

/// email → domain (host part).
pub struct MailHostExtractor;

#[async_trait]
impl Plugin for MailHostExtractor {
    fn name(&self) -> &str {
        "mail-host"
    }

    fn input_kind(&self) -> TraceKind {
        TraceKind::Email
    }

    async fn expand(&self, trace: &Trace) -> Result<Vec<Trace>, AppError> {
        let Some((_, host)) = trace.value.split_once('@') else {
            return Ok(Vec::new());
        };
        Ok(vec![Trace::new(host.to_lowercase(), TraceKind::Domain)])
    }
}
