//! Jobs: one scheduled invocation of one plugin on one trace.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::domain::extract_domain;
use crate::error::AppError;
use crate::plugin::Plugin;
use crate::trace::{Trace, TraceKind};

/// Content-addressed job fingerprint: SHA-256 of
/// `kind ∥ value ∥ plugin_name`, truncated to 8 bytes. Collision-based
/// false suppression is considered negligible at this size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 8]);

impl Fingerprint {
    pub fn compute(kind: TraceKind, value: &str, plugin_name: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(kind.as_str().as_bytes());
        hasher.update([0x1f]);
        hasher.update(value.as_bytes());
        hasher.update([0x1f]);
        hasher.update(plugin_name.as_bytes());
        let digest = hasher.finalize();
        let mut out = [0u8; 8];
        out.copy_from_slice(&digest[..8]);
        Self(out)
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// Hex form, used as the persistent-cache key.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// A scheduled invocation of one plugin on one trace. Scoped to a single
/// expansion run.
#[derive(Clone)]
pub struct Job {
    pub id: Uuid,
    pub kind: TraceKind,
    pub input: Trace,
    pub plugin_name: String,
    pub plugin: Arc<dyn Plugin>,
    pub fingerprint: Fingerprint,
    pub domain: String,
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Build a job for `(trace, plugin)`. The plugin's declared input kind
    /// must equal the trace's kind.
    pub fn new(input: Trace, plugin: Arc<dyn Plugin>) -> Result<Self, AppError> {
        if plugin.input_kind() != input.kind {
            return Err(AppError::Internal(format!(
                "plugin '{}' consumes {}, got {}",
                plugin.name(),
                plugin.input_kind(),
                input.kind
            )));
        }

        let plugin_name = plugin.name().to_string();
        let fingerprint = Fingerprint::compute(input.kind, &input.value, &plugin_name);
        let domain = extract_domain(&input.value);

        Ok(Self {
            id: Uuid::new_v4(),
            kind: input.kind,
            input,
            plugin_name,
            plugin,
            fingerprint,
            domain,
            created_at: Utc::now(),
        })
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("input", &self.input)
            .field("plugin_name", &self.plugin_name)
            .field("fingerprint", &self.fingerprint.to_hex())
            .field("domain", &self.domain)
            .finish()
    }
}

/// Outcome of one job: the traces it emitted, or the error that ended it.
#[derive(Debug)]
pub struct JobResult {
    pub job_id: Uuid,
    pub plugin_name: String,
    pub domain: String,
    pub emitted: Vec<Trace>,
    pub error: Option<AppError>,
    pub duration: Duration,
}

impl JobResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}
