use std::time::Duration;

use thiserror::Error;

/// Application-wide error types for deeper.
#[derive(Error, Debug)]
pub enum AppError {
    /// Input rejected by the classifier or by config validation.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A plugin's call returned a failure.
    #[error("Plugin '{plugin}' failed: {message}")]
    PluginError { plugin: String, message: String },

    /// Transport failure observed by a plugin.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// A job exceeded its task timeout.
    #[error("Job timed out after {0:?}")]
    Timeout(Duration),

    /// Submission rejected because the circuit breaker is open.
    #[error("Circuit breaker '{key}' is open, retry after {retry_after:?}")]
    BreakerOpen { key: String, retry_after: Duration },

    /// Non-blocking submit to a saturated queue.
    #[error("Worker pool queue is full")]
    QueueFull,

    /// Submit after shutdown was initiated.
    #[error("Worker pool is shutting down")]
    PoolShuttingDown,

    /// Shutdown deadline expired with jobs still in flight.
    #[error("Worker pool shutdown timed out")]
    ShutdownTimeout,

    /// Context cancellation.
    #[error("Cancelled")]
    Cancelled,

    /// Plugin registration rejected: name already taken.
    #[error("Duplicate plugin: {0}")]
    DuplicatePlugin(String),

    /// Configuration error (env parsing, domain validation, construction).
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Persistent store operation failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Invariant violation; should not occur in production builds.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Returns true if this error should count as a failure against
    /// the circuit breaker and the per-domain backoff tracker.
    pub fn should_trip_circuit(&self) -> bool {
        matches!(
            self,
            AppError::PluginError { .. } | AppError::NetworkError(_) | AppError::Timeout(_)
        )
    }

    /// Returns true if this error is transient and worth retrying
    /// once the limiter lets the next attempt through.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::NetworkError(_)
                | AppError::Timeout(_)
                | AppError::BreakerOpen { .. }
                | AppError::QueueFull
        )
    }
}
