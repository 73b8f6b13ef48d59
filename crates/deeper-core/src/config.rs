//! Application configuration.
//!
//! Defaults follow the shipped behaviour; every knob can be overridden with
//! a `DEEPER_`-prefixed environment variable. Unlike per-job failures,
//! configuration errors surface to the caller immediately.

use std::collections::HashMap;
use std::time::Duration;

use crate::breaker::CircuitBreakerConfig;
use crate::dedup::DedupConfig;
use crate::engine::EngineConfig;
use crate::error::AppError;
use crate::pool::PoolConfig;
use crate::rate_limit::DomainRateConfig;

const ENV_PREFIX: &str = "DEEPER_";
const DOMAIN_RATE_PREFIX: &str = "DEEPER_DOMAIN_RATE_";

/// Full engine configuration assembled from defaults and the environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Worker count (`W`); also the default batch size.
    pub max_concurrency: usize,
    /// Default requests/sec for unconfigured domains.
    pub rate_limit: f64,
    /// Default burst for unconfigured domains.
    pub burst: u32,
    /// Timeout plugins should apply to outbound calls.
    pub http_timeout: Duration,
    pub log_level: String,
    pub queue_size: usize,
    pub task_timeout: Duration,
    pub enable_dedup: bool,
    pub dedup_capacity: usize,
    pub dedup_ttl: Option<Duration>,
    pub breaker: CircuitBreakerConfig,
    /// Per-domain overrides, applied on top of the default limiter config.
    pub domain_rates: Vec<DomainRateConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            rate_limit: 10.0,
            burst: 5,
            http_timeout: Duration::from_secs(30),
            log_level: "info".to_string(),
            queue_size: 1000,
            task_timeout: Duration::from_secs(30),
            enable_dedup: true,
            dedup_capacity: 10_000,
            dedup_ttl: Some(Duration::from_secs(24 * 60 * 60)),
            breaker: CircuitBreakerConfig::default(),
            domain_rates: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration from `DEEPER_*` environment variables on top of
    /// the defaults. Malformed values are errors, not silently ignored.
    pub fn from_env() -> Result<Self, AppError> {
        let vars: HashMap<String, String> = std::env::vars()
            .filter(|(k, _)| k.starts_with(ENV_PREFIX))
            .collect();
        Self::from_vars(&vars)
    }

    /// Like [`from_env`](Self::from_env), but reading from an explicit map.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, AppError> {
        let mut config = Self::default();

        if let Some(raw) = vars.get("DEEPER_MAX_CONCURRENCY") {
            config.max_concurrency = parse_positive(raw, "DEEPER_MAX_CONCURRENCY")?;
        }
        if let Some(raw) = vars.get("DEEPER_RATE_LIMIT") {
            config.rate_limit = parse_rate(raw, "DEEPER_RATE_LIMIT")?;
        }
        if let Some(raw) = vars.get("DEEPER_HTTP_TIMEOUT") {
            config.http_timeout = parse_duration(raw)
                .ok_or_else(|| invalid_duration("DEEPER_HTTP_TIMEOUT", raw))?;
        }
        if let Some(raw) = vars.get("DEEPER_LOG_LEVEL") {
            config.log_level = raw.clone();
        }
        if let Some(raw) = vars.get("DEEPER_WORKER_POOL_QUEUE_SIZE") {
            config.queue_size = parse_positive(raw, "DEEPER_WORKER_POOL_QUEUE_SIZE")?;
        }
        if let Some(raw) = vars.get("DEEPER_WORKER_POOL_TASK_TIMEOUT") {
            config.task_timeout = parse_duration(raw)
                .ok_or_else(|| invalid_duration("DEEPER_WORKER_POOL_TASK_TIMEOUT", raw))?;
        }
        if let Some(raw) = vars.get("DEEPER_WORKER_POOL_ENABLE_DEDUP") {
            config.enable_dedup = parse_bool(raw, "DEEPER_WORKER_POOL_ENABLE_DEDUP")?;
        }
        if let Some(raw) = vars.get("DEEPER_DEDUP_MAX_MEMORY_SIZE") {
            config.dedup_capacity = parse_positive(raw, "DEEPER_DEDUP_MAX_MEMORY_SIZE")?;
        }
        if let Some(raw) = vars.get("DEEPER_DEDUP_CACHE_TTL") {
            config.dedup_ttl = Some(
                parse_duration(raw).ok_or_else(|| invalid_duration("DEEPER_DEDUP_CACHE_TTL", raw))?,
            );
        }

        if let Some(raw) = vars.get("DEEPER_CIRCUIT_BREAKER_FAILURE_THRESHOLD") {
            config.breaker.failure_threshold =
                parse_positive(raw, "DEEPER_CIRCUIT_BREAKER_FAILURE_THRESHOLD")? as u32;
        }
        if let Some(raw) = vars.get("DEEPER_CIRCUIT_BREAKER_RECOVERY_TIMEOUT") {
            config.breaker.recovery_timeout = parse_duration(raw)
                .ok_or_else(|| invalid_duration("DEEPER_CIRCUIT_BREAKER_RECOVERY_TIMEOUT", raw))?;
        }
        if let Some(raw) = vars.get("DEEPER_CIRCUIT_BREAKER_HALF_OPEN_MAX_CALLS") {
            config.breaker.half_open_max_calls =
                parse_positive(raw, "DEEPER_CIRCUIT_BREAKER_HALF_OPEN_MAX_CALLS")? as u32;
        }
        if let Some(raw) = vars.get("DEEPER_CIRCUIT_BREAKER_WINDOW_SIZE") {
            config.breaker.window_size = parse_duration(raw)
                .ok_or_else(|| invalid_duration("DEEPER_CIRCUIT_BREAKER_WINDOW_SIZE", raw))?;
        }

        config.domain_rates = parse_domain_rates(vars, &config)?;

        Ok(config)
    }

    /// Default limiter configuration for unconfigured domains.
    pub fn default_domain_rate(&self) -> DomainRateConfig {
        DomainRateConfig {
            rate_per_sec: self.rate_limit,
            burst: self.burst,
            ..Default::default()
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            workers: self.max_concurrency,
            queue_size: self.queue_size,
            task_timeout: self.task_timeout,
        }
    }

    pub fn dedup_config(&self) -> DedupConfig {
        DedupConfig {
            capacity: self.dedup_capacity,
            ttl: self.dedup_ttl,
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            batch_size: self.max_concurrency,
            ..Default::default()
        }
    }
}

/// Collect `DEEPER_DOMAIN_RATE_<UPPER_DOMAIN>_<FIELD>` variables into
/// per-domain configurations. Underscores in `<UPPER_DOMAIN>` map to dots
/// (env names cannot carry dots); hyphenated domains are configured via
/// the CLI instead.
fn parse_domain_rates(
    vars: &HashMap<String, String>,
    config: &AppConfig,
) -> Result<Vec<DomainRateConfig>, AppError> {
    const FIELDS: [&str; 5] = [
        "_RATE_LIMIT",
        "_BURST",
        "_BACKOFF_BASE",
        "_BACKOFF_MAX",
        "_MAX_RETRIES",
    ];

    let mut by_domain: HashMap<String, DomainRateConfig> = HashMap::new();

    for (key, raw) in vars {
        let Some(rest) = key.strip_prefix(DOMAIN_RATE_PREFIX) else {
            continue;
        };
        let Some(field) = FIELDS.iter().find(|f| rest.ends_with(**f)) else {
            return Err(AppError::ConfigError(format!(
                "unrecognised domain rate variable: {key}"
            )));
        };
        let upper_domain = &rest[..rest.len() - field.len()];
        if upper_domain.is_empty() {
            return Err(AppError::ConfigError(format!(
                "missing domain in variable: {key}"
            )));
        }
        let domain = upper_domain.to_lowercase().replace('_', ".");

        let entry = by_domain
            .entry(domain.clone())
            .or_insert_with(|| DomainRateConfig {
                domain,
                rate_per_sec: config.rate_limit,
                burst: config.burst,
                ..Default::default()
            });

        match *field {
            "_RATE_LIMIT" => entry.rate_per_sec = parse_rate(raw, key)?,
            "_BURST" => entry.burst = parse_positive(raw, key)? as u32,
            "_BACKOFF_BASE" => {
                entry.backoff_base =
                    parse_duration(raw).ok_or_else(|| invalid_duration(key, raw))?;
            }
            "_BACKOFF_MAX" => {
                entry.backoff_max =
                    parse_duration(raw).ok_or_else(|| invalid_duration(key, raw))?;
            }
            "_MAX_RETRIES" => entry.max_retries = parse_positive(raw, key)? as u32,
            _ => unreachable!(),
        }
    }

    let mut rates: Vec<_> = by_domain.into_values().collect();
    rates.sort_by(|a, b| a.domain.cmp(&b.domain));
    for rate in &rates {
        rate.validate()?;
    }
    Ok(rates)
}

/// Parse Go-style duration strings: `250ms`, `30s`, `5m`, `2h`, or a bare
/// number of seconds.
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    let (value, unit) = match raw.find(|c: char| !c.is_ascii_digit() && c != '.') {
        Some(idx) => raw.split_at(idx),
        None => (raw, "s"),
    };
    let value: f64 = value.parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }

    let seconds = match unit {
        "ms" => value / 1000.0,
        "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        _ => return None,
    };
    Some(Duration::from_secs_f64(seconds))
}

fn invalid_duration(key: &str, raw: &str) -> AppError {
    AppError::ConfigError(format!(
        "invalid {key} '{raw}': expected a duration like 250ms, 30s, 5m or 2h"
    ))
}

fn parse_positive(raw: &str, key: &str) -> Result<usize, AppError> {
    let parsed: usize = raw
        .parse()
        .map_err(|_| AppError::ConfigError(format!("invalid {key} '{raw}': must be an integer")))?;
    if parsed == 0 {
        return Err(AppError::ConfigError(format!("{key} must be at least 1")));
    }
    Ok(parsed)
}

fn parse_rate(raw: &str, key: &str) -> Result<f64, AppError> {
    let parsed: f64 = raw
        .parse()
        .map_err(|_| AppError::ConfigError(format!("invalid {key} '{raw}': must be a number")))?;
    if !(parsed.is_finite() && parsed > 0.0) {
        return Err(AppError::ConfigError(format!("{key} must be positive")));
    }
    Ok(parsed)
}

fn parse_bool(raw: &str, key: &str) -> Result<bool, AppError> {
    match raw.to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(AppError::ConfigError(format!(
            "invalid {key} '{raw}': must be true or false"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::from_vars(&HashMap::new()).unwrap();
        assert_eq!(config.max_concurrency, 10);
        assert_eq!(config.queue_size, 1000);
        assert_eq!(config.task_timeout, Duration::from_secs(30));
        assert!(config.enable_dedup);
        assert_eq!(config.dedup_capacity, 10_000);
        assert_eq!(config.breaker.failure_threshold, 5);
    }

    #[test]
    fn test_env_overrides() {
        let config = AppConfig::from_vars(&vars(&[
            ("DEEPER_MAX_CONCURRENCY", "20"),
            ("DEEPER_RATE_LIMIT", "2.5"),
            ("DEEPER_WORKER_POOL_QUEUE_SIZE", "64"),
            ("DEEPER_WORKER_POOL_TASK_TIMEOUT", "5s"),
            ("DEEPER_WORKER_POOL_ENABLE_DEDUP", "false"),
            ("DEEPER_CIRCUIT_BREAKER_FAILURE_THRESHOLD", "2"),
            ("DEEPER_CIRCUIT_BREAKER_RECOVERY_TIMEOUT", "100ms"),
            ("DEEPER_DEDUP_CACHE_TTL", "1h"),
            ("DEEPER_DEDUP_MAX_MEMORY_SIZE", "500"),
        ]))
        .unwrap();

        assert_eq!(config.max_concurrency, 20);
        assert_eq!(config.rate_limit, 2.5);
        assert_eq!(config.queue_size, 64);
        assert_eq!(config.task_timeout, Duration::from_secs(5));
        assert!(!config.enable_dedup);
        assert_eq!(config.breaker.failure_threshold, 2);
        assert_eq!(config.breaker.recovery_timeout, Duration::from_millis(100));
        assert_eq!(config.dedup_ttl, Some(Duration::from_secs(3600)));
        assert_eq!(config.dedup_capacity, 500);
    }

    #[test]
    fn test_domain_rate_variables() {
        let config = AppConfig::from_vars(&vars(&[
            ("DEEPER_DOMAIN_RATE_API_EXAMPLE_COM_RATE_LIMIT", "1"),
            ("DEEPER_DOMAIN_RATE_API_EXAMPLE_COM_BURST", "1"),
            ("DEEPER_DOMAIN_RATE_API_EXAMPLE_COM_BACKOFF_BASE", "500ms"),
            ("DEEPER_DOMAIN_RATE_API_EXAMPLE_COM_BACKOFF_MAX", "10s"),
            ("DEEPER_DOMAIN_RATE_API_EXAMPLE_COM_MAX_RETRIES", "5"),
        ]))
        .unwrap();

        assert_eq!(config.domain_rates.len(), 1);
        let rate = &config.domain_rates[0];
        assert_eq!(rate.domain, "api.example.com");
        assert_eq!(rate.rate_per_sec, 1.0);
        assert_eq!(rate.burst, 1);
        assert_eq!(rate.backoff_base, Duration::from_millis(500));
        assert_eq!(rate.backoff_max, Duration::from_secs(10));
        assert_eq!(rate.max_retries, 5);
    }

    #[test]
    fn test_partial_domain_config_inherits_defaults() {
        let config = AppConfig::from_vars(&vars(&[(
            "DEEPER_DOMAIN_RATE_SLOW_EXAMPLE_COM_RATE_LIMIT",
            "0.5",
        )]))
        .unwrap();

        let rate = &config.domain_rates[0];
        assert_eq!(rate.domain, "slow.example.com");
        assert_eq!(rate.rate_per_sec, 0.5);
        assert_eq!(rate.burst, 5);
    }

    #[test]
    fn test_malformed_values_are_errors() {
        assert!(matches!(
            AppConfig::from_vars(&vars(&[("DEEPER_MAX_CONCURRENCY", "lots")])),
            Err(AppError::ConfigError(_))
        ));
        assert!(matches!(
            AppConfig::from_vars(&vars(&[("DEEPER_MAX_CONCURRENCY", "0")])),
            Err(AppError::ConfigError(_))
        ));
        assert!(matches!(
            AppConfig::from_vars(&vars(&[("DEEPER_HTTP_TIMEOUT", "soon")])),
            Err(AppError::ConfigError(_))
        ));
        assert!(matches!(
            AppConfig::from_vars(&vars(&[("DEEPER_DOMAIN_RATE_API_EXAMPLE_COM_RATE_LIMIT", "-1")])),
            Err(AppError::ConfigError(_))
        ));
    }

    #[test]
    fn test_parse_duration_forms() {
        assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("2h"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_duration("45"), Some(Duration::from_secs(45)));
        assert_eq!(parse_duration("1.5s"), Some(Duration::from_millis(1500)));
        assert_eq!(parse_duration("fast"), None);
        assert_eq!(parse_duration(""), None);
    }
}
