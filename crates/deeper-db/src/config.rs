use deeper_core::AppError;

/// Configuration for the local SQLite store.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl DatabaseConfig {
    /// Read configuration from environment variables.
    ///
    /// - `DEEPER_DATABASE_URL` (optional; persistence is off when unset)
    /// - `DEEPER_DATABASE_MAX_CONNECTIONS` (optional, defaults to 5)
    pub fn from_env() -> Result<Option<Self>, AppError> {
        let Ok(url) = std::env::var("DEEPER_DATABASE_URL") else {
            return Ok(None);
        };

        let max_connections = match std::env::var("DEEPER_DATABASE_MAX_CONNECTIONS") {
            Err(_) => 5,
            Ok(raw) => {
                let parsed: u32 = raw.parse().map_err(|_| {
                    AppError::ConfigError(format!(
                        "Invalid DEEPER_DATABASE_MAX_CONNECTIONS '{raw}': must be a positive integer"
                    ))
                })?;
                if parsed == 0 {
                    return Err(AppError::ConfigError(
                        "DEEPER_DATABASE_MAX_CONNECTIONS must be at least 1".into(),
                    ));
                }
                parsed
            }
        };

        Ok(Some(Self {
            url,
            max_connections,
        }))
    }
}
