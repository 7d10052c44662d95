//! Configuration management

use serde::{Deserialize, Serialize};

use crate::error::{CollectorError, CollectorResult};
use crate::ingest::config::CollectorConfig;

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/rpro";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 5;

/// Default minimum database connections in the pool.
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 1;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default database idle timeout in seconds (10 minutes).
pub const DEFAULT_DATABASE_IDLE_TIMEOUT_SECS: u64 = 600;

/// Collector process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub collector: CollectorConfig,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
            min_connections: DEFAULT_DATABASE_MIN_CONNECTIONS,
            connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
            idle_timeout_secs: DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
        }
    }
}

impl DatabaseConfig {
    pub fn from_env() -> Self {
        Self {
            url: std::env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
            max_connections: std::env::var("DATABASE_MAX_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_DATABASE_MAX_CONNECTIONS),
            min_connections: std::env::var("DATABASE_MIN_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_DATABASE_MIN_CONNECTIONS),
            connect_timeout_secs: std::env::var("DATABASE_CONNECT_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS),
            idle_timeout_secs: std::env::var("DATABASE_IDLE_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_DATABASE_IDLE_TIMEOUT_SECS),
        }
    }

    pub fn validate(&self) -> CollectorResult<()> {
        if self.url.is_empty() {
            return Err(CollectorError::config("Database URL cannot be empty"));
        }

        if self.max_connections == 0 {
            return Err(CollectorError::config(
                "Database max_connections must be greater than 0",
            ));
        }

        if self.min_connections > self.max_connections {
            return Err(CollectorError::config(format!(
                "Database min_connections ({}) cannot be greater than max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }

        Ok(())
    }
}

impl AppConfig {
    /// Load configuration from `.env`, the environment and defaults
    pub fn load() -> CollectorResult<Self> {
        dotenvy::dotenv().ok();

        let config = AppConfig {
            database: DatabaseConfig::from_env(),
            collector: CollectorConfig::from_env().map_err(|e| CollectorError::config(format!("{:#}", e)))?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> CollectorResult<()> {
        self.database.validate()?;
        self.collector
            .validate()
            .map_err(|e| CollectorError::config(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_defaults_are_valid() {
        let config = DatabaseConfig::default();
        assert_eq!(config.max_connections, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_database_pool_bounds() {
        let config = DatabaseConfig {
            min_connections: 10,
            max_connections: 2,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(CollectorError::Config(_))));

        let empty = DatabaseConfig {
            url: String::new(),
            ..Default::default()
        };
        assert!(empty.validate().is_err());
    }
}
