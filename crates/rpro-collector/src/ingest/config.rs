//! Collector configuration
//!
//! One collector serves one production line. The feed line polls a single
//! IHM; the peanut line polls its intake IHM and, when enabled, a second IHM
//! that weighs output.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::dedup::DEFAULT_CAPACITY;
use super::models::{FlowRole, ProductionLine};

pub const DEFAULT_FTP_PORT: u16 = 21;
pub const DEFAULT_FTP_USER: &str = "anonymous";
pub const DEFAULT_REMOTE_PATH: &str = "/InternalStorage/data/";
pub const DEFAULT_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_ERROR_BACKOFF_SECS: u64 = 30;
pub const DEFAULT_STOP_TIMEOUT_SECS: u64 = 10;

/// FTP endpoint of one IHM terminal
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IhmEndpoint {
    /// Short name used in logs and results ("IHM1")
    pub identifier: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub remote_path: String,
    /// Default flow role for rows without a scale identifier
    pub role: Option<FlowRole>,
}

impl std::fmt::Debug for IhmEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IhmEndpoint")
            .field("identifier", &self.identifier)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("remote_path", &self.remote_path)
            .field("role", &self.role)
            .finish()
    }
}

impl IhmEndpoint {
    pub fn new(identifier: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            host: host.into(),
            port: DEFAULT_FTP_PORT,
            user: DEFAULT_FTP_USER.to_string(),
            password: String::new(),
            remote_path: DEFAULT_REMOTE_PATH.to_string(),
            role: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = user.into();
        self.password = password.into();
        self
    }

    pub fn with_remote_path(mut self, path: impl Into<String>) -> Self {
        self.remote_path = path.into();
        self
    }

    pub fn with_role(mut self, role: FlowRole) -> Self {
        self.role = Some(role);
        self
    }

    /// Load an endpoint from `<prefix>_HOST`, `_PORT`, `_USER`, `_PASSWORD`, `_PATH`
    pub fn from_env(prefix: &str, identifier: &str) -> Self {
        let var = |suffix: &str| std::env::var(format!("{}_{}", prefix, suffix)).ok();

        Self {
            identifier: identifier.to_string(),
            host: var("HOST").unwrap_or_default(),
            port: var("PORT")
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_FTP_PORT),
            user: var("USER").unwrap_or_else(|| DEFAULT_FTP_USER.to_string()),
            password: var("PASSWORD").unwrap_or_default(),
            remote_path: var("PATH").unwrap_or_else(|| DEFAULT_REMOTE_PATH.to_string()),
            role: None,
        }
    }

    /// `host:port` for connecting
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.host.trim().is_empty() {
            anyhow::bail!("{}: FTP host cannot be empty", self.identifier);
        }
        if self.port == 0 {
            anyhow::bail!("{}: FTP port must be greater than 0", self.identifier);
        }
        if self.remote_path.trim().is_empty() {
            anyhow::bail!("{}: remote path cannot be empty", self.identifier);
        }
        Ok(())
    }
}

/// Settings for one collector instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    pub line: ProductionLine,
    /// Pause between the end of one cycle and the start of the next
    pub interval_secs: u64,
    /// Polled in this order every cycle
    pub endpoints: Vec<IhmEndpoint>,
    /// Root of the per-endpoint download directories
    pub temp_dir: PathBuf,
    pub error_backoff_secs: u64,
    pub stop_timeout_secs: u64,
    pub dedup_capacity: usize,
}

impl CollectorConfig {
    fn with_endpoints(line: ProductionLine, endpoints: Vec<IhmEndpoint>, interval_secs: u64) -> Self {
        Self {
            line,
            interval_secs,
            endpoints,
            temp_dir: default_temp_dir(),
            error_backoff_secs: DEFAULT_ERROR_BACKOFF_SECS,
            stop_timeout_secs: DEFAULT_STOP_TIMEOUT_SECS,
            dedup_capacity: DEFAULT_CAPACITY,
        }
    }

    /// Feed line: a single IHM exporting batch reports
    pub fn racao(ihm: IhmEndpoint, interval_secs: u64) -> Self {
        Self::with_endpoints(ProductionLine::Racao, vec![ihm], interval_secs)
    }

    /// Peanut line: intake IHM first, optional output IHM second
    pub fn amendoim(ihm1: IhmEndpoint, ihm2: Option<IhmEndpoint>, interval_secs: u64) -> Self {
        let mut endpoints = vec![ihm1.with_role(FlowRole::Entrada)];
        if let Some(ihm2) = ihm2 {
            endpoints.push(ihm2.with_role(FlowRole::Saida));
        }
        Self::with_endpoints(ProductionLine::Amendoim, endpoints, interval_secs)
    }

    /// Load from `RPRO_*` environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        let line: ProductionLine = std::env::var("RPRO_LINE")
            .unwrap_or_else(|_| "racao".to_string())
            .parse()?;

        let interval_secs = std::env::var("RPRO_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_INTERVAL_SECS);

        let ihm1 = IhmEndpoint::from_env("RPRO_IHM1", "IHM1");
        let ihm2_enabled = std::env::var("RPRO_IHM2_ENABLED")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(false);

        let mut config = match line {
            ProductionLine::Racao => {
                if ihm2_enabled {
                    tracing::warn!("RPRO_IHM2_ENABLED is ignored for the feed line");
                }
                Self::racao(ihm1, interval_secs)
            },
            ProductionLine::Amendoim => {
                let ihm2 = ihm2_enabled.then(|| IhmEndpoint::from_env("RPRO_IHM2", "IHM2"));
                Self::amendoim(ihm1, ihm2, interval_secs)
            },
        };

        if let Ok(dir) = std::env::var("RPRO_TEMP_DIR") {
            config.temp_dir = PathBuf::from(dir);
        }
        config.error_backoff_secs = std::env::var("RPRO_ERROR_BACKOFF_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_ERROR_BACKOFF_SECS);
        config.stop_timeout_secs = std::env::var("RPRO_STOP_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_STOP_TIMEOUT_SECS);
        config.dedup_capacity = std::env::var("RPRO_DEDUP_CAPACITY")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_CAPACITY);

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.interval_secs == 0 {
            anyhow::bail!("RPRO_INTERVAL_SECS must be greater than 0");
        }
        if self.stop_timeout_secs == 0 {
            anyhow::bail!("RPRO_STOP_TIMEOUT_SECS must be greater than 0");
        }
        if self.dedup_capacity == 0 {
            anyhow::bail!("RPRO_DEDUP_CAPACITY must be greater than 0");
        }
        if self.endpoints.is_empty() {
            anyhow::bail!("At least one IHM endpoint must be configured");
        }
        for endpoint in &self.endpoints {
            endpoint.validate()?;
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

/// `<system temp>/RPRO`
pub fn default_temp_dir() -> PathBuf {
    std::env::temp_dir().join("RPRO")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_defaults() {
        let endpoint = IhmEndpoint::new("IHM1", "192.168.0.10");
        assert_eq!(endpoint.port, 21);
        assert_eq!(endpoint.user, "anonymous");
        assert_eq!(endpoint.remote_path, "/InternalStorage/data/");
        assert_eq!(endpoint.address(), "192.168.0.10:21");
        assert!(endpoint.validate().is_ok());
    }

    #[test]
    fn test_debug_hides_password() {
        let endpoint = IhmEndpoint::new("IHM1", "h").with_credentials("op", "s3cret");
        let rendered = format!("{:?}", endpoint);
        assert!(!rendered.contains("s3cret"));
        assert!(rendered.contains("redacted"));
    }

    #[test]
    fn test_amendoim_role_order() {
        let config = CollectorConfig::amendoim(
            IhmEndpoint::new("IHM1", "10.0.0.1"),
            Some(IhmEndpoint::new("IHM2", "10.0.0.2")),
            30,
        );

        assert_eq!(config.line, ProductionLine::Amendoim);
        assert_eq!(config.endpoints.len(), 2);
        assert_eq!(config.endpoints[0].role, Some(FlowRole::Entrada));
        assert_eq!(config.endpoints[1].role, Some(FlowRole::Saida));
        assert_eq!(config.error_backoff(), Duration::from_secs(30));
        assert_eq!(config.stop_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_racao_has_single_untagged_endpoint() {
        let config = CollectorConfig::racao(IhmEndpoint::new("IHM1", "10.0.0.1"), 60);
        assert_eq!(config.endpoints.len(), 1);
        assert_eq!(config.endpoints[0].role, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = CollectorConfig::racao(IhmEndpoint::new("IHM1", "10.0.0.1"), 0);
        assert!(config.validate().is_err());

        config.interval_secs = 60;
        config.endpoints[0].host = "  ".to_string();
        assert!(config.validate().is_err());

        config.endpoints[0].host = "10.0.0.1".to_string();
        config.dedup_capacity = 0;
        assert!(config.validate().is_err());

        config.dedup_capacity = 5;
        config.endpoints.clear();
        assert!(config.validate().is_err());
    }
}
