use std::path::Path;
use std::time::Duration;
use serde::Deserialize;
use anyhow::{Context, Result};
use shared::protocol::SATURN_SERVICE_TYPE;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_service_types")]
    pub service_types: Vec<String>,
    /// Restrict mDNS to a single interface
    pub interface: Option<String>,
    #[serde(default = "default_startup_wait")]
    pub startup_wait_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_probe_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_health_timeout")]
    pub health_timeout_ms: u64,
    #[serde(default = "default_models_timeout")]
    pub models_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouterConfig {
    /// Number of distinct candidates tried per request
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiConfig {
    /// When unset the gateway binds the first free port from 8080 on loopback
    pub listen: Option<String>,
}

fn default_service_types() -> Vec<String> {
    vec![SATURN_SERVICE_TYPE.to_string()]
}

fn default_startup_wait() -> u64 {
    3
}

fn default_probe_interval() -> u64 {
    20
}

fn default_health_timeout() -> u64 {
    3000
}

fn default_models_timeout() -> u64 {
    5000
}

fn default_max_retries() -> usize {
    2
}

fn default_request_timeout() -> u64 {
    120
}

fn default_connect_timeout() -> u64 {
    5
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            service_types: default_service_types(),
            interface: None,
            startup_wait_secs: default_startup_wait(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_probe_interval(),
            health_timeout_ms: default_health_timeout(),
            models_timeout_ms: default_models_timeout(),
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            request_timeout_secs: default_request_timeout(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    pub fn models_timeout(&self) -> Duration {
        Duration::from_millis(self.models_timeout_ms)
    }
}

impl RouterConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.discovery.service_types.is_empty() {
            anyhow::bail!("discovery.service_types must name at least one service type");
        }
        if let Some(bad) = self.discovery.service_types.iter().find(|t| !t.ends_with(".local.")) {
            anyhow::bail!("service type {} must end with \".local.\"", bad);
        }
        if self.router.max_retries == 0 {
            anyhow::bail!("router.max_retries must be at least 1");
        }
        if self.health.interval_secs == 0 {
            anyhow::bail!("health.interval_secs must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use shared::protocol::LEGACY_SERVICE_TYPE;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let file = write_config("");
        let config = Config::load(file.path()).unwrap();

        assert_eq!(config.discovery.service_types, vec![SATURN_SERVICE_TYPE.to_string()]);
        assert_eq!(config.health.interval(), Duration::from_secs(20));
        assert_eq!(config.health.health_timeout(), Duration::from_secs(3));
        assert_eq!(config.health.models_timeout(), Duration::from_secs(5));
        assert_eq!(config.router.max_retries, 2);
        assert_eq!(config.router.request_timeout(), Duration::from_secs(120));
        assert!(config.api.listen.is_none());
    }

    #[test]
    fn test_partial_sections() {
        let file = write_config(&format!(
            r#"
            [discovery]
            service_types = ["{}", "{}"]
            interface = "en0"

            [router]
            max_retries = 3

            [api]
            listen = "0.0.0.0:9000"
            "#,
            SATURN_SERVICE_TYPE, LEGACY_SERVICE_TYPE
        ));
        let config = Config::load(file.path()).unwrap();

        assert_eq!(config.discovery.service_types.len(), 2);
        assert_eq!(config.discovery.interface.as_deref(), Some("en0"));
        assert_eq!(config.discovery.startup_wait_secs, 3);
        assert_eq!(config.router.max_retries, 3);
        assert_eq!(config.router.request_timeout_secs, 120);
        assert_eq!(config.api.listen.as_deref(), Some("0.0.0.0:9000"));
    }

    #[test]
    fn test_rejects_zero_retries() {
        let file = write_config("[router]\nmax_retries = 0\n");
        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn test_rejects_non_local_service_type() {
        let file = write_config("[discovery]\nservice_types = [\"_saturn._tcp\"]\n");
        assert!(Config::load(file.path()).is_err());
    }
}
