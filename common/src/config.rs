// Configuration management with layered configuration (file, env)

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub control_plane: ControlPlaneConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub bulk: BulkConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlPlaneConfig {
    pub base_url: String,
    /// Bearer credential; normally supplied by the auth collaborator at runtime
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

fn default_request_timeout() -> u64 {
    10
}

impl ControlPlaneConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    pub jobs_interval_seconds: u64,
    pub executions_interval_seconds: u64,
    pub results_interval_seconds: u64,
    pub fetch_timeout_seconds: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            jobs_interval_seconds: 30,
            executions_interval_seconds: 10,
            results_interval_seconds: 5,
            fetch_timeout_seconds: 10,
        }
    }
}

impl PollingConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkConfig {
    pub item_timeout_seconds: u64,
    #[serde(default)]
    pub default_reason: String,
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            item_timeout_seconds: 10,
            default_reason: "Terminated from dashboard".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    #[serde(default)]
    pub metrics_port: Option<u16>,
    #[serde(default)]
    pub tracing_endpoint: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_port: None,
            tracing_endpoint: None,
        }
    }
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Local overrides (not committed to git)
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), String> {
        if self.control_plane.base_url.trim().is_empty() {
            return Err("Control plane base_url cannot be empty".to_string());
        }
        if !self.control_plane.base_url.starts_with("http://")
            && !self.control_plane.base_url.starts_with("https://")
        {
            return Err("Control plane base_url must be an http(s) URL".to_string());
        }
        if self.control_plane.request_timeout_seconds == 0 {
            return Err("Control plane request_timeout_seconds must be greater than 0".to_string());
        }

        let polling = &self.polling;
        if polling.jobs_interval_seconds == 0
            || polling.executions_interval_seconds == 0
            || polling.results_interval_seconds == 0
        {
            return Err("Polling intervals must be greater than 0".to_string());
        }
        if polling.fetch_timeout_seconds == 0 {
            return Err("Polling fetch_timeout_seconds must be greater than 0".to_string());
        }

        if self.bulk.item_timeout_seconds == 0 {
            return Err("Bulk item_timeout_seconds must be greater than 0".to_string());
        }

        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            control_plane: ControlPlaneConfig {
                base_url: "http://localhost:8000/api/v1".to_string(),
                api_token: None,
                request_timeout_seconds: default_request_timeout(),
            },
            polling: PollingConfig::default(),
            bulk: BulkConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}
