use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{MonitorFunction, TimePeriod};

pub const DEFAULT_PATH: &str = "/zm/";
pub const DEFAULT_PATH_ZMS: &str = "/zm/cgi-bin/nph-zms";
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_SCAN_INTERVAL_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("server {0} is already configured")]
    DuplicateHost(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub scan_interval: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(DEFAULT_SCAN_INTERVAL_SECS),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorSection {
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,
}

impl Default for CoordinatorSection {
    fn default() -> Self {
        Self {
            scan_interval_secs: DEFAULT_SCAN_INTERVAL_SECS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default = "default_path_zms")]
    pub path_zms: String,
    #[serde(default = "default_true")]
    pub verify_ssl: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub options: ServerOptions,
}

impl ServerConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            username: None,
            password: None,
            ssl: false,
            path: default_path(),
            path_zms: default_path_zms(),
            verify_ssl: true,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            options: ServerOptions::default(),
        }
    }

    pub fn origin(&self) -> String {
        let scheme = if self.ssl { "https" } else { "http" };
        format!("{scheme}://{}", self.host)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerOptions {
    #[serde(default)]
    pub include_archived: bool,
    #[serde(default = "default_monitored_conditions")]
    pub monitored_conditions: Vec<TimePeriod>,
    #[serde(default = "default_command_on")]
    pub command_on: MonitorFunction,
    #[serde(default = "default_command_off")]
    pub command_off: MonitorFunction,
    #[serde(default)]
    pub stream_scale: Option<u32>,
    #[serde(default)]
    pub stream_maxfps: Option<f64>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            include_archived: false,
            monitored_conditions: default_monitored_conditions(),
            command_on: default_command_on(),
            command_off: default_command_off(),
            stream_scale: None,
            stream_maxfps: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub coordinator: CoordinatorSection,
    #[serde(default, rename = "server")]
    pub servers: Vec<ServerConfig>,
}

impl BridgeConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&contents)?;
        tracing::info!(path = %path.display(), servers = config.servers.len(), "loaded config");
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.coordinator.scan_interval_secs == 0 {
            return Err(ConfigError::Invalid("scan_interval_secs must be positive".into()));
        }

        let mut seen = HashSet::new();
        for server in &self.servers {
            if server.host.trim().is_empty() {
                return Err(ConfigError::Invalid("server host must not be empty".into()));
            }
            if !seen.insert(server.host.as_str()) {
                return Err(ConfigError::DuplicateHost(server.host.clone()));
            }
            if let Some(scale) = server.options.stream_scale {
                if !(1..=100).contains(&scale) {
                    return Err(ConfigError::Invalid(format!(
                        "{}: stream_scale {scale} outside 1..=100",
                        server.host
                    )));
                }
            }
            if let Some(fps) = server.options.stream_maxfps {
                if !(0.5..=30.0).contains(&fps) {
                    return Err(ConfigError::Invalid(format!(
                        "{}: stream_maxfps {fps} outside 0.5..=30",
                        server.host
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            scan_interval: Duration::from_secs(self.coordinator.scan_interval_secs),
        }
    }
}

fn default_scan_interval_secs() -> u64 {
    DEFAULT_SCAN_INTERVAL_SECS
}

fn default_path() -> String {
    DEFAULT_PATH.to_string()
}

fn default_path_zms() -> String {
    DEFAULT_PATH_ZMS.to_string()
}

fn default_true() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_monitored_conditions() -> Vec<TimePeriod> {
    vec![TimePeriod::All]
}

fn default_command_on() -> MonitorFunction {
    MonitorFunction::Modect
}

fn default_command_off() -> MonitorFunction {
    MonitorFunction::Monitor
}
