//! Daemon configuration.
//!
//! Aggregates the per-module configuration structs into a single
//! `Config` that can be loaded from YAML files and environment variables.

use serde::Deserialize;

use crate::backend::native::NativeChannelConfig;
use crate::backend::socket::SocketConfig;
use crate::manager::{ManagerConfig, WatchdogConfig};
use crate::transport::ListenerConfig;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "commgr.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "COMMGR_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "COMMGR";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "COMMGR_LOG";

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Main daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Socket listeners to bind.
    pub listeners: Vec<ListenerConfig>,
    /// Native message-passing channel.
    pub native_channel: NativeChannelConfig,
    /// Framing options shared by every socket.
    pub socket: SocketConfig,
    /// Client liveness watchdog.
    pub watchdog: WatchdogConfig,
    /// Address of a downstream manager to chain to.
    pub downstream: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listeners: vec![ListenerConfig::default()],
            native_channel: NativeChannelConfig::default(),
            socket: SocketConfig::default(),
            watchdog: WatchdogConfig::default(),
            downstream: None,
        }
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `commgr.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `COMMGR_CONFIG` environment variable (if set)
    /// 4. Environment variables with `COMMGR__` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the daemon cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listeners.is_empty() && !self.native_channel.enabled {
            return Err(ConfigError::Invalid(
                "no listeners configured and native channel disabled".to_string(),
            ));
        }
        if self.socket.max_frame_len < 4 {
            return Err(ConfigError::Invalid(format!(
                "socket.max_frame_len must be at least 4, got {}",
                self.socket.max_frame_len
            )));
        }
        if self.socket.write_batch == 0 {
            return Err(ConfigError::Invalid(
                "socket.write_batch must be at least 1".to_string(),
            ));
        }
        if self.socket.max_queue == 0 {
            return Err(ConfigError::Invalid(
                "socket.max_queue must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Manager settings derived from this configuration.
    pub fn manager(&self) -> ManagerConfig {
        ManagerConfig {
            watchdog: self.watchdog.clone(),
            socket: self.socket.clone(),
        }
    }
}
