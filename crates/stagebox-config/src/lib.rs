#![deny(unsafe_code)]

//! Configuration loading, validation, and environment overrides for stagebox.
//!
//! Loads TOML configuration files and validates them. [`AppConfig`] is the
//! central configuration structure shared by the daemon and its clients.
//! Every field has a default, so a missing or empty file yields a usable
//! configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use stagebox_macros::Validate;

/// Environment variable that enables or disables daemon auto-start.
///
/// `0`, `false`, `no` and `off` (any case) disable it; any other value
/// enables it.
pub const ENV_AUTO_START: &str = "STAGEBOX_DAEMON_AUTO_START";

/// Environment variable overriding the daemon socket path.
pub const ENV_SOCKET: &str = "STAGEBOX_SOCKET";

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Top-level application configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Staging daemon configuration.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// IPC client configuration (used by every CLI invocation).
    #[serde(default)]
    pub client: ClientConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Configuration for the staging daemon.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[validate(section = "daemon")]
pub struct DaemonConfig {
    /// Explicit socket path. When unset the per-user runtime location is
    /// resolved automatically.
    #[serde(default)]
    pub socket_path: Option<String>,

    /// Deadline for reading one request from a connection.
    #[serde(default = "default_read_timeout_ms")]
    #[validate(range(min = 1, max = 9999))]
    pub read_timeout_ms: u64,

    /// Deadline for writing one response once the request is handled.
    #[serde(default = "default_write_timeout_ms")]
    #[validate(range(min = 1, max = 9999))]
    pub write_timeout_ms: u64,

    /// Exit once nothing is staged anywhere (checked after unstages and reads).
    #[serde(default = "default_true")]
    pub auto_shutdown: bool,

    /// Lock daemon memory into RAM when the memlock limit allows it.
    #[serde(default = "default_true")]
    pub lock_memory: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            read_timeout_ms: default_read_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            auto_shutdown: true,
            lock_memory: true,
        }
    }
}

impl DaemonConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

fn default_read_timeout_ms() -> u64 {
    5_000
}

fn default_write_timeout_ms() -> u64 {
    5_000
}

fn default_true() -> bool {
    true
}

/// Configuration for clients talking to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[validate(section = "client")]
pub struct ClientConfig {
    /// Spawn the daemon in the background when it is not running.
    #[serde(default = "default_true")]
    pub auto_start: bool,

    /// Timeout for establishing the socket connection.
    #[serde(default = "default_connect_timeout_ms")]
    #[validate(range(min = 1, max = 60000))]
    pub connect_timeout_ms: u64,

    /// Timeout for one complete request/response exchange.
    #[serde(default = "default_request_timeout_ms")]
    #[validate(range(min = 1, max = 60000))]
    pub request_timeout_ms: u64,

    /// How long to wait for a freshly spawned daemon to answer a ping.
    #[serde(default = "default_startup_timeout_ms")]
    #[validate(range(min = 1, max = 60000))]
    pub startup_timeout_ms: u64,

    /// Initial delay between readiness pings after spawning.
    #[serde(default = "default_poll_interval_ms")]
    #[validate(range(min = 1, max = 10000))]
    pub poll_interval_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            auto_start: true,
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            startup_timeout_ms: default_startup_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_connect_timeout_ms() -> u64 {
    1_000
}

fn default_request_timeout_ms() -> u64 {
    9_000
}

fn default_startup_timeout_ms() -> u64 {
    5_000
}

fn default_poll_interval_ms() -> u64 {
    50
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g. "info", "debug", "trace").
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from a TOML file at the given path using async I/O.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        if let Err(mut e) = self.daemon.validate() {
            errors.append(&mut e);
        }
        if let Err(mut e) = self.client.validate() {
            errors.append(&mut e);
        }
        if !errors.is_empty() {
            return Err(ConfigError::Validation(errors.join("; ")));
        }

        if let Some(path) = &self.daemon.socket_path {
            if path.is_empty() {
                return Err(ConfigError::Validation(
                    "daemon.socket_path must not be empty when set".to_string(),
                ));
            }
        }
        if self.client.poll_interval_ms > self.client.startup_timeout_ms {
            return Err(ConfigError::Validation(format!(
                "client.poll_interval_ms ({}) must not exceed client.startup_timeout_ms ({})",
                self.client.poll_interval_ms, self.client.startup_timeout_ms
            )));
        }
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::Validation(format!(
                "logging.level must be one of {:?}, got {:?}",
                valid_levels, self.logging.level
            )));
        }

        Ok(())
    }

    /// Apply `STAGEBOX_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply `STAGEBOX_*` overrides using the given variable lookup.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(value) = lookup(ENV_AUTO_START) {
            let enabled = !matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "0" | "false" | "no" | "off"
            );
            if enabled != self.client.auto_start {
                tracing::debug!(enabled, "daemon auto-start overridden by {ENV_AUTO_START}");
            }
            self.client.auto_start = enabled;
        }
        if let Some(path) = lookup(ENV_SOCKET).filter(|p| !p.is_empty()) {
            self.daemon.socket_path = Some(path);
        }
    }
}
