//! Configuration for the Switchyard server.
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! environment variables such as `SWITCHYARD__SERVER__ADDRESS` or
//! `SWITCHYARD__ORCHESTRATOR__CIRCUIT_BREAKER__FAILURE_THRESHOLD`.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use switchyard_orchestrator::{OrchestrationError, OrchestratorConfig};

use crate::error::Result;

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "SWITCHYARD";

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "SWITCHYARD_CONFIG";

/// HTTP server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// The address to bind the HTTP server to.
    #[serde(default = "default_address")]
    pub address: SocketAddr,
    /// Upper bound on handling one request.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Allow cross-origin requests from any origin.
    #[serde(default = "default_true")]
    pub cors: bool,
}

fn default_true() -> bool {
    true
}

fn default_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

impl ServerConfig {
    /// Request timeout as a duration.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { address: default_address(), request_timeout_ms: default_request_timeout_ms(), cors: true }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Output format.
    #[serde(default)]
    pub format: LogFormat,
    /// `EnvFilter` directives; `RUST_LOG` wins when set.
    #[serde(default)]
    pub filter: Option<String>,
}

/// Root configuration for Switchyard.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Control plane configuration.
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

impl Config {
    /// Create a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from defaults, an optional TOML file and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or a value fails to parse.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::layered(
            path.map(|p| File::from(p).format(FileFormat::Toml).required(true)),
            environment(),
        )
    }

    /// Parse configuration from TOML text layered over the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid configuration.
    pub fn from_toml(text: &str) -> Result<Self> {
        Self::layered(
            Some(File::from_str(text, FileFormat::Toml)),
            environment().source(Some(config::Map::new())),
        )
    }

    /// Rejects values the server or the control plane cannot run with.
    ///
    /// # Errors
    ///
    /// Returns a validation error naming the offending setting.
    pub fn validate(&self) -> Result<()> {
        if self.server.request_timeout_ms == 0 {
            return Err(OrchestrationError::Validation(
                "server.request_timeout_ms must be at least 1".into(),
            )
            .into());
        }
        Ok(self.orchestrator.validate()?)
    }

    /// Render the configuration as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if a value has no TOML representation.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    fn layered<F>(file: Option<F>, env: Environment) -> Result<Self>
    where
        F: config::Source + Send + Sync + 'static,
    {
        let mut builder = config::Config::builder().add_source(config::Config::try_from(&Self::default())?);
        if let Some(file) = file {
            builder = builder.add_source(file);
        }
        let config: Self = builder.add_source(env).build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX).prefix_separator("__").separator("__").try_parsing(true)
}
