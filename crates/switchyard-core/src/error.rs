//! Error types for the Switchyard server.

use switchyard_orchestrator::OrchestrationError;
use thiserror::Error;

/// Core error type for server startup and configuration.
#[derive(Error, Debug)]
pub enum SwitchyardError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Configuration rendering errors
    #[error("Failed to render configuration: {0}")]
    Render(#[from] toml::ser::Error),

    /// Address parsing errors
    #[error("Invalid address: {0}")]
    InvalidAddress(#[from] std::net::AddrParseError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Control plane errors
    #[error(transparent)]
    Orchestration(#[from] OrchestrationError),
}

/// Result type alias for Switchyard operations.
pub type Result<T> = std::result::Result<T, SwitchyardError>;
