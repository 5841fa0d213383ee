//! Switchyard Core - HTTP/JSON front end for the Switchyard control plane.
//!
//! This crate provides:
//! - The axum server exposing routing, contexts, agents, tasks and workflows
//! - Layered configuration (defaults, TOML file, environment)
//! - Error handling
//!
//! # Example
//!
//! ```rust,no_run
//! use switchyard_core::{config::Config, server};
//!
//! #[tokio::main]
//! async fn main() -> switchyard_core::error::Result<()> {
//!     let config = Config::load(None)?;
//!     server::run(&config).await
//! }
//! ```

pub mod config;
pub mod error;
pub mod server;

pub use config::Config;
pub use error::{Result, SwitchyardError};
