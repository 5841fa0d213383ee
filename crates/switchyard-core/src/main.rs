//! Switchyard server entry point.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use switchyard_core::config::{CONFIG_PATH_ENV, Config, LogFormat, LoggingConfig};
use switchyard_core::server;

const DEFAULT_FILTER: &str = "switchyard_core=debug,switchyard_orchestrator=info,info";

/// Service routing and agent orchestration control plane.
#[derive(Debug, Parser)]
#[command(name = "switchyard", version, about)]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long, env = CONFIG_PATH_ENV)]
    config: Option<PathBuf>,

    /// Address to listen on, overriding the configuration.
    #[arg(short, long)]
    address: Option<String>,

    /// Log output format, overriding the configuration.
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,

    /// Print the effective configuration as TOML and exit.
    #[arg(long)]
    print_config: bool,
}

fn init_tracing(logging: &LoggingConfig) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(logging.filter.as_deref().unwrap_or(DEFAULT_FILTER))
            .context("invalid logging.filter")?,
    };
    let registry = tracing_subscriber::registry().with(filter);
    match logging.format {
        LogFormat::Json => registry.with(fmt::layer().json()).try_init()?,
        LogFormat::Pretty => registry.with(fmt::layer()).try_init()?,
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(address) = &cli.address {
        config.server.address =
            address.parse::<SocketAddr>().with_context(|| format!("invalid --address '{address}'"))?;
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }

    if cli.print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    init_tracing(&config.logging)?;
    tracing::info!(address = %config.server.address, "Starting Switchyard");

    server::run(&config).await?;
    Ok(())
}
