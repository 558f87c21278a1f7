//! # Crosstalk Node
//!
//! Standalone broker node: joins a bus channel, announces its configured
//! clients, publishes stdin lines and logs what peers send.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings (crosstalk.toml if present)
//! crosstalk
//!
//! # Run with a custom config
//! crosstalk --config /path/to/crosstalk.toml
//!
//! # Override single values from the environment
//! CROSSTALK__BROKER__SERVER_NAME=lobby crosstalk
//! ```

mod config;
mod metrics;
mod node;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "crosstalk")]
#[command(about = "Standalone Crosstalk broker node")]
#[command(version)]
struct Args {
    /// Path to a TOML config file
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "crosstalk=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = config::Config::load(args.config.as_deref())?;

    tracing::info!(
        server = %config.broker.server_name,
        transport = %config.broker.transport,
        "Starting Crosstalk node"
    );

    metrics::init_metrics();
    node::run(config).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_args_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_config_flag() {
        let args = Args::try_parse_from(["crosstalk"]).unwrap();
        assert_eq!(args.config, None);

        let args = Args::try_parse_from(["crosstalk", "-c", "node.toml"]).unwrap();
        assert_eq!(args.config.as_deref(), Some("node.toml"));

        let args = Args::try_parse_from(["crosstalk", "--config=~/node.toml"]).unwrap();
        assert_eq!(args.config.as_deref(), Some("~/node.toml"));
    }
}
