//! # Waterfall Workflow Node
//!
//! Runs the backup/restore lifecycle manager for one backend on this host.
//! On startup it repairs jobs a previous run left mid-operation, then
//! serves workflow requests and periodically sweeps leaked scratch
//! resources until interrupted.
//!
//! ## Usage
//! ```bash
//! waterfall-node --config /etc/waterfall/workflow.yaml
//! waterfall-node --dev --log-level debug
//! ```

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

mod cli;
mod config;
mod server;

use cli::Args;
use config::Config;

const DEFAULT_CONFIG_PATH: &str = "/etc/waterfall/workflow.yaml";

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.json_logs {
        waterfall_common::init_logging_json(&args.log_level)?;
    } else {
        waterfall_common::init_logging(&args.log_level)?;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting Waterfall workflow node"
    );

    let config = match &args.config {
        Some(config_path) => match Config::load(config_path) {
            Ok(cfg) => {
                info!(config_path = %config_path, "Configuration loaded");
                cfg.with_cli_overrides(&args)?
            }
            Err(e) => {
                error!(error = %e, path = %config_path, "Failed to load configuration");
                return Err(e);
            }
        },
        None => match Config::load(DEFAULT_CONFIG_PATH) {
            Ok(cfg) => {
                info!(config_path = %DEFAULT_CONFIG_PATH, "Configuration loaded from default location");
                cfg.with_cli_overrides(&args)?
            }
            Err(_) => {
                info!("No config file found, using CLI arguments and defaults");
                Config::default_with_cli(&args)?
            }
        },
    };

    info!(
        driver = ?config.workflow.driver,
        backend = %config.workflow.backend_name,
        offload_deletes = config.workflow.offload_deletes,
        "Workflow node configured"
    );

    if let Err(e) = server::run(config).await {
        error!(error = %e, "Workflow node failed");
        return Err(e);
    }

    Ok(())
}
