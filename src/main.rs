//! # Broadcaster Main Entry Point
//!
//! This is the main entry point for the Broadcaster service.

use std::sync::Arc;

use broadcaster::{
    channel::DryRunSender, config::ConfigLoader, server::run_server, telemetry::init_tracing,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration from layered env files and variables
    let config_loader = ConfigLoader::new();
    let config = config_loader.load()?;

    init_tracing(&config)?;

    tracing::info!(profile = %config.profile, "Loaded configuration");
    if let Ok(redacted_json) = config.redacted_json() {
        tracing::debug!("Configuration: {}", redacted_json);
    }

    // No provider integration is wired at this layer; deployments plug a
    // real ChannelSender in place of the dry-run one.
    run_server(config, Arc::new(DryRunSender)).await
}
