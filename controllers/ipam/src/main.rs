//! IPAM Controller
//!
//! Runs the floating IP allocation engine for a cluster:
//! - Keeps the pool set in sync with its JSON config (file or ConfigMap)
//! - Persists allocations in SQLite or as FloatingIP custom resources
//! - Folds manually reserved FloatingIP objects into the allocation cache

mod backoff;
mod config;
mod controller;
mod error;
mod metrics;
mod reconciler;
mod watcher;

use crate::config::IpamConfig;
use crate::error::ControllerError;
use controller::Controller;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting IPAM Controller");

    // Load configuration from environment variables
    let config = IpamConfig::from_env()?;
    config.log();

    // Initialize and run controller
    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}
