//! Observation sequencer executor
//!
//! Loads the executor configuration, builds one script controller per
//! scripted device and runs the configured targets against simulated
//! devices.
//!
//! Usage: `obs-exec [CONFIG_DIR] [FILE]` (defaults: `.` and `exec.yaml`).

mod executor;
mod services;
mod sim;

use anyhow::{Context, Result};
use executor::Executor;
use obs_config::ExecConfig;
use obs_event_bus::NotificationBus;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut args = std::env::args().skip(1);
    let config_dir = args.next().unwrap_or_else(|| ".".to_string());
    let file = args.next().unwrap_or_else(|| "exec.yaml".to_string());

    info!(config_dir = %config_dir, file = %file, "Starting observation executor");
    let config = ExecConfig::load(&config_dir, &file)
        .with_context(|| format!("loading {} from {}", file, config_dir))?;
    info!(
        devices = config.devices.len(),
        targets = config.targets.len(),
        "Configuration loaded"
    );

    let notifications = Arc::new(NotificationBus::new());
    let mut executor = Executor::new(&config, notifications);
    let summary = executor.run().await?;

    info!(
        targets = summary.targets,
        disabled = summary.targets_disabled,
        values = executor.values().len(),
        "Executor stopped"
    );
    Ok(())
}
