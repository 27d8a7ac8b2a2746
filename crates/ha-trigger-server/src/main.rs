//! Trigger script host
//!
//! Loads decorated scripts into a [`TriggerEngine`] on an in-process host and
//! runs their watchers until interrupted.
//!
//! ```text
//! triggerd [--config FILE] [script.py | script_dir]...
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use ha_host::Host;
use ha_trigger::{EngineConfig, TriggerEngine};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Run trigger-decorated scripts against an in-process host
#[derive(Parser, Debug)]
#[command(name = "triggerd", version, about, long_about = None)]
struct Args {
    /// Engine config file (YAML)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Script files or directories of scripts
    scripts: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => EngineConfig::default(),
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!("Starting trigger host");

    let host = Arc::new(Host::with_capacity(config.event_channel_capacity));
    let engine = TriggerEngine::new(host.clone(), config);

    let mut reports = engine.load_configured().await?;
    for path in &args.scripts {
        let loaded = if path.is_dir() {
            engine.load_dir(path).await
        } else {
            engine.load_file(path).await.map(|r| vec![r])
        };
        match loaded {
            Ok(r) => reports.extend(r),
            Err(e) => error!(path = %path.display(), "Failed to load: {}", e),
        }
    }

    let failed: usize = reports.iter().map(|r| r.failed.len()).sum();
    info!(
        scripts = reports.len(),
        watchers = engine.watcher_count(),
        failed_functions = failed,
        "Scripts loaded"
    );

    host.start();
    info!("Trigger host is running");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    host.stop();
    // Let shutdown triggers see the stop event before their watchers go
    tokio::time::sleep(Duration::from_millis(100)).await;
    engine.unload_all().await;

    Ok(())
}
