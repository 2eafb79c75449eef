// Reads counter samples as JSON lines on stdin and forwards them to InfluxDB

use anyhow::{Context, Result};
use clap::Parser;
use influx_forwarder::config::{batch_policy_from_store, http_timeout_from_store, LogLevel};
use influx_forwarder::prelude::*;
use influx_forwarder::util::logging;
use log::{debug, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "influx-forwarder", version, about = "Forward performance counter samples to InfluxDB")]
struct Args {
    /// Path to the configuration file (toml, json or yaml)
    #[arg(short, long)]
    config: PathBuf,

    /// JSON file mapping object names to types and types to families
    #[arg(short, long)]
    registry: Option<PathBuf>,

    /// Prefix of environment variables overriding the configuration file
    #[arg(long, default_value = "FORWARDER")]
    env_prefix: String,

    /// Seconds between checks of the configuration for changes
    #[arg(long, default_value = "5")]
    reload_secs: u64,

    /// Logging level
    #[arg(short, long, default_value = "info")]
    log_level: LogLevel,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(&args.log_level);
    info!("influx-forwarder {}", influx_forwarder::VERSION);

    let store = Arc::new(
        FileConfigStore::load(vec![
            ConfigSource::File(args.config.to_string_lossy().to_string()),
            ConfigSource::Environment(args.env_prefix.clone()),
        ])
        .with_context(|| format!("Failed to load configuration from {}", args.config.display()))?,
    );

    let registry = match &args.registry {
        Some(path) => StaticRegistry::load_json(path)
            .with_context(|| format!("Failed to load registry from {}", path.display()))?,
        None => {
            warn!("No registry given, every sample will fail its type lookup");
            StaticRegistry::new()
        }
    };

    let udp = Arc::new(UdpTransport::new());
    let http = Arc::new(BatchedHttpTransport::new(
        tokio::runtime::Handle::current(),
        batch_policy_from_store(store.as_ref()),
        http_timeout_from_store(store.as_ref()),
    ));
    let plugin = ForwardingPlugin::new(store.clone(), Arc::new(registry), udp, http.clone());

    let watcher = store.watch(Duration::from_secs(args.reload_secs.max(1)));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match serde_json::from_str::<CounterSample>(line) {
            Ok(sample) => plugin.on_sample(&sample),
            Err(e) => warn!("Skipping malformed sample: {}", e),
        }
    }

    debug!("Input closed, shutting down");
    store.stop();
    http.close().await;
    plugin.shutdown();
    if let Err(e) = watcher.await {
        warn!("Configuration watcher failed: {}", e);
    }

    let stats = plugin.stats();
    info!(
        "Forwarded {} samples ({} failed, {} skipped while disabled, {} not real-time)",
        stats.forwarded, stats.failed, stats.skipped_disabled, stats.skipped_non_realtime
    );
    Ok(())
}
