use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use mule_core::{NodeId, SystemClock};
use mule_crypto::identity::NodeIdentity;
use mule_node::persistence::{load_snapshot_if_present, save_snapshot_to_path};
use mule_node::{spawn_background, BundleLayer, LayerParams};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use crate::config::MuledConfig;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Commands {
    /// Run the bundle layer daemon (default)
    Run,
    /// Print this node's id
    Identity,
    /// Print queue, cache and runtime counters from the last snapshot
    Stats,
}

fn ensure_parent(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

fn load_or_create_identity(path: &Path) -> Result<NodeIdentity, String> {
    if path.exists() {
        let content = fs::read_to_string(path).map_err(|e| format!("read node key: {e}"))?;
        return NodeIdentity::from_secret_hex(&content)
            .map_err(|e| format!("parse node key {}: {e}", path.display()));
    }

    let identity = NodeIdentity::generate();
    ensure_parent(path).map_err(|e| format!("create node key dir: {e}"))?;
    fs::write(path, identity.secret_hex()).map_err(|e| format!("write node key: {e}"))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o600));
    }
    info!(path = %path.display(), "generated new node identity");
    Ok(identity)
}

fn resolve_identity(config: &MuledConfig) -> Result<NodeIdentity, String> {
    match config.node_key.as_deref().filter(|k| !k.trim().is_empty()) {
        Some(hex_secret) => NodeIdentity::from_secret_hex(hex_secret)
            .map_err(|e| format!("parse MULE_NODE_KEY: {e}")),
        None => load_or_create_identity(&config.node_key_path),
    }
}

fn build_layer(config: &MuledConfig, identity: NodeIdentity) -> Result<BundleLayer, String> {
    let layer = BundleLayer::new(LayerParams {
        config: config.layer.clone(),
        identity,
        clock: Arc::new(SystemClock),
        local_access_point: config.access_point.clone(),
    })
    .map_err(|e| format!("invalid bundle layer config: {e}"))?;

    match load_snapshot_if_present(&config.state_path) {
        Ok(Some(snapshot)) => {
            layer
                .restore(snapshot)
                .map_err(|e| format!("restore {}: {e}", config.state_path.display()))?;
            info!(path = %config.state_path.display(), "restored node snapshot");
        }
        Ok(None) => info!(path = %config.state_path.display(), "no snapshot, starting empty"),
        Err(err) => warn!(path = %config.state_path.display(), "snapshot unreadable: {err}"),
    }

    for raw in &config.genesis {
        match raw.parse::<NodeId>() {
            Ok(node) => {
                layer.add_genesis(node);
            }
            Err(err) => warn!(genesis = %raw, "ignoring invalid genesis node id: {err}"),
        }
    }

    if let Some(level) = config.battery_level {
        layer.set_battery_level(level);
    }
    Ok(layer)
}

fn save_snapshot(layer: &BundleLayer, path: &Path) {
    if let Err(err) = ensure_parent(path) {
        warn!(path = %path.display(), "create state dir failed: {err}");
        return;
    }
    match save_snapshot_to_path(path, &layer.snapshot()) {
        Ok(()) => tracing::debug!(path = %path.display(), "snapshot saved"),
        Err(err) => warn!(path = %path.display(), "snapshot save failed: {err}"),
    }
}

fn print_stats(layer: &BundleLayer) -> Result<(), String> {
    let report = serde_json::json!({
        "node_id": layer.node_id().to_string(),
        "queues": layer.queue_stats(None),
        "cache": layer.cache_stats(),
        "runtime": layer.runtime_stats(),
    });
    let rendered =
        serde_json::to_string_pretty(&report).map_err(|e| format!("render stats: {e}"))?;
    println!("{rendered}");
    Ok(())
}

async fn run(config: MuledConfig, layer: BundleLayer) {
    info!(
        node_id = %layer.node_id(),
        role = ?config.layer.role,
        state_path = %config.state_path.display(),
        "muled started"
    );

    let background = spawn_background(&layer);
    let (stop_tx, mut stop_rx) = watch::channel(false);

    let snapshot_layer = layer.clone();
    let snapshot_path = config.state_path.clone();
    let snapshot_interval = config.snapshot_interval;
    let snapshots = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(snapshot_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => save_snapshot(&snapshot_layer, &snapshot_path),
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
            }
        }
    });

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {err}");
    }
    info!("shutdown requested");

    let _ = stop_tx.send(true);
    if let Err(err) = snapshots.await {
        warn!("snapshot task ended abnormally: {err}");
    }
    background.shutdown().await;
    save_snapshot(&layer, &config.state_path);
    info!("muled stopped");
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    let config = match MuledConfig::new(cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!("failed to load config: {err}");
            std::process::exit(1);
        }
    };

    let identity = match resolve_identity(&config) {
        Ok(identity) => identity,
        Err(err) => {
            error!("{err}");
            std::process::exit(1);
        }
    };

    if cli.command == Some(Commands::Identity) {
        println!("{}", identity.node_id());
        return;
    }

    let layer = match build_layer(&config, identity) {
        Ok(layer) => layer,
        Err(err) => {
            error!("{err}");
            std::process::exit(1);
        }
    };

    match cli.command {
        Some(Commands::Stats) => {
            if let Err(err) = print_stats(&layer) {
                error!("{err}");
                std::process::exit(1);
            }
        }
        _ => run(config, layer).await,
    }
}
