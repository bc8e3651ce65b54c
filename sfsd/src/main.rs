#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

mod config;
mod server;
mod shutdown;

use clap::Parser;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "sfsd")]
#[command(about = "sfsd - metadata server for the sfs shared file system")]
#[command(version)]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0:7300")]
    listen: SocketAddr,

    #[arg(short, long, default_value = "0.0.0.0:9090")]
    metrics: SocketAddr,

    /// Server ordinal announced to clients after take over
    #[arg(short, long, default_value = "1")]
    node_id: u32,

    #[arg(long, default_value = "sfs0")]
    fs_name: String,

    #[arg(long, default_value = "1")]
    fsid: u32,

    #[arg(long)]
    multihost_write: bool,

    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long, value_name = "PATH")]
    gen_config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Handle --gen-config before initializing tracing
    if let Some(path) = &args.gen_config {
        if let Err(e) = generate_config(path) {
            eprintln!("Failed to generate config: {}", e);
            std::process::exit(1);
        }
        println!("Generated default config at: {}", path.display());
        return;
    }

    init_tracing();

    let config = match &args.config {
        Some(path) => match config::Config::from_file(path) {
            Ok(c) => c,
            Err(e) => {
                error!(
                    target: "sfsd",
                    error = %e,
                    path = %path.display(),
                    "Failed to load config file"
                );
                std::process::exit(1);
            },
        },
        None => config::Config::from_args(&args),
    };

    if let Err(e) = config.validate() {
        error!(target: "sfsd", error = %e, "Invalid configuration");
        std::process::exit(1);
    }

    info!(
        target: "sfsd",
        version = env!("CARGO_PKG_VERSION"),
        node_id = config.node_id,
        listen = %config.listen_addr,
        metrics = %config.metrics_addr,
        fs = %config.filesystem.name,
        fsid = config.filesystem.fsid,
        multihost_write = config.filesystem.multihost_write,
        "Starting sfsd"
    );

    if let Err(e) = sfs_metrics::init_prometheus_exporter(config.metrics_addr) {
        error!(
            target: "sfsd",
            error = %e,
            "Failed to initialize metrics exporter"
        );
        std::process::exit(1);
    }

    info!(
        target: "sfsd",
        addr = %config.metrics_addr,
        "Prometheus metrics exporter started"
    );

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

    // Start periodic metrics export task
    let metrics_shutdown_rx = shutdown_tx.subscribe();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
        let mut shutdown_rx = metrics_shutdown_rx;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    sfs_metrics::export_to_prometheus();
                }
                _ = shutdown_rx.recv() => {
                    break;
                }
            }
        }
    });

    let sessions = shutdown::Sessions::default();
    let mut server_handle = tokio::spawn(server::run(
        config,
        sessions.clone(),
        shutdown_tx.subscribe(),
    ));

    let signalled = tokio::select! {
        signal = shutdown::signalled() => {
            match &signal {
                Ok(name) => info!(target: "sfsd", signal = *name, "Shutdown signal received"),
                Err(e) => error!(target: "sfsd", error = %e, "Failed to install signal handlers"),
            }
            let _ = shutdown_tx.send(());
            // Let the listener cancel its sessions before draining.
            if let Err(e) = (&mut server_handle).await {
                error!(target: "sfsd", error = %e, "Server task panicked");
            }
            signal.is_ok()
        }
        result = &mut server_handle => {
            match result {
                Ok(Ok(())) => info!(target: "sfsd", "Server exited cleanly"),
                Ok(Err(e)) => error!(target: "sfsd", error = %e, "Server error"),
                Err(e) => error!(target: "sfsd", error = %e, "Server task panicked"),
            }
            let _ = shutdown_tx.send(());
            false
        }
    };

    if !sessions.drain(shutdown::DRAIN_TIMEOUT).await {
        warn!(target: "sfsd", "Some sessions were cut off");
    }

    if signalled {
        info!(target: "sfsd", "sfsd shutdown complete");
    } else {
        std::process::exit(1);
    }
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sfs=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

fn generate_config(path: &Path) -> std::io::Result<()> {
    let config = config::Config::default();

    let content = format!(
        r#"# sfsd Configuration File
# Generated by: sfsd --gen-config {}
#
# All values shown are defaults. Uncomment and modify as needed.

# =============================================================================
# Node Identity
# =============================================================================

# Server ordinal announced to clients when this node takes over (non-zero)
node_id = {}

# =============================================================================
# Network Settings
# =============================================================================

# Address and port for client connections
listen_addr = "{}"

# Address and port for Prometheus metrics endpoint
metrics_addr = "{}"

# =============================================================================
# Filesystem
# =============================================================================

[filesystem]
# Name clients mount by
name = "{}"

# Filesystem identity; requests carrying another fsid are answered stale
fsid = {}

# Allow several clients to write one file concurrently with direct I/O
multihost_write = {}

# Blocks reported by statfs
capacity_blocks = {}

# =============================================================================
# Lease Policy
# =============================================================================

[lease]
# Lease interval = clamp(requested * mul + add, min_secs, max_secs)
mul = {}
add = {}
min_secs = {}
max_secs = {}

# Seconds a conflicting request waits before holders are asked to
# relinquish (negative disables relinquish callouts)
lease_timeout_secs = {}

# Longest lease a client may request
max_lease_secs = {}

# =============================================================================
# Session Settings
# =============================================================================

[session]
# After take over, resume service without clients that have not resynced
# within this many milliseconds
resync_timeout_ms = {}

# Outbound messages queued per client connection
queue_depth = {}

# Socket read size in bytes
read_chunk = {}
"#,
        path.display(),
        config.node_id,
        config.listen_addr,
        config.metrics_addr,
        config.filesystem.name,
        config.filesystem.fsid,
        config.filesystem.multihost_write,
        config.filesystem.capacity_blocks,
        config.lease.mul,
        config.lease.add,
        config.lease.min_secs,
        config.lease.max_secs,
        config.lease.lease_timeout_secs,
        config.lease.max_lease_secs,
        config.session.resync_timeout_ms,
        config.session.queue_depth,
        config.session.read_chunk,
    );

    std::fs::write(path, content)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_generated_config_loads_as_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sfsd.toml");
        generate_config(&path).unwrap();

        let loaded = config::Config::from_file(&path).unwrap();
        let defaults = config::Config::default();
        assert_eq!(loaded.node_id, defaults.node_id);
        assert_eq!(loaded.listen_addr, defaults.listen_addr);
        assert_eq!(loaded.filesystem.name, defaults.filesystem.name);
        assert_eq!(loaded.lease, defaults.lease);
        assert_eq!(loaded.session.resync_timeout_ms, defaults.session.resync_timeout_ms);
    }

    #[test]
    fn test_args_build_config() {
        let args = Args::parse_from([
            "sfsd",
            "--listen",
            "127.0.0.1:7310",
            "--node-id",
            "3",
            "--fs-name",
            "shared",
            "--multihost-write",
        ]);
        let config = config::Config::from_args(&args);
        assert_eq!(config.node_id, 3);
        assert_eq!(config.listen_addr.port(), 7310);
        assert_eq!(config.filesystem.name, "shared");
        assert!(config.filesystem.multihost_write);
        assert_eq!(config.server_config().server_ord, 3);
    }
}
