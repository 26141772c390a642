// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Netsukuku Node Daemon
//!
//! Entry point of `ntkd`. Parses the CLI, sets up logging, loads the stored
//! maps, hooks into the mesh and serves the HTTP API next to the protocol
//! loops.
//!
//! - `run`     — start the node
//! - `dump`    — print the stored maps as JSON
//! - `version` — print build version information

mod api;
mod cli;
mod logging;
mod metrics;
mod routes;
mod udp;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::sync::watch;

use ntk_protocol::config::ProtocolConfig;
use ntk_protocol::daemon::Daemon;
use ntk_protocol::map::{Family, Topology};
use ntk_protocol::store::MapStore;

use cli::{Commands, NtkdCli};
use metrics::NodeMetrics;
use routes::RouteTable;
use udp::UdpTransport;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = NtkdCli::parse();

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Dump(args) => dump_maps(args),
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Protocol tunables: defaults, then the JSON file, then CLI overrides.
fn load_config(args: &cli::RunArgs) -> Result<ProtocolConfig> {
    let mut config = match &args.config {
        Some(path) => ProtocolConfig::from_json_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => ProtocolConfig::default(),
    };
    config.family = Family::of(&args.address);
    if let Some(scans) = args.radar_scans {
        config.radar_scans = scans;
    }
    if let Some(interval) = args.scan_interval_ms {
        config.scan_interval_ms = interval;
    }
    config.validate().context("invalid protocol configuration")?;
    Ok(config)
}

fn open_store(data_dir: &std::path::Path) -> Result<MapStore> {
    let db_path = data_dir.join("maps");
    std::fs::create_dir_all(&db_path)
        .with_context(|| format!("failed to create map directory: {}", db_path.display()))?;
    MapStore::open(&db_path)
        .with_context(|| format!("failed to open map database at {}", db_path.display()))
}

async fn run_node(args: cli::RunArgs) -> Result<()> {
    logging::init_logging(logging::DEFAULT_FILTER, args.log_format);
    let config = load_config(&args)?;

    tracing::info!(
        address = %args.address,
        ifaces = ?args.ifaces,
        port = args.port,
        api_port = args.api_port,
        data_dir = %args.data_dir.display(),
        "starting ntkd"
    );

    // --- Maps ---
    let store = open_store(&args.data_dir)?;
    let topology = if args.restore {
        store.load_topology(args.address)
    } else {
        let fresh = Topology::new(args.address);
        fresh
            .set_identity(args.address)
            .context("address does not match its own family")?;
        fresh
    };
    let topology = Arc::new(topology);

    // --- Transport & daemon ---
    let transport = UdpTransport::bind(args.address, args.port, args.ifaces.clone())
        .await
        .with_context(|| format!("failed to bind udp port {}", args.port))?;
    let routes = Arc::new(RouteTable::new());
    let daemon = Arc::new(
        Daemon::new(config, topology, Arc::new(transport), routes.clone()).with_store(store),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let daemon_task = tokio::spawn(Arc::clone(&daemon).run(shutdown_rx));

    // Hooking needs the inbound loop for echo replies and the map reply.
    if !args.restore {
        let outcome = daemon.hook().await.context("hooking failed")?;
        tracing::info!(?outcome, "node hooked");
    }

    // --- API server ---
    let state = api::AppState {
        version: env!("CARGO_PKG_VERSION").to_string(),
        started_at: chrono::Utc::now(),
        daemon: Arc::clone(&daemon),
        routes,
        metrics: Arc::new(NodeMetrics::new().context("failed to create metrics registry")?),
    };
    let api_addr = format!("0.0.0.0:{}", args.api_port);
    let api_listener = tokio::net::TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("failed to bind API listener on {}", api_addr))?;
    tracing::info!("API listening on {}", api_addr);

    tokio::select! {
        res = axum::serve(api_listener, api::create_router(state)) => {
            if let Err(e) = res {
                tracing::error!(error = %e, "API server error");
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
        }
    }

    let _ = shutdown_tx.send(true);
    daemon_task
        .await
        .context("daemon task panicked")?
        .context("daemon stopped with an error")?;
    tracing::info!("ntkd stopped, maps saved");
    Ok(())
}

/// Prints the stored maps of `address` without starting anything.
fn dump_maps(args: cli::DumpArgs) -> Result<()> {
    let store = open_store(&args.data_dir)?;
    let topology = store.load_topology(args.address);
    let summary = topology.summary();
    println!(
        "{}",
        serde_json::to_string_pretty(&summary).context("failed to serialize the maps summary")?
    );
    Ok(())
}

fn print_version() {
    println!("ntkd      {}", env!("CARGO_PKG_VERSION"));
    println!("wire      {}", ntk_protocol::wire::WIRE_VERSION);
    println!("map fmt   {}", ntk_protocol::config::MAP_FORMAT_VERSION);
}

/// Waits for SIGINT or SIGTERM, whichever comes first.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_directory_is_created_and_reopened() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("ntkd");
        {
            let store = open_store(&data_dir).unwrap();
            let topology = store.load_topology("10.1.2.3".parse().unwrap());
            assert_eq!(topology.summary().alive_nodes, 1);
        }
        assert!(data_dir.join("maps").is_dir());
        assert!(open_store(&data_dir).is_ok());
    }
}
