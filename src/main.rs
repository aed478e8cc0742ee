//! RelayKV - A Replicated In-Memory Key-Value Server
//!
//! Main entry point. Loads the snapshot, joins the leader when started as a
//! replica, then accepts connections until Ctrl+C.

use anyhow::Context;
use relaykv::commands::CommandHandler;
use relaykv::config::{Cli, Config};
use relaykv::connection::{handle_connection, serve_leader_link, ConnectionStats};
use relaykv::replication::{connect, ReplicationState};
use relaykv::snapshot;
use relaykv::storage::StorageEngine;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

fn print_help() {
    println!(
        r#"
RelayKV - A Replicated In-Memory Key-Value Server

USAGE:
    relaykv [OPTIONS]

OPTIONS:
    -h, --host <HOST>              Host to bind to (default: 127.0.0.1)
    -p, --port <PORT>              Port to listen on (default: 6379)
        --replicaof "<HOST> <PORT>"  Run as a replica of the given leader
        --dir <DIR>                Snapshot directory (default: /tmp/redis-files)
        --dbfilename <FILE>        Snapshot file name (default: dump.rdb)
    -v, --version                  Print version information
        --help                     Print this help message

EXAMPLES:
    relaykv                                    # Leader on 127.0.0.1:6379
    relaykv --port 6380 --replicaof "localhost 6379"
    relaykv --dir /var/lib/relaykv --dbfilename snapshot.rdb

LOGGING:
    Set RUST_LOG to adjust verbosity, e.g. RUST_LOG=relaykv=debug
"#
    );
}

fn print_banner(config: &Config, replication: &ReplicationState) {
    println!(
        r#"
RelayKV v{} - Replicated In-Memory Key-Value Server
──────────────────────────────────────────────────────────────
Role:      {}
Replid:    {}
Listening: {}
Snapshot:  {}

Use Ctrl+C to shutdown gracefully.
"#,
        relaykv::VERSION,
        replication.role(),
        replication.replication_id(),
        config.bind_address(),
        config.snapshot_path().display(),
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command-line arguments
    let config = match Cli::from_args(std::env::args().skip(1)) {
        Ok(Cli::Serve(config)) => config,
        Ok(Cli::Help) => {
            print_help();
            return Ok(());
        }
        Ok(Cli::Version) => {
            println!("RelayKV version {}", relaykv::VERSION);
            return Ok(());
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            print_help();
            std::process::exit(1);
        }
    };

    // Set up logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    let config = Arc::new(config);
    let replication = Arc::new(ReplicationState::from_config(&config));
    print_banner(&config, &replication);

    // Create the storage engine (shared across all connections)
    let storage = Arc::new(StorageEngine::new());
    let snapshot_path = config.snapshot_path();
    snapshot::load_into(&storage, &snapshot_path)
        .with_context(|| format!("failed to load snapshot {}", snapshot_path.display()))?;

    let stats = Arc::new(ConnectionStats::new());
    let handler = CommandHandler::new(
        Arc::clone(&storage),
        Arc::clone(&replication),
        Arc::clone(&config),
        Arc::clone(&stats),
    );

    // Join the leader before serving clients
    if let Some(leader) = replication.leader() {
        let link = connect(leader, config.port)
            .await
            .with_context(|| format!("replication handshake with {} failed", leader))?;
        link.apply_snapshot(&storage);
        tokio::spawn(serve_leader_link(link, handler.clone(), Arc::clone(&stats)));
    }

    // Bind the TCP listener
    let listener = TcpListener::bind(config.bind_address())
        .await
        .with_context(|| format!("failed to bind {}", config.bind_address()))?;
    info!(role = %replication.role(), "Listening on {}", config.bind_address());

    // Set up graceful shutdown
    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received, stopping server...");
    };

    // Main accept loop
    tokio::select! {
        _ = accept_loop(listener, handler, stats) => {}
        _ = shutdown => {}
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Main loop that accepts incoming connections
async fn accept_loop(listener: TcpListener, handler: CommandHandler, stats: Arc<ConnectionStats>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let handler = handler.clone();
                let stats = Arc::clone(&stats);

                tokio::spawn(async move {
                    handle_connection(stream, addr, handler, stats).await;
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}
