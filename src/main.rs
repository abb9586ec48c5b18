// ABOUTME: CLI entry point for sql-entity-bridge
// ABOUTME: Serves configured systems over HTTP or checks the configuration against the databases

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sql_entity_bridge::server::{self, DEFAULT_MAX_BODY_BYTES};
use sql_entity_bridge::{BridgeConfig, Registry};

#[derive(Parser)]
#[command(name = "sql-entity-bridge")]
#[command(about = "Sync PostgreSQL tables with JSON entity streams", long_about = None)]
#[command(version)]
struct Cli {
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve all configured sources and sinks over HTTP
    Serve {
        /// Path to the JSON or TOML configuration file
        #[arg(long, env = "BRIDGE_CONFIG")]
        config: PathBuf,
        /// Address to listen on
        #[arg(long, default_value = "0.0.0.0:4567")]
        listen: SocketAddr,
        /// Largest accepted POST body in bytes
        #[arg(long, default_value_t = DEFAULT_MAX_BODY_BYTES)]
        max_body_bytes: usize,
    },
    /// Connect to every system, inspect all sinks and print the result
    Check {
        /// Path to the JSON or TOML configuration file
        #[arg(long, env = "BRIDGE_CONFIG")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    // 1. RUST_LOG environment variable has highest precedence
    // 2. --log flag is used if RUST_LOG is not set
    // 3. Default to "info" if neither are provided
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));

    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    match cli.command {
        Commands::Serve {
            config,
            listen,
            max_body_bytes,
        } => serve(config, listen, max_body_bytes).await,
        Commands::Check { config } => check(config).await,
    }
}

async fn serve(config_path: PathBuf, listen: SocketAddr, max_body_bytes: usize) -> anyhow::Result<()> {
    tracing::info!("Loading configuration from: {}", config_path.display());
    let config = BridgeConfig::load(&config_path)?;
    let registry = Arc::new(
        Registry::configure(&config)
            .await
            .context("Failed to configure systems")?,
    );

    let app = server::router(registry.clone(), max_body_bytes);
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;
    tracing::info!("Listening on {}", listen);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed");

    registry.close();
    served
}

async fn check(config_path: PathBuf) -> anyhow::Result<()> {
    let config = BridgeConfig::load(&config_path)?;
    let registry = Registry::configure(&config)
        .await
        .context("Failed to configure systems")?;

    println!();
    println!("========================================");
    println!("Configuration check passed");
    println!("========================================");
    for system in registry.systems() {
        println!("  System: {}", system.id());
        for (id, source) in system.sources() {
            println!(
                "    source {:<20} key [{}]{}",
                id,
                source.primary_key().join(", "),
                source
                    .updated_column()
                    .map(|c| format!(", updated {}", c))
                    .unwrap_or_default()
            );
        }
        for (id, sink) in system.sinks() {
            let schema = sink.schema();
            println!(
                "    sink   {:<20} {} key [{}], timestamp {}",
                id,
                schema.qualified_table(),
                schema.primary_key.join(", "),
                if schema.use_timestamp { "yes" } else { "no" }
            );
        }
    }

    registry.close();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Received shutdown signal");
}
