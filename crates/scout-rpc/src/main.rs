//! Scout RPC Server - HTTP boundary for the missing-model resolution service.
//!
//! This binary wraps the scout-library service in a small axum HTTP server
//! for host frontends to call.

mod handlers;
mod server;

use anyhow::Result;
use clap::Parser;
use scout_library::ScoutService;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "scout-rpc")]
#[command(about = "HTTP server for the Scout missing-model service")]
struct Args {
    /// Port to listen on (0 = auto-assign)
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Models root directory (categories are its first-level subdirectories)
    #[arg(long, default_value = "models")]
    models_root: PathBuf,

    /// Data directory for the persisted repo cache (defaults to a sibling of
    /// the models root)
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting Scout RPC Server");

    let data_dir = args.data_dir.unwrap_or_else(|| {
        args.models_root
            .parent()
            .map(|p| p.join("scout-data"))
            .unwrap_or_else(|| PathBuf::from("scout-data"))
    });
    std::fs::create_dir_all(&data_dir)?;

    info!("Models root: {}", args.models_root.display());
    info!("Data dir: {}", data_dir.display());

    let service = ScoutService::new(&args.models_root, &data_dir)?;

    let addr = server::start_server(service, &args.host, args.port).await?;

    // Print port for the host frontend to read (intentional stdout)
    println!("SCOUT_PORT={}", addr.port());

    info!("Scout server running on {}", addr);

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");

    Ok(())
}
