//! Warden - identity and access control server

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use warden::{Args, Server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    // Parse command line arguments
    let args = Args::parse();

    // Initialize tracing/logging
    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("warden={},info", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Validate configuration
    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    // Print startup banner
    info!("======================================");
    info!("  Warden - identity & access control");
    info!("======================================");
    info!("Node ID: {}", args.node_id);
    info!("HTTP: {}", args.listen_http);
    info!("HTTPS: {}", args.listen_https);
    info!("Metrics: {}", args.listen_metrics);
    info!("Network encryption: {}", args.network_encryption);
    info!("Rotation window: {} days", args.full_key_rotation_days);
    info!("Database: {}", args.db_path);
    info!("======================================");

    // Bootstrap the trust subsystem; any failure here is fatal
    let server = match Server::new(args).await {
        Ok(server) => server,
        Err(e) => {
            error!("Startup failed: {}", e);
            std::process::exit(1);
        }
    };

    // Run the server until shutdown
    if let Err(e) = server.run().await {
        error!("Server error: {:?}", e);
        std::process::exit(1);
    }

    Ok(())
}
