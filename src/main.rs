use std::sync::Arc;

use clap::Parser;

use beacon_server::{Hub, HubConfig, DEFAULT_PORT};

/// Single-process notification hub: rebroadcasts restart events to every
/// connected peer.
#[derive(Parser, Debug)]
#[command(name = "beacon", version, about)]
struct Args {
    /// Port for the WebSocket endpoint.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Suppress the startup notice.
    #[arg(long)]
    quiet: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let hub = Arc::new(Hub::new(HubConfig {
        port: args.port,
        ..Default::default()
    }));

    if let Err(e) = hub.start(args.quiet).await {
        tracing::error!(error = %e, "failed to start hub");
        std::process::exit(1);
    }

    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for ctrl+c");

    hub.stop().await;
    tracing::info!("shutting down");
}
