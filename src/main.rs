#![forbid(unsafe_code)]

mod media;
mod metrics;
mod room;
mod signaling;

use anyhow::Result;
use media::MediaConfig;
use metrics::ServerMetrics;
use room::RoomRegistry;
use signaling::SignalingServer;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cribcast=debug,mediasoup=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("cribcast - starting media session coordinator");

    let mut media_config = MediaConfig::default();

    if let Ok(n) = std::env::var("NUM_WORKERS") {
        media_config.worker.num_workers = n
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid NUM_WORKERS: {n}"))?;
    }

    // Announced IP goes into ICE candidates; clients must be able to reach it
    if let Ok(ip) = std::env::var("ANNOUNCE_IP") {
        info!("Using ANNOUNCE_IP={}", ip);
        let addr = ip
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid ANNOUNCE_IP: {ip}"))?;
        media_config.transport = media_config.transport.with_announced_ip(addr);
    } else {
        let default_ip: std::net::IpAddr = std::net::Ipv4Addr::LOCALHOST.into();
        info!("No ANNOUNCE_IP set, using {}", default_ip);
        media_config.transport = media_config.transport.with_announced_ip(default_ip);
    }

    let metrics = ServerMetrics::new();
    let registry = Arc::new(RoomRegistry::new(media_config, metrics.clone()).await?);
    let mut worker_fatal = registry.worker_pool().subscribe_fatal();

    info!(
        "Room registry initialized ({} media workers)",
        registry.worker_pool().size()
    );

    let server = SignalingServer::new(registry.clone(), metrics);
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3000);

    tokio::select! {
        result = server.clone().serve(port) => {
            if let Err(e) = result {
                error!("Signaling server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            server.stop_accepting();
            registry.shutdown().await;
        }
        _ = worker_fatal.changed() => {
            // A dead media worker takes its routers with it; sessions on them
            // cannot be salvaged. Stop cleanly and let the supervisor restart.
            error!("Media worker died, shutting down");
            server.stop_accepting();
            registry.shutdown().await;
            std::process::exit(1);
        }
    }

    info!("Server shutdown complete");
    Ok(())
}
