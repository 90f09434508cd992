//! Gateway server binary.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use rtsp_webrtc_gateway::capture::CaptureFactory;
use rtsp_webrtc_gateway::{signaling, supervisor, GatewayConfig, SessionManager};

#[derive(Debug, Parser)]
#[command(name = "gateway_server", about = "RTSP to WebRTC media gateway")]
struct Args {
    /// Address to bind the signaling server to
    #[arg(long, env = "GATEWAY_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port for the signaling server
    #[arg(long, env = "GATEWAY_PORT", default_value_t = 8080)]
    port: u16,

    /// Maximum number of concurrent viewer sessions
    #[arg(long, env = "GATEWAY_MAX_CONNECTIONS", default_value_t = 20)]
    max_connections: usize,

    /// Seconds between expected client heartbeats
    #[arg(long, env = "GATEWAY_HEARTBEAT_INTERVAL", default_value_t = 10)]
    heartbeat_interval_secs: u64,

    /// Seconds without a heartbeat before a session is reaped
    #[arg(long, env = "GATEWAY_HEARTBEAT_TIMEOUT", default_value_t = 30)]
    heartbeat_timeout_secs: u64,

    /// Seconds between supervisor sweeps
    #[arg(long, env = "GATEWAY_SWEEP_INTERVAL", default_value_t = 10)]
    sweep_interval_secs: u64,

    /// Per-step negotiation timeout in seconds
    #[arg(long, env = "GATEWAY_NEGOTIATION_TIMEOUT", default_value_t = 10)]
    negotiation_timeout_secs: u64,

    /// STUN/TURN server URL (repeatable)
    #[arg(long = "ice-server", env = "GATEWAY_ICE_SERVERS", value_delimiter = ',')]
    ice_servers: Vec<String>,
}

impl Args {
    fn into_config(self) -> GatewayConfig {
        let mut config = GatewayConfig {
            max_connections: self.max_connections,
            heartbeat_interval_secs: self.heartbeat_interval_secs,
            heartbeat_timeout_secs: self.heartbeat_timeout_secs,
            sweep_interval_secs: self.sweep_interval_secs,
            negotiation_timeout_secs: self.negotiation_timeout_secs,
            ..Default::default()
        };
        if !self.ice_servers.is_empty() {
            config.ice_servers = self.ice_servers;
        }
        config
    }
}

fn capture_factory() -> Arc<dyn CaptureFactory> {
    #[cfg(feature = "ffmpeg")]
    {
        Arc::new(rtsp_webrtc_gateway::capture::FfmpegCaptureFactory::new())
    }
    #[cfg(not(feature = "ffmpeg"))]
    {
        tracing::warn!(
            "built without the 'ffmpeg' feature; RTSP capture is disabled \
             and sessions will serve substitute frames"
        );
        Arc::new(rtsp_webrtc_gateway::capture::DisabledCaptureFactory)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,rtsp_webrtc_gateway=debug")),
        )
        .init();

    let args = Args::parse();
    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let config = args.into_config();

    let manager = SessionManager::new(config, capture_factory())?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let supervisor = supervisor::spawn(manager.clone(), shutdown_rx);

    let serve_manager = manager.clone();
    signaling::serve(addr, serve_manager, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for shutdown signal");
        }
        tracing::info!("shutdown signal received");
    })
    .await?;

    let _ = shutdown_tx.send(true);
    let _ = supervisor.await;
    manager.shutdown().await;

    tracing::info!("gateway stopped");
    Ok(())
}
