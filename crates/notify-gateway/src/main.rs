use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use zoe_notify_gateway::{GatewayArgs, GatewayConfig, NotifyGatewayBuilder};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = GatewayArgs::parse();
    let config = GatewayConfig::try_from(args).context("Invalid configuration")?;

    info!("🚀 Starting Zoe Notify Gateway");
    info!("⚙️ {:?}", config);

    let bind_address = config.bind_address();
    let gateway = NotifyGatewayBuilder::new(config).build().await?;

    // keep serving; /healthz reports the client as not ready
    if let Err(e) = gateway.connect().await {
        warn!("⚠️ WhatsApp client not connected: {}", e);
    }

    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("Failed to bind {bind_address}"))?;
    info!("🌐 Listening on http://{}", listener.local_addr()?);

    gateway
        .serve(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("⚠️ Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            info!("🛑 Received Ctrl+C, shutting down...");
        })
        .await?;

    info!("👋 Zoe Notify Gateway stopped");
    Ok(())
}
