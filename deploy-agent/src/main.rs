//! Deploy Agent - Main entry point

use anyhow::Result;
use clap::Parser;
use deploy_agent::{api, config::Config, daemon::shutdown::{self, StopSwitch}, utils, Gateway};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", default_value = "deploy-agent.toml")]
    config: PathBuf,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Project root (overrides config)
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // File, then environment, then flags
    let mut config = Config::from_file(&args.config)?;
    config.apply_env_overrides();
    if let Some(port) = args.port {
        config.agent.port = port;
    }
    if let Some(root) = args.root {
        config.project.root = root;
    }
    if let Some(level) = args.log_level {
        config.log.level = level;
    }

    utils::logger::init(&config.log.level, config.log.file.as_deref())?;
    config.validate()?;

    tracing::info!(
        "Starting deploy-agent v{} (agent_id: {})",
        env!("CARGO_PKG_VERSION"),
        config.agent.id
    );

    let ip: IpAddr = config.agent.bind.parse()?;
    let addr = SocketAddr::new(ip, config.agent.port);
    let gateway = Arc::new(Gateway::new(config)?);
    tracing::info!("Project root: {}", gateway.root().display());

    let app = api::create_router(gateway);
    let switch = StopSwitch::new();

    tracing::info!("Listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(switch.stopped());
    let server_handle = tokio::spawn(async move { server.await });

    let signal = shutdown::stop_signal().await;
    tracing::info!("Received {}, draining requests", signal);
    switch.stop();

    match tokio::time::timeout(shutdown::DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => tracing::info!("Server shutdown complete"),
        Ok(Ok(Err(e))) => tracing::error!("Server error during shutdown: {}", e),
        Ok(Err(e)) => tracing::error!("Server task panicked: {}", e),
        Err(_) => tracing::warn!("Server shutdown timeout, forcing exit"),
    }

    Ok(())
}
