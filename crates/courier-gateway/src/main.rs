//! courier-gateway: real-time message gateway.
//!
//! Accepts WebSocket clients, establishes an X25519 session key with each,
//! decrypts their messages and forwards them through a scaled worker pool
//! to Redis pub/sub. A small HTTP control plane reports presence and pushes
//! payloads back to connected clients.

mod bridge;
mod config;
mod control;
mod handshake;
mod metrics;
mod pool;
mod registry;
mod server;
mod session;
mod transport;

#[cfg(test)]
mod testing;

use bridge::{ControlPlane, ForwardHandler, RedisPublisher};
use clap::Parser;
use config::{ConfigOverrides, GatewayConfig};
use courier_core::{CourierError, CourierResult};
use pool::WorkerPool;
use registry::ConnectionRegistry;
use server::GatewayServer;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// courier-gateway: encrypted WebSocket gateway
#[derive(Parser, Debug)]
#[command(name = "courier-gateway", version, about = "Encrypted WebSocket message gateway")]
struct Cli {
    /// WebSocket listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Control-plane HTTP port
    #[arg(long)]
    control_port: Option<u16>,

    /// Prometheus metrics port
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Redis URL for the message broker
    #[arg(long)]
    redis_url: Option<String>,

    /// Minimum forwarding workers
    #[arg(long)]
    min_workers: Option<usize>,

    /// Maximum forwarding workers
    #[arg(long)]
    max_workers: Option<usize>,

    /// Config file path
    #[arg(long, default_value = "~/.courier/config.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let overrides = ConfigOverrides {
        port: cli.port,
        control_port: cli.control_port,
        metrics_port: cli.metrics_port,
        redis_url: cli.redis_url.clone(),
        min_workers: cli.min_workers,
        max_workers: cli.max_workers,
    };
    let config_path = PathBuf::from(&cli.config);
    let gateway_config = match GatewayConfig::load(Some(&config_path), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = gateway_config.port,
        control_port = gateway_config.control_port,
        metrics_port = gateway_config.metrics_port,
        "starting courier-gateway"
    );

    if let Err(e) = run(gateway_config).await {
        error!(error = %e, "gateway error");
        std::process::exit(1);
    }

    info!("courier-gateway stopped");
}

async fn run(config: GatewayConfig) -> CourierResult<()> {
    let metrics_handle = metrics::install_recorder().map_err(CourierError::Other)?;

    let ws_addr = socket_addr(&config.host, config.port)?;
    let control_addr = socket_addr(&config.host, config.control_port)?;
    let metrics_addr = socket_addr(&config.host, config.metrics_port)?;

    let publisher = RedisPublisher::connect(&config.redis_url).await?;
    let pool = WorkerPool::new("forward", config.pool.clone(), ForwardHandler::new(publisher))?;
    let scaler = pool.spawn_scaler();

    let registry = Arc::new(ConnectionRegistry::new());
    let shutdown = CancellationToken::new();

    let listeners = async {
        let control = control::bind(control_addr).await?;
        let metrics = control::bind(metrics_addr).await?;
        let ws = transport::websocket::start_listener(ws_addr).await?;
        Ok::<_, CourierError>((control, metrics, ws))
    };
    let (control_listener, metrics_listener, (bound, connections)) = match listeners.await {
        Ok(bound) => bound,
        Err(e) => {
            pool.shutdown().await;
            let _ = scaler.await;
            return Err(e);
        }
    };

    let control_task = tokio::spawn(control::serve(
        control_listener,
        control::router(ControlPlane::new(registry.clone())),
        shutdown.clone(),
    ));
    let metrics_task = tokio::spawn(control::serve(
        metrics_listener,
        control::metrics_router(metrics_handle),
        shutdown.clone(),
    ));

    info!(ws = %bound, control = %control_addr, metrics = %metrics_addr, "courier-gateway ready");

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("received shutdown signal");
        signal_token.cancel();
    });

    let server = Arc::new(GatewayServer::new(config, registry, pool));
    server.serve(connections, shutdown.clone().cancelled_owned()).await;
    shutdown.cancel();

    for (name, task) in [("control", control_task), ("metrics", metrics_task)] {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(listener = name, error = %e, "HTTP listener failed"),
            Err(e) => warn!(listener = name, error = %e, "HTTP listener task failed"),
        }
    }
    let _ = scaler.await;
    Ok(())
}

fn socket_addr(host: &str, port: u16) -> CourierResult<SocketAddr> {
    format!("{host}:{port}")
        .parse()
        .map_err(|e| CourierError::Other(format!("invalid address {host}:{port}: {e}")))
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
