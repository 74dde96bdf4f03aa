//! shardwire - sharded Discord gateway process
//!
//! - Runs the configured shards (auto, disabled or manual sharding)
//! - Logs dispatch traffic as structured JSON
//! - Exposes health/ready endpoints for Kubernetes
//! - Exports Prometheus metrics for observability

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{debug, error, info, warn};

use shardwire::config::GatewayConfig;
use shardwire::events::{EventKind, ShardEvent};
use shardwire::health::{self, AppState};
use shardwire::metrics::GatewayMetrics;
use shardwire::shard::{ShardPool, TungsteniteConnector};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first to get log level
    let gateway_config = GatewayConfig::from_env()?;

    // Initialize tracing with configured log level
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("shardwire={}", gateway_config.log_level).parse()?)
                .add_directive("twilight_http=info".parse()?)
                .add_directive("tungstenite=warn".parse()?),
        )
        .json()
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        sharding = ?gateway_config.sharding,
        intents = gateway_config.intents.bits(),
        "Starting shardwire"
    );

    let metrics = Arc::new(GatewayMetrics::install()?);
    info!("Prometheus metrics initialized");

    let http = twilight_http::Client::new(gateway_config.discord_token.clone());

    let pool = ShardPool::new(
        http,
        Arc::new(TungsteniteConnector),
        gateway_config.shard_config(),
        gateway_config.sharding.clone(),
    )
    .ignore_session_limit(gateway_config.ignore_session_limit)
    .with_group_delay(gateway_config.group_delay)
    .with_metrics(GatewayMetrics::clone(&metrics));

    pool.events().subscribe(EventKind::Dispatch, |event| {
        if let ShardEvent::Dispatch(dispatch) = &event.event {
            debug!(
                shard_id = event.shard_id,
                event = %dispatch.name,
                seq = ?dispatch.sequence,
                "Dispatch"
            );
        }
    });
    pool.events().subscribe(EventKind::Error, |event| {
        if let ShardEvent::Error(e) = &event.event {
            warn!(shard_id = event.shard_id, error = %e, "Shard error");
        }
    });

    // Start health server
    let app_state = AppState {
        shard_state: pool.state(),
        metrics: Arc::clone(&metrics),
    };

    let health_router = health::router(app_state);
    let addr: SocketAddr = ([0, 0, 0, 0], gateway_config.http_port).into();

    info!(port = gateway_config.http_port, "Starting HTTP server");

    let http_server = axum::serve(
        tokio::net::TcpListener::bind(addr).await?,
        health_router,
    );

    // Run everything concurrently
    tokio::select! {
        result = pool.run() => {
            if let Err(e) = result {
                error!(error = %e, "Shard pool error");
            }
        }
        result = http_server => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server error");
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
        }
    }

    // Graceful shutdown
    info!("Shutting down gateway...");
    pool.shutdown();
    for shard in pool.shards() {
        if let Err(e) = shard.wait().await {
            warn!(shard_id = shard.id(), error = %e, "Shard stopped with error");
        }
    }

    info!("Gateway shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
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
}
