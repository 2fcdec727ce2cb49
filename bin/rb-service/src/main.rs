//! Queue RPC Bridge Service
//!
//! Consumes `math_queue` and `image_queue` from RabbitMQ, replies to each caller's
//! `reply_to` queue with the request's correlation id, and serves the same
//! operations over HTTP.
//!
//! ## Configuration
//!
//! - `BRIDGE_CONFIG_FILE`: optional TOML file, overridden by `BRIDGE_*` variables
//! - `BRIDGE_LOG_FORMAT=json`: structured JSON logs (filter with `RUST_LOG`)
//! - `BRIDGE_GATEWAY_ENABLED=true`: expose `POST /math/add` forwarding over the broker

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;
use rb_api::{create_router, AppState};
use rb_config::ServiceConfig;
use rb_dispatch::Dispatcher;
use rb_queue::{GatewayClient, ServiceRuntime};
use rb_worker::{HttpDetectorConfig, HttpHumanDetector};
use tokio::sync::broadcast;
use tokio::{net::TcpListener, signal};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    info!("Starting Queue RPC Bridge");

    // 1. Configuration
    let config = ServiceConfig::load()?;
    info!(
        broker = %config.broker.redacted_uri(),
        http = %config.http.bind_addr(),
        queues = config.queues.len(),
        "Configuration loaded"
    );

    // 2. Metrics recorder
    let metrics = PrometheusBuilder::new().install_recorder()?;

    // 3. Workers and dispatcher
    let detector = HttpHumanDetector::new(HttpDetectorConfig {
        endpoint: config.detector.url.clone(),
        connect_timeout: config.detector.connect_timeout(),
        request_timeout: config.detector.timeout(),
    })?;
    let dispatcher = Arc::new(Dispatcher::with_registrations(
        Arc::new(detector),
        &config.queues,
    ));

    // 4. Broker runtime; failing to connect here is fatal
    let runtime = Arc::new(ServiceRuntime::new(&config, dispatcher.clone()));
    let mut consumer_handle = runtime.clone().start().await?;

    // 5. Optional broker gateway on its own connection
    let mut state = AppState::new(dispatcher, runtime.subscribe_state()).with_metrics(metrics);
    let gateway = if config.gateway.enabled {
        let gateway = Arc::new(
            GatewayClient::connect(
                config.broker.clone(),
                config.reconnect.clone(),
                config.gateway.timeout(),
            )
            .await?,
        );
        info!(queue = %config.gateway.math_queue, "Broker gateway enabled");
        state = state.with_gateway(gateway.clone(), config.gateway.math_queue.clone());
        Some(gateway)
    } else {
        None
    };

    // 6. HTTP API server
    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any));

    let addr = config.http.bind_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "Starting HTTP API server");

    let (server_shutdown_tx, mut server_shutdown_rx) = broadcast::channel::<()>(1);
    let server_task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = server_shutdown_rx.recv().await;
            })
            .await
    });

    info!("Queue RPC Bridge started. Press Ctrl+C to shutdown.");

    // 7. Run until a signal arrives or the consumer gives up
    let consumer_exit = tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutdown signal received...");
            None
        }
        exit = &mut consumer_handle => Some(exit),
    };

    runtime.shutdown();
    let _ = server_shutdown_tx.send(());

    let consumer_exit = match consumer_exit {
        Some(exit) => Some(exit),
        None => tokio::time::timeout(SHUTDOWN_TIMEOUT, consumer_handle).await.ok(),
    };

    let mut failure = None;
    match consumer_exit {
        Some(Ok(Ok(()))) => {}
        Some(Ok(Err(e))) => {
            error!(error = %e, "Consumer stopped with error");
            failure = Some(anyhow::Error::from(e));
        }
        Some(Err(e)) => error!(error = %e, "Consumer task panicked"),
        None => warn!("Consumer did not stop within the shutdown timeout"),
    }

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, server_task).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => error!(error = %e, "HTTP server error"),
        Ok(Err(e)) => error!(error = %e, "HTTP server task panicked"),
        Err(_) => warn!("HTTP server did not stop within the shutdown timeout"),
    }

    if let Some(gateway) = gateway {
        gateway.close().await;
    }

    match failure {
        Some(e) => Err(e),
        None => {
            info!("Queue RPC Bridge shutdown complete");
            Ok(())
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());
    let json = std::env::var("BRIDGE_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
