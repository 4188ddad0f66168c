//! Chain-signature relayer
//!
//! Runs the bridge engine against a live target ledger and the source-ledger
//! gateway: listens for signer events, serves relayer requests over HTTP and
//! drives deposit and withdraw sagas.

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use chainsig_bridge::api::{self, AppState};
use chainsig_bridge::chain::{EvmTargetLedger, RpcSourceGateway};
use chainsig_bridge::config::Settings;
use chainsig_bridge::coordination::CrossChainOrchestrator;
use chainsig_bridge::events::{EventSubscriptionBroker, SignerEventListener};
use chainsig_bridge::metrics::{self, MetricsServer};
use chainsig_bridge::saga::{DepositSaga, SagaContext, WithdrawSaga};

/// Capacity of the listener-to-dispatcher channel
const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting chainsig relayer v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration for target chain {} ({})",
        settings.target.name, settings.target.chain_id
    );

    // Initialize metrics server
    let metrics_server = if settings.metrics.enabled {
        Some(MetricsServer::new(settings.metrics.port))
    } else {
        None
    };

    // Ledger collaborators
    let target = Arc::new(EvmTargetLedger::new(settings.target.clone())?);
    let gateway = Arc::new(RpcSourceGateway::new(&settings.source)?);
    info!("Ledger connections initialized");

    // Event plumbing
    let broker = Arc::new(
        EventSubscriptionBroker::new(settings.broker_config()).with_log_source(gateway.clone()),
    );
    let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    let listener = Arc::new(SignerEventListener::new(
        gateway.clone(),
        event_tx,
        Duration::from_millis(settings.source.poll_interval_ms),
        settings.source.events_per_poll,
    ));
    let dispatcher_handle = broker.spawn_dispatcher(listener.subscribe());
    let sweeper_handle =
        broker.spawn_sweeper(Duration::from_millis(settings.relayer.sweep_interval_ms));

    // Sagas
    let orchestrator = Arc::new(CrossChainOrchestrator::new(
        broker.clone(),
        target.clone(),
        settings.orchestrator_config()?,
    ));
    let ctx = Arc::new(SagaContext::new(
        gateway.clone(),
        target.clone(),
        orchestrator,
        settings.target.gas_limit_buffer_percent,
        settings.saga_settings()?,
    ));
    info!("Saga engine initialized");

    // Start API server
    let api_handle = tokio::spawn({
        let state = AppState {
            deposits: Arc::new(DepositSaga::new(ctx.clone())),
            withdrawals: Arc::new(WithdrawSaga::new(ctx.clone())),
            broker: broker.clone(),
            target: target.clone(),
            started_at: Utc::now(),
        };
        let config = settings.api.clone();
        async move {
            if let Err(e) = api::run_server(config, state).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = metrics_server.map(|server| {
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        })
    });

    // Start signer event listener
    let listener_handle = tokio::spawn({
        let listener = listener.clone();
        async move {
            if let Err(e) = listener.listen().await {
                error!("Signer event listener error: {}", e);
            }
        }
    });

    // Health check loop
    let health_handle = tokio::spawn({
        let target = target.clone();
        let chain_id = settings.target.chain_id;
        let interval = settings.relayer.health_check_interval_secs;
        async move {
            loop {
                tokio::time::sleep(Duration::from_secs(interval)).await;

                let healthy = target.health_check().await;
                if !healthy {
                    warn!("Chain {} health check failed", chain_id);
                }
                metrics::record_chain_health(chain_id, healthy);
                metrics::record_health_check();
            }
        }
    });

    info!("Chainsig relayer is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // In-flight sagas see their subscriptions close and fail as interrupted
    broker.shutdown();

    // Abort background tasks
    api_handle.abort();
    listener_handle.abort();
    dispatcher_handle.abort();
    sweeper_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Chainsig relayer stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,chainsig_bridge=debug,chainsig_relayer=debug,hyper=warn")
    });

    let registry = tracing_subscriber::registry().with(filter);
    if std::env::var("LOG_FORMAT").map(|f| f == "json").unwrap_or(false) {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
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
