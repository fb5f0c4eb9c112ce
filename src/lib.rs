pub mod config;
pub mod context;
pub mod discovery;
pub mod error;
pub mod filter;
pub mod metrics;
pub mod policy;
pub mod proxy;
pub mod rate_limit;
pub mod router;
pub mod rpc;

use crate::config::GatewayConfig;
use crate::context::RidGenerator;
use crate::discovery::StaticDiscovery;
use crate::error::{GatewayError, Result};
use crate::filter::FilterChain;
use crate::metrics::MetricsService;
use crate::policy::{CacheScope, FilePolicyStore, PolicyCache, PolicyRefresher, PolicyStore};
use crate::proxy::BackendDispatcher;
use crate::rate_limit::RateLimiterService;
use crate::router::{build_app, GatewayState};
use crate::rpc::{LimiterLink, RpcServer};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Run the gateway process until Ctrl-C/SIGTERM
pub async fn run_gateway(config: GatewayConfig) -> Result<()> {
    config.validate()?;

    info!("Starting API gateway");
    let cancel = CancellationToken::new();

    if config.server.metrics_port != 0 {
        spawn_metrics_server(&config.server.host, config.server.metrics_port, cancel.clone()).await?;
    }

    let store: Arc<dyn PolicyStore> = Arc::new(FilePolicyStore::new(&config.policy.store));
    let cache = Arc::new(PolicyCache::new(CacheScope::Full));
    cache.load_from(store.as_ref()).await?;
    let refresher = PolicyRefresher::new(cache.clone(), store, &config.policy).spawn(cancel.child_token());

    let link = LimiterLink::connect(&config.limiter).await?;
    link.spawn_supervisor();

    let discovery = Arc::new(StaticDiscovery::from_config(&config.discovery));
    let state = GatewayState::new(
        cache,
        RidGenerator::new(config.server.server_id),
        FilterChain::new(link.clone()),
        BackendDispatcher::new(discovery)?,
        &config.server.entry_path,
    );
    let app = build_app(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "Gateway ready to accept connections");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Gateway drained, stopping background tasks");
    cancel.cancel();
    link.shutdown().await;
    if let Err(e) = refresher.await {
        warn!(error = %e, "Policy refresher ended abnormally");
    }

    Ok(())
}

/// Run the rate limiter process until Ctrl-C/SIGTERM
pub async fn run_limiter(config: GatewayConfig) -> Result<()> {
    config.validate()?;

    info!("Starting rate limiter");
    let cancel = CancellationToken::new();

    let store: Arc<dyn PolicyStore> = Arc::new(FilePolicyStore::new(&config.policy.store));
    let cache = Arc::new(PolicyCache::new(CacheScope::StrategiesOnly));
    cache.load_from(store.as_ref()).await?;
    let refresher = PolicyRefresher::new(cache.clone(), store, &config.policy).spawn(cancel.child_token());

    let service = Arc::new(RateLimiterService::new(cache));
    let server = RpcServer::bind(&config.limiter.listen, service).await?;
    let server_task = tokio::spawn(server.serve(cancel.child_token()));

    shutdown_signal().await;
    cancel.cancel();

    server_task
        .await
        .map_err(|e| GatewayError::Internal(format!("RPC server task failed: {}", e)))??;
    if let Err(e) = refresher.await {
        warn!(error = %e, "Policy refresher ended abnormally");
    }

    Ok(())
}

async fn spawn_metrics_server(host: &str, port: u16, cancel: CancellationToken) -> Result<()> {
    let metrics = MetricsService::new()?;
    let addr = format!("{}:{}", host, port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "Metrics endpoint listening");

    tokio::spawn(async move {
        let shutdown = async move { cancel.cancelled().await };
        if let Err(e) = axum::serve(listener, metrics.router())
            .with_graceful_shutdown(shutdown)
            .await
        {
            warn!(error = %e, "Metrics server stopped");
        }
    });

    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}

/// Initialize tracing/logging
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "juz_gateway=info,tower_http=info".into()),
        )
        .with_target(false)
        .compact()
        .init();
}
