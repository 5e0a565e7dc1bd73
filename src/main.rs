use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use ballast::config::{self, Args, MODE_REMOTE};
use ballast::internal::endpoint::Endpoint;
use ballast::internal::handlers;
use ballast::internal::limiter::Limiter;
use ballast::internal::registry::Registry;
use ballast::internal::strategy;
use ballast::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = config::load(&args).context("load configuration")?;
    config.validate().context("invalid config")?;

    tracing_subscriber::fmt()
        .with_max_level(config.log_filter())
        .init();

    let registry = if config.mode == MODE_REMOTE {
        Registry::remote(&config.database.uri, &config.database.name, config.defaults)
            .await
            .context("connect client database")?
    } else {
        Registry::local(&config.file_path, config.defaults)
            .await
            .context("open clients file")?
    };
    let registry = Arc::new(registry);
    let limiter = Arc::new(Limiter::new(registry.clone()));

    // Cancelled once the server has drained, stopping every background loop.
    let shutdown = CancellationToken::new();

    let mut endpoints = Vec::with_capacity(config.endpoints.len());
    for url in &config.endpoints {
        let endpoint = Endpoint::new(url, config.health_interval.0)
            .with_context(|| format!("endpoint {url}"))?;
        endpoint.clone().spawn_health_check(shutdown.clone());
        endpoints.push(endpoint);
    }

    let strategy =
        strategy::for_name(&config.strategy, endpoints).context("unknown balancer strategy")?;
    let track_connections = strategy.track_connections();

    {
        let limiter = limiter.clone();
        let interval = config.refill_interval.0;
        let token = shutdown.clone();
        tokio::spawn(async move { limiter.start_refill(interval, token).await });
    }

    let state = AppState {
        registry,
        limiter,
        strategy: Arc::new(Mutex::new(strategy)),
        track_connections,
        forward_client: reqwest::Client::new(),
    };

    let app = handlers::router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;

    tracing::info!(
        %addr,
        strategy = %config.strategy,
        endpoints = config.endpoints.len(),
        mode = %config.mode,
        "balancer listening"
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(wait_for_signal())
    .await?;

    shutdown.cancel();
    tracing::info!("balancer stopped");

    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to install SIGINT handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received SIGINT"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }

    tracing::info!("shutting down, draining in-flight requests");
}
