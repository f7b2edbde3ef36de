use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use chronocache::cache::TtlCache;
use chronocache::config::Config;
use chronocache::metrics::ProxyMetrics;
use chronocache::proxy::CacheProxy;
use chronocache::server::{self, AppState};
use chronocache::telemetry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_telemetry();

    let cfg = Config::parse();
    let upstream = cfg.upstream_uri()?;

    info!(
        listen = %cfg.listen_addr,
        upstream = %upstream,
        ttl_secs = cfg.cache_ttl_secs,
        "starting chronocache"
    );

    // A CancellationToken propagates shutdown to the accept loop and the
    // cache sweeper.
    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received, draining");
        signal_token.cancel();
    });

    let metrics = Arc::new(ProxyMetrics::new());
    let cache = Arc::new(TtlCache::new(cfg.cache_ttl()));

    let sweeper = tokio::spawn({
        let cache = Arc::clone(&cache);
        let token = shutdown.clone();
        async move { cache.run_sweeper(token).await }
    });

    let state = Arc::new(AppState {
        proxy: CacheProxy::new(upstream, Arc::clone(&cache), Arc::clone(&metrics)),
        cache,
        metrics,
        route_prefix: cfg.route_prefix.clone(),
    });

    server::run(&cfg.listen_addr, state, shutdown, cfg.shutdown_grace()).await?;

    sweeper.await.context("cache sweeper task panicked")?;
    info!("stopped");
    Ok(())
}

/// Waits for Ctrl+C or SIGTERM to initiate graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("received Ctrl+C"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for Ctrl+C");
    }
}
