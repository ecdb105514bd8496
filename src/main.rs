// =============================================================================
// MarketPulse — Main Entry Point
// =============================================================================
//
// Starts in whatever storage state it finds: if Redis is unreachable at boot
// the router serves from memory until a probe succeeds.
// =============================================================================

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use marketpulse::api;
use marketpulse::app_state::AppState;
use marketpulse::market_data::FeedClient;
use marketpulse::runtime_config::RuntimeConfig;
use marketpulse::service::IntradayService;
use marketpulse::state::{RedisStore, StateRouter};

const CONFIG_PATH: &str = "marketpulse.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("MarketPulse starting up");

    let mut config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });
    config.apply_env();
    config.validate()?;

    info!(
        bind_addr = %config.bind_addr,
        upstream = %config.upstream_url,
        max_symbols = config.max_symbols_memory,
        eviction = ?config.eviction_policy,
        serialize_updates = config.serialize_updates,
        "Configuration resolved"
    );

    // ── 2. State router ──────────────────────────────────────────────────
    let primary = Arc::new(RedisStore::new(&config.redis_url).context("invalid REDIS_URL")?);
    let router = Arc::new(StateRouter::new(
        primary,
        config.max_symbols_memory,
        config.eviction_policy,
        config.store_timeout(),
    ));

    match router.probe().await {
        Ok(()) => info!("Primary store reachable"),
        Err(e) => warn!(error = %e, "Primary store unreachable at startup, serving from memory"),
    }

    // ── 3. Candle feed & service ─────────────────────────────────────────
    let feed = Arc::new(FeedClient::new(&config.upstream_url)?);
    let service = Arc::new(IntradayService::new(router.clone(), feed, &config));

    let state = Arc::new(AppState::new(config, router.clone(), service));

    // ── 4. Health probe loop ─────────────────────────────────────────────
    let probe_router = router.clone();
    let probe_every = state.config.probe_interval();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(probe_every);
        // The first tick fires immediately; startup already probed.
        interval.tick().await;
        loop {
            interval.tick().await;
            // Transitions are logged by the router.
            let _ = probe_router.probe().await;
        }
    });

    // ── 5. API server ────────────────────────────────────────────────────
    let bind_addr = state.config.bind_addr.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind API server on {bind_addr}"))?;
    info!(addr = %bind_addr, "API server listening");

    let app = api::rest::router(state.clone());
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server failed");
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping");

    let stats = router.fallback_stats();
    info!(
        fallback_symbols = stats.entries,
        initializations = stats.initializations,
        evictions = stats.evictions,
        "MarketPulse shut down complete."
    );
    Ok(())
}
