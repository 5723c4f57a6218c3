// =============================================================================
// Borealis Perp Engine — Main Entry Point
// =============================================================================
//
// Boot order: config from env, candle history hydration, optional live
// bootstrap (failure disables mirroring, never the simulator), then the feed
// supervisor, the renderer API, the reconciliation task, and finally the
// engine loop itself. Ctrl+C closes the websocket gracefully and exits.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod config;
mod engine;
mod indicators;
mod live;
mod market_data;
mod sim;
mod strategy;
mod types;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::config::EngineConfig;
use crate::live::{FuturesClient, LiveTrader};
use crate::market_data::feed::run_feed;
use crate::market_data::{history, FeedHealth, SymbolStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║            Borealis Perp Engine — Starting Up            ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let cfg = EngineConfig::from_env();
    info!(
        symbols = ?cfg.symbols.iter().map(|s| s.symbol.as_str()).collect::<Vec<_>>(),
        interval = %cfg.history_interval,
        live = cfg.live.enabled,
        entry_mode = %cfg.live.entry_mode,
        "configuration loaded"
    );

    // ── 2. Candle history hydration ──────────────────────────────────────
    let mut store = SymbolStore::new(
        &cfg.symbols,
        cfg.history_candles,
        cfg.flow_lookback_ms,
        cfg.cycle_ms,
    );
    let http = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(10))
        .build()
        .expect("failed to build reqwest client");

    for spec in &cfg.symbols {
        let key = spec.market_lower();
        match history::fetch_history(&http, &spec.market, &cfg.history_interval, cfg.history_candles)
            .await
        {
            Ok(candles) => {
                if let Some(state) = store.get_mut(&key) {
                    state.seed_history(candles);
                }
            }
            Err(e) => {
                warn!(symbol = %spec.symbol, error = %e, "history hydration failed");
                if let Some(state) = store.get_mut(&key) {
                    state.error = Some(format!("history: {e}"));
                }
            }
        }
    }

    // ── 3. Live trading bootstrap (optional) ─────────────────────────────
    let mut live_status: Option<String> = None;
    let live = if cfg.live.enabled {
        if !cfg.live.has_credentials() {
            warn!("live trading enabled but credentials are missing — simulation only");
            live_status = Some("live disabled: missing API credentials".to_string());
            None
        } else {
            let client = FuturesClient::new(
                cfg.live.api_key.clone(),
                cfg.live.api_secret.clone(),
                cfg.live.testnet,
            );
            let trader = Arc::new(LiveTrader::new(
                client,
                cfg.live.clone(),
                cfg.sim.clone(),
                cfg.symbols.iter().map(|s| s.market.clone()).collect(),
                chrono::Utc::now().timestamp_millis(),
            ));
            match trader.bootstrap().await {
                Ok(()) => {
                    info!("live trading bootstrapped");
                    Some(trader)
                }
                Err(e) => {
                    error!(error = %e, "live bootstrap failed — simulation only");
                    live_status = Some(format!("live disabled: bootstrap failed: {e}"));
                    None
                }
            }
        }
    } else {
        None
    };

    // ── 4. Shared state ──────────────────────────────────────────────────
    let feed_health = Arc::new(FeedHealth::new());
    let state = Arc::new(AppState::new(cfg.clone(), feed_health.clone(), live.clone()));
    if let Some(status) = live_status {
        state.set_live_status(status);
    }

    // ── 5. Feed supervisor ───────────────────────────────────────────────
    let (event_tx, event_rx) = tokio::sync::mpsc::channel(4096);
    {
        let cfg = cfg.clone();
        let health = feed_health.clone();
        tokio::spawn(async move {
            run_feed(cfg, event_tx, health).await;
        });
    }

    // ── 6. Renderer API ──────────────────────────────────────────────────
    {
        let api_state = state.clone();
        let bind_addr = cfg.bind_addr.clone();
        tokio::spawn(async move {
            let app = api::rest::router(api_state);
            match tokio::net::TcpListener::bind(&bind_addr).await {
                Ok(listener) => {
                    info!(addr = %bind_addr, "renderer API listening");
                    if let Err(e) = axum::serve(listener, app).await {
                        error!(error = %e, "renderer API failed");
                    }
                }
                Err(e) => error!(addr = %bind_addr, error = %e, "renderer API bind failed"),
            }
        });
    }

    // ── 7. Periodic live reconciliation ──────────────────────────────────
    if let Some(trader) = live.clone() {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(3));
            loop {
                interval.tick().await;
                trader.sync_runtime().await;
            }
        });
    }

    // ── 8. Engine loop until shutdown ────────────────────────────────────
    info!("all subsystems running — press Ctrl+C to stop");
    tokio::select! {
        _ = engine::run_engine(state.clone(), store, event_rx) => {
            warn!("engine loop ended");
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("shutdown signal received — stopping gracefully");
        }
    }

    // ── 9. Graceful shutdown ─────────────────────────────────────────────
    feed_health.request_shutdown();
    tokio::time::sleep(std::time::Duration::from_millis(250)).await;
    info!("Borealis shut down complete");
    Ok(())
}
