// =============================================================================
// Aurum Engine — Main Entry Point
// =============================================================================
//
// The engine starts in Paused mode for safety: orders are never placed until
// a human explicitly switches trading on via the API. Three cooperative tasks
// run for the life of the process:
//
//   1. The engine task — one `engine::run_cycle` per tick, widening its
//      interval on a handled failure or on consistently slow cycles, and
//      resetting once a cycle completes cleanly at a healthy pace.
//   2. The GUI/read task — polls `AppState::build_snapshot` at its own fixed
//      cadence; never touches engine internals directly.
//   3. The API server — REST + WebSocket, reading and (for control endpoints)
//      writing the same `AppState`.
// =============================================================================

mod api;
mod app_state;
mod demo_gateway;
mod engine;
mod events;
mod gateway;
mod lot_calculator;
mod market_analyzer;
mod order_manager;
mod performance_tracker;
mod position_manager;
mod rule_engine;
mod runtime_config;
mod spacing_manager;
mod types;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::demo_gateway::DemoGateway;
use crate::engine::{BACKOFF_CYCLE_MS, BASE_CYCLE_MS};
use crate::gateway::BrokerGateway;
use crate::market_analyzer::{DemoMarketAnalyzer, MarketAnalyzer};
use crate::runtime_config::RuntimeConfig;

const CONFIG_PATH: &str = "runtime_config.json";

/// Cadence of the read-only GUI/snapshot task — independent of the engine's
/// own cycle interval so a slow or backed-off engine cycle never starves it.
const GUI_POLL_MS: u64 = 3_000;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║              Aurum Engine — Starting Up                   ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load runtime config, using defaults");
        RuntimeConfig::default()
    });

    // SAFETY: always start Paused, regardless of what was persisted.
    config.trading_mode = types::TradingMode::Paused;

    if let Ok(symbol) = std::env::var("AURUM_SYMBOL") {
        if !symbol.trim().is_empty() {
            config.trading.symbol = symbol.trim().to_uppercase();
        }
    }

    info!(
        symbol = %config.trading.symbol,
        trading_mode = %config.trading_mode,
        engine_mode = %config.engine_mode,
        "engine starting in SAFE mode (Paused)"
    );

    // ── Build the gateway and analyzer capabilities ───────────────────────
    //
    // DemoGateway is in-process paper trading; swapping in a live broker
    // gateway later only requires a different `Arc<dyn BrokerGateway>` here
    // — nothing downstream depends on the concrete type.
    let starting_price = std::env::var("AURUM_STARTING_PRICE")
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(2000.0);
    let starting_balance = std::env::var("AURUM_STARTING_BALANCE")
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(10_000.0);

    let gateway: Arc<dyn BrokerGateway> = Arc::new(DemoGateway::new(
        &config.trading.symbol,
        starting_price,
        starting_balance,
        config.magic,
    ));
    let analyzer: Arc<dyn MarketAnalyzer> = Arc::new(DemoMarketAnalyzer::new());

    let state = Arc::new(AppState::new(config, gateway, analyzer));

    // ── Engine task ────────────────────────────────────────────────────────
    let engine_state = state.clone();
    let engine_handle = tokio::spawn(async move {
        loop {
            let wait_ms = engine_state.cycle_interval_ms.load(Ordering::Relaxed);
            tokio::time::sleep(Duration::from_millis(wait_ms)).await;

            let started = std::time::Instant::now();
            let result = engine::run_cycle(&engine_state).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(()) => {
                    // A cycle's real duration exceeding its interval never
                    // causes overlap — this loop is strictly sequential — but
                    // consistent overruns widen the interval to match reality
                    // instead of letting the loop fall further behind every
                    // tick.
                    if !engine::observe_cycle_duration(&engine_state, elapsed_ms) {
                        engine_state.cycle_interval_ms.store(BASE_CYCLE_MS, Ordering::Relaxed);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "engine cycle failed, backing off");
                    engine_state.cycle_interval_ms.store(BACKOFF_CYCLE_MS, Ordering::Relaxed);
                }
            }
        }
    });

    // ── GUI / read task ────────────────────────────────────────────────────
    //
    // Polls the published snapshot at its own fixed cadence. It never reaches
    // into rule_engine, order_manager, or position_manager directly — the
    // snapshot is the only contract between this task and the engine task.
    let gui_state = state.clone();
    let gui_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(GUI_POLL_MS));
        let mut last_seen_version = 0u64;
        loop {
            interval.tick().await;
            let snapshot = gui_state.build_snapshot();
            if snapshot.state_version != last_seen_version {
                info!(
                    version = snapshot.state_version,
                    mode = %snapshot.trading_mode,
                    positions = snapshot.open_positions.len(),
                    score = snapshot.metrics.overall_system_score,
                    "state snapshot updated"
                );
                last_seen_version = snapshot.state_version;
            }
        }
    });

    // ── API server ─────────────────────────────────────────────────────────
    let api_state = state.clone();
    let bind_addr = std::env::var("AURUM_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".into());
    let api_handle = tokio::spawn(async move {
        let app = api::rest::router(api_state);
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .expect("failed to bind API server");
        info!(addr = %bind_addr, "API server listening");
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server failed");
        }
    });

    info!("all subsystems running — press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");

    engine_handle.abort();
    gui_handle.abort();
    api_handle.abort();

    if let Err(e) = state.runtime_config.read().save(CONFIG_PATH) {
        error!(error = %e, "failed to save runtime config on shutdown");
    }

    info!("Aurum Engine shut down complete.");
    Ok(())
}
