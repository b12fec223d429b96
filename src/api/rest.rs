// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Public endpoints (health) require no
// authentication. All other endpoints require a valid Bearer token checked via
// the `AuthBearer` extractor.
//
// CORS is configured permissively for development; tighten `allowed_origins`
// in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::AuthBearer;
use crate::app_state::AppState;
use crate::types::TradingMode;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Authenticated ───────────────────────────────────────────
        .route("/api/v1/state", get(full_state))
        .route("/api/v1/positions", get(positions))
        .route("/api/v1/positions/closed", get(closed_positions))
        .route("/api/v1/rules", get(rule_weights))
        .route("/api/v1/metrics", get(metrics))
        .route("/api/v1/events", get(events))
        .route("/api/v1/config", get(get_config))
        .route("/api/v1/config", post(set_config))
        .route("/api/v1/control/pause", post(control_pause))
        .route("/api/v1/control/resume", post(control_resume))
        .route("/api/v1/control/kill", post(control_kill))
        .route("/api/v1/control/emergency-stop", post(control_emergency_stop))
        .route("/api/v1/control/resume-from-emergency", post(control_resume_from_emergency))
        .route("/api/v1/heartbeat", post(heartbeat))
        // ── WebSocket (handled separately in ws module but mounted here) ─
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        // ── Middleware & State ───────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health (public)
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    state_version: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let resp = HealthResponse {
        status: "ok",
        state_version: state.current_state_version(),
        server_time: chrono::Utc::now().timestamp_millis(),
    };
    Json(resp)
}

// =============================================================================
// Full state snapshot (authenticated)
// =============================================================================

async fn full_state(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.build_snapshot())
}

// =============================================================================
// Positions (authenticated)
// =============================================================================

async fn positions(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.position_manager.get_open_positions())
}

async fn closed_positions(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.position_manager.get_closed_positions(500))
}

// =============================================================================
// Rule weights & performance metrics (authenticated)
// =============================================================================

async fn rule_weights(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let weights = state.rule_engine.weights();
    let body: std::collections::HashMap<&'static str, f64> =
        weights.into_iter().map(|(rule, weight)| (rule.as_str(), weight)).collect();
    Json(body)
}

async fn metrics(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let m = state.performance_tracker.real_time_metrics(chrono::Utc::now());
    Json(serde_json::json!({
        "accuracy_rate_24h": m.accuracy_rate_24h,
        "confidence_accuracy_correlation": m.confidence_accuracy_correlation,
        "average_slippage": m.average_slippage,
        "overall_system_score": m.overall_system_score,
        "trend": format!("{:?}", m.trend),
        "pending_evaluation_count": state.performance_tracker.pending_count(),
        "per_rule_accuracy": m.per_rule_accuracy.iter().map(|(r, v)| (r.as_str(), *v)).collect::<std::collections::HashMap<_, f64>>(),
        "per_rule_avg_profit": m.per_rule_avg_profit.iter().map(|(r, v)| (r.as_str(), *v)).collect::<std::collections::HashMap<_, f64>>(),
    }))
}

async fn events(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.recent_events(200))
}

// =============================================================================
// Runtime config (authenticated)
// =============================================================================

async fn get_config(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.runtime_config.read().clone())
}

#[derive(Deserialize)]
struct ConfigUpdate {
    #[serde(default)]
    base_lot_size: Option<f64>,
    #[serde(default)]
    max_positions: Option<u32>,
    #[serde(default)]
    max_risk_percentage: Option<f64>,
}

async fn set_config(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(update): Json<ConfigUpdate>,
) -> impl IntoResponse {
    let mut changes = Vec::new();
    {
        let mut config = state.runtime_config.write();
        if let Some(v) = update.base_lot_size {
            changes.push(format!("base_lot_size: {} -> {v}", config.trading.base_lot_size));
            config.trading.base_lot_size = v;
        }
        if let Some(v) = update.max_positions {
            changes.push(format!("max_positions: {} -> {v}", config.trading.max_positions));
            config.trading.max_positions = v;
        }
        if let Some(v) = update.max_risk_percentage {
            changes.push(format!("max_risk_percentage: {} -> {v}", config.risk_management.max_risk_percentage));
            config.risk_management.max_risk_percentage = v;
        }
    }

    if !changes.is_empty() {
        info!(changes = ?changes, "runtime config updated via API");
        let config_clone = state.runtime_config.read().clone();
        if let Err(e) = config_clone.save("runtime_config.json") {
            warn!(error = %e, "failed to save runtime config to disk");
        }
        state.increment_version();
    }

    Json(state.runtime_config.read().clone())
}

// =============================================================================
// Control endpoints (authenticated)
// =============================================================================

#[derive(Serialize)]
struct ControlResponse {
    trading_mode: String,
    message: String,
}

async fn control_pause(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.set_trading_mode(TradingMode::Paused);
    info!("trading paused via API");
    Json(ControlResponse { trading_mode: "Paused".to_string(), message: "Trading paused".to_string() })
}

async fn control_resume(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.set_trading_mode(TradingMode::Live);
    info!("trading resumed via API");
    Json(ControlResponse { trading_mode: "Live".to_string(), message: "Trading resumed".to_string() })
}

async fn control_kill(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.set_trading_mode(TradingMode::Killed);
    warn!("trading killed via API");
    Json(ControlResponse { trading_mode: "Killed".to_string(), message: "Trading killed, manual restart required".to_string() })
}

async fn control_emergency_stop(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let cutoff = chrono::Utc::now();
    let decision = state.rule_engine.trigger_emergency_stop();
    state.position_manager.emergency_close_all();
    crate::engine::close_matching_gateway_positions(&state, cutoff).await;
    state.increment_version();
    warn!("emergency stop triggered via API");
    Json(decision.reasoning)
}

async fn control_resume_from_emergency(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    if !state.rule_engine.is_emergency() {
        return Err((StatusCode::BAD_REQUEST, Json(serde_json::json!({ "error": "not in emergency stop" }))));
    }
    state.rule_engine.resume();
    state.increment_version();
    info!("emergency stop cleared via API");
    Ok(Json(serde_json::json!({ "status": "resumed" })))
}

// =============================================================================
// Heartbeat (authenticated)
// =============================================================================

async fn heartbeat(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    *state.last_ws_user_event.write() = std::time::Instant::now();
    state.increment_version();

    Json(serde_json::json!({
        "status": "ok",
        "server_time": chrono::Utc::now().timestamp_millis(),
    }))
}
