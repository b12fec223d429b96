// =============================================================================
// Application State — owns every live component, publishes read-only snapshots
// =============================================================================
//
// `AppState` is constructed once at startup and shared behind `Arc` with the
// engine task, the GUI/read task, and the API server. It owns the concrete
// gateway and analyzer; every component only ever sees a narrow reference
// (`&dyn BrokerGateway`) — no constructor cycles between components.
//
// `state_version` is bumped at the end of every engine cycle and on every
// WebSocket-visible event; readers (the GUI task, the WebSocket push loop)
// compare it to their last-seen value instead of polling component internals
// directly.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::events::{Event, EventKind, Severity};
use crate::gateway::BrokerGateway;
use crate::lot_calculator::LotCalculator;
use crate::market_analyzer::MarketAnalyzer;
use crate::order_manager::OrderManager;
use crate::performance_tracker::PerformanceTracker;
use crate::position_manager::PositionManager;
use crate::rule_engine::{RuleEngine, RuleParams};
use crate::runtime_config::RuntimeConfig;
use crate::spacing_manager::SpacingManager;
use crate::types::TradingMode;

/// Bounded ring buffer of recently emitted events, surfaced in the snapshot.
const MAX_EVENT_HISTORY: usize = 500;

pub struct AppState {
    pub runtime_config: RwLock<RuntimeConfig>,
    pub gateway: Arc<dyn BrokerGateway>,
    pub analyzer: Arc<dyn MarketAnalyzer>,

    pub rule_engine: RuleEngine,
    pub order_manager: OrderManager,
    pub position_manager: PositionManager,
    pub performance_tracker: PerformanceTracker,

    /// Equity recorded at the moment each decision was logged, keyed by
    /// `PerformanceTracker` decision id — the stand-in for "realised profit
    /// since this decision" used by `evaluate_matured`.
    decision_equity: RwLock<HashMap<u64, f64>>,

    events: RwLock<VecDeque<Event>>,

    /// Consecutive cycles observed with the gateway disconnected. Three in a
    /// row stops live trading automatically.
    pub consecutive_not_connected: AtomicU64,

    /// Current engine cycle interval in milliseconds; widens from 5 s to 10 s
    /// after a handled failure and resets once a cycle completes cleanly.
    pub cycle_interval_ms: AtomicU64,

    /// Consecutive cycles whose measured wall-clock duration exceeded twice
    /// the base interval. Three in a row widens `cycle_interval_ms` to the
    /// observed duration and emits `SlowCycle`.
    pub consecutive_overruns: AtomicU64,

    state_version: AtomicU64,
    pub ws_sequence_number: AtomicU64,
    pub ws_user_connected: RwLock<bool>,
    pub last_ws_user_event: RwLock<Instant>,

    pub start_time: Instant,
}

impl AppState {
    pub fn new(config: RuntimeConfig, gateway: Arc<dyn BrokerGateway>, analyzer: Arc<dyn MarketAnalyzer>) -> Self {
        let rule_engine = RuleEngine::new(
            config.engine_mode,
            RuleParams::default(),
            config.adaptive.min_signals as usize,
            config.adaptive.confidence_adjustment_rate,
        );

        let spacing = SpacingManager::new(
            config.trading.base_spacing_points,
            config.trading.max_spacing_points,
            config.trading.collision_buffer_points,
        );
        let lots = LotCalculator::new(
            config.trading.base_lot_size,
            config.trading.min_lot_size,
            config.trading.max_lot_size,
            config.risk_management.max_risk_percentage,
        );
        let order_manager = OrderManager::new(
            gateway.clone(),
            spacing,
            lots,
            config.trading.min_lot_size,
            config.trading.max_lot_size,
            config.risk_management.max_daily_orders,
            config.magic,
        );

        Self {
            runtime_config: RwLock::new(config),
            gateway,
            analyzer,
            rule_engine,
            order_manager,
            position_manager: PositionManager::new(),
            performance_tracker: PerformanceTracker::new(),
            decision_equity: RwLock::new(HashMap::new()),
            events: RwLock::new(VecDeque::new()),
            consecutive_not_connected: AtomicU64::new(0),
            cycle_interval_ms: AtomicU64::new(5_000),
            consecutive_overruns: AtomicU64::new(0),
            state_version: AtomicU64::new(0),
            ws_sequence_number: AtomicU64::new(0),
            ws_user_connected: RwLock::new(false),
            last_ws_user_event: RwLock::new(Instant::now()),
            start_time: Instant::now(),
        }
    }

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::Relaxed)
    }

    pub fn trading_mode(&self) -> TradingMode {
        self.runtime_config.read().trading_mode
    }

    pub fn set_trading_mode(&self, mode: TradingMode) {
        self.runtime_config.write().trading_mode = mode;
        self.push_event(Event::new(EventKind::WeightAdjusted, Severity::Info, format!("trading_mode={mode}")));
        self.increment_version();
    }

    pub fn record_decision_equity(&self, decision_id: u64, equity: f64) {
        let mut map = self.decision_equity.write();
        map.insert(decision_id, equity);
        // Bounded: decisions are evaluated within minutes, so a size cap
        // protects against a tracker that never matures a record.
        if map.len() > 5_000 {
            if let Some(&oldest) = map.keys().min() {
                map.remove(&oldest);
            }
        }
    }

    pub fn realized_profit_since(&self, decision_id: u64, current_equity: f64) -> Option<f64> {
        self.decision_equity.write().remove(&decision_id).map(|equity_then| current_equity - equity_then)
    }

    pub fn push_event(&self, event: Event) {
        let mut events = self.events.write();
        events.push_back(event);
        while events.len() > MAX_EVENT_HISTORY {
            events.pop_front();
        }
    }

    pub fn recent_events(&self, count: usize) -> Vec<Event> {
        self.events.read().iter().rev().take(count).cloned().collect()
    }

    // -------------------------------------------------------------------------
    // Snapshot
    // -------------------------------------------------------------------------

    pub fn build_snapshot(&self) -> StateSnapshot {
        let config = self.runtime_config.read().clone();
        let metrics = self.performance_tracker.real_time_metrics(Utc::now());
        let weights = self.rule_engine.weights();

        StateSnapshot {
            state_version: self.current_state_version(),
            timestamp: Utc::now(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            trading_mode: config.trading_mode,
            emergency_stopped: self.rule_engine.is_emergency(),
            symbol: config.trading.symbol.clone(),
            gateway_connected: self.gateway.is_connected(),
            cycle_interval_ms: self.cycle_interval_ms.load(Ordering::Relaxed),
            open_positions: self.position_manager.get_open_positions().into_iter().map(PositionSummary::from).collect(),
            rule_weights: weights.into_iter().map(|(name, weight)| RuleWeightSummary { rule: name.to_string(), weight }).collect(),
            daily_order_count: self.order_manager.daily_count(),
            metrics: MetricsSummary {
                accuracy_rate_24h: metrics.accuracy_rate_24h,
                overall_system_score: metrics.overall_system_score,
                average_slippage: metrics.average_slippage,
                trend: format!("{:?}", metrics.trend),
                pending_evaluation_count: self.performance_tracker.pending_count(),
            },
            recommendations: self.performance_tracker.adaptive_learning_recommendations(Utc::now()),
            recent_events: self.recent_events(50).into_iter().map(EventSummary::from).collect(),
            ws_user_connected: *self.ws_user_connected.read(),
        }
    }
}

// =============================================================================
// Serializable snapshot types
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct PositionSummary {
    pub id: String,
    pub side: String,
    pub volume: f64,
    pub entry_price: f64,
    pub current_price: f64,
    pub total_profit: f64,
}

impl From<crate::position_manager::Position> for PositionSummary {
    fn from(p: crate::position_manager::Position) -> Self {
        Self {
            id: p.id,
            side: p.side,
            volume: p.volume,
            entry_price: p.entry_price,
            current_price: p.current_price,
            total_profit: p.total_profit(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RuleWeightSummary {
    pub rule: String,
    pub weight: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub accuracy_rate_24h: f64,
    pub overall_system_score: f64,
    pub average_slippage: f64,
    pub trend: String,
    pub pending_evaluation_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventSummary {
    pub timestamp: chrono::DateTime<Utc>,
    pub kind: String,
    pub severity: String,
    pub payload: String,
}

impl From<Event> for EventSummary {
    fn from(e: Event) -> Self {
        Self {
            timestamp: e.timestamp,
            kind: e.kind.to_string(),
            severity: format!("{:?}", e.severity),
            payload: e.payload,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub state_version: u64,
    pub timestamp: chrono::DateTime<Utc>,
    pub uptime_secs: u64,
    pub trading_mode: TradingMode,
    pub emergency_stopped: bool,
    pub symbol: String,
    pub gateway_connected: bool,
    pub cycle_interval_ms: u64,
    pub open_positions: Vec<PositionSummary>,
    pub rule_weights: Vec<RuleWeightSummary>,
    pub daily_order_count: u64,
    pub metrics: MetricsSummary,
    pub recommendations: Vec<String>,
    pub recent_events: Vec<EventSummary>,
    pub ws_user_connected: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demo_gateway::DemoGateway;
    use crate::market_analyzer::DemoMarketAnalyzer;

    fn test_state() -> AppState {
        let gateway: Arc<dyn BrokerGateway> = Arc::new(DemoGateway::new("XAUUSD", 2000.0, 10_000.0, 1));
        let analyzer: Arc<dyn MarketAnalyzer> = Arc::new(DemoMarketAnalyzer::new());
        AppState::new(RuntimeConfig::default(), gateway, analyzer)
    }

    #[test]
    fn new_state_starts_paused_with_no_positions() {
        let state = test_state();
        let snap = state.build_snapshot();
        assert_eq!(snap.trading_mode, TradingMode::Paused);
        assert!(snap.open_positions.is_empty());
        assert_eq!(snap.rule_weights.len(), 5);
    }

    #[test]
    fn set_trading_mode_bumps_version_and_persists() {
        let state = test_state();
        let before = state.current_state_version();
        state.set_trading_mode(TradingMode::Live);
        assert!(state.current_state_version() > before);
        assert_eq!(state.trading_mode(), TradingMode::Live);
    }

    #[test]
    fn decision_equity_round_trips_to_a_realized_profit() {
        let state = test_state();
        state.record_decision_equity(7, 10_000.0);
        let profit = state.realized_profit_since(7, 10_050.0);
        assert_eq!(profit, Some(50.0));
        // consumed — a second lookup finds nothing.
        assert_eq!(state.realized_profit_since(7, 10_050.0), None);
    }

    #[test]
    fn event_history_is_capped() {
        let state = test_state();
        for i in 0..(MAX_EVENT_HISTORY + 10) {
            state.push_event(Event::new(EventKind::SlowCycle, Severity::Warning, i.to_string()));
        }
        assert_eq!(state.recent_events(MAX_EVENT_HISTORY + 10).len(), MAX_EVENT_HISTORY);
    }
}
