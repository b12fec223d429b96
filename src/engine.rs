// =============================================================================
// Engine task — the per-tick decision/execution cycle
// =============================================================================
//
// One cooperative task drives this every cycle: pull a tick, analyze it,
// fuse a decision, dispatch it against the gateway, log the decision for
// later evaluation, and credit any decisions that matured this cycle back
// to the rules that made them. The GUI/read task never touches any of this
// — it only reads `AppState::build_snapshot`.
// =============================================================================

use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::Utc;
use tracing::{instrument, warn};

use crate::app_state::AppState;
use crate::events::{Event, EventKind, Severity};
use crate::gateway::{AccountInfo, GatewayError, GatewayPosition, OrderSide as GwOrderSide, PendingOrder, OrderType};
use crate::rule_engine::{DecisionKind, EngineMode, FusedDecision};
use crate::spacing_manager::ExistingOrder;
use crate::types::{AccountSnapshot, MarketSnapshot, OpenPositionSummary, PortfolioSnapshot, Side, TradingMode};

/// Cadence while everything is healthy.
pub const BASE_CYCLE_MS: u64 = 5_000;
/// Cadence after a handled cycle failure, until a cycle completes cleanly again.
pub const BACKOFF_CYCLE_MS: u64 = 10_000;

/// Consecutive `NotConnected` cycles that pause trading automatically.
const STOP_AFTER_CONSECUTIVE_DISCONNECTS: u64 = 3;

/// A cycle counts as an overrun once its measured duration exceeds this
/// multiple of the base interval.
const OVERRUN_FACTOR: u64 = 2;

/// Consecutive overruns before the interval is widened to the observed
/// duration and a `SlowCycle` event is emitted.
const STOP_AFTER_CONSECUTIVE_OVERRUNS: u64 = 3;

/// Runs one full cycle. `Err` means the caller should widen the next cycle's
/// interval; `Ok` means it should reset to `BASE_CYCLE_MS`.
#[instrument(skip(state), name = "engine::run_cycle")]
pub async fn run_cycle(state: &Arc<AppState>) -> anyhow::Result<()> {
    if state.trading_mode() == TradingMode::Killed {
        return Ok(());
    }

    let symbol = state.runtime_config.read().trading.symbol.clone();

    let Some(tick) = state.gateway.tick(&symbol).await else {
        note_disconnect(state);
        anyhow::bail!("gateway disconnected");
    };
    state.consecutive_not_connected.store(0, Ordering::Relaxed);

    let snapshot = state.analyzer.analyze(&symbol, tick);
    if snapshot.is_stale(Utc::now()) {
        state.push_event(Event::new(EventKind::StaleSnapshot, Severity::Warning, "market snapshot stale, skipping cycle"));
        anyhow::bail!("stale market snapshot");
    }

    let (positions, orders, account) = match fetch_portfolio(state, &symbol).await {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "failed to fetch portfolio from gateway");
            anyhow::bail!("portfolio fetch failed: {e}");
        }
    };
    state.position_manager.sync_from_gateway(&symbol, &positions);

    let portfolio = build_portfolio_snapshot(&positions, &account);

    if state.trading_mode() == TradingMode::Live {
        let cutoff = Utc::now();
        let decision = state.rule_engine.run_tick(&snapshot, &portfolio);
        log_decision(state, &decision, account.equity);
        dispatch(state, &symbol, &decision, &snapshot, &portfolio.account, &orders, cutoff).await;
    }

    evaluate_matured_decisions(state).await;

    state.increment_version();
    Ok(())
}

/// Call after every completed cycle with its measured wall-clock duration.
/// Returns `true` once the interval has been widened to the observed
/// duration, in which case the caller must not reset it back to
/// `BASE_CYCLE_MS` on the same pass.
pub fn observe_cycle_duration(state: &Arc<AppState>, duration_ms: u64) -> bool {
    if duration_ms <= BASE_CYCLE_MS * OVERRUN_FACTOR {
        state.consecutive_overruns.store(0, Ordering::Relaxed);
        return false;
    }

    let count = state.consecutive_overruns.fetch_add(1, Ordering::Relaxed) + 1;
    if count < STOP_AFTER_CONSECUTIVE_OVERRUNS {
        return false;
    }

    state.cycle_interval_ms.store(duration_ms, Ordering::Relaxed);
    warn!(duration_ms, count, "cycle consistently overrunning, widening interval to observed duration");
    state.push_event(Event::new(
        EventKind::SlowCycle,
        Severity::Warning,
        format!("cycle duration {duration_ms}ms exceeded {}x the {BASE_CYCLE_MS}ms interval for {count} consecutive cycles", OVERRUN_FACTOR),
    ));
    true
}

fn note_disconnect(state: &Arc<AppState>) {
    let count = state.consecutive_not_connected.fetch_add(1, Ordering::Relaxed) + 1;
    warn!(count, "gateway disconnected this cycle");
    if count >= STOP_AFTER_CONSECUTIVE_DISCONNECTS && state.trading_mode() == TradingMode::Live {
        state.set_trading_mode(TradingMode::Paused);
        state.push_event(Event::new(
            EventKind::StaleSnapshot,
            Severity::Critical,
            "gateway disconnected for 3 consecutive cycles, trading paused",
        ));
    }
}

async fn fetch_portfolio(
    state: &Arc<AppState>,
    symbol: &str,
) -> Result<(Vec<GatewayPosition>, Vec<PendingOrder>, AccountInfo), GatewayError> {
    let positions = state.gateway.positions(symbol).await?;
    let orders = state.gateway.orders(symbol).await?;
    let account = state.gateway.account_info().await?;
    Ok((positions, orders, account))
}

fn build_portfolio_snapshot(positions: &[GatewayPosition], account: &AccountInfo) -> PortfolioSnapshot {
    PortfolioSnapshot {
        positions: positions
            .iter()
            .map(|p| OpenPositionSummary {
                side: match p.side {
                    GwOrderSide::Buy => Side::Buy,
                    GwOrderSide::Sell => Side::Sell,
                },
                volume: p.volume,
                unrealized_total: p.profit + p.swap + p.commission,
            })
            .collect(),
        account: AccountSnapshot {
            balance: account.balance,
            equity: account.equity,
            margin: account.margin,
            free_margin: account.free_margin,
        },
        timestamp: Utc::now(),
    }
}

fn log_decision(state: &Arc<AppState>, decision: &FusedDecision, equity: f64) {
    let id = state.performance_tracker.log_decision(decision);
    state.record_decision_equity(id, equity);
    state.push_event(Event::new(
        EventKind::DecisionMade,
        Severity::Info,
        format!("{} confidence={:.2} rules={:?}", decision.kind, decision.confidence, decision.contributing_rules),
    ));
}

fn existing_orders_from(orders: &[PendingOrder]) -> Vec<ExistingOrder> {
    orders
        .iter()
        .filter_map(|o| {
            let is_buy = match o.order_type {
                OrderType::BuyLimit | OrderType::BuyStop => true,
                OrderType::SellLimit | OrderType::SellStop => false,
                OrderType::MarketBuy | OrderType::MarketSell => return None,
            };
            Some(ExistingOrder { price: o.price, is_buy })
        })
        .collect()
}

async fn dispatch(
    state: &Arc<AppState>,
    symbol: &str,
    decision: &FusedDecision,
    snapshot: &MarketSnapshot,
    account: &AccountSnapshot,
    orders: &[PendingOrder],
    close_cutoff: chrono::DateTime<Utc>,
) {
    match decision.kind {
        DecisionKind::Buy | DecisionKind::Sell => {
            let side = if decision.kind == DecisionKind::Buy { GwOrderSide::Buy } else { GwOrderSide::Sell };
            let existing_orders = existing_orders_from(orders);
            let result = state
                .order_manager
                .place_smart_order(
                    side,
                    symbol,
                    decision.volume,
                    decision.target_price,
                    &decision.reasoning,
                    decision.confidence,
                    snapshot,
                    account,
                    &existing_orders,
                    Utc::now(),
                )
                .await;

            if result.success {
                state.push_event(Event::new(
                    EventKind::OrderSubmitted,
                    Severity::Info,
                    format!("ticket={:?} price={:?}", result.ticket, result.executed_price),
                ));
            } else {
                state.push_event(Event::new(EventKind::OrderRejected, Severity::Warning, format!("{:?}", result.error_kind)));
            }
        }
        DecisionKind::CloseProfitable => {
            if state.position_manager.close_profitable(decision.confidence, &decision.reasoning) {
                close_matching_gateway_positions(state, close_cutoff).await;
                state.push_event(Event::new(EventKind::RecoveryExecuted, Severity::Info, decision.reasoning.clone()));
            }
        }
        DecisionKind::CloseLosing => {
            // No rule in the catalogue ever emits this decision kind; there
            // is no defined business behaviour to dispatch it to.
        }
        DecisionKind::EmergencyStop => {
            state.rule_engine.trigger_emergency_stop();
            state.position_manager.emergency_close_all();
            close_matching_gateway_positions(state, close_cutoff).await;
            state.push_event(Event::new(EventKind::PositionClosed, Severity::Critical, "emergency_close_all triggered"));
        }
        DecisionKind::Wait => {}
    }
}

/// Closes the broker-side position for every locally-closed position since
/// `cutoff`. Shared with the API's emergency-stop control endpoint so a
/// manually triggered stop leaves the gateway in sync with local state, the
/// same as an engine-triggered one.
pub async fn close_matching_gateway_positions(state: &Arc<AppState>, cutoff: chrono::DateTime<Utc>) {
    let magic = state.runtime_config.read().magic;
    for pos in state.position_manager.get_closed_since(cutoff) {
        let Ok(ticket) = pos.id.parse::<u64>() else { continue };
        match state.gateway.close_position(ticket, pos.volume, magic).await {
            Ok(_) => {
                state.push_event(Event::new(
                    EventKind::PositionClosed,
                    Severity::Info,
                    format!("ticket={ticket} realized_pnl={:.2}", pos.realized_pnl),
                ));
            }
            Err(e) => warn!(ticket, error = %e, "gateway close_position failed after local close decision"),
        }
    }
}

async fn evaluate_matured_decisions(state: &Arc<AppState>) {
    let current_equity = match state.gateway.account_info().await {
        Ok(acc) => acc.equity,
        Err(_) => return,
    };

    let credits = state
        .performance_tracker
        .evaluate_matured(Utc::now(), |decision_id| state.realized_profit_since(decision_id, current_equity));

    if credits.is_empty() {
        return;
    }
    for (rule, success, profit_delta) in &credits {
        state.rule_engine.record_outcome(*rule, *success, *profit_delta);
    }
    if state.rule_engine.mode() == EngineMode::Adaptive {
        state.push_event(Event::new(EventKind::WeightAdjusted, Severity::Info, format!("evaluated {} decisions", credits.len())));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demo_gateway::DemoGateway;
    use crate::market_analyzer::DemoMarketAnalyzer;
    use crate::runtime_config::RuntimeConfig;

    fn test_state() -> (Arc<AppState>, Arc<DemoGateway>) {
        let gateway = Arc::new(DemoGateway::new("XAUUSD", 2000.0, 10_000.0, 7));
        let analyzer: Arc<dyn crate::market_analyzer::MarketAnalyzer> = Arc::new(DemoMarketAnalyzer::new());
        let state = Arc::new(AppState::new(RuntimeConfig::default(), gateway.clone(), analyzer));
        (state, gateway)
    }

    #[tokio::test]
    async fn paused_mode_still_ticks_without_placing_orders() {
        let (state, _gateway) = test_state();
        assert_eq!(state.trading_mode(), TradingMode::Paused);
        run_cycle(&state).await.unwrap();
        assert!(state.position_manager.get_open_positions().is_empty());
    }

    #[tokio::test]
    async fn disconnect_after_three_cycles_pauses_live_trading() {
        let (state, gateway) = test_state();
        state.set_trading_mode(TradingMode::Live);
        gateway.set_connected(false);
        for _ in 0..3 {
            let _ = run_cycle(&state).await;
        }
        assert_eq!(state.trading_mode(), TradingMode::Paused);
    }

    #[test]
    fn overruns_below_the_factor_never_widen_the_interval() {
        let (state, _gateway) = test_state();
        for _ in 0..10 {
            assert!(!observe_cycle_duration(&state, BASE_CYCLE_MS));
        }
        assert_eq!(state.cycle_interval_ms.load(Ordering::Relaxed), 5_000);
    }

    #[test]
    fn three_consecutive_overruns_widen_the_interval_and_reset_on_a_healthy_cycle() {
        let (state, _gateway) = test_state();
        let slow = BASE_CYCLE_MS * 3;
        assert!(!observe_cycle_duration(&state, slow));
        assert!(!observe_cycle_duration(&state, slow));
        assert!(observe_cycle_duration(&state, slow));
        assert_eq!(state.cycle_interval_ms.load(Ordering::Relaxed), slow);

        // A cycle back within the healthy window clears the streak.
        assert!(!observe_cycle_duration(&state, BASE_CYCLE_MS));
        assert_eq!(state.consecutive_overruns.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn killed_mode_skips_the_cycle_entirely() {
        let (state, _gateway) = test_state();
        state.set_trading_mode(TradingMode::Killed);
        let before = state.current_state_version();
        run_cycle(&state).await.unwrap();
        assert_eq!(state.current_state_version(), before);
    }
}
