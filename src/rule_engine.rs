// =============================================================================
// Rule Engine — evaluates the rule catalogue, fuses proposals, adapts
// =============================================================================
//
// Per tick: run every enabled rule against the current snapshots, group the
// results that cleared their own confidence threshold by decision kind,
// score each group as Σ(confidence × weight), and take the winner if its
// score clears the fusion threshold. Reweighting (Adaptive mode only)
// happens at most once per tick, after dispatch.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::types::{MarketSnapshot, PortfolioSnapshot, Side, TrendDirection};

const POINT_VALUE: f64 = 0.01;

/// Bounded ring buffer size for per-rule outcome history (Design Notes:
/// unbounded history queues -> bounded ring buffers, 100..=2000).
const MAX_HISTORY: usize = 200;

/// Fusion requires the winning group's score to clear this bar.
const FUSION_THRESHOLD: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleName {
    TrendFollowing,
    MeanReversion,
    SupportResistance,
    VolatilityBreakout,
    PortfolioBalance,
}

impl RuleName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TrendFollowing => "trend_following",
            Self::MeanReversion => "mean_reversion",
            Self::SupportResistance => "support_resistance",
            Self::VolatilityBreakout => "volatility_breakout",
            Self::PortfolioBalance => "portfolio_balance",
        }
    }
}

impl std::fmt::Display for RuleName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

pub const ALL_RULES: [RuleName; 5] = [
    RuleName::TrendFollowing,
    RuleName::MeanReversion,
    RuleName::SupportResistance,
    RuleName::VolatilityBreakout,
    RuleName::PortfolioBalance,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionKind {
    Buy,
    Sell,
    CloseProfitable,
    CloseLosing,
    Wait,
    EmergencyStop,
}

impl std::fmt::Display for DecisionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Buy => "Buy",
            Self::Sell => "Sell",
            Self::CloseProfitable => "CloseProfitable",
            Self::CloseLosing => "CloseLosing",
            Self::Wait => "Wait",
            Self::EmergencyStop => "EmergencyStop",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone)]
pub struct RuleResult {
    pub rule: RuleName,
    pub decision: DecisionKind,
    pub confidence: f64,
    pub reasoning: String,
    pub weight: f64,
    pub timestamp: chrono::DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct FusedDecision {
    pub kind: DecisionKind,
    pub confidence: f64,
    pub contributing_rules: Vec<RuleName>,
    pub reasoning: String,
    pub target_price: Option<f64>,
    pub volume: Option<f64>,
    pub timestamp: chrono::DateTime<Utc>,
}

impl FusedDecision {
    fn wait(reason: &str) -> Self {
        Self {
            kind: DecisionKind::Wait,
            confidence: 0.0,
            contributing_rules: vec![],
            reasoning: reason.to_string(),
            target_price: None,
            volume: None,
            timestamp: Utc::now(),
        }
    }
}

/// Per-rule parameters. Values come from `rules.<name>.parameters` in config;
/// defaults here match the source's tuned values.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RuleParams {
    pub trend_strength_theta: f64,
    pub rsi_low: f64,
    pub rsi_high: f64,

    pub bb_low: f64,
    pub bb_high: f64,
    pub momentum_sigma_threshold: f64,
    pub volatility_damp_threshold: f64,

    pub sr_tolerance_points: f64,
    pub sr_min_strength: f64,

    pub breakout_k: f64,
    pub breakout_liquidity_threshold: f64,

    pub max_exposure_share: f64,
    pub pnl_close_threshold: f64,
}

impl Default for RuleParams {
    fn default() -> Self {
        Self {
            trend_strength_theta: 0.3,
            rsi_low: 35.0,
            rsi_high: 65.0,
            bb_low: 0.1,
            bb_high: 0.9,
            momentum_sigma_threshold: 0.4,
            volatility_damp_threshold: 2.0,
            sr_tolerance_points: 15.0,
            sr_min_strength: 0.5,
            breakout_k: 1.5,
            breakout_liquidity_threshold: 1.3,
            max_exposure_share: 0.7,
            pnl_close_threshold: 50.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineMode {
    Conservative,
    Balanced,
    Aggressive,
    Adaptive,
}

impl std::fmt::Display for EngineMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Conservative => write!(f, "Conservative"),
            Self::Balanced => write!(f, "Balanced"),
            Self::Aggressive => write!(f, "Aggressive"),
            Self::Adaptive => write!(f, "Adaptive"),
        }
    }
}

fn fixed_weights(mode: EngineMode) -> HashMap<RuleName, f64> {
    let table: [(RuleName, f64); 5] = match mode {
        EngineMode::Conservative => [
            (RuleName::TrendFollowing, 0.35),
            (RuleName::MeanReversion, 0.15),
            (RuleName::SupportResistance, 0.30),
            (RuleName::VolatilityBreakout, 0.10),
            (RuleName::PortfolioBalance, 0.10),
        ],
        EngineMode::Balanced => [
            (RuleName::TrendFollowing, 0.25),
            (RuleName::MeanReversion, 0.20),
            (RuleName::SupportResistance, 0.20),
            (RuleName::VolatilityBreakout, 0.20),
            (RuleName::PortfolioBalance, 0.15),
        ],
        EngineMode::Aggressive | EngineMode::Adaptive => [
            (RuleName::TrendFollowing, 0.30),
            (RuleName::MeanReversion, 0.15),
            (RuleName::SupportResistance, 0.15),
            (RuleName::VolatilityBreakout, 0.30),
            (RuleName::PortfolioBalance, 0.10),
        ],
    };
    table.into_iter().collect()
}

struct RuleState {
    weight: f64,
    confidence_threshold: f64,
    enabled: bool,
    /// (success, profit_delta) per evaluated outcome, oldest first.
    history: VecDeque<(bool, f64)>,
}

impl RuleState {
    fn new(weight: f64, confidence_threshold: f64) -> Self {
        Self { weight, confidence_threshold, enabled: true, history: VecDeque::new() }
    }

    fn record_outcome(&mut self, success: bool, profit_delta: f64) {
        self.history.push_back((success, profit_delta));
        while self.history.len() > MAX_HISTORY {
            self.history.pop_front();
        }
    }

    fn success_rate(&self) -> f64 {
        if self.history.is_empty() {
            return 0.0;
        }
        let successes = self.history.iter().filter(|(s, _)| *s).count();
        successes as f64 / self.history.len() as f64
    }

    fn avg_profit(&self) -> f64 {
        if self.history.is_empty() {
            return 0.0;
        }
        self.history.iter().map(|(_, p)| p).sum::<f64>() / self.history.len() as f64
    }

    fn last_n_success_rate(&self, n: usize) -> f64 {
        let len = self.history.len();
        if len == 0 {
            return 0.0;
        }
        let take = n.min(len);
        let successes = self.history.iter().rev().take(take).filter(|(s, _)| *s).count();
        successes as f64 / take as f64
    }
}

pub struct RuleEngine {
    rules: RwLock<HashMap<RuleName, RuleState>>,
    mode: RwLock<EngineMode>,
    params: RuleParams,
    min_signals: usize,
    confidence_adjustment_rate: f64,
    emergency: std::sync::atomic::AtomicBool,
}

impl RuleEngine {
    pub fn new(mode: EngineMode, params: RuleParams, min_signals: usize, confidence_adjustment_rate: f64) -> Self {
        let weights = fixed_weights(mode);
        let mut rules = HashMap::new();
        for name in ALL_RULES {
            rules.insert(name, RuleState::new(weights[&name], 0.55));
        }
        Self {
            rules: RwLock::new(rules),
            mode: RwLock::new(mode),
            params,
            min_signals,
            confidence_adjustment_rate,
            emergency: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn mode(&self) -> EngineMode {
        *self.mode.read()
    }

    /// Switching mode is idempotent: re-applying the same mode does not
    /// perturb existing weights beyond reassigning the fixed table (a no-op
    /// when unchanged).
    pub fn set_mode(&self, mode: EngineMode) {
        let mut current = self.mode.write();
        if *current == mode {
            return;
        }
        *current = mode;
        if mode != EngineMode::Adaptive {
            let weights = fixed_weights(mode);
            let mut rules = self.rules.write();
            for name in ALL_RULES {
                rules.get_mut(&name).unwrap().weight = weights[&name];
            }
        }
        info!(mode = %mode, "engine mode switched");
    }

    pub fn is_emergency(&self) -> bool {
        self.emergency.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn trigger_emergency_stop(&self) -> FusedDecision {
        self.emergency.store(true, std::sync::atomic::Ordering::SeqCst);
        warn!("emergency stop triggered");
        FusedDecision {
            kind: DecisionKind::EmergencyStop,
            confidence: 1.0,
            contributing_rules: vec![],
            reasoning: "operator emergency stop".to_string(),
            target_price: None,
            volume: None,
            timestamp: Utc::now(),
        }
    }

    pub fn resume(&self) {
        self.emergency.store(false, std::sync::atomic::Ordering::SeqCst);
        info!("trading resumed after emergency stop");
    }

    pub fn weights(&self) -> HashMap<RuleName, f64> {
        self.rules.read().iter().map(|(k, v)| (*k, v.weight)).collect()
    }

    pub fn record_outcome(&self, rule: RuleName, success: bool, profit_delta: f64) {
        if let Some(state) = self.rules.write().get_mut(&rule) {
            state.record_outcome(success, profit_delta);
        }
    }

    // -------------------------------------------------------------------------
    // Per-tick algorithm
    // -------------------------------------------------------------------------

    #[instrument(skip(self, snapshot, portfolio), name = "rule_engine::run_tick")]
    pub fn run_tick(&self, snapshot: &MarketSnapshot, portfolio: &PortfolioSnapshot) -> FusedDecision {
        let now = Utc::now();

        if self.is_emergency() {
            return FusedDecision::wait("emergency stop active");
        }
        if snapshot.is_stale(now) {
            return FusedDecision::wait("stale market snapshot");
        }

        let results = self.evaluate_rules(snapshot, portfolio);
        if results.is_empty() {
            return FusedDecision::wait("no rule cleared its confidence threshold");
        }

        let fused = self.fuse(results);

        if fused.kind != DecisionKind::Wait && self.mode() == EngineMode::Adaptive {
            self.adaptive_reweight();
        }

        fused
    }

    fn evaluate_rules(&self, snapshot: &MarketSnapshot, portfolio: &PortfolioSnapshot) -> Vec<RuleResult> {
        let rules = self.rules.read();
        let mut out = Vec::new();
        for name in ALL_RULES {
            let state = &rules[&name];
            if !state.enabled {
                continue;
            }
            let result = match name {
                RuleName::TrendFollowing => self.trend_following(snapshot, state.weight),
                RuleName::MeanReversion => self.mean_reversion(snapshot, state.weight),
                RuleName::SupportResistance => self.support_resistance(snapshot, state.weight),
                RuleName::VolatilityBreakout => self.volatility_breakout(snapshot, state.weight),
                RuleName::PortfolioBalance => self.portfolio_balance(portfolio, state.weight, self.params.max_exposure_share, self.params.pnl_close_threshold),
            };
            if let Some(r) = result {
                if r.confidence >= state.confidence_threshold {
                    out.push(r);
                }
            }
        }
        out
    }

    fn trend_following(&self, s: &MarketSnapshot, weight: f64) -> Option<RuleResult> {
        let p = &self.params;
        let decision = if s.trend_direction == TrendDirection::Up && s.trend_strength > p.trend_strength_theta && s.rsi < p.rsi_low {
            DecisionKind::Buy
        } else if s.trend_direction == TrendDirection::Down && s.trend_strength > p.trend_strength_theta && s.rsi > p.rsi_high {
            DecisionKind::Sell
        } else {
            return None;
        };
        let confidence = (0.5 + 0.4 * s.trend_strength).min(0.9);
        Some(RuleResult {
            rule: RuleName::TrendFollowing,
            decision,
            confidence,
            reasoning: format!("trend following: direction={} strength={:.2} rsi={:.1}", s.trend_direction, s.trend_strength, s.rsi),
            weight,
            timestamp: Utc::now(),
        })
    }

    fn mean_reversion(&self, s: &MarketSnapshot, weight: f64) -> Option<RuleResult> {
        let p = &self.params;
        let decision = if s.bollinger_position < p.bb_low && s.momentum < -p.momentum_sigma_threshold {
            DecisionKind::Buy
        } else if s.bollinger_position > p.bb_high && s.momentum > p.momentum_sigma_threshold {
            DecisionKind::Sell
        } else {
            return None;
        };
        let mut confidence = 0.6;
        if s.volatility_factor > p.volatility_damp_threshold {
            confidence *= 0.7;
        }
        Some(RuleResult {
            rule: RuleName::MeanReversion,
            decision,
            confidence,
            reasoning: format!("mean reversion: bb_pos={:.2} momentum={:.2}", s.bollinger_position, s.momentum),
            weight,
            timestamp: Utc::now(),
        })
    }

    fn support_resistance(&self, s: &MarketSnapshot, weight: f64) -> Option<RuleResult> {
        let p = &self.params;
        let tolerance = p.sr_tolerance_points * POINT_VALUE;

        let near_support = s
            .support_levels
            .iter()
            .find(|lvl| (s.mid - *lvl).abs() <= tolerance);
        let near_resistance = s
            .resistance_levels
            .iter()
            .find(|lvl| (s.mid - *lvl).abs() <= tolerance);

        // support_levels/resistance_levels carry price only in this engine's
        // snapshot; strength is approximated from proximity when not tracked
        // separately.
        if let Some(level) = near_support {
            let strength = 1.0 - (s.mid - level).abs() / tolerance.max(1e-9);
            if strength >= p.sr_min_strength {
                return Some(RuleResult {
                    rule: RuleName::SupportResistance,
                    decision: DecisionKind::Buy,
                    confidence: (0.5 + 0.4 * strength).min(0.9),
                    reasoning: format!("support/resistance: price {:.2} near support {:.2} strength={:.2}", s.mid, level, strength),
                    weight,
                    timestamp: Utc::now(),
                });
            }
        }
        if let Some(level) = near_resistance {
            let strength = 1.0 - (s.mid - level).abs() / tolerance.max(1e-9);
            if strength >= p.sr_min_strength {
                return Some(RuleResult {
                    rule: RuleName::SupportResistance,
                    decision: DecisionKind::Sell,
                    confidence: (0.5 + 0.4 * strength).min(0.9),
                    reasoning: format!("support/resistance: price {:.2} near resistance {:.2} strength={:.2}", s.mid, level, strength),
                    weight,
                    timestamp: Utc::now(),
                });
            }
        }
        None
    }

    fn volatility_breakout(&self, s: &MarketSnapshot, weight: f64) -> Option<RuleResult> {
        let p = &self.params;
        let atr_ratio = if s.average_atr > 0.0 { s.atr / s.average_atr } else { 1.0 };
        let volume_surge = s.liquidity_level > p.breakout_liquidity_threshold;
        let half_atr = s.atr / 2.0;

        let decision = if atr_ratio > p.breakout_k && volume_surge && s.momentum > 0.0 && s.momentum.abs() * s.atr > half_atr {
            DecisionKind::Buy
        } else if atr_ratio > p.breakout_k && volume_surge && s.momentum < 0.0 && s.momentum.abs() * s.atr > half_atr {
            DecisionKind::Sell
        } else {
            return None;
        };
        let confidence = (0.5 + 0.3 * (atr_ratio - p.breakout_k).max(0.0)).min(0.9);
        Some(RuleResult {
            rule: RuleName::VolatilityBreakout,
            decision,
            confidence,
            reasoning: format!("volatility breakout: atr_ratio={atr_ratio:.2} liquidity={:.2} momentum={:.2}", s.liquidity_level, s.momentum),
            weight,
            timestamp: Utc::now(),
        })
    }

    fn portfolio_balance(&self, portfolio: &PortfolioSnapshot, weight: f64, max_exposure: f64, pnl_threshold: f64) -> Option<RuleResult> {
        let total = portfolio.total_volume();
        if total <= 0.0 {
            return None;
        }
        let sell_share = portfolio.sell_volume() / total;
        let buy_share = portfolio.buy_volume() / total;

        if sell_share > max_exposure {
            return Some(RuleResult {
                rule: RuleName::PortfolioBalance,
                decision: DecisionKind::Buy,
                confidence: (0.5 + (sell_share - max_exposure)).min(0.85),
                reasoning: format!("portfolio balance: sell share {sell_share:.2} exceeds {max_exposure:.2}"),
                weight,
                timestamp: Utc::now(),
            });
        }
        if buy_share > max_exposure {
            return Some(RuleResult {
                rule: RuleName::PortfolioBalance,
                decision: DecisionKind::Sell,
                confidence: (0.5 + (buy_share - max_exposure)).min(0.85),
                reasoning: format!("portfolio balance: buy share {buy_share:.2} exceeds {max_exposure:.2}"),
                weight,
                timestamp: Utc::now(),
            });
        }
        if portfolio.total_pnl() > pnl_threshold {
            return Some(RuleResult {
                rule: RuleName::PortfolioBalance,
                decision: DecisionKind::CloseProfitable,
                confidence: 0.7,
                reasoning: format!("portfolio balance: total pnl {:.2} exceeds {pnl_threshold:.2}", portfolio.total_pnl()),
                weight,
                timestamp: Utc::now(),
            });
        }
        None
    }

    // -------------------------------------------------------------------------
    // Fusion
    // -------------------------------------------------------------------------

    fn fuse(&self, results: Vec<RuleResult>) -> FusedDecision {
        let mut groups: HashMap<DecisionKind, Vec<&RuleResult>> = HashMap::new();
        for r in &results {
            groups.entry(r.decision).or_default().push(r);
        }

        // Score each group as its weighted-average confidence (not a raw
        // sum), so a single high-confidence rule firing alone still clears
        // the fusion threshold on its own merit.
        let mut best: Option<(DecisionKind, f64)> = None;
        for (kind, group) in &groups {
            let weight_sum: f64 = group.iter().map(|r| r.weight).sum();
            let score = if weight_sum > 0.0 {
                group.iter().map(|r| r.confidence * r.weight).sum::<f64>() / weight_sum
            } else {
                0.0
            };
            if best.map(|(_, s)| score > s).unwrap_or(true) {
                best = Some((*kind, score));
            }
        }

        let Some((kind, score)) = best else {
            return FusedDecision::wait("no decision group formed");
        };

        if score < FUSION_THRESHOLD {
            return FusedDecision::wait(&format!("winning score {score:.2} below fusion threshold"));
        }

        let winning_group = &groups[&kind];
        let reasoning = winning_group.iter().map(|r| r.reasoning.clone()).collect::<Vec<_>>().join(" | ");
        let contributing_rules = winning_group.iter().map(|r| r.rule).collect();

        FusedDecision {
            kind,
            confidence: score.min(1.0),
            contributing_rules,
            reasoning,
            target_price: None,
            volume: None,
            timestamp: Utc::now(),
        }
    }

    // -------------------------------------------------------------------------
    // Adaptive reweighting
    // -------------------------------------------------------------------------

    fn adaptive_reweight(&self) {
        let mut rules = self.rules.write();

        let mut scores: HashMap<RuleName, f64> = HashMap::new();
        for name in ALL_RULES {
            let state = &rules[&name];
            if state.history.len() < self.min_signals {
                scores.insert(name, state.weight);
                continue;
            }
            let success_rate = state.success_rate();
            let avg_profit = state.avg_profit();
            let normalized_avg_profit = (avg_profit / 100.0).clamp(-1.0, 1.0);
            let recent = state.last_n_success_rate(10);
            let score = (0.4 * success_rate + 0.3 * normalized_avg_profit + 0.3 * recent).max(0.05);
            scores.insert(name, score);
        }

        let total: f64 = scores.values().sum();
        if total > 0.0 {
            for name in ALL_RULES {
                let normalized = (scores[&name] / total).max(0.05);
                rules.get_mut(&name).unwrap().weight = normalized;
            }
            // Renormalize after the floor so Σ weights == 1 within epsilon.
            let sum: f64 = rules.values().map(|r| r.weight).sum();
            if sum > 0.0 {
                for state in rules.values_mut() {
                    state.weight /= sum;
                }
            }
        }

        for name in ALL_RULES {
            let state = rules.get_mut(&name).unwrap();
            if state.history.len() < self.min_signals {
                continue;
            }
            let success_rate = state.success_rate();
            if success_rate < 0.4 {
                state.confidence_threshold = (state.confidence_threshold + self.confidence_adjustment_rate).min(0.9);
            } else if success_rate > 0.7 {
                state.confidence_threshold = (state.confidence_threshold - self.confidence_adjustment_rate).max(0.3);
            }
        }

        info!("adaptive reweighting applied");
    }
}

impl std::fmt::Debug for RuleEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleEngine")
            .field("mode", &self.mode())
            .field("emergency", &self.is_emergency())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MarketCondition, OpenPositionSummary, Session, AccountSnapshot};

    fn snapshot() -> MarketSnapshot {
        MarketSnapshot {
            symbol: "XAUUSD".into(),
            mid: 2000.0,
            bid: 1999.9,
            ask: 2000.1,
            spread: 0.2,
            rsi: 25.0,
            bollinger_position: 0.5,
            ma_direction: TrendDirection::Up,
            macd_histogram: 0.0,
            stochastic: 50.0,
            trend_direction: TrendDirection::Up,
            trend_strength: 0.8,
            momentum: 0.2,
            volatility_factor: 1.0,
            volatility_level: MarketCondition::Ranging,
            atr: 1.0,
            average_atr: 1.0,
            support_levels: vec![],
            resistance_levels: vec![],
            session: Session::London,
            session_factor: 1.0,
            liquidity_level: 1.0,
            dimension_scores: vec![0.5, 0.5],
            timestamp: Utc::now(),
        }
    }

    fn empty_portfolio() -> PortfolioSnapshot {
        PortfolioSnapshot { positions: vec![], account: AccountSnapshot::default(), timestamp: Utc::now() }
    }

    #[test]
    fn trending_buy_fuses_to_buy_with_expected_confidence() {
        let engine = RuleEngine::new(EngineMode::Balanced, RuleParams::default(), 20, 0.05);
        let fused = engine.run_tick(&snapshot(), &empty_portfolio());
        assert_eq!(fused.kind, DecisionKind::Buy);
        assert!((fused.confidence - 0.82).abs() < 0.05, "confidence={}", fused.confidence);
        assert!(fused.contributing_rules.contains(&RuleName::TrendFollowing));
    }

    #[test]
    fn stale_snapshot_yields_wait_without_evaluating_rules() {
        let engine = RuleEngine::new(EngineMode::Balanced, RuleParams::default(), 20, 0.05);
        let mut stale = snapshot();
        stale.timestamp = Utc::now() - chrono::Duration::seconds(60);
        let fused = engine.run_tick(&stale, &empty_portfolio());
        assert_eq!(fused.kind, DecisionKind::Wait);
    }

    #[test]
    fn zero_enabled_rules_yields_wait() {
        let engine = RuleEngine::new(EngineMode::Balanced, RuleParams::default(), 20, 0.05);
        {
            let mut rules = engine.rules.write();
            for name in ALL_RULES {
                rules.get_mut(&name).unwrap().enabled = false;
            }
        }
        let fused = engine.run_tick(&snapshot(), &empty_portfolio());
        assert_eq!(fused.kind, DecisionKind::Wait);
    }

    #[test]
    fn emergency_stop_forces_wait_until_resumed() {
        let engine = RuleEngine::new(EngineMode::Balanced, RuleParams::default(), 20, 0.05);
        engine.trigger_emergency_stop();
        assert_eq!(engine.run_tick(&snapshot(), &empty_portfolio()).kind, DecisionKind::Wait);
        engine.resume();
        assert_ne!(engine.run_tick(&snapshot(), &empty_portfolio()).kind, DecisionKind::Wait);
    }

    #[test]
    fn adaptive_reweight_favors_higher_success_rate_and_respects_floor() {
        let engine = RuleEngine::new(EngineMode::Adaptive, RuleParams::default(), 10, 0.05);
        {
            let mut rules = engine.rules.write();
            let a = rules.get_mut(&RuleName::TrendFollowing).unwrap();
            for _ in 0..20 {
                a.record_outcome(true, 12.0);
            }
            let b = rules.get_mut(&RuleName::MeanReversion).unwrap();
            for _ in 0..20 {
                b.record_outcome(false, -4.0);
            }
        }
        engine.adaptive_reweight();
        let weights = engine.weights();
        assert!(weights[&RuleName::TrendFollowing] > weights[&RuleName::MeanReversion]);
        for w in weights.values() {
            assert!(*w >= 0.05 - 1e-9);
        }
        let sum: f64 = weights.values().sum();
        assert!((sum - 1.0).abs() < 1e-6, "sum={sum}");
    }

    #[test]
    fn mode_switch_is_idempotent() {
        let engine = RuleEngine::new(EngineMode::Balanced, RuleParams::default(), 20, 0.05);
        engine.set_mode(EngineMode::Aggressive);
        let first = engine.weights();
        engine.set_mode(EngineMode::Aggressive);
        let second = engine.weights();
        assert_eq!(first[&RuleName::TrendFollowing], second[&RuleName::TrendFollowing]);
    }

    #[test]
    fn lone_group_below_its_own_rule_threshold_never_reaches_fuse() {
        // A rule's own confidence_threshold gates entry into evaluate_rules;
        // since fusion scores a lone group at that rule's own confidence
        // (see fuse()'s weighted-average doc comment), any group that clears
        // its rule's threshold (default 0.55) also clears the lower 0.5
        // fusion bar. The only way to see Wait from a below-threshold signal
        // is for it to never form a group at all.
        let engine = RuleEngine::new(EngineMode::Balanced, RuleParams::default(), 20, 0.05);
        let portfolio = PortfolioSnapshot {
            positions: vec![
                OpenPositionSummary { side: Side::Buy, volume: 0.1, unrealized_total: 10.0 },
                OpenPositionSummary { side: Side::Buy, volume: 0.1, unrealized_total: 5.0 },
            ],
            account: AccountSnapshot::default(),
            timestamp: Utc::now(),
        };
        let mut flat = snapshot();
        flat.trend_strength = 0.0;
        flat.rsi = 50.0;
        // Total pnl (15.0) is below pnl_close_threshold (50.0), so
        // portfolio_balance never fires and no other rule fires either.
        let fused = engine.run_tick(&flat, &portfolio);
        assert_eq!(fused.kind, DecisionKind::Wait);
    }

    #[test]
    fn fuse_emits_wait_when_winning_group_score_is_below_threshold() {
        // Exercise fuse() directly with a synthetic low-confidence result so
        // the 0.5 fusion bar itself is under test, independent of whether any
        // real rule's own confidence_threshold would have filtered it first.
        let engine = RuleEngine::new(EngineMode::Balanced, RuleParams::default(), 20, 0.05);
        let lone = RuleResult {
            rule: RuleName::PortfolioBalance,
            decision: DecisionKind::CloseProfitable,
            confidence: 0.35,
            reasoning: "synthetic low-confidence signal".into(),
            weight: 0.15,
            timestamp: Utc::now(),
        };
        let fused = engine.fuse(vec![lone]);
        assert_eq!(fused.kind, DecisionKind::Wait);
    }

    #[test]
    fn single_rule_group_clears_fusion_on_its_own_confidence() {
        let engine = RuleEngine::new(EngineMode::Balanced, RuleParams::default(), 20, 0.05);
        let lone = RuleResult {
            rule: RuleName::PortfolioBalance,
            decision: DecisionKind::CloseProfitable,
            confidence: 0.7,
            reasoning: "portfolio balance: total pnl exceeds threshold".into(),
            weight: 0.15,
            timestamp: Utc::now(),
        };
        let fused = engine.fuse(vec![lone]);
        assert_eq!(fused.kind, DecisionKind::CloseProfitable);
        assert!((fused.confidence - 0.7).abs() < 1e-9);
    }
}
