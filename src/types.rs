// =============================================================================
// Shared types used across the Aurum trading engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Whether the engine is actively trading, paused, or killed.
///
/// `Killed` is entered by an operator `EmergencyStop` decision (see
/// `rule_engine::DecisionKind`) and can only be cleared by an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradingMode {
    Live,
    Paused,
    Killed,
}

impl Default for TradingMode {
    fn default() -> Self {
        Self::Paused
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "Live"),
            Self::Paused => write!(f, "Paused"),
            Self::Killed => write!(f, "Killed"),
        }
    }
}

/// Overall direction a market is moving in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrendDirection {
    Up,
    Down,
    Sideways,
}

impl std::fmt::Display for TrendDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Up => write!(f, "Up"),
            Self::Down => write!(f, "Down"),
            Self::Sideways => write!(f, "Sideways"),
        }
    }
}

/// Coarse market regime classification consumed by the Lot Calculator's
/// market component and by order-type selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketCondition {
    HighVolatility,
    LowVolatility,
    Trending,
    Ranging,
    Unknown,
}

impl std::fmt::Display for MarketCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HighVolatility => write!(f, "HighVolatility"),
            Self::LowVolatility => write!(f, "LowVolatility"),
            Self::Trending => write!(f, "Trending"),
            Self::Ranging => write!(f, "Ranging"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Trading session, used to scale liquidity expectations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Session {
    Asian,
    London,
    Overlap,
    NewYork,
    Quiet,
}

impl std::fmt::Display for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Asian => write!(f, "Asian"),
            Self::London => write!(f, "London"),
            Self::Overlap => write!(f, "Overlap"),
            Self::NewYork => write!(f, "NewYork"),
            Self::Quiet => write!(f, "Quiet"),
        }
    }
}

/// Market-freshness-independent snapshot of current bid/ask/derived
/// indicators for the single traded instrument. Produced by an out-of-scope
/// market analyzer; the engine only ever reads it by reference.
///
/// The four-dimension analysis fields (`dimension_scores`) are consumed as
/// opaque `[0, 1]` numerics — this engine does not prescribe how they are
/// derived (see Open Question (c)).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub mid: f64,
    pub bid: f64,
    pub ask: f64,
    pub spread: f64,

    pub rsi: f64,
    pub bollinger_position: f64,
    pub ma_direction: TrendDirection,
    pub macd_histogram: f64,
    pub stochastic: f64,

    pub trend_direction: TrendDirection,
    /// 0.0 .. 1.0
    pub trend_strength: f64,
    /// -1.0 .. 1.0
    pub momentum: f64,

    pub volatility_factor: f64,
    pub volatility_level: MarketCondition,
    pub atr: f64,
    pub average_atr: f64,

    pub support_levels: Vec<f64>,
    pub resistance_levels: Vec<f64>,

    pub session: Session,
    /// 0.5 .. 1.5
    pub session_factor: f64,
    pub liquidity_level: f64,

    /// Opaque four-dimension scores in `[0, 1]`; meaning owned by the
    /// out-of-scope market analyzer.
    #[serde(default)]
    pub dimension_scores: Vec<f64>,

    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Maximum age, in seconds, before a [`MarketSnapshot`] is considered stale.
pub const SNAPSHOT_STALENESS_SECS: i64 = 30;

impl MarketSnapshot {
    /// Age of this snapshot relative to `now`, in seconds.
    pub fn age_secs(&self, now: chrono::DateTime<chrono::Utc>) -> i64 {
        (now - self.timestamp).num_seconds().max(0)
    }

    /// Whether the snapshot has exceeded the staleness threshold.
    pub fn is_stale(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        self.age_secs(now) >= SNAPSHOT_STALENESS_SECS
    }
}

/// Account figures as last reported by the broker gateway.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub balance: f64,
    pub equity: f64,
    pub margin: f64,
    pub free_margin: f64,
}

impl Default for AccountSnapshot {
    fn default() -> Self {
        Self {
            balance: 0.0,
            equity: 0.0,
            margin: 0.0,
            free_margin: 0.0,
        }
    }
}

/// Tag describing why an order or close action was taken. Replaces the
/// keyword scan over a free-text reasoning string at every call site: the
/// scan happens once, at classification time, and every downstream
/// consumer matches on this enum instead of re-parsing a string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReasonTag {
    TrendFollowing,
    MeanReversion,
    SupportResistance,
    VolatilityBreakout,
    PortfolioBalance,
    GridExpansion,
    RiskManagement,
}

impl std::fmt::Display for ReasonTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::TrendFollowing => "TrendFollowing",
            Self::MeanReversion => "MeanReversion",
            Self::SupportResistance => "SupportResistance",
            Self::VolatilityBreakout => "VolatilityBreakout",
            Self::PortfolioBalance => "PortfolioBalance",
            Self::GridExpansion => "GridExpansion",
            Self::RiskManagement => "RiskManagement",
        };
        write!(f, "{s}")
    }
}

impl ReasonTag {
    /// Classify a free-text reasoning string into a [`ReasonTag`] by keyword
    /// scan, matching the order-manager's reason classification.
    pub fn from_order_reasoning(reasoning: &str) -> Self {
        let lower = reasoning.to_lowercase();
        if lower.contains("trend") {
            Self::TrendFollowing
        } else if lower.contains("reversion") || lower.contains("oversold") || lower.contains("overbought") {
            Self::MeanReversion
        } else if lower.contains("support") || lower.contains("resistance") {
            Self::SupportResistance
        } else if lower.contains("breakout") || lower.contains("volatility") {
            Self::VolatilityBreakout
        } else if lower.contains("balance") || lower.contains("hedge") {
            Self::PortfolioBalance
        } else {
            Self::GridExpansion
        }
    }
}

/// Strategy for closing profitable positions, classified from the
/// fusion-stage reasoning string by keyword scan (mirrors
/// [`ReasonTag::from_order_reasoning`] but for the Position Manager).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseStrategy {
    HedgeRecovery,
    SelectiveProfit,
    StandardProfit,
}

impl std::fmt::Display for CloseStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HedgeRecovery => write!(f, "HedgeRecovery"),
            Self::SelectiveProfit => write!(f, "SelectiveProfit"),
            Self::StandardProfit => write!(f, "StandardProfit"),
        }
    }
}

impl CloseStrategy {
    pub fn from_reasoning(reasoning: &str) -> Self {
        let lower = reasoning.to_lowercase();
        if lower.contains("hedge") || lower.contains("offset") {
            Self::HedgeRecovery
        } else if lower.contains("selective") || lower.contains("partial") {
            Self::SelectiveProfit
        } else {
            Self::StandardProfit
        }
    }
}

/// Side of an open position or pending order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "Buy"),
            Self::Sell => write!(f, "Sell"),
        }
    }
}

/// One open position as summarized for the Rule Engine's portfolio-balance
/// rule. Distinct from [`crate::position_manager::Position`], which is the
/// Position Manager's own authoritative mirror.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OpenPositionSummary {
    pub side: Side,
    pub volume: f64,
    pub unrealized_total: f64,
}

/// Read-only aggregate of the trading account's open exposure, consumed by
/// the Rule Engine once per tick. `positions` and `pending_orders` (by
/// ticket, tracked upstream) are disjoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub positions: Vec<OpenPositionSummary>,
    pub account: AccountSnapshot,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl PortfolioSnapshot {
    pub fn buy_volume(&self) -> f64 {
        self.positions.iter().filter(|p| p.side == Side::Buy).map(|p| p.volume).sum()
    }

    pub fn sell_volume(&self) -> f64 {
        self.positions.iter().filter(|p| p.side == Side::Sell).map(|p| p.volume).sum()
    }

    pub fn total_volume(&self) -> f64 {
        self.buy_volume() + self.sell_volume()
    }

    pub fn total_pnl(&self) -> f64 {
        self.positions.iter().map(|p| p.unrealized_total).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_reason_keyword_scan_matches_expected_tags() {
        assert_eq!(ReasonTag::from_order_reasoning("trend following entry"), ReasonTag::TrendFollowing);
        assert_eq!(ReasonTag::from_order_reasoning("mean reversion oversold bounce"), ReasonTag::MeanReversion);
        assert_eq!(ReasonTag::from_order_reasoning("support level bounce"), ReasonTag::SupportResistance);
        assert_eq!(ReasonTag::from_order_reasoning("volatility breakout"), ReasonTag::VolatilityBreakout);
        assert_eq!(ReasonTag::from_order_reasoning("portfolio balance hedge"), ReasonTag::PortfolioBalance);
        assert_eq!(ReasonTag::from_order_reasoning("grid expansion fill"), ReasonTag::GridExpansion);
        assert_eq!(ReasonTag::from_order_reasoning("unrecognised reason"), ReasonTag::GridExpansion);
    }

    #[test]
    fn close_strategy_keyword_scan_matches_expected_tags() {
        assert_eq!(CloseStrategy::from_reasoning("hedge recovery pass"), CloseStrategy::HedgeRecovery);
        assert_eq!(CloseStrategy::from_reasoning("offset the losers"), CloseStrategy::HedgeRecovery);
        assert_eq!(CloseStrategy::from_reasoning("selective profit taking"), CloseStrategy::SelectiveProfit);
        assert_eq!(CloseStrategy::from_reasoning("partial close"), CloseStrategy::SelectiveProfit);
        assert_eq!(CloseStrategy::from_reasoning("secure the gains"), CloseStrategy::StandardProfit);
    }

    #[test]
    fn snapshot_staleness_threshold() {
        let now = chrono::Utc::now();
        let fresh = MarketSnapshot {
            symbol: "XAUUSD".into(),
            mid: 2000.0,
            bid: 1999.9,
            ask: 2000.1,
            spread: 0.2,
            rsi: 50.0,
            bollinger_position: 0.5,
            ma_direction: TrendDirection::Up,
            macd_histogram: 0.0,
            stochastic: 50.0,
            trend_direction: TrendDirection::Up,
            trend_strength: 0.5,
            momentum: 0.0,
            volatility_factor: 1.0,
            volatility_level: MarketCondition::Unknown,
            atr: 1.0,
            average_atr: 1.0,
            support_levels: vec![],
            resistance_levels: vec![],
            session: Session::London,
            session_factor: 1.0,
            liquidity_level: 1.0,
            dimension_scores: vec![],
            timestamp: now,
        };
        assert!(!fresh.is_stale(now));

        let mut stale = fresh.clone();
        stale.timestamp = now - chrono::Duration::seconds(31);
        assert!(stale.is_stale(now));
    }
}
