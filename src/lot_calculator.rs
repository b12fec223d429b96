// =============================================================================
// Lot Calculator — Dynamic Hybrid position sizing
// =============================================================================
//
// Deterministic: the same inputs always produce the same output volume. No
// hidden state is carried between calls.
//
// Combines four weighted components (risk, confidence, volatility, market
// condition), applies a reasoning-derived adjustment, then clamps to the
// configured lot bounds, rounds to the lot step, and caps at 80% of free
// margin.
// =============================================================================

use tracing::instrument;

use crate::types::{AccountSnapshot, MarketCondition};

const WEIGHT_RISK: f64 = 0.30;
const WEIGHT_CONFIDENCE: f64 = 0.25;
const WEIGHT_VOLATILITY: f64 = 0.25;
const WEIGHT_MARKET: f64 = 0.20;

/// Estimated margin per 1.0 lot, used only for the 80%-of-free-margin cap.
/// Carried from the source's own approximation (see SPEC_FULL.md §3).
const ESTIMATED_MARGIN_PER_LOT: f64 = 1000.0;

const LOT_STEP: f64 = 0.01;

pub struct LotCalculator {
    base_lot_size: f64,
    min_lot_size: f64,
    max_lot_size: f64,
    max_risk_percentage: f64,
}

impl LotCalculator {
    pub fn new(base_lot_size: f64, min_lot_size: f64, max_lot_size: f64, max_risk_percentage: f64) -> Self {
        Self {
            base_lot_size,
            min_lot_size,
            max_lot_size,
            max_risk_percentage,
        }
    }

    /// Compute the optimal lot size for an order.
    ///
    /// `volatility_factor` and `market_condition` come from the current
    /// market snapshot; `confidence` is the fused decision's confidence;
    /// `reasoning` is the fusion-stage reasoning trace used to derive the
    /// reasoning adjustment.
    #[instrument(skip(self, account, reasoning), name = "lot_calculator::calculate_optimal_lot_size")]
    pub fn calculate_optimal_lot_size(
        &self,
        account: &AccountSnapshot,
        confidence: f64,
        volatility_factor: f64,
        market_condition: MarketCondition,
        reasoning: &str,
    ) -> f64 {
        let risk_component = self.risk_component(account);
        let confidence_component = self.confidence_component(confidence);
        let volatility_component = self.volatility_component(volatility_factor);
        let market_component = self.market_component(market_condition);

        let weighted_lot = risk_component * WEIGHT_RISK
            + confidence_component * WEIGHT_CONFIDENCE
            + volatility_component * WEIGHT_VOLATILITY
            + market_component * WEIGHT_MARKET;

        let adjustment = self.reasoning_adjustment(reasoning);
        let adjusted = weighted_lot * adjustment;

        self.bound_lot_size(adjusted, account)
    }

    fn risk_component(&self, account: &AccountSnapshot) -> f64 {
        let risk_budget = account.free_margin * self.max_risk_percentage / 100.0;
        let lot_per_risk = if account.balance > 0.0 {
            risk_budget / (account.balance * 0.001)
        } else {
            self.base_lot_size
        };
        lot_per_risk.clamp(self.min_lot_size, self.max_lot_size)
    }

    fn confidence_component(&self, confidence: f64) -> f64 {
        self.base_lot_size * (0.5 + confidence)
    }

    fn volatility_component(&self, volatility_factor: f64) -> f64 {
        let multiplier = if volatility_factor > 2.0 {
            0.5
        } else if volatility_factor > 1.5 {
            0.7
        } else if volatility_factor < 0.5 {
            1.3
        } else {
            1.0
        };
        self.base_lot_size * multiplier
    }

    fn market_component(&self, market_condition: MarketCondition) -> f64 {
        let multiplier = match market_condition {
            MarketCondition::HighVolatility => 0.6,
            MarketCondition::LowVolatility => 1.2,
            MarketCondition::Trending => 0.9,
            MarketCondition::Ranging => 1.1,
            MarketCondition::Unknown => 1.0,
        };
        self.base_lot_size * multiplier
    }

    /// Keyword scan over the fusion-stage reasoning trace.
    fn reasoning_adjustment(&self, reasoning: &str) -> f64 {
        let lower = reasoning.to_lowercase();
        if lower.contains("critical") || lower.contains("emergency") {
            1.3
        } else if lower.contains("foundation") || lower.contains("init") {
            1.2
        } else if lower.contains("rebalance") {
            1.1
        } else if lower.contains("maintenance") {
            0.8
        } else {
            1.0
        }
    }

    fn bound_lot_size(&self, lot: f64, account: &AccountSnapshot) -> f64 {
        let clamped = lot.clamp(self.min_lot_size, self.max_lot_size);
        let rounded = (clamped / LOT_STEP).round() * LOT_STEP;

        let estimated_margin = rounded * ESTIMATED_MARGIN_PER_LOT;
        let margin_cap = account.free_margin * 0.8;
        if account.free_margin > 0.0 && estimated_margin > margin_cap {
            let safe_lot = (margin_cap / ESTIMATED_MARGIN_PER_LOT).max(self.min_lot_size);
            let safe_rounded = (safe_lot / LOT_STEP).round() * LOT_STEP;
            return safe_rounded.clamp(self.min_lot_size, self.max_lot_size);
        }

        rounded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> AccountSnapshot {
        AccountSnapshot {
            balance: 10_000.0,
            equity: 10_000.0,
            margin: 0.0,
            free_margin: 10_000.0,
        }
    }

    #[test]
    fn lot_size_stays_within_configured_bounds() {
        let calc = LotCalculator::new(0.1, 0.01, 5.0, 2.0);
        let lot = calc.calculate_optimal_lot_size(&account(), 0.8, 1.0, MarketCondition::Ranging, "trend following");
        assert!(lot >= 0.01 && lot <= 5.0);
        let steps = lot / 0.01;
        assert!((steps - steps.round()).abs() < 1e-6);
    }

    #[test]
    fn high_volatility_shrinks_lot_relative_to_calm_market() {
        let calc = LotCalculator::new(0.1, 0.01, 5.0, 2.0);
        let calm = calc.calculate_optimal_lot_size(&account(), 0.6, 0.3, MarketCondition::Ranging, "grid");
        let volatile = calc.calculate_optimal_lot_size(&account(), 0.6, 2.5, MarketCondition::HighVolatility, "grid");
        assert!(volatile < calm, "volatile={volatile} calm={calm}");
    }

    #[test]
    fn emergency_reasoning_increases_lot_over_maintenance() {
        let calc = LotCalculator::new(0.1, 0.01, 5.0, 2.0);
        let emergency = calc.calculate_optimal_lot_size(&account(), 0.6, 1.0, MarketCondition::Ranging, "emergency rebalance");
        let maintenance = calc.calculate_optimal_lot_size(&account(), 0.6, 1.0, MarketCondition::Ranging, "maintenance pass");
        assert!(emergency > maintenance);
    }

    #[test]
    fn margin_cap_limits_lot_size_when_free_margin_is_low() {
        let calc = LotCalculator::new(0.1, 0.01, 50.0, 50.0);
        let tight = AccountSnapshot { balance: 1_000.0, equity: 1_000.0, margin: 0.0, free_margin: 10.0 };
        let lot = calc.calculate_optimal_lot_size(&tight, 0.9, 1.0, MarketCondition::Ranging, "trend");
        let estimated_margin = lot * ESTIMATED_MARGIN_PER_LOT;
        assert!(estimated_margin <= tight.free_margin * 0.8 + 1e-6);
    }
}
