// =============================================================================
// Spacing Manager — collision-aware pending-order placement distances
// =============================================================================
//
// Computes how far apart pending orders on the same side should sit, checks
// a proposed price against the existing pending-order mirror for a collision,
// and — on collision — finds an alternative price that clears the buffer.
//
// Never fails: any internal computation that cannot proceed (empty market
// data, no existing orders) falls back to the base spacing with placement
// allowed, matching the source system's error-recovery semantics.
// =============================================================================

use tracing::{debug, instrument};

use crate::types::MarketSnapshot;

/// Gold (XAUUSD) point value: one "point" is 0.01 in price terms.
const POINT_VALUE: f64 = 0.01;

/// Minimum spacing, in points, regardless of computed multiplier.
const MIN_SPACING_POINTS: f64 = 50.0;

/// Result of a spacing calculation.
#[derive(Debug, Clone)]
pub struct SpacingResult {
    pub spacing_points: f64,
    pub trend_factor: f64,
    pub volume_factor: f64,
    pub session_factor: f64,
    pub volatility_factor: f64,
    pub opportunity_factor: f64,
    pub distribution_factor: f64,
    pub final_multiplier: f64,
    pub reasoning: String,
}

/// Result of checking (and, if needed, repairing) a target price against the
/// existing pending-order mirror.
#[derive(Debug, Clone)]
pub struct PlacementResult {
    pub target_price: f64,
    pub original_target: f64,
    pub collision_detected: bool,
    pub collision_avoided: bool,
    pub placement_allowed: bool,
    pub spacing: SpacingResult,
    pub reasoning: String,
}

/// One side's existing pending order, as seen by the spacing manager.
#[derive(Debug, Clone, Copy)]
pub struct ExistingOrder {
    pub price: f64,
    pub is_buy: bool,
}

pub struct SpacingManager {
    base_spacing_points: f64,
    max_spacing_points: f64,
    collision_buffer_points: f64,
}

impl SpacingManager {
    pub fn new(base_spacing_points: f64, max_spacing_points: f64, collision_buffer_points: f64) -> Self {
        Self {
            base_spacing_points,
            max_spacing_points,
            collision_buffer_points,
        }
    }

    // -------------------------------------------------------------------------
    // calculate_spacing
    // -------------------------------------------------------------------------

    /// Compute the spacing (in points) that should separate same-side pending
    /// orders, given the current market snapshot and the existing orders on
    /// `is_buy`'s side.
    #[instrument(skip(self, snapshot, existing), name = "spacing_manager::calculate_spacing")]
    pub fn calculate_spacing(
        &self,
        snapshot: &MarketSnapshot,
        is_buy: bool,
        existing: &[ExistingOrder],
    ) -> SpacingResult {
        let trend_factor = snapshot.trend_strength.max(0.1);
        let volume_factor = snapshot.liquidity_level.max(0.1);
        let session_factor = snapshot.session_factor;
        let volatility_factor = snapshot.volatility_factor.max(0.1);
        let opportunity_factor = ((snapshot.dimension_scores.first().copied().unwrap_or(0.5))
            + (snapshot.dimension_scores.get(1).copied().unwrap_or(0.5)))
            / 2.0;

        let base_multiplier =
            (trend_factor + volume_factor + session_factor + volatility_factor + opportunity_factor) / 5.0;

        let same_side: Vec<f64> = existing
            .iter()
            .filter(|o| o.is_buy == is_buy)
            .map(|o| o.price)
            .collect();
        let distribution_factor = self.distribution_factor(&same_side);

        let final_multiplier = base_multiplier * 0.7 + distribution_factor * 0.3;

        let raw_spacing = self.base_spacing_points * final_multiplier;
        let spacing_points = raw_spacing.max(MIN_SPACING_POINTS).min(self.max_spacing_points);

        let reasoning = format!(
            "trend={trend_factor:.2} volume={volume_factor:.2} session={session_factor:.2} \
             volatility={volatility_factor:.2} opportunity={opportunity_factor:.2} \
             distribution={distribution_factor:.2}x (from {} orders) -> {spacing_points:.0} points",
            same_side.len()
        );

        debug!(spacing_points, final_multiplier, "spacing calculated");

        SpacingResult {
            spacing_points,
            trend_factor,
            volume_factor,
            session_factor,
            volatility_factor,
            opportunity_factor,
            distribution_factor,
            final_multiplier,
            reasoning,
        }
    }

    /// Density-based adjustment: denser existing placement widens spacing,
    /// sparse placement tightens it.
    fn distribution_factor(&self, same_side_prices: &[f64]) -> f64 {
        if same_side_prices.is_empty() {
            return 1.0;
        }
        if same_side_prices.len() < 2 {
            return 1.0;
        }
        let min = same_side_prices.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = same_side_prices.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let range = (max - min).max(POINT_VALUE);
        let density = same_side_prices.len() as f64 / (range * 100.0).max(1.0);

        if density > 0.5 {
            1.8
        } else if density > 0.3 {
            1.4
        } else if density < 0.1 {
            0.8
        } else {
            1.0
        }
    }

    // -------------------------------------------------------------------------
    // check_collision
    // -------------------------------------------------------------------------

    /// Whether `target_price` sits within the collision buffer of any existing
    /// order (on either side — the buffer protects against crowding the book
    /// generally, matching the source's unconditional scan).
    pub fn check_collision(&self, target_price: f64, existing: &[ExistingOrder]) -> bool {
        let buffer = self.collision_buffer_points * POINT_VALUE;
        existing.iter().any(|o| (target_price - o.price).abs() < buffer)
    }

    // -------------------------------------------------------------------------
    // find_alternative
    // -------------------------------------------------------------------------

    /// Find an alternative placement for `target_price` that clears the
    /// collision buffer, given the spacing that should be used.
    pub fn find_alternative(
        &self,
        target_price: f64,
        current_price: f64,
        is_buy: bool,
        spacing_points: f64,
        existing: &[ExistingOrder],
    ) -> f64 {
        let mut same_side: Vec<f64> = existing
            .iter()
            .filter(|o| o.is_buy == is_buy)
            .map(|o| o.price)
            .collect();
        same_side.sort_by(|a, b| a.partial_cmp(b).unwrap());

        if same_side.len() < 2 {
            let distance = spacing_points * POINT_VALUE * 1.5;
            return if is_buy {
                current_price - distance
            } else {
                current_price + distance
            };
        }

        let mut best_gap: Option<(f64, f64)> = None;
        for pair in same_side.windows(2) {
            let (lo, hi) = (pair[0], pair[1]);
            let gap_points = (hi - lo) / POINT_VALUE;
            if gap_points >= spacing_points {
                let is_bigger = best_gap.map(|(l, h)| (hi - lo) > (h - l)).unwrap_or(true);
                if is_bigger {
                    best_gap = Some((lo, hi));
                }
            }
        }

        if let Some((lo, hi)) = best_gap {
            return (lo + hi) / 2.0;
        }

        let distance = spacing_points * POINT_VALUE;
        if is_buy {
            same_side.first().copied().unwrap_or(target_price) - distance
        } else {
            same_side.last().copied().unwrap_or(target_price) + distance
        }
    }

    // -------------------------------------------------------------------------
    // Combined entry point used by the Order Manager
    // -------------------------------------------------------------------------

    /// Compute spacing, check the target price for a collision, and repair it
    /// if necessary. Never fails — worst case returns the base spacing with
    /// `placement_allowed = false` when even the repaired price still
    /// collides.
    #[instrument(skip(self, snapshot, existing), name = "spacing_manager::resolve_placement")]
    pub fn resolve_placement(
        &self,
        target_price: f64,
        current_price: f64,
        is_buy: bool,
        snapshot: &MarketSnapshot,
        existing: &[ExistingOrder],
    ) -> PlacementResult {
        let spacing = self.calculate_spacing(snapshot, is_buy, existing);
        let collision_detected = self.check_collision(target_price, existing);

        let (resolved_price, collision_avoided, placement_allowed) = if collision_detected {
            let alt = self.find_alternative(target_price, current_price, is_buy, spacing.spacing_points, existing);
            let still_collides = self.check_collision(alt, existing);
            (alt, !still_collides, !still_collides)
        } else {
            (target_price, false, true)
        };

        let reasoning = if collision_detected && !placement_allowed {
            format!(
                "{} | alternative {resolved_price:.5} still collides, placement blocked",
                spacing.reasoning
            )
        } else if collision_avoided {
            format!(
                "{} | moved from {target_price:.5} to {resolved_price:.5} (avoided collision)",
                spacing.reasoning
            )
        } else {
            format!("{} | no collision detected", spacing.reasoning)
        };

        PlacementResult {
            target_price: resolved_price,
            original_target: target_price,
            collision_detected,
            collision_avoided,
            placement_allowed,
            spacing,
            reasoning,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MarketCondition, Session, TrendDirection};

    fn sample_snapshot() -> MarketSnapshot {
        MarketSnapshot {
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
            volatility_level: MarketCondition::Ranging,
            atr: 1.0,
            average_atr: 1.0,
            support_levels: vec![],
            resistance_levels: vec![],
            session: Session::London,
            session_factor: 1.0,
            liquidity_level: 1.0,
            dimension_scores: vec![0.5, 0.5],
            timestamp: chrono::Utc::now(),
        }
    }

    #[test]
    fn base_spacing_clamped_to_floor() {
        let mgr = SpacingManager::new(80.0, 600.0, 30.0);
        let snapshot = sample_snapshot();
        let result = mgr.calculate_spacing(&snapshot, true, &[]);
        assert!(result.spacing_points >= MIN_SPACING_POINTS);
        assert!(result.spacing_points <= 600.0);
    }

    #[test]
    fn collision_detected_within_buffer() {
        let mgr = SpacingManager::new(80.0, 600.0, 30.0);
        let existing = vec![ExistingOrder { price: 2000.00, is_buy: true }];
        assert!(mgr.check_collision(2000.05, &existing));
        assert!(!mgr.check_collision(2001.00, &existing));
    }

    #[test]
    fn find_alternative_uses_largest_suitable_gap() {
        let mgr = SpacingManager::new(80.0, 600.0, 30.0);
        // Gaps (in points): 2000.00->2000.80 = 80, 2000.80->2002.80 = 200.
        // With a required spacing of 70 points both qualify; the wider one
        // must win.
        let existing = vec![
            ExistingOrder { price: 2000.00, is_buy: true },
            ExistingOrder { price: 2000.80, is_buy: true },
            ExistingOrder { price: 2002.80, is_buy: true },
        ];
        let alt = mgr.find_alternative(2000.05, 2000.00, true, 70.0, &existing);
        assert!((alt - 2001.80).abs() < 1e-9, "alt={alt}");
        assert!(!mgr.check_collision(alt, &existing));
    }

    #[test]
    fn find_alternative_falls_outside_envelope_when_no_gap_qualifies() {
        let mgr = SpacingManager::new(80.0, 600.0, 30.0);
        // Every gap is ~80 points but the required spacing is also 80 points,
        // so strict floating-point comparison leaves no gap qualifying and
        // the algorithm must fall back to placing beyond the extremum on the
        // proposing side.
        let existing = vec![
            ExistingOrder { price: 2000.00, is_buy: true },
            ExistingOrder { price: 2000.80, is_buy: true },
            ExistingOrder { price: 2001.60, is_buy: true },
        ];
        let buy_alt = mgr.find_alternative(2000.05, 2000.00, true, 80.0, &existing);
        assert!((buy_alt - 1999.20).abs() < 1e-9, "buy_alt={buy_alt}");
        assert!(!mgr.check_collision(buy_alt, &existing));

        let sell_existing: Vec<ExistingOrder> = existing.iter().map(|o| ExistingOrder { price: o.price, is_buy: false }).collect();
        let sell_alt = mgr.find_alternative(2000.05, 2000.00, false, 80.0, &sell_existing);
        assert!(sell_alt > 2001.60 && sell_alt <= 2002.40, "sell_alt={sell_alt}");
        assert!(!mgr.check_collision(sell_alt, &sell_existing));
    }

    #[test]
    fn resolve_placement_never_fails_with_no_existing_orders() {
        let mgr = SpacingManager::new(80.0, 600.0, 30.0);
        let snapshot = sample_snapshot();
        let result = mgr.resolve_placement(1999.00, 2000.00, true, &snapshot, &[]);
        assert!(result.placement_allowed);
        assert!(!result.collision_detected);
    }

    #[test]
    fn resolve_placement_repairs_a_collision_into_an_allowed_price() {
        let mgr = SpacingManager::new(80.0, 600.0, 30.0);
        let snapshot = sample_snapshot();
        let existing = vec![
            ExistingOrder { price: 2000.00, is_buy: true },
            ExistingOrder { price: 2000.80, is_buy: true },
            ExistingOrder { price: 2002.80, is_buy: true },
        ];
        let result = mgr.resolve_placement(2000.05, 2000.00, true, &snapshot, &existing);
        assert!(result.collision_detected);
        assert!(result.placement_allowed);
        assert!(result.collision_avoided);
        assert!(!mgr.check_collision(result.target_price, &existing));
    }

    #[test]
    fn resolve_placement_blocks_when_repaired_price_still_collides() {
        let mgr = SpacingManager::new(80.0, 600.0, 30.0);
        let snapshot = sample_snapshot();
        // No same-side orders, so `find_alternative` falls back to one
        // spacing beyond `current_price` without consulting `existing` — an
        // opposite-side order planted exactly there still collides, and
        // `resolve_placement` must now report the repair as blocked rather
        // than silently allowing it.
        let existing = vec![ExistingOrder { price: 1998.95, is_buy: false }];
        let result = mgr.resolve_placement(1999.00, 2000.00, true, &snapshot, &existing);
        assert!(result.collision_detected);
        assert!(!result.placement_allowed);
        assert!(!result.collision_avoided);
        assert!(mgr.check_collision(result.target_price, &existing));
    }
}
