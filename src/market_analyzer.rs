// =============================================================================
// Market Analyzer — minimal capability stand-in
// =============================================================================
//
// The real technical-indicator/market analyzer is an external collaborator;
// this engine only ever consumes its output as a `MarketSnapshot` (see
// `types::MarketSnapshot`). To exercise the engine end to end without that
// collaborator, `DemoMarketAnalyzer` derives a snapshot from a short rolling
// tick history using textbook indicator formulas. It is deliberately simple
// — the core this repo is about is the decision pipeline downstream of the
// snapshot, not indicator computation.
// =============================================================================

use std::collections::VecDeque;

use chrono::Timelike;
use parking_lot::RwLock;

use crate::gateway::Tick;
use crate::types::{MarketCondition, MarketSnapshot, Session, TrendDirection};

/// Samples retained for indicator math. Covers the longest lookback used
/// below (ATR average, 20-period Bollinger) with headroom.
const HISTORY_CAP: usize = 120;

pub trait MarketAnalyzer: Send + Sync {
    fn analyze(&self, symbol: &str, tick: Tick) -> MarketSnapshot;
}

pub struct DemoMarketAnalyzer {
    mids: RwLock<VecDeque<f64>>,
    atrs: RwLock<VecDeque<f64>>,
}

impl DemoMarketAnalyzer {
    pub fn new() -> Self {
        Self {
            mids: RwLock::new(VecDeque::with_capacity(HISTORY_CAP)),
            atrs: RwLock::new(VecDeque::with_capacity(HISTORY_CAP)),
        }
    }

    fn session_for(hour: u32) -> (Session, f64) {
        match hour {
            0..=6 => (Session::Asian, 0.7),
            7..=11 => (Session::London, 1.2),
            12..=15 => (Session::Overlap, 1.5),
            16..=20 => (Session::NewYork, 1.1),
            _ => (Session::Quiet, 0.5),
        }
    }

    fn rsi(mids: &VecDeque<f64>, period: usize) -> f64 {
        if mids.len() < period + 1 {
            return 50.0;
        }
        let recent: Vec<f64> = mids.iter().rev().take(period + 1).copied().collect();
        let mut gains = 0.0;
        let mut losses = 0.0;
        for pair in recent.windows(2) {
            let delta = pair[0] - pair[1];
            if delta > 0.0 {
                gains += delta;
            } else {
                losses -= delta;
            }
        }
        if losses <= f64::EPSILON {
            return 100.0;
        }
        let rs = (gains / period as f64) / (losses / period as f64);
        100.0 - 100.0 / (1.0 + rs)
    }

    fn bollinger_position(mids: &VecDeque<f64>, mid: f64, period: usize) -> f64 {
        if mids.len() < period {
            return 0.5;
        }
        let window: Vec<f64> = mids.iter().rev().take(period).copied().collect();
        let mean = window.iter().sum::<f64>() / window.len() as f64;
        let variance = window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / window.len() as f64;
        let std_dev = variance.sqrt().max(1e-9);
        let lower = mean - 2.0 * std_dev;
        let upper = mean + 2.0 * std_dev;
        ((mid - lower) / (upper - lower).max(1e-9)).clamp(0.0, 1.0)
    }

    fn ema(values: &[f64], period: usize) -> f64 {
        if values.is_empty() {
            return 0.0;
        }
        let k = 2.0 / (period as f64 + 1.0);
        let mut ema = values[0];
        for &v in &values[1..] {
            ema = v * k + ema * (1.0 - k);
        }
        ema
    }

    fn macd_histogram(mids: &VecDeque<f64>) -> f64 {
        if mids.len() < 26 {
            return 0.0;
        }
        let window: Vec<f64> = mids.iter().copied().collect();
        let ema12 = Self::ema(&window[window.len() - 26..], 12);
        let ema26 = Self::ema(&window[window.len() - 26..], 26);
        ema12 - ema26
    }

    fn stochastic(mids: &VecDeque<f64>, mid: f64, period: usize) -> f64 {
        if mids.is_empty() {
            return 50.0;
        }
        let window: Vec<f64> = mids.iter().rev().take(period).copied().collect();
        let lo = window.iter().cloned().fold(f64::MAX, f64::min).min(mid);
        let hi = window.iter().cloned().fold(f64::MIN, f64::max).max(mid);
        if (hi - lo).abs() < 1e-9 {
            50.0
        } else {
            ((mid - lo) / (hi - lo) * 100.0).clamp(0.0, 100.0)
        }
    }

    fn trend(mids: &VecDeque<f64>, period: usize) -> (TrendDirection, f64) {
        if mids.len() < period {
            return (TrendDirection::Sideways, 0.0);
        }
        let window: Vec<f64> = mids.iter().rev().take(period).copied().collect();
        let oldest = *window.last().unwrap();
        let newest = window[0];
        let change = (newest - oldest) / oldest.max(1e-9);
        let strength = (change.abs() * 10.0).clamp(0.0, 1.0);
        if change > 0.0005 {
            (TrendDirection::Up, strength)
        } else if change < -0.0005 {
            (TrendDirection::Down, strength)
        } else {
            (TrendDirection::Sideways, strength)
        }
    }

    fn support_resistance(mids: &VecDeque<f64>) -> (Vec<f64>, Vec<f64>) {
        if mids.len() < 5 {
            return (Vec::new(), Vec::new());
        }
        let window: Vec<f64> = mids.iter().copied().collect();
        let mut support = Vec::new();
        let mut resistance = Vec::new();
        for w in window.windows(3) {
            if w[1] < w[0] && w[1] < w[2] {
                support.push(w[1]);
            } else if w[1] > w[0] && w[1] > w[2] {
                resistance.push(w[1]);
            }
        }
        support.truncate(3);
        resistance.truncate(3);
        (support, resistance)
    }
}

impl Default for DemoMarketAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl MarketAnalyzer for DemoMarketAnalyzer {
    fn analyze(&self, symbol: &str, tick: Tick) -> MarketSnapshot {
        let mid = (tick.bid + tick.ask) / 2.0;
        let spread = tick.ask - tick.bid;

        let mut mids = self.mids.write();
        let prev_mid = mids.back().copied().unwrap_or(mid);
        mids.push_back(mid);
        while mids.len() > HISTORY_CAP {
            mids.pop_front();
        }

        let true_range = (mid - prev_mid).abs().max(spread);
        let mut atrs = self.atrs.write();
        atrs.push_back(true_range);
        while atrs.len() > HISTORY_CAP {
            atrs.pop_front();
        }
        let atr = atrs.iter().rev().take(14).sum::<f64>() / atrs.iter().rev().take(14).count().max(1) as f64;
        let average_atr = atrs.iter().sum::<f64>() / atrs.len().max(1) as f64;
        let volatility_factor = if average_atr > 1e-9 { (atr / average_atr).clamp(0.1, 5.0) } else { 1.0 };

        let rsi = Self::rsi(&mids, 14);
        let bollinger_position = Self::bollinger_position(&mids, mid, 20);
        let macd_histogram = Self::macd_histogram(&mids);
        let stochastic = Self::stochastic(&mids, mid, 14);
        let (trend_direction, trend_strength) = Self::trend(&mids, 10);
        let ma_direction = trend_direction;

        let volatility_level = if volatility_factor > 2.0 {
            MarketCondition::HighVolatility
        } else if volatility_factor < 0.5 {
            MarketCondition::LowVolatility
        } else if trend_strength > 0.3 {
            MarketCondition::Trending
        } else if mids.len() >= 2 {
            MarketCondition::Ranging
        } else {
            MarketCondition::Unknown
        };
        let momentum = if mids.len() >= 10 {
            let past = mids[mids.len() - 10];
            ((mid - past) / past.max(1e-9)).clamp(-1.0, 1.0)
        } else {
            0.0
        };
        let (support_levels, resistance_levels) = Self::support_resistance(&mids);

        let hour = tick.time.hour();
        let (session, session_factor) = Self::session_for(hour);
        let liquidity_level = session_factor / 1.5;

        let dimension_scores = vec![
            (rsi / 100.0).clamp(0.0, 1.0),
            bollinger_position,
            (stochastic / 100.0).clamp(0.0, 1.0),
            trend_strength,
        ];

        MarketSnapshot {
            symbol: symbol.to_string(),
            mid,
            bid: tick.bid,
            ask: tick.ask,
            spread,
            rsi,
            bollinger_position,
            ma_direction,
            macd_histogram,
            stochastic,
            trend_direction,
            trend_strength,
            momentum,
            volatility_factor,
            volatility_level,
            atr,
            average_atr,
            support_levels,
            resistance_levels,
            session,
            session_factor,
            liquidity_level,
            dimension_scores,
            timestamp: tick.time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn tick(bid: f64, ask: f64) -> Tick {
        Tick { bid, ask, time: Utc::now() }
    }

    #[test]
    fn first_tick_yields_neutral_indicators() {
        let analyzer = DemoMarketAnalyzer::new();
        let snap = analyzer.analyze("XAUUSD", tick(1999.9, 2000.1));
        assert!((snap.mid - 2000.0).abs() < 1e-9);
        assert!((snap.rsi - 50.0).abs() < 1e-9);
        assert_eq!(snap.trend_direction, TrendDirection::Sideways);
    }

    #[test]
    fn rising_prices_tilt_trend_up_and_rsi_up() {
        let analyzer = DemoMarketAnalyzer::new();
        let mut last = 2000.0;
        for _ in 0..30 {
            last += 1.0;
            analyzer.analyze("XAUUSD", tick(last - 0.1, last + 0.1));
        }
        let snap = analyzer.analyze("XAUUSD", tick(last - 0.1, last + 0.1));
        assert_eq!(snap.trend_direction, TrendDirection::Up);
        assert!(snap.rsi > 50.0);
    }

    #[test]
    fn dimension_scores_are_always_in_unit_range() {
        let analyzer = DemoMarketAnalyzer::new();
        for i in 0..20 {
            let p = 2000.0 + (i as f64 * 0.37).sin() * 5.0;
            let snap = analyzer.analyze("XAUUSD", tick(p - 0.1, p + 0.1));
            assert!(snap.dimension_scores.iter().all(|d| (0.0..=1.0).contains(d)));
        }
    }
}
