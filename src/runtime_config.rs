// =============================================================================
// Runtime Configuration — hot-editable engine settings with atomic save
// =============================================================================
//
// Central configuration hub for the engine. Every tunable parameter lives
// here so the engine can be reconfigured without a rebuild.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. Every field carries a serde default so partial or empty JSON loads
// cleanly — adding a field later never breaks an existing config file.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::rule_engine::{EngineMode, RuleName};
use crate::types::TradingMode;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbol() -> String {
    "XAUUSD".to_string()
}

fn default_base_lot_size() -> f64 {
    0.1
}

fn default_min_lot_size() -> f64 {
    0.01
}

fn default_max_lot_size() -> f64 {
    5.0
}

fn default_max_positions() -> u32 {
    10
}

fn default_base_spacing_points() -> f64 {
    80.0
}

fn default_max_spacing_points() -> f64 {
    600.0
}

fn default_collision_buffer_points() -> f64 {
    30.0
}

fn default_max_risk_percentage() -> f64 {
    2.0
}

fn default_max_daily_orders() -> u64 {
    50
}

fn default_magic() -> u64 {
    20260728
}

fn default_learning_rate() -> f64 {
    0.1
}

fn default_performance_window() -> u32 {
    20
}

fn default_confidence_adjustment_rate() -> f64 {
    0.05
}

fn default_min_signals() -> u32 {
    10
}

fn default_rule_weight() -> f64 {
    0.2
}

fn default_confidence_threshold() -> f64 {
    0.5
}

fn default_true() -> bool {
    true
}

fn default_engine_mode() -> EngineMode {
    EngineMode::Adaptive
}

// =============================================================================
// TradingParams
// =============================================================================

/// Instrument identity, lot sizing, and spacing bounds — `trading.*`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingParams {
    #[serde(default = "default_symbol")]
    pub symbol: String,

    #[serde(default = "default_base_lot_size")]
    pub base_lot_size: f64,

    #[serde(default = "default_min_lot_size")]
    pub min_lot_size: f64,

    #[serde(default = "default_max_lot_size")]
    pub max_lot_size: f64,

    #[serde(default = "default_max_positions")]
    pub max_positions: u32,

    #[serde(default = "default_base_spacing_points")]
    pub base_spacing_points: f64,

    #[serde(default = "default_max_spacing_points")]
    pub max_spacing_points: f64,

    #[serde(default = "default_collision_buffer_points")]
    pub collision_buffer_points: f64,
}

impl Default for TradingParams {
    fn default() -> Self {
        Self {
            symbol: default_symbol(),
            base_lot_size: default_base_lot_size(),
            min_lot_size: default_min_lot_size(),
            max_lot_size: default_max_lot_size(),
            max_positions: default_max_positions(),
            base_spacing_points: default_base_spacing_points(),
            max_spacing_points: default_max_spacing_points(),
            collision_buffer_points: default_collision_buffer_points(),
        }
    }
}

// =============================================================================
// RiskManagementParams
// =============================================================================

/// Per-order risk bounds — `risk_management.*`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskManagementParams {
    #[serde(default = "default_max_risk_percentage")]
    pub max_risk_percentage: f64,

    #[serde(default = "default_max_daily_orders")]
    pub max_daily_orders: u64,
}

impl Default for RiskManagementParams {
    fn default() -> Self {
        Self {
            max_risk_percentage: default_max_risk_percentage(),
            max_daily_orders: default_max_daily_orders(),
        }
    }
}

// =============================================================================
// RuleConfig
// =============================================================================

/// Per-rule configuration — `rules.<name>.*`. `parameters` carries
/// rule-specific overrides (theta, rsi thresholds, ...) as raw JSON so the
/// rule engine can pick out what it understands without this struct needing
/// a field per knob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_rule_weight")]
    pub weight: f64,

    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,

    #[serde(default)]
    pub parameters: HashMap<String, f64>,
}

impl Default for RuleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            weight: default_rule_weight(),
            confidence_threshold: default_confidence_threshold(),
            parameters: HashMap::new(),
        }
    }
}

fn default_rules() -> HashMap<String, RuleConfig> {
    let mut map = HashMap::new();
    for rule in crate::rule_engine::ALL_RULES {
        map.insert(rule.as_str().to_string(), RuleConfig::default());
    }
    map
}

// =============================================================================
// AdaptiveParams
// =============================================================================

/// Adaptive-reweighting knobs — `adaptive.*`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveParams {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,

    #[serde(default = "default_performance_window")]
    pub performance_window: u32,

    #[serde(default = "default_confidence_adjustment_rate")]
    pub confidence_adjustment_rate: f64,

    #[serde(default = "default_min_signals")]
    pub min_signals: u32,
}

impl Default for AdaptiveParams {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            performance_window: default_performance_window(),
            confidence_adjustment_rate: default_confidence_adjustment_rate(),
            min_signals: default_min_signals(),
        }
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the engine.
///
/// Every field has a serde default so older JSON files missing new fields
/// still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Current trading mode: Live, Paused, or Killed.
    #[serde(default)]
    pub trading_mode: TradingMode,

    /// How the rule engine combines and (optionally) reweights its rules.
    #[serde(default = "default_engine_mode")]
    pub engine_mode: EngineMode,

    #[serde(default)]
    pub trading: TradingParams,

    #[serde(default)]
    pub risk_management: RiskManagementParams,

    #[serde(default = "default_rules")]
    pub rules: HashMap<String, RuleConfig>,

    #[serde(default)]
    pub adaptive: AdaptiveParams,

    /// Magic number tagging orders this engine instance places.
    #[serde(default = "default_magic")]
    pub magic: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            trading_mode: TradingMode::Paused,
            engine_mode: default_engine_mode(),
            trading: TradingParams::default(),
            risk_management: RiskManagementParams::default(),
            rules: default_rules(),
            adaptive: AdaptiveParams::default(),
            magic: default_magic(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist or fails to parse, returns an error so the
    /// caller can fall back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbol = %config.trading.symbol,
            trading_mode = %config.trading_mode,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self).context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    pub fn rule_config(&self, rule: RuleName) -> RuleConfig {
        self.rules.get(rule.as_str()).cloned().unwrap_or_default()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.trading_mode, TradingMode::Paused);
        assert_eq!(cfg.engine_mode, EngineMode::Adaptive);
        assert_eq!(cfg.trading.symbol, "XAUUSD");
        assert_eq!(cfg.trading.max_positions, 10);
        assert!((cfg.risk_management.max_risk_percentage - 2.0).abs() < f64::EPSILON);
        assert_eq!(cfg.risk_management.max_daily_orders, 50);
        assert_eq!(cfg.rules.len(), 5);
        assert_eq!(cfg.adaptive.min_signals, 10);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.trading_mode, TradingMode::Paused);
        assert_eq!(cfg.trading.symbol, "XAUUSD");
        assert_eq!(cfg.rules.len(), 5);
        assert!(cfg.rules.values().all(|r| r.enabled));
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "trading_mode": "Live", "trading": { "symbol": "XAUUSD", "base_lot_size": 0.5 } }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.trading_mode, TradingMode::Live);
        assert!((cfg.trading.base_lot_size - 0.5).abs() < f64::EPSILON);
        assert!((cfg.trading.min_lot_size - 0.01).abs() < f64::EPSILON);
        assert_eq!(cfg.risk_management.max_daily_orders, 50);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = RuntimeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.trading.symbol, cfg2.trading.symbol);
        assert_eq!(cfg.trading_mode, cfg2.trading_mode);
        assert_eq!(cfg.rules.len(), cfg2.rules.len());
    }

    #[test]
    fn rule_config_falls_back_to_default_for_unknown_rule() {
        let mut cfg = RuntimeConfig::default();
        cfg.rules.remove(RuleName::TrendFollowing.as_str());
        let rc = cfg.rule_config(RuleName::TrendFollowing);
        assert!(rc.enabled);
        assert!((rc.confidence_threshold - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn save_then_load_roundtrips_atomically() {
        let dir = std::env::temp_dir().join(format!("aurum-engine-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("runtime_config.json");

        let mut cfg = RuntimeConfig::default();
        cfg.trading_mode = TradingMode::Live;
        cfg.trading.base_lot_size = 0.25;
        cfg.save(&path).unwrap();

        let loaded = RuntimeConfig::load(&path).unwrap();
        assert_eq!(loaded.trading_mode, TradingMode::Live);
        assert!((loaded.trading.base_lot_size - 0.25).abs() < f64::EPSILON);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
