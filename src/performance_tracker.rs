// =============================================================================
// Performance Tracker — decision journal, evaluation, metrics, recommendations
// =============================================================================
//
// Owns every DecisionRecord and every metrics buffer. Other components read
// metrics; nothing outside this module mutates them.
//
// Histories are bounded ring buffers (Design Notes): decisions, execution
// records, and portfolio-health samples are all capped regardless of uptime.
// =============================================================================

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{info, instrument};

use crate::rule_engine::{DecisionKind, FusedDecision, RuleName};

const MAX_DECISION_HISTORY: usize = 2000;
const MAX_EXECUTION_HISTORY: usize = 300;
const MAX_HEALTH_HISTORY: usize = 500;

/// Default evaluation delay for entry decisions (Buy/Sell), in seconds.
pub const ENTRY_EVALUATION_DELAY_SECS: i64 = 300;
/// Default evaluation delay for recovery decisions (CloseProfitable/CloseLosing), in seconds.
pub const RECOVERY_EVALUATION_DELAY_SECS: i64 = 1800;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationOutcome {
    ExcellentSuccess,
    GoodSuccess,
    ModerateSuccess,
    PoorPerformance,
    Failure,
}

impl EvaluationOutcome {
    fn is_success(&self) -> bool {
        matches!(self, Self::ExcellentSuccess | Self::GoodSuccess | Self::ModerateSuccess)
    }

    /// Classify realized profit against an expectation derived from the
    /// rule's historical average.
    fn classify(realized_profit: f64, expectation: f64) -> Self {
        if expectation <= 0.0 {
            return if realized_profit > 0.0 { Self::ModerateSuccess } else { Self::Failure };
        }
        let ratio = realized_profit / expectation;
        if ratio >= 1.5 {
            Self::ExcellentSuccess
        } else if ratio >= 1.0 {
            Self::GoodSuccess
        } else if ratio >= 0.5 {
            Self::ModerateSuccess
        } else if ratio >= 0.0 {
            Self::PoorPerformance
        } else {
            Self::Failure
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationState {
    Pending,
    Evaluated,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct DecisionRecord {
    pub id: u64,
    pub kind: DecisionKind,
    pub confidence: f64,
    pub contributing_rules: Vec<RuleName>,
    pub reasoning: String,
    pub logged_at: DateTime<Utc>,
    pub state: EvaluationState,
    pub outcome: Option<EvaluationOutcome>,
    pub profit_delta: Option<f64>,
    pub accuracy_score: Option<f64>,
}

impl DecisionRecord {
    fn evaluation_delay_secs(&self) -> i64 {
        match self.kind {
            DecisionKind::Buy | DecisionKind::Sell => ENTRY_EVALUATION_DELAY_SECS,
            _ => RECOVERY_EVALUATION_DELAY_SECS,
        }
    }

    fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.logged_at).num_seconds().max(0)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.state == EvaluationState::Pending && self.age_secs(now) >= self.evaluation_delay_secs()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionQuality {
    Excellent,
    Good,
    Average,
    Poor,
}

impl ExecutionQuality {
    /// Combined slippage + execution-time scoring table.
    fn assess(slippage_points: f64, execution_time_ms: f64) -> Self {
        let slippage_score = if slippage_points <= 0.0002 {
            4
        } else if slippage_points <= 0.0005 {
            3
        } else if slippage_points <= 0.001 {
            2
        } else {
            1
        };
        let time_score = if execution_time_ms <= 1000.0 {
            4
        } else if execution_time_ms <= 3000.0 {
            3
        } else if execution_time_ms <= 5000.0 {
            2
        } else {
            1
        };
        let combined = (slippage_score + time_score) as f64 / 2.0;
        if combined >= 3.5 {
            Self::Excellent
        } else if combined >= 2.5 {
            Self::Good
        } else if combined >= 1.5 {
            Self::Average
        } else {
            Self::Poor
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub slippage_points: f64,
    pub execution_time_ms: f64,
    pub session: crate::types::Session,
    pub quality: ExecutionQuality,
    pub success: bool,
    pub logged_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct HealthSample {
    pub profit_factor: f64,
    pub balance_factor: f64,
    pub risk_factor: f64,
    pub health: f64,
    pub logged_at: DateTime<Utc>,
}

impl HealthSample {
    pub fn new(profit_factor: f64, balance_factor: f64, risk_factor: f64, logged_at: DateTime<Utc>) -> Self {
        let pf = profit_factor.clamp(0.0, 1.0);
        let bf = balance_factor.clamp(0.0, 1.0);
        let rf = risk_factor.clamp(0.0, 1.0);
        let health = 0.4 * pf + 0.3 * bf + 0.3 * (1.0 - rf);
        Self { profit_factor: pf, balance_factor: bf, risk_factor: rf, health, logged_at }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trend {
    Improving,
    Declining,
    Stable,
}

#[derive(Debug, Clone)]
pub struct RealTimeMetrics {
    pub accuracy_rate_24h: f64,
    pub per_rule_accuracy: Vec<(RuleName, f64)>,
    pub per_rule_avg_profit: Vec<(RuleName, f64)>,
    pub confidence_accuracy_correlation: Option<f64>,
    pub execution_quality_distribution: [u64; 4],
    pub average_slippage: f64,
    pub portfolio_health_trend: Vec<f64>,
    pub overall_system_score: f64,
    pub trend: Trend,
}

struct Inner {
    decisions: VecDeque<DecisionRecord>,
    next_id: u64,
    executions: VecDeque<ExecutionRecord>,
    health: VecDeque<HealthSample>,
    overall_score_history: VecDeque<f64>,
    recovery_attempts: u64,
    recovery_successes: u64,
}

pub struct PerformanceTracker {
    inner: RwLock<Inner>,
}

impl PerformanceTracker {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                decisions: VecDeque::new(),
                next_id: 1,
                executions: VecDeque::new(),
                health: VecDeque::new(),
                overall_score_history: VecDeque::new(),
                recovery_attempts: 0,
                recovery_successes: 0,
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Recording
    // -------------------------------------------------------------------------

    #[instrument(skip(self, decision), name = "performance_tracker::log_decision")]
    pub fn log_decision(&self, decision: &FusedDecision) -> u64 {
        let mut inner = self.inner.write();
        let id = inner.next_id;
        inner.next_id += 1;

        let record = DecisionRecord {
            id,
            kind: decision.kind,
            confidence: decision.confidence,
            contributing_rules: decision.contributing_rules.clone(),
            reasoning: decision.reasoning.clone(),
            logged_at: decision.timestamp,
            state: EvaluationState::Pending,
            outcome: None,
            profit_delta: None,
            accuracy_score: None,
        };
        inner.decisions.push_back(record);
        while inner.decisions.len() > MAX_DECISION_HISTORY {
            inner.decisions.pop_front();
        }
        id
    }

    pub fn log_execution(&self, requested_price: f64, executed_price: f64, execution_time_ms: f64, session: crate::types::Session, success: bool) {
        let slippage_points = (executed_price - requested_price).abs();
        let quality = ExecutionQuality::assess(slippage_points, execution_time_ms);
        let record = ExecutionRecord {
            slippage_points,
            execution_time_ms,
            session,
            quality,
            success,
            logged_at: Utc::now(),
        };
        let mut inner = self.inner.write();
        inner.executions.push_back(record);
        while inner.executions.len() > MAX_EXECUTION_HISTORY {
            inner.executions.pop_front();
        }
    }

    pub fn update_portfolio_health(&self, profit_factor: f64, balance_factor: f64, risk_factor: f64) {
        let sample = HealthSample::new(profit_factor, balance_factor, risk_factor, Utc::now());
        let mut inner = self.inner.write();
        inner.health.push_back(sample);
        while inner.health.len() > MAX_HEALTH_HISTORY {
            inner.health.pop_front();
        }
    }

    pub fn record_recovery_attempt(&self, success: bool) {
        let mut inner = self.inner.write();
        inner.recovery_attempts += 1;
        if success {
            inner.recovery_successes += 1;
        }
    }

    // -------------------------------------------------------------------------
    // Evaluation
    // -------------------------------------------------------------------------

    /// Evaluate every pending record whose age has reached its delay.
    /// Returns the rules to credit with (success, profit_delta).
    #[instrument(skip(self, realized_profit_for), name = "performance_tracker::evaluate_matured")]
    pub fn evaluate_matured<F>(&self, now: DateTime<Utc>, realized_profit_for: F) -> Vec<(RuleName, bool, f64)>
    where
        F: Fn(u64) -> Option<f64>,
    {
        let mut credits = Vec::new();
        let mut inner = self.inner.write();

        let rule_avg: Vec<(RuleName, f64)> = {
            compute_rule_avg_profit(&inner.decisions)
        };

        for record in inner.decisions.iter_mut() {
            if !record.is_due(now) {
                continue;
            }
            let Some(realized_profit) = realized_profit_for(record.id) else {
                continue;
            };
            let expectation = rule_avg
                .iter()
                .find(|(r, _)| record.contributing_rules.contains(r))
                .map(|(_, avg)| avg.abs().max(1.0))
                .unwrap_or(1.0);

            let outcome = EvaluationOutcome::classify(realized_profit, expectation);
            let accuracy_score = if expectation > 0.0 { (realized_profit / expectation).clamp(0.0, 1.0) } else { 0.0 };

            record.state = EvaluationState::Evaluated;
            record.outcome = Some(outcome);
            record.profit_delta = Some(realized_profit);
            record.accuracy_score = Some(accuracy_score);

            for rule in &record.contributing_rules {
                credits.push((*rule, outcome.is_success(), realized_profit));
            }
        }

        info!(evaluated = credits.len(), "matured decision records evaluated");
        credits
    }

    // -------------------------------------------------------------------------
    // Metrics (computed lazily on read)
    // -------------------------------------------------------------------------

    pub fn real_time_metrics(&self, now: DateTime<Utc>) -> RealTimeMetrics {
        let inner = self.inner.read();

        let day_ago = now - chrono::Duration::hours(24);
        let recent: Vec<&DecisionRecord> = inner.decisions.iter().filter(|d| d.logged_at > day_ago).collect();
        let evaluated: Vec<&DecisionRecord> = recent.iter().copied().filter(|d| d.state == EvaluationState::Evaluated).collect();

        let accuracy_rate_24h = if evaluated.is_empty() {
            0.0
        } else {
            let successes = evaluated.iter().filter(|d| d.outcome.map(|o| o.is_success()).unwrap_or(false)).count();
            successes as f64 / evaluated.len() as f64
        };

        let mut per_rule_acc: Vec<(RuleName, f64)> = Vec::new();
        let mut per_rule_profit: Vec<(RuleName, f64)> = Vec::new();
        for rule in crate::rule_engine::ALL_RULES {
            let rule_records: Vec<&DecisionRecord> = evaluated.iter().copied().filter(|d| d.contributing_rules.contains(&rule)).collect();
            if rule_records.is_empty() {
                continue;
            }
            let successes = rule_records.iter().filter(|d| d.outcome.map(|o| o.is_success()).unwrap_or(false)).count();
            per_rule_acc.push((rule, successes as f64 / rule_records.len() as f64));
            let avg_profit = rule_records.iter().filter_map(|d| d.profit_delta).sum::<f64>() / rule_records.len() as f64;
            per_rule_profit.push((rule, avg_profit));
        }

        let confidence_accuracy_correlation = if evaluated.len() >= 10 {
            let confidences: Vec<f64> = evaluated.iter().map(|d| d.confidence).collect();
            let accuracies: Vec<f64> = evaluated.iter().filter_map(|d| d.accuracy_score).collect();
            if confidences.len() == accuracies.len() {
                pearson_correlation(&confidences, &accuracies)
            } else {
                None
            }
        } else {
            None
        };

        let mut quality_dist = [0u64; 4];
        let mut slippages = Vec::new();
        for exec in inner.executions.iter().filter(|e| e.logged_at > day_ago) {
            let idx = match exec.quality {
                ExecutionQuality::Excellent => 0,
                ExecutionQuality::Good => 1,
                ExecutionQuality::Average => 2,
                ExecutionQuality::Poor => 3,
            };
            quality_dist[idx] += 1;
            if exec.success {
                slippages.push(exec.slippage_points);
            }
        }
        let average_slippage = if slippages.is_empty() { 0.0 } else { slippages.iter().sum::<f64>() / slippages.len() as f64 };

        let portfolio_health_trend: Vec<f64> = inner
            .health
            .iter()
            .filter(|h| h.logged_at > day_ago)
            .map(|h| h.health)
            .rev()
            .take(20)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();

        let latest_health = portfolio_health_trend.last().copied().unwrap_or(0.0);
        let execution_success_rate = {
            let total: u64 = quality_dist.iter().sum();
            if total == 0 {
                0.0
            } else {
                let succeeded = inner.executions.iter().filter(|e| e.logged_at > day_ago && e.success).count();
                succeeded as f64 / total as f64
            }
        };
        let recovery_effectiveness = if inner.recovery_attempts == 0 {
            0.0
        } else {
            inner.recovery_successes as f64 / inner.recovery_attempts as f64
        };

        let overall_system_score =
            (0.30 * accuracy_rate_24h + 0.25 * recovery_effectiveness + 0.20 * execution_success_rate + 0.25 * latest_health).clamp(0.0, 1.0);

        let trend = {
            let mut history: Vec<f64> = inner.overall_score_history.iter().rev().take(5).copied().collect();
            history.reverse();
            trend_from_samples(&history, overall_system_score)
        };

        RealTimeMetrics {
            accuracy_rate_24h,
            per_rule_accuracy: per_rule_acc,
            per_rule_avg_profit: per_rule_profit,
            confidence_accuracy_correlation,
            execution_quality_distribution: quality_dist,
            average_slippage,
            portfolio_health_trend,
            overall_system_score,
            trend,
        }
    }

    /// Append `overall_system_score` to the rolling history used for trend
    /// detection. Call once per tick after `real_time_metrics`.
    pub fn record_overall_score(&self, score: f64) {
        let mut inner = self.inner.write();
        inner.overall_score_history.push_back(score);
        while inner.overall_score_history.len() > MAX_HEALTH_HISTORY {
            inner.overall_score_history.pop_front();
        }
    }

    // -------------------------------------------------------------------------
    // Recommendations
    // -------------------------------------------------------------------------

    pub fn adaptive_learning_recommendations(&self, now: DateTime<Utc>) -> Vec<String> {
        let metrics = self.real_time_metrics(now);
        let mut recommendations = Vec::new();

        if metrics.accuracy_rate_24h < 0.6 {
            recommendations.push("Rule Engine: consider adjusting rule weights — accuracy below 60%".to_string());
        }
        if let Some(corr) = metrics.confidence_accuracy_correlation {
            if corr < 0.3 {
                recommendations.push("Rule Engine: low confidence-accuracy correlation — review confidence calculation".to_string());
            }
        }
        let recovery_rate = {
            let inner = self.inner.read();
            if inner.recovery_attempts == 0 { 1.0 } else { inner.recovery_successes as f64 / inner.recovery_attempts as f64 }
        };
        if recovery_rate < 0.7 {
            recommendations.push("Position Manager: recovery success rate below 70% — review recovery strategies".to_string());
        }
        if metrics.average_slippage > 0.0005 {
            recommendations.push("Order Manager: high average slippage — consider execution timing optimization".to_string());
        }
        if metrics.overall_system_score < 0.6 {
            recommendations.push("Overall System: below-average performance — comprehensive review needed".to_string());
        }
        if metrics.trend == Trend::Declining {
            recommendations.push("Performance Alert: declining trend detected — immediate optimization required".to_string());
        }
        if metrics.overall_system_score > 0.8 {
            recommendations.push("Excellent Performance: system operating at high efficiency".to_string());
        }
        if recommendations.is_empty() {
            recommendations.push("System Performance: all metrics within acceptable ranges".to_string());
        }

        recommendations
    }

    pub fn pending_count(&self) -> usize {
        self.inner.read().decisions.iter().filter(|d| d.state == EvaluationState::Pending).count()
    }
}

fn compute_rule_avg_profit(decisions: &VecDeque<DecisionRecord>) -> Vec<(RuleName, f64)> {
    let mut out = Vec::new();
    for rule in crate::rule_engine::ALL_RULES {
        let profits: Vec<f64> = decisions
            .iter()
            .filter(|d| d.state == EvaluationState::Evaluated && d.contributing_rules.contains(&rule))
            .filter_map(|d| d.profit_delta)
            .collect();
        if !profits.is_empty() {
            out.push((rule, profits.iter().sum::<f64>() / profits.len() as f64));
        }
    }
    out
}

fn pearson_correlation(xs: &[f64], ys: &[f64]) -> Option<f64> {
    let n = xs.len();
    if n < 2 {
        return None;
    }
    let mean_x = xs.iter().sum::<f64>() / n as f64;
    let mean_y = ys.iter().sum::<f64>() / n as f64;
    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for i in 0..n {
        let dx = xs[i] - mean_x;
        let dy = ys[i] - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }
    if var_x == 0.0 || var_y == 0.0 {
        return None;
    }
    Some(cov / (var_x.sqrt() * var_y.sqrt()))
}

fn trend_from_samples(history: &[f64], latest: f64) -> Trend {
    let mut samples = history.to_vec();
    samples.push(latest);
    if samples.len() < 2 {
        return Trend::Stable;
    }
    let n = samples.len() as f64;
    let xs: Vec<f64> = (0..samples.len()).map(|i| i as f64).collect();
    let mean_x = xs.iter().sum::<f64>() / n;
    let mean_y = samples.iter().sum::<f64>() / n;
    let mut num = 0.0;
    let mut den = 0.0;
    for i in 0..samples.len() {
        num += (xs[i] - mean_x) * (samples[i] - mean_y);
        den += (xs[i] - mean_x).powi(2);
    }
    if den == 0.0 {
        return Trend::Stable;
    }
    let slope = num / den;
    if slope > 0.02 {
        Trend::Improving
    } else if slope < -0.02 {
        Trend::Declining
    } else {
        Trend::Stable
    }
}

impl Default for PerformanceTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PerformanceTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("PerformanceTracker")
            .field("decisions", &inner.decisions.len())
            .field("executions", &inner.executions.len())
            .field("health_samples", &inner.health.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision(kind: DecisionKind, rules: Vec<RuleName>) -> FusedDecision {
        FusedDecision {
            kind,
            confidence: 0.8,
            contributing_rules: rules,
            reasoning: "test".into(),
            target_price: None,
            volume: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn decision_is_not_due_before_its_evaluation_delay() {
        let tracker = PerformanceTracker::new();
        tracker.log_decision(&decision(DecisionKind::Buy, vec![RuleName::TrendFollowing]));
        let now = Utc::now() + chrono::Duration::seconds(100);
        let credits = tracker.evaluate_matured(now, |_| Some(10.0));
        assert!(credits.is_empty());
    }

    #[test]
    fn decision_evaluated_exactly_once() {
        let tracker = PerformanceTracker::new();
        tracker.log_decision(&decision(DecisionKind::Buy, vec![RuleName::TrendFollowing]));
        let due = Utc::now() + chrono::Duration::seconds(ENTRY_EVALUATION_DELAY_SECS + 5);
        let first = tracker.evaluate_matured(due, |_| Some(15.0));
        assert_eq!(first.len(), 1);
        let second = tracker.evaluate_matured(due + chrono::Duration::seconds(5), |_| Some(999.0));
        assert!(second.is_empty());
    }

    #[test]
    fn overall_system_score_stays_within_unit_interval() {
        let tracker = PerformanceTracker::new();
        tracker.update_portfolio_health(0.9, 0.9, 0.1);
        tracker.log_execution(2000.0, 2000.05, 500.0, crate::types::Session::London, true);
        let metrics = tracker.real_time_metrics(Utc::now());
        assert!(metrics.overall_system_score >= 0.0 && metrics.overall_system_score <= 1.0);
    }

    #[test]
    fn execution_quality_assessment_matches_scoring_table() {
        assert_eq!(ExecutionQuality::assess(0.0001, 500.0), ExecutionQuality::Excellent);
        assert_eq!(ExecutionQuality::assess(0.0008, 4000.0), ExecutionQuality::Average);
        assert_eq!(ExecutionQuality::assess(0.002, 6000.0), ExecutionQuality::Poor);
    }

    #[test]
    fn recommendations_are_deterministic_given_same_metrics() {
        let tracker = PerformanceTracker::new();
        let now = Utc::now();
        let first = tracker.adaptive_learning_recommendations(now);
        let second = tracker.adaptive_learning_recommendations(now);
        assert_eq!(first, second);
    }
}
