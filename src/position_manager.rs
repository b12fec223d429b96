// =============================================================================
// Position Manager — hedge-pairing recovery, no stop-loss mechanism
// =============================================================================
//
// Life-cycle:
//   Open  ->  Closing  ->  Closed
//
// There is no back-transition and no stop-loss exit path — recovery from a
// losing position happens exclusively through the close strategies below,
// which pair, select, or sweep positions by profit rather than by price
// distance from entry.
//
// Thread-safety: all mutable state is behind `parking_lot::RwLock`.
// =============================================================================

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::types::CloseStrategy;

// ---------------------------------------------------------------------------
// Position model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Open,
    Closing,
    Closed,
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "Open"),
            Self::Closing => write!(f, "Closing"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

/// A single tracked position. No `stop_loss` field — this engine closes
/// losing exposure only via the recovery strategies below.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub symbol: String,
    /// "BUY" (long) or "SELL" (short).
    pub side: String,
    pub entry_price: f64,
    pub volume: f64,
    #[serde(default)]
    pub current_price: f64,
    #[serde(default)]
    pub profit: f64,
    #[serde(default)]
    pub swap: f64,
    #[serde(default)]
    pub commission: f64,
    pub status: PositionStatus,
    pub opened_at: String,
    #[serde(default)]
    pub closed_at: Option<String>,
    #[serde(default)]
    pub close_reason: Option<String>,
    #[serde(default)]
    pub realized_pnl: f64,
}

impl Position {
    /// Profit inclusive of swap and commission.
    pub fn total_profit(&self) -> f64 {
        self.profit + self.swap + self.commission
    }
}

/// A recovery opportunity surfaced without side-effects — the engine
/// decides whether to act on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RecoveryOpportunity {
    /// Combined profitable + losing total is non-negative; closing all
    /// positions nets a gain.
    NetPositiveRecovery { confidence: f64, net_total: f64 },
    /// A cumulative subset of profit/loss pairs nets a gain greater than the
    /// minimum threshold, without requiring the full book to be net positive.
    PartialRecovery { confidence: f64, cumulative_total: f64 },
}

// ---------------------------------------------------------------------------
// Position Manager
// ---------------------------------------------------------------------------

pub struct PositionManager {
    open: RwLock<Vec<Position>>,
    closed: RwLock<Vec<Position>>,
}

/// Maximum closed-position history retained (bounded ring buffer).
const MAX_CLOSED_HISTORY: usize = 1000;

/// Minimum combined profit+loss for a partial-recovery pair to count.
const PARTIAL_RECOVERY_THRESHOLD: f64 = 5.0;

impl PositionManager {
    pub fn new() -> Self {
        Self {
            open: RwLock::new(Vec::new()),
            closed: RwLock::new(Vec::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Open a new position
    // -------------------------------------------------------------------------

    pub fn open_position(&self, symbol: &str, side: &str, entry_price: f64, volume: f64) -> String {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();

        let pos = Position {
            id: id.clone(),
            symbol: symbol.to_string(),
            side: side.to_uppercase(),
            entry_price,
            volume,
            current_price: entry_price,
            profit: 0.0,
            swap: 0.0,
            commission: 0.0,
            status: PositionStatus::Open,
            opened_at: now,
            closed_at: None,
            close_reason: None,
            realized_pnl: 0.0,
        };

        info!(id = %id, symbol, side, entry_price, volume, "position opened");
        self.open.write().push(pos);
        id
    }

    // -------------------------------------------------------------------------
    // Price updates
    // -------------------------------------------------------------------------

    pub fn update_price(&self, symbol: &str, current_price: f64) {
        let mut positions = self.open.write();
        for pos in positions.iter_mut().filter(|p| p.symbol == symbol) {
            pos.current_price = current_price;
            let direction = if pos.side == "BUY" { 1.0 } else { -1.0 };
            pos.profit = direction * (current_price - pos.entry_price) * pos.volume;
        }
    }

    // -------------------------------------------------------------------------
    // close_profitable — dispatches to a strategy by keyword scan
    // -------------------------------------------------------------------------

    /// Close profitable positions using the strategy named by `reasoning`.
    /// Returns `true` if at least one position was closed.
    #[instrument(skip(self, reasoning), name = "position_manager::close_profitable")]
    pub fn close_profitable(&self, confidence: f64, reasoning: &str) -> bool {
        let strategy = CloseStrategy::from_reasoning(reasoning);
        info!(strategy = %strategy, confidence, "close_profitable dispatched");

        match strategy {
            CloseStrategy::HedgeRecovery => self.execute_hedge_recovery(),
            CloseStrategy::SelectiveProfit => self.execute_selective_profit(confidence),
            CloseStrategy::StandardProfit => self.execute_standard_profit(),
        }
    }

    fn execute_hedge_recovery(&self) -> bool {
        let (profitable, losing): (Vec<Position>, Vec<Position>) = {
            let open = self.open.read();
            let profitable = open.iter().filter(|p| p.total_profit() > 0.0).cloned().collect();
            let losing = open.iter().filter(|p| p.total_profit() < 0.0).cloned().collect();
            (profitable, losing)
        };

        if losing.is_empty() {
            return self.execute_standard_profit();
        }

        let total_profit: f64 = profitable.iter().map(|p| p.total_profit()).sum();
        let total_loss: f64 = losing.iter().map(|p| p.total_profit()).sum();

        if total_profit + total_loss >= 0.0 {
            let mut closed_any = false;
            for pos in profitable.iter().chain(losing.iter()) {
                if self.close_by_id(&pos.id, "HedgeRecovery").is_some() {
                    closed_any = true;
                }
            }
            return closed_any;
        }

        self.execute_partial_hedge_recovery(&profitable, &losing)
    }

    fn execute_partial_hedge_recovery(&self, profitable: &[Position], losing: &[Position]) -> bool {
        let mut profitable_sorted = profitable.to_vec();
        profitable_sorted.sort_by(|a, b| b.total_profit().partial_cmp(&a.total_profit()).unwrap());
        let mut losing_sorted = losing.to_vec();
        losing_sorted.sort_by(|a, b| b.total_profit().partial_cmp(&a.total_profit()).unwrap());

        let mut closed_any = false;
        for (p, l) in profitable_sorted.iter().zip(losing_sorted.iter()) {
            let net = p.total_profit() + l.total_profit();
            if net > 0.0 {
                if self.close_by_id(&p.id, "HedgeRecovery").is_some() {
                    closed_any = true;
                }
                if self.close_by_id(&l.id, "HedgeRecovery").is_some() {
                    closed_any = true;
                }
            }
        }
        closed_any
    }

    fn execute_selective_profit(&self, confidence: f64) -> bool {
        let mut profitable: Vec<Position> = self.open.read().iter().filter(|p| p.total_profit() > 0.0).cloned().collect();
        if profitable.is_empty() {
            return false;
        }
        profitable.sort_by(|a, b| b.total_profit().partial_cmp(&a.total_profit()).unwrap());

        let count = ((profitable.len() as f64 * confidence).ceil() as usize)
            .max(1)
            .min(profitable.len());

        let mut closed_any = false;
        for pos in profitable.iter().take(count) {
            if self.close_by_id(&pos.id, "SelectiveProfit").is_some() {
                closed_any = true;
            }
        }
        closed_any
    }

    fn execute_standard_profit(&self) -> bool {
        let profitable: Vec<Position> = self.open.read().iter().filter(|p| p.total_profit() > 0.0).cloned().collect();
        if profitable.is_empty() {
            return false;
        }
        let mut closed_any = false;
        for pos in &profitable {
            if self.close_by_id(&pos.id, "StandardProfit").is_some() {
                closed_any = true;
            }
        }
        closed_any
    }

    // -------------------------------------------------------------------------
    // emergency_close_all
    // -------------------------------------------------------------------------

    /// Close every open position sequentially. Returns `true` only if every
    /// position closed successfully.
    #[instrument(skip(self), name = "position_manager::emergency_close_all")]
    pub fn emergency_close_all(&self) -> bool {
        let ids: Vec<String> = self.open.read().iter().map(|p| p.id.clone()).collect();
        let total = ids.len();
        let mut closed_count = 0;
        for id in &ids {
            if self.close_by_id(id, "EmergencyStop").is_some() {
                closed_count += 1;
            }
        }
        if closed_count != total {
            warn!(closed_count, total, "emergency_close_all did not close every position");
        }
        closed_count == total
    }

    // -------------------------------------------------------------------------
    // recovery_opportunities
    // -------------------------------------------------------------------------

    /// Scan the open book for recovery opportunities without closing
    /// anything.
    pub fn recovery_opportunities(&self) -> Vec<RecoveryOpportunity> {
        let open = self.open.read();
        let mut profitable: Vec<&Position> = open.iter().filter(|p| p.total_profit() > 0.0).collect();
        let mut losing: Vec<&Position> = open.iter().filter(|p| p.total_profit() < 0.0).collect();

        let mut opportunities = Vec::new();

        if !profitable.is_empty() && !losing.is_empty() {
            let total_profit: f64 = profitable.iter().map(|p| p.total_profit()).sum();
            let total_loss: f64 = losing.iter().map(|p| p.total_profit()).sum();
            let net_total = total_profit + total_loss;
            if net_total >= 0.0 {
                opportunities.push(RecoveryOpportunity::NetPositiveRecovery { confidence: 0.9, net_total });
            }

            profitable.sort_by(|a, b| b.total_profit().partial_cmp(&a.total_profit()).unwrap());
            losing.sort_by(|a, b| a.total_profit().partial_cmp(&b.total_profit()).unwrap());

            let mut cumulative_profit = 0.0;
            let mut cumulative_loss = 0.0;
            for (p, l) in profitable.iter().zip(losing.iter()) {
                cumulative_profit += p.total_profit();
                cumulative_loss += l.total_profit();
                let cumulative_total = cumulative_profit + cumulative_loss;
                if cumulative_total > PARTIAL_RECOVERY_THRESHOLD {
                    opportunities.push(RecoveryOpportunity::PartialRecovery { confidence: 0.7, cumulative_total });
                }
            }
        }

        opportunities
    }

    // -------------------------------------------------------------------------
    // Close a single position
    // -------------------------------------------------------------------------

    fn close_by_id(&self, id: &str, reason: &str) -> Option<f64> {
        let mut open = self.open.write();
        let idx = open.iter().position(|p| p.id == id)?;
        let mut pos = open.remove(idx);

        pos.status = PositionStatus::Closing;
        pos.realized_pnl = pos.total_profit();
        pos.status = PositionStatus::Closed;
        pos.closed_at = Some(Utc::now().to_rfc3339());
        pos.close_reason = Some(reason.to_string());

        let total_pnl = pos.realized_pnl;
        info!(id, reason, realized_pnl = total_pnl, "position closed");

        let mut closed = self.closed.write();
        closed.push(pos);
        while closed.len() > MAX_CLOSED_HISTORY {
            closed.remove(0);
        }

        Some(total_pnl)
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn get_open_positions(&self) -> Vec<Position> {
        self.open.read().clone()
    }

    pub fn get_closed_positions(&self, count: usize) -> Vec<Position> {
        let closed = self.closed.read();
        closed.iter().rev().take(count).cloned().collect()
    }

    /// Positions closed at or after `cutoff` — used by the engine task to
    /// find which real broker tickets need an actual `close_position` call
    /// after a cycle's close decisions ran against the local mirror.
    pub fn get_closed_since(&self, cutoff: chrono::DateTime<Utc>) -> Vec<Position> {
        self.closed
            .read()
            .iter()
            .filter(|p| {
                p.closed_at
                    .as_deref()
                    .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                    .map(|dt| dt.with_timezone(&Utc) >= cutoff)
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    /// Replace the locally mirrored open positions for `symbol` with the
    /// broker's current view, keyed by ticket. Called once per cycle before
    /// any close decision so the mirror never drifts from the gateway.
    pub fn sync_from_gateway(&self, symbol: &str, positions: &[crate::gateway::GatewayPosition]) {
        let mut open = self.open.write();
        open.retain(|p| p.symbol != symbol);
        for gp in positions {
            open.push(Position {
                id: gp.ticket.to_string(),
                symbol: symbol.to_string(),
                side: gp.side.to_string().to_uppercase(),
                entry_price: gp.open_price,
                volume: gp.volume,
                current_price: gp.current_price,
                profit: gp.profit,
                swap: gp.swap,
                commission: gp.commission,
                status: PositionStatus::Open,
                opened_at: gp.open_time.to_rfc3339(),
                closed_at: None,
                close_reason: None,
                realized_pnl: 0.0,
            });
        }
    }
}

impl Default for PositionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PositionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionManager")
            .field("open_positions", &self.open.read().len())
            .field("closed_positions", &self.closed.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_manager(profits: &[(&str, f64)]) -> PositionManager {
        let mgr = PositionManager::new();
        for (side, profit) in profits {
            let id = mgr.open_position("XAUUSD", side, 2000.0, 0.1);
            let mut open = mgr.open.write();
            if let Some(p) = open.iter_mut().find(|p| p.id == id) {
                p.profit = *profit;
            }
        }
        mgr
    }

    #[test]
    fn hedge_recovery_closes_all_positions_when_net_positive() {
        let mgr = seeded_manager(&[("BUY", 50.0), ("BUY", 40.0), ("SELL", -30.0), ("SELL", -20.0)]);
        let closed = mgr.close_profitable(0.8, "hedge recovery");
        assert!(closed);
        assert_eq!(mgr.get_open_positions().len(), 0);
        assert_eq!(mgr.get_closed_positions(10).len(), 4);
    }

    #[test]
    fn selective_profit_closes_ceil_confidence_fraction() {
        let mgr = seeded_manager(&[("BUY", 10.0), ("BUY", 20.0), ("BUY", 30.0), ("BUY", 40.0)]);
        mgr.close_profitable(0.5, "selective profit taking");
        assert_eq!(mgr.get_open_positions().len(), 2);
    }

    #[test]
    fn standard_profit_closes_all_profitable_leaves_losers() {
        let mgr = seeded_manager(&[("BUY", 10.0), ("SELL", -5.0)]);
        mgr.close_profitable(0.9, "secure the gains");
        let open = mgr.get_open_positions();
        assert_eq!(open.len(), 1);
        assert!(open[0].total_profit() < 0.0);
    }

    #[test]
    fn emergency_close_all_closes_every_open_position() {
        let mgr = seeded_manager(&[("BUY", 10.0), ("SELL", -5.0), ("BUY", -2.0)]);
        let ok = mgr.emergency_close_all();
        assert!(ok);
        assert_eq!(mgr.get_open_positions().len(), 0);
        assert_eq!(mgr.get_closed_positions(10).len(), 3);
    }

    #[test]
    fn recovery_opportunities_reports_net_positive() {
        let mgr = seeded_manager(&[("BUY", 50.0), ("SELL", -30.0)]);
        let ops = mgr.recovery_opportunities();
        assert!(ops.iter().any(|o| matches!(o, RecoveryOpportunity::NetPositiveRecovery { .. })));
    }

    #[test]
    fn sync_from_gateway_replaces_mirror_by_ticket() {
        use crate::gateway::{GatewayPosition, OrderSide};

        let mgr = PositionManager::new();
        let gp = GatewayPosition {
            ticket: 42,
            side: OrderSide::Buy,
            volume: 0.2,
            open_price: 2000.0,
            current_price: 2005.0,
            profit: 10.0,
            swap: 0.0,
            commission: -0.5,
            open_time: Utc::now(),
            magic: 1,
        };
        mgr.sync_from_gateway("XAUUSD", &[gp]);

        let open = mgr.get_open_positions();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, "42");
        assert_eq!(open[0].side, "BUY");
        assert!((open[0].total_profit() - 9.5).abs() < 1e-9);
    }

    #[test]
    fn get_closed_since_only_returns_recent_closes() {
        let mgr = seeded_manager(&[("BUY", 10.0)]);
        let cutoff = Utc::now();
        mgr.close_profitable(0.9, "secure the gains");
        let recent = mgr.get_closed_since(cutoff - chrono::Duration::seconds(1));
        assert_eq!(recent.len(), 1);
        let none_after = mgr.get_closed_since(Utc::now() + chrono::Duration::seconds(60));
        assert!(none_after.is_empty());
    }
}
