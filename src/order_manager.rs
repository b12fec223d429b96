// =============================================================================
// Order Manager — converts a Buy/Sell decision into a submitted order
// =============================================================================
//
// Pipeline: validate -> gate -> determine volume -> determine price ->
// collision check & repair -> order-type selection -> submit.
//
// The daily order counter resets at the local-day boundary, following the
// same `maybe_reset_daily` idiom the risk engine uses for its own counters.
// =============================================================================

use std::collections::HashMap;

use chrono::{NaiveDate, Utc};
use parking_lot::RwLock;
use tracing::{info, instrument, warn};

use crate::gateway::{BrokerGateway, OrderRequest as GatewayOrderRequest, OrderSide, OrderType, PendingOrder};
use crate::lot_calculator::LotCalculator;
use crate::spacing_manager::{ExistingOrder, SpacingManager};
use crate::types::{AccountSnapshot, MarketCondition, MarketSnapshot, ReasonTag};

/// Gold point value, shared with the spacing manager.
const POINT_VALUE: f64 = 0.01;

/// Failure taxonomy for order placement. Exactly one kind is set on failure;
/// success never sets one.
#[derive(Debug, Clone, PartialEq)]
pub enum OrderError {
    InvalidInput(String),
    NotConnected,
    StaleData,
    DailyLimitReached,
    CollisionUnresolved,
    InsufficientMargin,
    GatewayRejected(i32),
    Timeout,
    Internal(String),
}

impl std::fmt::Display for OrderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Self::NotConnected => write!(f, "gateway not connected"),
            Self::StaleData => write!(f, "market snapshot is stale"),
            Self::DailyLimitReached => write!(f, "daily order limit reached"),
            Self::CollisionUnresolved => write!(f, "order collision could not be resolved"),
            Self::InsufficientMargin => write!(f, "insufficient margin"),
            Self::GatewayRejected(code) => write!(f, "gateway rejected order: {code}"),
            Self::Timeout => write!(f, "gateway call timed out"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for OrderError {}

#[derive(Debug, Clone)]
pub struct OrderResult {
    pub success: bool,
    pub ticket: Option<u64>,
    pub error_kind: Option<OrderError>,
    pub executed_price: Option<f64>,
    pub slippage: Option<f64>,
}

impl OrderResult {
    fn ok(ticket: u64, executed_price: f64, requested_price: f64) -> Self {
        Self {
            success: true,
            ticket: Some(ticket),
            error_kind: None,
            executed_price: Some(executed_price),
            slippage: Some((executed_price - requested_price).abs()),
        }
    }

    fn err(kind: OrderError) -> Self {
        Self {
            success: false,
            ticket: None,
            error_kind: Some(kind),
            executed_price: None,
            slippage: None,
        }
    }
}

/// Per-reason performance counters, fixed key set over [`ReasonTag`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ReasonCounters {
    pub count: u64,
    pub successes: u64,
    pub total_profit: f64,
}

struct Inner {
    daily_count: u64,
    reset_date: NaiveDate,
    reason_counters: HashMap<ReasonTag, ReasonCounters>,
}

impl Inner {
    fn new() -> Self {
        let mut reason_counters = HashMap::new();
        for tag in [
            ReasonTag::TrendFollowing,
            ReasonTag::MeanReversion,
            ReasonTag::SupportResistance,
            ReasonTag::VolatilityBreakout,
            ReasonTag::PortfolioBalance,
            ReasonTag::GridExpansion,
            ReasonTag::RiskManagement,
        ] {
            reason_counters.insert(tag, ReasonCounters::default());
        }
        Self {
            daily_count: 0,
            reset_date: Utc::now().date_naive(),
            reason_counters,
        }
    }
}

pub struct OrderManager {
    gateway: std::sync::Arc<dyn BrokerGateway>,
    spacing: SpacingManager,
    lots: LotCalculator,
    min_lot: f64,
    max_lot: f64,
    max_daily_orders: u64,
    magic: u64,
    inner: RwLock<Inner>,
}

impl OrderManager {
    pub fn new(
        gateway: std::sync::Arc<dyn BrokerGateway>,
        spacing: SpacingManager,
        lots: LotCalculator,
        min_lot: f64,
        max_lot: f64,
        max_daily_orders: u64,
        magic: u64,
    ) -> Self {
        Self {
            gateway,
            spacing,
            lots,
            min_lot,
            max_lot,
            max_daily_orders,
            magic,
            inner: RwLock::new(Inner::new()),
        }
    }

    fn maybe_reset_daily(&self) {
        let today = Utc::now().date_naive();
        let mut inner = self.inner.write();
        if inner.reset_date != today {
            inner.daily_count = 0;
            inner.reset_date = today;
            info!("daily order counter reset");
        }
    }

    pub fn daily_count(&self) -> u64 {
        self.maybe_reset_daily();
        self.inner.read().daily_count
    }

    pub fn reason_counters(&self) -> HashMap<ReasonTag, ReasonCounters> {
        self.inner.read().reason_counters.clone()
    }

    // -------------------------------------------------------------------------
    // place_smart_order
    // -------------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    #[instrument(skip(self, snapshot, account, existing_orders, reasoning), name = "order_manager::place_smart_order")]
    pub async fn place_smart_order(
        &self,
        side: OrderSide,
        symbol: &str,
        volume: Option<f64>,
        target_price: Option<f64>,
        reasoning: &str,
        confidence: f64,
        snapshot: &MarketSnapshot,
        account: &AccountSnapshot,
        existing_orders: &[ExistingOrder],
        now: chrono::DateTime<Utc>,
    ) -> OrderResult {
        // 1. Validate inputs.
        if let Some(v) = volume {
            if !(self.min_lot..=self.max_lot).contains(&v) {
                return OrderResult::err(OrderError::InvalidInput(format!(
                    "volume {v} outside [{}, {}]",
                    self.min_lot, self.max_lot
                )));
            }
        }
        if let Some(p) = target_price {
            if p <= 0.0 {
                return OrderResult::err(OrderError::InvalidInput("target price must be positive".into()));
            }
        }

        // 2. Gate.
        if !self.gateway.is_connected() {
            return OrderResult::err(OrderError::NotConnected);
        }
        self.maybe_reset_daily();
        if self.inner.read().daily_count >= self.max_daily_orders {
            warn!(max_daily_orders = self.max_daily_orders, "daily order limit reached");
            return OrderResult::err(OrderError::DailyLimitReached);
        }
        if snapshot.is_stale(now) {
            return OrderResult::err(OrderError::StaleData);
        }

        // 3. Determine volume.
        let final_volume = match volume {
            Some(v) => v,
            None => self.lots.calculate_optimal_lot_size(
                account,
                confidence,
                snapshot.volatility_factor,
                snapshot.volatility_level,
                reasoning,
            ),
        };

        // 4. Determine price.
        let is_buy = matches!(side, OrderSide::Buy);
        let current = if is_buy { snapshot.ask } else { snapshot.bid };
        let spacing_preview = self.spacing.calculate_spacing(snapshot, is_buy, existing_orders);
        let requested_price = match target_price {
            Some(p) => p,
            None => {
                let distance = spacing_preview.spacing_points * POINT_VALUE;
                if is_buy {
                    current - distance
                } else {
                    current + distance
                }
            }
        };

        // 5. Collision check & repair.
        let placement = self.spacing.resolve_placement(requested_price, current, is_buy, snapshot, existing_orders);
        if !placement.placement_allowed {
            return OrderResult::err(OrderError::CollisionUnresolved);
        }
        let final_price = placement.target_price;

        // 6. Order-type selection.
        let order_type = self.select_order_type(is_buy, confidence, snapshot, current, final_price);

        // 7. Submit.
        let reason = ReasonTag::from_order_reasoning(reasoning);
        let req = GatewayOrderRequest {
            symbol: symbol.to_string(),
            order_type,
            volume: final_volume,
            price: final_price,
            slippage_points: 10.0,
            magic: self.magic,
            comment: reasoning.to_string(),
        };

        let response = self.gateway.send_order(req).await;
        self.credit(reason, &response);

        match response {
            Ok(resp) if resp.is_ok() => {
                {
                    let mut inner = self.inner.write();
                    inner.daily_count += 1;
                }
                let ticket = resp.ticket.unwrap_or(0);
                let executed = resp.price.unwrap_or(final_price);
                info!(ticket, executed, reason = %reason, "order submitted");
                OrderResult::ok(ticket, executed, final_price)
            }
            Ok(resp) => {
                warn!(retcode = resp.retcode, reason = %reason, "order rejected by gateway");
                OrderResult::err(OrderError::GatewayRejected(resp.retcode))
            }
            Err(crate::gateway::GatewayError::NotConnected) => OrderResult::err(OrderError::NotConnected),
            Err(crate::gateway::GatewayError::Timeout) => OrderResult::err(OrderError::Timeout),
            Err(crate::gateway::GatewayError::Rejected(code)) => OrderResult::err(OrderError::GatewayRejected(code)),
        }
    }

    fn credit(&self, reason: ReasonTag, response: &Result<crate::gateway::SendOrderResponse, crate::gateway::GatewayError>) {
        let success = matches!(response, Ok(r) if r.is_ok());
        let mut inner = self.inner.write();
        let entry = inner.reason_counters.entry(reason).or_default();
        entry.count += 1;
        if success {
            entry.successes += 1;
        }
    }

    fn select_order_type(
        &self,
        is_buy: bool,
        confidence: f64,
        snapshot: &MarketSnapshot,
        current: f64,
        target: f64,
    ) -> OrderType {
        let low_volatility = matches!(snapshot.volatility_level, MarketCondition::LowVolatility);
        let high_volatility = matches!(snapshot.volatility_level, MarketCondition::HighVolatility);
        let breakout_aligned = matches!(snapshot.volatility_level, MarketCondition::HighVolatility)
            && ((is_buy && snapshot.momentum > 0.0) || (!is_buy && snapshot.momentum < 0.0));

        if breakout_aligned && ((is_buy && target > current) || (!is_buy && target < current)) {
            return if is_buy { OrderType::BuyStop } else { OrderType::SellStop };
        }

        if high_volatility || (confidence >= 0.7 && low_volatility) {
            return if is_buy { OrderType::BuyLimit } else { OrderType::SellLimit };
        }

        if is_buy { OrderType::BuyLimit } else { OrderType::SellLimit }
    }

    /// Refresh the local pending-order mirror from the gateway.
    pub async fn refresh_pending_orders(&self, symbol: &str) -> Vec<PendingOrder> {
        self.gateway.orders(symbol).await.unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{AccountInfo, GatewayError, GatewayPosition, SendOrderResponse, Tick, RETCODE_DONE};
    use crate::types::{Session, TrendDirection};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    struct FakeGateway {
        connected: AtomicBool,
        next_ticket: AtomicU64,
        reject: bool,
    }

    impl FakeGateway {
        fn connected(reject: bool) -> Self {
            Self { connected: AtomicBool::new(true), next_ticket: AtomicU64::new(1), reject }
        }
        fn disconnected() -> Self {
            Self { connected: AtomicBool::new(false), next_ticket: AtomicU64::new(1), reject: false }
        }
    }

    #[async_trait]
    impl BrokerGateway for FakeGateway {
        async fn tick(&self, _symbol: &str) -> Option<Tick> {
            None
        }
        async fn positions(&self, _symbol: &str) -> Result<Vec<GatewayPosition>, GatewayError> {
            Ok(vec![])
        }
        async fn orders(&self, _symbol: &str) -> Result<Vec<PendingOrder>, GatewayError> {
            Ok(vec![])
        }
        async fn account_info(&self) -> Result<AccountInfo, GatewayError> {
            Ok(AccountInfo { balance: 10_000.0, equity: 10_000.0, margin: 0.0, free_margin: 10_000.0, margin_level: 0.0, leverage: 100 })
        }
        async fn send_order(&self, req: GatewayOrderRequest) -> Result<SendOrderResponse, GatewayError> {
            if self.reject {
                return Ok(SendOrderResponse { retcode: 10013, ticket: None, price: None, comment: None });
            }
            let ticket = self.next_ticket.fetch_add(1, Ordering::SeqCst);
            Ok(SendOrderResponse { retcode: RETCODE_DONE, ticket: Some(ticket), price: Some(req.price), comment: None })
        }
        async fn close_position(&self, _ticket: u64, _volume: f64, _magic: u64) -> Result<i32, GatewayError> {
            Ok(RETCODE_DONE)
        }
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }

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

    fn account() -> AccountSnapshot {
        AccountSnapshot { balance: 10_000.0, equity: 10_000.0, margin: 0.0, free_margin: 10_000.0 }
    }

    #[tokio::test]
    async fn trending_buy_submits_at_passive_price_and_credits_reason() {
        let gw = FakeGateway::connected(false);
        let mgr = OrderManager::new(std::sync::Arc::new(gw), SpacingManager::new(80.0, 600.0, 30.0), LotCalculator::new(0.1, 0.01, 5.0, 2.0), 0.01, 5.0, 50, 12345);
        let snap = snapshot();
        let result = mgr
            .place_smart_order(OrderSide::Buy, "XAUUSD", None, None, "trend following breakout", 0.82, &snap, &account(), &[], Utc::now())
            .await;
        assert!(result.success);
        let expected_price = snap.ask - 80.0 * POINT_VALUE;
        assert!((result.executed_price.unwrap() - expected_price).abs() < 1e-6);
        let counters = mgr.reason_counters();
        assert_eq!(counters[&ReasonTag::TrendFollowing].count, 1);
        assert_eq!(counters[&ReasonTag::TrendFollowing].successes, 1);
    }

    #[tokio::test]
    async fn not_connected_gateway_fails_before_submit() {
        let gw = FakeGateway::disconnected();
        let mgr = OrderManager::new(std::sync::Arc::new(gw), SpacingManager::new(80.0, 600.0, 30.0), LotCalculator::new(0.1, 0.01, 5.0, 2.0), 0.01, 5.0, 50, 1);
        let result = mgr.place_smart_order(OrderSide::Buy, "XAUUSD", Some(0.1), Some(1999.0), "trend", 0.8, &snapshot(), &account(), &[], Utc::now()).await;
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(OrderError::NotConnected));
    }

    #[tokio::test]
    async fn daily_limit_reached_blocks_second_order_without_gateway_call() {
        let gw = FakeGateway::connected(false);
        let mgr = OrderManager::new(std::sync::Arc::new(gw), SpacingManager::new(80.0, 600.0, 30.0), LotCalculator::new(0.1, 0.01, 5.0, 2.0), 0.01, 5.0, 1, 1);
        let first = mgr.place_smart_order(OrderSide::Buy, "XAUUSD", Some(0.1), Some(1999.0), "trend", 0.8, &snapshot(), &account(), &[], Utc::now()).await;
        assert!(first.success);
        let second = mgr.place_smart_order(OrderSide::Buy, "XAUUSD", Some(0.1), Some(1998.0), "trend", 0.8, &snapshot(), &account(), &[], Utc::now()).await;
        assert!(!second.success);
        assert_eq!(second.error_kind, Some(OrderError::DailyLimitReached));
        assert_eq!(mgr.daily_count(), 1);
    }

    #[tokio::test]
    async fn stale_snapshot_blocks_before_gateway_call() {
        let gw = FakeGateway::connected(false);
        let mgr = OrderManager::new(std::sync::Arc::new(gw), SpacingManager::new(80.0, 600.0, 30.0), LotCalculator::new(0.1, 0.01, 5.0, 2.0), 0.01, 5.0, 50, 1);
        let mut stale = snapshot();
        stale.timestamp = Utc::now() - chrono::Duration::seconds(60);
        let result = mgr.place_smart_order(OrderSide::Buy, "XAUUSD", Some(0.1), Some(1999.0), "trend", 0.8, &stale, &account(), &[], Utc::now()).await;
        assert_eq!(result.error_kind, Some(OrderError::StaleData));
    }

    #[tokio::test]
    async fn gateway_rejection_surfaces_as_gateway_rejected_and_credits_failure() {
        let gw = FakeGateway::connected(true);
        let mgr = OrderManager::new(std::sync::Arc::new(gw), SpacingManager::new(80.0, 600.0, 30.0), LotCalculator::new(0.1, 0.01, 5.0, 2.0), 0.01, 5.0, 50, 1);
        let result = mgr.place_smart_order(OrderSide::Sell, "XAUUSD", Some(0.1), Some(2001.0), "resistance rejection", 0.7, &snapshot(), &account(), &[], Utc::now()).await;
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(OrderError::GatewayRejected(10013)));
        let counters = mgr.reason_counters();
        assert_eq!(counters[&ReasonTag::SupportResistance].count, 1);
        assert_eq!(counters[&ReasonTag::SupportResistance].successes, 0);
    }

    #[tokio::test]
    async fn collision_repair_picks_the_widest_gap_between_existing_orders() {
        let gw = FakeGateway::connected(false);
        let mgr = OrderManager::new(std::sync::Arc::new(gw), SpacingManager::new(80.0, 600.0, 30.0), LotCalculator::new(0.1, 0.01, 5.0, 2.0), 0.01, 5.0, 50, 1);
        let existing = vec![
            ExistingOrder { price: 2000.00, is_buy: true },
            ExistingOrder { price: 2000.80, is_buy: true },
            ExistingOrder { price: 2001.60, is_buy: true },
        ];
        // With this snapshot calculate_spacing yields ~67.4 points, below both
        // ~80-point gaps, so the repair lands on the first gap's midpoint
        // instead of outside the envelope.
        let result = mgr
            .place_smart_order(OrderSide::Buy, "XAUUSD", Some(0.1), Some(2000.05), "grid expansion", 0.6, &snapshot(), &account(), &existing, Utc::now())
            .await;
        assert!(result.success);
        let price = result.executed_price.unwrap();
        assert!((price - 2000.40).abs() < 1e-6, "price={price}");
    }

    #[tokio::test]
    async fn collision_repair_places_outside_envelope_when_no_gap_is_wide_enough() {
        let gw = FakeGateway::connected(false);
        let mgr = OrderManager::new(std::sync::Arc::new(gw), SpacingManager::new(80.0, 600.0, 30.0), LotCalculator::new(0.1, 0.01, 5.0, 2.0), 0.01, 5.0, 50, 1);
        let mut active = snapshot();
        active.trend_strength = 2.0;
        active.liquidity_level = 2.0;
        active.session_factor = 2.0;
        active.volatility_factor = 2.0;
        active.dimension_scores = vec![2.0, 2.0];
        let existing = vec![
            ExistingOrder { price: 2000.00, is_buy: false },
            ExistingOrder { price: 2000.80, is_buy: false },
            ExistingOrder { price: 2001.60, is_buy: false },
        ];
        // Stronger dimension scores push calculate_spacing to ~131 points,
        // wider than either ~80-point gap, so the repair must fall back to
        // one spacing beyond the highest existing sell order.
        let result = mgr
            .place_smart_order(OrderSide::Sell, "XAUUSD", Some(0.1), Some(2000.05), "grid expansion", 0.6, &active, &account(), &existing, Utc::now())
            .await;
        assert!(result.success);
        let price = result.executed_price.unwrap();
        assert!(price > 2001.60, "price={price}");
        assert!((price - 2002.912).abs() < 1e-6, "price={price}");
    }
}
