// =============================================================================
// Broker gateway — narrow capability surface consumed by the engine
// =============================================================================
//
// The engine never depends on a concrete broker client directly; every
// consumer (Order Manager, Position Manager, the engine task's reconnection
// check) takes `&dyn BrokerGateway`. This keeps the component graph acyclic:
// the engine owns the concrete gateway, components only ever receive a
// reference to the trait object.
// =============================================================================

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A single price tick.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Tick {
    pub bid: f64,
    pub ask: f64,
    pub time: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "Buy"),
            Self::Sell => write!(f, "Sell"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    BuyLimit,
    SellLimit,
    BuyStop,
    SellStop,
    MarketBuy,
    MarketSell,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::BuyLimit => "BuyLimit",
            Self::SellLimit => "SellLimit",
            Self::BuyStop => "BuyStop",
            Self::SellStop => "SellStop",
            Self::MarketBuy => "MarketBuy",
            Self::MarketSell => "MarketSell",
        };
        write!(f, "{s}")
    }
}

/// A pending (not-yet-filled) order as mirrored from the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingOrder {
    pub ticket: u64,
    pub order_type: OrderType,
    pub price: f64,
    pub volume: f64,
}

/// An open position as reported by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayPosition {
    pub ticket: u64,
    pub side: OrderSide,
    pub volume: f64,
    pub open_price: f64,
    pub current_price: f64,
    pub profit: f64,
    pub swap: f64,
    pub commission: f64,
    pub open_time: chrono::DateTime<chrono::Utc>,
    pub magic: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AccountInfo {
    pub balance: f64,
    pub equity: f64,
    pub margin: f64,
    pub free_margin: f64,
    pub margin_level: f64,
    pub leverage: u32,
}

#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub order_type: OrderType,
    pub volume: f64,
    pub price: f64,
    pub slippage_points: f64,
    pub magic: u64,
    pub comment: String,
}

/// The return code family MT5-style gateways use: one accepted value, every
/// other integer an opaque rejection reason.
pub const RETCODE_DONE: i32 = 10009;

#[derive(Debug, Clone)]
pub struct SendOrderResponse {
    pub retcode: i32,
    pub ticket: Option<u64>,
    pub price: Option<f64>,
    pub comment: Option<String>,
}

impl SendOrderResponse {
    pub fn is_ok(&self) -> bool {
        self.retcode == RETCODE_DONE
    }
}

/// Errors a gateway call can surface to its caller. Mirrors the taxonomy the
/// rest of the engine uses so a failed gateway call converts directly into an
/// `OrderError`/`EngineError` without an intermediate mapping layer.
#[derive(Debug, Clone)]
pub enum GatewayError {
    NotConnected,
    Timeout,
    Rejected(i32),
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotConnected => write!(f, "gateway not connected"),
            Self::Timeout => write!(f, "gateway call timed out"),
            Self::Rejected(code) => write!(f, "gateway rejected request: {code}"),
        }
    }
}

impl std::error::Error for GatewayError {}

#[async_trait]
pub trait BrokerGateway: Send + Sync {
    /// Current tick for `symbol`, or `None` if the gateway is disconnected.
    async fn tick(&self, symbol: &str) -> Option<Tick>;

    async fn positions(&self, symbol: &str) -> Result<Vec<GatewayPosition>, GatewayError>;

    async fn orders(&self, symbol: &str) -> Result<Vec<PendingOrder>, GatewayError>;

    async fn account_info(&self) -> Result<AccountInfo, GatewayError>;

    async fn send_order(&self, req: OrderRequest) -> Result<SendOrderResponse, GatewayError>;

    async fn close_position(&self, ticket: u64, volume: f64, magic: u64) -> Result<i32, GatewayError>;

    /// Whether the gateway currently believes it holds a live connection.
    fn is_connected(&self) -> bool;
}
