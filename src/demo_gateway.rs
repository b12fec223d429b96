// =============================================================================
// Demo Gateway — in-process paper-trading `BrokerGateway`
// =============================================================================
//
// A real MT5-style terminal connector is out of scope for this crate, and
// there is no broker bridge crate in the Rust ecosystem worth depending on
// for a standalone demo. This is a connected, in-memory broker that fills
// orders immediately against a synthetic random walk, so the engine task
// has something real to drive end to end.
// =============================================================================

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use crate::gateway::{
    AccountInfo, BrokerGateway, GatewayError, GatewayPosition, OrderRequest, OrderSide, OrderType, PendingOrder,
    SendOrderResponse, Tick, RETCODE_DONE,
};

/// Gold point value, shared with the spacing manager and order manager.
const POINT_VALUE: f64 = 0.01;

/// Cheap deterministic xorshift64 — enough jitter for a paper-trading price
/// walk without pulling in a `rand` dependency.
struct XorShift64(u64);

impl XorShift64 {
    fn next_f64(&mut self) -> f64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        (x >> 11) as f64 / (1u64 << 53) as f64
    }
}

struct Inner {
    mid: f64,
    rng: XorShift64,
    positions: Vec<GatewayPosition>,
    orders: Vec<PendingOrder>,
    balance: f64,
}

pub struct DemoGateway {
    symbol: String,
    spread_points: f64,
    next_ticket: AtomicU64,
    connected: AtomicBool,
    magic: u64,
    inner: RwLock<Inner>,
}

impl DemoGateway {
    pub fn new(symbol: impl Into<String>, starting_price: f64, starting_balance: f64, magic: u64) -> Self {
        Self {
            symbol: symbol.into(),
            spread_points: 0.30,
            next_ticket: AtomicU64::new(1),
            connected: AtomicBool::new(true),
            magic,
            inner: RwLock::new(Inner {
                mid: starting_price,
                rng: XorShift64(0x9E3779B97F4A7C15 ^ (starting_price.to_bits())),
                positions: Vec::new(),
                orders: Vec::new(),
                balance: starting_balance,
            }),
        }
    }

    /// Toggle connectivity, for exercising `NotConnected` paths.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    fn step_price(inner: &mut Inner) -> f64 {
        let jitter = (inner.rng.next_f64() - 0.5) * 0.6;
        inner.mid = (inner.mid + jitter).max(1.0);
        inner.mid
    }

    fn mark_to_market(inner: &mut Inner, mid: f64) {
        for pos in inner.positions.iter_mut() {
            let direction = match pos.side {
                OrderSide::Buy => 1.0,
                OrderSide::Sell => -1.0,
            };
            pos.current_price = mid;
            pos.profit = direction * (mid - pos.open_price) * pos.volume * 100.0;
        }
    }
}

#[async_trait]
impl BrokerGateway for DemoGateway {
    async fn tick(&self, symbol: &str) -> Option<Tick> {
        if !self.is_connected() || symbol != self.symbol {
            return None;
        }
        let mut inner = self.inner.write();
        let mid = Self::step_price(&mut inner);
        Self::mark_to_market(&mut inner, mid);
        let half_spread = self.spread_points * POINT_VALUE / 2.0;
        Some(Tick {
            bid: mid - half_spread,
            ask: mid + half_spread,
            time: Utc::now(),
        })
    }

    async fn positions(&self, symbol: &str) -> Result<Vec<GatewayPosition>, GatewayError> {
        if !self.is_connected() {
            return Err(GatewayError::NotConnected);
        }
        Ok(self.inner.read().positions.iter().filter(|_| symbol == self.symbol).cloned().collect())
    }

    async fn orders(&self, symbol: &str) -> Result<Vec<PendingOrder>, GatewayError> {
        if !self.is_connected() {
            return Err(GatewayError::NotConnected);
        }
        Ok(self.inner.read().orders.iter().filter(|_| symbol == self.symbol).cloned().collect())
    }

    async fn account_info(&self) -> Result<AccountInfo, GatewayError> {
        if !self.is_connected() {
            return Err(GatewayError::NotConnected);
        }
        let inner = self.inner.read();
        let floating: f64 = inner.positions.iter().map(|p| p.profit + p.swap + p.commission).sum();
        let margin_used: f64 = inner.positions.iter().map(|p| p.volume * 1000.0).sum();
        let equity = inner.balance + floating;
        Ok(AccountInfo {
            balance: inner.balance,
            equity,
            margin: margin_used,
            free_margin: (equity - margin_used).max(0.0),
            margin_level: if margin_used > 0.0 { equity / margin_used * 100.0 } else { 0.0 },
            leverage: 100,
        })
    }

    async fn send_order(&self, req: OrderRequest) -> Result<SendOrderResponse, GatewayError> {
        if !self.is_connected() {
            return Err(GatewayError::NotConnected);
        }
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.write();

        match req.order_type {
            OrderType::MarketBuy | OrderType::MarketSell => {
                let side = if req.order_type == OrderType::MarketBuy { OrderSide::Buy } else { OrderSide::Sell };
                inner.positions.push(GatewayPosition {
                    ticket,
                    side,
                    volume: req.volume,
                    open_price: req.price,
                    current_price: req.price,
                    profit: 0.0,
                    swap: 0.0,
                    commission: 0.0,
                    open_time: Utc::now(),
                    magic: req.magic,
                });
            }
            _ => {
                inner.orders.push(PendingOrder {
                    ticket,
                    order_type: req.order_type,
                    price: req.price,
                    volume: req.volume,
                });
            }
        }

        Ok(SendOrderResponse {
            retcode: RETCODE_DONE,
            ticket: Some(ticket),
            price: Some(req.price),
            comment: Some(req.comment),
        })
    }

    async fn close_position(&self, ticket: u64, volume: f64, _magic: u64) -> Result<i32, GatewayError> {
        if !self.is_connected() {
            return Err(GatewayError::NotConnected);
        }
        let mut inner = self.inner.write();
        let Some(idx) = inner.positions.iter().position(|p| p.ticket == ticket) else {
            return Err(GatewayError::Rejected(10013));
        };
        let pos = inner.positions.remove(idx);
        inner.balance += pos.profit + pos.swap + pos.commission;
        let _ = volume;
        Ok(RETCODE_DONE)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn market_buy_opens_a_position_and_credits_on_close() {
        let gw = DemoGateway::new("XAUUSD", 2000.0, 10_000.0, 1);
        let resp = gw
            .send_order(OrderRequest {
                symbol: "XAUUSD".into(),
                order_type: OrderType::MarketBuy,
                volume: 0.1,
                price: 2000.0,
                slippage_points: 5.0,
                magic: 1,
                comment: "test".into(),
            })
            .await
            .unwrap();
        assert!(resp.is_ok());
        let ticket = resp.ticket.unwrap();

        let positions = gw.positions("XAUUSD").await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].ticket, ticket);

        let before = gw.account_info().await.unwrap().balance;
        let retcode = gw.close_position(ticket, 0.1, 1).await.unwrap();
        assert_eq!(retcode, RETCODE_DONE);
        assert!(gw.positions("XAUUSD").await.unwrap().is_empty());
        let after = gw.account_info().await.unwrap().balance;
        assert!((after - before).is_finite());
    }

    #[tokio::test]
    async fn disconnected_gateway_rejects_every_call() {
        let gw = DemoGateway::new("XAUUSD", 2000.0, 10_000.0, 1);
        gw.set_connected(false);
        assert!(gw.tick("XAUUSD").await.is_none());
        assert!(matches!(gw.positions("XAUUSD").await, Err(GatewayError::NotConnected)));
        assert!(matches!(gw.account_info().await, Err(GatewayError::NotConnected)));
    }

    #[tokio::test]
    async fn close_unknown_ticket_is_rejected() {
        let gw = DemoGateway::new("XAUUSD", 2000.0, 10_000.0, 1);
        let result = gw.close_position(999, 0.1, 1).await;
        assert!(matches!(result, Err(GatewayError::Rejected(_))));
    }
}
