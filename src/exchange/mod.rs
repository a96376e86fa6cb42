// =============================================================================
// Exchange adapter seam
// =============================================================================
//
// The engine consumes a venue through this trait only. Amounts are base
// units, prices are quote units, timestamps are milliseconds. The production
// implementation is `binance::BinanceFutures`; tests substitute an in-module
// mock.
// =============================================================================

pub mod binance;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use binance::BinanceFutures;

// ---------------------------------------------------------------------------
// Wire data
// ---------------------------------------------------------------------------

/// One OHLCV row: `[ts_ms, open, high, low, close, volume]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub ts_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub last: f64,
    pub bid: f64,
    pub ask: f64,
    pub ts_ms: i64,
}

/// Price levels are `[price, amount]`, best first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderBook {
    pub symbol: String,
    pub bids: Vec<[f64; 2]>,
    pub asks: Vec<[f64; 2]>,
    pub ts_ms: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Balance {
    pub total_equity: f64,
    pub available: f64,
}

/// Exchange-side view of a position. `size` is signed as reported by the
/// venue; consumers take `abs()` and derive the side.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub symbol: String,
    pub size: f64,
    pub entry_price: f64,
    pub unrealized_pnl: f64,
    pub leverage: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
    StopMarket,
}

/// Extra parameters accepted by `create_order`.
#[derive(Debug, Clone, Default)]
pub struct OrderParams {
    pub reduce_only: bool,
    pub stop_price: Option<f64>,
    /// Stable idempotency key. Resubmitting with the same key must not
    /// produce an additional fill.
    pub client_order_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub status: String,
    pub filled: f64,
    pub average_price: f64,
}

/// Market metadata from `load_markets`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Market {
    /// Venue-native symbol (e.g. "BTC/USDT:USDT").
    pub symbol: String,
    pub contract: bool,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Narrow interface to a derivatives venue. Implementations own their
/// connection pool; callers never mutate adapter configuration after init.
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Symbol -> market metadata.
    async fn load_markets(&self) -> Result<HashMap<String, Market>>;

    /// `since` is an optional ms timestamp lower bound.
    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        since: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Bar>>;

    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker>;

    async fn fetch_order_book(&self, symbol: &str, limit: usize) -> Result<OrderBook>;

    async fn fetch_funding_rate(&self, symbol: &str) -> Result<f64>;

    async fn fetch_balance(&self) -> Result<Balance>;

    async fn fetch_positions(&self) -> Result<Vec<ExchangePosition>>;

    async fn create_order(
        &self,
        symbol: &str,
        order_type: OrderType,
        side: OrderSide,
        amount: f64,
        price: Option<f64>,
        params: OrderParams,
    ) -> Result<Order>;

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<()>;

    /// Release connections. Called once during graceful shutdown.
    async fn close(&self) -> Result<()>;
}
