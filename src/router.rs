// =============================================================================
// Order Router — single choke point between the engine and the venue
// =============================================================================
//
// Every order intent carries a stable client order id (the idempotency key),
// reused verbatim across retries so a timeout followed by a retry can never
// double-fill. Cancels treat "unknown order" as success: cancelling twice is
// a no-op by design of the position state machine.
//
// All request outcomes are reported to `ApiStats` for the kill switch.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};
use uuid::Uuid;

use crate::exchange::{Exchange, Order, OrderParams, OrderSide, OrderType};
use crate::risk::ApiStats;

pub struct OrderRouter {
    ex: Arc<dyn Exchange>,
    api: Arc<ApiStats>,
    retry_sleep: Duration,
}

impl OrderRouter {
    pub fn new(ex: Arc<dyn Exchange>, api: Arc<ApiStats>, retry_sleep_sec: f64) -> Self {
        Self {
            ex,
            api,
            retry_sleep: Duration::from_secs_f64(retry_sleep_sec.max(0.01)),
        }
    }

    /// Fresh idempotency key for a new order intent.
    pub fn new_intent_id() -> String {
        format!("pnm-{}", Uuid::new_v4().simple())
    }

    /// Market order with bounded retries under one idempotency key.
    pub async fn market_order(
        &self,
        raw_symbol: &str,
        side: OrderSide,
        amount: f64,
        reduce_only: bool,
        retries: u32,
        intent_id: &str,
    ) -> Result<Order> {
        let mut last_err = None;

        for attempt in 0..retries.max(1) {
            let params = OrderParams {
                reduce_only,
                stop_price: None,
                client_order_id: Some(intent_id.to_string()),
            };

            match self
                .ex
                .create_order(raw_symbol, OrderType::Market, side, amount, None, params)
                .await
            {
                Ok(order) => {
                    self.api.record_ok();
                    info!(
                        component = "router",
                        symbol = raw_symbol,
                        side = %side,
                        amount,
                        order_id = %order.id,
                        attempt,
                        "market order accepted"
                    );
                    return Ok(order);
                }
                Err(e) => {
                    self.api.record_err();
                    warn!(
                        component = "router",
                        symbol = raw_symbol,
                        side = %side,
                        attempt,
                        error = %e,
                        "market order attempt failed"
                    );
                    last_err = Some(e);
                    tokio::time::sleep(self.retry_sleep).await;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("no attempts made")))
            .with_context(|| format!("market order exhausted retries for {raw_symbol}"))
    }

    /// Reduce-only stop-market order (the hard stop / trailing stop vehicle).
    pub async fn place_stop_market(
        &self,
        raw_symbol: &str,
        side: OrderSide,
        amount: f64,
        stop_price: f64,
        intent_id: &str,
    ) -> Result<Order> {
        let params = OrderParams {
            reduce_only: true,
            stop_price: Some(stop_price),
            client_order_id: Some(intent_id.to_string()),
        };

        match self
            .ex
            .create_order(raw_symbol, OrderType::StopMarket, side, amount, None, params)
            .await
        {
            Ok(order) => {
                self.api.record_ok();
                info!(
                    component = "router",
                    symbol = raw_symbol,
                    side = %side,
                    stop_price,
                    order_id = %order.id,
                    "stop order placed"
                );
                Ok(order)
            }
            Err(e) => {
                self.api.record_err();
                Err(e).with_context(|| format!("stop order failed for {raw_symbol}"))
            }
        }
    }

    /// Idempotent cancel: an already-gone order counts as cancelled.
    pub async fn cancel(&self, order_id: &str, raw_symbol: &str) -> Result<()> {
        match self.ex.cancel_order(order_id, raw_symbol).await {
            Ok(()) => {
                self.api.record_ok();
                Ok(())
            }
            Err(e) => {
                let es = e.to_string();
                if es.contains("-2011") || es.to_lowercase().contains("unknown order") {
                    self.api.record_ok();
                    return Ok(());
                }
                self.api.record_err();
                Err(e).with_context(|| format!("cancel failed for {raw_symbol}/{order_id}"))
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{Balance, Bar, ExchangePosition, Market, OrderBook, Ticker};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Scripted exchange: fails the first N create_order calls, then fills.
    struct FlakyExchange {
        failures_left: Mutex<u32>,
        seen_client_ids: Mutex<Vec<String>>,
        cancel_error: Option<String>,
    }

    impl FlakyExchange {
        fn new(failures: u32) -> Self {
            Self {
                failures_left: Mutex::new(failures),
                seen_client_ids: Mutex::new(Vec::new()),
                cancel_error: None,
            }
        }
    }

    #[async_trait]
    impl Exchange for FlakyExchange {
        async fn load_markets(&self) -> Result<HashMap<String, Market>> {
            Ok(HashMap::new())
        }
        async fn fetch_ohlcv(&self, _: &str, _: &str, _: Option<i64>, _: usize) -> Result<Vec<Bar>> {
            Ok(Vec::new())
        }
        async fn fetch_ticker(&self, _: &str) -> Result<Ticker> {
            Ok(Ticker::default())
        }
        async fn fetch_order_book(&self, _: &str, _: usize) -> Result<OrderBook> {
            Ok(OrderBook::default())
        }
        async fn fetch_funding_rate(&self, _: &str) -> Result<f64> {
            Ok(0.0)
        }
        async fn fetch_balance(&self) -> Result<Balance> {
            Ok(Balance::default())
        }
        async fn fetch_positions(&self) -> Result<Vec<ExchangePosition>> {
            Ok(Vec::new())
        }
        async fn create_order(
            &self,
            symbol: &str,
            _order_type: OrderType,
            _side: OrderSide,
            amount: f64,
            _price: Option<f64>,
            params: OrderParams,
        ) -> Result<Order> {
            if let Some(id) = &params.client_order_id {
                self.seen_client_ids.lock().push(id.clone());
            }
            let mut left = self.failures_left.lock();
            if *left > 0 {
                *left -= 1;
                anyhow::bail!("simulated timeout");
            }
            Ok(Order {
                id: "1001".to_string(),
                client_order_id: params.client_order_id.unwrap_or_default(),
                symbol: symbol.to_string(),
                status: "FILLED".to_string(),
                filled: amount,
                average_price: 100.0,
            })
        }
        async fn cancel_order(&self, _order_id: &str, _symbol: &str) -> Result<()> {
            match &self.cancel_error {
                Some(msg) => anyhow::bail!("{}", msg.clone()),
                None => Ok(()),
            }
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn retries_reuse_the_same_idempotency_key() {
        let ex = Arc::new(FlakyExchange::new(2));
        let router = OrderRouter::new(ex.clone(), Arc::new(ApiStats::new()), 0.01);

        let intent = OrderRouter::new_intent_id();
        let order = router
            .market_order("BTCUSDT", OrderSide::Buy, 1.0, false, 5, &intent)
            .await
            .unwrap();

        assert_eq!(order.status, "FILLED");
        let ids = ex.seen_client_ids.lock().clone();
        assert_eq!(ids.len(), 3); // two failures + one success
        assert!(ids.iter().all(|id| id == &intent));
    }

    #[tokio::test]
    async fn exhausted_retries_surface_the_error() {
        let ex = Arc::new(FlakyExchange::new(10));
        let api = Arc::new(ApiStats::new());
        let router = OrderRouter::new(ex, api.clone(), 0.01);

        let err = router
            .market_order("BTCUSDT", OrderSide::Buy, 1.0, false, 3, &OrderRouter::new_intent_id())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exhausted retries"));
        assert_eq!(api.consecutive_errors(), 3);
    }

    #[tokio::test]
    async fn unknown_order_cancel_is_success() {
        let mut ex = FlakyExchange::new(0);
        ex.cancel_error = Some("Binance DELETE /fapi/v1/order returned 400: {\"code\":-2011,\"msg\":\"Unknown order sent.\"}".to_string());
        let router = OrderRouter::new(Arc::new(ex), Arc::new(ApiStats::new()), 0.01);

        assert!(router.cancel("42", "BTCUSDT").await.is_ok());
    }

    #[tokio::test]
    async fn real_cancel_failure_propagates() {
        let mut ex = FlakyExchange::new(0);
        ex.cancel_error = Some("connection reset".to_string());
        let router = OrderRouter::new(Arc::new(ex), Arc::new(ApiStats::new()), 0.01);

        assert!(router.cancel("42", "BTCUSDT").await.is_err());
    }

    #[test]
    fn intent_ids_are_unique() {
        assert_ne!(OrderRouter::new_intent_id(), OrderRouter::new_intent_id());
    }
}
