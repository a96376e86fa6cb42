// =============================================================================
// Binance USDⓈ-M Futures REST adapter — HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. Signed requests
// carry X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift against Binance servers.
// =============================================================================

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use tracing::{debug, warn};

use super::{
    Balance, Bar, Exchange, ExchangePosition, Market, Order, OrderBook, OrderParams, OrderSide,
    OrderType, Ticker,
};
use crate::util::safe_parse_f64;

type HmacSha256 = Hmac<Sha256>;

/// recvWindow sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

/// Binance USDⓈ-M futures REST client.
pub struct BinanceFutures {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
}

impl BinanceFutures {
    /// Create a client against the production fapi endpoint.
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        Self::with_base_url(api_key, secret, "https://fapi.binance.com")
    }

    /// Create a client against an arbitrary base URL (testnet, local stub).
    pub fn with_base_url(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        let api_key = api_key.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .expect("failed to build reqwest client");

        Self {
            api_key,
            secret: secret.into(),
            base_url: base_url.into(),
            client,
        }
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    // -------------------------------------------------------------------------
    // Request helpers
    // -------------------------------------------------------------------------

    async fn get_json(&self, path: &str, query: &str) -> Result<serde_json::Value> {
        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {path} request failed"))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {path} response"))?;

        if !status.is_success() {
            anyhow::bail!("Binance GET {path} returned {status}: {body}");
        }
        Ok(body)
    }

    async fn send_signed(
        &self,
        method: reqwest::Method,
        path: &str,
        params: &str,
    ) -> Result<serde_json::Value> {
        let qs = self.signed_query(params);
        let url = format!("{}{}?{}", self.base_url, path, qs);

        let resp = self
            .client
            .request(method.clone(), &url)
            .send()
            .await
            .with_context(|| format!("{method} {path} request failed"))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {path} response"))?;

        if !status.is_success() {
            anyhow::bail!("Binance {method} {path} returned {status}: {body}");
        }
        Ok(body)
    }

    /// Binance sends numeric values as JSON strings in most payloads.
    fn json_f64(val: &serde_json::Value) -> f64 {
        if let Some(s) = val.as_str() {
            safe_parse_f64(s, 0.0)
        } else {
            val.as_f64().unwrap_or(0.0)
        }
    }
}

#[async_trait]
impl Exchange for BinanceFutures {
    async fn load_markets(&self) -> Result<HashMap<String, Market>> {
        let body = self.get_json("/fapi/v1/exchangeInfo", "").await?;

        let mut markets = HashMap::new();
        if let Some(symbols) = body["symbols"].as_array() {
            for s in symbols {
                let sym = s["symbol"].as_str().unwrap_or("").to_string();
                if sym.is_empty() {
                    continue;
                }
                let contract = s["contractType"].as_str().map(|c| !c.is_empty()).unwrap_or(false);
                markets.insert(sym.clone(), Market { symbol: sym, contract });
            }
        }
        debug!(count = markets.len(), "futures markets loaded");
        Ok(markets)
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        since: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Bar>> {
        let mut query = format!("symbol={symbol}&interval={timeframe}&limit={limit}");
        if let Some(start) = since {
            query.push_str(&format!("&startTime={start}"));
        }

        let body = self.get_json("/fapi/v1/klines", &query).await?;
        let raw = body.as_array().context("klines response is not an array")?;

        let mut bars = Vec::with_capacity(raw.len());
        for entry in raw {
            let arr = match entry.as_array() {
                Some(a) if a.len() >= 6 => a,
                _ => {
                    warn!(symbol, "skipping malformed kline entry");
                    continue;
                }
            };
            bars.push(Bar {
                ts_ms: arr[0].as_i64().unwrap_or(0),
                open: Self::json_f64(&arr[1]),
                high: Self::json_f64(&arr[2]),
                low: Self::json_f64(&arr[3]),
                close: Self::json_f64(&arr[4]),
                volume: Self::json_f64(&arr[5]),
            });
        }
        Ok(bars)
    }

    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker> {
        let book = self
            .get_json("/fapi/v1/ticker/bookTicker", &format!("symbol={symbol}"))
            .await?;
        let last = self
            .get_json("/fapi/v1/ticker/price", &format!("symbol={symbol}"))
            .await?;

        Ok(Ticker {
            symbol: symbol.to_string(),
            last: Self::json_f64(&last["price"]),
            bid: Self::json_f64(&book["bidPrice"]),
            ask: Self::json_f64(&book["askPrice"]),
            ts_ms: last["time"].as_i64().unwrap_or(0),
        })
    }

    async fn fetch_order_book(&self, symbol: &str, limit: usize) -> Result<OrderBook> {
        let body = self
            .get_json("/fapi/v1/depth", &format!("symbol={symbol}&limit={limit}"))
            .await?;

        let parse_side = |side: &serde_json::Value| -> Vec<[f64; 2]> {
            side.as_array()
                .map(|levels| {
                    levels
                        .iter()
                        .filter_map(|lvl| {
                            let arr = lvl.as_array()?;
                            let price = Self::json_f64(arr.first()?);
                            let amount = Self::json_f64(arr.get(1)?);
                            Some([price, amount])
                        })
                        .collect()
                })
                .unwrap_or_default()
        };

        Ok(OrderBook {
            symbol: symbol.to_string(),
            bids: parse_side(&body["bids"]),
            asks: parse_side(&body["asks"]),
            ts_ms: body["T"].as_i64().unwrap_or(0),
        })
    }

    async fn fetch_funding_rate(&self, symbol: &str) -> Result<f64> {
        let body = self
            .get_json("/fapi/v1/premiumIndex", &format!("symbol={symbol}"))
            .await?;
        Ok(Self::json_f64(&body["lastFundingRate"]))
    }

    async fn fetch_balance(&self) -> Result<Balance> {
        let body = self
            .send_signed(reqwest::Method::GET, "/fapi/v2/account", "")
            .await?;

        Ok(Balance {
            total_equity: Self::json_f64(&body["totalMarginBalance"]),
            available: Self::json_f64(&body["availableBalance"]),
        })
    }

    async fn fetch_positions(&self) -> Result<Vec<ExchangePosition>> {
        let body = self
            .send_signed(reqwest::Method::GET, "/fapi/v2/positionRisk", "")
            .await?;

        let raw = body.as_array().context("positionRisk response is not an array")?;
        let mut out = Vec::new();
        for p in raw {
            let size = Self::json_f64(&p["positionAmt"]);
            if size == 0.0 {
                continue;
            }
            out.push(ExchangePosition {
                symbol: p["symbol"].as_str().unwrap_or("").to_string(),
                size,
                entry_price: Self::json_f64(&p["entryPrice"]),
                unrealized_pnl: Self::json_f64(&p["unRealizedProfit"]),
                leverage: Self::json_f64(&p["leverage"]),
            });
        }
        Ok(out)
    }

    async fn create_order(
        &self,
        symbol: &str,
        order_type: OrderType,
        side: OrderSide,
        amount: f64,
        price: Option<f64>,
        params: OrderParams,
    ) -> Result<Order> {
        let type_str = match order_type {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
            OrderType::StopMarket => "STOP_MARKET",
        };
        let side_str = match side {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        };

        let mut query = format!("symbol={symbol}&side={side_str}&type={type_str}&quantity={amount}");
        if let Some(p) = price {
            query.push_str(&format!("&price={p}&timeInForce=GTC"));
        }
        if let Some(stop) = params.stop_price {
            query.push_str(&format!("&stopPrice={stop}"));
        }
        if params.reduce_only {
            query.push_str("&reduceOnly=true");
        }
        if let Some(coid) = &params.client_order_id {
            query.push_str(&format!("&newClientOrderId={coid}"));
        }

        debug!(symbol, side = %side, order_type = type_str, amount, "placing order");

        let body = self
            .send_signed(reqwest::Method::POST, "/fapi/v1/order", &query)
            .await?;

        Ok(Order {
            id: body["orderId"]
                .as_u64()
                .map(|v| v.to_string())
                .unwrap_or_default(),
            client_order_id: body["clientOrderId"].as_str().unwrap_or("").to_string(),
            symbol: symbol.to_string(),
            status: body["status"].as_str().unwrap_or("").to_string(),
            filled: Self::json_f64(&body["executedQty"]),
            average_price: Self::json_f64(&body["avgPrice"]),
        })
    }

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<()> {
        // Numeric ids are exchange order ids; anything else is treated as a
        // client order id.
        let query = if order_id.chars().all(|c| c.is_ascii_digit()) {
            format!("symbol={symbol}&orderId={order_id}")
        } else {
            format!("symbol={symbol}&origClientOrderId={order_id}")
        };

        self.send_signed(reqwest::Method::DELETE, "/fapi/v1/order", &query)
            .await?;
        debug!(symbol, order_id, "order cancelled");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // reqwest pools close on drop; nothing to release explicitly.
        Ok(())
    }
}

impl std::fmt::Debug for BinanceFutures {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceFutures")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_deterministic_hex() {
        let client = BinanceFutures::new("key", "secret");
        let sig = client.sign("symbol=BTCUSDT&timestamp=1700000000000");
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(sig, client.sign("symbol=BTCUSDT&timestamp=1700000000000"));
    }

    #[test]
    fn json_f64_handles_strings_and_numbers() {
        assert_eq!(BinanceFutures::json_f64(&serde_json::json!("42.5")), 42.5);
        assert_eq!(BinanceFutures::json_f64(&serde_json::json!(7)), 7.0);
        assert_eq!(BinanceFutures::json_f64(&serde_json::json!(null)), 0.0);
        assert_eq!(BinanceFutures::json_f64(&serde_json::json!("junk")), 0.0);
    }

    #[test]
    fn debug_redacts_credentials() {
        let client = BinanceFutures::new("my-key", "my-secret");
        let dbg = format!("{client:?}");
        assert!(!dbg.contains("my-key"));
        assert!(!dbg.contains("my-secret"));
    }
}
