// =============================================================================
// WebSocket Stream Manager — per-(stream, symbol) tasks with reconnect
// =============================================================================
//
// One task per (stream kind, symbol). Each task connects, reads until the
// socket drops or errors, then sleeps with exponential backoff (x1.5, capped)
// and reconnects. Cancellation propagates immediately; any other error is
// absorbed by the reconnect loop.
//
// Parsed messages are handed straight to the oracle writers (price, candles,
// book) and the order flow analyzer (book, trades).
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use parking_lot::RwLock;
use tokio_tungstenite::connect_async;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::data::oracle::{DataOracle, Timeframe};
use crate::data::TradeTick;
use crate::exchange::Bar;
use crate::flow::OrderFlowAnalyzer;
use crate::util::{now_ts, safe_parse_f64};

const FUTURES_WS_BASE: &str = "wss://fstream.binance.com/ws";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Ticker,
    Kline,
    Depth,
    Trades,
}

impl StreamKind {
    /// Binance stream suffix for a lowercase symbol.
    fn suffix(self) -> &'static str {
        match self {
            Self::Ticker => "bookTicker",
            Self::Kline => "kline_1m",
            Self::Depth => "depth20@100ms",
            Self::Trades => "aggTrade",
        }
    }

    fn tag(self, symbol: &str) -> String {
        match self {
            Self::Ticker => format!("ticker_{symbol}"),
            Self::Kline => format!("kline_{symbol}_1m"),
            Self::Depth => format!("depth_{symbol}"),
            Self::Trades => format!("trades_{symbol}"),
        }
    }
}

/// Health of a single stream task.
#[derive(Debug, Clone, Default)]
pub struct StreamHealth {
    pub last_update_ts: f64,
    pub message_count: u64,
    pub reconnect_count: u32,
    pub last_error: String,
    pub is_connected: bool,
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub reconnect_delay_sec: f64,
    pub reconnect_max_delay_sec: f64,
    pub reconnect_backoff_mult: f64,
    pub stale_threshold_sec: f64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_sec: 5.0,
            reconnect_max_delay_sec: 300.0,
            reconnect_backoff_mult: 1.5,
            stale_threshold_sec: 60.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct StreamManager {
    config: StreamConfig,
    oracle: Arc<DataOracle>,
    flow: Arc<OrderFlowAnalyzer>,
    health: RwLock<HashMap<String, StreamHealth>>,
    base_url: String,
}

impl StreamManager {
    pub fn new(config: StreamConfig, oracle: Arc<DataOracle>, flow: Arc<OrderFlowAnalyzer>) -> Self {
        Self {
            config,
            oracle,
            flow,
            health: RwLock::new(HashMap::new()),
            base_url: FUTURES_WS_BASE.to_string(),
        }
    }

    pub fn health_snapshot(&self) -> HashMap<String, StreamHealth> {
        self.health.read().clone()
    }

    /// A stream is stale when it has been silent longer than the threshold.
    pub fn is_stale(&self, kind: StreamKind, symbol: &str) -> bool {
        let tag = kind.tag(symbol);
        match self.health.read().get(&tag) {
            Some(h) if h.last_update_ts > 0.0 => {
                now_ts() - h.last_update_ts > self.config.stale_threshold_sec
            }
            _ => true,
        }
    }

    fn touch(&self, tag: &str) {
        let mut health = self.health.write();
        let h = health.entry(tag.to_string()).or_default();
        h.last_update_ts = now_ts();
        h.message_count += 1;
        h.is_connected = true;
    }

    fn note_disconnect(&self, tag: &str, err: &str) {
        let mut health = self.health.write();
        let h = health.entry(tag.to_string()).or_default();
        h.is_connected = false;
        h.reconnect_count += 1;
        h.last_error = err.to_string();
    }

    /// Run one (kind, symbol) stream until cancellation.
    pub async fn run_stream(self: Arc<Self>, cancel: CancellationToken, kind: StreamKind, symbol: String) {
        let tag = kind.tag(&symbol);
        let lower = symbol.to_lowercase();
        let url = format!("{}/{}@{}", self.base_url, lower, kind.suffix());
        let mut delay = self.config.reconnect_delay_sec;

        info!(component = "stream", tag = %tag, url = %url, "stream task started");

        while !cancel.is_cancelled() {
            match self.read_until_error(&cancel, &url, kind, &symbol, &tag).await {
                Ok(()) => break, // cancelled mid-read
                Err(e) => {
                    self.note_disconnect(&tag, &e.to_string());
                    warn!(
                        component = "stream",
                        tag = %tag,
                        error = %e,
                        retry_in_sec = delay,
                        "stream dropped, reconnecting"
                    );
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_secs_f64(delay)) => {}
            }
            delay = (delay * self.config.reconnect_backoff_mult)
                .min(self.config.reconnect_max_delay_sec);
        }

        info!(component = "stream", tag = %tag, "stream task stopped");
    }

    async fn read_until_error(
        &self,
        cancel: &CancellationToken,
        url: &str,
        kind: StreamKind,
        symbol: &str,
        tag: &str,
    ) -> Result<()> {
        let (ws, _resp) = connect_async(url)
            .await
            .context("websocket connect failed")?;
        debug!(component = "stream", tag, "connected");
        {
            let mut health = self.health.write();
            health.entry(tag.to_string()).or_default().is_connected = true;
        }

        let (_write, mut read) = ws.split();

        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                msg = read.next() => msg,
            };

            match msg {
                Some(Ok(tokio_tungstenite::tungstenite::Message::Text(text))) => {
                    self.dispatch(kind, symbol, &text);
                    self.touch(tag);
                }
                // Ping/pong/binary frames are handled by tungstenite.
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
                None => anyhow::bail!("stream ended"),
            }
        }
    }

    fn dispatch(&self, kind: StreamKind, symbol: &str, text: &str) {
        let result = match kind {
            StreamKind::Ticker => parse_book_ticker(text).map(|(last, bid, ask)| {
                self.oracle.update_from_ws_ticker(symbol, last, bid, ask);
            }),
            StreamKind::Kline => parse_kline(text).map(|(tf, bar)| {
                self.oracle.update_from_ws_ohlcv(symbol, tf, bar);
            }),
            StreamKind::Depth => parse_depth(text).map(|(bids, asks)| {
                self.oracle.update_from_ws_orderbook(symbol, &bids, &asks);
                self.flow.update_orderbook(symbol, &bids, &asks, now_ts());
            }),
            StreamKind::Trades => parse_agg_trade(text).map(|tick| {
                self.oracle.update_from_ws_trades(symbol, &[tick]);
                self.flow.update_trades(symbol, &[tick]);
            }),
        };

        if let Err(e) = result {
            error!(component = "stream", symbol, error = %e, "failed to parse stream message");
        }
    }
}

// ---------------------------------------------------------------------------
// Parsers
// ---------------------------------------------------------------------------

fn json_f64(val: &serde_json::Value) -> f64 {
    if let Some(s) = val.as_str() {
        safe_parse_f64(s, 0.0)
    } else {
        val.as_f64().unwrap_or(0.0)
    }
}

/// bookTicker payload: `{"s":"BTCUSDT","b":"...","a":"..."}`. Returns
/// (last, bid, ask) where last is 0 (bookTicker carries no trade price).
fn parse_book_ticker(text: &str) -> Result<(f64, f64, f64)> {
    let v: serde_json::Value = serde_json::from_str(text).context("bookTicker is not JSON")?;
    let bid = json_f64(&v["b"]);
    let ask = json_f64(&v["a"]);
    if bid <= 0.0 || ask <= 0.0 {
        anyhow::bail!("bookTicker missing bid/ask");
    }
    Ok((0.0, bid, ask))
}

/// kline payload: `{"e":"kline","k":{"t":...,"i":"1m","o":"...",...}}`.
fn parse_kline(text: &str) -> Result<(Timeframe, Bar)> {
    let v: serde_json::Value = serde_json::from_str(text).context("kline is not JSON")?;
    let k = &v["k"];

    let tf = match k["i"].as_str().unwrap_or("") {
        "1m" => Timeframe::M1,
        "5m" => Timeframe::M5,
        "15m" => Timeframe::M15,
        other => anyhow::bail!("unsupported kline interval {other:?}"),
    };

    let bar = Bar {
        ts_ms: k["t"].as_i64().context("kline missing open time")?,
        open: json_f64(&k["o"]),
        high: json_f64(&k["h"]),
        low: json_f64(&k["l"]),
        close: json_f64(&k["c"]),
        volume: json_f64(&k["v"]),
    };
    Ok((tf, bar))
}

/// Partial depth payload. Futures streams use `b`/`a`, the REST-style shape
/// uses `bids`/`asks`; both are accepted.
#[allow(clippy::type_complexity)]
fn parse_depth(text: &str) -> Result<(Vec<[f64; 2]>, Vec<[f64; 2]>)> {
    let v: serde_json::Value = serde_json::from_str(text).context("depth is not JSON")?;

    let side = |short: &str, long: &str| -> Vec<[f64; 2]> {
        let levels = v[short].as_array().or_else(|| v[long].as_array());
        levels
            .map(|arr| {
                arr.iter()
                    .filter_map(|lvl| {
                        let pair = lvl.as_array()?;
                        let price = json_f64(pair.first()?);
                        let amount = json_f64(pair.get(1)?);
                        (price > 0.0).then_some([price, amount])
                    })
                    .collect()
            })
            .unwrap_or_default()
    };

    let bids = side("b", "bids");
    let asks = side("a", "asks");
    if bids.is_empty() && asks.is_empty() {
        anyhow::bail!("depth message carries no levels");
    }
    Ok((bids, asks))
}

/// aggTrade payload: `{"e":"aggTrade","p":"...","q":"...","T":...,"m":bool}`.
/// `m` is true when the buyer was the maker, i.e. the aggressor sold.
fn parse_agg_trade(text: &str) -> Result<TradeTick> {
    let v: serde_json::Value = serde_json::from_str(text).context("aggTrade is not JSON")?;
    let price = json_f64(&v["p"]);
    let amount = json_f64(&v["q"]);
    if price <= 0.0 || amount <= 0.0 {
        anyhow::bail!("aggTrade missing price/quantity");
    }
    Ok(TradeTick {
        price,
        amount,
        is_buy: !v["m"].as_bool().unwrap_or(false),
        ts_ms: v["T"].as_i64().unwrap_or(0),
    })
}
