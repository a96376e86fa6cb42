// =============================================================================
// Order Flow Analyzer — book imbalance, CVD, absorption
// =============================================================================
//
// Per-symbol microstructure state fed by the depth and trade streams.
//
// Signals:
//   imbalance          (sum bids - sum asks) / sum all, top N levels
//   weighted imbalance same, each level weighted 1/(1 + 100*|p-mid|/mid)
//   cvd_signal         clip(cvd delta / cvd range, -1, 1)
//   absorption         50-trade window, price range < 0.2% and one side
//                      >= threshold of volume => BID_/ASK_ABSORPTION
//   composite          0.3*imb + 0.3*weighted + 0.4*cvd (+/- 0.2 absorption)
//
// Anything older than the stale threshold yields (0, Neutral).
// =============================================================================

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use serde::Serialize;

use crate::data::TradeTick;
use crate::util::{canon_symbol, clip, now_ts, safe_float};

const RECENT_TRADES_CAP: usize = 500;
const CVD_HISTORY_CAP: usize = 100;
const LARGE_ORDERS_CAP: usize = 50;
const ABSORPTION_WINDOW: usize = 50;
const ABSORPTION_MAX_RANGE_PCT: f64 = 0.002;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FlowBias {
    Bullish,
    Bearish,
    Neutral,
}

impl std::fmt::Display for FlowBias {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bullish => write!(f, "BULLISH"),
            Self::Bearish => write!(f, "BEARISH"),
            Self::Neutral => write!(f, "NEUTRAL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Absorption {
    Bid,
    Ask,
    None,
}

/// Tunables, copied out of `Config` at construction.
#[derive(Debug, Clone)]
pub struct FlowConfig {
    pub depth_levels: usize,
    pub imbalance_threshold: f64,
    pub large_order_threshold_usdt: f64,
    pub absorption_threshold: f64,
    pub stale_threshold_sec: f64,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            depth_levels: 10,
            imbalance_threshold: 0.6,
            large_order_threshold_usdt: 50_000.0,
            absorption_threshold: 0.7,
            stale_threshold_sec: 30.0,
        }
    }
}

#[derive(Debug, Default)]
struct SymbolFlow {
    bids: Vec<[f64; 2]>,
    asks: Vec<[f64; 2]>,
    last_book_ts: f64,

    trades: VecDeque<TradeTick>,
    cvd: f64,
    cvd_history: VecDeque<f64>,

    large_buys: VecDeque<TradeTick>,
    large_sells: VecDeque<TradeTick>,
}

/// Full per-symbol readout for diagnostics and feature extraction.
#[derive(Debug, Clone, Serialize)]
pub struct FlowAnalysis {
    pub symbol: String,
    pub imbalance: f64,
    pub weighted_imbalance: f64,
    pub cvd: f64,
    pub cvd_signal: f64,
    pub large_buy_notional: f64,
    pub large_sell_notional: f64,
    pub absorption: Absorption,
    pub strength: f64,
    pub bias: FlowBias,
    pub trade_count: usize,
}

// ---------------------------------------------------------------------------
// Analyzer
// ---------------------------------------------------------------------------

pub struct OrderFlowAnalyzer {
    config: FlowConfig,
    state: RwLock<HashMap<String, SymbolFlow>>,
}

impl OrderFlowAnalyzer {
    pub fn new(config: FlowConfig) -> Self {
        Self {
            config,
            state: RwLock::new(HashMap::new()),
        }
    }

    // ── Ingestion ───────────────────────────────────────────────────────

    pub fn update_orderbook(&self, symbol: &str, bids: &[[f64; 2]], asks: &[[f64; 2]], ts: f64) {
        let k = canon_symbol(symbol);
        if k.is_empty() {
            return;
        }
        let mut map = self.state.write();
        let st = map.entry(k).or_default();
        st.bids = bids.to_vec();
        st.asks = asks.to_vec();
        st.last_book_ts = ts;
    }

    pub fn update_trades(&self, symbol: &str, trades: &[TradeTick]) {
        let k = canon_symbol(symbol);
        if k.is_empty() || trades.is_empty() {
            return;
        }
        let mut map = self.state.write();
        let st = map.entry(k).or_default();

        for t in trades {
            if t.price <= 0.0 || t.amount <= 0.0 {
                continue;
            }
            st.trades.push_back(*t);
            while st.trades.len() > RECENT_TRADES_CAP {
                st.trades.pop_front();
            }

            st.cvd += t.signed_notional();

            if t.notional() >= self.config.large_order_threshold_usdt {
                let ring = if t.is_buy {
                    &mut st.large_buys
                } else {
                    &mut st.large_sells
                };
                ring.push_back(*t);
                while ring.len() > LARGE_ORDERS_CAP {
                    ring.pop_front();
                }
            }
        }

        st.cvd_history.push_back(st.cvd);
        while st.cvd_history.len() > CVD_HISTORY_CAP {
            st.cvd_history.pop_front();
        }
    }

    pub fn cvd(&self, symbol: &str) -> f64 {
        let k = canon_symbol(symbol);
        self.state.read().get(&k).map(|s| s.cvd).unwrap_or(0.0)
    }

    // ── Signals ─────────────────────────────────────────────────────────

    /// Plain volume imbalance over the top N levels, in [-1, 1].
    pub fn imbalance(&self, symbol: &str) -> f64 {
        let k = canon_symbol(symbol);
        let map = self.state.read();
        let Some(st) = map.get(&k) else { return 0.0 };

        let depth = self.config.depth_levels;
        let bid_vol: f64 = st.bids.iter().take(depth).map(|l| safe_float(l[1], 0.0)).sum();
        let ask_vol: f64 = st.asks.iter().take(depth).map(|l| safe_float(l[1], 0.0)).sum();

        let total = bid_vol + ask_vol;
        if total <= 0.0 {
            return 0.0;
        }
        (bid_vol - ask_vol) / total
    }

    /// Distance-weighted imbalance: levels near mid price dominate.
    pub fn weighted_imbalance(&self, symbol: &str) -> f64 {
        let k = canon_symbol(symbol);
        let map = self.state.read();
        let Some(st) = map.get(&k) else { return 0.0 };

        let best_bid = st.bids.first().map(|l| l[0]).unwrap_or(0.0);
        let best_ask = st.asks.first().map(|l| l[0]).unwrap_or(0.0);
        if best_bid <= 0.0 || best_ask <= 0.0 {
            return 0.0;
        }
        let mid = (best_bid + best_ask) / 2.0;

        let weight = |price: f64| -> f64 {
            let distance = (price - mid).abs() / mid;
            1.0 / (1.0 + distance * 100.0)
        };

        let depth = self.config.depth_levels;
        let bid_w: f64 = st
            .bids
            .iter()
            .take(depth)
            .filter(|l| l[0] > 0.0)
            .map(|l| safe_float(l[1], 0.0) * weight(l[0]))
            .sum();
        let ask_w: f64 = st
            .asks
            .iter()
            .take(depth)
            .filter(|l| l[0] > 0.0)
            .map(|l| safe_float(l[1], 0.0) * weight(l[0]))
            .sum();

        let total = bid_w + ask_w;
        if total <= 0.0 {
            return 0.0;
        }
        (bid_w - ask_w) / total
    }

    /// CVD delta over the history window normalized by its range, in [-1, 1].
    pub fn cvd_signal(&self, symbol: &str) -> f64 {
        let k = canon_symbol(symbol);
        let map = self.state.read();
        let Some(st) = map.get(&k) else { return 0.0 };

        if st.cvd_history.len() < 10 {
            return 0.0;
        }
        let hist: Vec<f64> = st.cvd_history.iter().copied().collect();
        let min = hist.iter().copied().fold(f64::INFINITY, f64::min);
        let max = hist.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let range = max - min;
        if range <= 0.0 {
            return 0.0;
        }
        let delta = hist[hist.len() - 1] - hist[0];
        clip(delta / range, -1.0, 1.0)
    }

    /// High one-sided volume into a flat price window.
    pub fn detect_absorption(&self, symbol: &str) -> Absorption {
        let k = canon_symbol(symbol);
        let map = self.state.read();
        let Some(st) = map.get(&k) else {
            return Absorption::None;
        };
        if st.bids.is_empty() || st.asks.is_empty() || st.trades.len() < 20 {
            return Absorption::None;
        }

        let window: Vec<&TradeTick> = st
            .trades
            .iter()
            .rev()
            .take(ABSORPTION_WINDOW)
            .collect();

        let mut min_px = f64::INFINITY;
        let mut max_px = f64::NEG_INFINITY;
        let mut buy_vol = 0.0;
        let mut sell_vol = 0.0;
        for t in &window {
            min_px = min_px.min(t.price);
            max_px = max_px.max(t.price);
            if t.is_buy {
                buy_vol += t.notional();
            } else {
                sell_vol += t.notional();
            }
        }

        let total = buy_vol + sell_vol;
        if total <= 0.0 || min_px <= 0.0 {
            return Absorption::None;
        }
        let range_pct = (max_px - min_px) / min_px;
        if range_pct >= ABSORPTION_MAX_RANGE_PCT {
            return Absorption::None;
        }

        let buy_ratio = buy_vol / total;
        if buy_ratio > self.config.absorption_threshold {
            Absorption::Bid
        } else if buy_ratio < 1.0 - self.config.absorption_threshold {
            Absorption::Ask
        } else {
            Absorption::None
        }
    }

    /// Composite flow signal. Stale book data yields `(0.0, Neutral)`.
    pub fn signal(&self, symbol: &str, now: f64) -> (f64, FlowBias) {
        let k = canon_symbol(symbol);
        {
            let map = self.state.read();
            let Some(st) = map.get(&k) else {
                return (0.0, FlowBias::Neutral);
            };
            if st.last_book_ts > 0.0 && now - st.last_book_ts > self.config.stale_threshold_sec {
                return (0.0, FlowBias::Neutral);
            }
        }

        let imbalance = self.imbalance(&k);
        let weighted = self.weighted_imbalance(&k);
        let cvd = self.cvd_signal(&k);
        let absorption = self.detect_absorption(&k);

        let mut combined = imbalance * 0.3 + weighted * 0.3 + cvd * 0.4;
        match absorption {
            Absorption::Bid => combined += 0.2,
            Absorption::Ask => combined -= 0.2,
            Absorption::None => {}
        }

        let bias = if combined > self.config.imbalance_threshold {
            FlowBias::Bullish
        } else if combined < -self.config.imbalance_threshold {
            FlowBias::Bearish
        } else {
            FlowBias::Neutral
        };

        (combined.abs().min(1.0), bias)
    }

    /// Complete readout for one symbol.
    pub fn analysis(&self, symbol: &str, now: f64) -> FlowAnalysis {
        let k = canon_symbol(symbol);
        let (strength, bias) = self.signal(&k, now);

        let (cvd, trade_count, large_buy, large_sell) = {
            let map = self.state.read();
            match map.get(&k) {
                Some(st) => (
                    st.cvd,
                    st.trades.len(),
                    st.large_buys.iter().map(TradeTick::notional).sum(),
                    st.large_sells.iter().map(TradeTick::notional).sum(),
                ),
                None => (0.0, 0, 0.0, 0.0),
            }
        };

        FlowAnalysis {
            symbol: k.clone(),
            imbalance: self.imbalance(&k),
            weighted_imbalance: self.weighted_imbalance(&k),
            cvd,
            cvd_signal: self.cvd_signal(&k),
            large_buy_notional: large_buy,
            large_sell_notional: large_sell,
            absorption: self.detect_absorption(&k),
            strength,
            bias,
            trade_count,
        }
    }
}

impl Default for OrderFlowAnalyzer {
    fn default() -> Self {
        Self::new(FlowConfig::default())
    }
}
