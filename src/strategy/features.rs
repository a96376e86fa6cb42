// =============================================================================
// Feature extraction — technical, microstructure, and time features
// =============================================================================
//
// Everything here is pure slice math over the oracle's bar snapshots. Every
// value is NaN-sanitized; absent data produces the documented defaults so a
// cold cache can never poison the signal path.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::exchange::Bar;
use crate::flow::FlowAnalysis;
use crate::util::{clip, safe_float};

/// Minimum bars before technical features are computed.
const MIN_BARS: usize = 20;

/// Active-session window (UTC hours, inclusive start / exclusive end).
const SESSION_START_HOUR: u32 = 13;
const SESSION_END_HOUR: u32 = 17;

// =============================================================================
// Feature vector
// =============================================================================

/// Extracted features for one symbol at one instant. Field defaults are the
/// "no data" values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Features {
    // ── Technical ───────────────────────────────────────────────────────
    /// Heikin-Ashi style momentum, clipped to ±10%.
    pub momentum: f64,
    pub momentum_5m: f64,
    pub momentum_15m: f64,
    pub rsi_14: f64,
    /// rsi_14 / 100.
    pub rsi_norm: f64,
    pub stoch_k: f64,
    pub stoch_d: f64,
    pub adx: f64,
    pub bb_width: f64,
    /// Price location within the bands, 0 = lower, 1 = upper.
    pub bb_position: f64,
    pub atr_pct: f64,
    pub atr_50_pct: f64,
    /// Volume z-score clipped to ±3.
    pub volume_z: f64,
    pub volume_ma_ratio: f64,
    /// Distance from EMA200, clipped to ±10%.
    pub ema_distance: f64,
    /// Distance from rolling VWAP, clipped to ±5%.
    pub vwap_distance: f64,
    /// EMA20 slope over 5 bars, clipped to ±5%.
    pub trend_strength: f64,
    pub candle_body_pct: f64,
    pub upper_wick_pct: f64,
    pub lower_wick_pct: f64,

    // ── Microstructure ──────────────────────────────────────────────────
    pub bid_ask_spread: f64,
    pub order_imbalance: f64,
    pub weighted_imbalance: f64,
    pub cvd_signal: f64,
    pub large_buy_volume: f64,
    pub large_sell_volume: f64,

    // ── Time ────────────────────────────────────────────────────────────
    pub hour_sin: f64,
    pub hour_cos: f64,
    pub day_of_week: f64,
    pub is_session_active: f64,
}

impl Default for Features {
    fn default() -> Self {
        Self {
            momentum: 0.0,
            momentum_5m: 0.0,
            momentum_15m: 0.0,
            rsi_14: 50.0,
            rsi_norm: 0.5,
            stoch_k: 50.0,
            stoch_d: 50.0,
            adx: 25.0,
            bb_width: 0.02,
            bb_position: 0.5,
            atr_pct: 0.01,
            atr_50_pct: 0.01,
            volume_z: 0.0,
            volume_ma_ratio: 1.0,
            ema_distance: 0.0,
            vwap_distance: 0.0,
            trend_strength: 0.0,
            candle_body_pct: 0.5,
            upper_wick_pct: 0.25,
            lower_wick_pct: 0.25,
            bid_ask_spread: 0.0,
            order_imbalance: 0.0,
            weighted_imbalance: 0.0,
            cvd_signal: 0.0,
            large_buy_volume: 0.0,
            large_sell_volume: 0.0,
            hour_sin: 0.0,
            hour_cos: 1.0,
            day_of_week: 0.0,
            is_session_active: 0.0,
        }
    }
}

impl Features {
    /// Fixed-order vector for the ML filter. Order is part of the persisted
    /// model contract; append only.
    pub fn to_vector(&self) -> Vec<f64> {
        vec![
            self.momentum,
            self.momentum_5m,
            self.momentum_15m,
            self.rsi_norm,
            self.stoch_k / 100.0,
            self.stoch_d / 100.0,
            self.adx / 50.0,
            self.bb_width,
            self.bb_position,
            self.atr_pct,
            self.atr_50_pct,
            self.volume_z / 3.0,
            self.volume_ma_ratio,
            self.ema_distance,
            self.vwap_distance,
            self.trend_strength,
            self.candle_body_pct,
            self.upper_wick_pct,
            self.lower_wick_pct,
            self.bid_ask_spread,
            self.order_imbalance,
            self.weighted_imbalance,
            self.cvd_signal,
            self.hour_sin,
            self.hour_cos,
            self.is_session_active,
        ]
    }

    /// Fold in microstructure readings from the order flow analyzer.
    pub fn apply_flow(&mut self, flow: &FlowAnalysis, bid: f64, ask: f64) {
        self.order_imbalance = safe_float(flow.imbalance, 0.0);
        self.weighted_imbalance = safe_float(flow.weighted_imbalance, 0.0);
        self.cvd_signal = safe_float(flow.cvd_signal, 0.0);
        self.large_buy_volume = safe_float(flow.large_buy_notional, 0.0);
        self.large_sell_volume = safe_float(flow.large_sell_notional, 0.0);
        if bid > 0.0 && ask > bid {
            let mid = (bid + ask) / 2.0;
            self.bid_ask_spread = safe_float((ask - bid) / mid, 0.0);
        }
    }

    /// Encode the wall clock: cyclic hour, day of week, session flag.
    pub fn apply_time(&mut self, ts: f64) {
        let Some(dt) = chrono::DateTime::from_timestamp(ts as i64, 0) else {
            return;
        };
        use chrono::{Datelike, Timelike};
        let hour = dt.hour() as f64 + dt.minute() as f64 / 60.0;
        let angle = hour / 24.0 * std::f64::consts::TAU;
        self.hour_sin = angle.sin();
        self.hour_cos = angle.cos();
        self.day_of_week = dt.weekday().num_days_from_monday() as f64;
        self.is_session_active =
            if dt.hour() >= SESSION_START_HOUR && dt.hour() < SESSION_END_HOUR {
                1.0
            } else {
                0.0
            };
    }
}

// =============================================================================
// Rolling math helpers
// =============================================================================

fn sma(values: &[f64], period: usize) -> Option<f64> {
    if values.len() < period || period == 0 {
        return None;
    }
    Some(values[values.len() - period..].iter().sum::<f64>() / period as f64)
}

fn stddev(values: &[f64], period: usize) -> Option<f64> {
    let mean = sma(values, period)?;
    let window = &values[values.len() - period..];
    let var = window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / period as f64;
    Some(var.sqrt())
}

fn ema_series(values: &[f64], span: usize) -> Vec<f64> {
    if values.is_empty() || span == 0 {
        return Vec::new();
    }
    let alpha = 2.0 / (span as f64 + 1.0);
    let mut out = Vec::with_capacity(values.len());
    let mut ema = values[0];
    for &v in values {
        ema = alpha * v + (1.0 - alpha) * ema;
        out.push(ema);
    }
    out
}

/// True range series; index i corresponds to bars[i] (i >= 1).
fn true_ranges(bars: &[Bar]) -> Vec<f64> {
    bars.windows(2)
        .map(|w| {
            (w[1].high - w[1].low)
                .max((w[1].high - w[0].close).abs())
                .max((w[1].low - w[0].close).abs())
        })
        .collect()
}

fn rsi(closes: &[f64], period: usize) -> Option<f64> {
    if closes.len() < period + 1 {
        return None;
    }
    let deltas: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();
    let window = &deltas[deltas.len() - period..];
    let gain: f64 = window.iter().filter(|d| **d > 0.0).sum::<f64>() / period as f64;
    let loss: f64 = -window.iter().filter(|d| **d < 0.0).sum::<f64>() / period as f64;
    if loss <= 0.0 {
        return Some(if gain > 0.0 { 100.0 } else { 50.0 });
    }
    let rs = gain / loss;
    Some(100.0 - 100.0 / (1.0 + rs))
}

/// Heikin-Ashi momentum: distance of HA close from its 4-bar mean.
fn ha_momentum(bars: &[Bar]) -> f64 {
    if bars.len() < 5 {
        return 0.0;
    }
    let ha: Vec<f64> = bars
        .iter()
        .map(|b| (b.open + b.high + b.low + b.close) / 4.0)
        .collect();
    let Some(mean) = sma(&ha, 4) else { return 0.0 };
    if mean <= 0.0 {
        return 0.0;
    }
    clip((ha[ha.len() - 1] - mean) / mean, -0.1, 0.1)
}

/// Simplified Wilder ADX on rolling means.
fn adx(bars: &[Bar], period: usize) -> Option<f64> {
    if bars.len() < period * 2 + 1 {
        return None;
    }
    let tr = true_ranges(bars);

    let mut plus_dm = Vec::with_capacity(tr.len());
    let mut minus_dm = Vec::with_capacity(tr.len());
    for w in bars.windows(2) {
        plus_dm.push((w[1].high - w[0].high).max(0.0));
        minus_dm.push((w[0].low - w[1].low).max(0.0));
    }

    let mut dx_series = Vec::new();
    for i in period..=tr.len() {
        let atr: f64 = tr[i - period..i].iter().sum::<f64>() / period as f64;
        if atr <= 0.0 {
            continue;
        }
        let pdi = 100.0 * (plus_dm[i - period..i].iter().sum::<f64>() / period as f64) / atr;
        let mdi = 100.0 * (minus_dm[i - period..i].iter().sum::<f64>() / period as f64) / atr;
        if pdi + mdi <= 0.0 {
            continue;
        }
        dx_series.push(100.0 * (pdi - mdi).abs() / (pdi + mdi));
    }
    sma(&dx_series, period.min(dx_series.len().max(1)))
}

// =============================================================================
// Public API
// =============================================================================

/// Compute technical features from 1m bars, with higher-timeframe momentum
/// from the 5m/15m series. Too little data yields `Features::default()`.
pub fn compute_technical_features(
    bars_1m: &[Bar],
    bars_5m: &[Bar],
    bars_15m: &[Bar],
) -> Features {
    let mut f = Features::default();
    if bars_1m.len() < MIN_BARS {
        return f;
    }

    let closes: Vec<f64> = bars_1m.iter().map(|b| b.close).collect();
    let volumes: Vec<f64> = bars_1m.iter().map(|b| b.volume).collect();
    let last = bars_1m[bars_1m.len() - 1];
    let close = last.close;
    if close <= 0.0 {
        return f;
    }

    // Momentum across timeframes.
    f.momentum = ha_momentum(bars_1m);
    f.momentum_5m = ha_momentum(bars_5m);
    f.momentum_15m = ha_momentum(bars_15m);

    // RSI.
    if let Some(r) = rsi(&closes, 14) {
        f.rsi_14 = safe_float(r, 50.0);
        f.rsi_norm = f.rsi_14 / 100.0;
    }

    // Stochastic oscillator.
    let lookback = &bars_1m[bars_1m.len() - 14.min(bars_1m.len())..];
    let low_14 = lookback.iter().map(|b| b.low).fold(f64::INFINITY, f64::min);
    let high_14 = lookback
        .iter()
        .map(|b| b.high)
        .fold(f64::NEG_INFINITY, f64::max);
    if high_14 > low_14 {
        f.stoch_k = safe_float(100.0 * (close - low_14) / (high_14 - low_14), 50.0);
    }
    // %D: 3-bar smoothing of %K approximated over closes.
    let mut k_series = Vec::new();
    for i in 14..=bars_1m.len() {
        let win = &bars_1m[i - 14..i];
        let lo = win.iter().map(|b| b.low).fold(f64::INFINITY, f64::min);
        let hi = win.iter().map(|b| b.high).fold(f64::NEG_INFINITY, f64::max);
        if hi > lo {
            k_series.push(100.0 * (win[win.len() - 1].close - lo) / (hi - lo));
        }
    }
    if let Some(d) = sma(&k_series, 3.min(k_series.len().max(1))) {
        f.stoch_d = safe_float(d, 50.0);
    }

    // ADX.
    if let Some(a) = adx(bars_1m, 14) {
        f.adx = safe_float(a, 25.0);
    }

    // Bollinger bands.
    if let (Some(mid), Some(sd)) = (sma(&closes, 20), stddev(&closes, 20)) {
        if mid > 0.0 {
            let upper = mid + 2.0 * sd;
            let lower = mid - 2.0 * sd;
            f.bb_width = safe_float((upper - lower) / mid, 0.02);
            let range = upper - lower;
            if range > 0.0 {
                f.bb_position = clip((close - lower) / range, 0.0, 1.0);
            }
        }
    }

    // ATR percentages.
    let tr = true_ranges(bars_1m);
    if let Some(atr14) = sma(&tr, 14.min(tr.len().max(1))) {
        f.atr_pct = safe_float(atr14 / close, 0.01);
    }
    if let Some(atr50) = sma(&tr, 50.min(tr.len().max(1))) {
        f.atr_50_pct = safe_float(atr50 / close, 0.01);
    }

    // Volume statistics.
    if let (Some(vmean), Some(vsd)) = (sma(&volumes, 20), stddev(&volumes, 20)) {
        if vsd > 0.0 {
            f.volume_z = clip((last.volume - vmean) / vsd, -3.0, 3.0);
        }
        if vmean > 0.0 {
            f.volume_ma_ratio = safe_float(last.volume / vmean, 1.0);
        }
    }

    // EMA200 distance.
    let ema200 = ema_series(&closes, 200);
    if let Some(&e) = ema200.last() {
        if e > 0.0 {
            f.ema_distance = clip((close - e) / e, -0.1, 0.1);
        }
    }

    // Rolling VWAP distance.
    let window = 240.min(bars_1m.len());
    let tail = &bars_1m[bars_1m.len() - window..];
    let pv: f64 = tail.iter().map(|b| b.close * b.volume).sum();
    let vol: f64 = tail.iter().map(|b| b.volume).sum();
    if vol > 0.0 {
        let vwap = pv / vol;
        if vwap > 0.0 {
            f.vwap_distance = clip((close - vwap) / vwap, -0.05, 0.05);
        }
    }

    // Trend strength: EMA20 slope over 5 bars.
    let ema20 = ema_series(&closes, 20);
    if ema20.len() >= 5 {
        let prev = ema20[ema20.len() - 5];
        if prev > 0.0 {
            f.trend_strength = clip((ema20[ema20.len() - 1] - prev) / prev, -0.05, 0.05);
        }
    }

    // Candle anatomy.
    let range = last.high - last.low;
    if range > 0.0 {
        f.candle_body_pct = (last.close - last.open).abs() / range;
        f.upper_wick_pct = (last.high - last.open.max(last.close)) / range;
        f.lower_wick_pct = (last.open.min(last.close) - last.low) / range;
    }

    f
}
