// =============================================================================
// Data Oracle — per-symbol/timeframe market cache with staleness truth-guard
// =============================================================================
//
// Two ingestion modes write through the same API: REST pull loops (poll.rs)
// and WebSocket pushes (stream.rs). Readers always get a snapshot copy.
//
// Staleness is tracked against a monotonic clock so wall-clock jumps cannot
// poison ages. The truth-guard (`require_fresh`) returns an empty series
// when a cache cell is older than its threshold — indicators computed on
// nothing produce no signal, which is the point.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::data::TradeTick;
use crate::exchange::{Bar, Market};
use crate::util::{canon_symbol, now_ts, safe_float};

pub const MAX_CANDLES: usize = 1200;
pub const MAX_FUNDING_HIST: usize = 12;

// Staleness thresholds (seconds).
pub const PRICE_STALE_SEC_IN_POS: f64 = 15.0;
pub const PRICE_STALE_SEC_IDLE: f64 = 60.0;
pub const OHLCV_STALE_SEC_1M: f64 = 120.0;
pub const OHLCV_STALE_SEC_5M: f64 = 600.0;
pub const OHLCV_STALE_SEC_15M: f64 = 1800.0;

/// Throttle for re-deriving higher timeframes from 1m data (seconds).
const DERIVE_MIN_INTERVAL_SEC: f64 = 30.0;

pub const CACHE_VERSION: &str = "penumbra-cache-v2";
const ACCEPTED_CACHE_VERSIONS: &[&str] = &["penumbra-cache-v1", CACHE_VERSION];

// =============================================================================
// Timeframe
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    M1,
    M5,
    M15,
}

impl Timeframe {
    pub const ALL: [Timeframe; 3] = [Timeframe::M1, Timeframe::M5, Timeframe::M15];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::M15 => "15m",
        }
    }

    pub fn expected_ms(self) -> i64 {
        match self {
            Self::M1 => 60_000,
            Self::M5 => 300_000,
            Self::M15 => 900_000,
        }
    }

    pub fn stale_sec(self) -> f64 {
        match self {
            Self::M1 => OHLCV_STALE_SEC_1M,
            Self::M5 => OHLCV_STALE_SEC_5M,
            Self::M15 => OHLCV_STALE_SEC_15M,
        }
    }

    /// Base REST poll interval (seconds) before cadence modifiers.
    pub fn base_poll_sec(self) -> f64 {
        match self {
            Self::M1 => 11.0,
            Self::M5 => 45.0,
            Self::M15 => 120.0,
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Telemetry types
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct PollMark {
    wall: f64,
    mono: Instant,
}

/// One stale cache cell in a report.
#[derive(Debug, Clone, Serialize)]
pub struct StaleEntry {
    pub symbol: String,
    /// "ohlcv" or "ticker".
    pub kind: &'static str,
    pub tf: String,
    pub age_sec: f64,
    pub limit_sec: f64,
    pub last_error: String,
    pub fail_streak: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct StaleReport {
    pub ts: f64,
    pub stale: Vec<StaleEntry>,
    pub ok_count: usize,
    pub stale_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FundingTrend {
    Rising,
    Falling,
    Stable,
    Unknown,
}

// =============================================================================
// DataOracle
// =============================================================================

/// The oracle owns its caches; single writer per (symbol, timeframe) cell,
/// many readers, reads return a snapshot of the bounded window.
pub struct DataOracle {
    ohlcv: RwLock<HashMap<(String, Timeframe), Vec<Bar>>>,
    price: RwLock<HashMap<String, f64>>,
    bidask: RwLock<HashMap<String, (f64, f64)>>,
    funding: RwLock<HashMap<String, f64>>,
    funding_history: RwLock<HashMap<String, Vec<f64>>>,

    // Telemetry, keyed "K" (ticker) or "K_1m" (series).
    marks: RwLock<HashMap<String, PollMark>>,
    last_error: RwLock<HashMap<String, String>>,
    fail_streak: RwLock<HashMap<String, u32>>,
    gap_count: RwLock<HashMap<String, u32>>,

    /// Canonical key -> raw exchange symbol used for I/O.
    raw_symbol: RwLock<HashMap<String, String>>,

    /// Per-symbol throttle for higher-timeframe derivation (monotonic secs).
    last_derive: RwLock<HashMap<String, Instant>>,
}

impl Default for DataOracle {
    fn default() -> Self {
        Self::new()
    }
}

impl DataOracle {
    pub fn new() -> Self {
        Self {
            ohlcv: RwLock::new(HashMap::new()),
            price: RwLock::new(HashMap::new()),
            bidask: RwLock::new(HashMap::new()),
            funding: RwLock::new(HashMap::new()),
            funding_history: RwLock::new(HashMap::new()),
            marks: RwLock::new(HashMap::new()),
            last_error: RwLock::new(HashMap::new()),
            fail_streak: RwLock::new(HashMap::new()),
            gap_count: RwLock::new(HashMap::new()),
            raw_symbol: RwLock::new(HashMap::new()),
            last_derive: RwLock::new(HashMap::new()),
        }
    }

    // ── Symbol registry ─────────────────────────────────────────────────

    /// Remember the canonical<->raw mapping, preferring the futures form of
    /// the raw symbol when several are seen.
    pub fn register_symbol(&self, raw: &str) {
        let k = canon_symbol(raw);
        if k.is_empty() || raw.is_empty() {
            return;
        }
        let mut map = self.raw_symbol.write();
        match map.get(&k) {
            None => {
                map.insert(k, raw.to_string());
            }
            Some(cur) => {
                let upgrade = (raw.contains("/USDT:USDT") && !cur.contains("/USDT:USDT"))
                    || (raw.contains(":USDT") && !cur.contains(":USDT"));
                if upgrade {
                    map.insert(k, raw.to_string());
                }
            }
        }
    }

    /// Raw exchange symbol for a canonical key, falling back to the key.
    pub fn resolve_raw(&self, k: &str) -> String {
        self.raw_symbol
            .read()
            .get(k)
            .cloned()
            .unwrap_or_else(|| k.to_string())
    }

    /// Populate the raw-symbol map from exchange market metadata. Called once
    /// at startup after `load_markets()`.
    pub fn bootstrap_markets(&self, markets: &HashMap<String, Market>) {
        for market in markets.values() {
            self.register_symbol(&market.symbol);
        }
        info!(
            component = "oracle",
            mapped = self.raw_symbol.read().len(),
            "markets bootstrapped"
        );
    }

    // ── Telemetry ───────────────────────────────────────────────────────

    fn series_tag(k: &str, tf: Timeframe) -> String {
        format!("{k}_{tf}")
    }

    pub(crate) fn mark_success(&self, key: &str) {
        self.marks.write().insert(
            key.to_string(),
            PollMark {
                wall: now_ts(),
                mono: Instant::now(),
            },
        );
        self.last_error.write().remove(key);
        self.fail_streak.write().insert(key.to_string(), 0);
    }

    pub(crate) fn mark_fail(&self, key: &str, err: &str) {
        self.last_error
            .write()
            .insert(key.to_string(), err.to_string());
        *self.fail_streak.write().entry(key.to_string()).or_insert(0) += 1;
    }

    pub fn fail_streak(&self, key: &str) -> u32 {
        self.fail_streak.read().get(key).copied().unwrap_or(0)
    }

    /// Wall-clock timestamp of the last successful poll for a telemetry key
    /// ("K" for ticker, "K_1m" style for series). For humans and snapshots;
    /// age math always uses the monotonic clock.
    pub fn last_poll_wall(&self, key: &str) -> Option<f64> {
        self.marks.read().get(key).map(|m| m.wall)
    }

    /// Monotonic age of a cache cell in seconds; infinity when never filled.
    pub fn cache_age(&self, sym: &str, tf: Option<Timeframe>) -> f64 {
        let k = canon_symbol(sym);
        let key = match tf {
            Some(tf) => Self::series_tag(&k, tf),
            None => k,
        };
        match self.marks.read().get(&key) {
            Some(mark) => mark.mono.elapsed().as_secs_f64(),
            None => f64::INFINITY,
        }
    }

    // ── Series writes ───────────────────────────────────────────────────

    /// Drop non-finite rows, dedup by timestamp (last wins), sort ascending.
    pub fn normalize_rows(rows: Vec<Bar>) -> Vec<Bar> {
        let mut by_ts: HashMap<i64, Bar> = HashMap::new();
        for bar in rows {
            if bar.ts_ms <= 0 {
                continue;
            }
            let finite = bar.open.is_finite()
                && bar.high.is_finite()
                && bar.low.is_finite()
                && bar.close.is_finite()
                && bar.volume.is_finite();
            if !finite {
                continue;
            }
            by_ts.insert(bar.ts_ms, bar);
        }
        let mut out: Vec<Bar> = by_ts.into_values().collect();
        out.sort_by_key(|b| b.ts_ms);
        out
    }

    /// Replace a series ring with normalized rows (capped to MAX_CANDLES).
    pub fn set_series(&self, sym: &str, tf: Timeframe, rows: Vec<Bar>) {
        let k = canon_symbol(sym);
        if k.is_empty() {
            return;
        }
        let mut rows = Self::normalize_rows(rows);
        if rows.len() > MAX_CANDLES {
            rows.drain(..rows.len() - MAX_CANDLES);
        }
        self.ohlcv.write().insert((k.clone(), tf), rows);
        self.mark_success(&Self::series_tag(&k, tf));
    }

    // ── Reads ───────────────────────────────────────────────────────────

    /// Snapshot of the series. With `require_fresh`, an over-age cell yields
    /// an empty vec — the truth-guard against stale indicators.
    pub fn get_bars(&self, sym: &str, tf: Timeframe, require_fresh: bool) -> Vec<Bar> {
        let k = canon_symbol(sym);
        if require_fresh {
            let age = self.cache_age(&k, Some(tf));
            if age > tf.stale_sec() {
                return Vec::new();
            }
        }
        self.ohlcv
            .read()
            .get(&(k, tf))
            .cloned()
            .unwrap_or_default()
    }

    /// Best-effort price with staleness protection: last trade price first,
    /// then mid(bid, ask); 0.0 when unknown or stale.
    pub fn get_price(&self, sym: &str, in_position: bool) -> f64 {
        let k = canon_symbol(sym);
        let age = self.cache_age(&k, None);
        let limit = if in_position {
            PRICE_STALE_SEC_IN_POS
        } else {
            PRICE_STALE_SEC_IDLE
        };
        if age > limit {
            return 0.0;
        }

        let px = self.price.read().get(&k).copied().unwrap_or(0.0);
        if px > 0.0 {
            return px;
        }
        if let Some(&(bid, ask)) = self.bidask.read().get(&k) {
            if bid > 0.0 && ask > 0.0 {
                return (bid + ask) / 2.0;
            }
        }
        0.0
    }

    pub fn get_bidask(&self, sym: &str) -> (f64, f64) {
        let k = canon_symbol(sym);
        if let Some(&(bid, ask)) = self.bidask.read().get(&k) {
            return (bid, ask);
        }
        let px = self.price.read().get(&k).copied().unwrap_or(0.0);
        if px > 0.0 {
            (px, px)
        } else {
            (0.0, 0.0)
        }
    }

    pub fn get_funding(&self, sym: &str) -> f64 {
        let k = canon_symbol(sym);
        safe_float(self.funding.read().get(&k).copied().unwrap_or(0.0), 0.0)
    }

    pub fn push_funding(&self, sym: &str, rate: f64) {
        let k = canon_symbol(sym);
        if k.is_empty() {
            return;
        }
        let rate = safe_float(rate, 0.0);
        self.funding.write().insert(k.clone(), rate);
        let mut hist = self.funding_history.write();
        let entry = hist.entry(k).or_default();
        entry.push(rate);
        if entry.len() > MAX_FUNDING_HIST {
            let excess = entry.len() - MAX_FUNDING_HIST;
            entry.drain(..excess);
        }
    }

    pub fn funding_trend(&self, sym: &str) -> FundingTrend {
        let k = canon_symbol(sym);
        let hist = self.funding_history.read();
        let Some(h) = hist.get(&k) else {
            return FundingTrend::Unknown;
        };
        if h.len() < 3 {
            return FundingTrend::Unknown;
        }
        let trend = h[h.len() - 1] - h[h.len() - 3];
        if trend > 0.0001 {
            FundingTrend::Rising
        } else if trend < -0.0001 {
            FundingTrend::Falling
        } else {
            FundingTrend::Stable
        }
    }

    // ── Stale reporting ─────────────────────────────────────────────────

    /// Enumerate stale cache cells for the kill switch and logs.
    pub fn get_stale_report(
        &self,
        active_symbols: &[String],
        in_positions: &HashSet<String>,
    ) -> StaleReport {
        let mut stale = Vec::new();
        let mut ok = 0usize;

        let mut sorted: Vec<String> = active_symbols.iter().map(|s| canon_symbol(s)).collect();
        sorted.sort();
        sorted.dedup();

        for k in &sorted {
            for tf in Timeframe::ALL {
                let key = Self::series_tag(k, tf);
                let age = self.cache_age(k, Some(tf));
                let limit = tf.stale_sec();
                if age > limit {
                    stale.push(StaleEntry {
                        symbol: k.clone(),
                        kind: "ohlcv",
                        tf: tf.to_string(),
                        age_sec: age,
                        limit_sec: limit,
                        last_error: self.last_error.read().get(&key).cloned().unwrap_or_default(),
                        fail_streak: self.fail_streak(&key),
                    });
                } else {
                    ok += 1;
                }
            }

            let age = self.cache_age(k, None);
            let limit = if in_positions.contains(k) {
                PRICE_STALE_SEC_IN_POS
            } else {
                PRICE_STALE_SEC_IDLE
            };
            if age > limit {
                stale.push(StaleEntry {
                    symbol: k.clone(),
                    kind: "ticker",
                    tf: String::new(),
                    age_sec: age,
                    limit_sec: limit,
                    last_error: self.last_error.read().get(k).cloned().unwrap_or_default(),
                    fail_streak: self.fail_streak(k),
                });
            } else {
                ok += 1;
            }
        }

        let stale_count = stale.len();
        StaleReport {
            ts: now_ts(),
            stale,
            ok_count: ok,
            stale_count,
        }
    }

    // ── WebSocket writers ───────────────────────────────────────────────

    pub fn update_from_ws_ticker(&self, sym: &str, last: f64, bid: f64, ask: f64) {
        let k = canon_symbol(sym);
        if k.is_empty() {
            return;
        }
        self.register_symbol(sym);

        let last = safe_float(last, 0.0);
        if last > 0.0 {
            self.price.write().insert(k.clone(), last);
        }
        let bid = safe_float(bid, last);
        let ask = safe_float(ask, last);
        if bid > 0.0 && ask > 0.0 {
            self.bidask.write().insert(k.clone(), (bid, ask));
        } else if last > 0.0 {
            self.bidask.write().insert(k.clone(), (last, last));
        }
        self.mark_success(&k);
    }

    /// Push one candle. Equal timestamp replaces the in-progress bar, a
    /// greater timestamp appends (ring capped), an older one is ignored.
    pub fn update_from_ws_ohlcv(&self, sym: &str, tf: Timeframe, bar: Bar) {
        let k = canon_symbol(sym);
        if k.is_empty() || bar.close <= 0.0 || !bar.close.is_finite() {
            return;
        }
        self.register_symbol(sym);

        {
            let mut map = self.ohlcv.write();
            let ring = map.entry((k.clone(), tf)).or_default();
            match ring.last().map(|b| b.ts_ms) {
                None => ring.push(bar),
                Some(last_ts) if bar.ts_ms == last_ts => {
                    // In-progress candle update.
                    let idx = ring.len() - 1;
                    ring[idx] = bar;
                }
                Some(last_ts) if bar.ts_ms > last_ts => {
                    ring.push(bar);
                    if ring.len() > MAX_CANDLES {
                        let excess = ring.len() - MAX_CANDLES;
                        ring.drain(..excess);
                    }
                }
                // Older bar: discard. Ingestion is strictly monotone.
                Some(_) => {}
            }
        }

        self.mark_success(&Self::series_tag(&k, tf));

        if tf == Timeframe::M1 {
            self.maybe_derive_higher_tf(&k, crate::util::now_ms());
        }
    }

    pub fn update_from_ws_orderbook(&self, sym: &str, bids: &[[f64; 2]], asks: &[[f64; 2]]) {
        let k = canon_symbol(sym);
        if k.is_empty() {
            return;
        }
        self.register_symbol(sym);

        let best_bid = bids.first().map(|l| safe_float(l[0], 0.0)).unwrap_or(0.0);
        let best_ask = asks.first().map(|l| safe_float(l[0], 0.0)).unwrap_or(0.0);
        if best_bid > 0.0 && best_ask > 0.0 {
            self.bidask.write().insert(k.clone(), (best_bid, best_ask));
            let mut prices = self.price.write();
            let entry = prices.entry(k.clone()).or_insert(0.0);
            if *entry <= 0.0 {
                *entry = (best_bid + best_ask) / 2.0;
            }
            drop(prices);
            self.mark_success(&k);
        }
    }

    pub fn update_from_ws_trades(&self, sym: &str, trades: &[TradeTick]) {
        let k = canon_symbol(sym);
        if k.is_empty() {
            return;
        }
        self.register_symbol(sym);

        if let Some(last) = trades.last() {
            let price = safe_float(last.price, 0.0);
            if price > 0.0 {
                self.price.write().insert(k.clone(), price);
                self.mark_success(&k);
            }
        }
    }

    // ── Higher-timeframe derivation ─────────────────────────────────────

    /// Throttled resample of the 1m series into 5m and 15m.
    pub fn maybe_derive_higher_tf(&self, k: &str, now_ms: i64) {
        {
            let mut derive = self.last_derive.write();
            if let Some(last) = derive.get(k) {
                if last.elapsed().as_secs_f64() < DERIVE_MIN_INTERVAL_SEC {
                    return;
                }
            }
            derive.insert(k.to_string(), Instant::now());
        }
        self.derive_higher_tf(k, now_ms);
    }

    /// Unthrottled resample, used directly by tests and the poll loop.
    pub fn derive_higher_tf(&self, k: &str, now_ms: i64) {
        let one_min = self.get_bars(k, Timeframe::M1, false);
        if one_min.len() < 10 {
            return;
        }

        let five = resample(&one_min, Timeframe::M5.expected_ms(), now_ms, 60_000);
        if !five.is_empty() {
            self.set_series(k, Timeframe::M5, five.clone());
        }

        let fifteen = resample(&five, Timeframe::M15.expected_ms(), now_ms, 120_000);
        if !fifteen.is_empty() {
            self.set_series(k, Timeframe::M15, fifteen);
        }
        debug!(symbol = k, "higher timeframes derived");
    }

    /// Detect the first gap wider than 1.5x the expected spacing. Returns the
    /// backfill `since` timestamp.
    pub fn find_gap(rows: &[Bar], expected_ms: i64) -> Option<i64> {
        for pair in rows.windows(2) {
            let diff = pair[1].ts_ms - pair[0].ts_ms;
            if diff as f64 > expected_ms as f64 * 1.5 {
                return Some(pair[0].ts_ms + expected_ms);
            }
        }
        None
    }

    /// Merge backfilled rows into a series and note the healed gap.
    pub fn merge_backfill(&self, sym: &str, tf: Timeframe, rows: Vec<Bar>) {
        let k = canon_symbol(sym);
        let mut existing = self.get_bars(&k, tf, false);
        existing.extend(rows);
        self.set_series(&k, tf, existing);
        *self
            .gap_count
            .write()
            .entry(Self::series_tag(&k, tf))
            .or_insert(0) += 1;
        info!(component = "oracle", symbol = %k, tf = %tf, "gap healed");
    }

    // ── Warm-start snapshot ─────────────────────────────────────────────

    /// Persist the OHLCV rings + raw-symbol map + funding history to a JSON
    /// snapshot for warm start.
    pub fn save_snapshot(&self, path: &Path) -> Result<()> {
        let mut series: HashMap<String, Vec<Bar>> = HashMap::new();
        for ((k, tf), rows) in self.ohlcv.read().iter() {
            series.insert(format!("{k}|{tf}"), rows.clone());
        }

        let snapshot = CacheSnapshot {
            version: CACHE_VERSION.to_string(),
            timestamp: now_ts(),
            series,
            funding_history: self.funding_history.read().clone(),
            raw_symbol: self.raw_symbol.read().clone(),
        };

        let json = serde_json::to_string(&snapshot).context("failed to encode cache snapshot")?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &json)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("failed to rename snapshot into {}", path.display()))?;
        info!(component = "oracle", path = %path.display(), "cache snapshot saved");
        Ok(())
    }

    /// Warm-start from a snapshot. Unknown versions are ignored.
    pub fn load_snapshot(&self, path: &Path) -> Result<bool> {
        if !path.exists() {
            return Ok(false);
        }
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let snapshot: CacheSnapshot =
            serde_json::from_str(&json).context("cache snapshot is not valid JSON")?;

        if !ACCEPTED_CACHE_VERSIONS.contains(&snapshot.version.as_str()) {
            warn!(
                component = "oracle",
                version = %snapshot.version,
                "cache snapshot version not accepted, ignoring"
            );
            return Ok(false);
        }

        for (tag, rows) in snapshot.series {
            let Some((sym, tf_str)) = tag.split_once('|') else {
                continue;
            };
            let tf = match tf_str {
                "1m" => Timeframe::M1,
                "5m" => Timeframe::M5,
                "15m" => Timeframe::M15,
                _ => continue,
            };
            // Rows restore the ring but not the freshness mark: a warm start
            // is stale by definition until the first live poll lands.
            let k = canon_symbol(sym);
            if k.is_empty() {
                continue;
            }
            let mut rows = Self::normalize_rows(rows);
            if rows.len() > MAX_CANDLES {
                rows.drain(..rows.len() - MAX_CANDLES);
            }
            self.ohlcv.write().insert((k, tf), rows);
        }

        for (k, hist) in snapshot.funding_history {
            let ck = canon_symbol(&k);
            if ck.is_empty() {
                continue;
            }
            let bounded: Vec<f64> = hist
                .into_iter()
                .map(|v| safe_float(v, 0.0))
                .rev()
                .take(MAX_FUNDING_HIST)
                .rev()
                .collect();
            self.funding_history.write().insert(ck, bounded);
        }

        for (k, raw) in snapshot.raw_symbol {
            let ck = canon_symbol(&k);
            if !ck.is_empty() && !raw.is_empty() {
                self.raw_symbol.write().insert(ck, raw);
            }
        }

        info!(component = "oracle", path = %path.display(), "cache snapshot restored");
        Ok(true)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheSnapshot {
    version: String,
    timestamp: f64,
    /// "SYMBOL|tf" -> rows.
    series: HashMap<String, Vec<Bar>>,
    funding_history: HashMap<String, Vec<f64>>,
    raw_symbol: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// Resampling
// ---------------------------------------------------------------------------

/// Aggregate rows into `bucket_ms` buckets (open=first, high=max, low=min,
/// close=last, volume=sum). The trailing bucket is dropped when younger than
/// `min_trailing_age_ms` — it is still forming.
fn resample(rows: &[Bar], bucket_ms: i64, now_ms: i64, min_trailing_age_ms: i64) -> Vec<Bar> {
    if rows.is_empty() || bucket_ms <= 0 {
        return Vec::new();
    }

    let mut out: Vec<Bar> = Vec::new();
    for bar in rows {
        let bucket_start = (bar.ts_ms / bucket_ms) * bucket_ms;
        match out.last_mut() {
            Some(last) if last.ts_ms == bucket_start => {
                last.high = last.high.max(bar.high);
                last.low = last.low.min(bar.low);
                last.close = bar.close;
                last.volume += bar.volume;
            }
            _ => out.push(Bar {
                ts_ms: bucket_start,
                open: bar.open,
                high: bar.high,
                low: bar.low,
                close: bar.close,
                volume: bar.volume,
            }),
        }
    }

    if let Some(last) = out.last() {
        if now_ms - last.ts_ms < min_trailing_age_ms {
            out.pop();
        }
    }
    out
}
