// =============================================================================
// Canonical symbol law & NaN-safe numerics
// =============================================================================
//
// Every map in the engine is keyed by the canonical symbol form produced by
// `canon_symbol` ("BTC/USDT:USDT" -> "BTCUSDT"). Exchange-facing call sites
// translate back through the oracle's raw-symbol map.
//
// `safe_float` is applied at every I/O edge so that a NaN from a parse or a
// wire payload can never poison a derived metric downstream.
// =============================================================================

use std::time::{SystemTime, UNIX_EPOCH};

/// Canonicalize a symbol into the engine-wide key form.
///
/// Handles ccxt-style futures decorations and the double-suffix artifact:
///   "BTC/USDT:USDT" -> "BTCUSDT"
///   "BTC/USDT"      -> "BTCUSDT"
///   "btcusdt"       -> "BTCUSDT"
///   "BTCUSDTUSDT"   -> "BTCUSDT"
pub fn canon_symbol(sym: &str) -> String {
    let mut s = sym.trim().to_uppercase();
    if s.is_empty() {
        return String::new();
    }

    s = s
        .replace("/USDT:USDT", "USDT")
        .replace("/USDT", "USDT")
        .replace(":USDT", "USDT")
        .replace(':', "")
        .replace('/', "");

    if s.ends_with("USDTUSDT") {
        s.truncate(s.len() - 4);
    }
    s
}

/// Coerce to a finite float, substituting `default` for NaN/±inf.
pub fn safe_float(x: f64, default: f64) -> f64 {
    if x.is_finite() {
        x
    } else {
        default
    }
}

/// Parse a string into a finite float, substituting `default` on failure.
pub fn safe_parse_f64(s: &str, default: f64) -> f64 {
    match s.trim().parse::<f64>() {
        Ok(v) => safe_float(v, default),
        Err(_) => default,
    }
}

/// Clamp into `[lo, hi]`, coercing NaN to the midpoint-free lower bound.
pub fn clip(x: f64, lo: f64, hi: f64) -> f64 {
    safe_float(x, lo).clamp(lo, hi)
}

/// Current UNIX time in seconds (wall clock).
pub fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Current UNIX time in milliseconds.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
