// =============================================================================
// REST pull loops — adaptive-cadence OHLCV and ticker polling
// =============================================================================
//
// Cadence per (symbol, timeframe): base interval x 0.7 when holding a
// position (tight) or x 1.8 when idle (relaxed), stretched by the failure
// streak (1 + 0.35 per consecutive failure, capped at 6x). Rate-limit
// responses (429/418) add a large backoff; other errors a moderate one.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::brain::Brain;
use crate::data::oracle::{DataOracle, Timeframe, MAX_CANDLES};
use crate::exchange::Exchange;
use crate::risk::{ApiStats, HeartbeatMonitor};
use crate::util::now_ms;

/// Max bars requested per gap backfill.
const GAP_BACKFILL_LIMIT: usize = 300;

/// Backoff growth caps (seconds).
const RATE_LIMIT_BACKOFF_STEP: f64 = 60.0;
const RATE_LIMIT_BACKOFF_CAP: f64 = 900.0;
const ERROR_BACKOFF_STEP: f64 = 10.0;
const ERROR_BACKOFF_CAP: f64 = 180.0;

fn is_rate_limited(err: &str) -> bool {
    err.contains("429") || err.contains("418")
}

/// Sleep that yields early on cancellation. Returns false when cancelled.
async fn cancellable_sleep(cancel: &CancellationToken, secs: f64) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(Duration::from_secs_f64(secs.max(0.05))) => true,
    }
}

// ---------------------------------------------------------------------------
// OHLCV loop
// ---------------------------------------------------------------------------

/// Poll one (symbol, timeframe) series until cancelled.
#[allow(clippy::too_many_arguments)]
pub async fn poll_ohlcv_loop(
    ex: Arc<dyn Exchange>,
    oracle: Arc<DataOracle>,
    brain: Brain,
    api: Arc<ApiStats>,
    heartbeat: Arc<HeartbeatMonitor>,
    cancel: CancellationToken,
    symbol: String,
    tf: Timeframe,
) {
    let key = format!("{symbol}_{tf}");
    let mut backoff = 0.0f64;

    while !cancel.is_cancelled() {
        heartbeat.beat("data_loop");
        let in_position = brain.lock().await.positions.contains_key(&symbol);
        let cadence = tf.base_poll_sec() * if in_position { 0.7 } else { 1.8 };
        let penalty = (1.0 + 0.35 * oracle.fail_streak(&key) as f64).min(6.0);
        let sleep_s = ((cadence + backoff) * penalty).max(1.0);

        if !cancellable_sleep(&cancel, sleep_s).await {
            break;
        }

        let raw = oracle.resolve_raw(&symbol);
        match ex.fetch_ohlcv(&raw, tf.as_str(), None, MAX_CANDLES).await {
            Ok(bars) if !bars.is_empty() => {
                api.record_ok();
                oracle.set_series(&symbol, tf, bars);
                backoff = 0.0;

                heal_gaps_once(&*ex, &oracle, &symbol, tf).await;
                if tf == Timeframe::M1 {
                    oracle.maybe_derive_higher_tf(&symbol, now_ms());
                }
            }
            Ok(_) => {
                debug!(component = "data", symbol = %symbol, tf = %tf, "empty OHLCV response");
            }
            Err(e) => {
                api.record_err();
                let es = e.to_string();
                oracle.mark_fail(&key, &es);
                if is_rate_limited(&es) {
                    backoff = (backoff + RATE_LIMIT_BACKOFF_STEP).min(RATE_LIMIT_BACKOFF_CAP);
                    warn!(
                        component = "data",
                        symbol = %symbol,
                        tf = %tf,
                        backoff_sec = backoff,
                        "rate limited, widening poll cadence"
                    );
                } else {
                    backoff = (backoff + ERROR_BACKOFF_STEP).min(ERROR_BACKOFF_CAP);
                    error!(component = "data", symbol = %symbol, tf = %tf, error = %es, "OHLCV poll failed");
                }
            }
        }
    }
}

/// Backfill the first detected gap wider than 1.5x the expected spacing.
async fn heal_gaps_once(
    ex: &dyn Exchange,
    oracle: &DataOracle,
    symbol: &str,
    tf: Timeframe,
) {
    let rows = oracle.get_bars(symbol, tf, false);
    if rows.len() < 3 {
        return;
    }
    let Some(since) = DataOracle::find_gap(&rows, tf.expected_ms()) else {
        return;
    };

    let raw = oracle.resolve_raw(symbol);
    match ex
        .fetch_ohlcv(&raw, tf.as_str(), Some(since), GAP_BACKFILL_LIMIT)
        .await
    {
        Ok(fill) if !fill.is_empty() => {
            oracle.merge_backfill(symbol, tf, fill);
        }
        Ok(_) => {}
        Err(e) => {
            error!(component = "data", symbol, tf = %tf, error = %e, "gap backfill failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Ticker loop
// ---------------------------------------------------------------------------

/// Poll ticker + funding for one symbol until cancelled.
pub async fn poll_ticker_loop(
    ex: Arc<dyn Exchange>,
    oracle: Arc<DataOracle>,
    brain: Brain,
    api: Arc<ApiStats>,
    heartbeat: Arc<HeartbeatMonitor>,
    cancel: CancellationToken,
    symbol: String,
) {
    let mut backoff = 0.0f64;

    while !cancel.is_cancelled() {
        heartbeat.beat("data_loop");
        let in_position = brain.lock().await.positions.contains_key(&symbol);
        let base = if in_position { 3.0 } else { 10.0 };
        let penalty = (1.0 + 0.35 * oracle.fail_streak(&symbol) as f64).min(6.0);
        let sleep_s = ((base + backoff) * penalty).max(1.0);

        if !cancellable_sleep(&cancel, sleep_s).await {
            break;
        }

        let raw = oracle.resolve_raw(&symbol);
        match ex.fetch_ticker(&raw).await {
            Ok(ticker) => {
                api.record_ok();
                oracle.update_from_ws_ticker(&symbol, ticker.last, ticker.bid, ticker.ask);
                backoff = 0.0;

                // Funding rides the ticker cadence; a miss is non-fatal.
                match ex.fetch_funding_rate(&raw).await {
                    Ok(rate) => {
                        oracle.push_funding(&symbol, rate);
                        brain
                            .lock()
                            .await
                            .funding_rate_snapshot
                            .insert(symbol.clone(), rate);
                        if rate.abs() > 0.01 {
                            warn!(component = "data", symbol = %symbol, rate, "extreme funding rate");
                        }
                    }
                    Err(e) => {
                        debug!(component = "data", symbol = %symbol, error = %e, "funding fetch failed");
                    }
                }
            }
            Err(e) => {
                api.record_err();
                let es = e.to_string();
                oracle.mark_fail(&symbol, &es);
                if is_rate_limited(&es) {
                    backoff = (backoff + 2.0 * RATE_LIMIT_BACKOFF_STEP).min(RATE_LIMIT_BACKOFF_CAP);
                    warn!(component = "data", symbol = %symbol, backoff_sec = backoff, "ticker rate limited");
                } else {
                    backoff = (backoff + ERROR_BACKOFF_STEP).min(ERROR_BACKOFF_CAP);
                    error!(component = "data", symbol = %symbol, error = %es, "ticker poll failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_detection() {
        assert!(is_rate_limited("Binance GET /fapi/v1/klines returned 429: {}"));
        assert!(is_rate_limited("IP banned 418"));
        assert!(!is_rate_limited("connection reset by peer"));
    }

    #[test]
    fn backoff_caps() {
        let mut backoff = 0.0f64;
        for _ in 0..100 {
            backoff = (backoff + RATE_LIMIT_BACKOFF_STEP).min(RATE_LIMIT_BACKOFF_CAP);
        }
        assert_eq!(backoff, RATE_LIMIT_BACKOFF_CAP);

        let mut backoff = 0.0f64;
        for _ in 0..100 {
            backoff = (backoff + ERROR_BACKOFF_STEP).min(ERROR_BACKOFF_CAP);
        }
        assert_eq!(backoff, ERROR_BACKOFF_CAP);
    }
}
