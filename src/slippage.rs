// =============================================================================
// Slippage Estimator — pre-entry order book impact check
// =============================================================================
//
// Walks the relevant side of the book until the requested notional is
// filled, computes the volume-weighted effective price, and compares the
// resulting slippage against the configured maximum. An order that cannot be
// filled within the inspected depth is rejected outright.
// =============================================================================

use serde::Serialize;

use crate::brain::Side;
use crate::exchange::OrderBook;
use crate::util::safe_float;

#[derive(Debug, Clone)]
pub struct SlippageConfig {
    pub orderbook_depth: usize,
    /// Assumed slippage when the book is unusable.
    pub default_slippage_pct: f64,
    pub max_slippage_pct: f64,
}

impl Default for SlippageConfig {
    fn default() -> Self {
        Self {
            orderbook_depth: 20,
            default_slippage_pct: 0.001,
            max_slippage_pct: 0.006,
        }
    }
}

/// Result of walking the book for one hypothetical market order.
#[derive(Debug, Clone, Serialize)]
pub struct SlippageEstimate {
    pub side: Side,
    pub amount_usdt: f64,
    pub mid_price: f64,
    pub effective_price: f64,
    pub slippage_pct: f64,
    pub market_impact_pct: f64,
    pub available_liquidity_usdt: f64,
    pub depth_levels_used: usize,
    pub is_acceptable: bool,
    pub reason: String,
}

impl SlippageEstimate {
    fn rejected(side: Side, amount_usdt: f64, mid: f64, default_pct: f64, reason: String) -> Self {
        Self {
            side,
            amount_usdt,
            mid_price: mid,
            effective_price: mid,
            slippage_pct: default_pct,
            market_impact_pct: 0.0,
            available_liquidity_usdt: 0.0,
            depth_levels_used: 0,
            is_acceptable: false,
            reason,
        }
    }
}

/// Estimate the fill quality of a market order for `amount_usdt` notional.
pub fn estimate_slippage(
    book: &OrderBook,
    side: Side,
    amount_usdt: f64,
    config: &SlippageConfig,
) -> SlippageEstimate {
    // Longs lift asks, shorts hit bids.
    let levels = match side {
        Side::Long => &book.asks,
        Side::Short => &book.bids,
    };

    let best_bid = book.bids.first().map(|l| safe_float(l[0], 0.0)).unwrap_or(0.0);
    let best_ask = book.asks.first().map(|l| safe_float(l[0], 0.0)).unwrap_or(0.0);
    if best_bid <= 0.0 || best_ask <= 0.0 {
        return SlippageEstimate::rejected(
            side,
            amount_usdt,
            0.0,
            config.default_slippage_pct,
            "invalid orderbook: no bid/ask".to_string(),
        );
    }
    let mid = (best_bid + best_ask) / 2.0;

    if levels.is_empty() {
        return SlippageEstimate::rejected(
            side,
            amount_usdt,
            mid,
            config.default_slippage_pct,
            "empty orderbook side".to_string(),
        );
    }

    // Walk levels until the notional is filled.
    let depth = config.orderbook_depth;
    let mut remaining = amount_usdt;
    let mut base_filled = 0.0;
    let mut cost = 0.0;
    let mut levels_used = 0;

    for level in levels.iter().take(depth) {
        if remaining <= 0.0 {
            break;
        }
        let price = safe_float(level[0], 0.0);
        let amount = safe_float(level[1], 0.0);
        if price <= 0.0 || amount <= 0.0 {
            continue;
        }

        let level_notional = price * amount;
        if level_notional >= remaining {
            base_filled += remaining / price;
            cost += remaining;
            remaining = 0.0;
        } else {
            base_filled += amount;
            cost += level_notional;
            remaining -= level_notional;
        }
        levels_used += 1;
    }

    let available_liquidity: f64 = levels
        .iter()
        .take(depth)
        .map(|l| safe_float(l[0], 0.0) * safe_float(l[1], 0.0))
        .sum();

    if base_filled <= 0.0 {
        return SlippageEstimate::rejected(
            side,
            amount_usdt,
            mid,
            config.default_slippage_pct,
            "could not fill any amount".to_string(),
        );
    }

    let effective_price = cost / base_filled;
    let slippage_pct = match side {
        Side::Long => (effective_price - mid) / mid,
        Side::Short => (mid - effective_price) / mid,
    };

    let best_price = safe_float(levels[0][0], 0.0);
    let market_impact_pct = if best_price > 0.0 {
        (effective_price - best_price).abs() / best_price
    } else {
        0.0
    };

    let (is_acceptable, reason) = if remaining > 0.0 {
        let filled_pct = (amount_usdt - remaining) / amount_usdt * 100.0;
        (
            false,
            format!("insufficient liquidity: only {filled_pct:.1}% fillable"),
        )
    } else if slippage_pct > config.max_slippage_pct {
        (
            false,
            format!(
                "Slippage {:.3}%>{:.3}%",
                slippage_pct * 100.0,
                config.max_slippage_pct * 100.0
            ),
        )
    } else {
        (true, "OK".to_string())
    };

    SlippageEstimate {
        side,
        amount_usdt,
        mid_price: mid,
        effective_price,
        slippage_pct,
        market_impact_pct,
        available_liquidity_usdt: available_liquidity,
        depth_levels_used: levels_used,
        is_acceptable,
        reason,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn book(bids: Vec<[f64; 2]>, asks: Vec<[f64; 2]>) -> OrderBook {
        OrderBook {
            symbol: "BTCUSDT".to_string(),
            bids,
            asks,
            ts_ms: 0,
        }
    }

    #[test]
    fn tight_book_accepts_small_order() {
        let b = book(vec![[99.9, 100.0]], vec![[100.1, 100.0]]);
        let est = estimate_slippage(&b, Side::Long, 500.0, &SlippageConfig::default());
        assert!(est.is_acceptable, "{}", est.reason);
        assert!(est.slippage_pct < 0.002);
        assert_eq!(est.depth_levels_used, 1);
    }

    #[test]
    fn thin_top_of_book_breaches_slippage_cap() {
        // Top two ask levels are nearly empty; filling 50 USDT must walk to
        // the 102 level, pushing the effective price ~2% past mid.
        let b = book(
            vec![[99.9, 1.0]],
            vec![[100.0, 0.01], [101.0, 0.01], [102.0, 999.0]],
        );
        let est = estimate_slippage(&b, Side::Long, 50.0, &SlippageConfig::default());
        assert!(!est.is_acceptable);
        assert!(est.slippage_pct > 0.006);
        assert!(est.reason.starts_with("Slippage"));
        assert!(est.reason.contains(">0.600%"));
        assert_eq!(est.depth_levels_used, 3);
    }

    #[test]
    fn effective_price_is_volume_weighted() {
        let b = book(vec![[100.0, 10.0]], vec![[100.0, 1.0], [101.0, 1.0]]);
        // Buy 201 USDT: all of level one (100) + 101 at level two.
        let est = estimate_slippage(&b, Side::Long, 201.0, &SlippageConfig::default());
        let expected = 201.0 / (1.0 + 101.0 / 101.0);
        assert!((est.effective_price - expected).abs() < 1e-9);
    }

    #[test]
    fn short_side_walks_bids() {
        let b = book(vec![[100.0, 1.0], [99.0, 50.0]], vec![[100.2, 1.0]]);
        let est = estimate_slippage(&b, Side::Short, 5_000.0, &SlippageConfig::default());
        // Mid ~100.1; selling 5000 USDT sweeps into 99s.
        assert!(est.effective_price < 100.0);
        assert!(est.slippage_pct > 0.0);
    }

    #[test]
    fn insufficient_depth_rejected() {
        let b = book(vec![[99.9, 1.0]], vec![[100.0, 0.1]]);
        let est = estimate_slippage(&b, Side::Long, 1_000.0, &SlippageConfig::default());
        assert!(!est.is_acceptable);
        assert!(est.reason.contains("insufficient liquidity"));
    }

    #[test]
    fn empty_book_rejected() {
        let est = estimate_slippage(
            &book(vec![], vec![]),
            Side::Long,
            100.0,
            &SlippageConfig::default(),
        );
        assert!(!est.is_acceptable);
        assert!(est.reason.contains("invalid orderbook"));
    }

    #[test]
    fn depth_limit_respected() {
        // 30 ask levels but configured depth of 2.
        let asks: Vec<[f64; 2]> = (0..30).map(|i| [100.0 + i as f64, 0.01]).collect();
        let b = book(vec![[99.9, 1.0]], asks);
        let config = SlippageConfig {
            orderbook_depth: 2,
            ..SlippageConfig::default()
        };
        let est = estimate_slippage(&b, Side::Long, 500.0, &config);
        assert!(!est.is_acceptable);
        assert!(est.depth_levels_used <= 2);
    }
}
