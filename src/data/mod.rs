// =============================================================================
// Market data — oracle cache, REST pull loops, WebSocket streams
// =============================================================================

pub mod oracle;
pub mod poll;
pub mod stream;

use serde::{Deserialize, Serialize};

pub use oracle::{DataOracle, StaleEntry, StaleReport, Timeframe};

/// One executed trade from the public trade stream.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TradeTick {
    pub price: f64,
    pub amount: f64,
    /// True when the aggressor was a buyer (taker bought).
    pub is_buy: bool,
    pub ts_ms: i64,
}

impl TradeTick {
    pub fn notional(&self) -> f64 {
        self.price * self.amount
    }

    /// Signed notional: positive for aggressive buys.
    pub fn signed_notional(&self) -> f64 {
        if self.is_buy {
            self.notional()
        } else {
            -self.notional()
        }
    }
}
