// =============================================================================
// Exit Monitor — the periodic position management tick
// =============================================================================
//
// Every tick (5s default), per position:
//
//   1. mark-to-market from the oracle (truth-guarded price)
//   2. record the favorable extreme (MFE)
//   3. hard-stop reconciliation: re-place a missing initial stop
//   4. TP2 full close / TP1 partial close (by reward multiple)
//   5. breakeven move at >= 1R (cancel stop, replace at entry +/- buffer)
//   6. trailing activation and ratchet (cancel stale ids, cap kept at 20)
//   7. time exit: warn, then force-close
//
// Every exchange-mutating edge is idempotent: order ids live in the Brain,
// cancels tolerate already-gone orders, and closes route through one
// idempotency key per intent.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::brain::persistence::BrainStore;
use crate::brain::state::TRAILING_IDS_CAP;
use crate::brain::{Brain, Position, Side};
use crate::config::Config;
use crate::data::oracle::DataOracle;
use crate::events::{EngineEvent, EventBus};
use crate::exchange::OrderSide;
use crate::exit::time_exit::{self, TimeExitConfig};
use crate::exit::trailing::{self, TrailingConfig};
use crate::router::OrderRouter;
use crate::strategy::MlFilter;
use crate::util::now_ts;

/// Why a position (or part of one) was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    TakeProfit1,
    TakeProfit2,
    TimeLimit,
    EmergencyFlat,
    Reconciled,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TakeProfit1 => write!(f, "tp1"),
            Self::TakeProfit2 => write!(f, "tp2"),
            Self::TimeLimit => write!(f, "time_limit"),
            Self::EmergencyFlat => write!(f, "emergency_flat"),
            Self::Reconciled => write!(f, "reconciled"),
        }
    }
}

pub struct ExitMonitor {
    config: Config,
    brain: Brain,
    store: Arc<BrainStore>,
    oracle: Arc<DataOracle>,
    router: Arc<OrderRouter>,
    events: EventBus,
    ml: Option<Arc<MlFilter>>,

    trailing_config: TrailingConfig,
    time_config: TimeExitConfig,

    /// Current trailing stop price per symbol (rebuilt from MFE after a
    /// restart; the exchange-side orders are the source of truth).
    trail_stops: Mutex<HashMap<String, f64>>,
}

impl ExitMonitor {
    pub fn new(
        config: Config,
        brain: Brain,
        store: Arc<BrainStore>,
        oracle: Arc<DataOracle>,
        router: Arc<OrderRouter>,
        events: EventBus,
        ml: Option<Arc<MlFilter>>,
    ) -> Self {
        let trailing_config = TrailingConfig {
            activation_rr: config.trailing_activation_rr,
            callback_rate_pct: config.trailing_callback_rate_pct,
            vol_mult_min: config.trailing_vol_mult_min,
            vol_mult_max: config.trailing_vol_mult_max,
            atr_reference_pct: config.trailing_atr_reference_pct,
        };
        let time_config = TimeExitConfig {
            enabled: config.time_exit_enabled,
            max_holding_minutes: config.max_holding_minutes,
            warning_minutes: config.time_exit_warning_minutes,
            decay_start_pct: config.time_decay_start_pct,
        };
        Self {
            config,
            brain,
            store,
            oracle,
            router,
            events,
            ml,
            trailing_config,
            time_config,
            trail_stops: Mutex::new(HashMap::new()),
        }
    }

    // ── Tick ────────────────────────────────────────────────────────────

    /// One management pass over every open position.
    pub async fn tick(&self) {
        self.tick_at(now_ts()).await;
    }

    /// Tick against an explicit clock.
    pub async fn tick_at(&self, now: f64) {
        let symbols: Vec<String> = self.brain.lock().await.position_symbols();

        for symbol in symbols {
            if let Err(e) = self.manage_position(&symbol, now).await {
                warn!(component = "exit", symbol = %symbol, error = %e, "position tick failed");
            }
        }
    }

    async fn manage_position(&self, symbol: &str, now: f64) -> anyhow::Result<()> {
        let Some(mut pos) = self.brain.lock().await.positions.get(symbol).cloned() else {
            return Ok(());
        };

        // Truth-guard price: 0.0 means stale, and a blind tick must not act.
        let price = self.oracle.get_price(symbol, true);
        if price <= 0.0 {
            return Ok(());
        }

        // MFE tracking.
        let favorable_pct = pos.side.sign() * (price - pos.entry_price) / pos.entry_price;
        let mfe_pct = {
            let mut state = self.brain.lock().await;
            let perf = state.symbol_performance.entry(symbol.to_string()).or_default();
            perf.mfe_pct = perf.mfe_pct.max(favorable_pct * 100.0);
            perf.mfe_pct
        };

        // Hard-stop reconciliation: the entry's stop may have failed.
        if pos.hard_stop_order_id.is_none() && !pos.breakeven_moved {
            self.replace_hard_stop(symbol, &pos, initial_stop_price(&pos, &self.config))
                .await;
        }

        let rr = pos.rr_multiple(price, self.config.stop_atr_mult);

        // TP2: close everything.
        if rr >= self.config.tp2_rr_mult {
            return self
                .close_full(symbol, &pos, price, now, ExitReason::TakeProfit2)
                .await;
        }

        // TP1: close a fraction once.
        let entry_size = {
            let state = self.brain.lock().await;
            state
                .symbol_performance
                .get(symbol)
                .map(|p| p.entry_size_abs)
                .unwrap_or(pos.size)
        };
        let tp1_taken = pos.size < entry_size * 0.999;
        if rr >= self.config.tp1_rr_mult && !tp1_taken && self.config.tp1_close_fraction > 0.0 {
            self.partial_close(symbol, &pos, price, self.config.tp1_close_fraction)
                .await?;
            // The partial changed the live size; work from the fresh record.
            match self.brain.lock().await.positions.get(symbol).cloned() {
                Some(p) => pos = p,
                None => return Ok(()),
            }
        }

        // Breakeven move at >= 1R.
        if rr >= 1.0 && !pos.breakeven_moved {
            self.move_to_breakeven(symbol, &pos, now).await?;
            match self.brain.lock().await.positions.get(symbol).cloned() {
                Some(p) => pos = p,
                None => return Ok(()),
            }
        }

        // Trailing.
        if rr >= self.trailing_config.activation_rr || pos.trailing_active {
            self.update_trailing(symbol, &pos, mfe_pct, now).await?;
        }

        // Time exit.
        let time_result = time_exit::analyze(&pos, now, &self.time_config);
        if time_result.should_exit {
            return self
                .close_full(symbol, &pos, price, now, ExitReason::TimeLimit)
                .await;
        }
        if time_result.should_warn {
            info!(
                component = "exit",
                symbol,
                remaining_min = format!("{:.0}", time_result.time_remaining_minutes),
                decay = format!("{:.2}", time_result.decay_factor),
                "position approaching time limit"
            );
        }

        Ok(())
    }

    // ── Stops ───────────────────────────────────────────────────────────

    async fn replace_hard_stop(&self, symbol: &str, pos: &Position, stop_price: f64) {
        let raw = self.oracle.resolve_raw(symbol);
        match self
            .router
            .place_stop_market(
                &raw,
                closing_side(pos.side),
                pos.size,
                stop_price,
                &OrderRouter::new_intent_id(),
            )
            .await
        {
            Ok(order) => {
                let mut state = self.brain.lock().await;
                if let Some(p) = state.positions.get_mut(symbol) {
                    p.hard_stop_order_id = Some(order.id);
                }
            }
            Err(e) => {
                warn!(component = "exit", symbol, error = %e, "hard stop re-placement failed");
            }
        }
    }

    async fn move_to_breakeven(&self, symbol: &str, pos: &Position, now: f64) -> anyhow::Result<()> {
        let raw = self.oracle.resolve_raw(symbol);

        // Cancel the existing hard stop first; a duplicate stop is worse
        // than a brief unprotected window on a position already 1R ahead.
        if let Some(stop_id) = &pos.hard_stop_order_id {
            self.router.cancel(stop_id, &raw).await?;
        }

        let buffer = pos.atr * self.config.breakeven_buffer_atr_mult;
        let stop_price = match pos.side {
            Side::Long => pos.entry_price + buffer,
            Side::Short => pos.entry_price - buffer,
        };

        let order = self
            .router
            .place_stop_market(
                &raw,
                closing_side(pos.side),
                pos.size,
                stop_price,
                &OrderRouter::new_intent_id(),
            )
            .await?;

        {
            let mut state = self.brain.lock().await;
            if let Some(p) = state.positions.get_mut(symbol) {
                p.hard_stop_order_id = Some(order.id);
                p.breakeven_moved = true;
                p.last_breakeven_move = now;
            }
        }

        self.events.publish(EngineEvent::BreakevenMoved {
            symbol: symbol.to_string(),
            stop_price,
        });
        info!(component = "exit", symbol, stop_price, "stop moved to breakeven");
        Ok(())
    }

    async fn update_trailing(
        &self,
        symbol: &str,
        pos: &Position,
        mfe_pct: f64,
        now: f64,
    ) -> anyhow::Result<()> {
        let extreme_price = pos.entry_price * (1.0 + pos.side.sign() * mfe_pct / 100.0);
        let atr_pct = if pos.entry_price > 0.0 {
            pos.atr / pos.entry_price
        } else {
            0.0
        };

        let current = self.trail_stops.lock().get(symbol).copied();
        let Some(new_stop) = trailing::next_trailing_stop(
            pos.side,
            extreme_price,
            atr_pct,
            current,
            &self.trailing_config,
        ) else {
            return Ok(());
        };

        let raw = self.oracle.resolve_raw(symbol);

        // Cancel stale trailing orders before placing the replacement.
        let stale_ids: Vec<String> = {
            let state = self.brain.lock().await;
            state
                .symbol_performance
                .get(symbol)
                .map(|p| p.trailing_order_ids.clone())
                .unwrap_or_default()
        };
        for id in &stale_ids {
            if let Err(e) = self.router.cancel(id, &raw).await {
                warn!(component = "exit", symbol, order_id = %id, error = %e, "stale trailing cancel failed");
            }
        }

        let order = self
            .router
            .place_stop_market(
                &raw,
                closing_side(pos.side),
                pos.size,
                new_stop,
                &OrderRouter::new_intent_id(),
            )
            .await?;

        {
            let mut state = self.brain.lock().await;
            if let Some(p) = state.positions.get_mut(symbol) {
                p.trailing_active = true;
            }
            let perf = state.symbol_performance.entry(symbol.to_string()).or_default();
            perf.trailing_order_ids.clear();
            perf.trailing_order_ids.push(order.id);
            if perf.trailing_order_ids.len() > TRAILING_IDS_CAP {
                let excess = perf.trailing_order_ids.len() - TRAILING_IDS_CAP;
                perf.trailing_order_ids.drain(..excess);
            }
            perf.last_trail_ts = now;
        }
        self.trail_stops.lock().insert(symbol.to_string(), new_stop);

        self.events.publish(EngineEvent::TrailingUpdated {
            symbol: symbol.to_string(),
            stop_price: new_stop,
        });
        info!(component = "exit", symbol, stop_price = new_stop, "trailing stop advanced");
        Ok(())
    }

    // ── Closes ──────────────────────────────────────────────────────────

    async fn partial_close(
        &self,
        symbol: &str,
        pos: &Position,
        price: f64,
        fraction: f64,
    ) -> anyhow::Result<()> {
        let close_size = pos.size * fraction.clamp(0.0, 1.0);
        if close_size <= 0.0 {
            return Ok(());
        }

        let raw = self.oracle.resolve_raw(symbol);
        let order = self
            .router
            .market_order(
                &raw,
                closing_side(pos.side),
                close_size,
                true,
                self.config.entry_router_retries,
                &OrderRouter::new_intent_id(),
            )
            .await?;

        let fill_price = if order.average_price > 0.0 {
            order.average_price
        } else {
            price
        };

        let realized = {
            let mut state = self.brain.lock().await;
            state.note_exit_order(&order.id);
            state.reduce_position(symbol, close_size, fill_price)
        };

        info!(
            component = "exit",
            symbol,
            close_size,
            fill_price,
            realized = realized.unwrap_or(0.0),
            reason = %ExitReason::TakeProfit1,
            "partial close executed"
        );
        Ok(())
    }

    /// Close the whole position at market and settle the books.
    pub async fn close_full(
        &self,
        symbol: &str,
        pos: &Position,
        price: f64,
        now: f64,
        reason: ExitReason,
    ) -> anyhow::Result<()> {
        let raw = self.oracle.resolve_raw(symbol);

        // Best-effort cancel of resting stops before the market close.
        let (stop_id, trail_ids) = {
            let state = self.brain.lock().await;
            (
                state
                    .positions
                    .get(symbol)
                    .and_then(|p| p.hard_stop_order_id.clone()),
                state
                    .symbol_performance
                    .get(symbol)
                    .map(|p| p.trailing_order_ids.clone())
                    .unwrap_or_default(),
            )
        };
        if let Some(id) = stop_id {
            let _ = self.router.cancel(&id, &raw).await;
        }
        for id in trail_ids {
            let _ = self.router.cancel(&id, &raw).await;
        }

        let order = self
            .router
            .market_order(
                &raw,
                closing_side(pos.side),
                pos.size,
                true,
                self.config.entry_router_retries,
                &OrderRouter::new_intent_id(),
            )
            .await?;

        let fill_price = if order.average_price > 0.0 {
            order.average_price
        } else {
            price
        };

        self.settle_close(symbol, fill_price, now, reason, Some(order.id))
            .await;
        Ok(())
    }

    /// Book a close into the Brain: counters, streaks, blacklist, ML label,
    /// events, persistence. Exchange-side work must already be done (or be
    /// known unnecessary, as in reconciliation).
    pub async fn settle_close(
        &self,
        symbol: &str,
        fill_price: f64,
        now: f64,
        reason: ExitReason,
        exit_order_id: Option<String>,
    ) {
        let mut blacklisted_until = None;
        let realized = {
            let mut state = self.brain.lock().await;

            // Idempotence: a known exit order id means this fill is already
            // booked.
            if let Some(id) = &exit_order_id {
                if !state.note_exit_order(id) {
                    return;
                }
            }

            let prev_streak = state.win_streak;
            let Some(realized) = state.close_position(symbol, fill_price, now) else {
                return;
            };

            if realized < 0.0 {
                if prev_streak > 0 {
                    let today = state
                        .current_day
                        .map(|d| d.to_string())
                        .unwrap_or_default();
                    state.record_streak(&today, prev_streak, realized);
                }
                let losses = state.mark_loss(symbol);
                if losses >= self.config.consecutive_loss_blacklist_count {
                    let ttl = self.config.symbol_blacklist_duration_hours * 3_600.0;
                    state.blacklist_symbol(
                        symbol,
                        ttl,
                        &format!("{losses} consecutive losses"),
                        now,
                    );
                    blacklisted_until = Some(now + ttl);
                }
            }
            realized
        };

        self.trail_stops.lock().remove(symbol);

        if let Some(ml) = &self.ml {
            ml.resolve_entry(symbol, realized > 0.0);
        }

        self.events.publish(EngineEvent::PositionClosed {
            symbol: symbol.to_string(),
            reason: reason.to_string(),
            pnl: realized,
        });
        if let Some(until_ts) = blacklisted_until {
            self.events.publish(EngineEvent::Blacklisted {
                symbol: symbol.to_string(),
                reason: "consecutive losses".to_string(),
                until_ts,
            });
        }

        info!(
            component = "exit",
            symbol,
            fill_price,
            realized,
            reason = %reason,
            "position closed"
        );

        let snapshot = self.brain.lock().await.clone();
        if let Err(e) = self.store.save(&snapshot, false).await {
            warn!(component = "exit", error = %e, "brain save after close failed");
        }
    }

    /// Best-effort market close of everything (kill-switch escalation).
    pub async fn emergency_flat(&self, now: f64) -> usize {
        let symbols = self.brain.lock().await.position_symbols();
        let mut closed = 0;

        for symbol in &symbols {
            let Some(pos) = self.brain.lock().await.positions.get(symbol).cloned() else {
                continue;
            };
            // Even a stale price is acceptable here; flattening beats
            // precision when the governor has escalated.
            let price = {
                let p = self.oracle.get_price(symbol, true);
                if p > 0.0 {
                    p
                } else {
                    pos.entry_price
                }
            };
            match self
                .close_full(symbol, &pos, price, now, ExitReason::EmergencyFlat)
                .await
            {
                Ok(()) => closed += 1,
                Err(e) => {
                    warn!(component = "exit", symbol = %symbol, error = %e, "emergency close failed");
                }
            }
        }

        self.events.publish(EngineEvent::EmergencyFlat { positions: closed });
        closed
    }
}

fn closing_side(side: Side) -> OrderSide {
    match side {
        Side::Long => OrderSide::Sell,
        Side::Short => OrderSide::Buy,
    }
}

/// Initial hard stop: ATR distance clamped to the maximum stop percent.
fn initial_stop_price(pos: &Position, config: &Config) -> f64 {
    let dist = (pos.atr * config.stop_atr_mult).min(pos.entry_price * config.max_stop_pct);
    match pos.side {
        Side::Long => pos.entry_price - dist,
        Side::Short => pos.entry_price + dist,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::brain::{new_brain, BrainState};
    use crate::exchange::{
        Balance, Bar, Exchange, ExchangePosition, Market, Order, OrderBook, OrderParams,
        OrderType, Ticker,
    };
    use crate::risk::ApiStats;
    use async_trait::async_trait;
    use std::collections::HashMap as StdHashMap;

    /// Records every order and cancel; always fills.
    #[derive(Default)]
    struct RecordingExchange {
        orders: Mutex<Vec<(String, OrderType, OrderSide, f64, Option<f64>)>>,
        cancels: Mutex<Vec<String>>,
        next_id: Mutex<u64>,
    }

    #[async_trait]
    impl Exchange for RecordingExchange {
        async fn load_markets(&self) -> anyhow::Result<StdHashMap<String, Market>> {
            Ok(StdHashMap::new())
        }
        async fn fetch_ohlcv(
            &self,
            _: &str,
            _: &str,
            _: Option<i64>,
            _: usize,
        ) -> anyhow::Result<Vec<Bar>> {
            Ok(Vec::new())
        }
        async fn fetch_ticker(&self, _: &str) -> anyhow::Result<Ticker> {
            Ok(Ticker::default())
        }
        async fn fetch_order_book(&self, _: &str, _: usize) -> anyhow::Result<OrderBook> {
            Ok(OrderBook::default())
        }
        async fn fetch_funding_rate(&self, _: &str) -> anyhow::Result<f64> {
            Ok(0.0)
        }
        async fn fetch_balance(&self) -> anyhow::Result<Balance> {
            Ok(Balance::default())
        }
        async fn fetch_positions(&self) -> anyhow::Result<Vec<ExchangePosition>> {
            Ok(Vec::new())
        }
        async fn create_order(
            &self,
            symbol: &str,
            order_type: OrderType,
            side: OrderSide,
            amount: f64,
            _price: Option<f64>,
            params: OrderParams,
        ) -> anyhow::Result<Order> {
            self.orders.lock().push((
                symbol.to_string(),
                order_type,
                side,
                amount,
                params.stop_price,
            ));
            let mut id = self.next_id.lock();
            *id += 1;
            Ok(Order {
                id: id.to_string(),
                client_order_id: params.client_order_id.unwrap_or_default(),
                symbol: symbol.to_string(),
                status: "FILLED".to_string(),
                filled: amount,
                average_price: 0.0,
            })
        }
        async fn cancel_order(&self, order_id: &str, _symbol: &str) -> anyhow::Result<()> {
            self.cancels.lock().push(order_id.to_string());
            Ok(())
        }
        async fn close(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        monitor: ExitMonitor,
        brain: Brain,
        oracle: Arc<DataOracle>,
        ex: Arc<RecordingExchange>,
    }

    fn fixture() -> Fixture {
        let config = Config::default();
        let dir = tempfile::tempdir().unwrap();
        let brain = new_brain(BrainState::new());
        let oracle = Arc::new(DataOracle::new());
        let ex = Arc::new(RecordingExchange::default());
        let ex_dyn: Arc<dyn Exchange> = ex.clone();
        let router = Arc::new(OrderRouter::new(ex_dyn, Arc::new(ApiStats::new()), 0.01));

        let monitor = ExitMonitor::new(
            config,
            brain.clone(),
            Arc::new(BrainStore::new(dir.path().join("brain.lz4"))),
            oracle.clone(),
            router,
            EventBus::new(),
            None,
        );
        Fixture {
            monitor,
            brain,
            oracle,
            ex,
        }
    }

    async fn open_long(fx: &Fixture, symbol: &str, entry: f64, atr: f64) {
        let mut state = fx.brain.lock().await;
        state.apply_fill(symbol, Side::Long, 1.0, entry, atr, 20, 0.8, 1_000.0);
        if let Some(p) = state.positions.get_mut(symbol) {
            p.hard_stop_order_id = Some("stop-1".to_string());
        }
    }

    fn set_price(fx: &Fixture, symbol: &str, price: f64) {
        fx.oracle
            .update_from_ws_ticker(symbol, price, price - 0.01, price + 0.01);
    }

    #[tokio::test]
    async fn stale_price_means_no_action() {
        let fx = fixture();
        open_long(&fx, "BTCUSDT", 100.0, 1.0).await;
        // No ticker update at all: the tick must not touch the exchange.
        fx.monitor.tick_at(1_100.0).await;
        assert!(fx.ex.orders.lock().is_empty());
        assert!(fx.ex.cancels.lock().is_empty());
    }

    #[tokio::test]
    async fn breakeven_moves_once_at_one_r() {
        let fx = fixture();
        open_long(&fx, "BTCUSDT", 100.0, 1.0).await;
        // stop_atr_mult 1.10 -> 1R at 101.1. Price 101.2 clears it but stays
        // under both TP1 sizing effects and the 1.3R trailing activation.
        set_price(&fx, "BTCUSDT", 101.2);

        fx.monitor.tick_at(1_100.0).await;

        // Old stop cancelled, new stop placed at entry + 0.30 * atr.
        let cancels = fx.ex.cancels.lock().clone();
        assert!(cancels.contains(&"stop-1".to_string()));

        let orders = fx.ex.orders.lock().clone();
        let stop_orders: Vec<_> = orders
            .iter()
            .filter(|(_, t, _, _, _)| *t == OrderType::StopMarket)
            .collect();
        assert_eq!(stop_orders.len(), 1);
        let (_, _, side, _, stop) = stop_orders[0];
        assert_eq!(*side, OrderSide::Sell);
        assert!((stop.unwrap() - 100.30).abs() < 1e-9);

        let state = fx.brain.lock().await;
        let pos = state.positions.get("BTCUSDT").unwrap();
        assert!(pos.breakeven_moved);
    }

    #[tokio::test]
    async fn trailing_activates_and_ratchets() {
        let fx = fixture();
        open_long(&fx, "BTCUSDT", 100.0, 1.0).await;

        {
            // Pre-mark breakeven and TP1 so only trailing fires.
            let mut state = fx.brain.lock().await;
            state.positions.get_mut("BTCUSDT").unwrap().breakeven_moved = true;
            let perf = state
                .symbol_performance
                .entry("BTCUSDT".to_string())
                .or_default();
            perf.entry_size_abs = 2.0; // size 1.0 < 2.0 => TP1 already taken
        }

        // 1.3R with stop_atr_mult 1.10 is 101.43; 101.5 activates trailing.
        set_price(&fx, "BTCUSDT", 101.5);
        fx.monitor.tick_at(1_100.0).await;

        let first_stop = {
            let state = fx.brain.lock().await;
            let perf = state.symbol_performance.get("BTCUSDT").unwrap();
            assert_eq!(perf.trailing_order_ids.len(), 1);
            assert!(state.positions.get("BTCUSDT").unwrap().trailing_active);
            *fx.monitor.trail_stops.lock().get("BTCUSDT").unwrap()
        };

        // New extreme: stale trailing order cancelled, stop ratchets up.
        set_price(&fx, "BTCUSDT", 102.0);
        fx.monitor.tick_at(1_100.0).await;

        let state = fx.brain.lock().await;
        let perf = state.symbol_performance.get("BTCUSDT").unwrap();
        assert_eq!(perf.trailing_order_ids.len(), 1);
        assert!(perf.trailing_order_ids.len() <= TRAILING_IDS_CAP);
        let second_stop = *fx.monitor.trail_stops.lock().get("BTCUSDT").unwrap();
        assert!(second_stop > first_stop);
        // The first trailing order was cancelled.
        assert!(!fx.ex.cancels.lock().is_empty());
        // MFE recorded.
        assert!(perf.mfe_pct >= 2.0 - 1e-9);
    }

    #[tokio::test]
    async fn tp1_partial_then_tp2_full_close() {
        let fx = fixture();
        open_long(&fx, "BTCUSDT", 100.0, 1.0).await;
        {
            let mut state = fx.brain.lock().await;
            state.positions.get_mut("BTCUSDT").unwrap().breakeven_moved = true;
        }

        // TP1 at 1R (101.1): partial close of 60%.
        set_price(&fx, "BTCUSDT", 101.15);
        fx.monitor.tick_at(1_100.0).await;
        {
            let state = fx.brain.lock().await;
            let pos = state.positions.get("BTCUSDT").unwrap();
            assert!((pos.size - 0.4).abs() < 1e-9);
            // Not counted as a completed trade yet.
            assert_eq!(state.total_trades, 0);
        }

        // TP2 at 2R (102.2): remainder closes and the trade is booked.
        set_price(&fx, "BTCUSDT", 102.3);
        fx.monitor.tick_at(1_100.0).await;
        let state = fx.brain.lock().await;
        assert!(state.positions.is_empty());
        assert_eq!(state.total_trades, 1);
        assert_eq!(state.total_wins, 1);
        assert!(state.last_exit_time.contains_key("BTCUSDT"));
    }

    #[tokio::test]
    async fn losing_close_blacklists_after_streak() {
        let fx = fixture();
        open_long(&fx, "BTCUSDT", 100.0, 1.0).await;
        {
            let mut state = fx.brain.lock().await;
            // Two prior losses: one more blacklists at the default count of 3.
            state.consecutive_losses.insert("BTCUSDT".to_string(), 2);
        }

        let now = 1_000.0 + 241.0 * 60.0;
        let pos = fx
            .brain
            .lock()
            .await
            .positions
            .get("BTCUSDT")
            .cloned()
            .unwrap();
        fx.monitor
            .close_full("BTCUSDT", &pos, 99.5, now, ExitReason::TimeLimit)
            .await
            .unwrap();

        let state = fx.brain.lock().await;
        assert!(state.positions.is_empty());
        assert!(state.is_blacklisted("BTCUSDT", now + 10.0));
        assert_eq!(state.consecutive_losses.get("BTCUSDT"), Some(&3));
        assert_eq!(state.total_trades, 1);
        assert_eq!(state.total_wins, 0);
    }

    #[tokio::test]
    async fn settle_close_is_idempotent_per_exit_order() {
        let fx = fixture();
        open_long(&fx, "BTCUSDT", 100.0, 1.0).await;

        fx.monitor
            .settle_close("BTCUSDT", 105.0, 2_000.0, ExitReason::Reconciled, Some("x-1".into()))
            .await;
        // Replay of the same exit order: no double accounting.
        fx.monitor
            .settle_close("BTCUSDT", 105.0, 2_000.0, ExitReason::Reconciled, Some("x-1".into()))
            .await;

        let state = fx.brain.lock().await;
        assert_eq!(state.total_trades, 1);
    }

    #[tokio::test]
    async fn missing_hard_stop_is_replaced() {
        let fx = fixture();
        {
            let mut state = fx.brain.lock().await;
            state.apply_fill("BTCUSDT", Side::Long, 1.0, 100.0, 1.0, 20, 0.8, 1_000.0);
            // Entry failed to place the stop.
        }
        set_price(&fx, "BTCUSDT", 100.1);

        fx.monitor.tick_at(1_100.0).await;

        let orders = fx.ex.orders.lock().clone();
        assert_eq!(orders.len(), 1);
        let (_, otype, _, _, stop) = &orders[0];
        assert_eq!(*otype, OrderType::StopMarket);
        // 1.10 ATR below entry.
        assert!((stop.unwrap() - 98.9).abs() < 1e-9);

        let state = fx.brain.lock().await;
        assert!(state
            .positions
            .get("BTCUSDT")
            .unwrap()
            .hard_stop_order_id
            .is_some());
    }

    #[tokio::test]
    async fn emergency_flat_closes_everything() {
        let fx = fixture();
        open_long(&fx, "BTCUSDT", 100.0, 1.0).await;
        open_long(&fx, "ETHUSDT", 50.0, 0.5).await;
        set_price(&fx, "BTCUSDT", 100.0);

        let closed = fx.monitor.emergency_flat(2_000.0).await;
        assert_eq!(closed, 2);
        assert!(fx.brain.lock().await.positions.is_empty());
    }
}
