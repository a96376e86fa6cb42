// =============================================================================
// Entry Engine — gate chain, sizing, and order placement
// =============================================================================
//
// The gate chain, in order, each step producing a machine-readable denial:
//
//   1. kill switch            5. confidence threshold (high-vol relaxed)
//   2. blacklist              6. funding filter
//   3. cooldowns              7. ATR% floor
//   4. capacity / heat        8. pre-entry slippage walk
//
// A candidate that clears every gate is sized (fixed notional with exchange
// minimum floors) and routed as a market order under one idempotency key.
// On fill the Brain is mutated atomically: position inserted, initial hard
// stop placed, confidence history appended, event emitted, snapshot saved.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::brain::{Brain, BrainState, Side};
use crate::brain::persistence::BrainStore;
use crate::config::Config;
use crate::data::oracle::{DataOracle, Timeframe};
use crate::events::{EngineEvent, EventBus};
use crate::exchange::{Exchange, OrderSide};
use crate::flow::OrderFlowAnalyzer;
use crate::router::OrderRouter;
use crate::risk::KillSwitch;
use crate::slippage::{estimate_slippage, SlippageConfig};
use crate::strategy::{compute_technical_features, ensemble_confidence, rule_signal, MlFilter, SignalWeights};
use crate::util::now_ts;

/// Minimum fresh 1m bars before the signal path runs.
const MIN_SIGNAL_BARS: usize = 20;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A fully gated entry candidate, ready for sizing and routing.
#[derive(Debug, Clone)]
pub struct EntryCandidate {
    pub symbol: String,
    pub side: Side,
    pub confidence: f64,
    pub price: f64,
    pub atr: f64,
    pub atr_pct: f64,
    pub feature_vector: Vec<f64>,
}

#[derive(Debug, Clone)]
pub enum GateOutcome {
    Blocked(String),
    Candidate(EntryCandidate),
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct EntryEngine {
    config: Config,
    brain: Brain,
    store: Arc<BrainStore>,
    oracle: Arc<DataOracle>,
    flow: Arc<OrderFlowAnalyzer>,
    ml: Option<Arc<MlFilter>>,
    router: Arc<OrderRouter>,
    ex: Arc<dyn Exchange>,
    kill: Arc<KillSwitch>,
    events: EventBus,

    /// Last gate evaluation per symbol (global per-symbol gap).
    last_eval: Mutex<HashMap<String, f64>>,
    /// Last actual submission attempt per symbol (local cooldown).
    last_attempt: Mutex<HashMap<String, f64>>,
}

impl EntryEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        brain: Brain,
        store: Arc<BrainStore>,
        oracle: Arc<DataOracle>,
        flow: Arc<OrderFlowAnalyzer>,
        ml: Option<Arc<MlFilter>>,
        router: Arc<OrderRouter>,
        ex: Arc<dyn Exchange>,
        kill: Arc<KillSwitch>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            brain,
            store,
            oracle,
            flow,
            ml,
            router,
            ex,
            kill,
            events,
            last_eval: Mutex::new(HashMap::new()),
            last_attempt: Mutex::new(HashMap::new()),
        }
    }

    // ── Gates 1–4 (pre-signal) ──────────────────────────────────────────

    /// Gates that need no market data, evaluated over a state snapshot.
    /// Returns the denial reason, or `None` to continue.
    pub fn check_pre_signal_gates(
        &self,
        symbol: &str,
        now: f64,
        state: &BrainState,
    ) -> Option<String> {
        // 1. Kill switch.
        let (allowed, deny) = self.kill.allow_entry(now);
        if !allowed {
            return Some(deny.unwrap_or_else(|| "kill switch".to_string()));
        }

        // 2. Blacklist (expired entries pass).
        if state.is_blacklisted(symbol, now) {
            let why = state
                .blacklist_reason
                .get(symbol)
                .cloned()
                .unwrap_or_default();
            return Some(format!("blacklisted: {why}"));
        }

        // 3. Cooldowns.
        if let Some(last) = self.last_eval.lock().get(symbol) {
            if now - last < self.config.entry_per_symbol_gap_sec {
                return Some("per-symbol gap".to_string());
            }
        }
        if let Some(last) = self.last_attempt.lock().get(symbol) {
            if now - last < self.config.entry_local_cooldown_sec {
                return Some("local cooldown".to_string());
            }
        }
        if let Some(exit_ts) = state.last_exit_time.get(symbol) {
            let cooldown = self.config.symbol_cooldown_minutes * 60.0;
            let elapsed = now - exit_ts;
            if elapsed < cooldown {
                return Some(format!("cooldown: {:.0}s remaining", cooldown - elapsed));
            }
        }

        // 4. Capacity.
        if state.positions.contains_key(symbol) {
            return Some("already in position".to_string());
        }
        if state.positions.len() >= self.config.max_concurrent_positions {
            return Some(format!(
                "max concurrent positions ({})",
                self.config.max_concurrent_positions
            ));
        }
        if state.current_equity > 0.0 {
            let heat = portfolio_margin(state) / state.current_equity;
            if heat >= self.config.max_portfolio_heat {
                return Some(format!("portfolio heat {:.2} at cap", heat));
            }
        }

        None
    }

    // ── Gates 5–7 (post-signal) ─────────────────────────────────────────

    /// Gates over the evaluated signal. Returns the denial reason.
    pub fn check_post_signal_gates(
        &self,
        symbol: &str,
        side: Side,
        confidence: f64,
        atr_pct: f64,
        funding: f64,
        state: &BrainState,
    ) -> Option<String> {
        // 5. Confidence (relaxed floor in high volatility).
        let floor = if atr_pct >= self.config.entry_high_vol_atr_pct {
            self.config.entry_min_confidence_high_vol
        } else {
            self.config.entry_min_confidence
        };
        if confidence < floor {
            return Some(format!("confidence {confidence:.2} < {floor:.2}"));
        }

        // 6. Funding filter: do not pay into a crowded trade.
        match side {
            Side::Long if funding > self.config.max_funding_long => {
                return Some(format!("funding {funding:.5} too high for long"));
            }
            Side::Short if funding < self.config.min_funding_short => {
                return Some(format!("funding {funding:.5} too low for short"));
            }
            _ => {}
        }

        // 7. ATR floor: dead markets are not worth the fees.
        if atr_pct < self.config.min_atr_pct_for_entry {
            return Some(format!(
                "atr {:.4} below entry floor {:.4}",
                atr_pct, self.config.min_atr_pct_for_entry
            ));
        }

        // Correlation heat: same-direction exposure is capped separately.
        if state.current_equity > 0.0 {
            let same_side_margin: f64 = state
                .positions
                .values()
                .filter(|p| p.side == side)
                .map(|p| p.size * p.entry_price / p.leverage.max(1) as f64)
                .sum();
            let heat = same_side_margin / state.current_equity;
            if heat >= self.config.correlation_heat_cap {
                return Some(format!("correlation heat {:.2} at cap", heat));
            }
        }

        None
    }

    // ── Gate 8 (slippage) ───────────────────────────────────────────────

    /// Fetch the live book and walk it for the intended notional.
    pub async fn check_slippage(&self, symbol: &str, side: Side, notional: f64) -> Result<(), String> {
        let raw = self.oracle.resolve_raw(symbol);
        let book = match self
            .ex
            .fetch_order_book(&raw, self.config.slippage_orderbook_depth)
            .await
        {
            Ok(book) => book,
            Err(e) => return Err(format!("orderbook fetch failed: {e}")),
        };

        let slip_cfg = SlippageConfig {
            orderbook_depth: self.config.slippage_orderbook_depth,
            max_slippage_pct: self.config.slippage_max_pct,
            ..SlippageConfig::default()
        };
        let estimate = estimate_slippage(&book, side, notional, &slip_cfg);
        if !estimate.is_acceptable {
            return Err(estimate.reason);
        }
        Ok(())
    }

    // ── Full evaluation ─────────────────────────────────────────────────

    /// Run the entire gate chain for one symbol.
    pub async fn evaluate_symbol(&self, symbol: &str, now: f64) -> GateOutcome {
        let state = self.brain.lock().await.clone();

        if let Some(reason) = self.check_pre_signal_gates(symbol, now, &state) {
            return GateOutcome::Blocked(reason);
        }
        self.last_eval.lock().insert(symbol.to_string(), now);

        // Truth-guard: only fresh data may produce a signal.
        let bars_1m = self.oracle.get_bars(symbol, Timeframe::M1, true);
        if bars_1m.len() < MIN_SIGNAL_BARS {
            return GateOutcome::Blocked("insufficient fresh 1m data".to_string());
        }
        let bars_5m = self.oracle.get_bars(symbol, Timeframe::M5, true);
        let bars_15m = self.oracle.get_bars(symbol, Timeframe::M15, true);

        let mut features = compute_technical_features(&bars_1m, &bars_5m, &bars_15m);
        let (bid, ask) = self.oracle.get_bidask(symbol);
        features.apply_flow(&self.flow.analysis(symbol, now), bid, ask);
        features.apply_time(now);

        let weights = SignalWeights {
            momentum: self.config.signal_momentum_weight,
            rsi: self.config.signal_rsi_weight,
            trend: self.config.signal_trend_weight,
            bollinger: self.config.signal_bollinger_weight,
            flow: self.config.signal_flow_weight,
        };
        let signal = rule_signal(symbol, &features, &weights);
        let side = if signal.long_ok {
            Side::Long
        } else if signal.short_ok {
            Side::Short
        } else {
            return GateOutcome::Blocked(format!("no direction: {}", signal.reason));
        };

        let feature_vector = features.to_vector();
        let ml_conf = self
            .ml
            .as_ref()
            .and_then(|ml| ml.predict(&feature_vector));
        let Some(confidence) = ensemble_confidence(
            signal.confidence,
            ml_conf,
            self.config.ml_ensemble_weight,
            self.config.ml_min_confidence,
        ) else {
            return GateOutcome::Blocked(format!(
                "ml veto: {:.2} below {:.2}",
                ml_conf.unwrap_or(0.0),
                self.config.ml_min_confidence
            ));
        };

        let funding = self.oracle.get_funding(symbol);
        if let Some(reason) =
            self.check_post_signal_gates(symbol, side, confidence, features.atr_pct, funding, &state)
        {
            // A signal that cleared the confidence bar but lost to a
            // capacity gate is worth remembering for the operator.
            if reason.contains("heat") {
                self.brain.lock().await.put_entry_watch(
                    symbol,
                    crate::brain::state::EntryWatch {
                        symbol_any: symbol.to_string(),
                        created_ts: now,
                        confidence,
                        reason: reason.clone(),
                    },
                );
            }
            return GateOutcome::Blocked(reason);
        }

        let price = self.oracle.get_price(symbol, false);
        if price <= 0.0 {
            return GateOutcome::Blocked("no fresh price".to_string());
        }

        let (_qty, notional) = self.order_size(price);
        if let Err(reason) = self.check_slippage(symbol, side, notional).await {
            return GateOutcome::Blocked(reason);
        }

        GateOutcome::Candidate(EntryCandidate {
            symbol: symbol.to_string(),
            side,
            confidence,
            price,
            atr: features.atr_pct * price,
            atr_pct: features.atr_pct,
            feature_vector,
        })
    }

    /// Sizing: fixed notional with the exchange minimum floors applied.
    /// The margin floor scales with leverage (margin = notional / leverage).
    pub fn order_size(&self, price: f64) -> (f64, f64) {
        let notional = self
            .config
            .fixed_notional_usdt
            .max(self.config.min_notional_usdt)
            .max(self.config.min_margin_usdt * self.config.leverage as f64);

        let qty = if price > 0.0 { notional / price } else { 0.0 };
        (qty, notional)
    }

    // ── Execution ───────────────────────────────────────────────────────

    /// Submit a gated candidate and, on fill, commit it to the Brain.
    pub async fn execute(&self, candidate: &EntryCandidate, now: f64) -> anyhow::Result<()> {
        let (qty, notional) = self.order_size(candidate.price);
        if qty <= 0.0 {
            anyhow::bail!("degenerate order size for {}", candidate.symbol);
        }

        self.last_attempt
            .lock()
            .insert(candidate.symbol.clone(), now);

        let raw = self.oracle.resolve_raw(&candidate.symbol);
        let order_side = match candidate.side {
            Side::Long => OrderSide::Buy,
            Side::Short => OrderSide::Sell,
        };
        let intent = OrderRouter::new_intent_id();

        let order = self
            .router
            .market_order(
                &raw,
                order_side,
                qty,
                false,
                self.config.entry_router_retries,
                &intent,
            )
            .await?;

        let entry_price = if order.average_price > 0.0 {
            order.average_price
        } else {
            candidate.price
        };
        let filled = if order.filled > 0.0 { order.filled } else { qty };

        // Initial hard stop: ATR-based distance clamped to the max stop %.
        let stop_dist = (candidate.atr * self.config.stop_atr_mult)
            .min(entry_price * self.config.max_stop_pct);
        let stop_price = match candidate.side {
            Side::Long => entry_price - stop_dist,
            Side::Short => entry_price + stop_dist,
        };
        let stop_side = match candidate.side {
            Side::Long => OrderSide::Sell,
            Side::Short => OrderSide::Buy,
        };

        let stop_order_id = match self
            .router
            .place_stop_market(&raw, stop_side, filled, stop_price, &OrderRouter::new_intent_id())
            .await
        {
            Ok(stop) => Some(stop.id),
            Err(e) => {
                // The position exists either way; the exit monitor will keep
                // retrying the hard stop on its next tick.
                warn!(
                    component = "entry",
                    symbol = %candidate.symbol,
                    error = %e,
                    "initial hard stop placement failed"
                );
                None
            }
        };

        {
            let mut state = self.brain.lock().await;
            state.apply_fill(
                &candidate.symbol,
                candidate.side,
                filled,
                entry_price,
                candidate.atr,
                self.config.leverage,
                candidate.confidence,
                now,
            );
            if let Some(pos) = state.positions.get_mut(&candidate.symbol) {
                pos.hard_stop_order_id = stop_order_id;
            }
        }

        if let Some(ml) = &self.ml {
            ml.note_entry(&candidate.symbol, candidate.feature_vector.clone());
        }

        self.events.publish(EngineEvent::EntryFilled {
            symbol: candidate.symbol.clone(),
            side: candidate.side,
            size: filled,
            price: entry_price,
            confidence: candidate.confidence,
        });

        info!(
            component = "entry",
            symbol = %candidate.symbol,
            side = %candidate.side,
            size = filled,
            entry_price,
            stop_price,
            notional,
            confidence = candidate.confidence,
            "entry filled"
        );

        let state = self.brain.lock().await.clone();
        if let Err(e) = self.store.save(&state, false).await {
            warn!(component = "entry", error = %e, "brain save after entry failed");
        }
        Ok(())
    }

    /// One pass over the symbol universe.
    pub async fn tick(&self) {
        let now = now_ts();
        for symbol in &self.config.active_symbols {
            match self.evaluate_symbol(symbol, now).await {
                GateOutcome::Blocked(reason) => {
                    tracing::debug!(component = "entry", symbol = %symbol, reason = %reason, "entry blocked");
                }
                GateOutcome::Candidate(candidate) => {
                    if let Err(e) = self.execute(&candidate, now).await {
                        warn!(component = "entry", symbol = %symbol, error = %e, "entry execution failed");
                    }
                }
            }
        }
    }
}

/// Total margin currently committed across open positions.
fn portfolio_margin(state: &BrainState) -> f64 {
    state
        .positions
        .values()
        .map(|p| p.size * p.entry_price / p.leverage.max(1) as f64)
        .sum()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::brain::new_brain;
    use crate::exchange::{Balance, Bar, ExchangePosition, Market, Order, OrderBook, OrderParams, OrderType, Ticker};
    use crate::risk::{ApiStats, KillSwitchConfig};
    use async_trait::async_trait;
    use std::collections::HashMap as StdHashMap;

    struct MockExchange {
        book: OrderBook,
    }

    #[async_trait]
    impl Exchange for MockExchange {
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
            Ok(self.book.clone())
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
            _: OrderType,
            _: OrderSide,
            amount: f64,
            _: Option<f64>,
            params: OrderParams,
        ) -> anyhow::Result<Order> {
            Ok(Order {
                id: "7".to_string(),
                client_order_id: params.client_order_id.unwrap_or_default(),
                symbol: symbol.to_string(),
                status: "FILLED".to_string(),
                filled: amount,
                average_price: 100.0,
            })
        }
        async fn cancel_order(&self, _: &str, _: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn close(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn tight_book() -> OrderBook {
        OrderBook {
            symbol: "BTCUSDT".to_string(),
            bids: vec![[99.95, 100.0]],
            asks: vec![[100.05, 100.0]],
            ts_ms: 0,
        }
    }

    fn thin_book() -> OrderBook {
        OrderBook {
            symbol: "BTCUSDT".to_string(),
            bids: vec![[99.9, 1.0]],
            asks: vec![[100.0, 0.01], [101.0, 0.01], [102.0, 999.0]],
            ts_ms: 0,
        }
    }

    fn engine_with_book(book: OrderBook) -> EntryEngine {
        let config = Config::default();
        let dir = tempfile::tempdir().unwrap();
        let ex: Arc<dyn Exchange> = Arc::new(MockExchange { book });
        let api = Arc::new(ApiStats::new());
        EntryEngine::new(
            config,
            new_brain(BrainState::new()),
            Arc::new(BrainStore::new(dir.path().join("brain.lz4"))),
            Arc::new(DataOracle::new()),
            Arc::new(OrderFlowAnalyzer::default()),
            None,
            Arc::new(OrderRouter::new(ex.clone(), api, 0.01)),
            ex,
            Arc::new(KillSwitch::new(KillSwitchConfig::default(), 0.0)),
            EventBus::new(),
        )
    }

    fn state_with_equity(equity: f64) -> BrainState {
        let mut st = BrainState::new();
        st.record_equity(equity, 1_000.0);
        st
    }

    #[test]
    fn cooldown_blocks_until_exactly_elapsed() {
        let engine = engine_with_book(tight_book());
        let mut state = state_with_equity(1_000.0);

        let t0 = 100_000.0;
        state.last_exit_time.insert("BTCUSDT".to_string(), t0);
        let cooldown = engine.config.symbol_cooldown_minutes * 60.0;

        // One second before expiry: blocked with a cooldown reason.
        let reason = engine
            .check_pre_signal_gates("BTCUSDT", t0 + cooldown - 1.0, &state)
            .expect("must block");
        assert!(reason.starts_with("cooldown"), "reason was {reason}");

        // One second past expiry: the gate chain continues.
        assert!(engine
            .check_pre_signal_gates("BTCUSDT", t0 + cooldown + 1.0, &state)
            .is_none());

        // With confidence 0.80 >= 0.72 the post-signal gates pass too, so
        // the evaluator would proceed to the slippage check.
        assert!(engine
            .check_post_signal_gates("BTCUSDT", Side::Long, 0.80, 0.01, 0.0, &state)
            .is_none());
    }

    #[tokio::test]
    async fn slippage_gate_rejects_thin_book() {
        let engine = engine_with_book(thin_book());
        let err = engine
            .check_slippage("BTCUSDT", Side::Long, 50.0)
            .await
            .unwrap_err();
        assert!(err.starts_with("Slippage"), "reason was {err}");
        assert!(err.contains(">0.600%"));
    }

    #[tokio::test]
    async fn slippage_gate_accepts_tight_book() {
        let engine = engine_with_book(tight_book());
        assert!(engine
            .check_slippage("BTCUSDT", Side::Long, 50.0)
            .await
            .is_ok());
    }

    #[test]
    fn blacklist_blocks_until_expiry() {
        let engine = engine_with_book(tight_book());
        let mut state = state_with_equity(1_000.0);
        state.blacklist_symbol("BTCUSDT", 3_600.0, "3 consecutive losses", 1_000.0);

        let reason = engine
            .check_pre_signal_gates("BTCUSDT", 2_000.0, &state)
            .expect("must block");
        assert!(reason.contains("blacklisted"));

        state.expire_blacklist(10_000.0);
        assert!(engine
            .check_pre_signal_gates("BTCUSDT", 10_000.0, &state)
            .is_none());
    }

    #[test]
    fn capacity_gates_block() {
        let engine = engine_with_book(tight_book());
        let mut state = state_with_equity(1_000.0);

        // Already in position.
        state.apply_fill("BTCUSDT", Side::Long, 1.0, 100.0, 1.0, 10, 0.8, 1.0);
        let reason = engine
            .check_pre_signal_gates("BTCUSDT", 2_000.0, &state)
            .unwrap();
        assert!(reason.contains("already in position"));

        // Concurrent cap across other symbols.
        let mut state = state_with_equity(100_000.0);
        for i in 0..engine.config.max_concurrent_positions {
            state.apply_fill(&format!("SYM{i}USDT"), Side::Long, 0.1, 100.0, 1.0, 20, 0.8, 1.0);
        }
        let reason = engine
            .check_pre_signal_gates("BTCUSDT", 2_000.0, &state)
            .unwrap();
        assert!(reason.contains("max concurrent"));
    }

    #[test]
    fn portfolio_heat_gate_blocks() {
        let engine = engine_with_book(tight_book());
        let mut state = state_with_equity(100.0);
        // One position using 50 margin on 100 equity: heat 0.5 > 0.45 cap.
        state.apply_fill("ETHUSDT", Side::Long, 10.0, 100.0, 1.0, 20, 0.8, 1.0);
        let reason = engine
            .check_pre_signal_gates("BTCUSDT", 2_000.0, &state)
            .unwrap();
        assert!(reason.contains("portfolio heat"));
    }

    #[test]
    fn confidence_thresholds_with_high_vol_relaxation() {
        let engine = engine_with_book(tight_book());
        let state = state_with_equity(1_000.0);

        // 0.70 fails the normal floor.
        assert!(engine
            .check_post_signal_gates("BTCUSDT", Side::Long, 0.70, 0.010, 0.0, &state)
            .is_some());
        // The same confidence passes once ATR% crosses the high-vol bar.
        assert!(engine
            .check_post_signal_gates("BTCUSDT", Side::Long, 0.70, 0.020, 0.0, &state)
            .is_none());
    }

    #[test]
    fn funding_filter_blocks_crowded_sides() {
        let engine = engine_with_book(tight_book());
        let state = state_with_equity(1_000.0);

        let reason = engine
            .check_post_signal_gates("BTCUSDT", Side::Long, 0.9, 0.01, 0.001, &state)
            .unwrap();
        assert!(reason.contains("funding"));

        let reason = engine
            .check_post_signal_gates("BTCUSDT", Side::Short, 0.9, 0.01, -0.001, &state)
            .unwrap();
        assert!(reason.contains("funding"));

        // Shorts collecting funding are fine.
        assert!(engine
            .check_post_signal_gates("BTCUSDT", Side::Short, 0.9, 0.01, 0.001, &state)
            .is_none());
    }

    #[test]
    fn atr_floor_blocks_dead_markets() {
        let engine = engine_with_book(tight_book());
        let state = state_with_equity(1_000.0);
        let reason = engine
            .check_post_signal_gates("BTCUSDT", Side::Long, 0.9, 0.001, 0.0, &state)
            .unwrap();
        assert!(reason.contains("atr"));
    }

    #[test]
    fn sizing_respects_floors() {
        let engine = engine_with_book(tight_book());
        let (qty, notional) = engine.order_size(100.0);
        assert!(notional >= engine.config.min_notional_usdt);
        assert!((qty - notional / 100.0).abs() < 1e-12);
        assert_eq!(engine.order_size(0.0).0, 0.0);
    }

    #[tokio::test]
    async fn execute_commits_position_with_stop() {
        let engine = engine_with_book(tight_book());
        let candidate = EntryCandidate {
            symbol: "BTCUSDT".to_string(),
            side: Side::Long,
            confidence: 0.8,
            price: 100.0,
            atr: 1.0,
            atr_pct: 0.01,
            feature_vector: vec![0.0; 26],
        };

        engine.execute(&candidate, 5_000.0).await.unwrap();

        let state = engine.brain.lock().await.clone();
        let pos = state.positions.get("BTCUSDT").expect("position recorded");
        assert_eq!(pos.side, Side::Long);
        assert!(pos.size > 0.0);
        assert!(pos.hard_stop_order_id.is_some());
        assert_eq!(state.entry_confidence_history["BTCUSDT"].len(), 1);

        // Local cooldown applies to the traded symbol only.
        assert!(engine
            .check_pre_signal_gates("ETHUSDT", 5_001.0, &state)
            .is_none());
        assert!(engine
            .check_pre_signal_gates("BTCUSDT", 5_001.0, &state)
            .is_some());
    }
}
