// =============================================================================
// Brain State — the engine's authoritative in-process psyche
// =============================================================================
//
// One instance, owned by the supervisor, shared as `Brain =
// Arc<tokio::sync::Mutex<BrainState>>`. Every mutation path ends with
// `validate()` + `recompute_derived()`, so the struct is always internally
// consistent when observed:
//
//   - position sizes stored absolute; zero-size positions never in the map
//   - total_wins <= total_trades
//   - peak_equity >= current_equity whenever current_equity > 0
//   - every symbol-keyed map keyed by `canon_symbol` form
//   - bounded collections within their caps
//
// Collision policy when canonicalization folds two keys together:
//   counters/expiries merge by max, reason strings prefer the newer entry,
//   perf/history records prefer the newer entry, positions keep the greater
//   `entry_ts`.
// =============================================================================

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::NaiveDate;
use serde::de::{Deserializer, SeqAccess, Visitor};
use serde::ser::{SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::util::{canon_symbol, now_ts, safe_float};

pub const STATE_SCHEMA_VERSION: u32 = 3;
pub const CORE_VERSION: &str = "penumbra-core-v3";

pub const KNOWN_EXIT_IDS_CAP: usize = 50_000;
pub const ENTRY_CONF_HISTORY_CAP: usize = 200;
pub const TRAILING_IDS_CAP: usize = 20;
pub const ENTRY_WATCHES_CAP: usize = 500;

// =============================================================================
// Side
// =============================================================================

/// Direction of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    #[default]
    Long,
    Short,
}

impl Side {
    /// +1.0 for long, -1.0 for short. Multiplied into PnL math.
    pub fn sign(self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
        }
    }
}

// =============================================================================
// Position
// =============================================================================

/// A single open position. `size` is always stored absolute; direction lives
/// in `side`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Position {
    /// Canonical symbol; equals the map key after validation.
    pub symbol: String,
    pub side: Side,
    pub size: f64,
    pub entry_price: f64,
    pub atr: f64,
    pub leverage: u32,
    /// Epoch seconds at fill.
    pub entry_ts: f64,
    pub hard_stop_order_id: Option<String>,
    pub trailing_active: bool,
    pub breakeven_moved: bool,
    pub confidence: f64,
    pub last_breakeven_move: f64,
}

impl Default for Position {
    fn default() -> Self {
        Self {
            symbol: String::new(),
            side: Side::Long,
            size: 0.0,
            entry_price: 0.0,
            atr: 0.0,
            leverage: 1,
            entry_ts: 0.0,
            hard_stop_order_id: None,
            trailing_active: false,
            breakeven_moved: false,
            confidence: 0.0,
            last_breakeven_move: 0.0,
        }
    }
}

impl Position {
    /// Coerce all numeric fields into their legal ranges.
    pub fn sanitize(&mut self) {
        self.size = safe_float(self.size, 0.0).abs();
        self.entry_price = safe_float(self.entry_price, 0.0).max(0.0);
        self.atr = safe_float(self.atr, 0.0).max(0.0);
        self.leverage = self.leverage.max(1);
        self.entry_ts = safe_float(self.entry_ts, 0.0).max(0.0);
        self.confidence = safe_float(self.confidence, 0.0).clamp(0.0, 1.0);
        self.last_breakeven_move = safe_float(self.last_breakeven_move, 0.0).max(0.0);
        self.symbol = canon_symbol(&self.symbol);
    }

    /// Unrealized PnL in quote units at `price`.
    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        self.side.sign() * (price - self.entry_price) * self.size
    }

    /// Reward-to-risk multiple at `price`, in units of the initial stop
    /// distance (`stop_atr_mult * atr`). Zero when the stop distance is
    /// degenerate.
    pub fn rr_multiple(&self, price: f64, stop_atr_mult: f64) -> f64 {
        let stop_dist = self.atr * stop_atr_mult;
        if stop_dist <= f64::EPSILON || self.entry_price <= 0.0 {
            return 0.0;
        }
        self.side.sign() * (price - self.entry_price) / stop_dist
    }
}

// =============================================================================
// Per-symbol performance record
// =============================================================================

/// Rolling per-symbol trading performance and exit-management bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct SymbolPerf {
    pub pnl: f64,
    pub wins: u32,
    pub losses: u32,
    pub last_win: f64,
    pub pos_realized_pnl: f64,
    pub entry_size_abs: f64,
    /// Maximum favorable excursion (percent) seen during the current position.
    pub mfe_pct: f64,
    /// Live trailing-stop order ids, newest last, capped at TRAILING_IDS_CAP.
    pub trailing_order_ids: Vec<String>,
    pub last_trail_ts: f64,
}

impl SymbolPerf {
    fn sanitize(&mut self) {
        self.pnl = safe_float(self.pnl, 0.0);
        self.last_win = safe_float(self.last_win, 0.0).max(0.0);
        self.pos_realized_pnl = safe_float(self.pos_realized_pnl, 0.0);
        self.entry_size_abs = safe_float(self.entry_size_abs, 0.0).abs();
        self.mfe_pct = safe_float(self.mfe_pct, 0.0);
        self.last_trail_ts = safe_float(self.last_trail_ts, 0.0).max(0.0);
        if self.trailing_order_ids.len() > TRAILING_IDS_CAP {
            let excess = self.trailing_order_ids.len() - TRAILING_IDS_CAP;
            self.trailing_order_ids.drain(..excess);
        }
    }
}

// =============================================================================
// Entry watch
// =============================================================================

/// A persisted "worth watching" marker produced by the entry engine.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct EntryWatch {
    /// Whatever symbol form the producer saw (kept for operator display).
    pub symbol_any: String,
    pub created_ts: f64,
    pub confidence: f64,
    pub reason: String,
}

// =============================================================================
// Bounded id set — insertion-ordered, oldest-dropped, serialized sorted
// =============================================================================

/// A set of order ids with FIFO eviction once `KNOWN_EXIT_IDS_CAP` is
/// reached. Serialized to disk as a sorted list of strings.
#[derive(Debug, Clone, Default)]
pub struct BoundedIdSet {
    order: VecDeque<String>,
    index: HashSet<String>,
}

impl BoundedIdSet {
    /// Insert an id. Returns true when the id was not previously known.
    pub fn insert(&mut self, id: impl Into<String>) -> bool {
        let id = id.into();
        if id.is_empty() || self.index.contains(&id) {
            return false;
        }
        self.index.insert(id.clone());
        self.order.push_back(id);
        while self.order.len() > KNOWN_EXIT_IDS_CAP {
            if let Some(old) = self.order.pop_front() {
                self.index.remove(&old);
            }
        }
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl Serialize for BoundedIdSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut ids: Vec<&String> = self.order.iter().collect();
        ids.sort();
        let mut seq = serializer.serialize_seq(Some(ids.len()))?;
        for id in ids {
            seq.serialize_element(id)?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for BoundedIdSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct IdSetVisitor;

        impl<'de> Visitor<'de> for IdSetVisitor {
            type Value = BoundedIdSet;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a sequence of order id strings")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut out = BoundedIdSet::default();
                while let Some(id) = seq.next_element::<String>()? {
                    out.insert(id);
                }
                Ok(out)
            }
        }

        deserializer.deserialize_seq(IdSetVisitor)
    }
}

// =============================================================================
// BrainState
// =============================================================================

/// The authoritative engine state. See module docs for the invariants
/// `validate()` maintains.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrainState {
    pub schema_version: u32,
    pub version: String,

    // ── Equity ──────────────────────────────────────────────────────────
    pub current_equity: f64,
    pub peak_equity: f64,
    pub peak_equity_timestamp: f64,
    pub current_drawdown_pct: f64,
    pub daily_pnl: f64,
    pub start_of_day_equity: f64,
    pub current_day: Option<NaiveDate>,

    // ── Counters ────────────────────────────────────────────────────────
    pub total_trades: u64,
    pub total_wins: u64,
    pub win_streak: u32,

    // ── Symbol-keyed maps ───────────────────────────────────────────────
    pub positions: HashMap<String, Position>,
    /// Canonical symbol -> blacklist expiry (epoch seconds).
    pub blacklist: HashMap<String, f64>,
    pub blacklist_reason: HashMap<String, String>,
    pub consecutive_losses: HashMap<String, u32>,
    pub last_exit_time: HashMap<String, f64>,
    pub known_exit_order_ids: BoundedIdSet,
    pub symbol_performance: HashMap<String, SymbolPerf>,
    pub entry_confidence_history: HashMap<String, Vec<f64>>,
    pub funding_rate_snapshot: HashMap<String, f64>,
    pub entry_watches: HashMap<String, EntryWatch>,

    // ── Session bookkeeping ─────────────────────────────────────────────
    /// Rows of (iso date, streak length, pnl).
    pub streak_history: Vec<(String, u32, f64)>,
    pub adaptive_risk_multiplier: f64,
    pub funding_paid: f64,
    pub session_start_timestamp: f64,
    pub uptime_seconds: f64,

    // ── Derived ─────────────────────────────────────────────────────────
    pub win_rate: f64,
    pub max_drawdown: f64,
}

impl Default for BrainState {
    fn default() -> Self {
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            version: CORE_VERSION.to_string(),
            current_equity: 0.0,
            peak_equity: 0.0,
            peak_equity_timestamp: now_ts(),
            current_drawdown_pct: 0.0,
            daily_pnl: 0.0,
            start_of_day_equity: 0.0,
            current_day: None,
            total_trades: 0,
            total_wins: 0,
            win_streak: 0,
            positions: HashMap::new(),
            blacklist: HashMap::new(),
            blacklist_reason: HashMap::new(),
            consecutive_losses: HashMap::new(),
            last_exit_time: HashMap::new(),
            known_exit_order_ids: BoundedIdSet::default(),
            symbol_performance: HashMap::new(),
            entry_confidence_history: HashMap::new(),
            funding_rate_snapshot: HashMap::new(),
            entry_watches: HashMap::new(),
            streak_history: Vec::new(),
            adaptive_risk_multiplier: 1.0,
            funding_paid: 0.0,
            session_start_timestamp: now_ts(),
            uptime_seconds: 0.0,
            win_rate: 0.0,
            max_drawdown: 0.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Canonicalization helpers
// ---------------------------------------------------------------------------

/// Re-key a symbol map by canonical key, dropping empty keys and resolving
/// collisions through `merge(existing, incoming)`. Keys are processed in
/// sorted order so collision resolution is deterministic.
fn canon_map<V>(
    map: HashMap<String, V>,
    mut merge: impl FnMut(V, V) -> V,
) -> HashMap<String, V> {
    let mut entries: Vec<(String, V)> = map.into_iter().collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let mut out: HashMap<String, V> = HashMap::new();
    for (key, value) in entries {
        let ck = canon_symbol(&key);
        if ck.is_empty() {
            continue;
        }
        match out.remove(&ck) {
            Some(existing) => {
                out.insert(ck, merge(existing, value));
            }
            None => {
                out.insert(ck, value);
            }
        }
    }
    out
}

fn merge_max_f64(a: f64, b: f64) -> f64 {
    if safe_float(b, 0.0) >= safe_float(a, 0.0) {
        b
    } else {
        a
    }
}

// ---------------------------------------------------------------------------
// Mutation & validation API
// ---------------------------------------------------------------------------

impl BrainState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Repair a just-deserialized state: migrate older schemas, canonicalize,
    /// recompute. Never fails; unrecognizable content degrades to defaults at
    /// field granularity via serde defaults upstream.
    pub fn from_loaded(mut loaded: Self, runtime_version: &str) -> Self {
        if loaded.schema_version < STATE_SCHEMA_VERSION {
            loaded.schema_version = STATE_SCHEMA_VERSION;
        }
        loaded.version = runtime_version.to_string();
        loaded.validate();
        loaded.recompute_derived();
        loaded
    }

    // ── Fills & exits ───────────────────────────────────────────────────

    /// Record a confirmed entry fill. Overwrites any stale entry for the key.
    pub fn apply_fill(
        &mut self,
        symbol: &str,
        side: Side,
        size: f64,
        entry_price: f64,
        atr: f64,
        leverage: u32,
        confidence: f64,
        ts: f64,
    ) {
        let k = canon_symbol(symbol);
        if k.is_empty() || size <= 0.0 || entry_price <= 0.0 {
            warn!(symbol, size, entry_price, "apply_fill rejected degenerate input");
            return;
        }

        let mut pos = Position {
            symbol: k.clone(),
            side,
            size,
            entry_price,
            atr,
            leverage,
            entry_ts: ts,
            confidence,
            ..Position::default()
        };
        pos.sanitize();

        let perf = self.symbol_performance.entry(k.clone()).or_default();
        perf.entry_size_abs = pos.size;
        perf.pos_realized_pnl = 0.0;
        perf.mfe_pct = 0.0;
        perf.trailing_order_ids.clear();

        let hist = self.entry_confidence_history.entry(k.clone()).or_default();
        hist.push(safe_float(confidence, 0.0).clamp(0.0, 1.0));

        self.positions.insert(k, pos);
        self.validate();
        self.recompute_derived();
    }

    /// Close (fully) the position for `symbol` at `exit_price`. Returns the
    /// realized PnL, or `None` if no such position exists.
    pub fn close_position(&mut self, symbol: &str, exit_price: f64, ts: f64) -> Option<f64> {
        let k = canon_symbol(symbol);
        let pos = self.positions.remove(&k)?;

        let realized = pos.unrealized_pnl(safe_float(exit_price, pos.entry_price));
        let won = realized > 0.0;

        self.total_trades += 1;
        if won {
            self.total_wins += 1;
            self.win_streak += 1;
            self.consecutive_losses.remove(&k);
        } else {
            self.win_streak = 0;
        }

        self.daily_pnl += realized;
        self.last_exit_time.insert(k.clone(), ts);

        let perf = self.symbol_performance.entry(k.clone()).or_default();
        perf.pnl += realized;
        perf.pos_realized_pnl += realized;
        if won {
            perf.wins += 1;
            perf.last_win = ts;
        } else {
            perf.losses += 1;
        }
        perf.trailing_order_ids.clear();

        self.validate();
        self.recompute_derived();
        Some(realized)
    }

    /// Reduce a position in place (partial take-profit). Realized PnL for the
    /// closed fraction is accumulated into the symbol's perf record.
    pub fn reduce_position(&mut self, symbol: &str, close_size: f64, price: f64) -> Option<f64> {
        let k = canon_symbol(symbol);
        let pos = self.positions.get_mut(&k)?;
        let close_size = close_size.abs().min(pos.size);
        if close_size <= 0.0 {
            return None;
        }

        let realized = pos.side.sign() * (price - pos.entry_price) * close_size;
        pos.size -= close_size;
        self.daily_pnl += realized;

        let perf = self.symbol_performance.entry(k.clone()).or_default();
        perf.pnl += realized;
        perf.pos_realized_pnl += realized;

        self.validate();
        self.recompute_derived();
        Some(realized)
    }

    /// Record a losing exit on `symbol` and return the updated consecutive
    /// loss count.
    pub fn mark_loss(&mut self, symbol: &str) -> u32 {
        let k = canon_symbol(symbol);
        let count = self.consecutive_losses.entry(k).or_insert(0);
        *count += 1;
        *count
    }

    // ── Blacklist ───────────────────────────────────────────────────────

    /// Blacklist a symbol until `now + ttl_sec`.
    pub fn blacklist_symbol(&mut self, symbol: &str, ttl_sec: f64, reason: &str, now: f64) {
        let k = canon_symbol(symbol);
        if k.is_empty() {
            return;
        }
        let expiry = now + ttl_sec.max(0.0);
        let prev = self.blacklist.get(&k).copied().unwrap_or(0.0);
        self.blacklist.insert(k.clone(), merge_max_f64(prev, expiry));
        self.blacklist_reason.insert(k, reason.to_string());
    }

    /// Drop expired blacklist entries (and their reasons).
    pub fn expire_blacklist(&mut self, now: f64) {
        let expired: Vec<String> = self
            .blacklist
            .iter()
            .filter(|(_, exp)| safe_float(**exp, 0.0) <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for k in expired {
            self.blacklist.remove(&k);
            self.blacklist_reason.remove(&k);
        }
    }

    /// Whether `symbol` is currently blacklisted.
    pub fn is_blacklisted(&self, symbol: &str, now: f64) -> bool {
        let k = canon_symbol(symbol);
        self.blacklist
            .get(&k)
            .map(|exp| safe_float(*exp, 0.0) > now)
            .unwrap_or(false)
    }

    // ── Equity ──────────────────────────────────────────────────────────

    /// Record an equity observation; peak only advances (with its timestamp).
    pub fn record_equity(&mut self, equity: f64, ts: f64) {
        let eq = safe_float(equity, 0.0).max(0.0);
        self.current_equity = eq;
        if self.peak_equity <= 0.0 || eq > self.peak_equity {
            self.peak_equity = eq;
            self.peak_equity_timestamp = ts;
        }
        self.maybe_roll_day(ts);
        self.recompute_derived();
    }

    /// Roll daily accounting when the UTC date changes.
    fn maybe_roll_day(&mut self, ts: f64) {
        let today = chrono::DateTime::from_timestamp(ts as i64, 0)
            .map(|dt| dt.date_naive())
            .unwrap_or_default();
        if self.current_day != Some(today) {
            if self.current_day.is_some() && self.win_streak > 0 {
                self.record_streak(&today.to_string(), self.win_streak, self.daily_pnl);
            }
            self.current_day = Some(today);
            self.start_of_day_equity = self.current_equity;
            self.daily_pnl = 0.0;
        }
    }

    /// Append a streak-history row.
    pub fn record_streak(&mut self, iso_date: &str, streak: u32, pnl: f64) {
        self.streak_history
            .push((iso_date.to_string(), streak, safe_float(pnl, 0.0)));
    }

    /// Remember a processed exit order id. Returns true when previously
    /// unseen — the idempotency check for exit accounting.
    pub fn note_exit_order(&mut self, order_id: &str) -> bool {
        self.known_exit_order_ids.insert(order_id)
    }

    // ── Watches ─────────────────────────────────────────────────────────

    pub fn put_entry_watch(&mut self, symbol: &str, watch: EntryWatch) {
        let k = canon_symbol(symbol);
        if k.is_empty() {
            return;
        }
        match self.entry_watches.get(&k) {
            Some(existing) if existing.created_ts > watch.created_ts => {}
            _ => {
                self.entry_watches.insert(k, watch);
            }
        }
        self.bound_entry_watches();
    }

    fn bound_entry_watches(&mut self) {
        if self.entry_watches.len() <= ENTRY_WATCHES_CAP {
            return;
        }
        // Keep the newest by created_ts.
        let mut items: Vec<(String, EntryWatch)> = self.entry_watches.drain().collect();
        items.sort_by(|a, b| {
            a.1.created_ts
                .partial_cmp(&b.1.created_ts)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let keep = items.split_off(items.len() - ENTRY_WATCHES_CAP);
        self.entry_watches = keep.into_iter().collect();
    }

    // ── Validation & derived metrics ────────────────────────────────────

    /// Enforce every invariant; repair rather than reject.
    pub fn validate(&mut self) {
        // Canonicalize all symbol-keyed maps.
        let positions = std::mem::take(&mut self.positions);
        self.positions = canon_map(positions, |a, b| {
            if b.entry_ts >= a.entry_ts {
                b
            } else {
                a
            }
        });
        for (k, pos) in self.positions.iter_mut() {
            pos.sanitize();
            pos.symbol = k.clone();
        }
        // Canon law: zero-size means no position.
        self.positions.retain(|_, p| p.size > 0.0 && p.entry_price > 0.0);

        let blacklist = std::mem::take(&mut self.blacklist);
        self.blacklist = canon_map(blacklist, merge_max_f64);

        let last_exit = std::mem::take(&mut self.last_exit_time);
        self.last_exit_time = canon_map(last_exit, merge_max_f64);

        let losses = std::mem::take(&mut self.consecutive_losses);
        self.consecutive_losses = canon_map(losses, |a, b| a.max(b));

        let reasons = std::mem::take(&mut self.blacklist_reason);
        self.blacklist_reason = canon_map(reasons, |_, b| b);

        let perf = std::mem::take(&mut self.symbol_performance);
        self.symbol_performance = canon_map(perf, |_, b| b);
        for p in self.symbol_performance.values_mut() {
            p.sanitize();
        }

        let conf = std::mem::take(&mut self.entry_confidence_history);
        self.entry_confidence_history = canon_map(conf, |_, b| b);
        for hist in self.entry_confidence_history.values_mut() {
            for v in hist.iter_mut() {
                *v = safe_float(*v, 0.0);
            }
            if hist.len() > ENTRY_CONF_HISTORY_CAP {
                let excess = hist.len() - ENTRY_CONF_HISTORY_CAP;
                hist.drain(..excess);
            }
        }

        let funding = std::mem::take(&mut self.funding_rate_snapshot);
        self.funding_rate_snapshot = canon_map(funding, |_, b| b);
        for v in self.funding_rate_snapshot.values_mut() {
            *v = safe_float(*v, 0.0);
        }

        let watches = std::mem::take(&mut self.entry_watches);
        self.entry_watches = canon_map(watches, |a, b| {
            if b.created_ts >= a.created_ts {
                b
            } else {
                a
            }
        });
        self.bound_entry_watches();

        // Scalar hygiene.
        self.current_equity = safe_float(self.current_equity, 0.0).max(0.0);
        self.peak_equity = safe_float(self.peak_equity, 0.0).max(0.0);
        self.start_of_day_equity = safe_float(self.start_of_day_equity, 0.0).max(0.0);
        self.daily_pnl = safe_float(self.daily_pnl, 0.0);
        self.peak_equity_timestamp = safe_float(self.peak_equity_timestamp, now_ts());
        self.current_drawdown_pct = safe_float(self.current_drawdown_pct, 0.0).max(0.0);
        self.max_drawdown = safe_float(self.max_drawdown, 0.0).max(0.0);
        self.win_rate = safe_float(self.win_rate, 0.0).max(0.0);
        self.funding_paid = safe_float(self.funding_paid, 0.0);
        self.session_start_timestamp = safe_float(self.session_start_timestamp, now_ts());
        self.uptime_seconds = safe_float(self.uptime_seconds, 0.0).max(0.0);
        self.adaptive_risk_multiplier =
            safe_float(self.adaptive_risk_multiplier, 1.0).max(0.0);

        if self.total_wins > self.total_trades {
            self.total_wins = self.total_trades;
        }
        if self.current_equity > 0.0 && self.peak_equity < self.current_equity {
            self.peak_equity = self.current_equity;
            self.peak_equity_timestamp = now_ts();
        }
    }

    /// Recompute win rate and drawdown. `max_drawdown` is monotone
    /// non-decreasing over a session.
    pub fn recompute_derived(&mut self) {
        self.win_rate = if self.total_trades > 0 {
            self.total_wins as f64 / self.total_trades as f64
        } else {
            0.0
        };

        if self.peak_equity > 0.0 {
            let dd = (self.peak_equity - self.current_equity) / self.peak_equity;
            self.current_drawdown_pct = dd.clamp(0.0, 1.0);
            self.max_drawdown = self.max_drawdown.max(self.current_drawdown_pct);
        } else {
            self.current_drawdown_pct = 0.0;
        }
    }

    /// Canonical symbols currently holding a position.
    pub fn position_symbols(&self) -> Vec<String> {
        self.positions.keys().cloned().collect()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn pos(symbol: &str, size: f64, entry: f64, entry_ts: f64) -> Position {
        Position {
            symbol: symbol.to_string(),
            side: Side::Long,
            size,
            entry_price: entry,
            atr: 1.0,
            leverage: 10,
            entry_ts,
            ..Position::default()
        }
    }

    #[test]
    fn canonicalization_merges_duplicate_position_keys() {
        let mut st = BrainState::new();
        st.positions
            .insert("BTC/USDT:USDT".to_string(), pos("BTC/USDT:USDT", 1.0, 100.0, 50.0));
        st.positions
            .insert("BTCUSDT".to_string(), pos("BTCUSDT", 2.0, 101.0, 100.0));

        st.validate();

        assert_eq!(st.positions.len(), 1);
        let p = st.positions.get("BTCUSDT").expect("canonical key survives");
        // Newest entry_ts wins.
        assert!((p.entry_ts - 100.0).abs() < f64::EPSILON);
        assert!((p.size - 2.0).abs() < f64::EPSILON);
        assert_eq!(p.symbol, "BTCUSDT");
    }

    #[test]
    fn validate_drops_zero_size_positions() {
        let mut st = BrainState::new();
        st.positions.insert("ETHUSDT".to_string(), pos("ETHUSDT", 0.0, 100.0, 1.0));
        st.validate();
        assert!(st.positions.is_empty());
    }

    #[test]
    fn sizes_stored_absolute() {
        let mut st = BrainState::new();
        let mut p = pos("ETHUSDT", -3.0, 100.0, 1.0);
        p.side = Side::Short;
        st.positions.insert("ETHUSDT".to_string(), p);
        st.validate();
        assert!((st.positions["ETHUSDT"].size - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn blacklist_merge_keeps_greater_expiry() {
        let mut st = BrainState::new();
        st.blacklist.insert("BTC/USDT".to_string(), 500.0);
        st.blacklist.insert("BTCUSDT".to_string(), 100.0);
        st.validate();
        assert_eq!(st.blacklist.len(), 1);
        assert!((st.blacklist["BTCUSDT"] - 500.0).abs() < f64::EPSILON);
    }

    #[test]
    fn blacklist_expiry_removes_reason() {
        let mut st = BrainState::new();
        st.blacklist_symbol("BTCUSDT", 10.0, "3 consecutive losses", 1_000.0);
        assert!(st.is_blacklisted("BTC/USDT:USDT", 1_005.0));

        st.expire_blacklist(1_011.0);
        assert!(!st.is_blacklisted("BTCUSDT", 1_011.0));
        assert!(st.blacklist_reason.is_empty());
    }

    #[test]
    fn wins_never_exceed_trades() {
        let mut st = BrainState::new();
        st.total_trades = 2;
        st.total_wins = 5;
        st.validate();
        assert_eq!(st.total_wins, 2);
    }

    #[test]
    fn peak_equity_tracks_current_when_higher() {
        let mut st = BrainState::new();
        st.record_equity(100.0, 1.0);
        st.record_equity(150.0, 2.0);
        st.record_equity(120.0, 3.0);

        assert!((st.peak_equity - 150.0).abs() < f64::EPSILON);
        assert!((st.peak_equity_timestamp - 2.0).abs() < f64::EPSILON);
        assert!((st.current_drawdown_pct - 0.2).abs() < 1e-9);
        assert!(st.max_drawdown >= st.current_drawdown_pct);
    }

    #[test]
    fn drawdown_is_bounded_and_max_monotone() {
        let mut st = BrainState::new();
        st.record_equity(100.0, 1.0);
        st.record_equity(40.0, 2.0);
        let dd1 = st.max_drawdown;
        st.record_equity(90.0, 3.0);
        assert!(st.current_drawdown_pct >= 0.0 && st.current_drawdown_pct <= 1.0);
        assert!(st.max_drawdown >= dd1);
    }

    #[test]
    fn close_position_updates_counters_and_history() {
        let mut st = BrainState::new();
        st.apply_fill("BTC/USDT:USDT", Side::Long, 1.0, 100.0, 1.0, 10, 0.8, 50.0);
        assert!(st.positions.contains_key("BTCUSDT"));
        assert_eq!(st.entry_confidence_history["BTCUSDT"].len(), 1);

        let realized = st.close_position("BTCUSDT", 110.0, 60.0).unwrap();
        assert!((realized - 10.0).abs() < 1e-9);
        assert_eq!(st.total_trades, 1);
        assert_eq!(st.total_wins, 1);
        assert_eq!(st.win_streak, 1);
        assert!(st.positions.is_empty());
        assert!((st.last_exit_time["BTCUSDT"] - 60.0).abs() < f64::EPSILON);
        assert!((st.win_rate - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn losing_close_resets_streak_and_marks_loss() {
        let mut st = BrainState::new();
        st.win_streak = 4;
        st.apply_fill("ETHUSDT", Side::Short, 2.0, 100.0, 1.0, 10, 0.8, 50.0);
        let realized = st.close_position("ETHUSDT", 105.0, 60.0).unwrap();
        assert!(realized < 0.0);
        assert_eq!(st.win_streak, 0);
        assert_eq!(st.mark_loss("ETHUSDT"), 1);
        assert_eq!(st.mark_loss("ETH/USDT"), 2);
    }

    #[test]
    fn reduce_position_realizes_partial_pnl() {
        let mut st = BrainState::new();
        st.apply_fill("BTCUSDT", Side::Long, 2.0, 100.0, 1.0, 10, 0.8, 50.0);
        let realized = st.reduce_position("BTCUSDT", 1.2, 105.0).unwrap();
        assert!((realized - 6.0).abs() < 1e-9);
        assert!((st.positions["BTCUSDT"].size - 0.8).abs() < 1e-9);
        // Full trade counters untouched until the final close.
        assert_eq!(st.total_trades, 0);
    }

    #[test]
    fn exit_id_set_dedups_and_caps() {
        let mut set = BoundedIdSet::default();
        assert!(set.insert("a"));
        assert!(!set.insert("a"));
        assert!(set.contains("a"));

        // FIFO eviction at cap.
        let mut st = BoundedIdSet::default();
        for i in 0..(KNOWN_EXIT_IDS_CAP + 5) {
            st.insert(format!("id-{i}"));
        }
        assert_eq!(st.len(), KNOWN_EXIT_IDS_CAP);
        assert!(!st.contains("id-0"));
        assert!(st.contains(&format!("id-{}", KNOWN_EXIT_IDS_CAP + 4)));
    }

    #[test]
    fn confidence_history_capped() {
        let mut st = BrainState::new();
        let hist = st
            .entry_confidence_history
            .entry("BTCUSDT".to_string())
            .or_default();
        for i in 0..(ENTRY_CONF_HISTORY_CAP + 50) {
            hist.push(i as f64);
        }
        st.validate();
        let hist = &st.entry_confidence_history["BTCUSDT"];
        assert_eq!(hist.len(), ENTRY_CONF_HISTORY_CAP);
        // Newest retained.
        assert!((hist.last().copied().unwrap() - (ENTRY_CONF_HISTORY_CAP + 49) as f64).abs()
            < f64::EPSILON);
    }

    #[test]
    fn entry_watches_keep_newest_on_overflow() {
        let mut st = BrainState::new();
        for i in 0..(ENTRY_WATCHES_CAP + 10) {
            st.put_entry_watch(
                &format!("SYM{i}USDT"),
                EntryWatch {
                    symbol_any: format!("SYM{i}USDT"),
                    created_ts: i as f64,
                    confidence: 0.5,
                    reason: "test".to_string(),
                },
            );
        }
        assert_eq!(st.entry_watches.len(), ENTRY_WATCHES_CAP);
        assert!(st.entry_watches.contains_key(&format!(
            "SYM{}USDT",
            ENTRY_WATCHES_CAP + 9
        )));
        assert!(!st.entry_watches.contains_key("SYM0USDT"));
    }

    #[test]
    fn nan_inputs_become_defaults() {
        let mut st = BrainState::new();
        st.current_equity = f64::NAN;
        st.daily_pnl = f64::INFINITY;
        st.validate();
        assert_eq!(st.current_equity, 0.0);
        assert_eq!(st.daily_pnl, 0.0);
    }

    #[test]
    fn rr_multiple_math() {
        let p = Position {
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            size: 1.0,
            entry_price: 100.0,
            atr: 1.0,
            ..Position::default()
        };
        // Stop distance = 1.0 * 1.0; price +1.3 => rr 1.3
        assert!((p.rr_multiple(101.3, 1.0) - 1.3).abs() < 1e-9);
        let mut short = p.clone();
        short.side = Side::Short;
        assert!((short.rr_multiple(98.7, 1.0) - 1.3).abs() < 1e-9);
    }

    #[test]
    fn day_roll_resets_daily_pnl() {
        let mut st = BrainState::new();
        // 2024-01-01 12:00 UTC
        st.record_equity(100.0, 1_704_110_400.0);
        st.daily_pnl = 5.0;
        // Next day
        st.record_equity(100.0, 1_704_196_800.0);
        assert_eq!(st.daily_pnl, 0.0);
        assert!((st.start_of_day_equity - 100.0).abs() < f64::EPSILON);
    }
}
