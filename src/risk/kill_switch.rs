// =============================================================================
// Kill Switch — global entry gate over data health, API health, and equity
// =============================================================================
//
// Trip families, evaluated on every governor tick:
//   1. Data staleness  — an in-position symbol's ticker went quiet past its
//                        threshold (after the boot grace period).
//   2. API health      — error rate over the recent request window, or a
//                        burst of consecutive errors.
//   3. Equity          — drawdown from the session peak, or a fast drop
//                        within the velocity window.
//   4. Daily loss      — daily PnL beyond the configured fraction of
//                        start-of-day equity.
//
// A trip denies new entries for the cooldown period; open positions keep
// being managed. Repeated trips inside the escalation window can escalate to
// an emergency flat.
// =============================================================================

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

use crate::data::oracle::StaleReport;

/// Sliding window of request outcomes retained for rate computation.
const API_WINDOW_CAP: usize = 200;

// =============================================================================
// API statistics
// =============================================================================

#[derive(Debug, Default)]
struct ApiInner {
    /// true = error, newest last.
    outcomes: VecDeque<bool>,
    consecutive_errors: u32,
}

/// Shared request-outcome recorder. Every REST caller reports here so the
/// kill switch sees one picture of venue health.
#[derive(Debug, Default)]
pub struct ApiStats {
    inner: Mutex<ApiInner>,
}

impl ApiStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_ok(&self) {
        let mut inner = self.inner.lock();
        inner.outcomes.push_back(false);
        while inner.outcomes.len() > API_WINDOW_CAP {
            inner.outcomes.pop_front();
        }
        inner.consecutive_errors = 0;
    }

    pub fn record_err(&self) {
        let mut inner = self.inner.lock();
        inner.outcomes.push_back(true);
        while inner.outcomes.len() > API_WINDOW_CAP {
            inner.outcomes.pop_front();
        }
        inner.consecutive_errors += 1;
    }

    pub fn total_requests(&self) -> usize {
        self.inner.lock().outcomes.len()
    }

    pub fn error_rate(&self) -> f64 {
        let inner = self.inner.lock();
        if inner.outcomes.is_empty() {
            return 0.0;
        }
        inner.outcomes.iter().filter(|e| **e).count() as f64 / inner.outcomes.len() as f64
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.inner.lock().consecutive_errors
    }
}

// =============================================================================
// Kill switch
// =============================================================================

#[derive(Debug, Clone)]
pub struct KillSwitchConfig {
    pub enabled: bool,
    pub cooldown_sec: f64,
    pub boot_grace_sec: f64,
    pub max_api_error_rate: f64,
    pub max_api_error_burst: u32,
    pub min_req_window: u32,
    pub session_peak_protection_pct: f64,
    pub velocity_drawdown_pct: f64,
    pub velocity_minutes: f64,
    pub max_daily_loss_pct: f64,
    pub emergency_flat: bool,
    pub escalate_flat_after_trips: u32,
    pub escalate_window_sec: f64,
    pub trip_history_max: usize,
}

impl Default for KillSwitchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cooldown_sec: 300.0,
            boot_grace_sec: 120.0,
            max_api_error_rate: 0.35,
            max_api_error_burst: 12,
            min_req_window: 10,
            session_peak_protection_pct: 0.10,
            velocity_drawdown_pct: 0.06,
            velocity_minutes: 6.0,
            max_daily_loss_pct: 0.15,
            emergency_flat: false,
            escalate_flat_after_trips: 0,
            escalate_window_sec: 900.0,
            trip_history_max: 12,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TripRecord {
    pub ts: f64,
    pub reason: String,
}

/// Equity figures the governor hands in on each tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct EquityView {
    pub current_drawdown_pct: f64,
    pub daily_pnl: f64,
    pub start_of_day_equity: f64,
}

#[derive(Debug, Default)]
struct KsInner {
    halted_until: f64,
    trips: VecDeque<TripRecord>,
    /// (ts, equity) observations inside the velocity window.
    equity_window: VecDeque<(f64, f64)>,
}

pub struct KillSwitch {
    config: KillSwitchConfig,
    boot_ts: f64,
    inner: Mutex<KsInner>,
}

impl KillSwitch {
    pub fn new(config: KillSwitchConfig, boot_ts: f64) -> Self {
        Self {
            config,
            boot_ts,
            inner: Mutex::new(KsInner::default()),
        }
    }

    pub fn is_halted(&self, now: f64) -> bool {
        self.inner.lock().halted_until > now
    }

    /// Entry gate: `(allowed, deny_reason)`.
    pub fn allow_entry(&self, now: f64) -> (bool, Option<String>) {
        let inner = self.inner.lock();
        if inner.halted_until > now {
            let remaining = inner.halted_until - now;
            return (
                false,
                Some(format!("kill switch active for {remaining:.0}s more")),
            );
        }
        (true, None)
    }

    pub fn trip_history(&self) -> Vec<TripRecord> {
        self.inner.lock().trips.iter().cloned().collect()
    }

    /// Feed an equity observation into the velocity window.
    pub fn record_equity(&self, equity: f64, ts: f64) {
        let mut inner = self.inner.lock();
        inner.equity_window.push_back((ts, equity));
        let horizon = ts - self.config.velocity_minutes * 60.0 - 1.0;
        while inner
            .equity_window
            .front()
            .map(|(t, _)| *t < horizon)
            .unwrap_or(false)
        {
            inner.equity_window.pop_front();
        }
    }

    /// Evaluate all trip families. Returns the trip reason when the switch
    /// fires on this tick.
    pub fn evaluate(
        &self,
        now: f64,
        stale_report: &StaleReport,
        in_positions: &std::collections::HashSet<String>,
        api: &ApiStats,
        equity: EquityView,
    ) -> Option<String> {
        if !self.config.enabled || self.is_halted(now) {
            return None;
        }

        let reason = self
            .check_data_staleness(now, stale_report, in_positions)
            .or_else(|| self.check_api_health(api))
            .or_else(|| self.check_equity(now, equity))
            .or_else(|| Self::check_daily_loss(&self.config, equity))?;

        self.trip(&reason, now);
        Some(reason)
    }

    fn check_data_staleness(
        &self,
        now: f64,
        report: &StaleReport,
        in_positions: &std::collections::HashSet<String>,
    ) -> Option<String> {
        if now - self.boot_ts < self.config.boot_grace_sec {
            return None;
        }
        report
            .stale
            .iter()
            .find(|e| e.kind == "ticker" && in_positions.contains(&e.symbol))
            .map(|e| {
                format!(
                    "stale ticker for in-position {} ({:.0}s > {:.0}s)",
                    e.symbol, e.age_sec, e.limit_sec
                )
            })
    }

    fn check_api_health(&self, api: &ApiStats) -> Option<String> {
        let burst = api.consecutive_errors();
        if burst > self.config.max_api_error_burst {
            return Some(format!(
                "api error burst: {burst} consecutive failures"
            ));
        }
        if api.total_requests() >= self.config.min_req_window as usize {
            let rate = api.error_rate();
            if rate > self.config.max_api_error_rate {
                return Some(format!(
                    "api error rate {:.0}% over last {} requests",
                    rate * 100.0,
                    api.total_requests()
                ));
            }
        }
        None
    }

    fn check_equity(&self, _now: f64, equity: EquityView) -> Option<String> {
        if equity.current_drawdown_pct >= self.config.session_peak_protection_pct {
            return Some(format!(
                "session drawdown {:.1}% >= {:.1}%",
                equity.current_drawdown_pct * 100.0,
                self.config.session_peak_protection_pct * 100.0
            ));
        }

        // Velocity: fastest drop inside the window.
        let inner = self.inner.lock();
        let mut peak = f64::NEG_INFINITY;
        let mut current = None;
        for &(_, eq) in inner.equity_window.iter() {
            peak = peak.max(eq);
            current = Some(eq);
        }
        if let Some(cur) = current {
            if peak > 0.0 {
                let drop = (peak - cur) / peak;
                if drop >= self.config.velocity_drawdown_pct {
                    return Some(format!(
                        "equity velocity drop {:.1}% within {:.0}m",
                        drop * 100.0,
                        self.config.velocity_minutes
                    ));
                }
            }
        }
        None
    }

    fn check_daily_loss(config: &KillSwitchConfig, equity: EquityView) -> Option<String> {
        if equity.start_of_day_equity <= 0.0 {
            return None;
        }
        let limit = config.max_daily_loss_pct * equity.start_of_day_equity;
        if equity.daily_pnl <= -limit {
            return Some(format!(
                "daily loss {:.2} exceeds {:.2}",
                -equity.daily_pnl, limit
            ));
        }
        None
    }

    fn trip(&self, reason: &str, now: f64) {
        let mut inner = self.inner.lock();
        inner.halted_until = now + self.config.cooldown_sec;
        inner.trips.push_back(TripRecord {
            ts: now,
            reason: reason.to_string(),
        });
        while inner.trips.len() > self.config.trip_history_max {
            inner.trips.pop_front();
        }
        warn!(component = "guardian", reason, "KILL SWITCH TRIPPED");
    }

    /// Whether recent trips warrant flattening all positions.
    pub fn should_emergency_flat(&self, now: f64) -> bool {
        if self.config.escalate_flat_after_trips == 0 {
            return false;
        }
        let inner = self.inner.lock();
        let cutoff = now - self.config.escalate_window_sec;
        let recent = inner.trips.iter().filter(|t| t.ts >= cutoff).count();
        recent >= self.config.escalate_flat_after_trips as usize
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::oracle::StaleEntry;
    use std::collections::HashSet;

    fn stale_ticker_report(symbol: &str, age: f64) -> StaleReport {
        StaleReport {
            ts: 0.0,
            stale: vec![StaleEntry {
                symbol: symbol.to_string(),
                kind: "ticker",
                tf: String::new(),
                age_sec: age,
                limit_sec: 15.0,
                last_error: String::new(),
                fail_streak: 0,
            }],
            ok_count: 0,
            stale_count: 1,
        }
    }

    fn empty_report() -> StaleReport {
        StaleReport {
            ts: 0.0,
            stale: Vec::new(),
            ok_count: 1,
            stale_count: 0,
        }
    }

    #[test]
    fn stale_in_position_ticker_trips_after_grace() {
        let ks = KillSwitch::new(KillSwitchConfig::default(), 0.0);
        let api = ApiStats::new();
        let in_pos: HashSet<String> = HashSet::from(["ETHUSDT".to_string()]);
        let report = stale_ticker_report("ETHUSDT", 20.0);

        // Inside boot grace: no trip.
        assert!(ks
            .evaluate(60.0, &report, &in_pos, &api, EquityView::default())
            .is_none());

        // Past grace: trip, entries denied for the cooldown.
        let reason = ks
            .evaluate(140.0, &report, &in_pos, &api, EquityView::default())
            .expect("must trip");
        assert!(reason.contains("ETHUSDT"));
        assert!(ks.is_halted(141.0));

        let (allowed, deny) = ks.allow_entry(141.0);
        assert!(!allowed);
        assert!(deny.unwrap().contains("kill switch"));

        // Cooldown expires.
        assert!(!ks.is_halted(140.0 + 301.0));
        assert!(ks.allow_entry(140.0 + 301.0).0);
    }

    #[test]
    fn stale_ticker_for_idle_symbol_does_not_trip() {
        let ks = KillSwitch::new(KillSwitchConfig::default(), 0.0);
        let api = ApiStats::new();
        let in_pos: HashSet<String> = HashSet::new();
        let report = stale_ticker_report("ETHUSDT", 20.0);
        assert!(ks
            .evaluate(500.0, &report, &in_pos, &api, EquityView::default())
            .is_none());
    }

    #[test]
    fn api_burst_trips() {
        let ks = KillSwitch::new(KillSwitchConfig::default(), 0.0);
        let api = ApiStats::new();
        for _ in 0..13 {
            api.record_err();
        }
        let reason = ks
            .evaluate(500.0, &empty_report(), &HashSet::new(), &api, EquityView::default())
            .expect("burst trips");
        assert!(reason.contains("burst"));
    }

    #[test]
    fn api_error_rate_needs_min_window() {
        let ks = KillSwitch::new(KillSwitchConfig::default(), 0.0);
        let api = ApiStats::new();
        // 3 errors out of 5: rate 60% but below the minimum request window.
        for _ in 0..2 {
            api.record_ok();
        }
        for _ in 0..3 {
            api.record_err();
        }
        assert!(ks
            .evaluate(500.0, &empty_report(), &HashSet::new(), &api, EquityView::default())
            .is_none());

        // Same ratio over a full window trips.
        for _ in 0..4 {
            api.record_ok();
        }
        for _ in 0..6 {
            api.record_err();
        }
        let reason = ks
            .evaluate(500.0, &empty_report(), &HashSet::new(), &api, EquityView::default())
            .expect("rate trips");
        assert!(reason.contains("rate"));
    }

    #[test]
    fn drawdown_and_daily_loss_trip() {
        let ks = KillSwitch::new(KillSwitchConfig::default(), 0.0);
        let api = ApiStats::new();

        let reason = ks
            .evaluate(
                500.0,
                &empty_report(),
                &HashSet::new(),
                &api,
                EquityView {
                    current_drawdown_pct: 0.12,
                    ..EquityView::default()
                },
            )
            .expect("drawdown trips");
        assert!(reason.contains("drawdown"));

        let ks2 = KillSwitch::new(KillSwitchConfig::default(), 0.0);
        let reason = ks2
            .evaluate(
                500.0,
                &empty_report(),
                &HashSet::new(),
                &api,
                EquityView {
                    daily_pnl: -20.0,
                    start_of_day_equity: 100.0,
                    ..EquityView::default()
                },
            )
            .expect("daily loss trips");
        assert!(reason.contains("daily loss"));
    }

    #[test]
    fn velocity_drop_trips() {
        let ks = KillSwitch::new(KillSwitchConfig::default(), 0.0);
        let api = ApiStats::new();
        ks.record_equity(100.0, 400.0);
        ks.record_equity(92.0, 500.0);

        let reason = ks
            .evaluate(500.0, &empty_report(), &HashSet::new(), &api, EquityView::default())
            .expect("velocity trips");
        assert!(reason.contains("velocity"));
    }

    #[test]
    fn velocity_window_forgets_old_peaks() {
        let ks = KillSwitch::new(KillSwitchConfig::default(), 0.0);
        ks.record_equity(100.0, 0.0);
        // Much later, well past the 6-minute window.
        ks.record_equity(92.0, 3_600.0);

        let api = ApiStats::new();
        assert!(ks
            .evaluate(3_600.0, &empty_report(), &HashSet::new(), &api, EquityView::default())
            .is_none());
    }

    #[test]
    fn escalation_after_repeated_trips() {
        let config = KillSwitchConfig {
            escalate_flat_after_trips: 2,
            cooldown_sec: 10.0,
            ..KillSwitchConfig::default()
        };
        let ks = KillSwitch::new(config, 0.0);
        let api = ApiStats::new();
        let in_pos: HashSet<String> = HashSet::from(["ETHUSDT".to_string()]);
        let report = stale_ticker_report("ETHUSDT", 20.0);

        assert!(ks.evaluate(200.0, &report, &in_pos, &api, EquityView::default()).is_some());
        assert!(!ks.should_emergency_flat(200.0));

        // Second trip after the first cooldown lapses, inside the window.
        assert!(ks.evaluate(250.0, &report, &in_pos, &api, EquityView::default()).is_some());
        assert!(ks.should_emergency_flat(250.0));
    }

    #[test]
    fn trip_history_bounded() {
        let config = KillSwitchConfig {
            trip_history_max: 3,
            cooldown_sec: 1.0,
            ..KillSwitchConfig::default()
        };
        let ks = KillSwitch::new(config, 0.0);
        for i in 0..10 {
            ks.trip("test", 200.0 + i as f64 * 5.0);
        }
        assert_eq!(ks.trip_history().len(), 3);
    }

    #[test]
    fn disabled_switch_never_trips() {
        let config = KillSwitchConfig {
            enabled: false,
            ..KillSwitchConfig::default()
        };
        let ks = KillSwitch::new(config, 0.0);
        let api = ApiStats::new();
        let in_pos: HashSet<String> = HashSet::from(["ETHUSDT".to_string()]);
        assert!(ks
            .evaluate(
                500.0,
                &stale_ticker_report("ETHUSDT", 900.0),
                &in_pos,
                &api,
                EquityView::default()
            )
            .is_none());
    }
}
