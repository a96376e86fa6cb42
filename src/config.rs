// =============================================================================
// Configuration — single Config struct with profile overrides
// =============================================================================
//
// Precedence: environment variables > config file > defaults.
//
// Every field has a default, so an empty (or missing) JSON file yields a
// working configuration. `Profile::Micro` rewrites the risk/reward surface
// for sub-$100 accounts; invalid combinations fail hard in `validate()`
// before any task is spawned.
// =============================================================================

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

// =============================================================================
// Profile
// =============================================================================

/// Capital profile. `Micro` overrides defaults for very small accounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Profile {
    #[default]
    Production,
    Micro,
}

impl std::fmt::Display for Profile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Production => write!(f, "Production"),
            Self::Micro => write!(f, "Micro"),
        }
    }
}

// =============================================================================
// Config
// =============================================================================

/// Engine configuration. Field groups mirror the subsystems that read them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub profile: Profile,

    // --- Symbol universe ----------------------------------------------------
    pub active_symbols: Vec<String>,

    // --- Risk & preservation ------------------------------------------------
    pub max_risk_per_trade: f64,
    pub max_portfolio_heat: f64,
    pub max_concurrent_positions: usize,
    pub max_daily_loss_pct: f64,
    pub symbol_cooldown_minutes: f64,
    pub consecutive_loss_blacklist_count: u32,
    pub symbol_blacklist_duration_hours: f64,
    pub correlation_heat_cap: f64,
    pub session_equity_peak_protection_pct: f64,
    pub velocity_drawdown_pct: f64,
    pub velocity_minutes: f64,
    pub min_atr_pct_for_entry: f64,

    // --- Leverage & execution -----------------------------------------------
    pub leverage: u32,
    pub slippage_max_pct: f64,
    pub slippage_orderbook_depth: usize,

    // --- Stops, take-profit & trailing --------------------------------------
    pub stop_atr_mult: f64,
    pub max_stop_pct: f64,
    pub breakeven_buffer_atr_mult: f64,
    pub tp1_rr_mult: f64,
    pub tp2_rr_mult: f64,
    pub tp1_close_fraction: f64,
    pub trailing_activation_rr: f64,
    /// Base trailing callback as a percent of price (0.45 = 0.45%).
    pub trailing_callback_rate_pct: f64,
    pub trailing_vol_mult_min: f64,
    pub trailing_vol_mult_max: f64,
    /// ATR% producing a 1.0x trailing volatility multiplier.
    pub trailing_atr_reference_pct: f64,

    // --- Funding filters ----------------------------------------------------
    pub max_funding_long: f64,
    pub min_funding_short: f64,

    // --- Entry gate ---------------------------------------------------------
    pub entry_min_confidence: f64,
    pub entry_min_confidence_high_vol: f64,
    /// ATR% above which the relaxed high-volatility confidence floor applies.
    pub entry_high_vol_atr_pct: f64,
    pub entry_poll_sec: f64,
    pub entry_per_symbol_gap_sec: f64,
    pub entry_local_cooldown_sec: f64,
    pub entry_router_retries: u32,
    pub order_retry_sleep_sec: f64,
    pub fixed_notional_usdt: f64,
    pub min_notional_usdt: f64,
    pub min_margin_usdt: f64,

    // --- Exit management ----------------------------------------------------
    pub exit_poll_sec: f64,
    pub reconcile_interval_sec: f64,
    pub time_exit_enabled: bool,
    pub max_holding_minutes: f64,
    pub time_exit_warning_minutes: f64,
    pub time_decay_start_pct: f64,

    // --- Kill switch --------------------------------------------------------
    pub kill_switch_enabled: bool,
    pub kill_switch_cooldown_sec: f64,
    pub kill_data_boot_grace_sec: f64,
    pub kill_max_api_error_rate: f64,
    pub kill_max_api_error_burst: u32,
    pub kill_min_req_window: u32,
    pub kill_switch_emergency_flat: bool,
    pub kill_escalate_flat_after_trips: u32,
    pub kill_escalate_window_sec: f64,
    pub kill_switch_trip_history_max: usize,

    // --- WebSocket streaming ------------------------------------------------
    pub ws_enabled: bool,
    pub ws_reconnect_delay_sec: f64,
    pub ws_reconnect_max_delay_sec: f64,
    pub ws_reconnect_backoff_mult: f64,
    pub ws_stale_threshold_sec: f64,

    // --- Order flow ---------------------------------------------------------
    pub flow_depth_levels: usize,
    pub flow_imbalance_threshold: f64,
    pub flow_large_order_threshold_usdt: f64,
    pub flow_absorption_threshold: f64,
    pub flow_stale_threshold_sec: f64,

    // --- Machine learning filter --------------------------------------------
    pub ml_enabled: bool,
    pub ml_min_confidence: f64,
    pub ml_min_samples_for_training: usize,
    pub ml_retrain_interval: usize,
    pub ml_ensemble_weight: f64,
    pub ml_model_path: String,

    // --- Rule-signal weights ------------------------------------------------
    pub signal_momentum_weight: f64,
    pub signal_rsi_weight: f64,
    pub signal_trend_weight: f64,
    pub signal_bollinger_weight: f64,
    pub signal_flow_weight: f64,

    // --- Heartbeat ----------------------------------------------------------
    pub heartbeat_data_loop_sec: f64,
    pub heartbeat_signal_loop_sec: f64,
    pub heartbeat_guardian_sec: f64,
    pub heartbeat_entry_loop_sec: f64,
    pub heartbeat_alert_after_miss: u32,

    // --- Distributed locking ------------------------------------------------
    pub lock_enabled: bool,
    /// "file" or "redis".
    pub lock_backend: String,
    pub lock_path: String,
    pub lock_redis_url: String,
    pub lock_timeout_sec: f64,
    pub stale_lock_sec: f64,

    // --- Persistence paths --------------------------------------------------
    pub brain_path: String,
    pub cache_path: String,
    pub cache_warm_start: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            profile: Profile::Production,

            active_symbols: vec!["BTCUSDT".to_string()],

            max_risk_per_trade: 0.10,
            max_portfolio_heat: 0.45,
            max_concurrent_positions: 6,
            max_daily_loss_pct: 0.15,
            symbol_cooldown_minutes: 20.0,
            consecutive_loss_blacklist_count: 3,
            symbol_blacklist_duration_hours: 4.0,
            correlation_heat_cap: 0.30,
            session_equity_peak_protection_pct: 0.10,
            velocity_drawdown_pct: 0.06,
            velocity_minutes: 6.0,
            min_atr_pct_for_entry: 0.007,

            leverage: 20,
            slippage_max_pct: 0.006,
            slippage_orderbook_depth: 20,

            stop_atr_mult: 1.10,
            max_stop_pct: 0.03,
            breakeven_buffer_atr_mult: 0.30,
            tp1_rr_mult: 1.00,
            tp2_rr_mult: 2.00,
            tp1_close_fraction: 0.60,
            trailing_activation_rr: 1.30,
            trailing_callback_rate_pct: 0.45,
            trailing_vol_mult_min: 0.5,
            trailing_vol_mult_max: 2.0,
            trailing_atr_reference_pct: 0.01,

            max_funding_long: 0.0006,
            min_funding_short: -0.0004,

            entry_min_confidence: 0.72,
            entry_min_confidence_high_vol: 0.65,
            entry_high_vol_atr_pct: 0.015,
            entry_poll_sec: 1.0,
            entry_per_symbol_gap_sec: 2.5,
            entry_local_cooldown_sec: 8.0,
            entry_router_retries: 6,
            order_retry_sleep_sec: 0.25,
            fixed_notional_usdt: 25.0,
            min_notional_usdt: 5.0,
            min_margin_usdt: 2.0,

            exit_poll_sec: 5.0,
            reconcile_interval_sec: 60.0,
            time_exit_enabled: true,
            max_holding_minutes: 240.0,
            time_exit_warning_minutes: 180.0,
            time_decay_start_pct: 0.5,

            kill_switch_enabled: true,
            kill_switch_cooldown_sec: 300.0,
            kill_data_boot_grace_sec: 120.0,
            kill_max_api_error_rate: 0.35,
            kill_max_api_error_burst: 12,
            kill_min_req_window: 10,
            kill_switch_emergency_flat: false,
            kill_escalate_flat_after_trips: 0,
            kill_escalate_window_sec: 900.0,
            kill_switch_trip_history_max: 12,

            ws_enabled: true,
            ws_reconnect_delay_sec: 5.0,
            ws_reconnect_max_delay_sec: 300.0,
            ws_reconnect_backoff_mult: 1.5,
            ws_stale_threshold_sec: 60.0,

            flow_depth_levels: 10,
            flow_imbalance_threshold: 0.6,
            flow_large_order_threshold_usdt: 50_000.0,
            flow_absorption_threshold: 0.7,
            flow_stale_threshold_sec: 30.0,

            ml_enabled: false,
            ml_min_confidence: 0.6,
            ml_min_samples_for_training: 100,
            ml_retrain_interval: 25,
            ml_ensemble_weight: 0.4,
            ml_model_path: String::new(),

            signal_momentum_weight: 0.30,
            signal_rsi_weight: 0.20,
            signal_trend_weight: 0.20,
            signal_bollinger_weight: 0.10,
            signal_flow_weight: 0.20,

            heartbeat_data_loop_sec: 30.0,
            heartbeat_signal_loop_sec: 120.0,
            heartbeat_guardian_sec: 15.0,
            heartbeat_entry_loop_sec: 60.0,
            heartbeat_alert_after_miss: 3,

            lock_enabled: false,
            lock_backend: "file".to_string(),
            lock_path: "~/.penumbra_locks/".to_string(),
            lock_redis_url: String::new(),
            lock_timeout_sec: 60.0,
            stale_lock_sec: 120.0,

            brain_path: "~/.penumbra.brain.lz4".to_string(),
            cache_path: "~/.penumbra.cache.json".to_string(),
            cache_warm_start: true,
        }
    }
}

impl Config {
    /// Resolve the final configuration: defaults, then the file at `path`
    /// (if present), then environment variables, then profile overrides,
    /// then validation.
    pub fn resolve(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let mut cfg = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config from {}", path.display()))?;
            serde_json::from_str::<Self>(&content)
                .with_context(|| format!("failed to parse config from {}", path.display()))?
        } else {
            warn!(path = %path.display(), "config file not found, using defaults");
            Self::default()
        };

        // Profile first (itself overridable from the environment), then
        // scalar env overrides so they always win over profile defaults.
        if let Ok(p) = std::env::var("PENUMBRA_PROFILE") {
            match p.to_lowercase().as_str() {
                "micro" => cfg.profile = Profile::Micro,
                "production" => cfg.profile = Profile::Production,
                other => warn!(profile = other, "unknown PENUMBRA_PROFILE ignored"),
            }
        }
        if cfg.profile == Profile::Micro {
            cfg.apply_micro_overrides();
        }
        cfg.apply_env();
        cfg.validate()?;

        info!(
            profile = %cfg.profile,
            symbols = ?cfg.active_symbols,
            notional = cfg.fixed_notional_usdt,
            "configuration resolved"
        );
        Ok(cfg)
    }

    /// Environment overrides (highest precedence).
    fn apply_env(&mut self) {
        if let Ok(syms) = std::env::var("PENUMBRA_SYMBOLS") {
            let parsed: Vec<String> = syms
                .split(',')
                .map(|s| crate::util::canon_symbol(s))
                .filter(|s| !s.is_empty())
                .collect();
            if !parsed.is_empty() {
                self.active_symbols = parsed;
            }
        }
        if let Ok(v) = std::env::var("PENUMBRA_NOTIONAL_USDT") {
            let n = crate::util::safe_parse_f64(&v, self.fixed_notional_usdt);
            if n > 0.0 {
                self.fixed_notional_usdt = n;
            }
        }
        if let Ok(v) = std::env::var("PENUMBRA_ML_ENABLED") {
            self.ml_enabled = matches!(v.to_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Ok(v) = std::env::var("PENUMBRA_BRAIN_PATH") {
            if !v.is_empty() {
                self.brain_path = v;
            }
        }
        if let Ok(v) = std::env::var("PENUMBRA_REDIS_URL") {
            if !v.is_empty() {
                self.lock_redis_url = v;
                self.lock_backend = "redis".to_string();
            }
        }
    }

    /// Micro-capital overrides for accounts under ~$100.
    fn apply_micro_overrides(&mut self) {
        self.max_risk_per_trade = 0.06;
        self.max_portfolio_heat = 0.15;
        self.max_concurrent_positions = 1;
        self.max_daily_loss_pct = 0.20;
        self.symbol_cooldown_minutes = 12.0;
        self.correlation_heat_cap = 0.12;
        self.session_equity_peak_protection_pct = 0.12;
        self.velocity_drawdown_pct = 0.07;
        self.velocity_minutes = 5.0;
        self.min_atr_pct_for_entry = 0.006;
        self.leverage = 35;
        self.slippage_max_pct = 0.010;
        self.stop_atr_mult = 1.00;
        self.max_stop_pct = 0.035;
        self.breakeven_buffer_atr_mult = 0.20;
        self.tp2_rr_mult = 2.20;
        self.trailing_activation_rr = 1.20;
        self.trailing_callback_rate_pct = 0.40;
        self.entry_min_confidence = 0.35;
        self.entry_min_confidence_high_vol = 0.30;
        self.min_margin_usdt = 0.75;
        self.order_retry_sleep_sec = 0.35;
        self.fixed_notional_usdt = 8.0;
    }

    /// Constructor-time sanity checks. Invalid combinations are fatal.
    pub fn validate(&self) -> Result<()> {
        if !(self.max_risk_per_trade > 0.0 && self.max_risk_per_trade <= 0.50) {
            bail!("max_risk_per_trade must be in (0, 0.50]");
        }
        if !(self.max_portfolio_heat > 0.0 && self.max_portfolio_heat <= 1.0) {
            bail!("max_portfolio_heat must be in (0, 1.0]");
        }
        if self.max_concurrent_positions < 1 {
            bail!("max_concurrent_positions must be >= 1");
        }
        if self.leverage < 1 {
            bail!("leverage must be >= 1");
        }
        if !(self.entry_min_confidence > 0.0 && self.entry_min_confidence <= 1.0) {
            bail!("entry_min_confidence must be in (0, 1.0]");
        }
        if !(0.0..=1.0).contains(&self.max_daily_loss_pct) {
            bail!("max_daily_loss_pct must be in [0, 1.0]");
        }
        if !(self.correlation_heat_cap > 0.0 && self.correlation_heat_cap <= 1.0) {
            bail!("correlation_heat_cap must be in (0, 1.0]");
        }
        if !(0.0..=1.0).contains(&self.tp1_close_fraction) {
            bail!("tp1_close_fraction must be in [0, 1.0]");
        }
        if self.trailing_vol_mult_min > self.trailing_vol_mult_max {
            bail!("trailing_vol_mult_min must not exceed trailing_vol_mult_max");
        }
        if !(0.0..=1.0).contains(&self.ml_ensemble_weight) {
            bail!("ml_ensemble_weight must be in [0, 1.0]");
        }
        if self.lock_backend != "file" && self.lock_backend != "redis" {
            bail!("lock_backend must be \"file\" or \"redis\"");
        }
        if self.lock_backend == "redis" && self.lock_enabled && self.lock_redis_url.is_empty() {
            bail!("lock_backend=redis requires lock_redis_url");
        }
        if self.active_symbols.is_empty() {
            bail!("active_symbols must not be empty");
        }
        Ok(())
    }

    /// Expand a leading `~` in a configured path.
    pub fn expand_path(path: &str) -> std::path::PathBuf {
        if let Some(rest) = path.strip_prefix("~/") {
            if let Ok(home) = std::env::var("HOME") {
                return std::path::PathBuf::from(home).join(rest);
            }
        }
        std::path::PathBuf::from(path)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.profile, Profile::Production);
        assert_eq!(cfg.max_concurrent_positions, 6);
        assert!((cfg.entry_min_confidence - 0.72).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_json_uses_defaults() {
        let cfg: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.active_symbols, vec!["BTCUSDT"]);
        assert!((cfg.slippage_max_pct - 0.006).abs() < f64::EPSILON);
        assert_eq!(cfg.entry_router_retries, 6);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: Config =
            serde_json::from_str(r#"{ "active_symbols": ["ETHUSDT"], "leverage": 10 }"#).unwrap();
        assert_eq!(cfg.active_symbols, vec!["ETHUSDT"]);
        assert_eq!(cfg.leverage, 10);
        assert_eq!(cfg.max_concurrent_positions, 6);
    }

    #[test]
    fn micro_profile_rewrites_risk_surface() {
        let mut cfg = Config::default();
        cfg.profile = Profile::Micro;
        cfg.apply_micro_overrides();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.max_concurrent_positions, 1);
        assert!((cfg.entry_min_confidence - 0.35).abs() < f64::EPSILON);
        assert!((cfg.fixed_notional_usdt - 8.0).abs() < f64::EPSILON);
    }

    #[test]
    fn invalid_combination_fails_hard() {
        let mut cfg = Config::default();
        cfg.max_risk_per_trade = 0.9;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.lock_backend = "etcd".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.lock_enabled = true;
        cfg.lock_backend = "redis".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = Config::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.active_symbols, cfg2.active_symbols);
        assert_eq!(cfg.kill_min_req_window, cfg2.kill_min_req_window);
    }
}
