// =============================================================================
// Time exits — maximum holding period with warning and decay
// =============================================================================
//
// A scalp that has gone nowhere for hours is dead inventory. Positions warn
// at `warning_minutes`, are force-closed at `max_holding_minutes`, and feed a
// linear decay factor into downstream sizing between `decay_start_pct` of
// the maximum and the hard limit.
// =============================================================================

use serde::Serialize;

use crate::brain::Position;

#[derive(Debug, Clone)]
pub struct TimeExitConfig {
    pub enabled: bool,
    pub max_holding_minutes: f64,
    pub warning_minutes: f64,
    pub decay_start_pct: f64,
}

impl Default for TimeExitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_holding_minutes: 240.0,
            warning_minutes: 180.0,
            decay_start_pct: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TimeExitResult {
    pub should_exit: bool,
    pub should_warn: bool,
    pub time_held_minutes: f64,
    pub time_remaining_minutes: f64,
    pub decay_factor: f64,
    pub reason: String,
}

/// Full time analysis for one position at `now`.
pub fn analyze(pos: &Position, now: f64, config: &TimeExitConfig) -> TimeExitResult {
    if !config.enabled || pos.entry_ts <= 0.0 {
        return TimeExitResult {
            should_exit: false,
            should_warn: false,
            time_held_minutes: 0.0,
            time_remaining_minutes: config.max_holding_minutes,
            decay_factor: 1.0,
            reason: "time exit disabled or no entry timestamp".to_string(),
        };
    }

    let held_min = (now - pos.entry_ts).max(0.0) / 60.0;
    let remaining_min = (config.max_holding_minutes - held_min).max(0.0);

    let should_exit = held_min >= config.max_holding_minutes;
    let should_warn = !should_exit && held_min >= config.warning_minutes;

    let reason = if should_exit {
        format!(
            "max holding time exceeded: {held_min:.1}m >= {:.0}m",
            config.max_holding_minutes
        )
    } else if should_warn {
        format!("time warning: {remaining_min:.1}m remaining")
    } else {
        format!("{held_min:.1}m / {:.0}m", config.max_holding_minutes)
    };

    TimeExitResult {
        should_exit,
        should_warn,
        time_held_minutes: held_min,
        time_remaining_minutes: remaining_min,
        decay_factor: decay_factor(held_min, config),
        reason,
    }
}

/// Linear decay from 1.0 at `decay_start_pct * max` down to 0.0 at the max.
pub fn decay_factor(held_min: f64, config: &TimeExitConfig) -> f64 {
    let max_min = config.max_holding_minutes;
    let start_min = max_min * config.decay_start_pct;
    if held_min <= start_min {
        return 1.0;
    }
    let span = max_min - start_min;
    if span <= 0.0 {
        return 1.0;
    }
    (1.0 - (held_min - start_min) / span).clamp(0.0, 1.0)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::brain::Side;

    fn pos_opened_at(entry_ts: f64) -> Position {
        Position {
            symbol: "BTCUSDT".to_string(),
            side: Side::Long,
            size: 1.0,
            entry_price: 100.0,
            entry_ts,
            ..Position::default()
        }
    }

    #[test]
    fn young_position_is_left_alone() {
        let cfg = TimeExitConfig::default();
        let r = analyze(&pos_opened_at(1_000.0), 1_000.0 + 30.0 * 60.0, &cfg);
        assert!(!r.should_exit);
        assert!(!r.should_warn);
        assert!((r.decay_factor - 1.0).abs() < 1e-9);
    }

    #[test]
    fn warning_before_forced_exit() {
        let cfg = TimeExitConfig::default();
        let r = analyze(&pos_opened_at(1_000.0), 1_000.0 + 185.0 * 60.0, &cfg);
        assert!(r.should_warn);
        assert!(!r.should_exit);
        assert!(r.reason.contains("warning"));
    }

    #[test]
    fn forced_exit_at_max_holding() {
        let cfg = TimeExitConfig::default();
        let r = analyze(&pos_opened_at(1_000.0), 1_000.0 + 240.0 * 60.0, &cfg);
        assert!(r.should_exit);
        assert!(!r.should_warn);
        assert_eq!(r.time_remaining_minutes, 0.0);
    }

    #[test]
    fn decay_is_linear_from_midpoint() {
        let cfg = TimeExitConfig::default();
        // Decay starts at 120m (50% of 240m).
        assert!((decay_factor(100.0, &cfg) - 1.0).abs() < 1e-9);
        assert!((decay_factor(120.0, &cfg) - 1.0).abs() < 1e-9);
        assert!((decay_factor(180.0, &cfg) - 0.5).abs() < 1e-9);
        assert!((decay_factor(240.0, &cfg) - 0.0).abs() < 1e-9);
        assert_eq!(decay_factor(500.0, &cfg), 0.0);
    }

    #[test]
    fn disabled_never_exits() {
        let cfg = TimeExitConfig {
            enabled: false,
            ..TimeExitConfig::default()
        };
        let r = analyze(&pos_opened_at(1_000.0), 1_000.0 + 10_000.0 * 60.0, &cfg);
        assert!(!r.should_exit);
        assert!((r.decay_factor - 1.0).abs() < 1e-9);
    }

    #[test]
    fn missing_entry_timestamp_is_safe() {
        let cfg = TimeExitConfig::default();
        let r = analyze(&pos_opened_at(0.0), 1_000_000.0, &cfg);
        assert!(!r.should_exit);
        assert!(r.reason.contains("disabled or no entry timestamp"));
    }
}
