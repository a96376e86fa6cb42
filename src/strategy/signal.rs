// =============================================================================
// Rule signal — explicit weighted combination over extracted features
// =============================================================================
//
// The confidence formula is deliberately a plain, testable weighted sum.
// Each component score lives in [-1, 1]; the weighted direction is scaled by
// a trend-quality factor derived from ADX to produce confidence in [0, 1].
// =============================================================================

use serde::Serialize;
use tracing::debug;

use crate::strategy::features::Features;
use crate::util::clip;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Component weights. Normalized at evaluation time, so they only need to be
/// non-negative and not all zero.
#[derive(Debug, Clone, Copy)]
pub struct SignalWeights {
    pub momentum: f64,
    pub rsi: f64,
    pub trend: f64,
    pub bollinger: f64,
    pub flow: f64,
}

impl Default for SignalWeights {
    fn default() -> Self {
        Self {
            momentum: 0.30,
            rsi: 0.20,
            trend: 0.20,
            bollinger: 0.10,
            flow: 0.20,
        }
    }
}

/// Output of the rule engine for one symbol.
#[derive(Debug, Clone, Serialize)]
pub struct RuleSignal {
    pub long_ok: bool,
    pub short_ok: bool,
    pub confidence: f64,
    /// Signed direction in [-1, 1] before the quality scaling.
    pub direction: f64,
    pub reason: String,
}

impl RuleSignal {
    pub fn flat(reason: impl Into<String>) -> Self {
        Self {
            long_ok: false,
            short_ok: false,
            confidence: 0.0,
            direction: 0.0,
            reason: reason.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Rule signal
// ---------------------------------------------------------------------------

/// Evaluate the weighted rule signal for one feature snapshot.
pub fn rule_signal(symbol: &str, f: &Features, weights: &SignalWeights) -> RuleSignal {
    let total_weight =
        weights.momentum + weights.rsi + weights.trend + weights.bollinger + weights.flow;
    if total_weight <= 0.0 {
        return RuleSignal::flat("all signal weights are zero");
    }

    // Component scores, each in [-1, 1].
    // Momentum blends the three timeframes, fast-weighted.
    let momentum_score = clip(
        (f.momentum * 0.5 + f.momentum_5m * 0.3 + f.momentum_15m * 0.2) / 0.01,
        -1.0,
        1.0,
    );
    let rsi_score = clip((f.rsi_14 - 50.0) / 25.0, -1.0, 1.0);
    let trend_score = clip(
        clip(f.trend_strength / 0.01, -1.0, 1.0) * 0.5
            + clip(f.ema_distance / 0.02, -1.0, 1.0) * 0.5,
        -1.0,
        1.0,
    );
    let bollinger_score = clip((f.bb_position - 0.5) * 2.0, -1.0, 1.0);
    let flow_score = clip(
        f.cvd_signal * 0.5 + f.order_imbalance * 0.25 + f.weighted_imbalance * 0.25,
        -1.0,
        1.0,
    );

    let direction = (weights.momentum * momentum_score
        + weights.rsi * rsi_score
        + weights.trend * trend_score
        + weights.bollinger * bollinger_score
        + weights.flow * flow_score)
        / total_weight;

    // ADX scales conviction: a directionless market caps confidence at half.
    let trend_quality = 0.5 + 0.5 * clip(f.adx / 40.0, 0.0, 1.0);
    let confidence = clip(direction.abs() * trend_quality, 0.0, 1.0);

    let reason = format!(
        "mom={momentum_score:.2} rsi={rsi_score:.2} trend={trend_score:.2} \
         bb={bollinger_score:.2} flow={flow_score:.2} adx={:.1}",
        f.adx
    );

    debug!(
        component = "signal",
        symbol,
        direction = format!("{direction:.3}"),
        confidence = format!("{confidence:.3}"),
        "rule signal evaluated"
    );

    RuleSignal {
        long_ok: direction > 0.0,
        short_ok: direction < 0.0,
        confidence,
        direction,
        reason,
    }
}

// ---------------------------------------------------------------------------
// Ensemble with the ML filter
// ---------------------------------------------------------------------------

/// Blend rule confidence with the ML probability. Returns the ensemble
/// confidence, or `None` when the ML filter vetoes the trade.
pub fn ensemble_confidence(
    rule_conf: f64,
    ml_conf: Option<f64>,
    ensemble_weight: f64,
    ml_min_confidence: f64,
) -> Option<f64> {
    match ml_conf {
        None => Some(rule_conf),
        Some(ml) if ml < ml_min_confidence => None,
        Some(ml) => {
            let w = clip(ensemble_weight, 0.0, 1.0);
            Some(clip((1.0 - w) * rule_conf + w * ml, 0.0, 1.0))
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn bullish_features() -> Features {
        Features {
            momentum: 0.02,
            momentum_5m: 0.02,
            momentum_15m: 0.02,
            rsi_14: 75.0,
            trend_strength: 0.02,
            ema_distance: 0.04,
            bb_position: 0.9,
            cvd_signal: 0.8,
            order_imbalance: 0.6,
            weighted_imbalance: 0.6,
            adx: 40.0,
            ..Features::default()
        }
    }

    #[test]
    fn strongly_bullish_features_signal_long() {
        let sig = rule_signal("BTCUSDT", &bullish_features(), &SignalWeights::default());
        assert!(sig.long_ok);
        assert!(!sig.short_ok);
        assert!(sig.confidence > 0.7, "confidence was {}", sig.confidence);
    }

    #[test]
    fn mirrored_features_signal_short() {
        let f = Features {
            momentum: -0.02,
            momentum_5m: -0.02,
            momentum_15m: -0.02,
            rsi_14: 25.0,
            trend_strength: -0.02,
            ema_distance: -0.04,
            bb_position: 0.1,
            cvd_signal: -0.8,
            order_imbalance: -0.6,
            weighted_imbalance: -0.6,
            adx: 40.0,
            ..Features::default()
        };
        let sig = rule_signal("BTCUSDT", &f, &SignalWeights::default());
        assert!(sig.short_ok);
        assert!(!sig.long_ok);
        assert!(sig.confidence > 0.7);
    }

    #[test]
    fn neutral_features_have_no_conviction() {
        let sig = rule_signal("BTCUSDT", &Features::default(), &SignalWeights::default());
        assert!(sig.confidence < 0.05);
    }

    #[test]
    fn weighted_sum_matches_hand_computation() {
        // Only the RSI component is non-neutral; direction must equal the
        // normalized rsi weight times its score.
        let f = Features {
            rsi_14: 75.0, // rsi_score = 1.0
            adx: 0.0,     // trend_quality = 0.5
            ..Features::default()
        };
        let w = SignalWeights {
            momentum: 0.0,
            rsi: 0.5,
            trend: 0.0,
            bollinger: 0.0,
            flow: 0.5,
        };
        let sig = rule_signal("BTCUSDT", &f, &w);
        // direction = (0.5 * 1.0 + 0.5 * 0.0) / 1.0 = 0.5
        assert!((sig.direction - 0.5).abs() < 1e-9);
        // confidence = 0.5 * 0.5
        assert!((sig.confidence - 0.25).abs() < 1e-9);
    }

    #[test]
    fn adx_caps_confidence_in_flat_markets() {
        let mut f = bullish_features();
        f.adx = 0.0;
        let weak = rule_signal("BTCUSDT", &f, &SignalWeights::default());
        f.adx = 40.0;
        let strong = rule_signal("BTCUSDT", &f, &SignalWeights::default());
        assert!(weak.confidence < strong.confidence);
        assert!((weak.confidence * 2.0 - strong.confidence).abs() < 1e-9);
    }

    #[test]
    fn zero_weights_yield_flat_signal() {
        let w = SignalWeights {
            momentum: 0.0,
            rsi: 0.0,
            trend: 0.0,
            bollinger: 0.0,
            flow: 0.0,
        };
        let sig = rule_signal("BTCUSDT", &bullish_features(), &w);
        assert!(!sig.long_ok && !sig.short_ok);
        assert_eq!(sig.confidence, 0.0);
    }

    #[test]
    fn ensemble_blend_and_veto() {
        // No ML: rule confidence passes through.
        assert_eq!(ensemble_confidence(0.8, None, 0.4, 0.6), Some(0.8));

        // ML below its floor vetoes entirely.
        assert_eq!(ensemble_confidence(0.8, Some(0.5), 0.4, 0.6), None);

        // Blend: (1 - 0.4) * 0.8 + 0.4 * 0.7 = 0.76
        let blended = ensemble_confidence(0.8, Some(0.7), 0.4, 0.6).unwrap();
        assert!((blended - 0.76).abs() < 1e-9);
    }
}
