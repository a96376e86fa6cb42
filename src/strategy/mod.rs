// =============================================================================
// Strategy core — feature extraction, rule signal, optional ML filter
// =============================================================================

pub mod features;
pub mod ml;
pub mod signal;

pub use features::{compute_technical_features, Features};
pub use ml::MlFilter;
pub use signal::{ensemble_confidence, rule_signal, RuleSignal, SignalWeights};
