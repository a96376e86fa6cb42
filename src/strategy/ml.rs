// =============================================================================
// ML filter — online logistic model over the feature vector
// =============================================================================
//
// A deliberately small model: a running standard scaler (Welford) feeding a
// logistic regression trained by SGD passes over a bounded sample ring.
// Labels are trade outcomes (win = 1). The filter only vetoes entries; it
// never originates them.
//
// Training fires when the sample count reaches `min_samples` and at least
// `retrain_interval` new samples arrived since the last fit. Model + scaler
// are persisted as JSON after every retrain.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::util::safe_float;

/// Bounded training window.
const SAMPLE_CAP: usize = 2_000;
/// SGD passes per retrain.
const TRAIN_EPOCHS: usize = 30;
const LEARNING_RATE: f64 = 0.05;
/// L2 shrinkage per update.
const L2_LAMBDA: f64 = 1e-4;

// ---------------------------------------------------------------------------
// Scaler
// ---------------------------------------------------------------------------

/// Running per-dimension standardizer (Welford's algorithm).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RunningScaler {
    count: u64,
    mean: Vec<f64>,
    m2: Vec<f64>,
}

impl RunningScaler {
    fn observe(&mut self, x: &[f64]) {
        if self.mean.len() != x.len() {
            self.mean = vec![0.0; x.len()];
            self.m2 = vec![0.0; x.len()];
            self.count = 0;
        }
        self.count += 1;
        for (i, &v) in x.iter().enumerate() {
            let v = safe_float(v, 0.0);
            let delta = v - self.mean[i];
            self.mean[i] += delta / self.count as f64;
            self.m2[i] += delta * (v - self.mean[i]);
        }
    }

    fn transform(&self, x: &[f64]) -> Vec<f64> {
        if self.count < 2 || self.mean.len() != x.len() {
            return x.iter().map(|&v| safe_float(v, 0.0)).collect();
        }
        x.iter()
            .enumerate()
            .map(|(i, &v)| {
                let var = self.m2[i] / (self.count - 1) as f64;
                let sd = var.sqrt();
                if sd > 1e-12 {
                    (safe_float(v, 0.0) - self.mean[i]) / sd
                } else {
                    0.0
                }
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct LogisticModel {
    weights: Vec<f64>,
    bias: f64,
}

impl LogisticModel {
    fn predict(&self, x: &[f64]) -> f64 {
        if self.weights.len() != x.len() {
            return 0.5;
        }
        let z: f64 = self
            .weights
            .iter()
            .zip(x)
            .map(|(w, v)| w * v)
            .sum::<f64>()
            + self.bias;
        1.0 / (1.0 + (-z).exp())
    }

    fn fit(&mut self, samples: &[(Vec<f64>, f64)]) {
        let Some(dim) = samples.first().map(|(x, _)| x.len()) else {
            return;
        };
        if self.weights.len() != dim {
            self.weights = vec![0.0; dim];
            self.bias = 0.0;
        }

        for _ in 0..TRAIN_EPOCHS {
            for (x, y) in samples {
                if x.len() != dim {
                    continue;
                }
                let p = self.predict(x);
                let err = p - y;
                for (w, &v) in self.weights.iter_mut().zip(x) {
                    *w -= LEARNING_RATE * (err * v + L2_LAMBDA * *w);
                }
                self.bias -= LEARNING_RATE * err;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Persistence shape
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct PersistedFilter {
    scaler: RunningScaler,
    model: LogisticModel,
    trained_samples: usize,
}

// ---------------------------------------------------------------------------
// Filter
// ---------------------------------------------------------------------------

struct Inner {
    scaler: RunningScaler,
    model: LogisticModel,
    samples: VecDeque<(Vec<f64>, f64)>,
    trained_samples: usize,
    samples_since_fit: usize,
    is_fitted: bool,
}

/// Thread-safe online win-probability filter.
pub struct MlFilter {
    inner: Mutex<Inner>,
    /// Feature vectors captured at entry, resolved into labels at exit.
    pending_entries: Mutex<HashMap<String, Vec<f64>>>,
    min_samples: usize,
    retrain_interval: usize,
    model_path: Option<PathBuf>,
}

impl MlFilter {
    pub fn new(min_samples: usize, retrain_interval: usize, model_path: Option<PathBuf>) -> Self {
        let filter = Self {
            pending_entries: Mutex::new(HashMap::new()),
            inner: Mutex::new(Inner {
                scaler: RunningScaler::default(),
                model: LogisticModel::default(),
                samples: VecDeque::new(),
                trained_samples: 0,
                samples_since_fit: 0,
                is_fitted: false,
            }),
            min_samples: min_samples.max(2),
            retrain_interval: retrain_interval.max(1),
            model_path,
        };

        if let Some(path) = filter.model_path.clone() {
            if let Err(e) = filter.load(&path) {
                warn!(component = "ml", error = %e, "no usable persisted model, starting cold");
            }
        }
        filter
    }

    /// Record a completed trade outcome for online training. Fits the model
    /// when the cadence conditions are met; persists after each fit.
    pub fn record_outcome(&self, features: &[f64], won: bool) {
        let mut inner = self.inner.lock();
        inner.scaler.observe(features);
        let scaled = inner.scaler.transform(features);
        inner
            .samples
            .push_back((scaled, if won { 1.0 } else { 0.0 }));
        while inner.samples.len() > SAMPLE_CAP {
            inner.samples.pop_front();
        }
        inner.samples_since_fit += 1;

        let should_fit = inner.samples.len() >= self.min_samples
            && inner.samples_since_fit >= self.retrain_interval;
        if !should_fit {
            return;
        }

        let samples: Vec<(Vec<f64>, f64)> = inner.samples.iter().cloned().collect();
        inner.model.fit(&samples);
        inner.trained_samples = samples.len();
        inner.samples_since_fit = 0;
        inner.is_fitted = true;
        info!(component = "ml", samples = samples.len(), "model retrained");

        if let Some(path) = &self.model_path {
            let persisted = PersistedFilter {
                scaler: inner.scaler.clone(),
                model: inner.model.clone(),
                trained_samples: inner.trained_samples,
            };
            drop(inner);
            if let Err(e) = save_model(path, &persisted) {
                warn!(component = "ml", error = %e, "model persistence failed");
            }
        }
    }

    /// Remember the feature vector of an entry so its exit can label it.
    pub fn note_entry(&self, symbol: &str, features: Vec<f64>) {
        self.pending_entries
            .lock()
            .insert(symbol.to_string(), features);
    }

    /// Resolve a pending entry into a training sample when its position
    /// closes. Unknown symbols are a no-op.
    pub fn resolve_entry(&self, symbol: &str, won: bool) {
        let features = self.pending_entries.lock().remove(symbol);
        if let Some(features) = features {
            self.record_outcome(&features, won);
        }
    }

    /// Win probability for a candidate entry, `None` until the model is warm.
    pub fn predict(&self, features: &[f64]) -> Option<f64> {
        let inner = self.inner.lock();
        if !inner.is_fitted {
            return None;
        }
        let scaled = inner.scaler.transform(features);
        Some(safe_float(inner.model.predict(&scaled), 0.5))
    }

    pub fn is_warm(&self) -> bool {
        self.inner.lock().is_fitted
    }

    fn load(&self, path: &Path) -> Result<()> {
        if !path.exists() {
            anyhow::bail!("model file {} not found", path.display());
        }
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let persisted: PersistedFilter =
            serde_json::from_str(&json).context("model file is not valid JSON")?;

        let mut inner = self.inner.lock();
        inner.is_fitted = !persisted.model.weights.is_empty();
        inner.scaler = persisted.scaler;
        inner.model = persisted.model;
        inner.trained_samples = persisted.trained_samples;
        info!(
            component = "ml",
            samples = inner.trained_samples,
            path = %path.display(),
            "persisted model restored"
        );
        Ok(())
    }
}

fn save_model(path: &Path, persisted: &PersistedFilter) -> Result<()> {
    let json = serde_json::to_string(persisted).context("failed to encode model")?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &json).with_context(|| format!("failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to rename model into {}", path.display()))?;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    /// Wins whenever the first feature is positive.
    fn sample(first: f64) -> (Vec<f64>, bool) {
        (vec![first, 0.3, -0.1], first > 0.0)
    }

    #[test]
    fn cold_model_predicts_none() {
        let f = MlFilter::new(10, 5, None);
        assert!(f.predict(&[0.5, 0.3, -0.1]).is_none());
        assert!(!f.is_warm());
    }

    #[test]
    fn trains_after_min_samples_and_learns_separable_data() {
        let f = MlFilter::new(20, 5, None);
        for i in 0..60 {
            let v = if i % 2 == 0 { 1.0 } else { -1.0 };
            let (x, won) = sample(v);
            f.record_outcome(&x, won);
        }
        assert!(f.is_warm());

        let up = f.predict(&[1.0, 0.3, -0.1]).unwrap();
        let down = f.predict(&[-1.0, 0.3, -0.1]).unwrap();
        assert!(up > 0.7, "winner class probability was {up}");
        assert!(down < 0.3, "loser class probability was {down}");
    }

    #[test]
    fn retrain_waits_for_interval() {
        let f = MlFilter::new(5, 50, None);
        for i in 0..10 {
            let (x, won) = sample(if i % 2 == 0 { 1.0 } else { -1.0 });
            f.record_outcome(&x, won);
        }
        // 10 samples >= min, but fewer than retrain_interval new ones.
        assert!(!f.is_warm());
    }

    #[test]
    fn sample_ring_bounded() {
        let f = MlFilter::new(5, 1_000_000, None);
        for _ in 0..(SAMPLE_CAP + 100) {
            f.record_outcome(&[1.0, 0.0, 0.0], true);
        }
        assert_eq!(f.inner.lock().samples.len(), SAMPLE_CAP);
    }

    #[test]
    fn persistence_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");

        let f = MlFilter::new(10, 5, Some(path.clone()));
        for i in 0..40 {
            let (x, won) = sample(if i % 2 == 0 { 1.0 } else { -1.0 });
            f.record_outcome(&x, won);
        }
        assert!(f.is_warm());
        assert!(path.exists());

        let restored = MlFilter::new(10, 5, Some(path));
        assert!(restored.is_warm());
        let p = restored.predict(&[1.0, 0.3, -0.1]).unwrap();
        assert!(p > 0.6);
    }

    #[test]
    fn scaler_standardizes() {
        let mut scaler = RunningScaler::default();
        for i in 0..100 {
            scaler.observe(&[i as f64, 5.0]);
        }
        let out = scaler.transform(&[49.5, 5.0]);
        assert!(out[0].abs() < 0.1); // mean input maps near zero
        assert_eq!(out[1], 0.0); // zero-variance dim collapses to zero
    }

    #[test]
    fn entry_features_resolve_into_training_samples() {
        let f = MlFilter::new(2, 1, None);
        f.note_entry("BTCUSDT", vec![1.0, 0.0, 0.0]);
        f.resolve_entry("BTCUSDT", true);
        f.note_entry("BTCUSDT", vec![-1.0, 0.0, 0.0]);
        f.resolve_entry("BTCUSDT", false);
        assert!(f.is_warm());

        // Resolving an unknown symbol is a no-op.
        f.resolve_entry("NEVERUSDT", true);
        assert_eq!(f.inner.lock().samples.len(), 2);
    }

    #[test]
    fn nan_features_do_not_poison_the_model() {
        let f = MlFilter::new(5, 1, None);
        for _ in 0..10 {
            f.record_outcome(&[f64::NAN, 1.0, 0.0], true);
            f.record_outcome(&[0.0, -1.0, 0.0], false);
        }
        let p = f.predict(&[0.0, 1.0, 0.0]);
        assert!(p.is_some());
        assert!(p.unwrap().is_finite());
    }
}
