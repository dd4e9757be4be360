//! Online per-model linear regression for reply-size estimation.
//!
//! Samples are collected from completed tasks only. Each model keeps a
//! bounded sliding window so the fit adapts to drift without growing
//! memory. Estimation is fully deterministic given the same sample
//! sequence.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// Sliding-window size per model
pub const DEFAULT_WINDOW: usize = 100;
/// Minimum samples before the first fit
const MIN_SAMPLES: usize = 3;
/// Retrain cadence after the first fit
const RETRAIN_EVERY: usize = 10;
/// Predictions never go below this
const MIN_PREDICTION: u64 = 10;

/// One completed-task observation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegressionSample {
    pub model_id: String,
    pub input_length: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Fitted line for one model. R² is observability only, it never gates
/// estimation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegressionCoefficients {
    pub slope: f64,
    pub intercept: f64,
    pub r_squared: f64,
    pub sample_count: usize,
}

#[derive(Debug, Default)]
struct ModelRegression {
    samples: VecDeque<RegressionSample>,
    coefficients: Option<RegressionCoefficients>,
    added_since_train: usize,
}

/// Owned per-model regression store. Multiple estimators never interfere.
#[derive(Debug)]
pub struct TokenEstimator {
    window: usize,
    models: HashMap<String, ModelRegression>,
}

impl Default for TokenEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenEstimator {
    pub fn new() -> Self {
        Self::with_window(DEFAULT_WINDOW)
    }

    pub fn with_window(window: usize) -> Self {
        Self {
            window: window.max(MIN_SAMPLES),
            models: HashMap::new(),
        }
    }

    /// Append a sample to the model's window.
    ///
    /// The first fit happens as soon as the window holds 3 samples, then
    /// refits on every 10th added sample.
    pub fn add_sample(&mut self, sample: RegressionSample) {
        let model = self.models.entry(sample.model_id.clone()).or_default();

        model.samples.push_back(sample);
        if model.samples.len() > self.window {
            model.samples.pop_front();
        }
        model.added_since_train += 1;

        let due = model.coefficients.is_none() || model.added_since_train >= RETRAIN_EVERY;
        if model.samples.len() >= MIN_SAMPLES && due {
            model.coefficients = fit(&model.samples);
            model.added_since_train = 0;
        }
    }

    /// Predict the output-token count for an input of `input_length`
    /// characters. `None` means "unknown": fewer than 3 samples or no
    /// trained coefficients yet, and the caller should fall back to a
    /// fixed or equivalent-length estimate.
    pub fn estimate(&self, input_length: u64, model_id: &str) -> Option<u64> {
        let model = self.models.get(model_id)?;
        if model.samples.len() < MIN_SAMPLES {
            return None;
        }
        let coefficients = model.coefficients?;

        let predicted = coefficients.slope * input_length as f64 + coefficients.intercept;
        Some((predicted.round() as i64).max(MIN_PREDICTION as i64) as u64)
    }

    /// Current fit for a model, if any
    pub fn coefficients(&self, model_id: &str) -> Option<RegressionCoefficients> {
        self.models.get(model_id).and_then(|m| m.coefficients)
    }

    /// Number of samples currently held for a model
    pub fn sample_count(&self, model_id: &str) -> usize {
        self.models.get(model_id).map_or(0, |m| m.samples.len())
    }
}

/// Ordinary least squares over `(input_length, output_tokens)`
fn fit(samples: &VecDeque<RegressionSample>) -> Option<RegressionCoefficients> {
    let n = samples.len();
    if n < MIN_SAMPLES {
        return None;
    }

    let xs: Vec<f64> = samples.iter().map(|s| s.input_length as f64).collect();
    let ys: Vec<f64> = samples.iter().map(|s| s.output_tokens as f64).collect();

    let mean_x = xs.iter().sum::<f64>() / n as f64;
    let mean_y = ys.iter().sum::<f64>() / n as f64;

    let sxx: f64 = xs.iter().map(|x| (x - mean_x).powi(2)).sum();
    let sxy: f64 = xs
        .iter()
        .zip(&ys)
        .map(|(x, y)| (x - mean_x) * (y - mean_y))
        .sum();

    // All inputs the same length: fall back to a constant prediction
    let (slope, intercept) = if sxx == 0.0 {
        (0.0, mean_y)
    } else {
        let slope = sxy / sxx;
        (slope, mean_y - slope * mean_x)
    };

    let ss_tot: f64 = ys.iter().map(|y| (y - mean_y).powi(2)).sum();
    let ss_res: f64 = xs
        .iter()
        .zip(&ys)
        .map(|(x, y)| (y - (slope * x + intercept)).powi(2))
        .sum();
    let r_squared = if ss_tot == 0.0 { 1.0 } else { 1.0 - ss_res / ss_tot };

    Some(RegressionCoefficients {
        slope,
        intercept,
        r_squared,
        sample_count: n,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(model: &str, x: u64, y: u64) -> RegressionSample {
        RegressionSample {
            model_id: model.to_string(),
            input_length: x,
            input_tokens: x / 4,
            output_tokens: y,
            timestamp: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_unknown_below_three_samples() {
        let mut estimator = TokenEstimator::new();
        assert_eq!(estimator.estimate(100, "m"), None);

        estimator.add_sample(sample("m", 100, 205));
        estimator.add_sample(sample("m", 200, 405));
        assert_eq!(estimator.estimate(100, "m"), None);
    }

    #[test]
    fn test_converges_on_linear_relation() {
        // y = 2x + 5
        let mut estimator = TokenEstimator::new();
        for x in [100u64, 200, 300, 400] {
            estimator.add_sample(sample("m", x, 2 * x + 5));
        }

        let predicted = estimator.estimate(250, "m").unwrap();
        assert!((predicted as i64 - 505).abs() <= 1, "predicted {}", predicted);

        let coefficients = estimator.coefficients("m").unwrap();
        assert!((coefficients.slope - 2.0).abs() < 1e-6);
        assert!((coefficients.intercept - 5.0).abs() < 1e-3);
        assert!(coefficients.r_squared > 0.999);
    }

    #[test]
    fn test_prediction_floor() {
        let mut estimator = TokenEstimator::new();
        for x in [100u64, 200, 300] {
            estimator.add_sample(sample("m", x, 2));
        }
        assert_eq!(estimator.estimate(1, "m"), Some(10));
    }

    #[test]
    fn test_window_is_bounded() {
        let mut estimator = TokenEstimator::with_window(100);
        for x in 0..150u64 {
            estimator.add_sample(sample("m", x + 1, 2 * (x + 1)));
        }
        assert_eq!(estimator.sample_count("m"), 100);
    }

    #[test]
    fn test_retrain_cadence() {
        let mut estimator = TokenEstimator::new();

        // First fit at 3 samples, on y = 2x
        for x in [100u64, 200, 300] {
            estimator.add_sample(sample("m", x, 2 * x));
        }
        let first = estimator.coefficients("m").unwrap();
        assert_eq!(first.sample_count, 3);

        // Samples 4..=12 follow a different line but no refit is due yet
        for x in [400u64, 500, 600, 700, 800, 900, 1000, 1100, 1200] {
            estimator.add_sample(sample("m", x, 5 * x));
        }
        assert_eq!(estimator.coefficients("m").unwrap(), first);

        // The 13th sample is the 10th since the first fit
        estimator.add_sample(sample("m", 1300, 5 * 1300));
        assert_ne!(estimator.coefficients("m").unwrap(), first);
    }

    #[test]
    fn test_models_are_independent() {
        let mut estimator = TokenEstimator::new();
        for x in [100u64, 200, 300] {
            estimator.add_sample(sample("a", x, 2 * x));
        }
        assert!(estimator.estimate(100, "a").is_some());
        assert_eq!(estimator.estimate(100, "b"), None);
    }

    #[test]
    fn test_degenerate_constant_input() {
        let mut estimator = TokenEstimator::new();
        for _ in 0..3 {
            estimator.add_sample(sample("m", 100, 300));
        }
        assert_eq!(estimator.estimate(9999, "m"), Some(300));
    }
}
