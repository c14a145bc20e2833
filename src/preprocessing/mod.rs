//! Sensor Data Preprocessing
//!
//! Turns a raw ordered sequence of scalar readings into fixed-size sliding
//! windows and statistical feature vectors, and computes simple rate-of-change
//! diagnostics.
//!
//! Training and inference must go through the same `prepare_for_model` entry
//! point so both paths see an identical feature space.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of statistical features extracted per window:
/// mean, std, min, max, range, in that exact order.
pub const FEATURE_COUNT: usize = 5;

#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("not enough data points: need at least {needed}, got {got}")]
    InsufficientData { needed: usize, got: usize },

    #[error("scaler not fitted yet, normalize with fit=true first")]
    NotFitted,
}

/// Per-column standardization parameters remembered after a fit.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Scaler {
    means: Vec<f64>,
    stds: Vec<f64>,
}

/// Preprocesses sensor values for detector input.
///
/// Handles sliding-window creation, feature extraction, and z-score
/// standardization.
#[derive(Debug, Clone)]
pub struct Preprocessor {
    window_size: usize,
    scaler: Option<Scaler>,
}

impl Preprocessor {
    /// Create a preprocessor producing windows of `window_size` consecutive
    /// readings.
    pub fn new(window_size: usize) -> Self {
        Self {
            window_size,
            scaler: None,
        }
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Z-score standardization per column (mean=0, std=1).
    ///
    /// With `fit=true` the column means/stds are (re)computed from `data` and
    /// remembered; with `fit=false` the remembered parameters are applied, or
    /// `NotFitted` is returned if none exist yet. Zero-variance columns pass
    /// through unscaled.
    pub fn normalize(
        &mut self,
        data: &[Vec<f64>],
        fit: bool,
    ) -> Result<Vec<Vec<f64>>, PreprocessError> {
        if data.is_empty() {
            return Ok(Vec::new());
        }

        if fit {
            let columns = data[0].len();
            let mut means = vec![0.0; columns];
            let mut stds = vec![0.0; columns];
            for (c, (mean_slot, std_slot)) in means.iter_mut().zip(stds.iter_mut()).enumerate() {
                let column: Vec<f64> = data.iter().map(|row| row[c]).collect();
                *mean_slot = mean(&column);
                *std_slot = population_std(&column);
            }
            self.scaler = Some(Scaler { means, stds });
        }

        let scaler = self.scaler.as_ref().ok_or(PreprocessError::NotFitted)?;
        let normalized = data
            .iter()
            .map(|row| {
                row.iter()
                    .enumerate()
                    .map(|(c, &value)| {
                        let std = scaler.stds[c];
                        // sklearn convention: zero-variance columns divide by 1
                        let divisor = if std > 0.0 { std } else { 1.0 };
                        (value - scaler.means[c]) / divisor
                    })
                    .collect()
            })
            .collect();

        Ok(normalized)
    }

    /// Create overlapping unit-stride windows from sensor readings.
    ///
    /// `[60, 58, 56, 55, 40]` with window_size 3 yields
    /// `[[60, 58, 56], [58, 56, 55], [56, 55, 40]]`.
    pub fn create_windows(&self, values: &[f64]) -> Result<Vec<Vec<f64>>, PreprocessError> {
        if values.len() < self.window_size {
            return Err(PreprocessError::InsufficientData {
                needed: self.window_size,
                got: values.len(),
            });
        }

        Ok(values
            .windows(self.window_size)
            .map(|w| w.to_vec())
            .collect())
    }

    /// Statistical features for one window: mean, std, min, max, range.
    ///
    /// Always `FEATURE_COUNT` elements regardless of window size.
    pub fn calculate_features(window: &[f64]) -> Vec<f64> {
        let min = window.iter().copied().fold(f64::INFINITY, f64::min);
        let max = window.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        vec![mean(window), population_std(window), min, max, max - min]
    }

    /// Complete preprocessing pipeline: windowing + optional feature
    /// extraction.
    ///
    /// Single entry point consumed by both training and inference.
    pub fn prepare_for_model(
        &self,
        values: &[f64],
        use_features: bool,
    ) -> Result<Vec<Vec<f64>>, PreprocessError> {
        let windows = self.create_windows(values)?;

        if use_features {
            Ok(windows
                .iter()
                .map(|w| Self::calculate_features(w))
                .collect())
        } else {
            Ok(windows)
        }
    }
}

/// Raw-sequence index at which window `index` ends.
///
/// Any alignment of windows back to reading timestamps must use this offset,
/// not the window index itself.
pub const fn window_end_index(index: usize, window_size: usize) -> usize {
    index + window_size - 1
}

/// Scan consecutive pairs for rapid percent changes (drops or spikes).
///
/// Zero-valued denominators are skipped. Returns whether any change reached
/// `threshold_percent` and the maximum magnitude observed.
pub fn check_rapid_change(values: &[f64], threshold_percent: f64) -> (bool, f64) {
    if values.len() < 2 {
        return (false, 0.0);
    }

    let mut max_change = 0.0_f64;
    let mut any = false;
    for pair in values.windows(2) {
        if pair[0] == 0.0 {
            continue;
        }
        let change_percent = ((pair[1] - pair[0]) / pair[0]).abs() * 100.0;
        any = true;
        if change_percent > max_change {
            max_change = change_percent;
        }
    }

    if !any {
        return (false, 0.0);
    }
    (max_change >= threshold_percent, max_change)
}

/// Arithmetic mean; 0 for an empty slice.
pub(crate) fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation (ddof=0); 0 for an empty slice.
pub(crate) fn population_std(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    let variance = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_count_and_content() {
        let values = [60.0, 58.0, 56.0, 55.0, 40.0];
        let pre = Preprocessor::new(3);
        let windows = pre.create_windows(&values).unwrap();

        // len(values) = window_size + k produces k + 1 windows
        assert_eq!(windows.len(), 3);
        for (i, window) in windows.iter().enumerate() {
            assert_eq!(window.len(), 3);
            assert_eq!(window.as_slice(), &values[i..i + 3]);
        }
    }

    #[test]
    fn too_few_values_is_insufficient_data() {
        let pre = Preprocessor::new(10);
        let err = pre.create_windows(&[1.0, 2.0, 3.0]).unwrap_err();
        assert!(matches!(
            err,
            PreprocessError::InsufficientData { needed: 10, got: 3 }
        ));
    }

    #[test]
    fn feature_vector_order_and_values() {
        let features = Preprocessor::calculate_features(&[10.0, 20.0, 30.0, 40.0, 50.0]);
        assert_eq!(features.len(), FEATURE_COUNT);
        assert!((features[0] - 30.0).abs() < 1e-9); // mean
        assert!((features[2] - 10.0).abs() < 1e-9); // min
        assert!((features[3] - 50.0).abs() < 1e-9); // max
        assert!((features[4] - 40.0).abs() < 1e-9); // range
        assert!((features[1] - 200.0_f64.sqrt()).abs() < 1e-9); // population std
    }

    #[test]
    fn prepare_for_model_feature_path() {
        let pre = Preprocessor::new(5);
        let values: Vec<f64> = (0..12).map(|i| 60.0 - i as f64).collect();
        let features = pre.prepare_for_model(&values, true).unwrap();
        assert_eq!(features.len(), 8);
        assert!(features.iter().all(|row| row.len() == FEATURE_COUNT));

        let raw = pre.prepare_for_model(&values, false).unwrap();
        assert_eq!(raw.len(), 8);
        assert!(raw.iter().all(|row| row.len() == 5));
    }

    #[test]
    fn normalize_requires_fit_first() {
        let mut pre = Preprocessor::new(3);
        let data = vec![vec![1.0, 2.0], vec![3.0, 4.0]];
        assert!(matches!(
            pre.normalize(&data, false),
            Err(PreprocessError::NotFitted)
        ));

        let fitted = pre.normalize(&data, true).unwrap();
        // Columns are centered after fitting
        assert!((fitted[0][0] + fitted[1][0]).abs() < 1e-9);

        // Remembered parameters apply to new data
        let out = pre.normalize(&[vec![2.0, 3.0]], false).unwrap();
        assert!(out[0][0].abs() < 1e-9);
    }

    #[test]
    fn rapid_change_detects_drop() {
        let (detected, max_change) = check_rapid_change(&[100.0, 100.0, 70.0, 70.0, 70.0], 20.0);
        assert!(detected);
        assert!((max_change - 30.0).abs() < 1e-9);
    }

    #[test]
    fn rapid_change_skips_zero_denominators() {
        let (detected, max_change) = check_rapid_change(&[0.0, 50.0], 10.0);
        assert!(!detected);
        assert_eq!(max_change, 0.0);
    }

    #[test]
    fn window_alignment_rule() {
        assert_eq!(window_end_index(0, 10), 9);
        assert_eq!(window_end_index(5, 10), 14);
    }
}
