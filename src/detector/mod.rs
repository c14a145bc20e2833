//! Novelty Detector
//!
//! Unsupervised anomaly detection over windowed sensor features. The detector
//! wraps an isolation forest trained on data presumed normal, scores new
//! windows, and classifies them through a two-stage gate: the forest's binary
//! label AND a derived confidence that must clear `min_confidence`. The gate
//! trades mild true positives for a quiet alert stream; `min_confidence` is
//! the tuning knob.
//!
//! Scoring is only valid after training; calling any scoring operation on an
//! untrained detector is a contract violation surfaced as `NotTrained`.

mod forest;
mod repository;

pub use forest::IsolationForest;
pub use repository::ModelRepository;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::preprocessing::{mean, population_std};
use crate::types::Severity;

/// Hard minimum number of training samples.
pub const MIN_TRAINING_SAMPLES: usize = 10;

/// Default confidence gate. Only near-certain windows survive it.
pub const DEFAULT_MIN_CONFIDENCE: f64 = 0.999;

/// Scale that maps |score| to a confidence: full confidence at |score| = 0.5.
const CONFIDENCE_SCALE: f64 = 0.5;

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("need at least {needed} samples, got {got}")]
    InsufficientData { needed: usize, got: usize },

    #[error("model not trained yet, call train() first")]
    NotTrained,

    #[error("model file not found: {0}")]
    ModelNotFound(PathBuf),

    #[error("feature dimensionality mismatch: model expects {expected}, got {got}")]
    FeatureMismatch { expected: usize, got: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Training summary statistics over the fitted scores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingStats {
    pub n_samples: usize,
    pub n_features: usize,
    pub training_date: DateTime<Utc>,
    pub mean_score: f64,
    pub std_score: f64,
    pub min_score: f64,
    pub max_score: f64,
}

/// Per-window classification result from `detect_with_confidence`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowVerdict {
    /// Window index within the scored batch
    pub index: usize,
    /// Final classification after the two-stage gate
    pub is_anomaly: bool,
    /// Raw anomaly score (more negative = more anomalous)
    pub score: f64,
    /// Derived confidence in [0, 1]
    pub confidence: f64,
    /// Severity tier derived purely from the raw score
    pub severity: Severity,
}

/// On-disk model layout: forest plus training provenance.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedModel {
    forest: IsolationForest,
    trained: bool,
    training_data_size: usize,
    training_date: Option<DateTime<Utc>>,
}

/// Unsupervised novelty detector for one sensor kind.
///
/// One instance is owned per sensor kind, not per plot; models are trained
/// globally across all plots' pooled history for that kind.
#[derive(Debug, Clone)]
pub struct NoveltyDetector {
    forest: Option<IsolationForest>,
    trained: bool,
    training_data_size: usize,
    training_date: Option<DateTime<Utc>>,
    contamination: f64,
    n_estimators: usize,
    seed: u64,
}

impl Default for NoveltyDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl NoveltyDetector {
    /// Create an untrained detector using the deployment config when
    /// initialized, otherwise built-in defaults.
    pub fn new() -> Self {
        if crate::config::is_initialized() {
            let detection = &crate::config::get().detection;
            Self::with_params(detection.contamination, detection.n_estimators, detection.seed)
        } else {
            let defaults = crate::config::DetectionConfig::default();
            Self::with_params(defaults.contamination, defaults.n_estimators, defaults.seed)
        }
    }

    /// Create an untrained detector with explicit forest parameters.
    pub fn with_params(contamination: f64, n_estimators: usize, seed: u64) -> Self {
        Self {
            forest: None,
            trained: false,
            training_data_size: 0,
            training_date: None,
            contamination,
            n_estimators,
            seed,
        }
    }

    pub fn is_trained(&self) -> bool {
        self.trained
    }

    pub fn training_data_size(&self) -> usize {
        self.training_data_size
    }

    pub fn training_date(&self) -> Option<DateTime<Utc>> {
        self.training_date
    }

    fn forest(&self) -> Result<&IsolationForest, DetectorError> {
        self.forest.as_ref().ok_or(DetectorError::NotTrained)
    }

    fn check_features(&self, data: &[Vec<f64>]) -> Result<(), DetectorError> {
        let expected = self.forest()?.n_features();
        if let Some(row) = data.iter().find(|row| row.len() != expected) {
            return Err(DetectorError::FeatureMismatch {
                expected,
                got: row.len(),
            });
        }
        Ok(())
    }

    /// Fit the forest on a matrix assumed to contain only normal behavior.
    ///
    /// Records training set size and timestamp; scoring becomes valid
    /// afterwards.
    pub fn train(&mut self, normal_data: &[Vec<f64>]) -> Result<TrainingStats, DetectorError> {
        if normal_data.len() < MIN_TRAINING_SAMPLES {
            return Err(DetectorError::InsufficientData {
                needed: MIN_TRAINING_SAMPLES,
                got: normal_data.len(),
            });
        }

        let forest = IsolationForest::fit(
            normal_data,
            self.n_estimators,
            self.contamination,
            self.seed,
        );

        let training_scores = forest.score_samples(normal_data);
        let stats = TrainingStats {
            n_samples: normal_data.len(),
            n_features: forest.n_features(),
            training_date: Utc::now(),
            mean_score: mean(&training_scores),
            std_score: population_std(&training_scores),
            min_score: training_scores
                .iter()
                .copied()
                .fold(f64::INFINITY, f64::min),
            max_score: training_scores
                .iter()
                .copied()
                .fold(f64::NEG_INFINITY, f64::max),
        };

        self.forest = Some(forest);
        self.trained = true;
        self.training_data_size = normal_data.len();
        self.training_date = Some(stats.training_date);

        Ok(stats)
    }

    /// Per-row binary labels; `true` = anomaly.
    pub fn predict(&self, data: &[Vec<f64>]) -> Result<Vec<bool>, DetectorError> {
        self.check_features(data)?;
        let forest = self.forest()?;
        Ok(data.iter().map(|row| forest.is_anomaly(row)).collect())
    }

    /// Continuous anomaly score per row; more negative = more anomalous.
    pub fn anomaly_scores(&self, data: &[Vec<f64>]) -> Result<Vec<f64>, DetectorError> {
        self.check_features(data)?;
        Ok(self.forest()?.score_samples(data))
    }

    /// Classify rows through the two-stage gate.
    ///
    /// A row is finally anomalous only if the binary label flags it AND the
    /// derived confidence reaches `min_confidence`. Severity comes purely
    /// from the raw score.
    pub fn detect_with_confidence(
        &self,
        data: &[Vec<f64>],
        min_confidence: f64,
    ) -> Result<Vec<WindowVerdict>, DetectorError> {
        let labels = self.predict(data)?;
        let scores = self.anomaly_scores(data)?;

        Ok(labels
            .into_iter()
            .zip(scores)
            .enumerate()
            .map(|(index, (labeled_anomaly, score))| {
                let confidence = if labeled_anomaly {
                    (score.abs() / CONFIDENCE_SCALE).min(1.0)
                } else if score > 0.0 {
                    (score / CONFIDENCE_SCALE).min(1.0)
                } else {
                    0.0
                };

                let is_anomaly = labeled_anomaly && confidence >= min_confidence;

                WindowVerdict {
                    index,
                    is_anomaly,
                    score,
                    confidence,
                    severity: Severity::from_score(score, is_anomaly),
                }
            })
            .collect())
    }

    /// Serialize the trained model to `path` atomically.
    ///
    /// Writes to a temp file then renames, so a concurrent reader never
    /// observes a partially-written model. Saving an untrained model fails
    /// with `NotTrained`.
    pub fn save_to(&self, path: &Path) -> Result<(), DetectorError> {
        if !self.trained {
            return Err(DetectorError::NotTrained);
        }
        let forest = self.forest()?;

        let persisted = PersistedModel {
            forest: forest.clone(),
            trained: self.trained,
            training_data_size: self.training_data_size,
            training_date: self.training_date,
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let tmp_path = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(&persisted)?;
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, path)?;

        tracing::debug!(path = %path.display(), "Saved detector model");
        Ok(())
    }

    /// Load a previously saved model from `path`.
    ///
    /// Forest parameters for any future retrain keep the current deployment
    /// config; the persisted file carries the fitted state.
    pub fn load_from(path: &Path) -> Result<Self, DetectorError> {
        if !path.exists() {
            return Err(DetectorError::ModelNotFound(path.to_path_buf()));
        }

        let raw = std::fs::read(path)?;
        let persisted: PersistedModel = serde_json::from_slice(&raw)?;

        let mut detector = Self::new();
        detector.forest = Some(persisted.forest);
        detector.trained = persisted.trained;
        detector.training_data_size = persisted.training_data_size;
        detector.training_date = persisted.training_date;

        tracing::debug!(
            path = %path.display(),
            samples = detector.training_data_size,
            "Loaded detector model"
        );
        Ok(detector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn training_features(n: usize) -> Vec<Vec<f64>> {
        let mut rng = StdRng::seed_from_u64(9);
        (0..n)
            .map(|_| {
                let base: f64 = rng.gen_range(55.0..65.0);
                vec![base, 1.5, base - 2.0, base + 2.0, 4.0]
            })
            .collect()
    }

    #[test]
    fn train_rejects_fewer_than_minimum_samples() {
        let mut detector = NoveltyDetector::with_params(0.1, 50, 42);
        let err = detector.train(&training_features(9)).unwrap_err();
        assert!(matches!(
            err,
            DetectorError::InsufficientData { needed: 10, got: 9 }
        ));
        assert!(!detector.is_trained());
    }

    #[test]
    fn train_accepts_exactly_minimum_samples() {
        let mut detector = NoveltyDetector::with_params(0.1, 50, 42);
        let stats = detector.train(&training_features(10)).unwrap();
        assert!(detector.is_trained());
        assert_eq!(stats.n_samples, 10);
        assert_eq!(stats.n_features, 5);
        assert!(stats.min_score <= stats.mean_score && stats.mean_score <= stats.max_score);
    }

    #[test]
    fn scoring_before_training_is_a_contract_violation() {
        let detector = NoveltyDetector::with_params(0.1, 50, 42);
        let rows = vec![vec![1.0; 5]];
        assert!(matches!(
            detector.predict(&rows),
            Err(DetectorError::NotTrained)
        ));
        assert!(matches!(
            detector.anomaly_scores(&rows),
            Err(DetectorError::NotTrained)
        ));
        assert!(matches!(
            detector.detect_with_confidence(&rows, 0.5),
            Err(DetectorError::NotTrained)
        ));
    }

    #[test]
    fn saving_untrained_model_fails() {
        let detector = NoveltyDetector::with_params(0.1, 50, 42);
        let dir = tempfile::tempdir().unwrap();
        let err = detector.save_to(&dir.path().join("m.json")).unwrap_err();
        assert!(matches!(err, DetectorError::NotTrained));
    }

    #[test]
    fn loading_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = NoveltyDetector::load_from(&dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, DetectorError::ModelNotFound(_)));
    }

    #[test]
    fn save_load_round_trip_preserves_scores() {
        let mut detector = NoveltyDetector::with_params(0.1, 50, 42);
        detector.train(&training_features(100)).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("moisture_model.json");
        detector.save_to(&path).unwrap();

        let restored = NoveltyDetector::load_from(&path).unwrap();
        assert!(restored.is_trained());
        assert_eq!(restored.training_data_size(), 100);

        let probe = vec![vec![10.0, 30.0, 0.0, 90.0, 90.0]];
        assert_eq!(
            detector.anomaly_scores(&probe).unwrap(),
            restored.anomaly_scores(&probe).unwrap()
        );
    }

    #[test]
    fn confidence_gate_suppresses_mild_anomalies() {
        let mut detector = NoveltyDetector::with_params(0.1, 100, 42);
        detector.train(&training_features(200)).unwrap();

        // A gross outlier clears the strict gate
        let outlier = vec![vec![5.0, 40.0, -20.0, 200.0, 220.0]];
        let verdicts = detector.detect_with_confidence(&outlier, 0.999).unwrap();
        assert!(verdicts[0].is_anomaly);
        assert!(verdicts[0].confidence >= 0.999);
        assert!(verdicts[0].severity >= Severity::Medium);

        // The same row under an impossible gate is suppressed but keeps NORMAL severity
        let strict = detector.detect_with_confidence(&outlier, f64::INFINITY).unwrap();
        assert!(!strict[0].is_anomaly);
        assert_eq!(strict[0].severity, Severity::Normal);
    }

    #[test]
    fn feature_mismatch_is_rejected() {
        let mut detector = NoveltyDetector::with_params(0.1, 50, 42);
        detector.train(&training_features(50)).unwrap();
        let err = detector.predict(&[vec![1.0, 2.0]]).unwrap_err();
        assert!(matches!(
            err,
            DetectorError::FeatureMismatch { expected: 5, got: 2 }
        ));
    }
}
