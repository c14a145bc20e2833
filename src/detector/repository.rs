//! Model Repository
//!
//! On-disk home for trained detector models: one JSON file per sensor kind.
//!
//! There is no in-memory cache: every load goes to disk, so a
//! model trained by one process is immediately visible to every other reader
//! and survives restarts. Saves are atomic (temp file + rename), so readers
//! never observe a half-written model during a concurrent retrain.

use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::{DetectorError, NoveltyDetector};
use crate::types::SensorKind;

/// Loader/saver for per-sensor-kind detector models.
#[derive(Debug, Clone)]
pub struct ModelRepository {
    model_dir: PathBuf,
}

impl ModelRepository {
    pub fn new<P: AsRef<Path>>(model_dir: P) -> Self {
        Self {
            model_dir: model_dir.as_ref().to_path_buf(),
        }
    }

    /// File path for a sensor kind's model, e.g. `trained_models/moisture_model.json`.
    pub fn model_path(&self, kind: SensorKind) -> PathBuf {
        self.model_dir.join(format!("{kind}_model.json"))
    }

    /// Whether a persisted model exists on disk for this kind.
    pub fn exists(&self, kind: SensorKind) -> bool {
        self.model_path(kind).exists()
    }

    /// Load the model for `kind` from disk.
    ///
    /// `ModelNotFound` when no model has been persisted yet.
    pub fn load(&self, kind: SensorKind) -> Result<NoveltyDetector, DetectorError> {
        NoveltyDetector::load_from(&self.model_path(kind))
    }

    /// Load the model for `kind`, falling back to a fresh untrained detector
    /// when the file is missing or unreadable.
    ///
    /// Used by status reporting and training, where "no model yet" is a
    /// normal state rather than an error.
    pub fn load_or_new(&self, kind: SensorKind) -> NoveltyDetector {
        match self.load(kind) {
            Ok(detector) => detector,
            Err(DetectorError::ModelNotFound(_)) => NoveltyDetector::new(),
            Err(e) => {
                warn!(kind = %kind, error = %e, "Failed to load persisted model, starting untrained");
                NoveltyDetector::new()
            }
        }
    }

    /// Persist a trained model for `kind` atomically.
    pub fn save(&self, kind: SensorKind, detector: &NoveltyDetector) -> Result<(), DetectorError> {
        let path = self.model_path(kind);
        detector.save_to(&path)?;
        info!(
            kind = %kind,
            path = %path.display(),
            samples = detector.training_data_size(),
            "Persisted detector model"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trained_detector() -> NoveltyDetector {
        let mut detector = NoveltyDetector::with_params(0.1, 20, 42);
        let data: Vec<Vec<f64>> = (0..30)
            .map(|i| vec![60.0 + (i % 5) as f64, 1.0, 58.0, 63.0, 5.0])
            .collect();
        detector.train(&data).unwrap();
        detector
    }

    #[test]
    fn save_then_load_per_kind() {
        let dir = tempfile::tempdir().unwrap();
        let repo = ModelRepository::new(dir.path());

        assert!(!repo.exists(SensorKind::Moisture));
        repo.save(SensorKind::Moisture, &trained_detector()).unwrap();
        assert!(repo.exists(SensorKind::Moisture));
        assert!(!repo.exists(SensorKind::Humidity));

        let loaded = repo.load(SensorKind::Moisture).unwrap();
        assert!(loaded.is_trained());
        assert_eq!(loaded.training_data_size(), 30);
    }

    #[test]
    fn load_missing_is_model_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let repo = ModelRepository::new(dir.path());
        assert!(matches!(
            repo.load(SensorKind::Temperature),
            Err(DetectorError::ModelNotFound(_))
        ));
        // load_or_new degrades to an untrained detector instead
        assert!(!repo.load_or_new(SensorKind::Temperature).is_trained());
    }

    #[test]
    fn no_stray_temp_file_after_save() {
        let dir = tempfile::tempdir().unwrap();
        let repo = ModelRepository::new(dir.path());
        repo.save(SensorKind::Humidity, &trained_detector()).unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
