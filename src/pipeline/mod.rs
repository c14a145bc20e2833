//! Detection Orchestrator
//!
//! Coordinates the full anomaly-detection pass: fetch recent readings,
//! preprocess into feature windows, score them with the persisted model,
//! and store flagged windows as anomaly records with provenance back to
//! the reading at each window's trailing index.
//!
//! Models are always reloaded from disk per request, so a freshly trained
//! model takes effect immediately without process restart.

use chrono::Utc;
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{self, DetectionConfig};
use crate::detector::{
    DetectorError, ModelRepository, NoveltyDetector, TrainingStats, WindowVerdict,
    MIN_TRAINING_SAMPLES,
};
use crate::preprocessing::{window_end_index, PreprocessError, Preprocessor};
use crate::store::{FarmStore, StoreError};
use crate::types::{
    AnomalyCategory, AnomalyRecord, PlotId, SensorKind, StoredSeverity, ValidationError,
};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("preprocessing error: {0}")]
    Preprocess(#[from] PreprocessError),

    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Result of a training run for one sensor kind.
#[derive(Debug, Clone, Serialize)]
pub struct TrainOutcome {
    pub kind: SensorKind,
    pub stats: TrainingStats,
    pub model_path: PathBuf,
}

/// Result of one detection pass over a (plot, kind) stream.
#[derive(Debug, Clone, Serialize)]
pub struct DetectionReport {
    pub plot: PlotId,
    pub kind: SensorKind,
    pub total_windows: usize,
    pub anomalies_detected: usize,
    pub created_record_ids: Vec<u64>,
    pub verdicts: Vec<WindowVerdict>,
}

/// Per-(plot, kind) outcome within a batch run.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PairStatus {
    Success { plot: PlotId, kind: SensorKind, anomalies: usize },
    Skipped { plot: PlotId, kind: SensorKind, reason: String },
    Error { plot: PlotId, kind: SensorKind, message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub pairs: Vec<PairStatus>,
    pub total_anomalies: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Current training and persistence state of one kind's model.
#[derive(Debug, Clone, Serialize)]
pub struct ModelStatus {
    pub kind: SensorKind,
    pub trained: bool,
    pub training_data_size: usize,
    pub training_date: Option<chrono::DateTime<Utc>>,
    pub persisted_on_disk: bool,
    pub model_path: PathBuf,
}

pub struct DetectionService<'a> {
    store: &'a dyn FarmStore,
    models: ModelRepository,
    detection: DetectionConfig,
}

impl<'a> DetectionService<'a> {
    pub fn new(store: &'a dyn FarmStore, models: ModelRepository) -> Self {
        let detection = if config::is_initialized() {
            config::get().detection.clone()
        } else {
            DetectionConfig::default()
        };
        Self {
            store,
            models,
            detection,
        }
    }

    /// Train (or retrain) the global model for one sensor kind from the
    /// newest pooled readings across all plots.
    pub fn train(&self, kind: SensorKind, data_points: usize) -> Result<TrainOutcome, PipelineError> {
        let values = self.store.pooled_recent_values(kind, data_points)?;
        if values.len() < MIN_TRAINING_SAMPLES {
            return Err(DetectorError::InsufficientData {
                needed: MIN_TRAINING_SAMPLES,
                got: values.len(),
            }
            .into());
        }

        let preprocessor = Preprocessor::new(self.detection.window_size);
        let windows = preprocessor.prepare_for_model(&values, true)?;

        let mut detector = NoveltyDetector::new();
        let stats = detector.train(&windows)?;
        self.models.save(kind, &detector)?;

        info!(
            kind = %kind,
            samples = stats.n_samples,
            mean_score = stats.mean_score,
            "Trained and persisted model"
        );
        Ok(TrainOutcome {
            kind,
            stats,
            model_path: self.models.model_path(kind),
        })
    }

    /// Run one detection pass over a (plot, kind) stream and persist any
    /// flagged windows as anomaly records.
    pub fn detect(&self, plot: PlotId, kind: SensorKind) -> Result<DetectionReport, PipelineError> {
        let detector = self.models.load(kind)?;

        let readings = self
            .store
            .recent_readings(plot, kind, self.detection.recent_count)?;
        let values: Vec<f64> = readings.iter().map(|r| r.value).collect();

        let preprocessor = Preprocessor::new(self.detection.window_size);
        let windows = preprocessor.prepare_for_model(&values, true)?;
        let verdicts = detector.detect_with_confidence(&windows, self.detection.min_confidence)?;

        let mut created_record_ids = Vec::new();
        for verdict in verdicts.iter().filter(|v| v.is_anomaly) {
            // Map the flagged window back to the reading at its trailing index
            let end = window_end_index(verdict.index, self.detection.window_size);
            let trigger = readings.get(end).or_else(|| readings.last());

            let record = self.store.insert_anomaly(AnomalyRecord {
                id: 0,
                plot,
                reading_id: trigger.map(|r| r.id),
                category: AnomalyCategory::from(kind),
                label: kind.anomaly_label(),
                score: verdict.score,
                model_confidence: verdict.confidence,
                severity: StoredSeverity::from(verdict.severity),
                timestamp: Utc::now(),
            })?;
            created_record_ids.push(record.id);
        }

        let report = DetectionReport {
            plot,
            kind,
            total_windows: verdicts.len(),
            anomalies_detected: created_record_ids.len(),
            created_record_ids,
            verdicts,
        };
        debug!(
            plot,
            kind = %kind,
            windows = report.total_windows,
            anomalies = report.anomalies_detected,
            "Detection pass complete"
        );
        Ok(report)
    }

    /// Detect across many (plot, kind) pairs. Missing models and short
    /// streams are skipped per pair; other failures are recorded per pair
    /// and never abort the batch.
    pub fn batch_detect(
        &self,
        plots: Option<Vec<PlotId>>,
        kinds: Option<Vec<SensorKind>>,
    ) -> Result<BatchReport, PipelineError> {
        let plots = match plots {
            Some(plots) => plots,
            None => self.store.plots()?,
        };
        let kinds = kinds.unwrap_or_else(|| SensorKind::ALL.to_vec());

        let mut pairs = Vec::with_capacity(plots.len() * kinds.len());
        let mut total_anomalies = 0;

        for &plot in &plots {
            for &kind in &kinds {
                match self.detect(plot, kind) {
                    Ok(report) => {
                        total_anomalies += report.anomalies_detected;
                        pairs.push(PairStatus::Success {
                            plot,
                            kind,
                            anomalies: report.anomalies_detected,
                        });
                    }
                    Err(PipelineError::Detector(
                        DetectorError::ModelNotFound(_) | DetectorError::NotTrained,
                    )) => {
                        pairs.push(PairStatus::Skipped {
                            plot,
                            kind,
                            reason: "model not trained".to_string(),
                        });
                    }
                    Err(PipelineError::Preprocess(PreprocessError::InsufficientData {
                        ..
                    })) => {
                        pairs.push(PairStatus::Skipped {
                            plot,
                            kind,
                            reason: "insufficient data".to_string(),
                        });
                    }
                    Err(err) => {
                        warn!(plot, kind = %kind, error = %err, "Detection failed for pair");
                        pairs.push(PairStatus::Error {
                            plot,
                            kind,
                            message: err.to_string(),
                        });
                    }
                }
            }
        }

        let succeeded = pairs
            .iter()
            .filter(|p| matches!(p, PairStatus::Success { .. }))
            .count();
        let skipped = pairs
            .iter()
            .filter(|p| matches!(p, PairStatus::Skipped { .. }))
            .count();
        let failed = pairs.len() - succeeded - skipped;

        info!(
            pairs = pairs.len(),
            succeeded, skipped, failed, total_anomalies, "Batch detection complete"
        );
        Ok(BatchReport {
            pairs,
            total_anomalies,
            succeeded,
            skipped,
            failed,
        })
    }

    /// Report the model state for one sensor kind without mutating anything.
    pub fn model_status(&self, kind: SensorKind) -> ModelStatus {
        let detector = self.models.load_or_new(kind);
        ModelStatus {
            kind,
            trained: detector.is_trained(),
            training_data_size: detector.training_data_size(),
            training_date: detector.training_date(),
            persisted_on_disk: self.models.exists(kind),
            model_path: self.models.model_path(kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SledStore;
    use crate::types::Reading;
    use chrono::{DateTime, Duration, TimeZone};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use tempfile::TempDir;

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).single().unwrap()
    }

    fn seed_stable_readings(store: &SledStore, plot: PlotId, count: usize) {
        let mut rng = StdRng::seed_from_u64(7);
        for i in 0..count {
            store
                .insert_reading(Reading {
                    id: 0,
                    plot,
                    kind: SensorKind::Moisture,
                    value: 55.0 + rng.gen_range(-3.0..3.0),
                    timestamp: base_time() + Duration::minutes(i as i64 * 15),
                    source: "test".to_string(),
                })
                .unwrap();
        }
    }

    fn service<'a>(store: &'a SledStore, dir: &TempDir) -> DetectionService<'a> {
        DetectionService::new(store, ModelRepository::new(dir.path()))
    }

    #[test]
    fn train_requires_minimum_data() {
        let store = SledStore::open_temp().unwrap();
        let dir = TempDir::new().unwrap();
        seed_stable_readings(&store, 1, 5);

        let err = service(&store, &dir)
            .train(SensorKind::Moisture, 100)
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Detector(DetectorError::InsufficientData { .. })
        ));
    }

    #[test]
    fn train_then_status_reports_trained() {
        let store = SledStore::open_temp().unwrap();
        let dir = TempDir::new().unwrap();
        seed_stable_readings(&store, 1, 60);

        let svc = service(&store, &dir);
        let outcome = svc.train(SensorKind::Moisture, 100).unwrap();
        assert!(outcome.stats.n_samples > 0);
        assert!(outcome.model_path.exists());

        let status = svc.model_status(SensorKind::Moisture);
        assert!(status.trained);
        assert!(status.persisted_on_disk);
        assert!(status.training_date.is_some());

        let untouched = svc.model_status(SensorKind::Humidity);
        assert!(!untouched.trained);
        assert!(!untouched.persisted_on_disk);
    }

    #[test]
    fn detect_without_model_fails() {
        let store = SledStore::open_temp().unwrap();
        let dir = TempDir::new().unwrap();
        seed_stable_readings(&store, 1, 60);

        let err = service(&store, &dir)
            .detect(1, SensorKind::Moisture)
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Detector(DetectorError::ModelNotFound(_))
        ));
    }

    #[test]
    fn detection_flags_a_collapsing_stream() {
        let store = SledStore::open_temp().unwrap();
        let dir = TempDir::new().unwrap();
        seed_stable_readings(&store, 1, 80);

        let svc = service(&store, &dir);
        svc.train(SensorKind::Moisture, 100).unwrap();

        // Moisture collapse well outside the trained distribution
        for i in 0..12 {
            store
                .insert_reading(Reading {
                    id: 0,
                    plot: 1,
                    kind: SensorKind::Moisture,
                    value: 55.0 - 2.0 * i as f64,
                    timestamp: base_time() + Duration::minutes((80 + i) as i64 * 15),
                    source: "test".to_string(),
                })
                .unwrap();
        }

        let report = svc.detect(1, SensorKind::Moisture).unwrap();
        assert!(report.total_windows > 0);
        assert_eq!(report.anomalies_detected, report.created_record_ids.len());

        // Every created record must round-trip with reading provenance
        for id in &report.created_record_ids {
            let record = store.anomaly(*id).unwrap().unwrap();
            assert_eq!(record.plot, 1);
            assert_eq!(record.label, "moisture_anomaly");
            assert!(record.reading_id.is_some());
        }
    }

    #[test]
    fn batch_skips_untrained_kinds() {
        let store = SledStore::open_temp().unwrap();
        let dir = TempDir::new().unwrap();
        seed_stable_readings(&store, 1, 60);

        let svc = service(&store, &dir);
        svc.train(SensorKind::Moisture, 100).unwrap();

        let report = svc.batch_detect(None, None).unwrap();
        // One plot, three kinds: moisture succeeds, the others lack models
        assert_eq!(report.pairs.len(), 3);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.skipped, 2);
        assert_eq!(report.failed, 0);
    }
}
