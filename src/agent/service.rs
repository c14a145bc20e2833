//! Recommendation service: context assembly, rule analysis, idempotent
//! persistence, and backlog processing.

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info};

use crate::context::ContextBuilder;
use crate::store::{FarmStore, StoreError};
use crate::types::{AnomalyRecord, PlotId, Recommendation};

use super::RuleEngine;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Summary returned by a backlog-processing run.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessSummary {
    pub processed: usize,
    pub total_pending: usize,
    pub failed: usize,
}

pub struct AgentService<'a> {
    store: &'a dyn FarmStore,
    engine: RuleEngine,
}

impl<'a> AgentService<'a> {
    pub fn new(store: &'a dyn FarmStore) -> Self {
        Self {
            store,
            engine: RuleEngine::new(),
        }
    }

    pub fn with_engine(store: &'a dyn FarmStore, engine: RuleEngine) -> Self {
        Self { store, engine }
    }

    /// Produce (or fetch) the recommendation for one anomaly.
    ///
    /// Idempotent: an anomaly that already has a recommendation returns the
    /// existing one unchanged. Errors at this layer propagate to the caller.
    pub fn process_anomaly(&self, anomaly: &AnomalyRecord) -> Result<Recommendation, AgentError> {
        if let Some(existing) = self.store.recommendation_for(anomaly.id)? {
            info!(
                anomaly_id = anomaly.id,
                recommendation_id = existing.id,
                "Recommendation already exists, returning it"
            );
            return Ok(existing);
        }

        let context = ContextBuilder::new(self.store).build(anomaly);
        let outcome = self.engine.analyze(anomaly, &context);

        let recommendation = self.store.insert_recommendation(Recommendation {
            id: 0,
            anomaly_id: anomaly.id,
            action: outcome.action,
            explanation: outcome.explanation,
            confidence: outcome.confidence,
            priority: outcome.priority,
            timestamp: Utc::now(),
        })?;

        info!(
            anomaly_id = anomaly.id,
            recommendation_id = recommendation.id,
            priority = %recommendation.priority,
            confidence = recommendation.confidence,
            "Created recommendation"
        );
        Ok(recommendation)
    }

    /// Process a batch independently. A failure on one record is logged and
    /// skipped; only the successful recommendations are returned.
    pub fn process_multiple(&self, anomalies: &[AnomalyRecord]) -> Vec<Recommendation> {
        let mut recommendations = Vec::with_capacity(anomalies.len());
        for anomaly in anomalies {
            match self.process_anomaly(anomaly) {
                Ok(recommendation) => recommendations.push(recommendation),
                Err(err) => {
                    error!(
                        anomaly_id = anomaly.id,
                        error = %err,
                        "Failed to process anomaly, continuing with the rest"
                    );
                }
            }
        }
        recommendations
    }

    /// Work through the recommendation backlog, optionally for one plot.
    pub fn process_pending(&self, plot: Option<PlotId>) -> Result<ProcessSummary, AgentError> {
        let pending = self.store.pending_anomalies(plot)?;
        let total_pending = pending.len();
        let processed = self.process_multiple(&pending).len();

        let summary = ProcessSummary {
            processed,
            total_pending,
            failed: total_pending - processed,
        };
        info!(
            processed = summary.processed,
            total_pending = summary.total_pending,
            failed = summary.failed,
            "Backlog pass complete"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SledStore;
    use crate::types::{AnomalyCategory, Priority, Reading, SensorKind, StoredSeverity};
    use chrono::{DateTime, Duration, TimeZone};

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).single().unwrap()
    }

    fn seed_anomaly(store: &SledStore, values: &[f64]) -> AnomalyRecord {
        let mut trigger = None;
        for (i, &value) in values.iter().enumerate() {
            let stored = store
                .insert_reading(Reading {
                    id: 0,
                    plot: 7,
                    kind: SensorKind::Moisture,
                    value,
                    timestamp: base_time() + Duration::minutes(i as i64 * 15),
                    source: "test".to_string(),
                })
                .unwrap();
            trigger = Some(stored);
        }
        let trigger = trigger.unwrap();

        store
            .insert_anomaly(AnomalyRecord {
                id: 0,
                plot: 7,
                reading_id: Some(trigger.id),
                category: AnomalyCategory::Moisture,
                label: "moisture_anomaly".to_string(),
                score: -0.45,
                model_confidence: 0.99,
                severity: StoredSeverity::High,
                timestamp: trigger.timestamp,
            })
            .unwrap()
    }

    #[test]
    fn processing_is_idempotent() {
        let store = SledStore::open_temp().unwrap();
        let anomaly = seed_anomaly(&store, &[60.0, 55.0, 48.0, 40.0, 33.0]);
        let service = AgentService::new(&store);

        let first = service.process_anomaly(&anomaly).unwrap();
        let second = service.process_anomaly(&anomaly).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.action, second.action);
    }

    #[test]
    fn drought_anomaly_gets_high_priority() {
        let store = SledStore::open_temp().unwrap();
        // Final value 33 is below the default moisture critical-low of 35
        let anomaly = seed_anomaly(&store, &[60.0, 55.0, 48.0, 40.0, 33.0]);
        let service = AgentService::new(&store);

        let recommendation = service.process_anomaly(&anomaly).unwrap();
        assert!(recommendation.action.starts_with("URGENT: Immediate irrigation"));
        assert_eq!(recommendation.priority, Priority::High);
    }

    #[test]
    fn pending_backlog_is_drained() {
        let store = SledStore::open_temp().unwrap();
        let a = seed_anomaly(&store, &[60.0, 50.0, 40.0]);
        let service = AgentService::new(&store);

        // One pre-processed, one still pending
        service.process_anomaly(&a).unwrap();
        let b = store
            .insert_anomaly(AnomalyRecord {
                id: 0,
                plot: 7,
                reading_id: None,
                category: AnomalyCategory::Generic,
                label: "sensor_anomaly".to_string(),
                score: -0.25,
                model_confidence: 0.8,
                severity: StoredSeverity::Medium,
                timestamp: base_time(),
            })
            .unwrap();

        let summary = service.process_pending(None).unwrap();
        assert_eq!(summary.total_pending, 1);
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.failed, 0);

        assert!(store.recommendation_for(b.id).unwrap().is_some());
        assert!(store.pending_anomalies(None).unwrap().is_empty());
    }

    #[test]
    fn batch_processing_returns_successes() {
        let store = SledStore::open_temp().unwrap();
        let a = seed_anomaly(&store, &[60.0, 50.0, 40.0]);
        let service = AgentService::new(&store);

        let recommendations = service.process_multiple(std::slice::from_ref(&a));
        assert_eq!(recommendations.len(), 1);
        assert_eq!(recommendations[0].anomaly_id, a.id);
    }
}
