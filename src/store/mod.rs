//! Farm Store
//!
//! Queryable persistence boundary for readings, anomaly records, and
//! recommendations. The pipeline only ever talks to the `FarmStore` trait;
//! the bundled implementation is a Sled embedded database so the crate runs
//! end-to-end without a database server.
//!
//! Reading keys encode `{plot}/{kind}/{timestamp}/{id}` big-endian, so a
//! prefix scan over one (plot, kind) stream yields chronological order.

use chrono::{DateTime, Utc};
use sled::transaction::TransactionError;
use sled::Transactional;
use std::collections::BTreeSet;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

use crate::types::{
    AnomalyRecord, PlotId, Reading, Recommendation, SensorKind, ValidationError,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

/// The query surface the detection and recommendation pipeline consumes.
///
/// Ordering contracts:
/// - `recent_readings` / `pooled_recent_values` return the newest `count`
///   readings reversed to oldest-first (ready for windowing);
/// - `readings_before` returns strictly-older readings newest-first;
/// - `pending_anomalies` returns newest-first.
pub trait FarmStore {
    /// Persist a reading after validating its value range.
    /// Returns the stored reading with its assigned id.
    fn insert_reading(&self, reading: Reading) -> Result<Reading, StoreError>;

    fn reading(&self, id: u64) -> Result<Option<Reading>, StoreError>;

    fn recent_readings(
        &self,
        plot: PlotId,
        kind: SensorKind,
        count: usize,
    ) -> Result<Vec<Reading>, StoreError>;

    /// Newest `count` values pooled across all plots for one kind,
    /// oldest-first. Used for global model training.
    fn pooled_recent_values(&self, kind: SensorKind, count: usize)
        -> Result<Vec<f64>, StoreError>;

    /// Up to `count` readings strictly before `before`, newest-first.
    fn readings_before(
        &self,
        plot: PlotId,
        kind: SensorKind,
        before: DateTime<Utc>,
        count: usize,
    ) -> Result<Vec<Reading>, StoreError>;

    /// Persist an anomaly record; returns it with its assigned id.
    fn insert_anomaly(&self, record: AnomalyRecord) -> Result<AnomalyRecord, StoreError>;

    fn anomaly(&self, id: u64) -> Result<Option<AnomalyRecord>, StoreError>;

    /// Count anomalies for a plot with timestamp >= `since`.
    fn count_anomalies_since(
        &self,
        plot: PlotId,
        since: DateTime<Utc>,
    ) -> Result<usize, StoreError>;

    fn recommendation_for(&self, anomaly_id: u64) -> Result<Option<Recommendation>, StoreError>;

    /// Persist a recommendation for its anomaly, at most once.
    ///
    /// Uses compare-and-swap keyed by anomaly id: if a recommendation already
    /// exists (including one racing in concurrently), the existing one is
    /// returned and the new one discarded.
    fn insert_recommendation(&self, rec: Recommendation) -> Result<Recommendation, StoreError>;

    /// Anomaly records without a recommendation yet, newest-first,
    /// optionally filtered by plot.
    fn pending_anomalies(&self, plot: Option<PlotId>) -> Result<Vec<AnomalyRecord>, StoreError>;

    /// All plots that have at least one reading.
    fn plots(&self) -> Result<Vec<PlotId>, StoreError>;
}

// ============================================================================
// Sled implementation
// ============================================================================

fn ts_millis(ts: DateTime<Utc>) -> u64 {
    ts.timestamp_millis().max(0) as u64
}

/// Composite key: plot (4) | kind tag (1) | timestamp ms (8) | id (8).
fn reading_key(plot: PlotId, kind: SensorKind, ts: u64, id: u64) -> [u8; 21] {
    let mut key = [0u8; 21];
    key[..4].copy_from_slice(&plot.to_be_bytes());
    key[4] = kind.tag();
    key[5..13].copy_from_slice(&ts.to_be_bytes());
    key[13..21].copy_from_slice(&id.to_be_bytes());
    key
}

/// Prefix covering one (plot, kind) stream.
fn stream_prefix(plot: PlotId, kind: SensorKind) -> [u8; 5] {
    let mut prefix = [0u8; 5];
    prefix[..4].copy_from_slice(&plot.to_be_bytes());
    prefix[4] = kind.tag();
    prefix
}

/// Sled-backed farm store.
#[derive(Clone)]
pub struct SledStore {
    db: sled::Db,
    /// Stream-ordered reading index: composite key -> reading JSON
    readings: sled::Tree,
    /// Provenance lookup: reading id -> reading JSON
    readings_by_id: sled::Tree,
    /// Anomaly records: id -> record JSON
    anomalies: sled::Tree,
    /// Recommendations: anomaly id -> recommendation JSON (the 1:1 owner key)
    recommendations: sled::Tree,
}

impl SledStore {
    /// Open or create the store at the given directory.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Self::from_db(sled::open(path)?)
    }

    /// Open an in-memory store (for testing).
    pub fn open_temp() -> Result<Self, StoreError> {
        let config = sled::Config::new().temporary(true);
        Self::from_db(config.open()?)
    }

    fn from_db(db: sled::Db) -> Result<Self, StoreError> {
        Ok(Self {
            readings: db.open_tree("readings")?,
            readings_by_id: db.open_tree("readings_by_id")?,
            anomalies: db.open_tree("anomalies")?,
            recommendations: db.open_tree("recommendations")?,
            db,
        })
    }

    /// Flush pending writes to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

impl FarmStore for SledStore {
    fn insert_reading(&self, mut reading: Reading) -> Result<Reading, StoreError> {
        reading.validate()?;
        reading.id = self.db.generate_id()?;

        let value = serde_json::to_vec(&reading)?;
        let key = reading_key(
            reading.plot,
            reading.kind,
            ts_millis(reading.timestamp),
            reading.id,
        );

        (&self.readings, &self.readings_by_id)
            .transaction(|(readings, by_id)| {
                readings.insert(&key[..], value.as_slice())?;
                by_id.insert(&reading.id.to_be_bytes(), value.as_slice())?;
                Ok::<(), sled::transaction::ConflictableTransactionError<()>>(())
            })
            .map_err(|e: TransactionError<()>| match e {
                TransactionError::Abort(()) => {
                    StoreError::Database("reading insert transaction aborted".to_string())
                }
                TransactionError::Storage(e) => StoreError::from(e),
            })?;

        Ok(reading)
    }

    fn reading(&self, id: u64) -> Result<Option<Reading>, StoreError> {
        match self.readings_by_id.get(id.to_be_bytes())? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    fn recent_readings(
        &self,
        plot: PlotId,
        kind: SensorKind,
        count: usize,
    ) -> Result<Vec<Reading>, StoreError> {
        let mut readings = Vec::with_capacity(count);
        // Keys sort chronologically, so the reverse scan yields newest first
        for item in self.readings.scan_prefix(stream_prefix(plot, kind)).rev() {
            if readings.len() >= count {
                break;
            }
            let (_, value) = item?;
            readings.push(serde_json::from_slice::<Reading>(&value)?);
        }
        readings.reverse(); // oldest-first for windowing
        Ok(readings)
    }

    fn pooled_recent_values(
        &self,
        kind: SensorKind,
        count: usize,
    ) -> Result<Vec<f64>, StoreError> {
        // Reading keys are plot-major, so a pooled time-ordered view needs a
        // full scan. Simple over clever at this data volume.
        let mut pooled: Vec<(u64, f64)> = Vec::new();
        for item in self.readings.iter() {
            let (key, value) = item?;
            if key.len() == 21 && key[4] == kind.tag() {
                let reading: Reading = serde_json::from_slice(&value)?;
                pooled.push((ts_millis(reading.timestamp), reading.value));
            }
        }

        pooled.sort_by_key(|(ts, _)| *ts);
        if pooled.len() > count {
            pooled.drain(..pooled.len() - count);
        }
        debug!(kind = %kind, values = pooled.len(), "Fetched pooled readings for global training");
        Ok(pooled.into_iter().map(|(_, value)| value).collect())
    }

    fn readings_before(
        &self,
        plot: PlotId,
        kind: SensorKind,
        before: DateTime<Utc>,
        count: usize,
    ) -> Result<Vec<Reading>, StoreError> {
        let lower = reading_key(plot, kind, 0, 0);
        // Upper bound at (before, id=0): the end is exclusive and ids start
        // above zero, so everything at or after `before` is excluded.
        let upper = reading_key(plot, kind, ts_millis(before), 0);

        let mut readings = Vec::with_capacity(count);
        for item in self.readings.range(lower.as_slice()..upper.as_slice()).rev() {
            if readings.len() >= count {
                break;
            }
            let (_, value) = item?;
            readings.push(serde_json::from_slice::<Reading>(&value)?);
        }
        Ok(readings) // newest-first
    }

    fn insert_anomaly(&self, mut record: AnomalyRecord) -> Result<AnomalyRecord, StoreError> {
        record.id = self.db.generate_id()?;
        let value = serde_json::to_vec(&record)?;
        self.anomalies.insert(record.id.to_be_bytes(), value)?;

        debug!(
            anomaly_id = record.id,
            plot = record.plot,
            label = %record.label,
            severity = %record.severity,
            "Stored anomaly record"
        );
        Ok(record)
    }

    fn anomaly(&self, id: u64) -> Result<Option<AnomalyRecord>, StoreError> {
        match self.anomalies.get(id.to_be_bytes())? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    fn count_anomalies_since(
        &self,
        plot: PlotId,
        since: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let mut count = 0;
        for item in self.anomalies.iter() {
            let (_, value) = item?;
            let record: AnomalyRecord = serde_json::from_slice(&value)?;
            if record.plot == plot && record.timestamp >= since {
                count += 1;
            }
        }
        Ok(count)
    }

    fn recommendation_for(&self, anomaly_id: u64) -> Result<Option<Recommendation>, StoreError> {
        match self.recommendations.get(anomaly_id.to_be_bytes())? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    fn insert_recommendation(&self, mut rec: Recommendation) -> Result<Recommendation, StoreError> {
        rec.id = self.db.generate_id()?;
        let key = rec.anomaly_id.to_be_bytes();
        let value = serde_json::to_vec(&rec)?;

        match self
            .recommendations
            .compare_and_swap(key, None as Option<&[u8]>, Some(value))?
        {
            Ok(()) => Ok(rec),
            Err(cas) => {
                // Lost the race (or reprocessed): the current value wins
                let existing = cas
                    .current
                    .map(|value| serde_json::from_slice::<Recommendation>(&value))
                    .transpose()?;
                existing.ok_or_else(|| {
                    StoreError::Database("recommendation CAS raced with a delete".to_string())
                })
            }
        }
    }

    fn pending_anomalies(&self, plot: Option<PlotId>) -> Result<Vec<AnomalyRecord>, StoreError> {
        let mut pending = Vec::new();
        for item in self.anomalies.iter() {
            let (key, value) = item?;
            if self.recommendations.contains_key(&key)? {
                continue;
            }
            let record: AnomalyRecord = serde_json::from_slice(&value)?;
            if plot.is_none() || plot == Some(record.plot) {
                pending.push(record);
            }
        }
        pending.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(pending)
    }

    fn plots(&self) -> Result<Vec<PlotId>, StoreError> {
        let mut plots = BTreeSet::new();
        for item in self.readings.iter() {
            let (key, _) = item?;
            if key.len() == 21 {
                plots.insert(PlotId::from_be_bytes([key[0], key[1], key[2], key[3]]));
            }
        }
        Ok(plots.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AnomalyCategory, Priority, StoredSeverity};
    use chrono::{Duration, TimeZone};

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).single().unwrap()
    }

    fn reading(plot: PlotId, kind: SensorKind, value: f64, minute: i64) -> Reading {
        Reading {
            id: 0,
            plot,
            kind,
            value,
            timestamp: base_time() + Duration::minutes(minute),
            source: "test".to_string(),
        }
    }

    fn anomaly(plot: PlotId, minute: i64) -> AnomalyRecord {
        AnomalyRecord {
            id: 0,
            plot,
            reading_id: None,
            category: AnomalyCategory::Moisture,
            label: "moisture_anomaly".to_string(),
            score: -0.45,
            model_confidence: 0.9,
            severity: StoredSeverity::High,
            timestamp: base_time() + Duration::minutes(minute),
        }
    }

    #[test]
    fn recent_readings_are_oldest_first() {
        let store = SledStore::open_temp().unwrap();
        for minute in 0..20 {
            store
                .insert_reading(reading(1, SensorKind::Moisture, 50.0 + minute as f64, minute))
                .unwrap();
        }

        let recent = store.recent_readings(1, SensorKind::Moisture, 5).unwrap();
        assert_eq!(recent.len(), 5);
        // Newest five, reversed to oldest-first
        let values: Vec<f64> = recent.iter().map(|r| r.value).collect();
        assert_eq!(values, vec![65.0, 66.0, 67.0, 68.0, 69.0]);
    }

    #[test]
    fn streams_are_isolated_by_plot_and_kind() {
        let store = SledStore::open_temp().unwrap();
        store.insert_reading(reading(1, SensorKind::Moisture, 50.0, 0)).unwrap();
        store.insert_reading(reading(1, SensorKind::Humidity, 60.0, 1)).unwrap();
        store.insert_reading(reading(2, SensorKind::Moisture, 70.0, 2)).unwrap();

        let moisture = store.recent_readings(1, SensorKind::Moisture, 10).unwrap();
        assert_eq!(moisture.len(), 1);
        assert_eq!(moisture[0].value, 50.0);

        assert_eq!(store.plots().unwrap(), vec![1, 2]);
    }

    #[test]
    fn pooled_values_cross_plots_in_time_order() {
        let store = SledStore::open_temp().unwrap();
        store.insert_reading(reading(2, SensorKind::Temperature, 22.0, 0)).unwrap();
        store.insert_reading(reading(1, SensorKind::Temperature, 24.0, 5)).unwrap();
        store.insert_reading(reading(3, SensorKind::Temperature, 26.0, 10)).unwrap();
        store.insert_reading(reading(1, SensorKind::Moisture, 55.0, 7)).unwrap();

        let pooled = store.pooled_recent_values(SensorKind::Temperature, 10).unwrap();
        assert_eq!(pooled, vec![22.0, 24.0, 26.0]);

        let capped = store.pooled_recent_values(SensorKind::Temperature, 2).unwrap();
        assert_eq!(capped, vec![24.0, 26.0]);
    }

    #[test]
    fn readings_before_is_strict_and_newest_first() {
        let store = SledStore::open_temp().unwrap();
        for minute in 0..10 {
            store
                .insert_reading(reading(1, SensorKind::Moisture, minute as f64, minute))
                .unwrap();
        }

        let cutoff = base_time() + Duration::minutes(5);
        let prior = store
            .readings_before(1, SensorKind::Moisture, cutoff, 3)
            .unwrap();
        let values: Vec<f64> = prior.iter().map(|r| r.value).collect();
        // Strictly before minute 5, newest-first
        assert_eq!(values, vec![4.0, 3.0, 2.0]);
    }

    #[test]
    fn invalid_reading_is_rejected() {
        let store = SledStore::open_temp().unwrap();
        let err = store
            .insert_reading(reading(1, SensorKind::Humidity, 150.0, 0))
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
    }

    #[test]
    fn recommendation_cas_is_idempotent() {
        let store = SledStore::open_temp().unwrap();
        let record = store.insert_anomaly(anomaly(1, 0)).unwrap();

        let make_rec = |action: &str| Recommendation {
            id: 0,
            anomaly_id: record.id,
            action: action.to_string(),
            explanation: "why".to_string(),
            confidence: 0.8,
            priority: Priority::High,
            timestamp: base_time(),
        };

        let first = store.insert_recommendation(make_rec("irrigate")).unwrap();
        let second = store.insert_recommendation(make_rec("different")).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.action, "irrigate");
        assert_eq!(
            store.recommendation_for(record.id).unwrap().unwrap().id,
            first.id
        );
    }

    #[test]
    fn pending_anomalies_excludes_recommended() {
        let store = SledStore::open_temp().unwrap();
        let a = store.insert_anomaly(anomaly(1, 0)).unwrap();
        let b = store.insert_anomaly(anomaly(1, 10)).unwrap();
        let c = store.insert_anomaly(anomaly(2, 20)).unwrap();

        store
            .insert_recommendation(Recommendation {
                id: 0,
                anomaly_id: a.id,
                action: "done".to_string(),
                explanation: String::new(),
                confidence: 0.5,
                priority: Priority::Low,
                timestamp: base_time(),
            })
            .unwrap();

        let pending = store.pending_anomalies(None).unwrap();
        let ids: Vec<u64> = pending.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![c.id, b.id]); // newest-first

        let plot_1 = store.pending_anomalies(Some(1)).unwrap();
        assert_eq!(plot_1.len(), 1);
        assert_eq!(plot_1[0].id, b.id);
    }

    #[test]
    fn anomaly_window_count() {
        let store = SledStore::open_temp().unwrap();
        store.insert_anomaly(anomaly(1, -200)).unwrap(); // outside 3h window
        store.insert_anomaly(anomaly(1, -100)).unwrap();
        store.insert_anomaly(anomaly(1, -10)).unwrap();
        store.insert_anomaly(anomaly(2, -10)).unwrap(); // other plot

        let since = base_time() - Duration::hours(3);
        assert_eq!(store.count_anomalies_since(1, since).unwrap(), 2);
    }
}
