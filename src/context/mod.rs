//! Context Builder
//!
//! Enriches a raw anomaly record with sensor context before rule analysis:
//! the triggering value, short-term trend, change rate, a historical average,
//! and whether the plot is seeing a cluster of anomalies. Context assembly is
//! best-effort: storage hiccups degrade to a partial context rather than
//! blocking the recommendation path.

use chrono::Duration;
use tracing::{debug, warn};

use crate::store::{FarmStore, StoreError};
use crate::types::{AnomalyRecord, ReadingContext, Trend};

/// Prior readings consulted for trend and change-rate estimation.
const HISTORY_COUNT: usize = 10;
/// Trend votes required, as a fraction of consecutive pairs.
const TREND_MAJORITY: f64 = 0.7;
/// Window for the multiple-anomalies flag.
const CLUSTER_WINDOW_HOURS: i64 = 3;
/// Anomalies beyond this count within the window mark a cluster.
const CLUSTER_THRESHOLD: usize = 2;

pub struct ContextBuilder<'a> {
    store: &'a dyn FarmStore,
}

impl<'a> ContextBuilder<'a> {
    pub fn new(store: &'a dyn FarmStore) -> Self {
        Self { store }
    }

    /// Build context for an anomaly. Never fails: partial lookups are
    /// logged and whatever was gathered so far is returned.
    pub fn build(&self, anomaly: &AnomalyRecord) -> ReadingContext {
        let mut context = ReadingContext::default();
        if let Err(err) = self.enrich(anomaly, &mut context) {
            warn!(
                anomaly_id = anomaly.id,
                error = %err,
                "Context enrichment degraded, proceeding with partial context"
            );
        }
        context
    }

    fn enrich(
        &self,
        anomaly: &AnomalyRecord,
        context: &mut ReadingContext,
    ) -> Result<(), StoreError> {
        context.time_of_day = Some(anomaly.timestamp.format("%H:%M").to_string());

        let trigger = match anomaly.reading_id {
            Some(id) => self.store.reading(id)?,
            None => None,
        };

        let Some(trigger) = trigger else {
            debug!(anomaly_id = anomaly.id, "No trigger reading, minimal context");
            context.multiple_anomalies = self.cluster_detected(anomaly)?;
            return Ok(());
        };

        context.recent_value = Some(trigger.value);
        context.sensor_kind = Some(trigger.kind);

        // Priors come back newest-first; the trigger prepends as newest
        let priors = self.store.readings_before(
            trigger.plot,
            trigger.kind,
            trigger.timestamp,
            HISTORY_COUNT,
        )?;

        if priors.len() >= 2 {
            let mut values = Vec::with_capacity(priors.len() + 1);
            values.push(trigger.value);
            values.extend(priors.iter().map(|r| r.value));

            context.change_rate = Some(change_rate(&values));
            context.trend = estimate_trend(&values);

            let avg = values.iter().sum::<f64>() / values.len() as f64;
            context.historical_avg = Some((avg * 10.0).round() / 10.0);
        }

        context.multiple_anomalies = self.cluster_detected(anomaly)?;
        Ok(())
    }

    fn cluster_detected(&self, anomaly: &AnomalyRecord) -> Result<bool, StoreError> {
        let since = anomaly.timestamp - Duration::hours(CLUSTER_WINDOW_HOURS);
        let count = self.store.count_anomalies_since(anomaly.plot, since)?;
        Ok(count > CLUSTER_THRESHOLD)
    }
}

/// Percent change from the oldest to the newest value, rounded to two
/// decimals. Zero when the oldest value is zero.
fn change_rate(values: &[f64]) -> f64 {
    let newest = values[0];
    let oldest = values[values.len() - 1];
    if oldest == 0.0 {
        return 0.0;
    }
    let rate = (newest - oldest) / oldest * 100.0;
    (rate * 100.0).round() / 100.0
}

/// Majority-vote trend over newest-first values.
fn estimate_trend(values: &[f64]) -> Trend {
    if values.len() < 3 {
        return Trend::Unknown;
    }

    let pairs = values.len() - 1;
    let increases = values
        .windows(2)
        .filter(|pair| pair[0] > pair[1]) // newest-first: newer > older
        .count();
    let decreases = values
        .windows(2)
        .filter(|pair| pair[0] < pair[1])
        .count();

    let majority = TREND_MAJORITY * pairs as f64;
    if increases as f64 > majority {
        Trend::Increasing
    } else if decreases as f64 > majority {
        Trend::Decreasing
    } else {
        Trend::Fluctuating
    }
}
