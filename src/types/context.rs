//! Ephemeral historical context computed per anomaly record

use serde::{Deserialize, Serialize};
use std::fmt;

use super::SensorKind;

/// Direction of recent readings, newest-first majority vote over adjacent pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Increasing,
    Decreasing,
    Fluctuating,
    Unknown,
}

impl Trend {
    /// Short sentence used in recommendation explanations.
    pub const fn sentence(self) -> Option<&'static str> {
        match self {
            Trend::Increasing => Some("Values are rising"),
            Trend::Decreasing => Some("Values are declining"),
            Trend::Fluctuating => Some("Values are unstable"),
            Trend::Unknown => None,
        }
    }
}

impl fmt::Display for Trend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trend::Increasing => write!(f, "increasing"),
            Trend::Decreasing => write!(f, "decreasing"),
            Trend::Fluctuating => write!(f, "fluctuating"),
            Trend::Unknown => write!(f, "unknown"),
        }
    }
}

/// Historical context for one anomaly record.
///
/// Context enrichment is best-effort: any field that cannot be computed stays
/// at its default rather than failing recommendation generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadingContext {
    /// Value of the triggering reading, when the record has one
    pub recent_value: Option<f64>,
    /// Sensor kind of the triggering reading
    pub sensor_kind: Option<SensorKind>,
    /// Time-of-day the anomaly was recorded ("HH:MM")
    pub time_of_day: Option<String>,
    /// Percent change from the oldest to the newest of the trailing sample
    pub change_rate: Option<f64>,
    pub trend: Trend,
    /// Mean of the trailing sample, rounded to 1 decimal
    pub historical_avg: Option<f64>,
    /// More than 2 anomalies for the same plot within the trailing 3 hours
    pub multiple_anomalies: bool,
}

impl Default for ReadingContext {
    fn default() -> Self {
        Self {
            recent_value: None,
            sensor_kind: None,
            time_of_day: None,
            change_rate: None,
            trend: Trend::Unknown,
            historical_avg: None,
            multiple_anomalies: false,
        }
    }
}

impl ReadingContext {
    /// Change rate, defaulting to 0 when history was unavailable.
    pub fn change_rate_or_zero(&self) -> f64 {
        self.change_rate.unwrap_or(0.0)
    }
}
