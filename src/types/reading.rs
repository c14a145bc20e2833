//! Sensor readings: SensorKind, Reading, input validation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Identifier for a field plot.
pub type PlotId = u32;

/// Validation errors for malformed external input.
///
/// Raised at the ingestion boundary, never deep inside the pipeline.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("unknown sensor kind: {0:?} (expected moisture, temperature, or humidity)")]
    UnknownSensorKind(String),

    #[error("{kind} value {value} outside plausible range {min}..={max}")]
    ValueOutOfRange {
        kind: SensorKind,
        value: f64,
        min: f64,
        max: f64,
    },
}

/// The three sensor categories monitored per plot.
///
/// One detector model is trained per kind (not per plot); pooled cross-plot
/// data gives the outlier model more signal than any single plot's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorKind {
    Moisture,
    Temperature,
    Humidity,
}

impl SensorKind {
    /// All sensor kinds, in canonical order.
    pub const ALL: [SensorKind; 3] = [
        SensorKind::Moisture,
        SensorKind::Temperature,
        SensorKind::Humidity,
    ];

    /// Stable byte tag used in store key encoding.
    pub const fn tag(self) -> u8 {
        match self {
            SensorKind::Moisture => 0,
            SensorKind::Temperature => 1,
            SensorKind::Humidity => 2,
        }
    }

    /// Physically plausible range for a reading of this kind.
    ///
    /// Values outside this range indicate a broken sensor or corrupted
    /// ingestion, not an agronomic anomaly.
    pub const fn plausible_range(self) -> (f64, f64) {
        match self {
            SensorKind::Moisture => (0.0, 100.0),
            SensorKind::Temperature => (-50.0, 60.0),
            SensorKind::Humidity => (0.0, 100.0),
        }
    }

    /// Measurement unit suffix for human-readable output.
    pub const fn unit(self) -> &'static str {
        match self {
            SensorKind::Moisture | SensorKind::Humidity => "%",
            SensorKind::Temperature => "°C",
        }
    }

    /// Anomaly label synthesized for records of this kind, e.g. "moisture_anomaly".
    pub fn anomaly_label(self) -> String {
        format!("{}_anomaly", self)
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorKind::Moisture => write!(f, "moisture"),
            SensorKind::Temperature => write!(f, "temperature"),
            SensorKind::Humidity => write!(f, "humidity"),
        }
    }
}

impl FromStr for SensorKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "moisture" => Ok(SensorKind::Moisture),
            "temperature" => Ok(SensorKind::Temperature),
            "humidity" => Ok(SensorKind::Humidity),
            other => Err(ValidationError::UnknownSensorKind(other.to_string())),
        }
    }
}

/// A single scalar sensor reading.
///
/// Immutable once stored; ordered by timestamp per (plot, kind) stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reading {
    /// Store-assigned identifier (0 until persisted)
    pub id: u64,
    pub plot: PlotId,
    pub kind: SensorKind,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    /// Provenance tag, e.g. "field", "simulator"
    pub source: String,
}

impl Reading {
    /// Check the value against the plausible range for this sensor kind.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let (min, max) = self.kind.plausible_range();
        if !self.value.is_finite() || self.value < min || self.value > max {
            return Err(ValidationError::ValueOutOfRange {
                kind: self.kind,
                value: self.value,
                min,
                max,
            });
        }
        Ok(())
    }
}
