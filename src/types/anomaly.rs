//! Anomaly records: severity tiers, category dispatch, AnomalyRecord

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{PlotId, SensorKind};

/// Severity tier derived from the raw anomaly score.
///
/// Non-anomalous windows are always `Normal` regardless of score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Normal = 0,
    Low = 1,
    Medium = 2,
    High = 3,
    Critical = 4,
}

impl Severity {
    /// Derive the tier from a raw anomaly score (more negative = more severe).
    ///
    /// Cut points: < -0.4 Critical, < -0.3 High, < -0.2 Medium, else Low.
    pub fn from_score(score: f64, is_anomaly: bool) -> Self {
        if !is_anomaly {
            return Severity::Normal;
        }
        if score < -0.4 {
            Severity::Critical
        } else if score < -0.3 {
            Severity::High
        } else if score < -0.2 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Normal => write!(f, "NORMAL"),
            Severity::Low => write!(f, "LOW"),
            Severity::Medium => write!(f, "MEDIUM"),
            Severity::High => write!(f, "HIGH"),
            Severity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// The 3-level severity vocabulary used for stored anomaly records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoredSeverity {
    Low,
    Medium,
    High,
}

impl StoredSeverity {
    /// Parse a stored severity label.
    ///
    /// Unmapped labels fall back to `Medium`; downstream rule evaluation
    /// relies on this fallback, so an unexpected label is not an error.
    pub fn from_label(label: &str) -> Self {
        match label.to_ascii_lowercase().as_str() {
            "low" => StoredSeverity::Low,
            "high" => StoredSeverity::High,
            _ => StoredSeverity::Medium,
        }
    }
}

impl From<Severity> for StoredSeverity {
    /// Map a detector tier down to the storage vocabulary:
    /// CRITICAL/HIGH → high, MEDIUM → medium, LOW/NORMAL → low.
    fn from(severity: Severity) -> Self {
        match severity {
            Severity::Critical | Severity::High => StoredSeverity::High,
            Severity::Medium => StoredSeverity::Medium,
            Severity::Low | Severity::Normal => StoredSeverity::Low,
        }
    }
}

impl fmt::Display for StoredSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoredSeverity::Low => write!(f, "low"),
            StoredSeverity::Medium => write!(f, "medium"),
            StoredSeverity::High => write!(f, "high"),
        }
    }
}

/// Closed category dispatch for anomaly labels.
///
/// Resolved once at record creation; the substring fallback keeps parity with
/// labels produced by older ingestion paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnomalyCategory {
    Moisture,
    Temperature,
    Humidity,
    Generic,
}

impl AnomalyCategory {
    /// Resolve a category from a free-form anomaly label.
    ///
    /// Case-insensitive substring match; anything unrecognized is `Generic`.
    pub fn resolve(label: &str) -> Self {
        let lower = label.to_ascii_lowercase();
        if lower.contains("moisture") {
            AnomalyCategory::Moisture
        } else if lower.contains("temperature") {
            AnomalyCategory::Temperature
        } else if lower.contains("humidity") {
            AnomalyCategory::Humidity
        } else {
            AnomalyCategory::Generic
        }
    }
}

impl fmt::Display for AnomalyCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnomalyCategory::Moisture => write!(f, "moisture"),
            AnomalyCategory::Temperature => write!(f, "temperature"),
            AnomalyCategory::Humidity => write!(f, "humidity"),
            AnomalyCategory::Generic => write!(f, "generic"),
        }
    }
}

impl From<SensorKind> for AnomalyCategory {
    fn from(kind: SensorKind) -> Self {
        match kind {
            SensorKind::Moisture => AnomalyCategory::Moisture,
            SensorKind::Temperature => AnomalyCategory::Temperature,
            SensorKind::Humidity => AnomalyCategory::Humidity,
        }
    }
}

/// A flagged anomaly, persisted with provenance back to the triggering reading.
///
/// At most one recommendation ever attaches to a record (1:1, optional).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyRecord {
    /// Store-assigned identifier (0 until persisted)
    pub id: u64,
    pub plot: PlotId,
    /// Reading at the flagged window's trailing index, when resolvable
    pub reading_id: Option<u64>,
    pub category: AnomalyCategory,
    /// Synthesized label, e.g. "moisture_anomaly"
    pub label: String,
    /// Raw anomaly score from the detector (more negative = more anomalous)
    pub score: f64,
    /// Detector-derived confidence in [0, 1]
    pub model_confidence: f64,
    pub severity: StoredSeverity,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_cut_points() {
        assert_eq!(Severity::from_score(-0.45, true), Severity::Critical);
        assert_eq!(Severity::from_score(-0.35, true), Severity::High);
        assert_eq!(Severity::from_score(-0.25, true), Severity::Medium);
        assert_eq!(Severity::from_score(-0.1, true), Severity::Low);
        // Non-anomalous windows are always NORMAL, however severe the score
        assert_eq!(Severity::from_score(-0.9, false), Severity::Normal);
    }

    #[test]
    fn storage_mapping_flattens_tiers() {
        assert_eq!(StoredSeverity::from(Severity::Critical), StoredSeverity::High);
        assert_eq!(StoredSeverity::from(Severity::High), StoredSeverity::High);
        assert_eq!(StoredSeverity::from(Severity::Medium), StoredSeverity::Medium);
        assert_eq!(StoredSeverity::from(Severity::Low), StoredSeverity::Low);
        assert_eq!(StoredSeverity::from(Severity::Normal), StoredSeverity::Low);
    }

    #[test]
    fn unmapped_label_falls_back_to_medium() {
        assert_eq!(StoredSeverity::from_label("WARNING"), StoredSeverity::Medium);
        assert_eq!(StoredSeverity::from_label("garbage"), StoredSeverity::Medium);
        assert_eq!(StoredSeverity::from_label("High"), StoredSeverity::High);
    }

    #[test]
    fn category_resolution_uses_substring_fallback() {
        assert_eq!(
            AnomalyCategory::resolve("moisture_anomaly"),
            AnomalyCategory::Moisture
        );
        assert_eq!(
            AnomalyCategory::resolve("Greenhouse-TEMPERATURE-spike"),
            AnomalyCategory::Temperature
        );
        assert_eq!(AnomalyCategory::resolve("ph_anomaly"), AnomalyCategory::Generic);
    }
}
