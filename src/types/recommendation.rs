//! Recommendation records produced by the rule engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Action priority for a recommendation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Medium => write!(f, "medium"),
            Priority::High => write!(f, "high"),
        }
    }
}

/// A prioritized, explained recommendation for one anomaly record.
///
/// Exactly one recommendation exists per anomaly (1:1, exclusive owner);
/// reprocessing a record returns the existing recommendation unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    /// Store-assigned identifier (0 until persisted)
    pub id: u64,
    /// Owning anomaly record
    pub anomaly_id: u64,
    pub action: String,
    pub explanation: String,
    /// Agent confidence in [0, 1]
    pub confidence: f64,
    pub priority: Priority,
    pub timestamp: DateTime<Utc>,
}
