//! Core types shared across the detection and recommendation pipeline

mod anomaly;
mod context;
mod reading;
mod recommendation;

pub use anomaly::{AnomalyCategory, AnomalyRecord, Severity, StoredSeverity};
pub use context::{ReadingContext, Trend};
pub use reading::{PlotId, Reading, SensorKind, ValidationError};
pub use recommendation::{Priority, Recommendation};
