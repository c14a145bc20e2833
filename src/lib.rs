//! CropWatch: Agricultural Sensor Intelligence
//!
//! Unsupervised anomaly detection and rule-based recommendations for farm
//! sensor streams (soil moisture, temperature, humidity).
//!
//! ## Architecture
//!
//! - **Preprocessing**: Sliding windows and statistical feature extraction
//! - **Novelty Detector**: Isolation-forest scoring with a confidence gate
//! - **Detection Pipeline**: Training, detection, and batch orchestration
//! - **Context Builder**: Trend and history enrichment for flagged anomalies
//! - **Agent**: Ordered rule sets producing prioritized recommendations

pub mod agent;
pub mod config;
pub mod context;
pub mod detector;
pub mod pipeline;
pub mod preprocessing;
pub mod store;
pub mod types;

// Re-export configuration
pub use config::FarmConfig;

// Re-export commonly used types
pub use types::{
    AnomalyCategory, AnomalyRecord, PlotId, Priority, Reading, ReadingContext, Recommendation,
    SensorKind, Severity, StoredSeverity, Trend,
};

// Re-export pipeline surfaces
pub use detector::{ModelRepository, NoveltyDetector};
pub use pipeline::{BatchReport, DetectionReport, DetectionService, ModelStatus, TrainOutcome};

// Re-export agent components
pub use agent::{AgentService, ProcessSummary, RuleEngine};

// Re-export storage
pub use store::{FarmStore, SledStore, StoreError};
