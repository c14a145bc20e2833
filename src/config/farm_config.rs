//! Farm configuration - detection tuning and agronomic thresholds as TOML values
//!
//! Every struct implements `Default` with values matching the original
//! deployment constants, ensuring zero-change behavior when no config file is
//! present.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::types::SensorKind;

// ============================================================================
// Top-Level Config
// ============================================================================

/// Root configuration for a farm deployment.
///
/// Load with `FarmConfig::load()` which searches:
/// 1. `$CROPWATCH_CONFIG` env var
/// 2. `./farm_config.toml`
/// 3. Built-in defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FarmConfig {
    /// Farm identification
    #[serde(default)]
    pub farm: FarmInfo,

    /// Detection pipeline tuning
    #[serde(default)]
    pub detection: DetectionConfig,

    /// On-disk locations for models and the embedded store
    #[serde(default)]
    pub paths: PathsConfig,

    /// Agronomic thresholds per sensor kind
    #[serde(default)]
    pub thresholds: ThresholdConfig,
}

impl FarmConfig {
    /// Load configuration using the standard search order.
    pub fn load() -> Self {
        if let Ok(path) = std::env::var("CROPWATCH_CONFIG") {
            match Self::from_path(Path::new(&path)) {
                Ok(config) => {
                    info!(path = %path, "Loaded farm config from CROPWATCH_CONFIG");
                    return config;
                }
                Err(e) => {
                    warn!(path = %path, error = %e, "Failed to load CROPWATCH_CONFIG, falling back");
                }
            }
        }

        let local = Path::new("farm_config.toml");
        if local.exists() {
            match Self::from_path(local) {
                Ok(config) => {
                    info!("Loaded farm config from ./farm_config.toml");
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to parse ./farm_config.toml, using defaults");
                }
            }
        }

        info!("No farm config file found, using built-in defaults");
        Self::default()
    }

    /// Parse a config file from an explicit path.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: FarmConfig = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Sanity-check tunable values that would silently break detection.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.detection.window_size < 2 {
            return Err(ConfigError::Invalid(
                "detection.window_size must be at least 2".to_string(),
            ));
        }
        if self.detection.recent_count < self.detection.window_size {
            return Err(ConfigError::Invalid(
                "detection.recent_count must be >= detection.window_size".to_string(),
            ));
        }
        if !(0.0..=0.5).contains(&self.detection.contamination) {
            return Err(ConfigError::Invalid(
                "detection.contamination must be in 0.0..=0.5".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.detection.min_confidence) {
            return Err(ConfigError::Invalid(
                "detection.min_confidence must be in 0.0..=1.0".to_string(),
            ));
        }
        for kind in SensorKind::ALL {
            let t = self.thresholds.for_kind(kind);
            if t.critical_low >= t.critical_high {
                return Err(ConfigError::Invalid(format!(
                    "thresholds.{kind}: critical_low must be below critical_high"
                )));
            }
        }
        Ok(())
    }
}

/// Config loading / validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

// ============================================================================
// Sections
// ============================================================================

/// Farm identification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FarmInfo {
    #[serde(default = "default_farm_name")]
    pub name: String,
}

fn default_farm_name() -> String {
    "Unnamed Farm".to_string()
}

impl Default for FarmInfo {
    fn default() -> Self {
        Self {
            name: default_farm_name(),
        }
    }
}

/// Detection pipeline tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Consecutive readings per sliding window
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// Recent readings fetched per (plot, kind) stream for detection
    #[serde(default = "default_recent_count")]
    pub recent_count: usize,

    /// Confidence gate for final anomaly classification. Windows whose
    /// derived confidence falls below this are never reported.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,

    /// Expected anomaly fraction in training data (isolation forest offset)
    #[serde(default = "default_contamination")]
    pub contamination: f64,

    /// Number of isolation trees per model
    #[serde(default = "default_n_estimators")]
    pub n_estimators: usize,

    /// RNG seed for deterministic forest construction
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_window_size() -> usize {
    10
}
fn default_recent_count() -> usize {
    50
}
fn default_min_confidence() -> f64 {
    0.999
}
fn default_contamination() -> f64 {
    0.1
}
fn default_n_estimators() -> usize {
    100
}
fn default_seed() -> u64 {
    42
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            recent_count: default_recent_count(),
            min_confidence: default_min_confidence(),
            contamination: default_contamination(),
            n_estimators: default_n_estimators(),
            seed: default_seed(),
        }
    }
}

/// On-disk locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Directory holding one persisted model file per sensor kind
    #[serde(default = "default_model_dir")]
    pub model_dir: PathBuf,

    /// Embedded store directory (readings, anomalies, recommendations)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_model_dir() -> PathBuf {
    PathBuf::from("trained_models")
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("farm_data")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            model_dir: default_model_dir(),
            data_dir: default_data_dir(),
        }
    }
}

// ============================================================================
// Agronomic Thresholds
// ============================================================================

/// Normal and critical bands for one sensor kind.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SensorThresholds {
    pub normal_min: f64,
    pub normal_max: f64,
    pub critical_low: f64,
    pub critical_high: f64,
}

/// Agronomic thresholds per sensor kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdConfig {
    #[serde(default = "default_moisture_thresholds")]
    pub moisture: SensorThresholds,

    #[serde(default = "default_temperature_thresholds")]
    pub temperature: SensorThresholds,

    #[serde(default = "default_humidity_thresholds")]
    pub humidity: SensorThresholds,
}

fn default_moisture_thresholds() -> SensorThresholds {
    SensorThresholds {
        normal_min: 45.0,
        normal_max: 75.0,
        critical_low: 35.0,
        critical_high: 80.0,
    }
}

fn default_temperature_thresholds() -> SensorThresholds {
    SensorThresholds {
        normal_min: 18.0,
        normal_max: 28.0,
        critical_low: 10.0,
        critical_high: 32.0,
    }
}

fn default_humidity_thresholds() -> SensorThresholds {
    SensorThresholds {
        normal_min: 45.0,
        normal_max: 75.0,
        critical_low: 30.0,
        critical_high: 85.0,
    }
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            moisture: default_moisture_thresholds(),
            temperature: default_temperature_thresholds(),
            humidity: default_humidity_thresholds(),
        }
    }
}

impl ThresholdConfig {
    /// Threshold band for a sensor kind.
    pub fn for_kind(&self, kind: SensorKind) -> &SensorThresholds {
        match kind {
            SensorKind::Moisture => &self.moisture,
            SensorKind::Temperature => &self.temperature,
            SensorKind::Humidity => &self.humidity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        FarmConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: FarmConfig = toml::from_str(
            r#"
            [detection]
            window_size = 5

            [thresholds.moisture]
            normal_min = 40.0
            normal_max = 70.0
            critical_low = 30.0
            critical_high = 85.0
            "#,
        )
        .unwrap();

        assert_eq!(config.detection.window_size, 5);
        assert_eq!(config.detection.recent_count, 50);
        assert!((config.thresholds.moisture.critical_low - 30.0).abs() < f64::EPSILON);
        // Untouched section keeps defaults
        assert!((config.thresholds.temperature.critical_high - 32.0).abs() < f64::EPSILON);
    }

    #[test]
    fn rejects_inverted_critical_band() {
        let mut config = FarmConfig::default();
        config.thresholds.humidity.critical_low = 90.0;
        assert!(config.validate().is_err());
    }
}
