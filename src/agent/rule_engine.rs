//! Rule Engine
//!
//! A pure decision procedure turning (anomaly, context) into an actionable
//! recommendation. Rules are organized per sensor category and evaluated
//! top-to-bottom with first-match-wins semantics, so ordering is part of the
//! contract: the drought rule fires before the drop-rate rule even when both
//! conditions hold. No state is carried between calls beyond the threshold
//! tables loaded at construction.

use crate::config::{self, ThresholdConfig};
use crate::types::{AnomalyCategory, AnomalyRecord, Priority, ReadingContext, SensorKind, StoredSeverity, Trend};

/// The outcome of rule analysis, before persistence details are attached.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleOutcome {
    pub action: String,
    pub explanation: String,
    pub confidence: f64,
    pub priority: Priority,
}

pub struct RuleEngine {
    thresholds: ThresholdConfig,
}

impl RuleEngine {
    /// Build an engine from global configuration, falling back to default
    /// agronomic thresholds when none was initialized.
    pub fn new() -> Self {
        let thresholds = if config::is_initialized() {
            config::get().thresholds.clone()
        } else {
            ThresholdConfig::default()
        };
        Self::with_thresholds(thresholds)
    }

    pub fn with_thresholds(thresholds: ThresholdConfig) -> Self {
        Self { thresholds }
    }

    /// Analyze one anomaly in its context. Deterministic: identical inputs
    /// always produce identical output.
    pub fn analyze(&self, anomaly: &AnomalyRecord, context: &ReadingContext) -> RuleOutcome {
        let mut outcome = match anomaly.category {
            AnomalyCategory::Moisture => self.analyze_moisture(anomaly, context),
            AnomalyCategory::Temperature => self.analyze_temperature(anomaly, context),
            AnomalyCategory::Humidity => self.analyze_humidity(anomaly, context),
            AnomalyCategory::Generic => self.analyze_generic(anomaly, context),
        };
        outcome.confidence = outcome.confidence.clamp(0.0, 1.0);
        outcome
    }

    // ========================================================================
    // Moisture rules
    // ========================================================================

    fn analyze_moisture(&self, anomaly: &AnomalyRecord, context: &ReadingContext) -> RuleOutcome {
        let bands = self.thresholds.for_kind(SensorKind::Moisture);
        let change_rate = context.change_rate_or_zero();

        let Some(value) = context.recent_value else {
            return RuleOutcome {
                action: "Investigate moisture sensor - no recent data available".to_string(),
                explanation: build_explanation(
                    anomaly,
                    context,
                    "Moisture anomaly detected but sensor reading data is unavailable. \
                     Check sensor connectivity and verify data collection."
                        .to_string(),
                ),
                confidence: anomaly.model_confidence * 0.5,
                priority: Priority::Medium,
            };
        };

        // Drought stress outranks every other moisture condition
        if value < bands.critical_low {
            return RuleOutcome {
                action: "URGENT: Immediate irrigation required - crops under severe drought stress"
                    .to_string(),
                explanation: build_explanation(
                    anomaly,
                    context,
                    format!(
                        "Soil moisture critically low at {value:.1}% \
                         (normal range: {}-{}%). \
                         Crops are experiencing severe drought stress and may suffer permanent damage.",
                        bands.normal_min, bands.normal_max
                    ),
                ),
                confidence: (anomaly.model_confidence + 0.15).min(1.0),
                priority: Priority::High,
            };
        }

        if change_rate < -10.0 {
            return RuleOutcome {
                action: "Check irrigation system immediately - possible failure or leak detected"
                    .to_string(),
                explanation: build_explanation(
                    anomaly,
                    context,
                    format!(
                        "Soil moisture dropped {:.1}% rapidly. \
                         This sudden decline indicates possible irrigation system failure, \
                         pipe leak, or pump malfunction. Current moisture level: {value:.1}%.",
                        change_rate.abs()
                    ),
                ),
                confidence: boosted_confidence(anomaly.model_confidence, change_rate),
                priority: high_if_severe(anomaly.severity),
            };
        }

        if context.trend == Trend::Decreasing && change_rate < -5.0 {
            return RuleOutcome {
                action: "Adjust irrigation schedule - gradual moisture loss detected".to_string(),
                explanation: build_explanation(
                    anomaly,
                    context,
                    format!(
                        "Gradual moisture decline detected ({change_rate:.1}% change over recent period). \
                         Current level: {value:.1}%. \
                         Consider increasing irrigation frequency or duration."
                    ),
                ),
                confidence: anomaly.model_confidence,
                priority: Priority::Medium,
            };
        }

        if value > bands.critical_high {
            return RuleOutcome {
                action: "Reduce irrigation immediately - overwatering detected".to_string(),
                explanation: build_explanation(
                    anomaly,
                    context,
                    format!(
                        "Soil moisture excessive at {value:.1}% (above {}%). \
                         Risk of root rot, fungal diseases, and oxygen deprivation. \
                         Reduce watering and improve drainage.",
                        bands.critical_high
                    ),
                ),
                confidence: anomaly.model_confidence,
                priority: Priority::Medium,
            };
        }

        if anomaly.severity == StoredSeverity::Medium {
            return RuleOutcome {
                action: "Monitor moisture levels closely and prepare irrigation adjustments"
                    .to_string(),
                explanation: build_explanation(
                    anomaly,
                    context,
                    format!(
                        "Moisture anomaly detected with medium severity. Current level: {value:.1}%. \
                         Monitor situation and be ready to adjust irrigation if condition worsens."
                    ),
                ),
                confidence: anomaly.model_confidence,
                priority: Priority::Medium,
            };
        }

        RuleOutcome {
            action: "Monitor soil moisture levels".to_string(),
            explanation: build_explanation(
                anomaly,
                context,
                format!(
                    "Moisture anomaly detected. Current level: {value:.1}%. \
                     Continue monitoring for changes."
                ),
            ),
            confidence: anomaly.model_confidence * 0.8,
            priority: Priority::Low,
        }
    }

    // ========================================================================
    // Temperature rules
    // ========================================================================

    fn analyze_temperature(
        &self,
        anomaly: &AnomalyRecord,
        context: &ReadingContext,
    ) -> RuleOutcome {
        let bands = self.thresholds.for_kind(SensorKind::Temperature);
        let change_rate = context.change_rate_or_zero();

        let Some(value) = context.recent_value else {
            return RuleOutcome {
                action: "Investigate temperature sensor - no recent data available".to_string(),
                explanation: build_explanation(
                    anomaly,
                    context,
                    "Temperature anomaly detected but sensor reading data is unavailable. \
                     Check sensor connectivity and verify data collection."
                        .to_string(),
                ),
                confidence: anomaly.model_confidence * 0.5,
                priority: Priority::Medium,
            };
        };

        if value > bands.critical_high {
            let mut detail = format!(
                "Extreme temperature detected at {value:.1}°C \
                 (normal range: {}-{}°C). ",
                bands.normal_min, bands.normal_max
            );
            if let Some(avg) = context.historical_avg {
                detail.push_str(&format!(
                    "This is {:.1}°C above recent average ({avg:.1}°C). ",
                    value - avg
                ));
            }
            if context.trend == Trend::Increasing {
                detail.push_str("Temperature continues to rise, worsening heat stress conditions. ");
            }
            detail.push_str(
                "Crops at high risk of heat stress, wilting, and reduced yields. \
                 Immediate action required to prevent permanent damage.",
            );

            return RuleOutcome {
                action: "URGENT: Heat stress mitigation - increase irrigation immediately and provide shade"
                    .to_string(),
                explanation: build_explanation(anomaly, context, detail),
                confidence: (anomaly.model_confidence + 0.15).min(1.0),
                priority: Priority::High,
            };
        }

        if value < bands.critical_low {
            return RuleOutcome {
                action: "URGENT: Cold protection required - risk of frost damage".to_string(),
                explanation: build_explanation(
                    anomaly,
                    context,
                    format!(
                        "Low temperature detected at {value:.1}°C. \
                         Risk of cold stress, frost damage, and potential crop loss. \
                         Consider protective measures such as row covers, heaters, \
                         or frost protection sprinklers."
                    ),
                ),
                confidence: (anomaly.model_confidence + 0.15).min(1.0),
                priority: Priority::High,
            };
        }

        if change_rate > 15.0 {
            return RuleOutcome {
                action: "Monitor crops closely - sudden temperature increase detected".to_string(),
                explanation: build_explanation(
                    anomaly,
                    context,
                    format!(
                        "Sudden temperature increase of {change_rate:.1}°C detected. \
                         Current temperature: {value:.1}°C. \
                         Monitor crop response and increase irrigation if needed."
                    ),
                ),
                confidence: anomaly.model_confidence,
                priority: high_if_severe(anomaly.severity),
            };
        }

        if change_rate < -15.0 {
            return RuleOutcome {
                action: "Monitor for cold stress - sudden temperature drop detected".to_string(),
                explanation: build_explanation(
                    anomaly,
                    context,
                    format!(
                        "Sudden temperature decrease of {:.1}°C detected. \
                         Current temperature: {value:.1}°C. \
                         Monitor for signs of cold stress.",
                        change_rate.abs()
                    ),
                ),
                confidence: anomaly.model_confidence,
                priority: Priority::Medium,
            };
        }

        if anomaly.severity == StoredSeverity::Medium {
            return RuleOutcome {
                action: "Monitor temperature trends and crop response".to_string(),
                explanation: build_explanation(
                    anomaly,
                    context,
                    format!(
                        "Temperature anomaly detected at {value:.1}°C. \
                         Continue monitoring for sustained deviations."
                    ),
                ),
                confidence: anomaly.model_confidence,
                priority: Priority::Medium,
            };
        }

        RuleOutcome {
            action: "Monitor temperature levels".to_string(),
            explanation: build_explanation(
                anomaly,
                context,
                format!("Temperature anomaly detected at {value:.1}°C. Continue routine monitoring."),
            ),
            confidence: anomaly.model_confidence * 0.8,
            priority: Priority::Low,
        }
    }

    // ========================================================================
    // Humidity rules
    // ========================================================================

    fn analyze_humidity(&self, anomaly: &AnomalyRecord, context: &ReadingContext) -> RuleOutcome {
        let bands = self.thresholds.for_kind(SensorKind::Humidity);
        let value = context.recent_value;

        if let Some(value) = value.filter(|v| *v < bands.critical_low) {
            return RuleOutcome {
                action: "Increase humidity or irrigation - risk of plant stress from dry air"
                    .to_string(),
                explanation: build_explanation(
                    anomaly,
                    context,
                    format!(
                        "Very low humidity at {value:.1}% \
                         (normal range: {}-{}%). \
                         Dry conditions may cause increased transpiration, water stress, \
                         and leaf damage. Consider misting or increasing irrigation.",
                        bands.normal_min, bands.normal_max
                    ),
                ),
                confidence: anomaly.model_confidence,
                priority: high_if_severe(anomaly.severity),
            };
        }

        if let Some(value) = value.filter(|v| *v > bands.critical_high) {
            return RuleOutcome {
                action: "Improve ventilation urgently - high humidity increases disease risk"
                    .to_string(),
                explanation: build_explanation(
                    anomaly,
                    context,
                    format!(
                        "High humidity at {value:.1}% (above {}%). \
                         Elevated risk of fungal diseases, mold, and bacterial infections. \
                         Improve air circulation, reduce watering frequency if possible, \
                         and monitor for disease symptoms.",
                        bands.critical_high
                    ),
                ),
                confidence: anomaly.model_confidence,
                priority: high_if_severe(anomaly.severity),
            };
        }

        let shown = DisplayValue(value);
        if anomaly.severity == StoredSeverity::Medium {
            return RuleOutcome {
                action: "Monitor humidity levels and ventilation".to_string(),
                explanation: build_explanation(
                    anomaly,
                    context,
                    format!(
                        "Humidity anomaly detected at {shown}%. \
                         Monitor for changes and ensure adequate ventilation."
                    ),
                ),
                confidence: anomaly.model_confidence,
                priority: Priority::Medium,
            };
        }

        RuleOutcome {
            action: "Monitor humidity levels".to_string(),
            explanation: build_explanation(
                anomaly,
                context,
                format!("Humidity anomaly detected at {shown}%. Continue routine monitoring."),
            ),
            confidence: anomaly.model_confidence * 0.8,
            priority: Priority::Low,
        }
    }

    // ========================================================================
    // Generic fallback rules
    // ========================================================================

    fn analyze_generic(&self, anomaly: &AnomalyRecord, context: &ReadingContext) -> RuleOutcome {
        if context.multiple_anomalies {
            return RuleOutcome {
                action: "URGENT: Comprehensive plot inspection - multiple stress factors detected"
                    .to_string(),
                explanation: build_explanation(
                    anomaly,
                    context,
                    "Multiple anomalies detected in short timeframe. \
                     This indicates combined stress factors affecting the plot. \
                     Conduct thorough inspection of irrigation, environmental conditions, \
                     and crop health."
                        .to_string(),
                ),
                confidence: anomaly.model_confidence * 0.9,
                priority: Priority::High,
            };
        }

        if anomaly.model_confidence < 0.6 {
            return RuleOutcome {
                action: "Verify with manual inspection - anomaly detected with moderate confidence"
                    .to_string(),
                explanation: build_explanation(
                    anomaly,
                    context,
                    format!(
                        "Anomaly detected with moderate confidence ({:.2}). \
                         Manual inspection recommended to confirm sensor readings \
                         and identify any issues.",
                        anomaly.model_confidence
                    ),
                ),
                confidence: anomaly.model_confidence,
                priority: Priority::Low,
            };
        }

        if anomaly.severity == StoredSeverity::High {
            return RuleOutcome {
                action: "Investigate anomaly urgently - high severity detected".to_string(),
                explanation: build_explanation(
                    anomaly,
                    context,
                    "High severity anomaly detected. Immediate investigation recommended."
                        .to_string(),
                ),
                confidence: anomaly.model_confidence,
                priority: Priority::High,
            };
        }

        RuleOutcome {
            action: "Investigate anomaly condition".to_string(),
            explanation: build_explanation(
                anomaly,
                context,
                "Anomaly detected in sensor data. Further investigation recommended \
                 to identify cause."
                    .to_string(),
            ),
            confidence: anomaly.model_confidence,
            priority: if anomaly.severity == StoredSeverity::Medium {
                Priority::Medium
            } else {
                Priority::Low
            },
        }
    }
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn high_if_severe(severity: StoredSeverity) -> Priority {
    if severity == StoredSeverity::High {
        Priority::High
    } else {
        Priority::Medium
    }
}

/// Boost confidence for severe change rates, capped at 1.0 and rounded to
/// two decimals.
fn boosted_confidence(model_confidence: f64, change_rate: f64) -> f64 {
    let boosted = match change_rate.abs() {
        rate if rate > 20.0 => (model_confidence + 0.2).min(1.0),
        rate if rate > 15.0 => (model_confidence + 0.15).min(1.0),
        rate if rate > 10.0 => (model_confidence + 0.1).min(1.0),
        _ => model_confidence,
    };
    (boosted * 100.0).round() / 100.0
}

/// A possibly-missing sensor value for explanation text.
struct DisplayValue(Option<f64>);

impl std::fmt::Display for DisplayValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Some(value) => write!(f, "{value:.1}"),
            None => write!(f, "unavailable"),
        }
    }
}

/// Shared explanation prefix and fixed-order context clauses.
fn build_explanation(anomaly: &AnomalyRecord, context: &ReadingContext, detail: String) -> String {
    let timestamp = anomaly.timestamp.format("%Y-%m-%d at %H:%M");
    let sensor = context
        .sensor_kind
        .map(|kind| kind.to_string())
        .unwrap_or_else(|| "sensor".to_string());

    let mut explanation = format!(
        "On {timestamp}, {sensor} readings detected a {} \
         (ML model confidence: {:.2}, severity: {}). {detail}",
        anomaly.label, anomaly.model_confidence, anomaly.severity
    );

    if let Some(sentence) = context.trend.sentence() {
        explanation.push_str(&format!(" Trend: {sentence}."));
    }

    if let Some(rate) = context.change_rate.filter(|r| r.abs() > 5.0) {
        explanation.push_str(&format!(" Change rate: {rate:+.1}%."));
    }

    if context.multiple_anomalies {
        explanation.push_str(
            " WARNING: Multiple anomalies detected - investigate for combined stress factors.",
        );
    }

    explanation
}
