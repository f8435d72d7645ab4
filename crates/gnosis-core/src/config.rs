//! # Configuration
//!
//! Tunables for the memory, self-map and messaging subsystems. Every field has
//! a default, so a partial TOML document deserializes cleanly.

use crate::primitives::MAX_SELF_MODEL_DEPTH;
use crate::types::GnosisError;
use serde::{Deserialize, Serialize};

/// Runtime configuration for [`crate::GnosisCore`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GnosisConfig {
    /// Deepest recursive self-model level that may be created or observed.
    pub max_self_model_depth: u32,
    /// Salience added to each record returned by a recall.
    pub recall_boost: f64,
    /// Recall scores below this are excluded from results.
    pub recall_threshold: f64,
    /// Decay rate (per second) for memories stored without an explicit rate.
    pub default_decay_rate: f64,
    /// Age (seconds) at which the recency factor halves.
    pub recency_half_life_secs: f64,
    /// Multiplier applied to salience before qualia feedback is added.
    pub feedback_decay: f64,
    /// Accepted clock skew and nonce retention for messages (seconds).
    pub freshness_window_secs: u64,
}

impl Default for GnosisConfig {
    fn default() -> Self {
        Self {
            max_self_model_depth: 5,
            recall_boost: 0.1,
            recall_threshold: 0.01,
            default_decay_rate: 0.01,
            recency_half_life_secs: 86_400.0,
            feedback_decay: 0.99,
            freshness_window_secs: 300,
        }
    }
}

impl GnosisConfig {
    /// Reject configurations that would make scoring or recursion ill-defined.
    pub fn validate(&self) -> Result<(), GnosisError> {
        if self.max_self_model_depth > MAX_SELF_MODEL_DEPTH {
            return Err(GnosisError::Validation(format!(
                "max_self_model_depth {} exceeds ceiling {}",
                self.max_self_model_depth, MAX_SELF_MODEL_DEPTH
            )));
        }
        let unit = [
            ("recall_boost", self.recall_boost),
            ("recall_threshold", self.recall_threshold),
            ("feedback_decay", self.feedback_decay),
        ];
        for (name, value) in unit {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(GnosisError::Validation(format!(
                    "{} must be in [0, 1], got {}",
                    name, value
                )));
            }
        }
        if !self.default_decay_rate.is_finite() || self.default_decay_rate < 0.0 {
            return Err(GnosisError::Validation(format!(
                "default_decay_rate must be >= 0, got {}",
                self.default_decay_rate
            )));
        }
        if !self.recency_half_life_secs.is_finite() || self.recency_half_life_secs <= 0.0 {
            return Err(GnosisError::Validation(format!(
                "recency_half_life_secs must be > 0, got {}",
                self.recency_half_life_secs
            )));
        }
        if self.freshness_window_secs == 0 {
            return Err(GnosisError::Validation(
                "freshness_window_secs must be > 0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = GnosisConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_self_model_depth, 5);
        assert!((config.recall_boost - 0.1).abs() < f64::EPSILON);
        assert_eq!(config.freshness_window_secs, 300);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: GnosisConfig =
            serde_json::from_str(r#"{"recall_boost": 0.25}"#).expect("parse");
        assert!((config.recall_boost - 0.25).abs() < f64::EPSILON);
        assert_eq!(config.max_self_model_depth, 5);
    }

    #[test]
    fn rejects_out_of_range_values() {
        let config = GnosisConfig {
            recall_boost: 1.5,
            ..GnosisConfig::default()
        };
        assert!(config.validate().is_err());

        let config = GnosisConfig {
            max_self_model_depth: MAX_SELF_MODEL_DEPTH + 1,
            ..GnosisConfig::default()
        };
        assert!(config.validate().is_err());

        let config = GnosisConfig {
            recency_half_life_secs: 0.0,
            ..GnosisConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
