//! Crate-wide configuration.
//!
//! Every subsystem keeps its own config struct next to its code; this
//! module only aggregates them into one TOML-loadable document with sane
//! defaults, so `MaatConfig::default()` is a working setup.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::decide::DecisionConfig;
use crate::detect::DetectionConfig;
use crate::engine::CycleConfig;
use crate::error::ConfigError;
use crate::observe::ObservabilityConfig;
use crate::oracle::OracleConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MaatConfig {
    pub detection: DetectionConfig,
    pub decision: DecisionConfig,
    pub observability: ObservabilityConfig,
    pub oracle: OracleConfig,
    pub cycle: CycleConfig,
    /// Predicates for which a subject may hold only one current value.
    pub exclusive_predicates: Vec<String>,
}

impl MaatConfig {
    /// Load and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let config: MaatConfig = toml::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations no cycle could run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.detection.confidence_floor) {
            return Err(ConfigError::Invalid {
                message: format!(
                    "detection.confidence_floor must be in [0, 1], got {}",
                    self.detection.confidence_floor
                ),
                hint: "confidence values are probabilities".into(),
            });
        }
        if self.detection.ambiguity_band < 0.0 {
            return Err(ConfigError::Invalid {
                message: format!(
                    "detection.ambiguity_band must be non-negative, got {}",
                    self.detection.ambiguity_band
                ),
                hint: "use 0.0 to disable ambiguity escalation".into(),
            });
        }
        if self.decision.attempt_cap == 0 {
            return Err(ConfigError::Invalid {
                message: "decision.attempt_cap must be at least 1".into(),
                hint: "the first oracle call counts as an attempt".into(),
            });
        }
        if !(0.0..=1.0).contains(&self.decision.min_verdict_confidence) {
            return Err(ConfigError::Invalid {
                message: format!(
                    "decision.min_verdict_confidence must be in [0, 1], got {}",
                    self.decision.min_verdict_confidence
                ),
                hint: "confidence values are probabilities".into(),
            });
        }
        if self.decision.max_concurrent_calls == 0 {
            return Err(ConfigError::Invalid {
                message: "decision.max_concurrent_calls must be at least 1".into(),
                hint: "use 1 for strictly serial oracle calls".into(),
            });
        }
        if self.observability.instability_threshold == 0 {
            return Err(ConfigError::Invalid {
                message: "observability.instability_threshold must be at least 1".into(),
                hint: "a threshold of 0 would flag every entity".into(),
            });
        }
        if self.cycle.interval_secs == 0 {
            return Err(ConfigError::Invalid {
                message: "cycle.interval_secs must be at least 1".into(),
                hint: "run `maat heal` for a single immediate cycle".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        MaatConfig::default().validate().unwrap();
    }

    #[test]
    fn default_values() {
        let config = MaatConfig::default();
        assert_eq!(config.detection.confidence_floor, 0.5);
        assert_eq!(config.decision.attempt_cap, 3);
        assert_eq!(config.decision.min_verdict_confidence, 0.7);
        assert_eq!(config.observability.instability_threshold, 3);
        assert_eq!(config.cycle.interval_secs, 3600);
        assert!(!config.oracle.enabled);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: MaatConfig = toml::from_str(
            r#"
            exclusive_predicates = ["CEO_OF", "HEADQUARTERED_IN"]

            [detection]
            confidence_floor = 0.4

            [oracle]
            enabled = true
            model = "mistral"
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.exclusive_predicates.len(), 2);
        assert_eq!(config.detection.confidence_floor, 0.4);
        // Untouched sections keep their defaults.
        assert_eq!(config.detection.ambiguity_band, 0.05);
        assert_eq!(config.oracle.model, "mistral");
        assert_eq!(config.oracle.base_url, "http://localhost:11434");
    }

    #[test]
    fn nonsense_rejected() {
        let mut config = MaatConfig::default();
        config.detection.confidence_floor = 1.5;
        assert!(config.validate().is_err());

        let mut config = MaatConfig::default();
        config.decision.attempt_cap = 0;
        assert!(config.validate().is_err());

        let mut config = MaatConfig::default();
        config.cycle.interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_missing_file_fails() {
        let err = MaatConfig::load(Path::new("/nonexistent/maat.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("maat.toml");
        std::fs::write(&path, "exclusive_predicates = [\"CEO_OF\"]\n").unwrap();
        let config = MaatConfig::load(&path).unwrap();
        assert_eq!(config.exclusive_predicates, vec!["CEO_OF".to_string()]);
    }
}
