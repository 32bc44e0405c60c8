//! Discovery configuration.
//!
//! A [`DiscoveryConfig`] is read once (usually from JSON), validated, and then
//! handed by reference to the matcher and builder constructors. Nothing in the
//! engine reads configuration from ambient state.

use crate::error::{MatchingError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Tunables recognised by the discovery engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Maximum stage offset between two frames of the same scene, as a
    /// fraction of the smaller field-of-view.
    pub scene_match_tolerance: f64,
    /// Maximum relative magnification difference for the same scene.
    pub magnification_tolerance: f64,
    /// Maximum relative working-distance difference for the same scene.
    pub working_distance_tolerance: f64,
    /// Minimum correlation peak accepted as proof of containment.
    pub template_match_threshold: f32,
    /// A child must be at least this many times the parent's magnification.
    pub min_magnification_step: f64,
    /// Fraction by which the child's field-of-view is shrunk before the
    /// containment test.
    pub containment_generosity: f64,
    /// Mode label prefixes in presentation order.
    pub preferred_modes_order: Vec<String>,
    /// Filename substring marking a chemical-imaging derivative.
    pub chemsem_marker: String,
    /// Merge exact-position groups whose anchors match within tolerance.
    pub merge_nearby_positions: bool,
    /// Correlation runs at no more than this many pixels across the parent.
    pub max_correlation_width: u32,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            scene_match_tolerance: 0.03,
            magnification_tolerance: 0.1,
            working_distance_tolerance: 0.05,
            template_match_threshold: 0.5,
            min_magnification_step: 1.5,
            containment_generosity: 0.5,
            preferred_modes_order: ["sed", "bsd", "topo", "chemsem", "edx"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            chemsem_marker: "ChemiSEM".to_string(),
            merge_nearby_positions: true,
            max_correlation_width: 1024,
        }
    }
}

impl DiscoveryConfig {
    /// Load and validate a JSON configuration file. Missing keys take their
    /// default values.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let config: DiscoveryConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        log::info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let fractions = [
            ("scene_match_tolerance", self.scene_match_tolerance),
            ("magnification_tolerance", self.magnification_tolerance),
            ("working_distance_tolerance", self.working_distance_tolerance),
        ];
        for (name, value) in fractions {
            if !value.is_finite() || value < 0.0 {
                return Err(MatchingError::InvalidConfig(format!(
                    "{name} must be a non-negative number, got {value}"
                )));
            }
        }
        if !self.template_match_threshold.is_finite()
            || !(-1.0..=1.0).contains(&self.template_match_threshold)
        {
            return Err(MatchingError::InvalidConfig(format!(
                "template_match_threshold must lie in [-1, 1], got {}",
                self.template_match_threshold
            )));
        }
        if !self.min_magnification_step.is_finite() || self.min_magnification_step < 1.0 {
            return Err(MatchingError::InvalidConfig(format!(
                "min_magnification_step must be at least 1, got {}",
                self.min_magnification_step
            )));
        }
        if !(0.0..1.0).contains(&self.containment_generosity) {
            return Err(MatchingError::InvalidConfig(format!(
                "containment_generosity must lie in [0, 1), got {}",
                self.containment_generosity
            )));
        }
        if self.chemsem_marker.trim().is_empty() {
            return Err(MatchingError::InvalidConfig(
                "chemsem_marker must not be empty".to_string(),
            ));
        }
        if self.max_correlation_width < 16 {
            return Err(MatchingError::InvalidConfig(format!(
                "max_correlation_width must be at least 16, got {}",
                self.max_correlation_width
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = DiscoveryConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scene_match_tolerance, 0.03);
        assert_eq!(config.template_match_threshold, 0.5);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: DiscoveryConfig =
            serde_json::from_str(r#"{"template_match_threshold": 0.7}"#).unwrap();
        assert_eq!(config.template_match_threshold, 0.7);
        assert_eq!(config.scene_match_tolerance, 0.03);
        assert_eq!(config.chemsem_marker, "ChemiSEM");
    }

    #[test]
    fn rejects_out_of_range_values() {
        let config = DiscoveryConfig {
            template_match_threshold: 1.5,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(MatchingError::InvalidConfig(_))));

        let config = DiscoveryConfig {
            scene_match_tolerance: f64::NAN,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = DiscoveryConfig {
            chemsem_marker: "  ".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"preferred_modes_order": ["bsd", "sed"]}"#).unwrap();
        let config = DiscoveryConfig::load(&path).unwrap();
        assert_eq!(config.preferred_modes_order, vec!["bsd", "sed"]);
    }
}
