//! Detector-mode classification.
//!
//! Every valid record resolves to exactly one [`ModeLabel`]. The raw detector
//! string is first parsed into a [`DetectorReading`], and the label is then
//! chosen by a single ordered `match` over the reading, the chemical-imaging
//! filename marker and the mix weights.

use crate::metadata::{ImageRecord, MixWeights};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Canonical identifier for a detector / imaging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ModeLabel {
    Sed,
    Bsd,
    BsdAll,
    TopoH,
    TopoV,
    Mix,
    ChemSem,
    Unknown,
    /// Any other detector, by its lower-cased name.
    Other(String),
}

impl ModeLabel {
    pub fn as_str(&self) -> &str {
        match self {
            ModeLabel::Sed => "sed",
            ModeLabel::Bsd => "bsd",
            ModeLabel::BsdAll => "bsd-all",
            ModeLabel::TopoH => "topo-h",
            ModeLabel::TopoV => "topo-v",
            ModeLabel::Mix => "mix",
            ModeLabel::ChemSem => "chemsem",
            ModeLabel::Unknown => "unknown",
            ModeLabel::Other(name) => name,
        }
    }

    /// Human-readable name, with the beam voltage appended when known.
    pub fn display_name(&self, high_voltage_kv: Option<f64>) -> String {
        let base = match self {
            ModeLabel::Sed => "SED".to_string(),
            ModeLabel::Bsd => "BSD".to_string(),
            ModeLabel::BsdAll => "BSD (all)".to_string(),
            ModeLabel::TopoH => "Topo 136°".to_string(),
            ModeLabel::TopoV => "Topo 44°".to_string(),
            ModeLabel::Mix => "Mix".to_string(),
            ModeLabel::ChemSem => "ChemSEM".to_string(),
            ModeLabel::Unknown => "Unknown".to_string(),
            ModeLabel::Other(name) => name.to_uppercase(),
        };
        match high_voltage_kv.filter(|kv| kv.is_finite()) {
            Some(kv) => format!("{base} {} kV", kv.abs().round() as i64),
            None => base,
        }
    }
}

impl fmt::Display for ModeLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for ModeLabel {
    fn from(value: String) -> Self {
        match value.as_str() {
            "sed" => ModeLabel::Sed,
            "bsd" => ModeLabel::Bsd,
            "bsd-all" => ModeLabel::BsdAll,
            "topo-h" => ModeLabel::TopoH,
            "topo-v" => ModeLabel::TopoV,
            "mix" => ModeLabel::Mix,
            "chemsem" => ModeLabel::ChemSem,
            "unknown" => ModeLabel::Unknown,
            _ => ModeLabel::Other(value),
        }
    }
}

impl From<ModeLabel> for String {
    fn from(label: ModeLabel) -> Self {
        label.as_str().to_string()
    }
}

/// Parsed form of the raw detector field.
#[derive(Debug, Clone, PartialEq)]
enum DetectorReading {
    Unset,
    SecondaryElectron,
    Backscatter,
    BackscatterAll,
    Mixed,
    Named(String),
}

impl DetectorReading {
    fn parse(raw: Option<&str>) -> Self {
        let name = match raw.map(str::trim) {
            None | Some("") => return DetectorReading::Unset,
            Some(name) => name.to_lowercase(),
        };
        match name.as_str() {
            "sed" => DetectorReading::SecondaryElectron,
            "bsd" => DetectorReading::Backscatter,
            "bsd-all" | "bsd_all" | "bsdall" | "bsd all" => DetectorReading::BackscatterAll,
            "mix" | "mixed" => DetectorReading::Mixed,
            _ => DetectorReading::Named(name),
        }
    }
}

/// Dominant direction of a four-segment backscatter mix.
fn topo_direction(weights: &MixWeights) -> ModeLabel {
    let channel = |name: &str| {
        weights
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.abs())
            .unwrap_or(0.0)
    };
    let horizontal = channel("bsdB") + channel("bsdC");
    let vertical = channel("bsdA") + channel("bsdD");
    if horizontal > vertical {
        ModeLabel::TopoH
    } else if vertical > horizontal {
        ModeLabel::TopoV
    } else {
        ModeLabel::Mix
    }
}

/// Mix weights that actually carry a signal.
fn effective_weights(weights: Option<MixWeights>) -> Option<MixWeights> {
    weights.filter(|w| w.values().any(|v| v.is_finite() && *v != 0.0))
}

#[derive(Debug, Clone)]
pub struct ModeClassifier {
    chemsem_marker: String,
}

impl Default for ModeClassifier {
    fn default() -> Self {
        Self::new("ChemiSEM")
    }
}

impl ModeClassifier {
    pub fn new<S: Into<String>>(chemsem_marker: S) -> Self {
        Self {
            chemsem_marker: chemsem_marker.into(),
        }
    }

    pub fn chemsem_marker(&self) -> &str {
        &self.chemsem_marker
    }

    pub fn is_chemsem_filename(&self, filename: &str) -> bool {
        filename.contains(&self.chemsem_marker)
    }

    pub fn classify(&self, record: &ImageRecord) -> ModeLabel {
        let chemsem = self.is_chemsem_filename(&record.filename());
        let reading = DetectorReading::parse(record.detector.as_deref());
        let weights = effective_weights(record.detector_mix_weights());

        match (chemsem, reading, weights) {
            (true, _, _) => ModeLabel::ChemSem,
            (false, DetectorReading::Unset, _) => ModeLabel::Unknown,
            (false, DetectorReading::SecondaryElectron, _) => ModeLabel::Sed,
            (false, DetectorReading::Backscatter, _) => ModeLabel::Bsd,
            (false, DetectorReading::BackscatterAll, _) => ModeLabel::BsdAll,
            (false, DetectorReading::Mixed, Some(weights)) => topo_direction(&weights),
            (false, DetectorReading::Mixed, None) if record.has_extra("topo-h") => ModeLabel::TopoH,
            (false, DetectorReading::Mixed, None) if record.has_extra("topo-v") => ModeLabel::TopoV,
            (false, DetectorReading::Mixed, None) => ModeLabel::Mix,
            (false, DetectorReading::Named(name), _) => ModeLabel::Other(name),
        }
    }
}
