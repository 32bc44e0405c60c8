//! The unit handed to rendering and export, produced by both builders.

use crate::image::matcher::TemplateMatch;
use crate::metadata::ImageRecord;
use crate::mode::ModeLabel;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionKind {
    Pyramid,
    ModeGrid,
}

impl CollectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionKind::Pyramid => "pyramid",
            CollectionKind::ModeGrid => "mode_grid",
        }
    }
}

impl fmt::Display for CollectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rectangle in the previous member's pixel space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl From<&TemplateMatch> for MatchRect {
    fn from(m: &TemplateMatch) -> Self {
        Self {
            x: m.x,
            y: m.y,
            width: m.width,
            height: m.height,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionMember {
    pub path: PathBuf,
    pub record: ImageRecord,
    pub mode: ModeLabel,
    pub display_name: String,
    /// Other images that fit this slot but were not selected.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alternatives: Vec<PathBuf>,
    /// Where this member sits inside the previous one (pyramids only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_rect: Option<MatchRect>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_score: Option<f32>,
}

impl CollectionMember {
    pub fn new(record: &ImageRecord, mode: ModeLabel) -> Self {
        Self {
            path: record.path.clone(),
            record: record.clone(),
            display_name: mode.display_name(record.high_voltage_kv),
            mode,
            alternatives: Vec::new(),
            match_rect: None,
            match_score: None,
        }
    }

    pub fn with_alternatives(mut self, alternatives: Vec<PathBuf>) -> Self {
        self.alternatives = alternatives;
        self
    }

    pub fn with_match(mut self, found: &TemplateMatch) -> Self {
        self.match_rect = Some(MatchRect::from(found));
        self.match_score = Some(found.correlation);
        self
    }
}

/// Whether an acquisition parameter takes more than one value across members.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaryingParameters {
    pub high_voltage: bool,
    pub emission_current: bool,
    pub integrations: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectionSummary {
    /// Field-of-view (µm) of the reference member.
    pub field_of_view: Option<(f64, f64)>,
    /// Stage position (µm) of the reference member.
    pub position: Option<(f64, f64)>,
    pub high_voltage_kv: Option<f64>,
    /// Distinct modes in member order.
    pub modes: Vec<ModeLabel>,
    pub magnifications: Vec<f64>,
    pub varying_parameters: VaryingParameters,
}

fn more_than_one<T: PartialEq>(values: impl Iterator<Item = T>) -> bool {
    let mut first = None;
    for value in values {
        match &first {
            None => first = Some(value),
            Some(seen) if *seen != value => return true,
            Some(_) => {}
        }
    }
    false
}

impl CollectionSummary {
    /// The first member is the reference.
    pub fn from_members(members: &[CollectionMember]) -> Self {
        let reference = members.first().map(|m| &m.record);

        let mut modes: Vec<ModeLabel> = Vec::new();
        for member in members {
            if !modes.contains(&member.mode) {
                modes.push(member.mode.clone());
            }
        }

        let records = || members.iter().map(|m| &m.record);
        Self {
            field_of_view: reference.and_then(ImageRecord::field_of_view),
            position: reference.and_then(ImageRecord::stage_position),
            high_voltage_kv: reference.and_then(|r| r.high_voltage_kv),
            modes,
            magnifications: records().filter_map(ImageRecord::magnification).collect(),
            varying_parameters: VaryingParameters {
                high_voltage: more_than_one(records().filter_map(|r| r.high_voltage_kv)),
                emission_current: more_than_one(records().filter_map(|r| r.emission_current_ua)),
                integrations: more_than_one(records().filter_map(|r| r.integrations)),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    pub id: String,
    pub kind: CollectionKind,
    pub members: Vec<CollectionMember>,
    pub summary: CollectionSummary,
}

impl Collection {
    pub fn new<S: Into<String>>(id: S, kind: CollectionKind, members: Vec<CollectionMember>) -> Self {
        let summary = CollectionSummary::from_members(&members);
        Self {
            id: id.into(),
            kind,
            members,
            summary,
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Only collections with at least two members are ever handed out.
    pub fn is_complete(&self) -> bool {
        self.members.len() >= 2
    }

    pub fn refresh_summary(&mut self) {
        self.summary = CollectionSummary::from_members(&self.members);
    }

    /// Every image referenced, selected or alternative.
    pub fn member_set(&self) -> BTreeSet<&Path> {
        self.members
            .iter()
            .flat_map(|m| std::iter::once(m.path.as_path()).chain(m.alternatives.iter().map(PathBuf::as_path)))
            .collect()
    }

    /// Pyramid levels as (parent index, rectangle in parent pixels, score).
    pub fn match_rects(&self) -> impl Iterator<Item = (usize, MatchRect, Option<f32>)> + '_ {
        self.members
            .iter()
            .enumerate()
            .skip(1)
            .filter_map(|(i, m)| m.match_rect.map(|rect| (i - 1, rect, m.match_score)))
    }

    /// Figure caption text for export.
    pub fn caption(&self, sample_id: &str) -> String {
        match self.kind {
            CollectionKind::Pyramid => {
                let mode = self
                    .members
                    .first()
                    .map(|m| m.mode.display_name(None))
                    .unwrap_or_else(|| "Unknown".to_string());
                let voltage = self
                    .summary
                    .high_voltage_kv
                    .map(|kv| format!("{}", kv.abs().round() as i64))
                    .unwrap_or_else(|| "Unknown".to_string());
                let series: Vec<String> = self
                    .summary
                    .magnifications
                    .iter()
                    .map(|m| format!("{}x", m.round() as i64))
                    .collect();
                format!(
                    "Sample {sample_id} imaged with {mode} detector at {voltage} kV.\nMagnification series: {}.",
                    series.join(", ")
                )
            }
            CollectionKind::ModeGrid => {
                let (width, height) = self.summary.field_of_view.unwrap_or((0.0, 0.0));
                let modes: Vec<&str> = self.members.iter().map(|m| m.display_name.as_str()).collect();
                format!(
                    "Sample {sample_id} comparison of imaging modes.\nField of view: {width:.1} x {height:.1} μm.\nModes shown: {}.",
                    modes.join(", ")
                )
            }
        }
    }
}
