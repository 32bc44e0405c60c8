//! Structured per-image metadata, as produced by the instrument metadata
//! extractor. The engine only ever reads these records.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Display-width constant used by the instrument to express magnification:
/// `magnification = 127000 / field_of_view_width_um`.
pub const MAGNIFICATION_REFERENCE_UM: f64 = 127_000.0;

/// Free-form key that pins an image to a user-defined collection.
pub const COLLECTION_TAG_KEY: &str = "Collection";

/// Per-segment detector mix weights, keyed by channel name (`bsdA`..`bsdD`).
pub type MixWeights = BTreeMap<String, f64>;

/// Prefix of mix weights stored as flat attributes, e.g. `detectorMixFactors_bsdA`.
pub const FLAT_MIX_WEIGHT_PREFIX: &str = "detectorMixFactors_";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageRecord {
    #[serde(alias = "image_path")]
    pub path: PathBuf,
    pub filename: String,

    #[serde(alias = "pixels_width")]
    pub pixel_width: Option<u32>,
    #[serde(alias = "pixels_height")]
    pub pixel_height: Option<u32>,
    #[serde(alias = "pixel_dimension_nm")]
    pub pixel_size_nm: Option<f64>,
    #[serde(alias = "field_of_view_width")]
    pub fov_width_um: Option<f64>,
    #[serde(alias = "field_of_view_height")]
    pub fov_height_um: Option<f64>,
    pub magnification: Option<f64>,

    #[serde(alias = "mode")]
    pub detector: Option<String>,
    #[serde(alias = "detectorMixFactors")]
    pub mix_weights: Option<MixWeights>,
    #[serde(alias = "high_voltage_kV")]
    pub high_voltage_kv: Option<f64>,
    pub working_distance_mm: Option<f64>,
    #[serde(alias = "emission_current_uA")]
    pub emission_current_ua: Option<f64>,
    pub integrations: Option<u32>,

    #[serde(alias = "sample_position_x")]
    pub stage_x_um: Option<f64>,
    #[serde(alias = "sample_position_y")]
    pub stage_y_um: Option<f64>,

    /// Any further named parameters, including an optional `Collection` tag.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ImageRecord {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        let path = path.into();
        let filename = file_name_of(&path);
        Self {
            path,
            filename,
            ..Default::default()
        }
    }

    /// The record's filename, falling back to the last path component.
    pub fn filename(&self) -> String {
        if self.filename.is_empty() {
            file_name_of(&self.path)
        } else {
            self.filename.clone()
        }
    }

    /// Field-of-view (width, height) in µm, either stored or derived from
    /// pixel size and pixel counts.
    pub fn field_of_view(&self) -> Option<(f64, f64)> {
        let stored = self.fov_width_um.zip(self.fov_height_um);
        let derived = || {
            let size_um = self.pixel_size_nm? / 1000.0;
            Some((
                size_um * self.pixel_width? as f64,
                size_um * self.pixel_height? as f64,
            ))
        };
        stored
            .or_else(derived)
            .filter(|(w, h)| w.is_finite() && h.is_finite() && *w > 0.0 && *h > 0.0)
    }

    pub fn magnification(&self) -> Option<f64> {
        self.magnification
            .filter(|m| m.is_finite() && *m > 0.0)
            .or_else(|| {
                self.field_of_view()
                    .map(|(width, _)| MAGNIFICATION_REFERENCE_UM / width)
            })
    }

    pub fn stage_position(&self) -> Option<(f64, f64)> {
        self.stage_x_um
            .zip(self.stage_y_um)
            .filter(|(x, y)| x.is_finite() && y.is_finite())
    }

    /// A record takes part in matching only with pixel geometry, stage
    /// position and field-of-view all present.
    pub fn is_valid(&self) -> bool {
        let geometry = matches!(
            (self.pixel_width, self.pixel_height),
            (Some(w), Some(h)) if w > 0 && h > 0
        );
        geometry && self.stage_position().is_some() && self.field_of_view().is_some()
    }

    /// Non-empty `Collection` tag, if any. Numeric tags are accepted.
    pub fn collection_tag(&self) -> Option<String> {
        match self.extra.get(COLLECTION_TAG_KEY)? {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Nested mix weights, or else those stored as flat
    /// `detectorMixFactors_<channel>` attributes with numeric values.
    pub fn detector_mix_weights(&self) -> Option<MixWeights> {
        if let Some(weights) = &self.mix_weights {
            return Some(weights.clone());
        }
        let flat: MixWeights = self
            .extra
            .iter()
            .filter_map(|(key, value)| {
                let channel = key.strip_prefix(FLAT_MIX_WEIGHT_PREFIX)?;
                Some((channel.to_string(), value.as_f64()?))
            })
            .filter(|(channel, _)| !channel.is_empty())
            .collect();
        (!flat.is_empty()).then_some(flat)
    }

    pub fn has_extra(&self, key: &str) -> bool {
        self.extra.contains_key(key)
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StoreFile {
    List(Vec<ImageRecord>),
    Map(BTreeMap<PathBuf, ImageRecord>),
}

/// Read-only mapping from image path to its metadata record.
#[derive(Debug, Clone, Default)]
pub struct MetadataStore {
    records: BTreeMap<PathBuf, ImageRecord>,
}

impl MetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records<I: IntoIterator<Item = ImageRecord>>(records: I) -> Self {
        let mut store = Self::new();
        for record in records {
            store.insert(record);
        }
        store
    }

    /// Load a store from JSON: either a list of records or an object keyed
    /// by image path.
    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref())?;
        let store = match serde_json::from_str::<StoreFile>(&contents)? {
            StoreFile::List(records) => Self::from_records(records.into_iter().filter(|record| {
                let named = !record.path.as_os_str().is_empty();
                if !named {
                    log::warn!(
                        "Skipping metadata record without an image path (filename {:?})",
                        record.filename
                    );
                }
                named
            })),
            StoreFile::Map(map) => Self::from_records(map.into_iter().map(|(key, mut record)| {
                if record.path.as_os_str().is_empty() {
                    record.path = key;
                }
                record
            })),
        };
        log::info!(
            "Loaded {} metadata records ({} valid) from {}",
            store.len(),
            store.valid_count(),
            path.as_ref().display()
        );
        Ok(store)
    }

    pub fn insert(&mut self, mut record: ImageRecord) {
        if record.filename.is_empty() {
            record.filename = file_name_of(&record.path);
        }
        self.records.insert(record.path.clone(), record);
    }

    pub fn get(&self, path: &Path) -> Option<&ImageRecord> {
        self.records.get(path)
    }

    /// Records in path order.
    pub fn iter(&self) -> impl Iterator<Item = &ImageRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn valid_count(&self) -> usize {
        self.iter().filter(|r| r.is_valid()).count()
    }
}
