use crate::metadata::{ImageRecord, MetadataStore};
use crate::mode::{ModeClassifier, ModeLabel};
use std::path::Path;

/// A valid record together with its resolved mode and geometry.
#[derive(Debug, Clone)]
pub struct Micrograph<'a> {
    pub record: &'a ImageRecord,
    pub mode: ModeLabel,
    pub x: f64,
    pub y: f64,
    pub fov_width: f64,
    pub fov_height: f64,
    pub magnification: f64,
}

impl<'a> Micrograph<'a> {
    /// `None` when the record lacks geometry, position or field-of-view.
    pub fn new(record: &'a ImageRecord, classifier: &ModeClassifier) -> Option<Self> {
        if !record.is_valid() {
            return None;
        }
        let (x, y) = record.stage_position()?;
        let (fov_width, fov_height) = record.field_of_view()?;
        let magnification = record.magnification()?;
        Some(Self {
            record,
            mode: classifier.classify(record),
            x,
            y,
            fov_width,
            fov_height,
            magnification,
        })
    }

    pub fn path(&self) -> &Path {
        &self.record.path
    }

    pub fn high_voltage_kv(&self) -> Option<f64> {
        self.record.high_voltage_kv
    }

    /// Voltage in volts, rounded, for exact grouping and comparison.
    pub fn voltage_key(&self) -> Option<i64> {
        self.record
            .high_voltage_kv
            .filter(|kv| kv.is_finite())
            .map(|kv| (kv.abs() * 1000.0).round() as i64)
    }
}

/// Every valid record of the store, classified, in path order.
pub fn collect_micrographs<'a>(
    store: &'a MetadataStore,
    classifier: &ModeClassifier,
) -> Vec<Micrograph<'a>> {
    let micrographs: Vec<_> = store
        .iter()
        .filter_map(|record| {
            let micrograph = Micrograph::new(record, classifier);
            if micrograph.is_none() {
                log::debug!("Excluding {}: incomplete geometry", record.path.display());
            }
            micrograph
        })
        .collect();
    log::debug!("{}/{} records usable for matching", micrographs.len(), store.len());
    micrographs
}
