//! Magnification pyramids: chains of frames of one scene, each a zoomed-in
//! region of the one before.
//!
//! Geometry proposes, pixels decide. A candidate must first pass
//! [`SpatialMatcher::contains`], and is then located inside the current chain
//! head by normalised cross-correlation through a [`FrameLocator`].

use crate::collection::{Collection, CollectionKind, CollectionMember};
use crate::config::DiscoveryConfig;
use crate::error::Result;
use crate::image::matcher::TemplateMatch;
use crate::micrograph::Micrograph;
use crate::mode::ModeLabel;
use crate::spatial::{MatchTolerances, SpatialMatcher};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::ops::RangeInclusive;

/// Template scale used when the field-of-view ratio is unusable.
pub const FALLBACK_FOV_RATIO: f64 = 0.5;

const SANE_FOV_RATIO: RangeInclusive<f64> = 0.01..=0.9;

/// Finds a higher-magnification frame inside a lower-magnification one.
pub trait FrameLocator {
    /// `fov_ratio` is child field-of-view width over parent field-of-view
    /// width, already sanitised. The returned rectangle is in the parent's
    /// pixel space.
    fn locate(
        &self,
        parent: &Micrograph<'_>,
        child: &Micrograph<'_>,
        fov_ratio: f64,
    ) -> Result<TemplateMatch>;
}

/// Child-over-parent field-of-view width, or [`FALLBACK_FOV_RATIO`].
pub fn fov_ratio(parent: &Micrograph<'_>, child: &Micrograph<'_>) -> f64 {
    let ratio = child.fov_width / parent.fov_width;
    if ratio.is_finite() && SANE_FOV_RATIO.contains(&ratio) {
        ratio
    } else {
        warn!(
            "Degenerate field-of-view ratio {} for {} -> {}, using {}",
            ratio,
            parent.path().display(),
            child.path().display(),
            FALLBACK_FOV_RATIO
        );
        FALLBACK_FOV_RATIO
    }
}

pub struct PyramidBuilder<L> {
    matcher: SpatialMatcher,
    locator: L,
    threshold: f32,
}

impl<L: FrameLocator> PyramidBuilder<L> {
    pub fn new(matcher: SpatialMatcher, locator: L, threshold: f32) -> Self {
        Self {
            matcher,
            locator,
            threshold,
        }
    }

    pub fn from_config(config: &DiscoveryConfig, locator: L) -> Self {
        Self::new(
            SpatialMatcher::new(MatchTolerances::from(config)),
            locator,
            config.template_match_threshold,
        )
    }

    pub fn locator(&self) -> &L {
        &self.locator
    }

    /// Splits the micrographs by (mode, voltage) and builds chains in each set.
    pub fn discover(&self, micrographs: &[Micrograph<'_>]) -> Vec<Collection> {
        let mut groups: BTreeMap<(ModeLabel, Option<i64>), Vec<&Micrograph<'_>>> = BTreeMap::new();
        for micrograph in micrographs {
            groups
                .entry((micrograph.mode.clone(), micrograph.voltage_key()))
                .or_default()
                .push(micrograph);
        }

        let mut collections = Vec::new();
        for ((mode, voltage), mut group) in groups {
            if group.len() < 2 {
                continue;
            }
            group.sort_by(|a, b| a.magnification.total_cmp(&b.magnification));
            debug!(
                "Searching {} {} images at {:?} V for pyramids",
                group.len(),
                mode,
                voltage
            );
            collections.extend(self.build_chains(&group));
        }

        info!("Discovered {} pyramid collections", collections.len());
        collections
    }

    /// Greedy chain extension over one (mode, voltage) set sorted by
    /// ascending magnification. The first acceptable candidate wins.
    pub fn build_chains(&self, sorted: &[&Micrograph<'_>]) -> Vec<Collection> {
        let mut consumed = vec![false; sorted.len()];
        let mut collections = Vec::new();

        for start in 0..sorted.len() {
            if consumed[start] {
                continue;
            }
            let mut head = start;
            let mut members = vec![CollectionMember::new(sorted[start].record, sorted[start].mode.clone())];

            for candidate in start + 1..sorted.len() {
                if !self.matcher.contains(sorted[head], sorted[candidate]) {
                    continue;
                }
                let Some(found) = self.correlate(sorted[head], sorted[candidate]) else {
                    continue;
                };
                if found.correlation < self.threshold {
                    debug!(
                        "Rejected {} in {}: score {:.3} below {:.3}",
                        sorted[candidate].path().display(),
                        sorted[head].path().display(),
                        found.correlation,
                        self.threshold
                    );
                    continue;
                }

                members.push(
                    CollectionMember::new(sorted[candidate].record, sorted[candidate].mode.clone())
                        .with_match(&found),
                );
                consumed[candidate] = true;
                head = candidate;
            }

            if members.len() >= 2 {
                collections.push(Collection::new(
                    pyramid_id(sorted[start]),
                    CollectionKind::Pyramid,
                    members,
                ));
            }
        }

        collections
    }

    fn correlate(&self, parent: &Micrograph<'_>, child: &Micrograph<'_>) -> Option<TemplateMatch> {
        match self.locator.locate(parent, child, fov_ratio(parent, child)) {
            Ok(found) => {
                debug!(
                    "{} located in {} at ({}, {}) {}x{}, score {:.3}",
                    child.path().display(),
                    parent.path().display(),
                    found.x,
                    found.y,
                    found.width,
                    found.height,
                    found.correlation
                );
                Some(found)
            }
            Err(err) => {
                warn!(
                    "Skipping pair {} -> {}: {}",
                    parent.path().display(),
                    child.path().display(),
                    err
                );
                None
            }
        }
    }
}

fn pyramid_id(head: &Micrograph<'_>) -> String {
    let voltage = head
        .high_voltage_kv()
        .filter(|kv| kv.is_finite())
        .map(|kv| format!("{}kV", kv.abs().round() as i64))
        .unwrap_or_else(|| "unknownkV".to_string());
    format!("pyramid_{}_{}_{:.3}_{:.3}", head.mode, voltage, head.x, head.y)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MatchingError;
    use crate::metadata::ImageRecord;
    use crate::mode::ModeClassifier;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::path::PathBuf;

    /// Returns a fixed score per (parent, child) filename pair.
    #[derive(Default)]
    struct ScriptedLocator {
        scores: HashMap<(String, String), f32>,
        calls: RefCell<Vec<(String, String, f64)>>,
    }

    impl ScriptedLocator {
        fn score(mut self, parent: &str, child: &str, score: f32) -> Self {
            self.scores.insert((parent.into(), child.into()), score);
            self
        }
    }

    impl FrameLocator for ScriptedLocator {
        fn locate(
            &self,
            parent: &Micrograph<'_>,
            child: &Micrograph<'_>,
            fov_ratio: f64,
        ) -> Result<TemplateMatch> {
            let key = (parent.record.filename(), child.record.filename());
            self.calls.borrow_mut().push((key.0.clone(), key.1.clone(), fov_ratio));
            match self.scores.get(&key) {
                Some(&correlation) => Ok(TemplateMatch {
                    x: 10,
                    y: 12,
                    width: 64,
                    height: 48,
                    correlation,
                }),
                None => Err(MatchingError::MissingImage(PathBuf::from(&key.1))),
            }
        }
    }

    fn record(name: &str, fov: f64) -> ImageRecord {
        ImageRecord {
            detector: Some("SED".into()),
            high_voltage_kv: Some(15.0),
            pixel_width: Some(1024),
            pixel_height: Some(768),
            fov_width_um: Some(fov),
            fov_height_um: Some(fov * 0.75),
            stage_x_um: Some(0.0),
            stage_y_um: Some(0.0),
            ..ImageRecord::new(format!("/data/{name}"))
        }
    }

    fn views<'a>(records: &'a [ImageRecord]) -> Vec<Micrograph<'a>> {
        let classifier = ModeClassifier::default();
        records.iter().filter_map(|r| Micrograph::new(r, &classifier)).collect()
    }

    #[test]
    fn accepted_pair_forms_pyramid() {
        let records = [record("low.tif", 1270.0), record("high.tif", 254.0)];
        let locator = ScriptedLocator::default().score("low.tif", "high.tif", 0.7);
        let builder = PyramidBuilder::from_config(&DiscoveryConfig::default(), locator);

        let collections = builder.discover(&views(&records));
        assert_eq!(collections.len(), 1);
        let pyramid = &collections[0];
        assert_eq!(pyramid.kind, CollectionKind::Pyramid);
        assert_eq!(pyramid.len(), 2);
        assert_eq!(pyramid.members[0].path, PathBuf::from("/data/low.tif"));
        assert!(pyramid.members[0].match_rect.is_none());
        assert_eq!(pyramid.match_rects().count(), 1);
        assert_eq!(pyramid.summary.magnifications, vec![100.0, 500.0]);

        let calls = builder.locator().calls.borrow();
        assert!((calls[0].2 - 0.2).abs() < 1e-12);
    }

    #[test]
    fn weak_correlation_moves_on_to_next_candidate() {
        let records = [
            record("a.tif", 1000.0),
            record("b.tif", 400.0),
            record("c.tif", 100.0),
        ];
        let locator = ScriptedLocator::default()
            .score("a.tif", "b.tif", 0.3)
            .score("a.tif", "c.tif", 0.6)
            .score("b.tif", "c.tif", 0.9);
        let builder = PyramidBuilder::from_config(&DiscoveryConfig::default(), locator);

        let collections = builder.discover(&views(&records));
        let chains: Vec<Vec<String>> = collections
            .iter()
            .map(|c| c.members.iter().map(|m| m.record.filename()).collect())
            .collect();
        // c is consumed by the first chain; b still heads its own.
        assert_eq!(chains, vec![vec!["a.tif", "c.tif"], vec!["b.tif", "c.tif"]]);
    }

    #[test]
    fn rejected_pair_yields_nothing() {
        let records = [record("low.tif", 1270.0), record("high.tif", 254.0)];
        let locator = ScriptedLocator::default().score("low.tif", "high.tif", 0.3);
        let builder = PyramidBuilder::from_config(&DiscoveryConfig::default(), locator);
        assert!(builder.discover(&views(&records)).is_empty());
    }

    #[test]
    fn chain_advances_head() {
        let records = [
            record("a.tif", 1000.0),
            record("b.tif", 200.0),
            record("c.tif", 40.0),
        ];
        let locator = ScriptedLocator::default()
            .score("a.tif", "b.tif", 0.8)
            .score("b.tif", "c.tif", 0.8);
        let builder = PyramidBuilder::from_config(&DiscoveryConfig::default(), locator);

        let collections = builder.discover(&views(&records));
        assert_eq!(collections.len(), 1);
        assert_eq!(collections[0].len(), 3);
        // a -> c is never correlated once b has become the head.
        let calls = builder.locator().calls.borrow();
        assert!(calls.iter().all(|(p, c, _)| !(p == "a.tif" && c == "c.tif")));
    }

    #[test]
    fn unreadable_pairs_are_skipped() {
        let records = [record("low.tif", 1000.0), record("high.tif", 200.0)];
        let builder = PyramidBuilder::from_config(&DiscoveryConfig::default(), ScriptedLocator::default());
        assert!(builder.discover(&views(&records)).is_empty());
    }

    #[test]
    fn different_voltages_never_chain() {
        let mut high = record("high.tif", 200.0);
        high.high_voltage_kv = Some(5.0);
        let records = [record("low.tif", 1000.0), high];
        let locator = ScriptedLocator::default().score("low.tif", "high.tif", 0.99);
        let builder = PyramidBuilder::from_config(&DiscoveryConfig::default(), locator);
        assert!(builder.discover(&views(&records)).is_empty());
        assert!(builder.locator().calls.borrow().is_empty());
    }

    #[test]
    fn degenerate_ratio_falls_back() {
        let records = [record("low.tif", 1000.0), record("high.tif", 1.0)];
        let micrographs = views(&records);
        assert_eq!(fov_ratio(&micrographs[0], &micrographs[1]), FALLBACK_FOV_RATIO);
        assert_eq!(fov_ratio(&micrographs[0], &micrographs[0]), FALLBACK_FOV_RATIO);
    }
}
