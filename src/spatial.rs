//! Geometric relationships between micrographs.
//!
//! [`SpatialMatcher::positions_match`] decides whether two frames show the same
//! scene; [`SpatialMatcher::contains`] is the cheap pre-filter run before any
//! pixels are correlated for a magnification pyramid.

use crate::config::DiscoveryConfig;
use crate::micrograph::Micrograph;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchTolerances {
    pub scene: f64,
    pub magnification: f64,
    pub working_distance: f64,
    pub min_magnification_step: f64,
    pub containment_generosity: f64,
}

impl From<&DiscoveryConfig> for MatchTolerances {
    fn from(config: &DiscoveryConfig) -> Self {
        Self {
            scene: config.scene_match_tolerance,
            magnification: config.magnification_tolerance,
            working_distance: config.working_distance_tolerance,
            min_magnification_step: config.min_magnification_step,
            containment_generosity: config.containment_generosity,
        }
    }
}

impl Default for MatchTolerances {
    fn default() -> Self {
        Self::from(&DiscoveryConfig::default())
    }
}

/// |a - b| relative to the larger magnitude; symmetric in its arguments.
fn relative_deviation(a: f64, b: f64) -> f64 {
    let scale = a.abs().max(b.abs());
    if scale == 0.0 {
        0.0
    } else {
        (a - b).abs() / scale
    }
}

#[derive(Debug, Clone, Default)]
pub struct SpatialMatcher {
    tolerances: MatchTolerances,
}

impl SpatialMatcher {
    pub fn new(tolerances: MatchTolerances) -> Self {
        Self { tolerances }
    }

    pub fn tolerances(&self) -> &MatchTolerances {
        &self.tolerances
    }

    /// Same-scene test used for mode grouping.
    pub fn positions_match(&self, a: &Micrograph<'_>, b: &Micrograph<'_>) -> bool {
        if a.x == b.x && a.y == b.y {
            return true;
        }
        if let (Some(tag_a), Some(tag_b)) = (a.record.collection_tag(), b.record.collection_tag()) {
            if tag_a == tag_b {
                return true;
            }
        }

        let fov_width = a.fov_width.min(b.fov_width);
        let fov_height = a.fov_height.min(b.fov_height);
        if fov_width <= 0.0 || fov_height <= 0.0 {
            return false;
        }
        let x_diff = (a.x - b.x).abs() / fov_width;
        let y_diff = (a.y - b.y).abs() / fov_height;
        let position_ok = x_diff <= self.tolerances.scene && y_diff <= self.tolerances.scene;

        let magnification_ok =
            relative_deviation(a.magnification, b.magnification) <= self.tolerances.magnification;

        let working_distance_ok = match (a.record.working_distance_mm, b.record.working_distance_mm) {
            (Some(wd_a), Some(wd_b)) => {
                relative_deviation(wd_a, wd_b) <= self.tolerances.working_distance
            }
            _ => true,
        };

        position_ok && magnification_ok && working_distance_ok
    }

    /// Whether `child` plausibly lies inside `parent` at a higher magnification.
    /// Necessary, not sufficient: pixel correlation has the final say.
    pub fn contains(&self, parent: &Micrograph<'_>, child: &Micrograph<'_>) -> bool {
        if parent.mode != child.mode || parent.voltage_key() != child.voltage_key() {
            return false;
        }
        if child.magnification < parent.magnification * self.tolerances.min_magnification_step {
            return false;
        }

        let shrink = 1.0 - self.tolerances.containment_generosity;
        let child_half_w = child.fov_width / 2.0 * shrink;
        let child_half_h = child.fov_height / 2.0 * shrink;
        let parent_half_w = parent.fov_width / 2.0;
        let parent_half_h = parent.fov_height / 2.0;

        child.x - child_half_w >= parent.x - parent_half_w
            && child.x + child_half_w <= parent.x + parent_half_w
            && child.y - child_half_h >= parent.y - parent_half_h
            && child.y + child_half_h <= parent.y + parent_half_h
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::ImageRecord;
    use crate::mode::ModeClassifier;

    fn record(name: &str, x: f64, y: f64, fov: f64) -> ImageRecord {
        ImageRecord {
            detector: Some("SED".into()),
            high_voltage_kv: Some(15.0),
            working_distance_mm: Some(10.0),
            pixel_width: Some(1024),
            pixel_height: Some(1024),
            fov_width_um: Some(fov),
            fov_height_um: Some(fov),
            stage_x_um: Some(x),
            stage_y_um: Some(y),
            ..ImageRecord::new(format!("/data/{name}.tif"))
        }
    }

    fn view(record: &ImageRecord) -> Micrograph<'_> {
        Micrograph::new(record, &ModeClassifier::default()).unwrap()
    }

    #[test]
    fn identical_positions_always_match() {
        let matcher = SpatialMatcher::new(MatchTolerances {
            scene: 0.0,
            magnification: 0.0,
            working_distance: 0.0,
            ..Default::default()
        });
        let a = record("a", 1.234_567_89, -9.876_543_21, 100.0);
        let mut b = record("b", 1.234_567_89, -9.876_543_21, 10.0);
        b.working_distance_mm = Some(4.0);
        assert!(matcher.positions_match(&view(&a), &view(&a)));
        assert!(matcher.positions_match(&view(&a), &view(&b)));
        assert!(matcher.positions_match(&view(&b), &view(&a)));
    }

    #[test]
    fn tolerance_is_relative_to_smaller_fov() {
        let matcher = SpatialMatcher::default();
        let a = record("a", 0.0, 0.0, 100.0);
        let near = record("b", 2.9, 0.0, 100.0);
        let far = record("c", 3.1, 0.0, 100.0);
        assert!(matcher.positions_match(&view(&a), &view(&near)));
        assert!(matcher.positions_match(&view(&near), &view(&a)));
        assert!(!matcher.positions_match(&view(&a), &view(&far)));
    }

    #[test]
    fn magnification_and_working_distance_must_agree() {
        let matcher = SpatialMatcher::default();
        let a = record("a", 0.0, 0.0, 100.0);
        let zoomed = record("b", 0.5, 0.0, 50.0);
        assert!(!matcher.positions_match(&view(&a), &view(&zoomed)));

        let mut refocused = record("c", 0.5, 0.0, 100.0);
        refocused.working_distance_mm = Some(12.0);
        assert!(!matcher.positions_match(&view(&a), &view(&refocused)));

        refocused.working_distance_mm = None;
        assert!(matcher.positions_match(&view(&a), &view(&refocused)));
    }

    #[test]
    fn shared_tag_overrides_numeric_checks() {
        let matcher = SpatialMatcher::default();
        let mut a = record("a", 0.0, 0.0, 100.0);
        let mut b = record("b", 500.0, 500.0, 10.0);
        a.extra.insert("Collection".into(), "T1".into());
        b.extra.insert("Collection".into(), "T1".into());
        assert!(matcher.positions_match(&view(&a), &view(&b)));
        b.extra.insert("Collection".into(), "T2".into());
        assert!(!matcher.positions_match(&view(&a), &view(&b)));
    }

    #[test]
    fn containment_requires_magnification_step() {
        let matcher = SpatialMatcher::default();
        let parent = record("p", 0.0, 0.0, 100.0);
        // Field-of-view ratios strictly above 1/1.5 keep the child under the step.
        for fov in [100.0, 90.0, 80.0, 70.0, 66.7] {
            let child = record("c", 0.0, 0.0, fov);
            assert!(!matcher.contains(&view(&parent), &view(&child)), "fov {fov}");
        }
        let child = record("c", 0.0, 0.0, 20.0);
        assert!(matcher.contains(&view(&parent), &view(&child)));
        assert!(!matcher.contains(&view(&child), &view(&parent)));
    }

    #[test]
    fn containment_accepts_exact_magnification_step() {
        let matcher = SpatialMatcher::default();
        let mut parent = record("p", 0.0, 0.0, 100.0);
        parent.magnification = Some(100.0);
        let mut child = record("c", 0.0, 0.0, 200.0 / 3.0);
        child.magnification = Some(150.0);
        assert!(matcher.contains(&view(&parent), &view(&child)));

        child.magnification = Some(149.99);
        assert!(!matcher.contains(&view(&parent), &view(&child)));
    }

    #[test]
    fn containment_is_generous_at_edges() {
        let matcher = SpatialMatcher::default();
        let parent = record("p", 0.0, 0.0, 100.0);
        // Child spans 35..55 µm and overhangs the parent edge at 50 µm;
        // its shrunk core (40..50) still fits.
        let edge = record("e", 45.0, 0.0, 20.0);
        assert!(matcher.contains(&view(&parent), &view(&edge)));
        let outside = record("o", 56.0, 0.0, 20.0);
        assert!(!matcher.contains(&view(&parent), &view(&outside)));
    }

    #[test]
    fn containment_requires_same_mode_and_voltage() {
        let matcher = SpatialMatcher::default();
        let parent = record("p", 0.0, 0.0, 100.0);
        let mut child = record("c", 0.0, 0.0, 20.0);
        child.detector = Some("BSD".into());
        assert!(!matcher.contains(&view(&parent), &view(&child)));
        child.detector = Some("SED".into());
        child.high_voltage_kv = Some(5.0);
        assert!(!matcher.contains(&view(&parent), &view(&child)));
    }
}
