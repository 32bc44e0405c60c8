//! Mode grids: the same scene captured under different detector modes.
//!
//! Two independent discovery paths produce candidate groups. Explicit
//! `Collection` tags are honoured first, then images are grouped by stage
//! position, with chemical-imaging derivatives paired to their regular
//! counterpart by filename. Results are merged and deduplicated by the set of
//! images they reference.

use crate::collection::{Collection, CollectionKind, CollectionMember};
use crate::config::DiscoveryConfig;
use crate::metadata::MetadataStore;
use crate::micrograph::Micrograph;
use crate::mode::{ModeClassifier, ModeLabel};
use crate::spatial::{MatchTolerances, SpatialMatcher};
use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

/// Sort rank for modes missing from the preferred order.
pub const UNLISTED_MODE_RANK: usize = 999;

/// Stage positions are grouped exactly, down to this resolution in µm.
const POSITION_KEY_RESOLUTION_UM: f64 = 1e-6;

/// What a candidate group was keyed on.
#[derive(Debug, Clone, PartialEq)]
pub enum GroupKey {
    Tag(String),
    Position { x: f64, y: f64 },
}

impl GroupKey {
    pub fn collection_id(&self) -> String {
        match self {
            GroupKey::Tag(tag) => format!("mode_grid_{tag}"),
            GroupKey::Position { x, y } => format!("mode_grid_{x:.3}_{y:.3}"),
        }
    }
}

/// Images believed to show one scene, before slotting into a collection.
#[derive(Debug, Clone)]
pub struct SceneGroup<'a> {
    pub key: GroupKey,
    pub members: Vec<Micrograph<'a>>,
}

impl SceneGroup<'_> {
    pub fn distinct_modes(&self) -> usize {
        self.members.iter().map(|m| &m.mode).collect::<BTreeSet<_>>().len()
    }
}

fn position_key(micrograph: &Micrograph<'_>) -> (i64, i64) {
    (
        (micrograph.x / POSITION_KEY_RESOLUTION_UM).round() as i64,
        (micrograph.y / POSITION_KEY_RESOLUTION_UM).round() as i64,
    )
}

fn strip_extension(filename: &str) -> &str {
    match filename.rfind('.') {
        Some(dot) if dot > 0 => &filename[..dot],
        _ => filename,
    }
}

pub struct ModeGridBuilder {
    matcher: SpatialMatcher,
    classifier: ModeClassifier,
    preferred_modes: Vec<String>,
    merge_nearby_positions: bool,
}

impl ModeGridBuilder {
    pub fn new(
        matcher: SpatialMatcher,
        classifier: ModeClassifier,
        preferred_modes: Vec<String>,
        merge_nearby_positions: bool,
    ) -> Self {
        Self {
            matcher,
            classifier,
            preferred_modes,
            merge_nearby_positions,
        }
    }

    pub fn from_config(config: &DiscoveryConfig) -> Self {
        Self::new(
            SpatialMatcher::new(MatchTolerances::from(config)),
            ModeClassifier::new(config.chemsem_marker.clone()),
            config.preferred_modes_order.clone(),
            config.merge_nearby_positions,
        )
    }

    /// Both discovery paths, merged.
    pub fn discover(&self, micrographs: &[Micrograph<'_>]) -> Vec<Collection> {
        let tagged = self.discover_by_tag(micrographs);
        let positioned = self.discover_by_position(micrographs);
        let collections = merge_candidates(tagged, positioned);
        info!("Discovered {} mode-grid collections", collections.len());
        collections
    }

    /// Position in the preferred-mode order, matched by prefix.
    pub fn mode_rank(&self, mode: &ModeLabel) -> usize {
        self.preferred_modes
            .iter()
            .position(|preferred| mode.as_str().starts_with(preferred.as_str()))
            .unwrap_or(UNLISTED_MODE_RANK)
    }

    pub fn discover_by_tag(&self, micrographs: &[Micrograph<'_>]) -> Vec<Collection> {
        let mut groups: BTreeMap<String, Vec<Micrograph<'_>>> = BTreeMap::new();
        for micrograph in micrographs {
            if let Some(tag) = micrograph.record.collection_tag() {
                groups.entry(tag).or_default().push(micrograph.clone());
            }
        }
        if !groups.is_empty() {
            info!("Found {} tagged groups", groups.len());
        }

        groups
            .into_iter()
            .filter_map(|(tag, members)| {
                self.build_collection(SceneGroup {
                    key: GroupKey::Tag(tag),
                    members,
                })
            })
            .collect()
    }

    pub fn discover_by_position(&self, micrographs: &[Micrograph<'_>]) -> Vec<Collection> {
        self.group_by_position(micrographs)
            .into_iter()
            .filter_map(|group| self.build_collection(group))
            .collect()
    }

    /// Exact-position groups, with chemical-imaging derivatives attached to
    /// the group of their regular counterpart.
    pub fn group_by_position<'a>(&self, micrographs: &[Micrograph<'a>]) -> Vec<SceneGroup<'a>> {
        let marker = self.classifier.chemsem_marker();
        let (chemsem, regular): (Vec<_>, Vec<_>) = micrographs
            .iter()
            .partition(|m| self.classifier.is_chemsem_filename(&m.record.filename()));

        let mut by_base: HashMap<String, Vec<&Micrograph<'a>>> = HashMap::new();
        let mut unpaired = Vec::new();
        for micrograph in chemsem {
            let filename = micrograph.record.filename();
            let base = strip_extension(&filename.replacen(marker, "", 1))
                .trim_end_matches(['_', '-'])
                .to_string();
            if regular.iter().any(|r| strip_extension(&r.record.filename()) == base) {
                by_base.entry(base).or_default().push(micrograph);
            } else {
                debug!("No regular counterpart for {}", filename);
                unpaired.push(micrograph);
            }
        }
        debug!(
            "{} regular and {} chemical-imaging images, {} unpaired",
            regular.len(),
            by_base.values().map(Vec::len).sum::<usize>() + unpaired.len(),
            unpaired.len()
        );

        let mut exact: BTreeMap<(i64, i64), Vec<Micrograph<'a>>> = BTreeMap::new();
        for micrograph in regular.iter().copied().chain(unpaired) {
            exact
                .entry(position_key(micrograph))
                .or_default()
                .push(micrograph.clone());
        }
        for micrograph in &regular {
            let base = strip_extension(&micrograph.record.filename()).to_string();
            if let Some(paired) = by_base.remove(&base) {
                let group = exact.entry(position_key(micrograph)).or_default();
                group.extend(paired.into_iter().cloned());
            }
        }

        let mut groups: Vec<SceneGroup<'a>> = exact
            .into_values()
            .map(|members| SceneGroup {
                key: GroupKey::Position {
                    x: members[0].x,
                    y: members[0].y,
                },
                members,
            })
            .collect();

        if self.merge_nearby_positions {
            groups = self.merge_nearby(groups);
        }
        info!("Created {} position groups", groups.len());
        groups
    }

    /// Folds groups whose anchors describe the same scene into one.
    fn merge_nearby<'a>(&self, groups: Vec<SceneGroup<'a>>) -> Vec<SceneGroup<'a>> {
        let mut merged: Vec<SceneGroup<'a>> = Vec::new();
        for group in groups {
            let target = merged
                .iter_mut()
                .find(|existing| self.matcher.positions_match(&existing.members[0], &group.members[0]));
            match target {
                Some(existing) => {
                    debug!(
                        "Merging position group {} into {}",
                        group.key.collection_id(),
                        existing.key.collection_id()
                    );
                    existing.members.extend(group.members);
                }
                None => merged.push(group),
            }
        }
        merged
    }

    /// Slots the group by (mode, voltage), orders slots by preferred mode and
    /// builds the collection. `None` unless at least two modes are present.
    pub fn build_collection(&self, group: SceneGroup<'_>) -> Option<Collection> {
        let id = group.key.collection_id();
        if group.distinct_modes() < 2 {
            debug!(
                "Skipping {}: {} images, {} distinct modes",
                id,
                group.members.len(),
                group.distinct_modes()
            );
            return None;
        }

        let mut slots: Vec<((ModeLabel, Option<i64>), Vec<&Micrograph<'_>>)> = Vec::new();
        for micrograph in &group.members {
            let slot_key = (micrograph.mode.clone(), micrograph.voltage_key());
            match slots.iter_mut().find(|(key, _)| *key == slot_key) {
                Some((_, images)) => {
                    if !images.iter().any(|m| m.path() == micrograph.path()) {
                        images.push(micrograph);
                    }
                }
                None => slots.push((slot_key, vec![micrograph])),
            }
        }

        let mut members: Vec<CollectionMember> = slots
            .into_iter()
            .map(|((mode, _), images)| {
                let alternatives = images[1..].iter().map(|m| m.path().to_path_buf()).collect();
                CollectionMember::new(images[0].record, mode).with_alternatives(alternatives)
            })
            .collect();
        members.sort_by_key(|member| self.mode_rank(&member.mode));

        let collection = Collection::new(id, CollectionKind::ModeGrid, members);
        info!(
            "Mode grid {}: {} members, modes {:?}",
            collection.id,
            collection.len(),
            collection.summary.modes.iter().map(ModeLabel::as_str).collect::<Vec<_>>()
        );
        Some(collection)
    }

    /// Replaces the image in `slot` by one of its recorded alternatives. The
    /// previous image becomes an alternative. Anything invalid returns the
    /// collection untouched.
    pub fn switch_image_alternative(
        &self,
        mut collection: Collection,
        store: &MetadataStore,
        slot: usize,
        alternative: &Path,
    ) -> Collection {
        let Some(member) = collection.members.get(slot) else {
            debug!("{}: no slot {}", collection.id, slot);
            return collection;
        };
        let Some(index) = member.alternatives.iter().position(|p| p == alternative) else {
            debug!(
                "{}: {} is not an alternative for slot {}",
                collection.id,
                alternative.display(),
                slot
            );
            return collection;
        };
        let Some(record) = store.get(alternative) else {
            warn!("No metadata for alternative {}", alternative.display());
            return collection;
        };

        let mode = self.classifier.classify(record);
        let member = &mut collection.members[slot];
        member.alternatives.remove(index);
        let previous = std::mem::replace(&mut member.path, alternative.to_path_buf());
        if !member.alternatives.contains(&previous) {
            member.alternatives.push(previous);
        }
        member.display_name = mode.display_name(record.high_voltage_kv);
        member.mode = mode;
        member.record = record.clone();
        collection.refresh_summary();
        collection
    }
}

/// Tag results first, then position results, dropping any candidate that
/// references exactly the same images as one already kept.
pub fn merge_candidates(tagged: Vec<Collection>, positioned: Vec<Collection>) -> Vec<Collection> {
    let mut seen: BTreeSet<BTreeSet<PathBuf>> = BTreeSet::new();
    let mut merged = Vec::new();
    for collection in tagged.into_iter().chain(positioned) {
        let key: BTreeSet<PathBuf> = collection.member_set().into_iter().map(Path::to_path_buf).collect();
        if seen.insert(key) {
            merged.push(collection);
        } else {
            debug!("Dropping duplicate collection {}", collection.id);
        }
    }
    merged
}
