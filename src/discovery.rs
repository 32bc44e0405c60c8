//! One discovery run over a metadata store: both builders, unique ids, and
//! hand-off to a [`CollectionSink`].

use crate::collection::{Collection, CollectionKind};
use crate::config::DiscoveryConfig;
use crate::image::matcher::{FileFrameLocator, TemplateMatcher};
use crate::metadata::MetadataStore;
use crate::micrograph::collect_micrographs;
use crate::mode::ModeClassifier;
use crate::mode_grid::ModeGridBuilder;
use crate::persist::CollectionSink;
use crate::pyramid::{FrameLocator, PyramidBuilder};
use log::{info, warn};
use std::collections::HashSet;
use std::path::Path;

/// Which builders a run uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiscoveryKind {
    Pyramid,
    ModeGrid,
    #[default]
    All,
}

impl DiscoveryKind {
    fn includes(self, kind: CollectionKind) -> bool {
        matches!(
            (self, kind),
            (DiscoveryKind::All, _)
                | (DiscoveryKind::Pyramid, CollectionKind::Pyramid)
                | (DiscoveryKind::ModeGrid, CollectionKind::ModeGrid)
        )
    }
}

pub struct CollectionDiscovery<L = FileFrameLocator> {
    classifier: ModeClassifier,
    pyramids: PyramidBuilder<L>,
    mode_grids: ModeGridBuilder,
}

impl CollectionDiscovery<FileFrameLocator> {
    /// Discovery that correlates the image files named by the records.
    pub fn new(config: &DiscoveryConfig) -> Self {
        let locator = FileFrameLocator::new(TemplateMatcher::new(config.max_correlation_width));
        Self::with_locator(config, locator)
    }
}

impl<L: FrameLocator> CollectionDiscovery<L> {
    pub fn with_locator(config: &DiscoveryConfig, locator: L) -> Self {
        Self {
            classifier: ModeClassifier::new(config.chemsem_marker.clone()),
            pyramids: PyramidBuilder::from_config(config, locator),
            mode_grids: ModeGridBuilder::from_config(config),
        }
    }

    pub fn discover_pyramids(&self, store: &MetadataStore) -> Vec<Collection> {
        let micrographs = collect_micrographs(store, &self.classifier);
        self.pyramids.discover(&micrographs)
    }

    pub fn discover_mode_grids(&self, store: &MetadataStore) -> Vec<Collection> {
        let micrographs = collect_micrographs(store, &self.classifier);
        self.mode_grids.discover(&micrographs)
    }

    /// Pyramids first, then mode grids, with unique ids and fewer-than-two
    /// member results dropped.
    pub fn discover_all(&self, store: &MetadataStore) -> Vec<Collection> {
        self.discover(store, DiscoveryKind::All)
    }

    pub fn discover(&self, store: &MetadataStore, kind: DiscoveryKind) -> Vec<Collection> {
        if store.is_empty() {
            info!("No metadata records, nothing to discover");
            return Vec::new();
        }
        let micrographs = collect_micrographs(store, &self.classifier);

        let mut collections = Vec::new();
        if kind.includes(CollectionKind::Pyramid) {
            collections.extend(self.pyramids.discover(&micrographs));
        }
        if kind.includes(CollectionKind::ModeGrid) {
            collections.extend(self.mode_grids.discover(&micrographs));
        }
        collections.retain(Collection::is_complete);
        assign_unique_ids(&mut collections);
        collections
    }

    /// Runs discovery and hands every collection to `sink`. Sink failures are
    /// logged; the collection is still returned.
    pub fn discover_into(
        &self,
        store: &MetadataStore,
        kind: DiscoveryKind,
        sink: &mut dyn CollectionSink,
    ) -> Vec<Collection> {
        let collections = self.discover(store, kind);
        for collection in &collections {
            if let Err(err) = sink.save(&collection.id, collection) {
                warn!("Failed to save collection {}: {}", collection.id, err);
            }
        }
        info!("Discovery finished with {} collections", collections.len());
        collections
    }

    pub fn switch_image_alternative(
        &self,
        collection: Collection,
        store: &MetadataStore,
        slot: usize,
        alternative: &Path,
    ) -> Collection {
        self.mode_grids
            .switch_image_alternative(collection, store, slot, alternative)
    }

    pub fn locator(&self) -> &L {
        self.pyramids.locator()
    }
}

/// Suffixes `_2`, `_3`, ... onto repeated ids.
pub fn assign_unique_ids(collections: &mut [Collection]) {
    let mut taken: HashSet<String> = HashSet::new();
    for collection in collections.iter_mut() {
        if !taken.contains(&collection.id) {
            taken.insert(collection.id.clone());
            continue;
        }
        let mut suffix = 2;
        while taken.contains(&format!("{}_{}", collection.id, suffix)) {
            suffix += 1;
        }
        collection.id = format!("{}_{}", collection.id, suffix);
        taken.insert(collection.id.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::CollectionMember;
    use crate::error::{MatchingError, Result};
    use crate::image::matcher::TemplateMatch;
    use crate::metadata::ImageRecord;
    use crate::micrograph::Micrograph;
    use crate::mode::ModeLabel;

    struct NoPixels;

    impl FrameLocator for NoPixels {
        fn locate(&self, _: &Micrograph<'_>, child: &Micrograph<'_>, _: f64) -> Result<TemplateMatch> {
            Err(MatchingError::MissingImage(child.path().to_path_buf()))
        }
    }

    struct FailingSink;

    impl CollectionSink for FailingSink {
        fn save(&mut self, _: &str, _: &Collection) -> Result<()> {
            Err(MatchingError::InvalidConfig("read-only".into()))
        }
    }

    fn stub(id: &str) -> Collection {
        let members = vec![
            CollectionMember::new(&ImageRecord::new("/a"), ModeLabel::Sed),
            CollectionMember::new(&ImageRecord::new("/b"), ModeLabel::Bsd),
        ];
        Collection::new(id, CollectionKind::ModeGrid, members)
    }

    fn record(name: &str, detector: &str) -> ImageRecord {
        ImageRecord {
            detector: Some(detector.into()),
            pixel_width: Some(512),
            pixel_height: Some(512),
            fov_width_um: Some(50.0),
            fov_height_um: Some(50.0),
            stage_x_um: Some(3.0),
            stage_y_um: Some(4.0),
            ..ImageRecord::new(format!("/data/{name}"))
        }
    }

    #[test]
    fn repeated_ids_get_suffixes() {
        let mut collections = vec![stub("x"), stub("x"), stub("x_2"), stub("x")];
        assign_unique_ids(&mut collections);
        let ids: Vec<_> = collections.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["x", "x_2", "x_2_2", "x_3"]);
    }

    #[test]
    fn empty_store_yields_nothing() {
        let discovery = CollectionDiscovery::with_locator(&DiscoveryConfig::default(), NoPixels);
        let mut saved: Vec<Collection> = Vec::new();
        assert!(discovery
            .discover_into(&MetadataStore::new(), DiscoveryKind::All, &mut saved)
            .is_empty());
        assert!(saved.is_empty());
    }

    #[test]
    fn sink_receives_every_collection_and_failures_do_not_abort() {
        let store = MetadataStore::from_records([record("a.tif", "SED"), record("b.tif", "BSD")]);
        let discovery = CollectionDiscovery::with_locator(&DiscoveryConfig::default(), NoPixels);

        let mut saved: Vec<Collection> = Vec::new();
        let collections = discovery.discover_into(&store, DiscoveryKind::All, &mut saved);
        assert_eq!(collections.len(), 1);
        assert_eq!(saved, collections);

        let collections = discovery.discover_into(&store, DiscoveryKind::ModeGrid, &mut FailingSink);
        assert_eq!(collections.len(), 1);
        assert!(discovery.discover(&store, DiscoveryKind::Pyramid).is_empty());
    }
}
