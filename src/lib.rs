//! Micrograph Matching Library
//!
//! Organises electron micrographs into visual comparisons without the
//! operator having to say which frames belong together.
//!
//! ## Collections
//!
//! - **Pyramids** (`pyramid::PyramidBuilder`): chains of frames of one scene at
//!   increasing magnification. Candidates are pre-filtered by stage geometry
//!   (`spatial::SpatialMatcher::contains`) and then proven by locating the
//!   rescaled high-magnification frame inside the lower one with normalised
//!   cross-correlation (`image::matcher`).
//! - **Mode grids** (`mode_grid::ModeGridBuilder`): one scene captured under
//!   several detector modes, grouped by explicit `Collection` tags, by stage
//!   position, and by pairing chemical-imaging derivatives with their regular
//!   frames by filename.
//!
//! ## Pipeline
//!
//! 1. **Metadata** (`metadata::MetadataStore`): one record per image, read-only.
//! 2. **Classification** (`mode::ModeClassifier`): every valid record gets
//!    exactly one `ModeLabel`.
//! 3. **Discovery** (`discovery::CollectionDiscovery`): both builders run,
//!    collections get unique ids and are handed to a `persist::CollectionSink`.
//!
//! Correlation uses a direct sliding window for small problems and an FFT
//! numerator with summed-area-table denominators for large ones
//! (`image::fft`). Failures on individual image pairs are logged and skipped;
//! a discovery run never aborts.

pub mod collection;
pub mod config;
pub mod discovery;
pub mod error;
pub mod image;
pub mod metadata;
pub mod micrograph;
pub mod mode;
pub mod mode_grid;
pub mod persist;
pub mod pyramid;
pub mod spatial;

pub use collection::{
    Collection, CollectionKind, CollectionMember, CollectionSummary, MatchRect, VaryingParameters,
};
pub use config::DiscoveryConfig;
pub use discovery::{CollectionDiscovery, DiscoveryKind};
pub use error::{MatchingError, Result};
pub use image::{
    annotate_match_rects, image_data_to_rgb_image, save_pyramid_annotations, DebugOutputConfig,
    FileFrameLocator, ImageData, TemplateMatch, TemplateMatcher,
};
pub use metadata::{ImageRecord, MetadataStore};
pub use micrograph::Micrograph;
pub use mode::{ModeClassifier, ModeLabel};
pub use mode_grid::ModeGridBuilder;
pub use persist::{load_collection, load_collection_dir, CollectionSink, JsonDirectorySink};
pub use pyramid::{FrameLocator, PyramidBuilder};
pub use spatial::{MatchTolerances, SpatialMatcher};
