// src/image/mod.rs

pub mod fft;
pub mod loader;
pub mod matcher;

use crate::collection::{Collection, CollectionKind, MatchRect};
use crate::error::Result;
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use std::path::{Path, PathBuf};

pub use loader::ImageData;
pub use matcher::{FileFrameLocator, TemplateMatch, TemplateMatcher};

/// Colour palette for match annotations, by correlation strength.
pub struct DebugColors;
impl DebugColors {
    pub const STRONG: Rgb<u8> = Rgb([0, 255, 0]);
    pub const GOOD: Rgb<u8> = Rgb([255, 255, 0]);
    pub const FAIR: Rgb<u8> = Rgb([255, 165, 0]);
    pub const WEAK: Rgb<u8> = Rgb([255, 0, 0]);

    pub fn for_score(score: Option<f32>) -> Rgb<u8> {
        match score {
            Some(s) if s > 0.9 => Self::STRONG,
            Some(s) if s > 0.8 => Self::GOOD,
            Some(s) if s > 0.7 => Self::FAIR,
            _ => Self::WEAK,
        }
    }
}

/// Outline each rectangle, two pixels thick, coloured by its score.
pub fn annotate_match_rects(image: &mut RgbImage, rects: &[(MatchRect, Option<f32>)]) {
    for (rect, score) in rects {
        if rect.width == 0 || rect.height == 0 {
            continue;
        }
        let colour = DebugColors::for_score(*score);
        draw_hollow_rect_mut(
            image,
            Rect::at(rect.x as i32, rect.y as i32).of_size(rect.width, rect.height),
            colour,
        );
        if rect.width > 2 && rect.height > 2 {
            draw_hollow_rect_mut(
                image,
                Rect::at(rect.x as i32 + 1, rect.y as i32 + 1).of_size(rect.width - 2, rect.height - 2),
                colour,
            );
        }
        log::debug!(
            "Match annotation: ({}, {}) {}x{} score {:?}",
            rect.x,
            rect.y,
            rect.width,
            rect.height,
            score
        );
    }
}

/// Configuration for debug output
#[derive(Debug, Clone, Default)]
pub struct DebugOutputConfig {
    /// Whether debug output should be saved
    pub enabled: bool,
    /// Base directory for saving debug output
    pub output_dir: Option<PathBuf>,
}

impl DebugOutputConfig {
    pub fn in_dir<P: Into<PathBuf>>(dir: P) -> Self {
        Self {
            enabled: true,
            output_dir: Some(dir.into()),
        }
    }
}

/// Save an annotated image under the configured directory. Returns the path
/// written, or `None` when debug output is disabled.
pub fn save_debug_output<P: AsRef<Path>>(
    image: &RgbImage,
    filename: P,
    config: &DebugOutputConfig,
) -> Result<Option<PathBuf>> {
    if !config.enabled {
        return Ok(None);
    }
    let path = match config.output_dir {
        Some(ref dir) => {
            std::fs::create_dir_all(dir)?;
            dir.join(filename.as_ref())
        }
        None => filename.as_ref().to_path_buf(),
    };
    image.save(&path)?;
    log::info!("Debug output saved: {}", path.display());
    Ok(Some(path))
}

/// For every pyramid level, draw where the next frame was found onto the
/// lower-magnification image and save it as `<id>_level<N>.png`.
pub fn save_pyramid_annotations(collection: &Collection, config: &DebugOutputConfig) -> Result<Vec<PathBuf>> {
    let mut written = Vec::new();
    if collection.kind != CollectionKind::Pyramid || !config.enabled {
        return Ok(written);
    }
    for (parent, rect, score) in collection.match_rects() {
        let image = ImageData::from_file(&collection.members[parent].path)?;
        let mut rgb = image_data_to_rgb_image(&image);
        annotate_match_rects(&mut rgb, &[(rect, score)]);
        let filename = format!("{}_level{}.png", collection.id, parent);
        if let Some(path) = save_debug_output(&rgb, filename, config)? {
            written.push(path);
        }
    }
    Ok(written)
}

/// Convert ImageData to RgbImage for visualisation
pub fn image_data_to_rgb_image(image_data: &ImageData) -> RgbImage {
    let mut rgb_image = RgbImage::new(image_data.width, image_data.height);
    for (i, pixel) in rgb_image.pixels_mut().enumerate() {
        let gray_value = (image_data.data[i].clamp(0.0, 1.0) * 255.0) as u8;
        *pixel = Rgb([gray_value, gray_value, gray_value]);
    }
    rgb_image
}
