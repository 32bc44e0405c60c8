// src/image/matcher.rs

use crate::error::{MatchingError, Result};
use crate::image::fft::normalized_cross_correlation_fft;
use crate::image::loader::{check_template_fits, ImageData};
use crate::micrograph::Micrograph;
use crate::pyramid::FrameLocator;
use log::debug;
use std::borrow::Cow;
use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// Multiply-adds above which the Fourier path is used.
const DIRECT_WORK_LIMIT: u64 = 1 << 21;

/// Templates smaller than this on either side carry no usable structure.
pub const MIN_TEMPLATE_SIDE: u32 = 4;

/// Best placement of a template inside a target, in target pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemplateMatch {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub correlation: f32,
}

/// Zero-mean NCC map, picking the sliding-window or Fourier implementation by
/// problem size. Both produce the same scores.
pub fn normalized_cross_correlation(image: &ImageData, template: &ImageData) -> Result<ImageData> {
    check_template_fits(image, template)?;
    let positions = (image.width - template.width + 1) as u64 * (image.height - template.height + 1) as u64;
    let work = positions * template.width as u64 * template.height as u64;
    if work <= DIRECT_WORK_LIMIT {
        image.normalized_cross_correlation(template)
    } else {
        normalized_cross_correlation_fft(image, template)
    }
}

/// Locates a template in a target, downsampling both to a bounded working
/// width first and mapping the result back to full resolution.
#[derive(Debug, Clone)]
pub struct TemplateMatcher {
    max_working_width: u32,
}

impl Default for TemplateMatcher {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl TemplateMatcher {
    pub fn new(max_working_width: u32) -> Self {
        Self {
            max_working_width: max_working_width.max(1),
        }
    }

    pub fn max_working_width(&self) -> u32 {
        self.max_working_width
    }

    pub fn match_template(&self, target: &ImageData, template: &ImageData) -> Result<TemplateMatch> {
        check_template_fits(target, template)?;

        let factor = if target.width > self.max_working_width {
            self.max_working_width as f64 / target.width as f64
        } else {
            1.0
        };
        let (work_target, work_template) = if factor < 1.0 {
            (
                Cow::Owned(target.resize_area(factor)?),
                Cow::Owned(template.resize_area(factor)?),
            )
        } else {
            (Cow::Borrowed(target), Cow::Borrowed(template))
        };

        if work_template.width < MIN_TEMPLATE_SIDE || work_template.height < MIN_TEMPLATE_SIDE {
            return Err(MatchingError::DegenerateImage(format!(
                "template is {}x{} at working resolution",
                work_template.width, work_template.height
            )));
        }

        debug!(
            "Correlating {}x{} template in {}x{} target (working factor {:.3})",
            work_template.width, work_template.height, work_target.width, work_target.height, factor
        );
        let scores = normalized_cross_correlation(&work_target, &work_template)?;
        let ((correlation, (x, y)), _) = scores.find_extremes();

        let x = ((x as f64 / factor).round() as u32).min(target.width - template.width);
        let y = ((y as f64 / factor).round() as u32).min(target.height - template.height);

        Ok(TemplateMatch {
            x,
            y,
            width: template.width,
            height: template.height,
            correlation,
        })
    }
}

/// Reads both micrographs from disk and correlates the rescaled
/// high-magnification frame against the low-magnification one.
///
/// The most recently decoded target is kept, since chain building compares
/// one head against many candidates in a row.
#[derive(Debug, Default)]
pub struct FileFrameLocator {
    matcher: TemplateMatcher,
    last_target: RefCell<Option<(PathBuf, Rc<ImageData>)>>,
}

impl FileFrameLocator {
    pub fn new(matcher: TemplateMatcher) -> Self {
        Self {
            matcher,
            last_target: RefCell::new(None),
        }
    }

    fn load_target(&self, path: &Path) -> Result<Rc<ImageData>> {
        if let Some((cached, image)) = self.last_target.borrow().as_ref() {
            if cached == path {
                return Ok(Rc::clone(image));
            }
        }
        let image = Rc::new(ImageData::from_file(path)?);
        *self.last_target.borrow_mut() = Some((path.to_path_buf(), Rc::clone(&image)));
        Ok(image)
    }
}

impl FrameLocator for FileFrameLocator {
    fn locate(
        &self,
        parent: &Micrograph<'_>,
        child: &Micrograph<'_>,
        fov_ratio: f64,
    ) -> Result<TemplateMatch> {
        let target = self.load_target(parent.path())?;
        let high = ImageData::from_file(child.path())?;

        let scale = fov_ratio * target.width as f64 / high.width as f64;
        debug!(
            "{} -> {}: field-of-view ratio {:.4}, template scale {:.4}",
            parent.path().display(),
            child.path().display(),
            fov_ratio,
            scale
        );
        let template = high.resize_area(scale)?;
        self.matcher.match_template(&target, &template)
    }
}
