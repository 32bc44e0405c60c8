// src/image/loader.rs

use crate::error::{MatchingError, Result};
use image::{DynamicImage, GenericImageView, ImageBuffer};
use std::path::Path;

/// Represents an extreme value (min/max) and its location (value, (x, y))
pub type Extreme = (f32, (u32, u32));

/// Single-channel image with intensities normalised to [0, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct ImageData {
    pub data: Vec<f32>,
    pub width: u32,
    pub height: u32,
}

impl ImageData {
    pub fn new(width: u32, height: u32, data: Vec<f32>) -> Result<Self> {
        if data.len() != width as usize * height as usize {
            return Err(MatchingError::DegenerateImage(format!(
                "{} samples for a {}x{} image",
                data.len(),
                width,
                height
            )));
        }
        Ok(Self { data, width, height })
    }

    /// Load image from file and convert to normalised grayscale
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(MatchingError::MissingImage(path.to_path_buf()));
        }
        let img = image::open(path)?;
        Ok(Self::from_dynamic_image(img))
    }

    /// Convert DynamicImage to normalised grayscale. Microscope frames are
    /// commonly 16-bit, so that depth is kept rather than squashed to 8 bits.
    pub fn from_dynamic_image(img: DynamicImage) -> Self {
        let (width, height) = img.dimensions();

        let data = match img {
            DynamicImage::ImageLuma8(img) => img.pixels().map(|p| p[0] as f32 / 255.0).collect(),
            DynamicImage::ImageLuma16(img) => {
                img.pixels().map(|p| p[0] as f32 / 65535.0).collect()
            }
            DynamicImage::ImageRgb8(img) => img
                .pixels()
                .map(|p| (0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32) / 255.0)
                .collect(),
            DynamicImage::ImageRgba8(img) => img
                .pixels()
                // alpha is ignored
                .map(|p| (0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32) / 255.0)
                .collect(),
            other => {
                return Self::from_dynamic_image(DynamicImage::ImageLuma16(other.to_luma16()));
            }
        };

        Self { data, width, height }
    }

    #[inline]
    pub fn get(&self, x: u32, y: u32) -> f32 {
        self.data[(y * self.width + x) as usize]
    }

    /// Resample by `scale` with area averaging: every output pixel is the
    /// coverage-weighted mean of the source pixels under its footprint.
    pub fn resize_area(&self, scale: f64) -> Result<ImageData> {
        if !scale.is_finite() || scale <= 0.0 {
            return Err(MatchingError::DegenerateImage(format!("invalid resample scale {scale}")));
        }
        if self.width == 0 || self.height == 0 {
            return Err(MatchingError::DegenerateImage("empty image".to_string()));
        }

        let new_width = ((self.width as f64 * scale).round() as u32).max(1);
        let new_height = ((self.height as f64 * scale).round() as u32).max(1);
        if new_width == self.width && new_height == self.height {
            return Ok(self.clone());
        }

        let column_taps = area_taps(self.width, new_width);
        let row_taps = area_taps(self.height, new_height);

        // Horizontal pass
        let mut horizontal = vec![0.0f32; (new_width * self.height) as usize];
        for y in 0..self.height as usize {
            let src_row = &self.data[y * self.width as usize..(y + 1) * self.width as usize];
            let dst_row = &mut horizontal[y * new_width as usize..(y + 1) * new_width as usize];
            for (dst, taps) in dst_row.iter_mut().zip(&column_taps) {
                *dst = taps.iter().map(|&(i, w)| src_row[i] * w).sum();
            }
        }

        // Vertical pass
        let mut resized = vec![0.0f32; (new_width * new_height) as usize];
        for (ny, taps) in row_taps.iter().enumerate() {
            for nx in 0..new_width as usize {
                resized[ny * new_width as usize + nx] = taps
                    .iter()
                    .map(|&(i, w)| horizontal[i * new_width as usize + nx] * w)
                    .sum();
            }
        }

        ImageData::new(new_width, new_height, resized)
    }

    /// Finds the largest and smallest values in an image and their locations.
    /// If there are multiple such values then the first in row-major order is returned.
    pub fn find_extremes(&self) -> (Extreme, Extreme) {
        let mut max_val = f32::NEG_INFINITY;
        let mut min_val = f32::INFINITY;
        let mut max_pos = (0u32, 0u32);
        let mut min_pos = (0u32, 0u32);

        for (i, &value) in self.data.iter().enumerate() {
            let y = (i as u32) / self.width;
            let x = (i as u32) % self.width;

            if value > max_val {
                max_val = value;
                max_pos = (x, y);
            }
            if value < min_val {
                min_val = value;
                min_pos = (x, y);
            }
        }

        ((max_val, max_pos), (min_val, min_pos))
    }

    /// Zero-mean normalised cross-correlation of `template` at every offset
    /// where it fits entirely inside `self`, computed by sliding window.
    /// Flat windows score 0.
    pub fn normalized_cross_correlation(&self, template: &ImageData) -> Result<ImageData> {
        check_template_fits(self, template)?;

        let out_width = self.width - template.width + 1;
        let out_height = self.height - template.height + 1;
        let mut result_data = vec![0.0f32; (out_width * out_height) as usize];

        for ty in 0..out_height {
            for tx in 0..out_width {
                result_data[(ty * out_width + tx) as usize] = self.ncc_at(tx, ty, template);
            }
        }

        ImageData::new(out_width, out_height, result_data)
    }

    fn ncc_at(&self, x: u32, y: u32, template: &ImageData) -> f32 {
        let mut img_sum = 0.0f64;
        let mut templ_sum = 0.0f64;
        let mut img_sum_sq = 0.0f64;
        let mut templ_sum_sq = 0.0f64;
        let mut prod_sum = 0.0f64;

        for ty in 0..template.height {
            for tx in 0..template.width {
                let img_val = self.get(x + tx, y + ty) as f64;
                let templ_val = template.get(tx, ty) as f64;

                img_sum += img_val;
                templ_sum += templ_val;
                img_sum_sq += img_val * img_val;
                templ_sum_sq += templ_val * templ_val;
                prod_sum += img_val * templ_val;
            }
        }

        let n = (template.width * template.height) as f64;
        let img_mean = img_sum / n;
        let templ_mean = templ_sum / n;

        let img_var = img_sum_sq / n - img_mean * img_mean;
        let templ_var = templ_sum_sq / n - templ_mean * templ_mean;

        let numerator = prod_sum / n - img_mean * templ_mean;
        let denominator = (img_var * templ_var).max(0.0).sqrt();

        if denominator > 1e-9 {
            (numerator / denominator).clamp(-1.0, 1.0) as f32
        } else {
            0.0
        }
    }

    /// Save processed image to file (for debugging)
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut img_buffer = ImageBuffer::new(self.width, self.height);

        for (x, y, pixel) in img_buffer.enumerate_pixels_mut() {
            let intensity = self.get(x, y);
            let byte_val = (intensity * 255.0).round().clamp(0.0, 255.0) as u8;
            *pixel = image::Luma([byte_val]);
        }

        img_buffer.save(path)?;
        Ok(())
    }
}

pub(crate) fn check_template_fits(target: &ImageData, template: &ImageData) -> Result<()> {
    if template.width == 0 || template.height == 0 {
        return Err(MatchingError::DegenerateImage("empty template".to_string()));
    }
    if template.width > target.width || template.height > target.height {
        return Err(MatchingError::TemplateTooLarge {
            template_width: template.width,
            template_height: template.height,
            target_width: target.width,
            target_height: target.height,
        });
    }
    Ok(())
}

/// For each destination index, the source indices it covers and their
/// normalised coverage weights.
fn area_taps(src_len: u32, dst_len: u32) -> Vec<Vec<(usize, f32)>> {
    let ratio = src_len as f64 / dst_len as f64;
    (0..dst_len)
        .map(|d| {
            let start = d as f64 * ratio;
            let end = ((d + 1) as f64 * ratio).min(src_len as f64);
            let mut taps = Vec::new();
            let mut s = start.floor() as usize;
            while (s as f64) < end && s < src_len as usize {
                let overlap = end.min(s as f64 + 1.0) - start.max(s as f64);
                if overlap > 0.0 {
                    taps.push((s, overlap));
                }
                s += 1;
            }
            let total: f64 = taps.iter().map(|&(_, w)| w).sum();
            taps.into_iter()
                .map(|(i, w)| (i, (w / total) as f32))
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(width: u32, height: u32) -> ImageData {
        let data = (0..width * height)
            .map(|i| ((i % width) + 2 * (i / width)) as f32 / (3 * (width + height)) as f32)
            .collect();
        ImageData::new(width, height, data).unwrap()
    }

    #[test]
    fn new_rejects_mismatched_buffers() {
        assert!(ImageData::new(4, 4, vec![0.0; 15]).is_err());
    }

    #[test]
    fn integer_downsample_averages_blocks() {
        let img = ImageData::new(4, 2, vec![0.0, 1.0, 0.5, 0.5, 1.0, 0.0, 0.5, 0.5]).unwrap();
        let half = img.resize_area(0.5).unwrap();
        assert_eq!((half.width, half.height), (2, 1));
        assert_eq!(half.data, vec![0.5, 0.5]);
    }

    #[test]
    fn fractional_resample_preserves_mean() {
        let img = ramp(30, 20);
        let small = img.resize_area(0.37).unwrap();
        let mean = |d: &ImageData| d.data.iter().sum::<f32>() / d.data.len() as f32;
        assert!((mean(&img) - mean(&small)).abs() < 0.02);

        let upsampled = img.resize_area(1.5).unwrap();
        assert_eq!((upsampled.width, upsampled.height), (45, 30));
    }

    #[test]
    fn resample_rejects_bad_scale() {
        let img = ramp(8, 8);
        assert!(img.resize_area(0.0).is_err());
        assert!(img.resize_area(f64::NAN).is_err());
    }

    #[test]
    fn extremes_prefer_first_in_row_major_order() {
        let img = ImageData::new(3, 2, vec![0.1, 0.9, 0.2, 0.9, 0.0, 0.0]).unwrap();
        let ((max_val, max_pos), (min_val, min_pos)) = img.find_extremes();
        assert_eq!((max_val, max_pos), (0.9, (1, 0)));
        assert_eq!((min_val, min_pos), (0.0, (1, 1)));
    }

    #[test]
    fn direct_ncc_peaks_at_exact_crop() {
        let img = ImageData::new(
            5,
            4,
            vec![
                0.1, 0.7, 0.3, 0.9, 0.2, //
                0.8, 0.4, 0.6, 0.1, 0.5, //
                0.3, 0.9, 0.2, 0.7, 0.4, //
                0.6, 0.1, 0.8, 0.3, 0.9,
            ],
        )
        .unwrap();
        let template = ImageData::new(2, 2, vec![0.6, 0.1, 0.2, 0.7]).unwrap();
        let scores = img.normalized_cross_correlation(&template).unwrap();
        assert_eq!((scores.width, scores.height), (4, 3));
        let ((best, pos), _) = scores.find_extremes();
        assert_eq!(pos, (2, 1));
        assert!((best - 1.0).abs() < 1e-5);
    }

    #[test]
    fn flat_template_scores_zero() {
        let img = ramp(6, 6);
        let flat = ImageData::new(2, 2, vec![0.5; 4]).unwrap();
        let scores = img.normalized_cross_correlation(&flat).unwrap();
        assert!(scores.data.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn oversized_template_is_an_error() {
        let img = ramp(4, 4);
        let template = ramp(5, 2);
        assert!(matches!(
            img.normalized_cross_correlation(&template),
            Err(MatchingError::TemplateTooLarge { .. })
        ));
    }

    #[test]
    fn missing_file_is_reported() {
        let err = ImageData::from_file("/definitely/not/here.png").unwrap_err();
        assert!(matches!(err, MatchingError::MissingImage(_)));
    }
}
