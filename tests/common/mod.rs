#![allow(dead_code)]

use image::GrayImage;
use micrograph_matching::ImageRecord;
use std::path::Path;

/// Deterministic uniform noise, so every window is distinctive.
pub fn noise_image(width: u32, height: u32, seed: u64) -> GrayImage {
    let mut state = seed.wrapping_mul(2862933555777941757).wrapping_add(3037000493);
    GrayImage::from_fn(width, height, |_, _| {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        image::Luma([(state >> 56) as u8])
    })
}

/// Crops a region and enlarges it by pixel replication, imitating a
/// higher-magnification frame of that region.
pub fn zoom_into(image: &GrayImage, x: u32, y: u32, size: u32, factor: u32) -> GrayImage {
    GrayImage::from_fn(size * factor, size * factor, |px, py| {
        *image.get_pixel(x + px / factor, y + py / factor)
    })
}

/// A complete, valid record for a square frame.
pub fn sem_record(path: &Path, detector: &str, fov_um: f64, x_um: f64, y_um: f64) -> ImageRecord {
    ImageRecord {
        detector: Some(detector.to_string()),
        high_voltage_kv: Some(15.0),
        working_distance_mm: Some(8.5),
        pixel_width: Some(256),
        pixel_height: Some(256),
        fov_width_um: Some(fov_um),
        fov_height_um: Some(fov_um),
        stage_x_um: Some(x_um),
        stage_y_um: Some(y_um),
        ..ImageRecord::new(path)
    }
}
