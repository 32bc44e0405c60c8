// src/image/fft.rs

//! Fourier-domain normalised cross-correlation.
//!
//! The numerator of the zero-mean NCC is a plain cross-correlation of the
//! target with the mean-subtracted template, computed as
//! `IFFT(F(target) * conj(F(template')))` with the template zero-padded to the
//! target size. The per-window target energy in the denominator comes from
//! summed-area tables, so the whole map costs O(N log N) rather than O(N * M).

use crate::error::Result;
use crate::image::loader::{check_template_fits, ImageData};
use rustfft::{num_complex::Complex, FftDirection, FftPlanner};

/// Windows whose combined energy is below this are treated as flat.
const FLAT_ENERGY_EPSILON: f64 = 1e-9;

/// Row-column 2D FFT, in place. The inverse is unnormalised, as in rustfft.
fn fft_2d(
    planner: &mut FftPlanner<f64>,
    data: &mut [Complex<f64>],
    width: usize,
    height: usize,
    direction: FftDirection,
) {
    let row_fft = planner.plan_fft(width, direction);
    for row in data.chunks_exact_mut(width) {
        row_fft.process(row);
    }

    // Transpose for vertical processing
    let mut transposed = vec![Complex::new(0.0, 0.0); width * height];
    for y in 0..height {
        for x in 0..width {
            transposed[x * height + y] = data[y * width + x];
        }
    }

    let column_fft = planner.plan_fft(height, direction);
    for column in transposed.chunks_exact_mut(height) {
        column_fft.process(column);
    }

    // Transpose back
    for x in 0..width {
        for y in 0..height {
            data[y * width + x] = transposed[x * height + y];
        }
    }
}

/// Circular cross-correlation of `image` with a `kernel_width` x
/// `kernel_height` kernel anchored at the origin. The result has the image's
/// size; entry (u, v) is `sum image[x + u, y + v] * kernel[x, y]`.
pub fn cross_correlate(
    image: &ImageData,
    kernel: &[f64],
    kernel_width: usize,
    kernel_height: usize,
) -> Vec<f64> {
    let width = image.width as usize;
    let height = image.height as usize;
    let mut planner = FftPlanner::new();

    let mut image_spectrum: Vec<Complex<f64>> = image
        .data
        .iter()
        .map(|&v| Complex::new(v as f64, 0.0))
        .collect();
    fft_2d(&mut planner, &mut image_spectrum, width, height, FftDirection::Forward);

    let mut kernel_spectrum = vec![Complex::new(0.0, 0.0); width * height];
    for ky in 0..kernel_height {
        for kx in 0..kernel_width {
            kernel_spectrum[ky * width + kx] = Complex::new(kernel[ky * kernel_width + kx], 0.0);
        }
    }
    fft_2d(&mut planner, &mut kernel_spectrum, width, height, FftDirection::Forward);

    for (i, k) in image_spectrum.iter_mut().zip(&kernel_spectrum) {
        *i *= k.conj();
    }
    fft_2d(&mut planner, &mut image_spectrum, width, height, FftDirection::Inverse);

    let normalisation = (width * height) as f64;
    image_spectrum.iter().map(|c| c.re / normalisation).collect()
}

/// Inclusive prefix sums with a zero guard row and column.
struct SummedAreaTable {
    stride: usize,
    values: Vec<f64>,
}

impl SummedAreaTable {
    fn new(image: &ImageData, map: impl Fn(f64) -> f64) -> Self {
        let width = image.width as usize;
        let height = image.height as usize;
        let stride = width + 1;
        let mut values = vec![0.0f64; stride * (height + 1)];
        for y in 0..height {
            let mut row_sum = 0.0;
            for x in 0..width {
                row_sum += map(image.data[y * width + x] as f64);
                values[(y + 1) * stride + x + 1] = values[y * stride + x + 1] + row_sum;
            }
        }
        Self { stride, values }
    }

    fn window_sum(&self, x: usize, y: usize, width: usize, height: usize) -> f64 {
        let at = |xx: usize, yy: usize| self.values[yy * self.stride + xx];
        at(x + width, y + height) - at(x, y + height) - at(x + width, y) + at(x, y)
    }
}

/// Zero-mean normalised cross-correlation map, same layout and semantics as
/// [`ImageData::normalized_cross_correlation`].
pub fn normalized_cross_correlation_fft(
    image: &ImageData,
    template: &ImageData,
) -> Result<ImageData> {
    check_template_fits(image, template)?;

    let tw = template.width as usize;
    let th = template.height as usize;
    let n = (tw * th) as f64;

    let template_mean = template.data.iter().map(|&v| v as f64).sum::<f64>() / n;
    let centred: Vec<f64> = template
        .data
        .iter()
        .map(|&v| v as f64 - template_mean)
        .collect();
    let template_energy: f64 = centred.iter().map(|v| v * v).sum();

    let numerators = cross_correlate(image, &centred, tw, th);
    let sums = SummedAreaTable::new(image, |v| v);
    let squares = SummedAreaTable::new(image, |v| v * v);

    let width = image.width as usize;
    let out_width = image.width - template.width + 1;
    let out_height = image.height - template.height + 1;
    let mut scores = Vec::with_capacity((out_width * out_height) as usize);

    for y in 0..out_height as usize {
        for x in 0..out_width as usize {
            let sum = sums.window_sum(x, y, tw, th);
            let window_energy = (squares.window_sum(x, y, tw, th) - sum * sum / n).max(0.0);
            let denominator = (window_energy * template_energy).sqrt();
            let score = if denominator > FLAT_ENERGY_EPSILON * n {
                (numerators[y * width + x] / denominator).clamp(-1.0, 1.0)
            } else {
                0.0
            };
            scores.push(score as f32);
        }
    }

    ImageData::new(out_width, out_height, scores)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noise(width: u32, height: u32, seed: u64) -> ImageData {
        let mut state = seed;
        let data = (0..width * height)
            .map(|_| {
                state = state
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                (state >> 40) as f32 / (1u64 << 24) as f32
            })
            .collect();
        ImageData::new(width, height, data).unwrap()
    }

    fn crop(image: &ImageData, x: u32, y: u32, width: u32, height: u32) -> ImageData {
        let data = (0..height)
            .flat_map(|ty| (0..width).map(move |tx| (tx, ty)))
            .map(|(tx, ty)| image.get(x + tx, y + ty))
            .collect();
        ImageData::new(width, height, data).unwrap()
    }

    #[test]
    fn cross_correlation_matches_direct_sum() {
        let image = noise(7, 5, 3);
        let kernel = [1.0, -2.0, 0.5, 3.0];
        let result = cross_correlate(&image, &kernel, 2, 2);
        for v in 0..4u32 {
            for u in 0..6u32 {
                let expected = image.get(u, v) as f64 * 1.0
                    + image.get(u + 1, v) as f64 * -2.0
                    + image.get(u, v + 1) as f64 * 0.5
                    + image.get(u + 1, v + 1) as f64 * 3.0;
                let got = result[(v * 7 + u) as usize];
                assert!((expected - got).abs() < 1e-9, "({u}, {v}): {expected} vs {got}");
            }
        }
    }

    #[test]
    fn fft_and_direct_maps_agree() {
        let image = noise(40, 30, 11);
        let template = noise(9, 7, 5);
        let direct = image.normalized_cross_correlation(&template).unwrap();
        let fast = normalized_cross_correlation_fft(&image, &template).unwrap();
        assert_eq!((direct.width, direct.height), (fast.width, fast.height));
        for (a, b) in direct.data.iter().zip(&fast.data) {
            assert!((a - b).abs() < 1e-4, "{a} vs {b}");
        }
    }

    #[test]
    fn exact_crop_is_found() {
        let image = noise(48, 36, 17);
        let template = crop(&image, 21, 9, 12, 10);
        let scores = normalized_cross_correlation_fft(&image, &template).unwrap();
        let ((best, pos), _) = scores.find_extremes();
        assert_eq!(pos, (21, 9));
        assert!(best > 0.999);
    }

    #[test]
    fn flat_target_scores_zero() {
        let image = ImageData::new(16, 16, vec![0.25; 256]).unwrap();
        let template = noise(4, 4, 2);
        let scores = normalized_cross_correlation_fft(&image, &template).unwrap();
        assert!(scores.data.iter().all(|&s| s == 0.0));
    }
}
