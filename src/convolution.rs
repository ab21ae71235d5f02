// convolution.rs — Separable 1D convolution with clamp-to-edge borders.
//
// Used for the Gaussian blur between pyramid levels and for the Sobel
// derivatives behind the gradient image. A separable kernel K = k_col * k_row^T
// runs as a horizontal pass followed by a vertical pass.
//
// Out-of-range taps read the nearest edge pixel. Interior pixels, where no
// tap can leave the image, skip the clamp.

use crate::image::{Image, Pixel};

fn check_kernel(kernel: &[f32]) {
    assert!(!kernel.is_empty(), "kernel must not be empty");
    assert!(kernel.len() % 2 == 1, "kernel length must be odd (got {})", kernel.len());
}

/// Clamped tap index along an axis of length `n`.
#[inline]
fn clamp_tap(i: usize, k: usize, half: usize, n: usize) -> usize {
    (i as isize + k as isize - half as isize).clamp(0, n as isize - 1) as usize
}

/// Convolve each row of `src` with a centered 1D kernel.
pub fn convolve_rows<T: Pixel>(src: &Image<T>, kernel: &[f32]) -> Image<f32> {
    check_kernel(kernel);
    let (w, h) = (src.width(), src.height());
    let half = kernel.len() / 2;
    let mut dst = Image::<f32>::new(w, h);

    for y in 0..h {
        for x in 0..w {
            let interior = x >= half && x + half < w;
            let mut acc = 0.0f32;
            for (k, &kv) in kernel.iter().enumerate() {
                let sx = if interior { x + k - half } else { clamp_tap(x, k, half, w) };
                // SAFETY: sx < w by construction (interior bound or clamp), y < h.
                acc += unsafe { src.get_unchecked(sx, y) }.to_f32() * kv;
            }
            // SAFETY: loop bounds.
            unsafe { dst.set_unchecked(x, y, acc) };
        }
    }
    dst
}

/// Convolve each column of `src` with a centered 1D kernel.
pub fn convolve_cols(src: &Image<f32>, kernel: &[f32]) -> Image<f32> {
    check_kernel(kernel);
    let (w, h) = (src.width(), src.height());
    let half = kernel.len() / 2;
    let mut dst = Image::<f32>::new(w, h);

    for y in 0..h {
        let interior = y >= half && y + half < h;
        for x in 0..w {
            let mut acc = 0.0f32;
            for (k, &kv) in kernel.iter().enumerate() {
                let sy = if interior { y + k - half } else { clamp_tap(y, k, half, h) };
                // SAFETY: sy < h by construction, x < w.
                acc += unsafe { src.get_unchecked(x, sy) } * kv;
            }
            unsafe { dst.set_unchecked(x, y, acc) };
        }
    }
    dst
}

/// Horizontal pass with `kernel_row`, then vertical pass with `kernel_col`.
///
/// # Panics
/// Panics if either kernel is empty or has even length.
pub fn convolve_separable<T: Pixel>(
    src: &Image<T>,
    kernel_row: &[f32],
    kernel_col: &[f32],
) -> Image<f32> {
    let intermediate = convolve_rows(src, kernel_row);
    convolve_cols(&intermediate, kernel_col)
}

/// Normalized 1D Gaussian of length `2 * half_size + 1`.
pub fn gaussian_kernel_1d(half_size: usize, sigma: f32) -> Vec<f32> {
    assert!(sigma > 0.0, "sigma must be positive");
    let two_sigma_sq = 2.0 * sigma * sigma;
    let mut kernel: Vec<f32> = (0..=2 * half_size)
        .map(|i| {
            let x = i as f32 - half_size as f32;
            (-x * x / two_sigma_sq).exp()
        })
        .collect();
    let sum: f32 = kernel.iter().sum();
    for v in &mut kernel {
        *v /= sum;
    }
    kernel
}
