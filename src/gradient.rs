// gradient.rs — Sobel derivatives and the gradient-magnitude image.
//
// The gradient image scores extraction candidates and gates tracking:
// a patch with too little texture cannot be localized reliably, so the
// tracker refuses to start or keep a feature there.
//
// For colour frames the magnitude is taken per plane and the largest
// value wins, so an edge visible in only one channel still counts.

use crate::convolution::convolve_separable;
use crate::image::{ColorImage, Image, Pixel};

const SOBEL_DERIV: [f32; 3] = [-1.0, 0.0, 1.0];
const SOBEL_SMOOTH: [f32; 3] = [1.0, 2.0, 1.0];

/// Sobel normalization so a unit ramp gives a unit derivative.
const SOBEL_NORM: f32 = 1.0 / 8.0;

/// Horizontal derivative Ix (unnormalized Sobel).
pub fn sobel_x<T: Pixel>(src: &Image<T>) -> Image<f32> {
    convolve_separable(src, &SOBEL_DERIV, &SOBEL_SMOOTH)
}

/// Vertical derivative Iy (unnormalized Sobel).
pub fn sobel_y<T: Pixel>(src: &Image<T>) -> Image<f32> {
    convolve_separable(src, &SOBEL_SMOOTH, &SOBEL_DERIV)
}

/// Gradient magnitude `sqrt(Ix² + Iy²)` in grey levels per pixel.
pub fn gradient_magnitude<T: Pixel>(src: &Image<T>) -> Image<f32> {
    let ix = sobel_x(src);
    let iy = sobel_y(src);
    Image::from_fn(src.width(), src.height(), |x, y| {
        let gx = ix.get(x, y) * SOBEL_NORM;
        let gy = iy.get(x, y) * SOBEL_NORM;
        (gx * gx + gy * gy).sqrt()
    })
}

/// Per-pixel maximum of the plane gradient magnitudes.
pub fn gradient_image(src: &ColorImage) -> Image<f32> {
    let mut out = gradient_magnitude(src.plane(0));
    for plane in &src.planes()[1..] {
        let g = gradient_magnitude(plane);
        for (o, &v) in out.as_mut_slice().iter_mut().zip(g.as_slice()) {
            *o = o.max(v);
        }
    }
    out
}
