// convert.rs — Colour and pixel-type conversions.
//
// Tracking runs on a single luminance plane; the photometric model keeps
// one response curve per colour plane. This module bridges the two.

use crate::image::{ColorImage, Image, Pixel};

/// ITU-R BT.601 luma weights for R, G, B.
pub const LUMA_WEIGHTS: [f32; 3] = [0.299, 0.587, 0.114];

/// Luminance plane of a frame. Grayscale frames are returned as-is.
pub fn to_gray(src: &ColorImage) -> Image<u8> {
    if src.channels() == 1 {
        return src.plane(0).clone();
    }
    let (r, g, b) = (src.plane(0), src.plane(1), src.plane(2));
    Image::from_fn(src.width(), src.height(), |x, y| {
        let v = LUMA_WEIGHTS[0] * r.get(x, y) as f32
            + LUMA_WEIGHTS[1] * g.get(x, y) as f32
            + LUMA_WEIGHTS[2] * b.get(x, y) as f32;
        u8::from_f32(v)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gray_passthrough() {
        let plane = Image::from_vec(2, 1, vec![7u8, 9]);
        let gray = to_gray(&ColorImage::gray(plane.clone()));
        assert_eq!(gray, plane);
    }

    #[test]
    fn test_rgb_to_gray() {
        let img = ColorImage::from_interleaved(2, 1, 3, &[255, 255, 255, 255, 0, 0]).unwrap();
        let gray = to_gray(&img);
        assert_eq!(gray.get(0, 0), 255);
        assert_eq!(gray.get(1, 0), 76); // 0.299 * 255
    }
}
