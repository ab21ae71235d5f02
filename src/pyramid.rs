// pyramid.rs — Gaussian image pyramid.
//
// Level 0 is the input converted to f32. Each further level blurs the
// previous one and keeps every other pixel, halving both dimensions.
// The tracker searches coarse-to-fine through these levels, and patch
// samples are stored for every level of a feature observation.

use crate::convolution::{convolve_separable, gaussian_kernel_1d};
use crate::error::ImageError;
use crate::image::{Image, Pixel};

/// Smallest side length allowed for the coarsest level.
pub const MIN_LEVEL_SIZE: usize = 8;

/// A Gaussian image pyramid, finest level first.
#[derive(Debug, Clone)]
pub struct Pyramid {
    pub levels: Vec<Image<f32>>,
}

impl Pyramid {
    /// Build a pyramid with `num_levels` levels.
    ///
    /// # Panics
    /// Panics if `num_levels == 0`. Use [`Pyramid::try_build`] for input
    /// that has not been validated.
    pub fn build<T: Pixel>(src: &Image<T>, num_levels: usize, sigma: f32) -> Self {
        assert!(num_levels >= 1, "pyramid must have at least 1 level");

        let half_size = (3.0 * sigma).ceil().max(1.0) as usize;
        let kernel = gaussian_kernel_1d(half_size, sigma);

        let mut levels = Vec::with_capacity(num_levels);
        levels.push(src.map(|v| v.to_f32()));
        for l in 1..num_levels {
            let blurred = convolve_separable(&levels[l - 1], &kernel, &kernel);
            levels.push(downsample_2x(&blurred));
        }
        Pyramid { levels }
    }

    /// Validate dimensions, then build.
    ///
    /// Fails when the image is empty or the coarsest level would be
    /// smaller than [`MIN_LEVEL_SIZE`] on either side.
    pub fn try_build<T: Pixel>(
        src: &Image<T>,
        num_levels: usize,
        sigma: f32,
    ) -> Result<Self, ImageError> {
        check_pyramid_size(src.width(), src.height(), num_levels)?;
        Ok(Self::build(src, num_levels, sigma))
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn level(&self, level: usize) -> &Image<f32> {
        &self.levels[level]
    }

    /// Scale factor from level-0 coordinates to `level` coordinates.
    #[inline]
    pub fn scale(level: usize) -> f32 {
        1.0 / (1u32 << level) as f32
    }
}

/// Check that a `width`×`height` image supports `num_levels` levels.
pub fn check_pyramid_size(width: usize, height: usize, num_levels: usize) -> Result<(), ImageError> {
    if width == 0 || height == 0 {
        return Err(ImageError::Empty { width, height });
    }
    let shift = num_levels.saturating_sub(1);
    let too_small = num_levels == 0
        || shift >= usize::BITS as usize
        || (width >> shift) < MIN_LEVEL_SIZE
        || (height >> shift) < MIN_LEVEL_SIZE;
    if too_small {
        return Err(ImageError::TooSmallForPyramid {
            width,
            height,
            levels: num_levels,
        });
    }
    Ok(())
}

/// Keep every other pixel: `dst(x, y) = src(2x, 2y)`. Odd sizes drop the
/// last row/column.
fn downsample_2x(src: &Image<f32>) -> Image<f32> {
    Image::from_fn(src.width() / 2, src.height() / 2, |x, y| {
        // SAFETY: 2x < width and 2y < height for x < width/2, y < height/2.
        unsafe { src.get_unchecked(x * 2, y * 2) }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downsample_dimensions() {
        let down = downsample_2x(&Image::<f32>::new(7, 5));
        assert_eq!((down.width(), down.height()), (3, 2));
    }

    #[test]
    fn test_downsample_preserves_even_pixels() {
        let mut img = Image::<f32>::new(4, 4);
        img.set(2, 0, 2.0);
        img.set(0, 2, 3.0);
        let down = downsample_2x(&img);
        assert!((down.get(1, 0) - 2.0).abs() < 1e-6);
        assert!((down.get(0, 1) - 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_pyramid_level_dimensions() {
        let img: Image<u8> = Image::new(640, 480);
        let pyr = Pyramid::build(&img, 3, 1.0);
        assert_eq!(pyr.num_levels(), 3);
        assert_eq!((pyr.level(1).width(), pyr.level(1).height()), (320, 240));
        assert_eq!((pyr.level(2).width(), pyr.level(2).height()), (160, 120));
    }

    #[test]
    fn test_pyramid_constant_image() {
        let img = Image::from_vec(64, 64, vec![128u8; 64 * 64]);
        let pyr = Pyramid::build(&img, 4, 1.0);
        for (lvl, level) in pyr.levels.iter().enumerate() {
            for (x, y, v) in level.pixels() {
                assert!((v - 128.0).abs() < 0.5, "level {lvl} ({x},{y}) = {v}");
            }
        }
    }

    #[test]
    fn test_try_build_rejects_small_and_empty() {
        let empty: Image<u8> = Image::new(0, 10);
        assert_eq!(
            Pyramid::try_build(&empty, 3, 1.0).unwrap_err(),
            ImageError::Empty { width: 0, height: 10 }
        );
        let small: Image<u8> = Image::new(20, 20);
        assert!(matches!(
            Pyramid::try_build(&small, 3, 1.0),
            Err(ImageError::TooSmallForPyramid { levels: 3, .. })
        ));
        assert!(Pyramid::try_build(&small, 2, 1.0).is_ok());
    }

    #[test]
    fn test_scale() {
        assert_eq!(Pyramid::scale(0), 1.0);
        assert_eq!(Pyramid::scale(2), 0.25);
    }

    #[test]
    #[should_panic(expected = "at least 1")]
    fn test_pyramid_zero_levels_panics() {
        let img: Image<u8> = Image::new(10, 10);
        Pyramid::build(&img, 0, 1.0);
    }
}
