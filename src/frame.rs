// frame.rs — One admitted camera frame.

use crate::feature::{FrameId, TrackId};
use crate::image::{ColorImage, Image};
use crate::pyramid::Pyramid;

/// A captured frame with everything the tracker derived from it.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Assigned by the database at admission.
    pub id: FrameId,
    pub timestamp: f64,
    /// Raw planes (1 or 3).
    pub image: ColorImage,
    /// Luminance used for tracking.
    pub gray: Image<u8>,
    /// Gradient magnitude image.
    pub gradient: Image<f32>,
    /// Gaussian pyramid of `gray`.
    pub pyramid: Pyramid,
    /// Relative exposure time. 1.0 until estimated.
    pub exposure_time: f64,
    /// Exposure supplied by the caller. The optimizer holds it fixed.
    pub exposure_known: bool,
    /// Features observed in this frame.
    pub features: Vec<TrackId>,
}

impl Frame {
    pub fn new(
        timestamp: f64,
        image: ColorImage,
        gray: Image<u8>,
        gradient: Image<f32>,
        pyramid: Pyramid,
    ) -> Self {
        Frame {
            id: FrameId(0),
            timestamp,
            image,
            gray,
            gradient,
            pyramid,
            exposure_time: 1.0,
            exposure_known: false,
            features: Vec::new(),
        }
    }

    pub fn width(&self) -> usize {
        self.gray.width()
    }

    pub fn height(&self) -> usize {
        self.gray.height()
    }

    /// Copy of the gray frame with a hollow square marker around each
    /// point, for display.
    pub fn overlay(&self, points: &[(f32, f32)], half_size: usize) -> Image<u8> {
        let mut out = self.gray.clone();
        let h = half_size as isize + 1;
        for &(fx, fy) in points {
            let cx = fx.round() as isize;
            let cy = fy.round() as isize;
            for d in -h..=h {
                for (x, y) in [(cx + d, cy - h), (cx + d, cy + h), (cx - h, cy + d), (cx + h, cy + d)] {
                    if out.contains(x, y) {
                        out.set(x as usize, y as usize, 255);
                    }
                }
            }
        }
        out
    }
}
