// vignette.rs — Radial polynomial vignetting.
//
//     V(r) = 1 + v1·r² + v2·r⁴ + v3·r⁶
//
// r is the distance from the image centre divided by the half diagonal,
// so r = 1 at the corners. V(0) = 1 removes the scale ambiguity against
// exposure; a physical vignette stays positive and does not exceed 1
// anywhere on [0, 1].

/// Number of vignette coefficients.
pub const NUM_VIGNETTE_PARAMS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct VignetteModel {
    pub coefficients: [f64; NUM_VIGNETTE_PARAMS],
}

impl VignetteModel {
    /// No attenuation.
    pub fn identity() -> Self {
        Self::default()
    }

    pub fn new(coefficients: [f64; NUM_VIGNETTE_PARAMS]) -> Self {
        VignetteModel { coefficients }
    }

    /// Normalized radius of pixel (x, y) in a `width`×`height` image.
    #[inline]
    pub fn radius(x: f64, y: f64, width: usize, height: usize) -> f64 {
        let cx = (width as f64 - 1.0) * 0.5;
        let cy = (height as f64 - 1.0) * 0.5;
        let half_diag = (cx * cx + cy * cy).sqrt().max(f64::EPSILON);
        let dx = x - cx;
        let dy = y - cy;
        (dx * dx + dy * dy).sqrt() / half_diag
    }

    /// V at normalized radius `r`.
    #[inline]
    pub fn at_radius(&self, r: f64) -> f64 {
        let r2 = r * r;
        let [v1, v2, v3] = self.coefficients;
        1.0 + r2 * (v1 + r2 * (v2 + r2 * v3))
    }

    /// Partial derivatives ∂V/∂v_k at radius `r`: (r², r⁴, r⁶).
    #[inline]
    pub fn gradient_at_radius(r: f64) -> [f64; NUM_VIGNETTE_PARAMS] {
        let r2 = r * r;
        [r2, r2 * r2, r2 * r2 * r2]
    }

    /// V at pixel (x, y).
    pub fn attenuation(&self, x: f64, y: f64, width: usize, height: usize) -> f64 {
        self.at_radius(Self::radius(x, y, width, height))
    }

    /// Positive and at most 1 (within tolerance) on a radius sweep.
    pub fn is_physical(&self) -> bool {
        (0..=100).all(|i| {
            let v = self.at_radius(i as f64 / 100.0);
            v > 0.0 && v <= 1.0 + 1e-6
        })
    }
}
