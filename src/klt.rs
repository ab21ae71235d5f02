// klt.rs — Gain-robust pyramidal Lucas-Kanade feature propagation.
//
// Forward-additive LK: gradients are evaluated at the warped position in
// the current frame every iteration, so the normal equations are rebuilt
// each time. The search runs coarse-to-fine; the displacement found at
// level l seeds level l-1 after doubling.
//
// Plain brightness constancy breaks as soon as the exposure changes,
// which is exactly what this pipeline has to observe. The patch gain is
// therefore a third unknown next to the displacement:
//
//     min over (d, a) of  Σ (I(p + d) − a·T(p))²
//
// Gain and displacement are solved together in one 3×3 system per
// iteration. Fitting the gain first and the shift second stalls with a
// bias of a few tenths of a pixel.
//
// Every level only uses samples whose whole footprint (patch, central
// difference and bilinear neighbour) lies inside that level. A coarse
// level where the footprint does not fit is skipped; at level 0 the
// feature is out of bounds.
//
// The template is not re-read from the previous pyramid. It is the
// `PatchSamples::levels` stored with the feature's last observation, so
// the tracker only needs the current pyramid.

use nalgebra::{Matrix3, Vector3};

use crate::feature::PatchSamples;
use crate::image::{interpolate_bilinear, Image};
use crate::pyramid::Pyramid;

/// Pixels a patch centre must keep from the border of a level: the patch
/// half-size, one for the central difference and one for the bilinear
/// neighbour.
pub fn border_margin(half_size: usize) -> usize {
    half_size + 2
}

/// True if the footprint around (x, y) lies inside `img`.
fn footprint_fits(img: &Image<f32>, x: f32, y: f32, margin: f32) -> bool {
    x - margin >= 0.0
        && y - margin >= 0.0
        && x + margin <= (img.width() - 1) as f32
        && y + margin <= (img.height() - 1) as f32
}

/// Outcome of propagating one feature into a new frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackStatus {
    /// Successfully tracked to a new position.
    Tracked,
    /// The normal equations were singular (no texture in the patch).
    Lost,
    /// The finest level did not converge within the iteration cap.
    NotConverged,
    /// The patch no longer fits inside the image.
    OutOfBounds,
    /// Gain-compensated appearance residual too large (occlusion, drift).
    HighResidual,
    /// Patch texture too weak to keep following.
    LowGradient,
    /// Centre intensity clipped in at least one channel.
    Saturated,
}

impl TrackStatus {
    pub fn is_tracked(self) -> bool {
        self == TrackStatus::Tracked
    }
}

/// Result of one propagation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackResult {
    /// New level-0 position. Unreliable unless `status` is `Tracked`.
    pub x: f32,
    pub y: f32,
    pub status: TrackStatus,
    /// Fitted patch gain (current / template) at level 0.
    pub gain: f32,
    /// RMS of the gain-compensated residual at level 0, in grey levels.
    pub residual: f32,
}

enum LkResult {
    Converged(f32, f32),
    MaxIter(f32, f32),
    Singular,
    /// The estimate walked out of the level.
    Outside,
}

/// Pyramidal gain-robust KLT.
#[derive(Debug, Clone)]
pub struct KltTracker {
    /// Patch half-size. The patch is (2·half_size + 1)².
    pub half_size: usize,
    /// Maximum Gauss-Newton iterations per pyramid level.
    pub max_iterations: usize,
    /// Convergence threshold in pixels.
    pub epsilon: f32,
    /// Pyramid levels to use (≤ template and pyramid depth).
    pub max_levels: usize,
    /// Largest acceptable RMS residual after gain compensation.
    pub max_residual: f32,
}

impl KltTracker {
    pub fn new(half_size: usize, max_iterations: usize, epsilon: f32, max_levels: usize, max_residual: f32) -> Self {
        KltTracker {
            half_size,
            max_iterations,
            epsilon,
            max_levels,
            max_residual,
        }
    }

    /// Propagate a feature last seen at level-0 position (x, y) with
    /// stored `template` samples into `curr`.
    pub fn track(&self, template: &PatchSamples, x: f32, y: f32, curr: &Pyramid) -> TrackResult {
        let num_levels = self
            .max_levels
            .min(template.levels.len())
            .min(curr.num_levels())
            .max(1);
        let lost = |status| TrackResult {
            x,
            y,
            status,
            gain: 1.0,
            residual: f32::INFINITY,
        };

        let margin = border_margin(self.half_size) as f32;
        let mut dx = 0.0f32;
        let mut dy = 0.0f32;
        for level in (0..num_levels).rev() {
            let scale = Pyramid::scale(level);
            let img = curr.level(level);
            let t = &template.levels[level];
            let (fx, fy) = (x * scale, y * scale);
            let usable = footprint_fits(img, fx, fy, margin) && footprint_fits(img, fx + dx, fy + dy, margin);
            let outcome = if usable {
                self.lk_gain(t, img, fx, fy, dx, dy, margin)
            } else {
                LkResult::Outside
            };
            match outcome {
                LkResult::Converged(ndx, ndy) => {
                    dx = ndx;
                    dy = ndy;
                }
                LkResult::MaxIter(ndx, ndy) => {
                    if level == 0 {
                        return lost(TrackStatus::NotConverged);
                    }
                    dx = ndx;
                    dy = ndy;
                }
                LkResult::Singular => return lost(TrackStatus::Lost),
                // Coarse levels near the border keep the incoming estimate.
                LkResult::Outside if level > 0 => {}
                LkResult::Outside => {
                    return TrackResult {
                        x: x + dx,
                        y: y + dy,
                        status: TrackStatus::OutOfBounds,
                        gain: 1.0,
                        residual: f32::INFINITY,
                    }
                }
            }
            if !(dx.is_finite() && dy.is_finite()) {
                return lost(TrackStatus::Lost);
            }
            if level > 0 {
                dx *= 2.0;
                dy *= 2.0;
            }
        }

        let nx = x + dx;
        let ny = y + dy;
        let img = curr.level(0);
        if !footprint_fits(img, nx, ny, margin) {
            return TrackResult {
                x: nx,
                y: ny,
                status: TrackStatus::OutOfBounds,
                gain: 1.0,
                residual: f32::INFINITY,
            };
        }

        let (gain, residual) = self.residual(&template.levels[0], img, nx, ny);
        let status = if residual <= self.max_residual {
            TrackStatus::Tracked
        } else {
            TrackStatus::HighResidual
        };
        TrackResult {
            x: nx,
            y: ny,
            status,
            gain,
            residual,
        }
    }

    /// Gauss-Newton over (dx, dy, gain) at one level.
    #[allow(clippy::too_many_arguments)]
    fn lk_gain(
        &self,
        t: &[f32],
        img: &Image<f32>,
        fx: f32,
        fy: f32,
        mut dx: f32,
        mut dy: f32,
        margin: f32,
    ) -> LkResult {
        let half = self.half_size as isize;
        let side = 2 * self.half_size + 1;
        let t_sum: f32 = t.iter().sum();

        let mut i_sum = 0.0f32;
        for py in -half..=half {
            for px in -half..=half {
                i_sum += interpolate_bilinear(img, fx + dx + px as f32, fy + dy + py as f32);
            }
        }
        let mut gain = if t_sum > 1e-3 { i_sum / t_sum } else { 1.0 };

        for _ in 0..self.max_iterations {
            if !footprint_fits(img, fx + dx, fy + dy, margin) {
                return LkResult::Outside;
            }
            let mut hessian = Matrix3::<f32>::zeros();
            let mut rhs = Vector3::<f32>::zeros();
            for py in -half..=half {
                for px in -half..=half {
                    let idx = (py + half) as usize * side + (px + half) as usize;
                    let wx = fx + dx + px as f32;
                    let wy = fy + dy + py as f32;
                    let e = gain * t[idx] - interpolate_bilinear(img, wx, wy);

                    let gx = 0.5 * (interpolate_bilinear(img, wx + 1.0, wy) - interpolate_bilinear(img, wx - 1.0, wy));
                    let gy = 0.5 * (interpolate_bilinear(img, wx, wy + 1.0) - interpolate_bilinear(img, wx, wy - 1.0));

                    let j = Vector3::new(gx, gy, -t[idx]);
                    hessian += j * j.transpose();
                    rhs += j * e;
                }
            }

            // Texture check on the displacement block alone.
            let det = hessian[(0, 0)] * hessian[(1, 1)] - hessian[(0, 1)] * hessian[(0, 1)];
            if det.abs() < 1e-6 {
                return LkResult::Singular;
            }
            let Some(delta) = hessian.lu().solve(&rhs) else {
                return LkResult::Singular;
            };
            dx += delta[0];
            dy += delta[1];
            gain += delta[2];

            if delta[0] * delta[0] + delta[1] * delta[1] < self.epsilon * self.epsilon {
                return LkResult::Converged(dx, dy);
            }
        }
        LkResult::MaxIter(dx, dy)
    }

    /// Gain and RMS residual of the template placed at (x, y).
    fn residual(&self, t: &[f32], img: &Image<f32>, x: f32, y: f32) -> (f32, f32) {
        let half = self.half_size as isize;
        let samples: Vec<f32> = (-half..=half)
            .flat_map(|py| (-half..=half).map(move |px| (px, py)))
            .map(|(px, py)| interpolate_bilinear(img, x + px as f32, y + py as f32))
            .collect();
        let t_sum: f32 = t.iter().sum();
        let i_sum: f32 = samples.iter().sum();
        let gain = if t_sum > 1e-3 { i_sum / t_sum } else { 1.0 };
        let sq: f32 = t
            .iter()
            .zip(&samples)
            .map(|(&tv, &iv)| (gain * tv - iv) * (gain * tv - iv))
            .sum();
        (gain, (sq / samples.len() as f32).sqrt())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ColorImage;

    fn texture(w: usize, h: usize, ox: f32, oy: f32, gain: f32) -> Image<u8> {
        Image::from_fn(w, h, |x, y| {
            let xf = x as f32 - ox;
            let yf = y as f32 - oy;
            let v = 100.0 + 40.0 * (xf / 4.0).sin() * (yf / 5.0).cos() + 20.0 * ((xf + yf) / 7.0).sin();
            (v * gain).round().clamp(0.0, 255.0) as u8
        })
    }

    fn template_at(img: &Image<u8>, x: f32, y: f32, half: usize, levels: usize) -> (PatchSamples, Pyramid) {
        let pyr = Pyramid::build(img, levels, 1.0);
        let patch = PatchSamples::capture(&ColorImage::gray(img.clone()), &pyr, x, y, half);
        (patch, pyr)
    }

    #[test]
    fn test_recovers_translation() {
        let prev = texture(96, 96, 0.0, 0.0, 1.0);
        let curr = texture(96, 96, 1.5, -1.0, 1.0);
        let (tpl, _) = template_at(&prev, 48.0, 48.0, 3, 3);
        let curr_pyr = Pyramid::build(&curr, 3, 1.0);

        let klt = KltTracker::new(3, 30, 0.01, 3, 15.0);
        let r = klt.track(&tpl, 48.0, 48.0, &curr_pyr);
        assert_eq!(r.status, TrackStatus::Tracked);
        assert!((r.x - 49.5).abs() < 0.3, "x = {}", r.x);
        assert!((r.y - 47.0).abs() < 0.3, "y = {}", r.y);
    }

    #[test]
    fn test_exposure_change_does_not_break_tracking() {
        let prev = texture(96, 96, 0.0, 0.0, 1.0);
        let curr = texture(96, 96, 1.0, 1.0, 1.5);
        let (tpl, _) = template_at(&prev, 40.0, 50.0, 2, 3);
        let curr_pyr = Pyramid::build(&curr, 3, 1.0);

        let klt = KltTracker::new(2, 30, 0.01, 3, 15.0);
        let r = klt.track(&tpl, 40.0, 50.0, &curr_pyr);
        assert_eq!(r.status, TrackStatus::Tracked);
        assert!((r.x - 41.0).abs() < 0.3);
        assert!((r.y - 51.0).abs() < 0.3);
        assert!((r.gain - 1.5).abs() < 0.1, "gain = {}", r.gain);
    }

    #[test]
    fn test_flat_patch_is_lost() {
        let flat = Image::filled(64, 64, 80u8);
        let (tpl, pyr) = template_at(&flat, 32.0, 32.0, 2, 2);
        let klt = KltTracker::new(2, 30, 0.01, 2, 15.0);
        let r = klt.track(&tpl, 32.0, 32.0, &pyr);
        assert_eq!(r.status, TrackStatus::Lost);
    }

    #[test]
    fn test_patch_leaving_image_is_out_of_bounds() {
        let prev = texture(64, 64, 0.0, 0.0, 1.0);
        let curr = texture(64, 64, -2.0, 0.0, 1.0);
        let (tpl, _) = template_at(&prev, 3.0, 30.0, 2, 1);
        let curr_pyr = Pyramid::build(&curr, 1, 1.0);
        let klt = KltTracker::new(2, 30, 0.01, 1, 15.0);
        let r = klt.track(&tpl, 3.0, 30.0, &curr_pyr);
        assert_ne!(r.status, TrackStatus::Tracked);
    }

    #[test]
    fn test_integer_pan_is_recovered_exactly() {
        let prev = texture(128, 96, 0.0, 0.0, 1.0);
        let curr = texture(128, 96, 1.0, 0.0, 1.0);
        let pyr = Pyramid::build(&prev, 3, 1.0);
        let curr_pyr = Pyramid::build(&curr, 3, 1.0);
        let klt = KltTracker::new(2, 30, 0.01, 3, 15.0);
        for (x, y) in [(20.0, 20.0), (64.0, 48.0), (100.0, 30.0), (47.0, 80.0)] {
            let tpl = PatchSamples::capture(&ColorImage::gray(prev.clone()), &pyr, x, y, 2);
            let r = klt.track(&tpl, x, y, &curr_pyr);
            assert_eq!(r.status, TrackStatus::Tracked);
            assert!((r.x - x - 1.0).abs() < 0.05, "({x}, {y}): dx = {}", r.x - x);
            assert!((r.y - y).abs() < 0.05, "({x}, {y}): dy = {}", r.y - y);
        }
    }

    #[test]
    fn test_border_features_skip_coarse_levels() {
        let prev = texture(128, 96, 0.0, 0.0, 1.0);
        let curr = texture(128, 96, 1.0, 0.0, 1.0);
        let pyr = Pyramid::build(&prev, 3, 1.0);
        let curr_pyr = Pyramid::build(&curr, 3, 1.0);
        let klt = KltTracker::new(2, 30, 0.01, 3, 15.0);

        // Fits at level 0 only: tracked there, without clamped samples.
        let tpl = PatchSamples::capture(&ColorImage::gray(prev.clone()), &pyr, 118.0, 50.0, 2);
        let r = klt.track(&tpl, 118.0, 50.0, &curr_pyr);
        assert_eq!(r.status, TrackStatus::Tracked);
        assert!((r.x - 119.0).abs() < 0.05, "x = {}", r.x);
        assert!((r.y - 50.0).abs() < 0.05, "y = {}", r.y);

        // Moves past the level-0 margin: never reported as tracked.
        for (x, y) in [(123.0, 62.0), (123.0, 50.0)] {
            let tpl = PatchSamples::capture(&ColorImage::gray(prev.clone()), &pyr, x, y, 2);
            let r = klt.track(&tpl, x, y, &curr_pyr);
            assert_eq!(r.status, TrackStatus::OutOfBounds, "({x}, {y})");
        }
    }

    #[test]
    fn test_border_margin_covers_derivative_footprint() {
        assert_eq!(border_margin(2), 4);
        let img = Image::<f32>::new(16, 16);
        assert!(footprint_fits(&img, 4.0, 11.0, 4.0));
        assert!(!footprint_fits(&img, 3.5, 8.0, 4.0));
        assert!(!footprint_fits(&img, 8.0, 11.5, 4.0));
    }

    #[test]
    fn test_unrelated_content_is_rejected() {
        let prev = texture(64, 64, 0.0, 0.0, 1.0);
        let other = Image::from_fn(64, 64, |x, y| if (x / 3 + y / 3) % 2 == 0 { 30u8 } else { 220 });
        let (tpl, _) = template_at(&prev, 32.0, 32.0, 2, 1);
        let pyr = Pyramid::build(&other, 1, 1.0);
        let klt = KltTracker::new(2, 30, 0.01, 1, 5.0);
        let r = klt.track(&tpl, 32.0, 32.0, &pyr);
        assert_ne!(r.status, TrackStatus::Tracked);
    }
}
