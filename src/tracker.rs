// tracker.rs — Per-frame tracking loop.
//
// One call to `process_frame` per camera frame:
//
//   1. Validate the image against the session (size, channels, pyramid)
//   2. Luminance plane, Gaussian pyramid, gradient-magnitude image
//   3. Propagate every active feature with gain-robust KLT; kill the
//      ones that fail (see `TrackStatus`)
//   4. Exposure of the new frame: the caller's value if it has one,
//      otherwise the rapid estimate from the survivors once the first
//      `nr_images_rapid_exp` frames have passed
//   5. Extract new features at the strongest gradients, keeping the
//      minimum separation, until the population is full again
//   6. Commit everything to the database under its lock
//
// The database lock is taken twice: briefly to copy the templates of the
// active features, and once more for the exposure estimate and the
// commit. Tracking itself runs without holding it, so the optimization
// worker can take its snapshot in between.

use std::sync::Arc;

use tracing::debug;

use crate::config::CalibrationConfig;
use crate::convert::to_gray;
use crate::database::{self, SharedDatabase};
use crate::error::{CalibrationError, ImageError};
use crate::exposure::{FrameSamples, RapidExposureTimeEstimator};
use crate::feature::{is_saturated, FrameId, Observation, PatchSamples, TrackId};
use crate::frame::Frame;
use crate::gradient::gradient_image;
use crate::image::{ColorImage, Image};
use crate::klt::{border_margin, KltTracker, TrackStatus};
use crate::model::ModelStore;
use crate::occupancy::OccupancyGrid;
use crate::pyramid::{check_pyramid_size, Pyramid};
use crate::response::MAX_CHANNELS;

/// Statistics returned after processing each frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameReport {
    pub frame_id: FrameId,
    /// Features propagated into this frame.
    pub tracked: usize,
    /// Features that died during propagation.
    pub lost: usize,
    /// Features born in this frame.
    pub new_features: usize,
    /// Active population after this frame.
    pub active_features: usize,
    /// Exposure assigned to the frame.
    pub exposure: f64,
    /// False while the rapid estimator is still warming up; the frame
    /// then inherits the previous exposure.
    pub exposure_trusted: bool,
}

/// A feature that survived propagation, waiting for its frame id.
struct Propagated {
    id: TrackId,
    x: f32,
    y: f32,
    gradient: f32,
    patch: PatchSamples,
}

/// A newly extracted feature, waiting for its frame id.
struct Candidate {
    x: f32,
    y: f32,
    gradient: f32,
    patch: PatchSamples,
}

pub struct Tracker {
    config: CalibrationConfig,
    width: usize,
    height: usize,
    channels: usize,
    klt: KltTracker,
    estimator: RapidExposureTimeEstimator,
    grid: OccupancyGrid,
    db: SharedDatabase,
    models: Arc<ModelStore>,
    admitted: u64,
}

impl Tracker {
    /// Tracker for a `width`×`height` session with `channels` planes.
    pub fn new(
        config: CalibrationConfig,
        width: usize,
        height: usize,
        channels: usize,
        db: SharedDatabase,
        models: Arc<ModelStore>,
    ) -> Result<Self, CalibrationError> {
        config.validate()?;
        if channels != 1 && channels != MAX_CHANNELS {
            return Err(ImageError::UnsupportedChannels(channels).into());
        }
        check_pyramid_size(width, height, config.nr_pyramid_levels)?;
        let min_side = 2 * border_margin(config.tracker_patch_size) + 1;
        if width < min_side || height < min_side {
            return Err(ImageError::TooSmallForPyramid {
                width,
                height,
                levels: config.nr_pyramid_levels,
            }
            .into());
        }

        let klt = KltTracker::new(
            config.tracker_patch_size,
            config.klt_max_iterations,
            config.klt_epsilon,
            config.nr_pyramid_levels,
            config.max_patch_residual,
        );
        let estimator = RapidExposureTimeEstimator::new(config.min_rapid_samples, config.nr_images_rapid_exp);
        let grid = OccupancyGrid::new(width, height, config.min_feature_distance);
        Ok(Tracker {
            config,
            width,
            height,
            channels,
            klt,
            estimator,
            grid,
            db,
            models,
            admitted: 0,
        })
    }

    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    pub fn database(&self) -> &SharedDatabase {
        &self.db
    }

    /// Check a frame against the session before touching any state.
    pub fn validate(&self, raw: &ColorImage) -> Result<(), ImageError> {
        if raw.is_empty() {
            return Err(ImageError::Empty {
                width: raw.width(),
                height: raw.height(),
            });
        }
        if raw.width() != self.width || raw.height() != self.height {
            return Err(ImageError::DimensionMismatch {
                want_w: self.width,
                want_h: self.height,
                got_w: raw.width(),
                got_h: raw.height(),
            });
        }
        if raw.channels() != self.channels {
            return Err(ImageError::ChannelMismatch {
                want: self.channels,
                got: raw.channels(),
            });
        }
        Ok(())
    }

    /// Process one frame. On error nothing has been changed.
    pub fn process_frame(&mut self, raw: &ColorImage, timestamp: f64) -> Result<FrameReport, ImageError> {
        self.process(raw, timestamp, None)
    }

    /// Process a frame whose exposure time is known. The value replaces
    /// the rapid estimate and the optimizer keeps it fixed.
    pub fn process_frame_with_exposure(
        &mut self,
        raw: &ColorImage,
        timestamp: f64,
        exposure: f64,
    ) -> Result<FrameReport, CalibrationError> {
        if !(exposure.is_finite() && exposure > 0.0) {
            return Err(CalibrationError::InvalidExposure(exposure));
        }
        Ok(self.process(raw, timestamp, Some(exposure))?)
    }

    fn process(&mut self, raw: &ColorImage, timestamp: f64, known: Option<f64>) -> Result<FrameReport, ImageError> {
        self.validate(raw)?;

        let gray = to_gray(raw);
        let pyramid = Pyramid::try_build(&gray, self.config.nr_pyramid_levels, self.config.pyramid_sigma)?;
        let gradient = gradient_image(raw);
        let model = self.models.load();

        // Templates of the active population.
        let templates: Vec<(TrackId, f32, f32, PatchSamples)> = {
            let db = database::lock(&self.db);
            db.active_features()
                .filter_map(|f| {
                    let obs = f.last_observation()?;
                    Some((f.id, obs.x, obs.y, obs.patch.clone()))
                })
                .collect()
        };

        let mut survivors = Vec::with_capacity(templates.len());
        let mut dead = Vec::new();
        for (id, x, y, template) in &templates {
            match self.propagate(template, *x, *y, raw, &pyramid, &gradient) {
                Ok(p) => survivors.push(Propagated { id: *id, ..p }),
                Err(status) => {
                    debug!(track = id.0, ?status, "feature lost");
                    dead.push(*id);
                }
            }
        }

        let quota = self.config.nr_active_features.saturating_sub(survivors.len());
        let candidates = self.extract(raw, &pyramid, &gradient, &survivors, quota);

        let mut db = database::lock(&self.db);
        let warming_up = self.admitted < self.config.nr_images_rapid_exp as u64;
        let (exposure, exposure_trusted) = match known {
            Some(e) => (e, true),
            None if warming_up => (db.latest_frame().map_or(1.0, |f| f.exposure_time), false),
            None => {
                let new = FrameSamples::new(1.0, survivors.iter().map(|p| (p.id, &p.patch)).collect());
                let frame_ids: Vec<FrameId> = db.frames().rev().take(self.config.nr_images_rapid_exp).map(|f| f.id).collect();
                let history: Vec<FrameSamples<'_>> = frame_ids.iter().filter_map(|&id| db.frame_samples(id)).collect();
                (self.estimator.estimate_windowed(&new, &history, &model.response), true)
            }
        };

        let mut frame = Frame::new(timestamp, raw.clone(), gray, gradient, pyramid);
        frame.exposure_time = exposure;
        frame.exposure_known = known.is_some();
        let frame_id = db.add_frame(frame);
        self.admitted += 1;

        for id in &dead {
            db.kill_feature(*id);
        }
        let mut tracked = 0;
        for p in survivors {
            let obs = Observation {
                frame_id,
                x: p.x,
                y: p.y,
                gradient: p.gradient,
                patch: p.patch,
            };
            if db.add_observation(p.id, obs) {
                tracked += 1;
            }
        }
        let mut new_features = 0;
        for c in candidates {
            let obs = Observation {
                frame_id,
                x: c.x,
                y: c.y,
                gradient: c.gradient,
                patch: c.patch,
            };
            if db.add_feature(obs).is_none() {
                break;
            }
            new_features += 1;
        }

        let report = FrameReport {
            frame_id,
            tracked,
            lost: dead.len(),
            new_features,
            active_features: db.num_active_features(),
            exposure,
            exposure_trusted,
        };
        debug!(
            frame = frame_id.0,
            tracked = report.tracked,
            lost = report.lost,
            new = report.new_features,
            active = report.active_features,
            exposure,
            "processed frame"
        );
        Ok(report)
    }

    /// Follow one feature into the new frame and apply the quality gates.
    fn propagate(
        &self,
        template: &PatchSamples,
        x: f32,
        y: f32,
        raw: &ColorImage,
        pyramid: &Pyramid,
        gradient: &Image<f32>,
    ) -> Result<Propagated, TrackStatus> {
        let result = self.klt.track(template, x, y, pyramid);
        if !result.status.is_tracked() {
            return Err(result.status);
        }
        let (cx, cy) = (result.x.round() as usize, result.y.round() as usize);
        if (0..raw.channels()).any(|c| is_saturated(raw.get(cx, cy, c))) {
            return Err(TrackStatus::Saturated);
        }
        let grad = self.patch_gradient(gradient, cx, cy);
        if grad < self.config.min_gradient {
            return Err(TrackStatus::LowGradient);
        }
        Ok(Propagated {
            id: TrackId(0),
            x: result.x,
            y: result.y,
            gradient: grad,
            patch: PatchSamples::capture(raw, pyramid, result.x, result.y, self.config.tracker_patch_size),
        })
    }

    /// Mean gradient magnitude over the patch centred at (cx, cy).
    fn patch_gradient(&self, gradient: &Image<f32>, cx: usize, cy: usize) -> f32 {
        let h = self.config.tracker_patch_size;
        let x0 = cx.saturating_sub(h);
        let y0 = cy.saturating_sub(h);
        let x1 = (cx + h).min(gradient.width() - 1);
        let y1 = (cy + h).min(gradient.height() - 1);
        let mut sum = 0.0;
        for y in y0..=y1 {
            sum += gradient.row(y)[x0..=x1].iter().sum::<f32>();
        }
        sum / ((x1 - x0 + 1) * (y1 - y0 + 1)) as f32
    }

    /// Strongest-gradient pixels that respect the minimum separation from
    /// every survivor and from each other.
    fn extract(
        &mut self,
        raw: &ColorImage,
        pyramid: &Pyramid,
        gradient: &Image<f32>,
        survivors: &[Propagated],
        quota: usize,
    ) -> Vec<Candidate> {
        if quota == 0 {
            return Vec::new();
        }
        self.grid.clear();
        for p in survivors {
            self.grid.mark(p.x, p.y);
        }

        // Level-0 footprint of the KLT patch.
        let margin = border_margin(self.config.tracker_patch_size);
        let mut pixels: Vec<(usize, usize, f32)> = Vec::new();
        for y in margin..self.height - margin {
            for (x, &g) in gradient.row(y).iter().enumerate().take(self.width - margin).skip(margin) {
                if g >= self.config.min_gradient {
                    pixels.push((x, y, g));
                }
            }
        }
        pixels.sort_unstable_by(|a, b| b.2.total_cmp(&a.2));

        let mut out = Vec::with_capacity(quota);
        for (x, y, _) in pixels {
            if out.len() >= quota {
                break;
            }
            let (fx, fy) = (x as f32, y as f32);
            if !self.grid.is_free(fx, fy) {
                continue;
            }
            if (0..raw.channels()).any(|c| is_saturated(raw.get(x, y, c))) {
                continue;
            }
            let grad = self.patch_gradient(gradient, x, y);
            if grad < self.config.min_gradient {
                continue;
            }
            self.grid.mark(fx, fy);
            out.push(Candidate {
                x: fx,
                y: fy,
                gradient: grad,
                patch: PatchSamples::capture(raw, pyramid, fx, fy, self.config.tracker_patch_size),
            });
        }
        out
    }
}
