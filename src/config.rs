// config.rs — Calibration settings.
//
// Plain struct with public fields and a Default impl. Serde support lets
// the application load it from whatever file format it prefers; every
// missing field falls back to its default.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// How the optimizer is scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CalibrationMode {
    /// Refine continuously on a background worker while frames stream in.
    #[default]
    Online,
    /// Ingest a fixed range of frames, then optimize once.
    Batch,
}

impl FromStr for CalibrationMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "online" => Ok(CalibrationMode::Online),
            "batch" => Ok(CalibrationMode::Batch),
            other => Err(ConfigError::UnknownMode(other.to_string())),
        }
    }
}

impl fmt::Display for CalibrationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CalibrationMode::Online => write!(f, "online"),
            CalibrationMode::Batch => write!(f, "batch"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Patch half-width for appearance matching (patch is (2p+1)²).
    pub tracker_patch_size: usize,
    /// Pyramid levels used by the tracker.
    pub nr_pyramid_levels: usize,
    /// Cap on simultaneously tracked features.
    pub nr_active_features: usize,
    /// Warm-up length of the rapid exposure estimate: the first this many
    /// frames keep the previous exposure. Afterwards it is also the number
    /// of previous frames whose ratios are combined.
    pub nr_images_rapid_exp: usize,
    /// Sliding window of frames kept in the database.
    pub nr_active_frames: usize,
    /// Every n-th frame of the window is a keyframe.
    pub keyframe_spacing: usize,
    /// Keyframe observations a track needs to enter the optimization.
    pub min_keyframes_valid: usize,
    pub calibration_mode: CalibrationMode,

    /// Gaussian sigma between pyramid levels.
    pub pyramid_sigma: f32,
    /// LK iterations per pyramid level.
    pub klt_max_iterations: usize,
    /// LK convergence threshold in pixels.
    pub klt_epsilon: f32,
    /// Largest gain-compensated RMS patch residual (grey levels) a
    /// propagated feature may have.
    pub max_patch_residual: f32,
    /// Smallest mean patch gradient for extraction and tracking.
    pub min_gradient: f32,
    /// Minimum pixel distance between features.
    pub min_feature_distance: usize,
    /// Online mode: optimize every `keyframe_spacing * optimize_every` frames.
    pub optimize_every: usize,
    /// Levenberg–Marquardt iterations allowed per Huber reweighting round.
    pub max_optimizer_iterations: usize,
    /// Huber threshold on normalized irradiance residuals.
    pub huber_delta: f64,
    /// Weight of the pull toward the identity response. Only has to break
    /// the gamma ambiguity when no two keyframe exposures are known.
    pub response_prior_weight: f64,
    /// Valid shared samples below which the rapid estimate returns 1.0.
    pub min_rapid_samples: usize,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        CalibrationConfig {
            tracker_patch_size: 2,
            nr_pyramid_levels: 3,
            nr_active_features: 200,
            nr_images_rapid_exp: 15,
            nr_active_frames: 200,
            keyframe_spacing: 15,
            min_keyframes_valid: 3,
            calibration_mode: CalibrationMode::Online,
            pyramid_sigma: 1.0,
            klt_max_iterations: 30,
            klt_epsilon: 0.01,
            max_patch_residual: 15.0,
            min_gradient: 8.0,
            min_feature_distance: 8,
            optimize_every: 2,
            max_optimizer_iterations: 50,
            huber_delta: 0.02,
            response_prior_weight: 1e-6,
            min_rapid_samples: 10,
        }
    }
}

impl CalibrationConfig {
    /// Reject values no pipeline could run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let counts = [
            ("nr_active_features", self.nr_active_features),
            ("nr_images_rapid_exp", self.nr_images_rapid_exp),
            ("nr_active_frames", self.nr_active_frames),
            ("keyframe_spacing", self.keyframe_spacing),
            ("min_keyframes_valid", self.min_keyframes_valid),
            ("klt_max_iterations", self.klt_max_iterations),
            ("min_feature_distance", self.min_feature_distance),
            ("optimize_every", self.optimize_every),
            ("max_optimizer_iterations", self.max_optimizer_iterations),
        ];
        for (name, value) in counts {
            if value == 0 {
                return Err(ConfigError::Zero { name });
            }
        }
        if !(1..=8).contains(&self.nr_pyramid_levels) {
            return Err(ConfigError::PyramidLevels(self.nr_pyramid_levels));
        }
        let positive = [
            ("pyramid_sigma", self.pyramid_sigma as f64),
            ("klt_epsilon", self.klt_epsilon as f64),
            ("max_patch_residual", self.max_patch_residual as f64),
            ("huber_delta", self.huber_delta),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::NonPositive { name, value });
            }
        }
        let non_negative = [
            ("min_gradient", self.min_gradient as f64),
            ("response_prior_weight", self.response_prior_weight),
        ];
        for (name, value) in non_negative {
            if !(value.is_finite() && value >= 0.0) {
                return Err(ConfigError::NonPositive { name, value });
            }
        }
        let needed = self.keyframe_spacing * self.min_keyframes_valid;
        if self.nr_active_frames < needed {
            return Err(ConfigError::WindowTooShort {
                frames: self.nr_active_frames,
                needed,
            });
        }
        Ok(())
    }

    /// Frames between online optimization triggers.
    pub fn optimization_interval(&self) -> usize {
        self.keyframe_spacing * self.optimize_every
    }
}
