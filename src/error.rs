// error.rs — Error taxonomy for the calibration pipeline.
//
// Three kinds of failure reach the caller:
//   ImageError     — a malformed input frame; fatal to that process_frame call.
//   ConfigError    — an option value that cannot work; rejected up front.
//   OptimizeError  — the optimizer declined to produce a model; the caller
//                    keeps the previous one.
//
// Per-feature tracking failures never show up here. They are local and
// travel as `TrackStatus` values instead.

use thiserror::Error;

/// Problems with an input image.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ImageError {
    #[error("image is empty ({width}x{height})")]
    Empty { width: usize, height: usize },
    #[error("image is {got_w}x{got_h}, session expects {want_w}x{want_h}")]
    DimensionMismatch {
        want_w: usize,
        want_h: usize,
        got_w: usize,
        got_h: usize,
    },
    #[error("image has {got} channels, session expects {want}")]
    ChannelMismatch { want: usize, got: usize },
    #[error("unsupported channel count {0} (expected 1 or 3)")]
    UnsupportedChannels(usize),
    #[error("plane {plane} is {got_w}x{got_h}, first plane is {want_w}x{want_h}")]
    PlaneSizeMismatch {
        plane: usize,
        want_w: usize,
        want_h: usize,
        got_w: usize,
        got_h: usize,
    },
    #[error("buffer has {got} bytes, expected {want}")]
    BufferLength { want: usize, got: usize },
    #[error("{width}x{height} image is too small for {levels} pyramid levels")]
    TooSmallForPyramid {
        width: usize,
        height: usize,
        levels: usize,
    },
}

/// Rejected configuration values.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{name} must be > 0")]
    Zero { name: &'static str },
    #[error("{name} must be finite and > 0 (got {value})")]
    NonPositive { name: &'static str, value: f64 },
    #[error("nr_pyramid_levels must be in 1..=8 (got {0})")]
    PyramidLevels(usize),
    #[error("nr_active_frames ({frames}) must be >= keyframe_spacing * min_keyframes_valid ({needed})")]
    WindowTooShort { frames: usize, needed: usize },
    #[error("unknown calibration mode {0:?} (expected \"online\" or \"batch\")")]
    UnknownMode(String),
}

/// Reasons the nonlinear optimizer returns without a new model.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum OptimizeError {
    #[error("need at least 2 keyframes, window has {0}")]
    NotEnoughKeyframes(usize),
    #[error("need at least {needed} residuals, window yields {got}")]
    NotEnoughResiduals { needed: usize, got: usize },
    #[error("no convergence after {iterations} iterations (cost {cost:.6e})")]
    NotConverged { iterations: usize, cost: f64 },
    #[error("cost became non-finite at iteration {0}")]
    Diverged(usize),
    #[error("least-squares solver failed numerically ({0})")]
    Numerical(&'static str),
}

/// Top-level error of the calibrator.
#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error(transparent)]
    Image(#[from] ImageError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Optimize(#[from] OptimizeError),
    #[error("exposure time must be finite and > 0 (got {0})")]
    InvalidExposure(f64),
    #[error("optimization worker stopped unexpectedly")]
    WorkerStopped,
}
