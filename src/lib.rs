// photocal: online photometric calibration
//
// Estimates a camera's inverse response, its vignetting and per-frame
// exposure times from a plain video stream, without a calibration
// target, by requiring that tracked scene points keep a consistent
// radiance across the frames that observe them.

pub mod error;
pub mod config;

pub mod image;
pub mod convert;
pub mod convolution;
pub mod pyramid;
pub mod gradient;
pub mod occupancy;

pub mod response;
pub mod vignette;
pub mod model;

pub mod feature;
pub mod frame;
pub mod database;

pub mod klt;
pub mod tracker;
pub mod exposure;
pub mod optimizer;
pub mod calibrator;

pub use calibrator::Calibrator;
pub use config::{CalibrationConfig, CalibrationMode};
pub use error::{CalibrationError, ConfigError, ImageError, OptimizeError};
pub use image::{ColorImage, Image};
pub use model::{ModelStore, PhotometricModel};
pub use response::ResponseModel;
pub use vignette::VignetteModel;
