// feature.rs — Tracked scene points and their per-frame observations.
//
// A Feature is one scene point followed through consecutive frames. Each
// successful propagation appends an Observation: the sub-pixel location,
// the local gradient, and the patch samples the rest of the pipeline
// needs later:
//
//   - gray samples at every pyramid level. These are the template the
//     tracker matches against the next frame, coarse level first.
//   - raw u8 samples per colour channel at level 0. These go through the
//     inverse response for exposure estimation and optimization.
//
// Frames and features refer to each other only by id (FrameId, TrackId).
// The Database owns both tables, so there are no ownership cycles.

use crate::image::{interpolate_bilinear, ColorImage, Image};
use crate::pyramid::Pyramid;

/// Stable identity of a feature track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackId(pub u64);

/// Sequence number of an admitted frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(pub u64);

/// Intensities at or below this value are treated as clipped black.
pub const SATURATION_LOW: u8 = 1;
/// Intensities at or above this value are treated as clipped white.
pub const SATURATION_HIGH: u8 = 254;

/// True if `v` is too close to the ends of the range to invert reliably.
#[inline]
pub fn is_saturated(v: u8) -> bool {
    v <= SATURATION_LOW || v >= SATURATION_HIGH
}

/// Intensity samples of the square patch around one observation.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchSamples {
    /// Patch half-width p; every sample vector has (2p+1)² entries in
    /// row-major order.
    pub half_size: usize,
    /// Gray samples per pyramid level, bilinear at the scaled location.
    pub levels: Vec<Vec<f32>>,
    /// Raw samples per colour channel at level 0, nearest integer pixels.
    pub raw: Vec<Vec<u8>>,
    /// Integer centre of the raw samples.
    pub origin: (i64, i64),
}

impl PatchSamples {
    /// Sample the patch around level-0 location (x, y).
    ///
    /// The caller guarantees the patch lies inside the image (the tracker
    /// kills features before that stops being true).
    pub fn capture(image: &ColorImage, pyramid: &Pyramid, x: f32, y: f32, half_size: usize) -> Self {
        let h = half_size as i64;
        let levels = pyramid
            .levels
            .iter()
            .enumerate()
            .map(|(l, level)| sample_level(level, x * Pyramid::scale(l), y * Pyramid::scale(l), h))
            .collect();

        let cx = x.round() as i64;
        let cy = y.round() as i64;
        let max_x = image.width() as i64 - 1;
        let max_y = image.height() as i64 - 1;
        let raw = image
            .planes()
            .iter()
            .map(|plane| {
                let mut out = Vec::with_capacity(((2 * h + 1) * (2 * h + 1)) as usize);
                for dy in -h..=h {
                    for dx in -h..=h {
                        let px = (cx + dx).clamp(0, max_x) as usize;
                        let py = (cy + dy).clamp(0, max_y) as usize;
                        out.push(plane.get(px, py));
                    }
                }
                out
            })
            .collect();

        PatchSamples {
            half_size,
            levels,
            raw,
            origin: (cx, cy),
        }
    }

    /// Number of samples per patch.
    pub fn len(&self) -> usize {
        (2 * self.half_size + 1) * (2 * self.half_size + 1)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Integer pixel position of raw sample `i`.
    pub fn sample_position(&self, i: usize) -> (i64, i64) {
        let side = 2 * self.half_size + 1;
        let h = self.half_size as i64;
        let dx = (i % side) as i64 - h;
        let dy = (i / side) as i64 - h;
        (self.origin.0 + dx, self.origin.1 + dy)
    }

    /// Raw sample `i` of `channel`.
    #[inline]
    pub fn raw_sample(&self, channel: usize, i: usize) -> u8 {
        self.raw[channel][i]
    }

    /// Raw centre intensity of `channel`.
    pub fn centre(&self, channel: usize) -> u8 {
        self.raw[channel][self.len() / 2]
    }

    /// True if every raw sample of every channel is saturated.
    pub fn fully_saturated(&self) -> bool {
        self.raw.iter().flatten().all(|&v| is_saturated(v))
    }
}

fn sample_level(img: &Image<f32>, x: f32, y: f32, h: i64) -> Vec<f32> {
    let mut out = Vec::with_capacity(((2 * h + 1) * (2 * h + 1)) as usize);
    for dy in -h..=h {
        for dx in -h..=h {
            out.push(interpolate_bilinear(img, x + dx as f32, y + dy as f32));
        }
    }
    out
}

/// One sighting of a feature in one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub frame_id: FrameId,
    /// Sub-pixel level-0 location.
    pub x: f32,
    pub y: f32,
    /// Mean gradient magnitude over the patch.
    pub gradient: f32,
    pub patch: PatchSamples,
}

/// A feature track.
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    pub id: TrackId,
    /// Observations ordered by frame id. Older entries disappear when
    /// their frames are marginalized.
    observations: Vec<Observation>,
    pub birth_frame: FrameId,
    pub last_frame: FrameId,
    alive: bool,
}

impl Feature {
    pub fn new(id: TrackId, first: Observation) -> Self {
        let frame = first.frame_id;
        Feature {
            id,
            observations: vec![first],
            birth_frame: frame,
            last_frame: frame,
            alive: true,
        }
    }

    #[inline]
    pub fn is_alive(&self) -> bool {
        self.alive
    }

    /// Mark the track dead. There is no way back.
    pub fn kill(&mut self) {
        self.alive = false;
    }

    /// Append the next observation.
    ///
    /// # Panics
    /// Panics if the feature is dead or the frame id does not increase.
    pub fn push_observation(&mut self, obs: Observation) {
        assert!(self.alive, "feature {:?} is dead", self.id);
        assert!(
            obs.frame_id > self.last_frame,
            "observation frame {:?} not after last frame {:?}",
            obs.frame_id,
            self.last_frame
        );
        self.last_frame = obs.frame_id;
        self.observations.push(obs);
    }

    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    /// Number of retained observations.
    pub fn track_len(&self) -> usize {
        self.observations.len()
    }

    pub fn last_observation(&self) -> Option<&Observation> {
        self.observations.last()
    }

    /// Observation made in `frame`, if any.
    pub fn observation_in(&self, frame: FrameId) -> Option<&Observation> {
        self.observations
            .binary_search_by_key(&frame, |o| o.frame_id)
            .ok()
            .map(|i| &self.observations[i])
    }

    /// Drop observations from frames older than `oldest`. Returns how
    /// many observations remain.
    pub fn drop_observations_before(&mut self, oldest: FrameId) -> usize {
        let cut = self.observations.partition_point(|o| o.frame_id < oldest);
        self.observations.drain(..cut);
        self.observations.len()
    }

    /// True if every observation is fully saturated.
    pub fn fully_saturated(&self) -> bool {
        self.observations.iter().all(|o| o.patch.fully_saturated())
    }
}
