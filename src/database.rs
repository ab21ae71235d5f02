// database.rs — Bounded window of frames and population of features.
//
// The database is the only state shared between the tracking loop and
// the optimizer. It keeps:
//
//   frames    the last `nr_active_frames` frames, oldest first
//   active    features still being tracked, at most `nr_active_features`
//   retired   dead features whose tracks are long enough to be worth
//             optimizing; read-only, pruned as their frames disappear
//
// The optimizer never reads the database directly. It works on an
// `OptimizationWindow`, a deep copy taken under the lock, so a frame can
// be marginalized at any time without invalidating a running
// optimization.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::config::CalibrationConfig;
use crate::exposure::FrameSamples;
use crate::feature::{Feature, FrameId, Observation, PatchSamples, TrackId};
use crate::frame::Frame;

/// Database behind the lock both activities share.
pub type SharedDatabase = Arc<Mutex<Database>>;

/// Lock the shared database. A panic on the other side does not leave
/// the tables half-updated in a way later frames cannot cope with, so a
/// poisoned lock is recovered rather than propagated.
pub fn lock(db: &SharedDatabase) -> MutexGuard<'_, Database> {
    db.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Window and population bounds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DatabaseLimits {
    pub nr_active_frames: usize,
    pub nr_active_features: usize,
    pub keyframe_spacing: usize,
    pub min_keyframes_valid: usize,
}

impl From<&CalibrationConfig> for DatabaseLimits {
    fn from(config: &CalibrationConfig) -> Self {
        DatabaseLimits {
            nr_active_frames: config.nr_active_frames,
            nr_active_features: config.nr_active_features,
            keyframe_spacing: config.keyframe_spacing,
            min_keyframes_valid: config.min_keyframes_valid,
        }
    }
}

pub struct Database {
    limits: DatabaseLimits,
    width: usize,
    height: usize,
    channels: usize,
    frames: VecDeque<Frame>,
    active: BTreeMap<TrackId, Feature>,
    retired: BTreeMap<TrackId, Feature>,
    next_frame: u64,
    next_track: u64,
}

impl Database {
    pub fn new(limits: DatabaseLimits, width: usize, height: usize, channels: usize) -> Self {
        Database {
            limits,
            width,
            height,
            channels,
            frames: VecDeque::with_capacity(limits.nr_active_frames + 1),
            active: BTreeMap::new(),
            retired: BTreeMap::new(),
            next_frame: 0,
            next_track: 0,
        }
    }

    pub fn shared(self) -> SharedDatabase {
        Arc::new(Mutex::new(self))
    }

    pub fn limits(&self) -> DatabaseLimits {
        self.limits
    }

    /// Admit a frame, assign its id, and marginalize the oldest frames
    /// until the window bound holds again.
    pub fn add_frame(&mut self, mut frame: Frame) -> FrameId {
        let id = FrameId(self.next_frame);
        self.next_frame += 1;
        frame.id = id;
        frame.features.clear();
        self.frames.push_back(frame);
        while self.frames.len() > self.limits.nr_active_frames {
            self.marginalize_oldest();
        }
        id
    }

    fn marginalize_oldest(&mut self) {
        let Some(gone) = self.frames.pop_front() else {
            return;
        };
        let Some(oldest) = self.frames.front().map(|f| f.id) else {
            // Window of one: everything the frame held goes with it.
            self.retired.clear();
            return;
        };
        for feature in self.active.values_mut() {
            feature.drop_observations_before(oldest);
        }
        let min_len = self.limits.min_keyframes_valid;
        let before = self.retired.len();
        self.retired
            .retain(|_, f| f.drop_observations_before(oldest) >= min_len);
        debug!(
            frame = gone.id.0,
            pruned = before - self.retired.len(),
            "marginalized frame"
        );
    }

    /// Start a new track from its first observation. Refused when the
    /// active population is already full or the frame is unknown.
    pub fn add_feature(&mut self, first: Observation) -> Option<TrackId> {
        if self.active.len() >= self.limits.nr_active_features {
            return None;
        }
        let id = TrackId(self.next_track);
        let frame = self.frame_mut(first.frame_id)?;
        frame.features.push(id);
        self.next_track += 1;
        self.active.insert(id, Feature::new(id, first));
        Some(id)
    }

    /// Append an observation to an active track.
    pub fn add_observation(&mut self, id: TrackId, obs: Observation) -> bool {
        let frame_id = obs.frame_id;
        if !self.active.contains_key(&id) {
            return false;
        }
        let Some(frame) = self.frame_mut(frame_id) else {
            return false;
        };
        frame.features.push(id);
        if let Some(feature) = self.active.get_mut(&id) {
            feature.push_observation(obs);
        }
        true
    }

    /// Remove a track from the active population. Long tracks stay
    /// available to the optimizer; short ones are dropped.
    pub fn kill_feature(&mut self, id: TrackId) -> bool {
        let Some(mut feature) = self.active.remove(&id) else {
            return false;
        };
        feature.kill();
        if feature.track_len() >= self.limits.min_keyframes_valid {
            self.retired.insert(id, feature);
        }
        true
    }

    pub fn frame(&self, id: FrameId) -> Option<&Frame> {
        let idx = self.frame_index(id)?;
        self.frames.get(idx)
    }

    pub fn frame_mut(&mut self, id: FrameId) -> Option<&mut Frame> {
        let idx = self.frame_index(id)?;
        self.frames.get_mut(idx)
    }

    fn frame_index(&self, id: FrameId) -> Option<usize> {
        let first = self.frames.front()?.id.0;
        let idx = id.0.checked_sub(first)? as usize;
        (idx < self.frames.len()).then_some(idx)
    }

    pub fn latest_frame(&self) -> Option<&Frame> {
        self.frames.back()
    }

    pub fn frames(&self) -> impl DoubleEndedIterator<Item = &Frame> {
        self.frames.iter()
    }

    pub fn num_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn num_active_features(&self) -> usize {
        self.active.len()
    }

    pub fn num_retired_features(&self) -> usize {
        self.retired.len()
    }

    pub fn active_features(&self) -> impl Iterator<Item = &Feature> {
        self.active.values()
    }

    /// Active or retired feature by id.
    pub fn feature(&self, id: TrackId) -> Option<&Feature> {
        self.active.get(&id).or_else(|| self.retired.get(&id))
    }

    pub fn is_active(&self, id: TrackId) -> bool {
        self.active.contains_key(&id)
    }

    pub fn set_exposure(&mut self, id: FrameId, exposure: f64) -> bool {
        match self.frame_mut(id) {
            Some(frame) => {
                frame.exposure_time = exposure;
                true
            }
            None => false,
        }
    }

    /// Pin a frame's exposure to a caller-supplied value. Later
    /// write-backs leave it alone.
    pub fn set_known_exposure(&mut self, id: FrameId, exposure: f64) -> bool {
        match self.frame_mut(id) {
            Some(frame) => {
                frame.exposure_time = exposure;
                frame.exposure_known = true;
                true
            }
            None => false,
        }
    }

    /// Write back exposures; frames marginalized meanwhile and frames
    /// with a known exposure are skipped. Returns how many frames were
    /// updated.
    pub fn apply_exposures(&mut self, exposures: &[(FrameId, f64)]) -> usize {
        exposures
            .iter()
            .filter(|&&(id, e)| {
                let known = self.frame(id).is_some_and(|f| f.exposure_known);
                !known && e.is_finite() && e > 0.0 && self.set_exposure(id, e)
            })
            .count()
    }

    /// Exposure of every frame in the window, oldest first.
    pub fn exposures(&self) -> Vec<(FrameId, f64)> {
        self.frames.iter().map(|f| (f.id, f.exposure_time)).collect()
    }

    /// Strided subsample of the window.
    pub fn keyframe_ids(&self) -> Vec<FrameId> {
        let spacing = self.limits.keyframe_spacing as u64;
        self.frames
            .iter()
            .map(|f| f.id)
            .filter(|id| id.0 % spacing == 0)
            .collect()
    }

    /// Per-track patch samples observed in `id`, sorted by track id.
    pub fn frame_samples(&self, id: FrameId) -> Option<FrameSamples<'_>> {
        let frame = self.frame(id)?;
        let mut samples: Vec<(TrackId, &PatchSamples)> = frame
            .features
            .iter()
            .filter_map(|&t| {
                let obs = self.feature(t)?.observation_in(id)?;
                Some((t, &obs.patch))
            })
            .collect();
        samples.sort_by_key(|&(t, _)| t);
        Some(FrameSamples {
            exposure: frame.exposure_time,
            samples,
        })
    }

    /// Self-consistent copy of the keyframes and the tracks seen in at
    /// least `min_keyframes_valid` of them.
    pub fn optimization_window(&self) -> OptimizationWindow {
        let keyframe_ids = self.keyframe_ids();
        let keyframes: Vec<WindowKeyframe> = keyframe_ids
            .iter()
            .filter_map(|&id| self.frame(id))
            .map(|f| WindowKeyframe {
                id: f.id,
                exposure: f.exposure_time,
                known: f.exposure_known,
            })
            .collect();

        let mut tracks = Vec::new();
        for feature in self.active.values().chain(self.retired.values()) {
            if feature.fully_saturated() {
                continue;
            }
            let observations: Vec<WindowObservation> = keyframes
                .iter()
                .enumerate()
                .filter_map(|(k, kf)| {
                    feature.observation_in(kf.id).map(|o| WindowObservation {
                        keyframe: k,
                        patch: o.patch.clone(),
                    })
                })
                .collect();
            if observations.len() >= self.limits.min_keyframes_valid.max(2) {
                tracks.push(WindowTrack {
                    id: feature.id,
                    observations,
                });
            }
        }

        OptimizationWindow {
            keyframes,
            tracks,
            frames: self
                .frames
                .iter()
                .map(|f| WindowFrame {
                    id: f.id,
                    exposure: f.exposure_time,
                    known: f.exposure_known,
                })
                .collect(),
            width: self.width,
            height: self.height,
            channels: self.channels,
        }
    }
}

/// A keyframe as seen by the optimizer.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowKeyframe {
    pub id: FrameId,
    pub exposure: f64,
    /// Caller-supplied exposure, held fixed by the optimizer.
    pub known: bool,
}

/// Exposure of one window frame at snapshot time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowFrame {
    pub id: FrameId,
    pub exposure: f64,
    pub known: bool,
}

/// One keyframe observation of a track.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowObservation {
    /// Index into `OptimizationWindow::keyframes`.
    pub keyframe: usize,
    pub patch: PatchSamples,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WindowTrack {
    pub id: TrackId,
    pub observations: Vec<WindowObservation>,
}

/// Immutable input of one optimization run.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizationWindow {
    pub keyframes: Vec<WindowKeyframe>,
    pub tracks: Vec<WindowTrack>,
    /// Every frame in the window, oldest first.
    pub frames: Vec<WindowFrame>,
    pub width: usize,
    pub height: usize,
    pub channels: usize,
}

impl OptimizationWindow {
    pub fn num_observations(&self) -> usize {
        self.tracks.iter().map(|t| t.observations.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Copy with keyframe and frame exposures replaced where `exposures`
    /// names them.
    pub fn with_exposures(&self, exposures: &[(FrameId, f64)]) -> Self {
        let lookup: BTreeMap<FrameId, f64> = exposures.iter().copied().collect();
        let mut out = self.clone();
        for kf in &mut out.keyframes {
            if let Some(&e) = lookup.get(&kf.id) {
                kf.exposure = e;
            }
        }
        for frame in &mut out.frames {
            if let Some(&new) = lookup.get(&frame.id) {
                frame.exposure = new;
            }
        }
        out
    }
}
