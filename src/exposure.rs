// exposure.rs — Closed-form exposure estimate between frames.
//
// For features seen in both frames the same scene radiance L produced
// both patches: g(I_new) = e_new·V·L and g(I_old) = e_old·V·L. A feature
// moves little between nearby frames, so V cancels and
//
//     e_new / e_old ≈ Σ g(I_new) / Σ g(I_old)
//
// summed over every non-saturated sample of every channel of every
// shared feature. Too few samples (a cut, mass tracking failure) give
// no trustworthy ratio, and the estimate falls back to "no change".

use crate::feature::{is_saturated, PatchSamples, TrackId};
use crate::response::ResponseModel;

/// Patch samples of one frame, sorted by track id.
#[derive(Debug, Clone)]
pub struct FrameSamples<'a> {
    /// Exposure currently assigned to the frame.
    pub exposure: f64,
    pub samples: Vec<(TrackId, &'a PatchSamples)>,
}

impl<'a> FrameSamples<'a> {
    /// Build from unsorted pairs.
    pub fn new(exposure: f64, mut samples: Vec<(TrackId, &'a PatchSamples)>) -> Self {
        samples.sort_by_key(|&(t, _)| t);
        FrameSamples { exposure, samples }
    }
}

/// Ratio of two frames' exposures and the evidence behind it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExposureRatio {
    pub ratio: f64,
    /// Valid sample pairs summed.
    pub samples: usize,
}

#[derive(Debug, Clone)]
pub struct RapidExposureTimeEstimator {
    /// Valid shared samples needed before a ratio is trusted.
    pub min_samples: usize,
    /// Previous frames combined by `estimate_windowed`.
    pub window: usize,
}

impl RapidExposureTimeEstimator {
    pub fn new(min_samples: usize, window: usize) -> Self {
        RapidExposureTimeEstimator { min_samples, window }
    }

    /// Sum radiance over samples both frames see unclipped.
    fn ratio(&self, new: &FrameSamples<'_>, previous: &FrameSamples<'_>, response: &ResponseModel) -> Option<ExposureRatio> {
        let mut sum_new = 0.0;
        let mut sum_old = 0.0;
        let mut count = 0usize;

        // Merge-join on the sorted track ids.
        let (mut i, mut j) = (0, 0);
        while i < new.samples.len() && j < previous.samples.len() {
            let (tn, pn) = new.samples[i];
            let (to, po) = previous.samples[j];
            if tn < to {
                i += 1;
                continue;
            }
            if to < tn {
                j += 1;
                continue;
            }
            let channels = pn.raw.len().min(po.raw.len()).min(response.channels());
            for c in 0..channels {
                for (&a, &b) in pn.raw[c].iter().zip(&po.raw[c]) {
                    if is_saturated(a) || is_saturated(b) {
                        continue;
                    }
                    sum_new += response.remove_response(a, c);
                    sum_old += response.remove_response(b, c);
                    count += 1;
                }
            }
            i += 1;
            j += 1;
        }

        if count < self.min_samples.max(1) || sum_old <= f64::EPSILON || sum_new <= f64::EPSILON {
            return None;
        }
        Some(ExposureRatio {
            ratio: sum_new / sum_old,
            samples: count,
        })
    }

    /// Exposure of `new` relative to `previous`; 1.0 when the two frames
    /// share too few valid samples.
    pub fn estimate(&self, new: &FrameSamples<'_>, previous: &FrameSamples<'_>, response: &ResponseModel) -> f64 {
        self.ratio(new, previous, response).map_or(1.0, |r| r.ratio)
    }

    /// Absolute exposure of `new` from the most recent frames of
    /// `history` (newest first). Each contributing frame votes
    /// `e_prev · ratio`; votes are combined by a sample-weighted geometric
    /// mean. Without any vote the newest previous exposure is kept, or
    /// 1.0 if there is no history at all.
    pub fn estimate_windowed(&self, new: &FrameSamples<'_>, history: &[FrameSamples<'_>], response: &ResponseModel) -> f64 {
        let mut log_sum = 0.0;
        let mut weight = 0.0;
        for prev in history.iter().take(self.window) {
            if !(prev.exposure.is_finite() && prev.exposure > 0.0) {
                continue;
            }
            if let Some(r) = self.ratio(new, prev, response) {
                let w = r.samples as f64;
                log_sum += w * (prev.exposure * r.ratio).ln();
                weight += w;
            }
        }
        if weight > 0.0 {
            (log_sum / weight).exp()
        } else {
            history.first().map_or(1.0, |p| p.exposure)
        }
    }
}
