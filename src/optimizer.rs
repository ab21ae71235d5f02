// optimizer.rs — Joint refinement of response, vignette and exposures.
//
// For every pair of keyframe observations (i, j) of the same track, every
// channel c and every patch sample unclipped in both, the scene radiance
// must agree:
//
//     g_c(I_i) / (e_i · V(r_i)) = g_c(I_j) / (e_j · V(r_j))
//
// The residual is the log of that ratio divided by the mean slope of
// ln g at the two intensities:
//
//     d = ln g(o_i) − ln g(o_j) − (ℓ_i − ℓ_j) − ln V(r_i) + ln V(r_j)
//     ρ = d / ½ (g'(o_i)/g(o_i) + g'(o_j)/g(o_j))
//
// ρ is roughly the intensity mismatch in units of the full range. It
// cannot be shrunk by scaling radiances, nor by flattening or steepening
// the curve, so intensity noise does not bend the estimate.
//
// Unknowns, packed into one vector:
//
//     [ θ_0 (4) | θ_1 (4) | θ_2 (4) | v (3) | free ℓ_k ]
//
// θ_c are the response basis coefficients of channel c, v the vignette
// coefficients, ℓ_k = ln e_k the log exposures. Keyframes with a known
// exposure are held fixed; without any, keyframe 0 is. Ratios alone
// cannot tell g from g^γ with e^γ: two distinct known exposures settle
// γ, otherwise a weak pull of θ toward the identity picks it.
//
// The cost is the mean Huber loss of ρ plus that pull (and a pull of v
// toward no vignetting). It is minimized by reweighted least squares:
// each round fixes the Huber weights and hands √w-scaled rows plus the
// prior rows to Levenberg–Marquardt.

use std::cell::Cell;

use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt, TerminationReason};
use nalgebra::{storage::Owned, DMatrix, DVector, Dyn};
use tracing::{debug, info, warn};

use crate::config::CalibrationConfig;
use crate::database::OptimizationWindow;
use crate::error::OptimizeError;
use crate::feature::{is_saturated, FrameId};
use crate::response::{self, ResponseModel, IDENTITY_PARAMS, NUM_PARAMS};
use crate::vignette::{VignetteModel, NUM_VIGNETTE_PARAMS};

/// Reweighting rounds before the Huber weights are taken as settled.
const ROBUST_ROUNDS: usize = 8;
/// Relative change of the robust cost that ends the reweighting.
const ROBUST_TOL: f64 = 1e-6;
const LM_TOL: f64 = 1e-10;
/// Lower bound on g and V inside the logarithms.
const LOG_FLOOR: f64 = 1e-6;
/// Lower bound on the mean log-slope.
const SLOPE_FLOOR: f64 = 1e-3;

/// Output of a converged optimization.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizationResult {
    pub response: ResponseModel,
    pub vignette: VignetteModel,
    /// Refined exposure of every keyframe, in window order.
    pub keyframe_exposures: Vec<(FrameId, f64)>,
    /// Exposure of every frame in the window, keyframes included.
    pub exposures: Vec<(FrameId, f64)>,
    /// Levenberg–Marquardt iterations over all reweighting rounds.
    pub iterations: usize,
    pub initial_cost: f64,
    pub final_cost: f64,
    /// Residuals (sample pairs) in the problem.
    pub residuals: usize,
}

/// One unclipped sample pair, precomputed from the window.
#[derive(Debug, Clone, Copy)]
struct SamplePair {
    channel: usize,
    o1: f64,
    o2: f64,
    r1: f64,
    r2: f64,
    k1: usize,
    k2: usize,
}

/// Where a keyframe's log exposure comes from.
#[derive(Debug, Clone, Copy, PartialEq)]
enum ExposureSlot {
    Fixed(f64),
    Free(usize),
}

/// Parameter layout for a window.
#[derive(Debug, Clone)]
struct Layout {
    channels: usize,
    exposures: Vec<ExposureSlot>,
    len: usize,
}

impl Layout {
    fn new(window: &OptimizationWindow, channels: usize) -> Self {
        let log_e: Vec<f64> = window
            .keyframes
            .iter()
            .map(|kf| if kf.exposure.is_finite() && kf.exposure > 0.0 { kf.exposure.ln() } else { 0.0 })
            .collect();
        let any_known = window.keyframes.iter().any(|kf| kf.known);
        let mut next = channels * NUM_PARAMS + NUM_VIGNETTE_PARAMS;
        let exposures = window
            .keyframes
            .iter()
            .zip(&log_e)
            .enumerate()
            .map(|(k, (kf, &l))| {
                let fixed = if any_known { kf.known } else { k == 0 };
                if fixed {
                    ExposureSlot::Fixed(l)
                } else {
                    next += 1;
                    ExposureSlot::Free(next - 1)
                }
            })
            .collect();
        Layout {
            channels,
            exposures,
            len: next,
        }
    }

    fn response(&self, c: usize) -> usize {
        c * NUM_PARAMS
    }

    fn vignette(&self) -> usize {
        self.channels * NUM_PARAMS
    }

    fn exposure(&self, k: usize) -> Option<usize> {
        match self.exposures[k] {
            ExposureSlot::Free(i) => Some(i),
            ExposureSlot::Fixed(_) => None,
        }
    }

    fn log_exposure(&self, x: &DVector<f64>, k: usize) -> f64 {
        match self.exposures[k] {
            ExposureSlot::Free(i) => x[i],
            ExposureSlot::Fixed(l) => l,
        }
    }

    fn len(&self) -> usize {
        self.len
    }

    /// Prior-bearing block: response and vignette coefficients.
    fn prior_len(&self) -> usize {
        self.vignette() + NUM_VIGNETTE_PARAMS
    }

    fn response_params(&self, x: &DVector<f64>, c: usize) -> [f64; NUM_PARAMS] {
        let base = self.response(c);
        std::array::from_fn(|i| x[base + i])
    }

    fn vignette_params(&self, x: &DVector<f64>) -> [f64; NUM_VIGNETTE_PARAMS] {
        let base = self.vignette();
        std::array::from_fn(|i| x[base + i])
    }
}

/// Residual of one sample pair and its partial derivatives.
struct Linearized {
    r: f64,
    d_response: [f64; NUM_PARAMS],
    d_vignette: [f64; NUM_VIGNETTE_PARAMS],
    /// ∂ρ/∂ℓ_1; ∂ρ/∂ℓ_2 is its negative.
    d_log_exposure: f64,
}

fn floored(v: f64) -> (f64, bool) {
    if v > LOG_FLOOR {
        (v, false)
    } else {
        (LOG_FLOOR, true)
    }
}

fn linearize(x: &DVector<f64>, layout: &Layout, p: &SamplePair) -> Linearized {
    let params = layout.response_params(x, p.channel);
    let vignette = VignetteModel::new(layout.vignette_params(x));

    let (g1, g1_floored) = floored(response::evaluate(&params, p.o1));
    let (g2, g2_floored) = floored(response::evaluate(&params, p.o2));
    let slope1 = response::evaluate_derivative(&params, p.o1);
    let slope2 = response::evaluate_derivative(&params, p.o2);
    let (v1, v1_floored) = floored(vignette.at_radius(p.r1));
    let (v2, v2_floored) = floored(vignette.at_radius(p.r2));

    let d = g1.ln() - g2.ln() - (layout.log_exposure(x, p.k1) - layout.log_exposure(x, p.k2)) - v1.ln() + v2.ln();
    let q1 = slope1 / g1;
    let q2 = slope2 / g2;
    let mean_q = 0.5 * (q1 + q2);
    let scale = mean_q.max(SLOPE_FLOOR);
    let r = d / scale;

    let mut d_response = [0.0; NUM_PARAMS];
    for (k, out) in d_response.iter_mut().enumerate() {
        let b1 = if g1_floored { 0.0 } else { response::basis(k, p.o1) };
        let b2 = if g2_floored { 0.0 } else { response::basis(k, p.o2) };
        let dd = b1 / g1 - b2 / g2;
        let dq1 = response::basis_derivative(k, p.o1) / g1 - slope1 * b1 / (g1 * g1);
        let dq2 = response::basis_derivative(k, p.o2) / g2 - slope2 * b2 / (g2 * g2);
        let ds = if mean_q > SLOPE_FLOOR { 0.5 * (dq1 + dq2) } else { 0.0 };
        *out = dd / scale - d * ds / (scale * scale);
    }

    let grad1 = VignetteModel::gradient_at_radius(p.r1);
    let grad2 = VignetteModel::gradient_at_radius(p.r2);
    let mut d_vignette = [0.0; NUM_VIGNETTE_PARAMS];
    for (j, out) in d_vignette.iter_mut().enumerate() {
        let a = if v1_floored { 0.0 } else { grad1[j] / v1 };
        let b = if v2_floored { 0.0 } else { grad2[j] / v2 };
        *out = (b - a) / scale;
    }

    Linearized {
        r,
        d_response,
        d_vignette,
        d_log_exposure: -1.0 / scale,
    }
}

/// One reweighted least-squares round in the shape the LM solver wants.
struct RobustRound<'a> {
    layout: &'a Layout,
    pairs: &'a [SamplePair],
    /// √(w_i / N) per pair.
    row_weights: Vec<f64>,
    /// √(2λ).
    prior_scale: f64,
    prior_target: &'a DVector<f64>,
    params: DVector<f64>,
    jacobians: Cell<usize>,
    max_jacobians: usize,
}

impl RobustRound<'_> {
    fn capped(&self) -> bool {
        self.jacobians.get() >= self.max_jacobians
    }
}

impl LeastSquaresProblem<f64, Dyn, Dyn> for RobustRound<'_> {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;
    type ParameterStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, x: &DVector<f64>) {
        self.params.clone_from(x);
    }

    fn params(&self) -> DVector<f64> {
        self.params.clone()
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        let prior = self.layout.prior_len();
        let mut out = DVector::<f64>::zeros(self.pairs.len() + prior);
        for (i, (p, &w)) in self.pairs.iter().zip(&self.row_weights).enumerate() {
            out[i] = w * linearize(&self.params, self.layout, p).r;
        }
        for i in 0..prior {
            out[self.pairs.len() + i] = self.prior_scale * (self.params[i] - self.prior_target[i]);
        }
        out.iter().all(|v| v.is_finite()).then_some(out)
    }

    /// Every call is one LM iteration; past the cap the solver is stopped.
    fn jacobian(&self) -> Option<DMatrix<f64>> {
        if self.capped() {
            return None;
        }
        self.jacobians.set(self.jacobians.get() + 1);

        let layout = self.layout;
        let prior = layout.prior_len();
        let mut jac = DMatrix::<f64>::zeros(self.pairs.len() + prior, layout.len());
        for (i, (p, &w)) in self.pairs.iter().zip(&self.row_weights).enumerate() {
            let lin = linearize(&self.params, layout, p);
            let base = layout.response(p.channel);
            for (k, &d) in lin.d_response.iter().enumerate() {
                jac[(i, base + k)] = w * d;
            }
            for (k, &d) in lin.d_vignette.iter().enumerate() {
                jac[(i, layout.vignette() + k)] = w * d;
            }
            if let Some(col) = layout.exposure(p.k1) {
                jac[(i, col)] += w * lin.d_log_exposure;
            }
            if let Some(col) = layout.exposure(p.k2) {
                jac[(i, col)] -= w * lin.d_log_exposure;
            }
        }
        for i in 0..prior {
            jac[(self.pairs.len() + i, i)] = self.prior_scale;
        }
        Some(jac)
    }
}

#[derive(Debug, Clone)]
pub struct NonlinearOptimizer {
    /// Levenberg–Marquardt iterations allowed per reweighting round.
    pub max_iterations: usize,
    pub huber_delta: f64,
    pub prior_weight: f64,
}

impl From<&CalibrationConfig> for NonlinearOptimizer {
    fn from(config: &CalibrationConfig) -> Self {
        NonlinearOptimizer {
            max_iterations: config.max_optimizer_iterations,
            huber_delta: config.huber_delta,
            prior_weight: config.response_prior_weight,
        }
    }
}

impl NonlinearOptimizer {
    pub fn new(max_iterations: usize, huber_delta: f64, prior_weight: f64) -> Self {
        NonlinearOptimizer {
            max_iterations,
            huber_delta,
            prior_weight,
        }
    }

    /// Refine `response`, `vignette` and the window's exposures.
    ///
    /// On error the caller keeps its previous values; nothing here is
    /// shared or mutated.
    pub fn optimize(
        &self,
        window: &OptimizationWindow,
        response: &ResponseModel,
        vignette: &VignetteModel,
    ) -> Result<OptimizationResult, OptimizeError> {
        let k = window.keyframes.len();
        if k < 2 {
            return Err(OptimizeError::NotEnoughKeyframes(k));
        }
        let channels = window.channels.min(response.channels());
        let layout = Layout::new(window, channels);
        let pairs = collect_pairs(window, channels);
        if pairs.len() < layout.len() {
            return Err(OptimizeError::NotEnoughResiduals {
                needed: layout.len(),
                got: pairs.len(),
            });
        }

        let mut x = DVector::<f64>::zeros(layout.len());
        for c in 0..channels {
            for (i, &v) in response.grossberg_parameters(c).iter().enumerate() {
                x[layout.response(c) + i] = v;
            }
        }
        for (i, &v) in vignette.coefficients.iter().enumerate() {
            x[layout.vignette() + i] = v;
        }
        for (kf, w) in window.keyframes.iter().enumerate() {
            if let Some(idx) = layout.exposure(kf) {
                x[idx] = if w.exposure.is_finite() && w.exposure > 0.0 { w.exposure.ln() } else { 0.0 };
            }
        }
        let target = prior_target(&layout);

        let initial_cost = self.cost(&x, &layout, &pairs, &target);
        if !initial_cost.is_finite() {
            return Err(OptimizeError::Diverged(0));
        }
        let lm = LevenbergMarquardt::new()
            .with_ftol(LM_TOL)
            .with_xtol(LM_TOL)
            .with_patience(self.max_iterations.max(1));

        let mut cost = initial_cost;
        let mut iterations = 0;
        for round in 0..ROBUST_ROUNDS {
            let scale = 1.0 / pairs.len() as f64;
            let row_weights = pairs
                .iter()
                .map(|p| (self.weight(linearize(&x, &layout, p).r) * scale).sqrt())
                .collect();
            let problem = RobustRound {
                layout: &layout,
                pairs: &pairs,
                row_weights,
                prior_scale: (2.0 * self.prior_weight).sqrt(),
                prior_target: &target,
                params: x.clone(),
                jacobians: Cell::new(0),
                max_jacobians: self.max_iterations,
            };
            let (problem, report) = lm.minimize(problem);
            iterations += problem.jacobians.get();

            match report.termination {
                ref t if t.was_successful() => {}
                // Already at a stationary point of this round.
                TerminationReason::NoImprovementPossible(_) => {}
                TerminationReason::User(_) | TerminationReason::LostPatience if problem.capped() => {
                    let cost = self.cost(&problem.params(), &layout, &pairs, &target);
                    warn!(iterations, cost, "optimizer hit the iteration cap");
                    return Err(OptimizeError::NotConverged { iterations, cost });
                }
                TerminationReason::LostPatience => {
                    return Err(OptimizeError::NotConverged {
                        iterations,
                        cost: report.objective_function,
                    });
                }
                TerminationReason::User(_) => return Err(OptimizeError::Diverged(iterations)),
                TerminationReason::Numerical(what) => return Err(OptimizeError::Numerical(what)),
                other => {
                    warn!(?other, "unexpected solver termination");
                    return Err(OptimizeError::Numerical("solver setup"));
                }
            }

            let candidate = problem.params();
            let new_cost = self.cost(&candidate, &layout, &pairs, &target);
            if !new_cost.is_finite() {
                return Err(OptimizeError::Diverged(iterations));
            }
            debug!(round, evaluations = report.number_of_evaluations, cost = new_cost, "reweighting round");
            let settled = (cost - new_cost).abs() <= ROBUST_TOL * cost.max(f64::MIN_POSITIVE);
            x = candidate;
            cost = new_cost;
            if settled {
                break;
            }
        }

        let mut new_response = response.clone();
        for c in 0..channels {
            if new_response.set_grossberg_parameters(c, layout.response_params(&x, c)) {
                warn!(channel = c, "response projected back to monotone");
            }
        }
        let coefficients = layout.vignette_params(&x);
        let new_vignette = VignetteModel::new(coefficients);
        if !new_vignette.is_physical() {
            warn!(?coefficients, "vignette estimate is not physical");
        }

        let keyframe_exposures: Vec<(FrameId, f64)> = window
            .keyframes
            .iter()
            .enumerate()
            .map(|(kf, w)| (w.id, layout.log_exposure(&x, kf).exp()))
            .collect();
        let exposures = interpolate_exposures(window, &keyframe_exposures);

        info!(
            iterations,
            initial_cost,
            final_cost = cost,
            residuals = pairs.len(),
            keyframes = k,
            "optimization converged"
        );
        Ok(OptimizationResult {
            response: new_response,
            vignette: new_vignette,
            keyframe_exposures,
            exposures,
            iterations,
            initial_cost,
            final_cost: cost,
            residuals: pairs.len(),
        })
    }

    fn huber(&self, r: f64) -> f64 {
        let a = r.abs();
        if a <= self.huber_delta {
            0.5 * r * r
        } else {
            self.huber_delta * (a - 0.5 * self.huber_delta)
        }
    }

    fn weight(&self, r: f64) -> f64 {
        let a = r.abs();
        if a <= self.huber_delta {
            1.0
        } else {
            self.huber_delta / a
        }
    }

    /// Mean Huber loss plus the prior.
    fn cost(&self, x: &DVector<f64>, layout: &Layout, pairs: &[SamplePair], target: &DVector<f64>) -> f64 {
        let data: f64 = pairs.iter().map(|p| self.huber(linearize(x, layout, p).r)).sum::<f64>() / pairs.len() as f64;
        let prior: f64 = (0..layout.prior_len()).map(|i| (x[i] - target[i]).powi(2)).sum();
        data + self.prior_weight * prior
    }
}

fn prior_target(layout: &Layout) -> DVector<f64> {
    let mut t = DVector::<f64>::zeros(layout.len());
    for c in 0..layout.channels {
        for (i, &v) in IDENTITY_PARAMS.iter().enumerate() {
            t[layout.response(c) + i] = v;
        }
    }
    t
}

/// Every unclipped sample pair between keyframe observations of a track.
fn collect_pairs(window: &OptimizationWindow, channels: usize) -> Vec<SamplePair> {
    let mut pairs = Vec::new();
    for track in &window.tracks {
        let obs = &track.observations;
        for (a, oa) in obs.iter().enumerate() {
            for ob in &obs[a + 1..] {
                if oa.keyframe == ob.keyframe {
                    continue;
                }
                let n = oa.patch.len().min(ob.patch.len());
                for c in 0..channels.min(oa.patch.raw.len()).min(ob.patch.raw.len()) {
                    for s in 0..n {
                        let i1 = oa.patch.raw_sample(c, s);
                        let i2 = ob.patch.raw_sample(c, s);
                        if is_saturated(i1) || is_saturated(i2) {
                            continue;
                        }
                        let (x1, y1) = oa.patch.sample_position(s);
                        let (x2, y2) = ob.patch.sample_position(s);
                        pairs.push(SamplePair {
                            channel: c,
                            o1: i1 as f64 / 255.0,
                            o2: i2 as f64 / 255.0,
                            r1: VignetteModel::radius(x1 as f64, y1 as f64, window.width, window.height),
                            r2: VignetteModel::radius(x2 as f64, y2 as f64, window.width, window.height),
                            k1: oa.keyframe,
                            k2: ob.keyframe,
                        });
                    }
                }
            }
        }
    }
    pairs
}

/// Exposures for every frame of the window. Keyframes take their refined
/// value and known frames keep theirs; other frames keep their previous
/// estimate scaled by the log-linear interpolation of the neighbouring
/// keyframes' correction factors (nearest keyframe outside the span).
fn interpolate_exposures(window: &OptimizationWindow, keyframes: &[(FrameId, f64)]) -> Vec<(FrameId, f64)> {
    let corrections: Vec<(u64, f64)> = window
        .keyframes
        .iter()
        .zip(keyframes)
        .map(|(old, &(id, new))| {
            let prev = if old.exposure > 0.0 && old.exposure.is_finite() { old.exposure } else { 1.0 };
            (id.0, (new / prev).ln())
        })
        .collect();

    window
        .frames
        .iter()
        .map(|frame| {
            let (id, prev) = (frame.id, frame.exposure);
            if let Some(&(_, e)) = keyframes.iter().find(|&&(k, _)| k == id) {
                return (id, e);
            }
            if frame.known {
                return (id, prev);
            }
            let f = id.0;
            let after = corrections.partition_point(|&(k, _)| k < f);
            let log_c = if after == 0 {
                corrections[0].1
            } else if after == corrections.len() {
                corrections[after - 1].1
            } else {
                let (ka, ca) = corrections[after - 1];
                let (kb, cb) = corrections[after];
                let t = (f - ka) as f64 / (kb - ka) as f64;
                ca + t * (cb - ca)
            };
            let prev = if prev > 0.0 && prev.is_finite() { prev } else { 1.0 };
            (id, prev * log_c.exp())
        })
        .collect()
}
