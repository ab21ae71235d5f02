// response.rs — Per-channel inverse camera response.
//
// The camera maps scene irradiance to an 8-bit intensity through a
// nonlinear response f. Calibration needs the inverse g = f⁻¹ evaluated
// at every observed intensity, so each channel stores g sampled at the
// 256 possible values (a plain lookup on the hot path) together with
// the 4 basis coefficients the optimizer works on.
//
// BASIS
//
// Over normalized intensity o ∈ [0, 1]:
//
//     g(o) = g0(o) + c0·h0(o) + c1·h1(o) + c2·h2(o) + c3·h3(o)
//
//     g0(o) = o^2.2                      typical inverse response
//     h0(o) = (o − g0(o)) / 6.1          pulls g0 toward linear
//     h1(o) = o(1−o)                     shape terms, all vanish
//     h2(o) = o(1−o)(2o−1)               at o = 0 and o = 1
//     h3(o) = o(1−o)(6o²−6o+1)
//
// Every member satisfies g(0) = 0 and g(1) = 1, which pins the overall
// irradiance scale, and [6.1, 0, 0, 0] is exactly the identity. The
// table is stored scaled by 255 so that the identity maps i → i.

use crate::error::ImageError;

/// Number of basis coefficients per channel.
pub const NUM_PARAMS: usize = 4;

/// Number of tabulated intensities.
pub const TABLE_SIZE: usize = 256;

/// Largest number of colour channels a model can hold.
pub const MAX_CHANNELS: usize = 3;

/// Coefficients that reproduce the identity response.
pub const IDENTITY_PARAMS: [f64; NUM_PARAMS] = [6.1, 0.0, 0.0, 0.0];

const MEAN_GAMMA: f64 = 2.2;

#[inline]
fn mean_curve(o: f64) -> f64 {
    o.powf(MEAN_GAMMA)
}

/// Value of basis function `k` at normalized intensity `o`.
pub fn basis(k: usize, o: f64) -> f64 {
    let o = o.clamp(0.0, 1.0);
    let bump = o * (1.0 - o);
    match k {
        0 => (o - mean_curve(o)) / IDENTITY_PARAMS[0],
        1 => bump,
        2 => bump * (2.0 * o - 1.0),
        3 => bump * (6.0 * o * o - 6.0 * o + 1.0),
        _ => panic!("basis index {k} out of range"),
    }
}

/// Derivative of basis function `k` with respect to `o`.
pub fn basis_derivative(k: usize, o: f64) -> f64 {
    let o = o.clamp(0.0, 1.0);
    match k {
        0 => (1.0 - mean_curve_derivative(o)) / IDENTITY_PARAMS[0],
        1 => 1.0 - 2.0 * o,
        2 => -6.0 * o * o + 6.0 * o - 1.0,
        3 => ((-24.0 * o + 36.0) * o - 14.0) * o + 1.0,
        _ => panic!("basis index {k} out of range"),
    }
}

#[inline]
fn mean_curve_derivative(o: f64) -> f64 {
    MEAN_GAMMA * o.powf(MEAN_GAMMA - 1.0)
}

/// Inverse response at normalized intensity `o` for coefficients `params`.
/// Output is normalized irradiance (1.0 at o = 1).
pub fn evaluate(params: &[f64; NUM_PARAMS], o: f64) -> f64 {
    let o = o.clamp(0.0, 1.0);
    let mut g = mean_curve(o);
    for (k, &c) in params.iter().enumerate() {
        g += c * basis(k, o);
    }
    g
}

/// Slope dg/do of the inverse response at `o`.
pub fn evaluate_derivative(params: &[f64; NUM_PARAMS], o: f64) -> f64 {
    let o = o.clamp(0.0, 1.0);
    let mut d = mean_curve_derivative(o);
    for (k, &c) in params.iter().enumerate() {
        d += c * basis_derivative(k, o);
    }
    d
}

/// Tabulate the curve at the 256 intensities, scaled to [0, 255],
/// anchored at both ends and forced non-decreasing.
///
/// The second value reports whether a projection back to monotone was needed.
pub fn tabulate(params: &[f64; NUM_PARAMS]) -> ([f64; TABLE_SIZE], bool) {
    let mut table = [0.0; TABLE_SIZE];
    for (i, t) in table.iter_mut().enumerate() {
        *t = 255.0 * evaluate(params, i as f64 / 255.0);
    }
    let projected = make_monotone(&mut table);
    (table, projected)
}

/// Running-max projection plus the end anchors. Returns true if any
/// interior value had to change.
fn make_monotone(table: &mut [f64; TABLE_SIZE]) -> bool {
    table[0] = 0.0;
    table[TABLE_SIZE - 1] = 255.0;
    let mut changed = false;
    for i in 1..TABLE_SIZE - 1 {
        let v = table[i].clamp(table[i - 1], 255.0);
        if v != table[i] {
            changed = true;
            table[i] = v;
        }
    }
    changed
}

/// Inverse response of a single colour channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelResponse {
    /// g(o) · 255 for o = 0..=255.
    inverse: [f64; TABLE_SIZE],
    /// Basis coefficients that generated `inverse` (or identity if the
    /// table was overwritten directly).
    params: [f64; NUM_PARAMS],
}

impl Default for ChannelResponse {
    fn default() -> Self {
        let mut inverse = [0.0; TABLE_SIZE];
        for (i, v) in inverse.iter_mut().enumerate() {
            *v = i as f64;
        }
        ChannelResponse {
            inverse,
            params: IDENTITY_PARAMS,
        }
    }
}

impl ChannelResponse {
    pub fn from_params(params: [f64; NUM_PARAMS]) -> Self {
        let (inverse, _) = tabulate(&params);
        ChannelResponse { inverse, params }
    }

    #[inline]
    pub fn remove_response(&self, o: u8) -> f64 {
        self.inverse[o as usize]
    }

    pub fn table(&self) -> &[f64; TABLE_SIZE] {
        &self.inverse
    }

    pub fn params(&self) -> [f64; NUM_PARAMS] {
        self.params
    }

    /// Forward response: irradiance on the [0, 255] scale → intensity.
    ///
    /// Inverts the table by binary search and linear interpolation.
    /// Flat table segments resolve to their first intensity.
    pub fn apply_response(&self, irradiance: f64) -> f64 {
        let t = &self.inverse;
        if irradiance <= t[0] {
            return 0.0;
        }
        if irradiance >= t[TABLE_SIZE - 1] {
            return 255.0;
        }
        // First index whose value is >= irradiance.
        let hi = t.partition_point(|&v| v < irradiance);
        let lo = hi - 1;
        let span = t[hi] - t[lo];
        if span <= f64::EPSILON {
            return hi as f64;
        }
        lo as f64 + (irradiance - t[lo]) / span
    }

    pub fn is_monotone(&self) -> bool {
        self.inverse.windows(2).all(|w| w[0] <= w[1])
    }
}

/// Inverse response for 1 (gray) or 3 (RGB) channels.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseModel {
    channels: [ChannelResponse; MAX_CHANNELS],
    num_channels: usize,
}

impl Default for ResponseModel {
    fn default() -> Self {
        Self::grayscale()
    }
}

impl ResponseModel {
    /// Identity response for `num_channels` channels (1 or 3).
    pub fn new(num_channels: usize) -> Result<Self, ImageError> {
        if num_channels != 1 && num_channels != MAX_CHANNELS {
            return Err(ImageError::UnsupportedChannels(num_channels));
        }
        Ok(ResponseModel {
            channels: Default::default(),
            num_channels,
        })
    }

    pub fn grayscale() -> Self {
        ResponseModel {
            channels: Default::default(),
            num_channels: 1,
        }
    }

    pub fn rgb() -> Self {
        ResponseModel {
            channels: Default::default(),
            num_channels: MAX_CHANNELS,
        }
    }

    /// Model built from per-channel basis coefficients.
    pub fn from_params(params: &[[f64; NUM_PARAMS]]) -> Result<Self, ImageError> {
        let mut model = Self::new(params.len())?;
        for (c, p) in params.iter().enumerate() {
            model.channels[c] = ChannelResponse::from_params(*p);
        }
        Ok(model)
    }

    #[inline]
    pub fn channels(&self) -> usize {
        self.num_channels
    }

    #[inline]
    pub fn channel(&self, channel: usize) -> &ChannelResponse {
        assert!(
            channel < self.num_channels,
            "channel {channel} out of range for {}-channel model",
            self.num_channels
        );
        &self.channels[channel]
    }

    /// g(o) on the [0, 255] scale.
    #[inline]
    pub fn remove_response(&self, o: u8, channel: usize) -> f64 {
        self.channel(channel).remove_response(o)
    }

    /// g(o) on the [0, 1] scale.
    #[inline]
    pub fn remove_response_normalized(&self, o: u8, channel: usize) -> f64 {
        self.remove_response(o, channel) / 255.0
    }

    /// f(irradiance) for irradiance on the [0, 255] scale.
    pub fn apply_response(&self, irradiance: f64, channel: usize) -> f64 {
        self.channel(channel).apply_response(irradiance)
    }

    /// Overwrite a channel's table from normalized values (`new_inverse[i]`
    /// in [0, 1]); stored scaled by 255.
    pub fn set_inverse_response_vector(&mut self, channel: usize, new_inverse: &[f64; TABLE_SIZE]) {
        assert!(channel < self.num_channels, "channel {channel} out of range");
        let entry = &mut self.channels[channel];
        for (dst, &v) in entry.inverse.iter_mut().zip(new_inverse.iter()) {
            *dst = 255.0 * v;
        }
    }

    /// Replace a channel's coefficients and re-derive its table.
    ///
    /// Returns true if the derived table had to be projected to monotone.
    pub fn set_grossberg_parameters(&mut self, channel: usize, params: [f64; NUM_PARAMS]) -> bool {
        assert!(channel < self.num_channels, "channel {channel} out of range");
        let (inverse, projected) = tabulate(&params);
        self.channels[channel] = ChannelResponse { inverse, params };
        projected
    }

    pub fn grossberg_parameters(&self, channel: usize) -> [f64; NUM_PARAMS] {
        self.channel(channel).params
    }

    pub fn inverse_response(&self, channel: usize) -> &[f64; TABLE_SIZE] {
        self.channel(channel).table()
    }

    pub fn is_monotone(&self) -> bool {
        self.channels[..self.num_channels].iter().all(ChannelResponse::is_monotone)
    }
}
