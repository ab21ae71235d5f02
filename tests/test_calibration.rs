// tests/test_calibration.rs — End-to-end calibration on synthetic sequences.
//
// A textured radiance map is panned under a camera with exposure steps.
// The calibrator has to recover the exposure ratios and the response
// from tracking alone: the identity for a linear camera, a gamma curve
// when two exposures are supplied.

use photocal::database;
use photocal::feature::FrameId;
use photocal::image::{ColorImage, Image};
use photocal::{CalibrationConfig, CalibrationMode, Calibrator};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const W: usize = 160;
const H: usize = 120;

fn radiance(x: f64, y: f64) -> f64 {
    65.0 + 28.0 * (x / 3.1 + 0.3 * (y / 7.0).sin()).sin() * (y / 4.3).cos()
        + 12.0 * ((x + 2.0 * y) / 5.7).sin()
        + 6.0 * (x / 11.0).cos()
}

/// Frame of a linear camera: o = e · L, panned `pan` pixels, plus noise.
fn render(pan: usize, exposure: f64, noise: Option<(&mut StdRng, f64)>) -> ColorImage {
    let mut noise = noise;
    ColorImage::gray(Image::from_fn(W, H, |x, y| {
        let mut v = exposure * radiance((x + pan) as f64, y as f64);
        if let Some((rng, sigma)) = noise.as_mut() {
            // Box–Muller.
            let u1: f64 = rng.gen_range(1e-12..1.0);
            let u2: f64 = rng.gen();
            v += *sigma * (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
        }
        v.round().clamp(0.0, 255.0) as u8
    }))
}

/// Frame of a gamma camera: o = 255 · (e · L / 255)^(1/2.2), panned.
fn render_gamma(pan: usize, exposure: f64) -> ColorImage {
    ColorImage::gray(Image::from_fn(W, H, |x, y| {
        let irradiance = (exposure * radiance((x + pan) as f64, y as f64) / 255.0).clamp(0.0, 1.0);
        (255.0 * irradiance.powf(1.0 / 2.2)).round() as u8
    }))
}

fn config(mode: CalibrationMode) -> CalibrationConfig {
    CalibrationConfig {
        nr_active_features: 150,
        tracker_patch_size: 2,
        nr_pyramid_levels: 3,
        nr_active_frames: 40,
        keyframe_spacing: 4,
        min_keyframes_valid: 2,
        min_gradient: 4.0,
        min_feature_distance: 6,
        max_optimizer_iterations: 100,
        nr_images_rapid_exp: 2,
        calibration_mode: mode,
        ..Default::default()
    }
}

fn exposure_of(exposures: &[(FrameId, f64)], id: u64) -> f64 {
    exposures
        .iter()
        .find(|&&(f, _)| f == FrameId(id))
        .map(|&(_, e)| e)
        .unwrap()
}

#[test]
fn known_exposure_steps_are_recovered() {
    let steps = [1.0, 1.5, 2.0];
    let mut cal = Calibrator::new(config(CalibrationMode::Batch), W, H, 1).unwrap();
    for i in 0..24 {
        let e = steps[(i / 4) % 3];
        cal.process_frame(&render(i, e, None), i as f64 / 30.0).unwrap();
    }
    let model = cal.finish().unwrap();
    assert_eq!(model.generation, 1);

    let exposures = cal.exposures();
    let e0 = exposure_of(&exposures, 0);
    for k in [4u64, 8, 12, 16, 20] {
        let truth = steps[(k as usize / 4) % 3];
        let ratio = exposure_of(&exposures, k) / e0;
        assert!((ratio - truth).abs() <= 0.05 * truth, "keyframe {k}: ratio {ratio} vs {truth}");
    }
    // Non-keyframes inherit consistent values too.
    let ratio = exposure_of(&exposures, 9) / e0;
    assert!((ratio - 2.0).abs() <= 0.1, "frame 9: {ratio}");

    for o in 0..=255u8 {
        let g = model.response.remove_response(o, 0);
        assert!((g - o as f64).abs() <= 0.05 * 255.0, "g({o}) = {g}");
    }
}

#[test]
fn gamma_response_is_recovered_from_known_exposures() {
    let steps = [1.0, 1.5, 2.0];
    let mut cal = Calibrator::new(config(CalibrationMode::Batch), W, H, 1).unwrap();
    for i in 0..24 {
        let e = steps[(i / 4) % 3];
        let img = render_gamma(i, e);
        if i < 8 {
            cal.process_frame_with_exposure(&img, i as f64 / 30.0, e).unwrap();
        } else {
            cal.process_frame(&img, i as f64 / 30.0).unwrap();
        }
    }
    let model = cal.finish().unwrap();

    let exposures = cal.exposures();
    assert_eq!(exposure_of(&exposures, 0), 1.0);
    assert_eq!(exposure_of(&exposures, 4), 1.5);
    for k in [8u64, 12, 16, 20] {
        let truth = steps[(k as usize / 4) % 3];
        let e = exposure_of(&exposures, k);
        assert!((e - truth).abs() <= 0.05 * truth, "keyframe {k}: {e} vs {truth}");
    }

    assert!(model.response.is_monotone());
    for o in 0..=255u8 {
        let g = model.response.remove_response(o, 0);
        let truth = 255.0 * (o as f64 / 255.0).powf(2.2);
        assert!((g - truth).abs() <= 0.05 * 255.0, "g({o}) = {g}, want {truth}");
    }
    // Far from the identity in mid-grey.
    assert!(model.response.remove_response(128, 0) < 80.0);
}

#[test]
fn static_noisy_scene_stays_near_identity() {
    let mut rng = StdRng::seed_from_u64(21);
    let mut cal = Calibrator::new(config(CalibrationMode::Batch), W, H, 1).unwrap();
    for i in 0..20 {
        cal.process_frame(&render(0, 1.0, Some((&mut rng, 2.0))), i as f64).unwrap();
    }
    let model = cal.finish().unwrap();
    let exposures = cal.exposures();
    let e0 = exposure_of(&exposures, 0);
    for &(_, e) in &exposures {
        assert!((e / e0 - 1.0).abs() < 0.03, "exposure ratio {}", e / e0);
    }
    for o in (0..=255u8).step_by(5) {
        let g = model.response.remove_response(o, 0);
        assert!((g - o as f64).abs() < 0.05 * 255.0, "g({o}) = {g}");
    }
}

#[test]
fn online_run_never_exceeds_bounds() {
    let mut rng = StdRng::seed_from_u64(5);
    let mut cfg = config(CalibrationMode::Online);
    cfg.nr_active_frames = 16;
    cfg.nr_active_features = 60;
    cfg.optimize_every = 1;
    let mut cal = Calibrator::new(cfg, W, H, 1).unwrap();

    let mut pan = 0usize;
    for i in 0..60 {
        // Occasional cuts to a different part of the radiance map.
        if rng.gen_bool(0.05) {
            pan += 200;
        }
        pan += 1;
        let e = 1.0 + 0.5 * ((i / 8) % 2) as f64;
        cal.process_frame(&render(pan, e, None), i as f64).unwrap();
        let db = database::lock(cal.database());
        assert!(db.num_frames() <= 16);
        assert!(db.num_active_features() <= 60);
    }
    let model = cal.finish().unwrap();
    assert!(model.response.is_monotone());
    assert!(cal.exposures().iter().all(|&(_, e)| e.is_finite() && e > 0.0));
}
