// benches/benchmarks.rs -- Per-stage and full-pipeline benchmarks.
//
//   cargo bench
//
// All inputs are synthetic: a textured radiance map panned under a linear
// camera with stepped exposure.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use photocal::database;
use photocal::feature::PatchSamples;
use photocal::image::{ColorImage, Image};
use photocal::klt::KltTracker;
use photocal::optimizer::NonlinearOptimizer;
use photocal::pyramid::Pyramid;
use photocal::{CalibrationConfig, CalibrationMode, Calibrator};

// ============================================================
// Helpers
// ============================================================

fn make_scene(w: usize, h: usize, pan: usize, gain: f32) -> Image<u8> {
    Image::from_fn(w, h, |x, y| {
        let xf = (x + pan) as f32;
        let yf = y as f32;
        let v = 65.0
            + 28.0 * (xf / 3.1 + 0.3 * (yf / 7.0).sin()).sin() * (yf / 4.3).cos()
            + 12.0 * ((xf + 2.0 * yf) / 5.7).sin();
        (v * gain).round().clamp(0.0, 255.0) as u8
    })
}

fn bench_config() -> CalibrationConfig {
    CalibrationConfig {
        nr_active_features: 200,
        nr_active_frames: 40,
        keyframe_spacing: 4,
        min_keyframes_valid: 2,
        min_gradient: 4.0,
        calibration_mode: CalibrationMode::Batch,
        ..Default::default()
    }
}

// ============================================================
// Per-stage benchmarks
// ============================================================

fn bench_pyramid(c: &mut Criterion) {
    let img = make_scene(640, 480, 0, 1.0);

    let mut group = c.benchmark_group("pyramid");
    group.bench_function("build_3level_640x480", |b| b.iter(|| Pyramid::build(&img, 3, 1.0)));
    group.finish();
}

fn bench_klt(c: &mut Criterion) {
    let prev = make_scene(640, 480, 0, 1.0);
    let curr = make_scene(640, 480, 3, 1.4);
    let prev_pyr = Pyramid::build(&prev, 3, 1.0);
    let curr_pyr = Pyramid::build(&curr, 3, 1.0);
    let color = ColorImage::gray(prev);

    let points: Vec<(f32, f32)> = (0..10)
        .flat_map(|gy| (0..20).map(move |gx| (20.0 + gx as f32 * 30.0, 20.0 + gy as f32 * 44.0)))
        .collect();
    let templates: Vec<PatchSamples> = points
        .iter()
        .map(|&(x, y)| PatchSamples::capture(&color, &prev_pyr, x, y, 2))
        .collect();
    let tracker = KltTracker::new(2, 30, 0.01, 3, 15.0);

    let mut group = c.benchmark_group("klt");
    group.bench_function(BenchmarkId::new("gain_robust", format!("{}feat_3pyr", points.len())), |b| {
        b.iter(|| {
            templates
                .iter()
                .zip(&points)
                .filter(|&(t, &(x, y))| tracker.track(t, x, y, &curr_pyr).status.is_tracked())
                .count()
        })
    });
    group.finish();
}

// ============================================================
// Pipeline benchmarks
// ============================================================

fn bench_tracking(c: &mut Criterion) {
    let frames: Vec<ColorImage> = (0..20)
        .map(|i| ColorImage::gray(make_scene(640, 480, i, 1.0 + 0.5 * ((i / 4) % 2) as f32)))
        .collect();

    let mut group = c.benchmark_group("tracker");
    group.sample_size(10);
    group.bench_function("process_20_frames_640x480", |b| {
        b.iter(|| {
            let mut cal = Calibrator::new(bench_config(), 640, 480, 1).unwrap();
            for (i, f) in frames.iter().enumerate() {
                cal.process_frame(f, i as f64).unwrap();
            }
            cal.frames_processed()
        })
    });
    group.finish();
}

fn bench_optimizer(c: &mut Criterion) {
    let config = bench_config();
    let mut cal = Calibrator::new(config.clone(), 320, 240, 1).unwrap();
    for i in 0..24 {
        let gain = [1.0, 1.5, 2.0][(i / 4) % 3];
        cal.process_frame(&ColorImage::gray(make_scene(320, 240, i, gain)), i as f64).unwrap();
    }
    let window = database::lock(cal.database()).optimization_window();
    let model = cal.model();
    let optimizer = NonlinearOptimizer::from(&config);

    let mut group = c.benchmark_group("optimizer");
    group.sample_size(10);
    group.bench_function(
        BenchmarkId::new("lm", format!("{}kf_{}obs", window.keyframes.len(), window.num_observations())),
        |b| b.iter(|| optimizer.optimize(&window, &model.response, &model.vignette)),
    );
    group.finish();
}

criterion_group!(stages, bench_pyramid, bench_klt);
criterion_group!(pipeline, bench_tracking, bench_optimizer);
criterion_main!(stages, pipeline);
