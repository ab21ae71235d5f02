// tests/test_tracker.rs — Integration tests for the per-frame tracking loop.

use std::sync::Arc;

use photocal::database::{self, Database, DatabaseLimits};
use photocal::image::{ColorImage, Image};
use photocal::model::{ModelStore, PhotometricModel};
use photocal::response::ResponseModel;
use photocal::tracker::Tracker;
use photocal::{CalibrationConfig, ImageError};

const W: usize = 160;
const H: usize = 120;

/// Textured radiance map sampled with an integer pan and an exposure gain.
fn make_scene(pan: usize, gain: f32) -> Image<u8> {
    Image::from_fn(W, H, |x, y| {
        let xf = (x + pan) as f32;
        let yf = y as f32;
        let v = 65.0
            + 28.0 * (xf / 3.1 + 0.3 * (yf / 7.0).sin()).sin() * (yf / 4.3).cos()
            + 12.0 * ((xf + 2.0 * yf) / 5.7).sin();
        (v * gain).round().clamp(0.0, 255.0) as u8
    })
}

fn config() -> CalibrationConfig {
    CalibrationConfig {
        nr_active_features: 150,
        tracker_patch_size: 2,
        nr_pyramid_levels: 3,
        nr_active_frames: 20,
        keyframe_spacing: 4,
        min_keyframes_valid: 2,
        min_gradient: 4.0,
        min_feature_distance: 6,
        nr_images_rapid_exp: 1,
        ..Default::default()
    }
}

fn make_tracker(config: CalibrationConfig, channels: usize) -> Tracker {
    let db = Database::new(DatabaseLimits::from(&config), W, H, channels).shared();
    let response = ResponseModel::new(channels).unwrap();
    let models = Arc::new(ModelStore::new(PhotometricModel::identity(response)));
    Tracker::new(config, W, H, channels, db, models).unwrap()
}

#[test]
fn ten_frame_pan_keeps_bounds_and_tracks() {
    let mut tracker = make_tracker(config(), 1);
    for i in 0..10 {
        let report = tracker.process_frame(&ColorImage::gray(make_scene(i, 1.0)), i as f64 / 30.0).unwrap();
        if i == 0 {
            assert!(report.new_features > 0, "first frame must extract");
            assert_eq!(report.tracked, 0);
        } else {
            assert!(report.tracked > report.lost, "frame {i}: {report:?}");
        }
        assert!(report.active_features <= 150);

        let db = database::lock(tracker.database());
        assert!(db.num_frames() <= 20);
        assert!(db.num_active_features() <= 150);
    }
}

#[test]
fn tracks_follow_the_pan() {
    let mut tracker = make_tracker(config(), 1);
    for i in 0..4 {
        tracker.process_frame(&ColorImage::gray(make_scene(i, 1.0)), i as f64).unwrap();
    }
    let db = database::lock(tracker.database());
    let mut checked = 0;
    for f in db.active_features() {
        for w in f.observations().windows(2) {
            // The scene moves one pixel left per frame.
            assert!((w[1].x - w[0].x + 1.0).abs() < 0.25, "dx = {}", w[1].x - w[0].x);
            assert!((w[1].y - w[0].y).abs() < 0.25);
            checked += 1;
        }
    }
    assert!(checked > 50);
}

#[test]
fn rapid_exposure_follows_gain_steps() {
    let mut tracker = make_tracker(config(), 1);
    let gains = [1.0f32, 1.0, 1.5, 1.5, 2.0, 1.0];
    let mut exposures = Vec::new();
    for (i, &g) in gains.iter().enumerate() {
        let r = tracker.process_frame(&ColorImage::gray(make_scene(i, g)), i as f64).unwrap();
        exposures.push(r.exposure);
    }
    for (e, &g) in exposures.iter().zip(&gains) {
        assert!((e - g as f64).abs() < 0.05 * g as f64, "exposure {e} vs gain {g}");
    }
}

#[test]
fn rgb_session_tracks_on_luminance() {
    let mut tracker = make_tracker(config(), 3);
    for i in 0..3 {
        let base = make_scene(i, 1.0);
        let planes = vec![base.clone(), base.map(|v| v / 2 + 20), base.map(|v| v.saturating_add(30))];
        let report = tracker
            .process_frame(&ColorImage::from_planes(planes).unwrap(), i as f64)
            .unwrap();
        if i > 0 {
            assert!(report.tracked > 0);
        }
    }
    let db = database::lock(tracker.database());
    let f = db.active_features().next().unwrap();
    assert_eq!(f.observations()[0].patch.raw.len(), 3);
}

#[test]
fn malformed_frames_are_reported_and_ignored() {
    let mut tracker = make_tracker(config(), 1);
    tracker.process_frame(&ColorImage::gray(make_scene(0, 1.0)), 0.0).unwrap();
    let (frames, active) = {
        let db = database::lock(tracker.database());
        (db.num_frames(), db.num_active_features())
    };

    let empty = ColorImage::gray(Image::new(0, 0));
    assert!(matches!(tracker.process_frame(&empty, 1.0), Err(ImageError::Empty { .. })));
    let wrong = ColorImage::gray(Image::new(W, H / 2));
    assert!(matches!(
        tracker.process_frame(&wrong, 1.0),
        Err(ImageError::DimensionMismatch { .. })
    ));

    let db = database::lock(tracker.database());
    assert_eq!(db.num_frames(), frames);
    assert_eq!(db.num_active_features(), active);
}

#[test]
fn scene_cut_kills_tracks_and_replenishes() {
    let mut tracker = make_tracker(config(), 1);
    tracker.process_frame(&ColorImage::gray(make_scene(0, 1.0)), 0.0).unwrap();
    let cut = Image::from_fn(W, H, |x, y| if (x / 7 + y / 5) % 2 == 0 { 40u8 } else { 120 });
    let report = tracker.process_frame(&ColorImage::gray(cut), 1.0).unwrap();
    assert!(report.lost > report.tracked, "{report:?}");
    assert!(report.new_features > 0);
    assert!(report.active_features <= 150);
}
