// tests/test_database.rs — Lifecycle and bound invariants of the frame/feature database.

use photocal::database::{Database, DatabaseLimits};
use photocal::feature::{FrameId, Observation, PatchSamples, TrackId};
use photocal::frame::Frame;
use photocal::image::{ColorImage, Image};
use photocal::pyramid::Pyramid;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn limits() -> DatabaseLimits {
    DatabaseLimits {
        nr_active_frames: 12,
        nr_active_features: 25,
        keyframe_spacing: 3,
        min_keyframes_valid: 3,
    }
}

fn frame() -> Frame {
    let gray = Image::filled(32, 32, 90u8);
    Frame::new(
        0.0,
        ColorImage::gray(gray.clone()),
        gray.clone(),
        Image::new(32, 32),
        Pyramid::build(&gray, 1, 1.0),
    )
}

fn obs(frame: FrameId, x: f32, y: f32, value: u8) -> Observation {
    Observation {
        frame_id: frame,
        x,
        y,
        gradient: 12.0,
        patch: PatchSamples {
            half_size: 1,
            levels: vec![vec![value as f32; 9]],
            raw: vec![vec![value; 9]],
            origin: (x.round() as i64, y.round() as i64),
        },
    }
}

#[test]
fn random_lifecycle_respects_bounds_and_never_resurrects() {
    let mut rng = StdRng::seed_from_u64(7);
    let mut db = Database::new(limits(), 32, 32, 1);
    let mut killed: Vec<TrackId> = Vec::new();

    for _ in 0..200 {
        let f = db.add_frame(frame());

        // Propagate or kill each active feature.
        let active: Vec<TrackId> = db.active_features().map(|f| f.id).collect();
        for id in active {
            if rng.gen_bool(0.15) {
                assert!(db.kill_feature(id));
                killed.push(id);
            } else {
                let v = rng.gen_range(10..240);
                assert!(db.add_observation(id, obs(f, 16.0, 16.0, v)));
            }
        }
        // Replenish, trying to overshoot the cap.
        for _ in 0..rng.gen_range(0..40) {
            let _ = db.add_feature(obs(f, rng.gen_range(2.0..30.0), rng.gen_range(2.0..30.0), 100));
        }

        assert!(db.num_frames() <= 12);
        assert!(db.num_active_features() <= 25);
        for id in &killed {
            assert!(!db.is_active(*id), "{id:?} came back");
            assert!(!db.add_observation(*id, obs(f, 1.0, 1.0, 50)));
            if let Some(feature) = db.feature(*id) {
                assert!(!feature.is_alive());
            }
        }
        // Every retained observation belongs to a frame still in the window.
        let oldest = db.frames().next().unwrap().id;
        for feature in db.active_features() {
            assert!(feature.observations().iter().all(|o| o.frame_id >= oldest));
        }
    }
}

#[test]
fn snapshot_is_isolated_from_later_marginalization() {
    let mut db = Database::new(limits(), 32, 32, 1);
    let first = db.add_frame(frame());
    let t = db.add_feature(obs(first, 10.0, 10.0, 80)).unwrap();
    for _ in 0..8 {
        let f = db.add_frame(frame());
        db.add_observation(t, obs(f, 10.0, 10.0, 80));
    }
    let window = db.optimization_window();
    assert_eq!(window.keyframes[0].id, FrameId(0));
    assert_eq!(window.tracks.len(), 1);
    assert_eq!(window.tracks[0].observations.len(), 3);

    // Push frame 0 (and more) out of the window.
    for _ in 0..10 {
        let f = db.add_frame(frame());
        db.add_observation(t, obs(f, 10.0, 10.0, 80));
    }
    assert!(db.frame(FrameId(0)).is_none());
    // The snapshot still holds its own copy.
    assert_eq!(window.keyframes[0].id, FrameId(0));
    assert_eq!(window.tracks[0].observations[0].patch.raw[0][0], 80);
}

#[test]
fn short_tracks_stay_out_of_the_window() {
    let mut db = Database::new(limits(), 32, 32, 1);
    let mut frames = Vec::new();
    for _ in 0..7 {
        frames.push(db.add_frame(frame()));
    }
    // Keyframes: 0, 3, 6.
    let long = db.add_feature(obs(frames[0], 5.0, 5.0, 60)).unwrap();
    let short = db.add_feature(obs(frames[0], 20.0, 20.0, 60)).unwrap();
    for &f in &frames[1..] {
        db.add_observation(long, obs(f, 5.0, 5.0, 60));
    }
    for &f in &frames[1..4] {
        db.add_observation(short, obs(f, 20.0, 20.0, 60));
    }
    db.kill_feature(short);

    let window = db.optimization_window();
    let ids: Vec<TrackId> = window.tracks.iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![long]);
    assert_eq!(window.tracks[0].observations.len(), 3);
    // The short track is retired (4 observations) but sees only 2 keyframes.
    assert_eq!(db.num_retired_features(), 1);
}
