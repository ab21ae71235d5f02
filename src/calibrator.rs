// calibrator.rs — Tracking loop plus optimization scheduling.
//
// The calibrator owns the tracker and decides when the optimizer runs:
//
//   online  every `keyframe_spacing * optimize_every` frames a window
//           snapshot goes to a background worker over a bounded(1)
//           channel. If the worker still has a request queued the
//           trigger is dropped; the tracking loop never waits for it.
//   batch   frames are only tracked; `finish()` runs one optimization
//           over whatever the window holds.
//
// Write-back is the same for both: the new model is published to the
// `ModelStore` (one pointer swap), then the refined exposures are
// applied to the frames still in the window under the database lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use tracing::{debug, info, warn};

use crate::config::{CalibrationConfig, CalibrationMode};
use crate::database::{self, Database, DatabaseLimits, OptimizationWindow, SharedDatabase};
use crate::error::{CalibrationError, OptimizeError};
use crate::feature::FrameId;
use crate::image::ColorImage;
use crate::model::{ModelStore, PhotometricModel};
use crate::optimizer::{NonlinearOptimizer, OptimizationResult};
use crate::response::ResponseModel;
use crate::tracker::{FrameReport, Tracker};

/// Counters shared with the worker thread.
#[derive(Debug, Default)]
pub struct CalibrationStats {
    pub triggered: AtomicU64,
    pub skipped: AtomicU64,
    pub succeeded: AtomicU64,
    pub failed: AtomicU64,
}

impl CalibrationStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            triggered: self.triggered.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub triggered: u64,
    pub skipped: u64,
    pub succeeded: u64,
    pub failed: u64,
}

/// Optimize `window` against the current model and publish the result.
fn optimize_and_publish(
    optimizer: &NonlinearOptimizer,
    window: &OptimizationWindow,
    db: &SharedDatabase,
    models: &ModelStore,
) -> Result<OptimizationResult, OptimizeError> {
    let current = models.load();
    let result = optimizer.optimize(window, &current.response, &current.vignette)?;
    models.store(PhotometricModel {
        response: result.response.clone(),
        vignette: result.vignette,
        generation: current.generation + 1,
    });
    let applied = database::lock(db).apply_exposures(&result.exposures);
    info!(
        generation = current.generation + 1,
        applied,
        final_cost = result.final_cost,
        "published photometric model"
    );
    Ok(result)
}

/// Background optimizer fed through a bounded(1) queue.
struct OptimizationWorker {
    tx: Option<Sender<OptimizationWindow>>,
    handle: Option<JoinHandle<()>>,
}

impl OptimizationWorker {
    fn spawn(
        optimizer: NonlinearOptimizer,
        db: SharedDatabase,
        models: Arc<ModelStore>,
        stats: Arc<CalibrationStats>,
    ) -> Self {
        let (tx, rx): (Sender<OptimizationWindow>, Receiver<OptimizationWindow>) = crossbeam_channel::bounded(1);
        let handle = thread::spawn(move || {
            while let Ok(window) = rx.recv() {
                match optimize_and_publish(&optimizer, &window, &db, &models) {
                    Ok(_) => {
                        stats.succeeded.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => {
                        stats.failed.fetch_add(1, Ordering::Relaxed);
                        warn!(%err, "optimization failed; keeping previous model");
                    }
                }
            }
        });
        OptimizationWorker {
            tx: Some(tx),
            handle: Some(handle),
        }
    }

    /// Queue a window. Returns false if one is already waiting.
    fn try_submit(&self, window: OptimizationWindow) -> Result<bool, CalibrationError> {
        let Some(tx) = &self.tx else {
            return Err(CalibrationError::WorkerStopped);
        };
        match tx.try_send(window) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(_)) => Ok(false),
            Err(TrySendError::Disconnected(_)) => Err(CalibrationError::WorkerStopped),
        }
    }

    /// Close the queue and wait for the in-flight optimization.
    fn join(&mut self) -> Result<(), CalibrationError> {
        self.tx.take();
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| CalibrationError::WorkerStopped),
            None => Ok(()),
        }
    }
}

impl Drop for OptimizationWorker {
    fn drop(&mut self) {
        let _ = self.join();
    }
}

/// Online photometric calibration of one camera stream.
pub struct Calibrator {
    mode: CalibrationMode,
    interval: u64,
    tracker: Tracker,
    db: SharedDatabase,
    models: Arc<ModelStore>,
    optimizer: NonlinearOptimizer,
    worker: Option<OptimizationWorker>,
    stats: Arc<CalibrationStats>,
    frames: u64,
}

impl Calibrator {
    pub fn new(config: CalibrationConfig, width: usize, height: usize, channels: usize) -> Result<Self, CalibrationError> {
        config.validate()?;
        let response = ResponseModel::new(channels)?;
        let db = Database::new(DatabaseLimits::from(&config), width, height, channels).shared();
        let models = Arc::new(ModelStore::new(PhotometricModel::identity(response)));
        let optimizer = NonlinearOptimizer::from(&config);
        let stats = Arc::new(CalibrationStats::default());
        let mode = config.calibration_mode;
        let interval = config.optimization_interval() as u64;

        let tracker = Tracker::new(config, width, height, channels, Arc::clone(&db), Arc::clone(&models))?;
        let worker = (mode == CalibrationMode::Online).then(|| {
            OptimizationWorker::spawn(optimizer.clone(), Arc::clone(&db), Arc::clone(&models), Arc::clone(&stats))
        });

        info!(width, height, channels, %mode, "calibrator started");
        Ok(Calibrator {
            mode,
            interval,
            tracker,
            db,
            models,
            optimizer,
            worker,
            stats,
            frames: 0,
        })
    }

    pub fn mode(&self) -> CalibrationMode {
        self.mode
    }

    /// Track one frame; in online mode possibly hand a snapshot to the worker.
    pub fn process_frame(&mut self, raw: &ColorImage, timestamp: f64) -> Result<FrameReport, CalibrationError> {
        let report = self.tracker.process_frame(raw, timestamp)?;
        self.after_frame(report)
    }

    /// Like `process_frame` for a frame whose exposure time is known
    /// (camera metadata). Known exposures anchor the optimizer: with two
    /// or more distinct values in the window the response curve is
    /// determined, not only up to a power.
    pub fn process_frame_with_exposure(
        &mut self,
        raw: &ColorImage,
        timestamp: f64,
        exposure: f64,
    ) -> Result<FrameReport, CalibrationError> {
        let report = self.tracker.process_frame_with_exposure(raw, timestamp, exposure)?;
        self.after_frame(report)
    }

    fn after_frame(&mut self, report: FrameReport) -> Result<FrameReport, CalibrationError> {
        self.frames += 1;
        if self.mode == CalibrationMode::Online && self.frames % self.interval == 0 {
            self.trigger()?;
        }
        Ok(report)
    }

    fn trigger(&mut self) -> Result<(), CalibrationError> {
        let Some(worker) = &self.worker else {
            return Ok(());
        };
        let window = database::lock(&self.db).optimization_window();
        if window.keyframes.len() < 2 || window.is_empty() {
            debug!(keyframes = window.keyframes.len(), "window too small, optimization not triggered");
            return Ok(());
        }
        self.stats.triggered.fetch_add(1, Ordering::Relaxed);
        if !worker.try_submit(window)? {
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            warn!(frame = self.frames, "optimizer busy, trigger skipped");
        }
        Ok(())
    }

    /// Optimize the current window on the calling thread.
    pub fn optimize_now(&self) -> Result<OptimizationResult, CalibrationError> {
        let window = database::lock(&self.db).optimization_window();
        match optimize_and_publish(&self.optimizer, &window, &self.db, &self.models) {
            Ok(result) => {
                self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
                Ok(result)
            }
            Err(err) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!(%err, "optimization failed; keeping previous model");
                Err(err.into())
            }
        }
    }

    /// End of stream. Batch mode runs its one optimization; online mode
    /// waits for the worker to finish what it has.
    pub fn finish(&mut self) -> Result<Arc<PhotometricModel>, CalibrationError> {
        match self.mode {
            CalibrationMode::Batch => {
                self.optimize_now()?;
            }
            CalibrationMode::Online => {
                if let Some(mut worker) = self.worker.take() {
                    worker.join()?;
                }
            }
        }
        Ok(self.models.load())
    }

    /// Current published model.
    pub fn model(&self) -> Arc<PhotometricModel> {
        self.models.load()
    }

    pub fn model_store(&self) -> &Arc<ModelStore> {
        &self.models
    }

    /// Exposure of every frame in the window, oldest first.
    pub fn exposures(&self) -> Vec<(FrameId, f64)> {
        database::lock(&self.db).exposures()
    }

    pub fn database(&self) -> &SharedDatabase {
        &self.db
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames
    }
}
