// model.rs — The photometric model and its shared, swappable snapshot.
//
// The tracker and the rapid exposure estimator read the response every
// frame; the optimizer replaces it every few hundred frames. Readers take
// an `Arc` to an immutable `PhotometricModel` and keep using it for the
// whole frame. The writer builds a complete new model and swaps the
// pointer. The lock is held only for the pointer copy or swap, never
// while anything is computed, so a reader can never see a half-written
// table.

use std::sync::{Arc, RwLock};

use crate::response::ResponseModel;
use crate::vignette::VignetteModel;

/// Response plus vignette, immutable once published.
#[derive(Debug, Clone, PartialEq)]
pub struct PhotometricModel {
    pub response: ResponseModel,
    pub vignette: VignetteModel,
    /// Number of optimizer results folded in so far. 0 = initial identity.
    pub generation: u64,
}

impl PhotometricModel {
    /// Identity response and flat vignette for `channels` channels.
    pub fn identity(response: ResponseModel) -> Self {
        PhotometricModel {
            response,
            vignette: VignetteModel::identity(),
            generation: 0,
        }
    }

    /// Relative scene radiance behind intensity `o` observed at (x, y)
    /// with exposure `exposure`: g(o) / (e · V(x, y)).
    pub fn correct(
        &self,
        o: u8,
        channel: usize,
        (x, y): (f64, f64),
        (width, height): (usize, usize),
        exposure: f64,
    ) -> f64 {
        let v = self.vignette.attenuation(x, y, width, height);
        self.response.remove_response(o, channel) / (exposure * v)
    }
}

/// Atomically swapped pointer to the current model.
#[derive(Debug)]
pub struct ModelStore {
    current: RwLock<Arc<PhotometricModel>>,
}

impl ModelStore {
    pub fn new(initial: PhotometricModel) -> Self {
        ModelStore {
            current: RwLock::new(Arc::new(initial)),
        }
    }

    /// Current snapshot.
    pub fn load(&self) -> Arc<PhotometricModel> {
        // A poisoned lock still holds a complete Arc; the swap is a single
        // assignment, so there is no torn state to guard against.
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Publish a new model, returning the one it replaced.
    pub fn store(&self, model: PhotometricModel) -> Arc<PhotometricModel> {
        let next = Arc::new(model);
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::replace(&mut *guard, next)
    }
}
