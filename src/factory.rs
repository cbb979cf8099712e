//! Shared-handle factory for camera hardware.
//!
//! The owning service keeps one [`CameraFactory`]; every `open` returns the
//! same controller while any handle to it is alive, and a fresh one after
//! the last handle is dropped.

use std::sync::{Arc, Mutex, Weak};

use tracing::debug;

use crate::callbacks::lock;
use crate::config::CameraConfig;
use crate::hardware::CameraHardware;
use crate::traits::CameraBackend;

/// Hands out the single live [`CameraHardware`] for one device.
pub struct CameraFactory<B: CameraBackend + Clone> {
    backend: B,
    config: CameraConfig,
    instance: Mutex<Weak<CameraHardware<B>>>,
}

impl<B: CameraBackend + Clone> CameraFactory<B> {
    /// Factory for the device described by `config`.
    pub fn new(backend: B, config: CameraConfig) -> Self {
        Self {
            backend,
            config,
            instance: Mutex::new(Weak::new()),
        }
    }

    /// The live controller, or a new one if none is alive.
    pub fn open(&self) -> Arc<CameraHardware<B>> {
        let mut instance = lock(&self.instance);
        if let Some(hardware) = instance.upgrade() {
            return hardware;
        }
        debug!(device = %self.config.device_path.display(), "creating camera hardware");
        let hardware = Arc::new(CameraHardware::new(self.backend.clone(), self.config.clone()));
        *instance = Arc::downgrade(&hardware);
        hardware
    }

    /// Whether a controller handed out by [`CameraFactory::open`] is alive.
    pub fn is_open(&self) -> bool {
        lock(&self.instance).strong_count() > 0
    }
}
