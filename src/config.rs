//! Fixed hardware configuration for a camera.

use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use crate::params::{CameraParameters, PICTURE_FORMAT_JPEG, PREVIEW_FORMAT_YUV422SP};
use crate::session::CaptureConfig;
use crate::traits::FourCC;

/// Environment variable overriding the device node.
pub const ENV_DEVICE: &str = "CAMERA_DEVICE";
/// Environment variable holding the grab budget in milliseconds (`0` = none).
pub const ENV_GRAB_TIMEOUT_MS: &str = "CAMERA_GRAB_TIMEOUT_MS";
/// Environment variable enabling FPS logging (any non-zero integer).
pub const ENV_SHOW_FPS: &str = "CAMERA_SHOW_FPS";

/// Configuration fixed for the lifetime of a [`crate::CameraHardware`].
///
/// The hardware supports exactly one resolution per role, so preview and
/// picture sizes here win over anything requested through parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraConfig {
    /// Capture device node.
    pub device_path: PathBuf,
    /// Preview resolution.
    pub preview_size: (u32, u32),
    /// Still picture resolution.
    pub picture_size: (u32, u32),
    /// Raw capture pixel format.
    pub pixel_format: FourCC,
    /// Target preview frame rate.
    pub frame_rate: u32,
    /// Number of buffers in the capture ring.
    pub ring_capacity: u32,
    /// Default JPEG quality.
    pub jpeg_quality: u8,
    /// Picture sizes advertised through parameters.
    pub picture_size_values: Vec<(u32, u32)>,
    /// Upper bound on a single frame grab; `None` blocks indefinitely.
    pub grab_timeout: Option<Duration>,
    /// Log measured FPS every 32 frames.
    pub show_fps: bool,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device_path: PathBuf::from("/dev/video0"),
            preview_size: (352, 288),
            picture_size: (1600, 1200),
            pixel_format: FourCC::YUYV,
            frame_rate: 30,
            ring_capacity: 4,
            jpeg_quality: 100,
            picture_size_values: vec![(1600, 1200), (1024, 768), (640, 480), (352, 288)],
            grab_timeout: None,
            show_fps: false,
        }
    }
}

impl CameraConfig {
    /// Defaults overlaid with `CAMERA_DEVICE`, `CAMERA_GRAB_TIMEOUT_MS` and
    /// `CAMERA_SHOW_FPS`.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().overlay(|key| std::env::var(key).ok())
    }

    fn overlay<F: Fn(&str) -> Option<String>>(mut self, lookup: F) -> Self {
        if let Some(device) = lookup(ENV_DEVICE).filter(|d| !d.is_empty()) {
            self.device_path = PathBuf::from(device);
        }
        if let Some(raw) = lookup(ENV_GRAB_TIMEOUT_MS) {
            match raw.trim().parse::<u64>() {
                Ok(0) => self.grab_timeout = None,
                Ok(ms) => self.grab_timeout = Some(Duration::from_millis(ms)),
                Err(err) => warn!(value = %raw, %err, "ignoring {ENV_GRAB_TIMEOUT_MS}"),
            }
        }
        if let Some(raw) = lookup(ENV_SHOW_FPS) {
            self.show_fps = raw.trim().parse::<i64>().is_ok_and(|v| v != 0);
        }
        self
    }

    /// Use `path` as the capture device.
    #[must_use]
    pub fn with_device<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.device_path = path.into();
        self
    }

    /// Set the fixed preview resolution.
    #[must_use]
    pub const fn with_preview_size(mut self, width: u32, height: u32) -> Self {
        self.preview_size = (width, height);
        self
    }

    /// Set the fixed picture resolution.
    #[must_use]
    pub const fn with_picture_size(mut self, width: u32, height: u32) -> Self {
        self.picture_size = (width, height);
        self
    }

    /// Bound every frame grab by `timeout`.
    #[must_use]
    pub const fn with_grab_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.grab_timeout = timeout;
        self
    }

    /// Toggle FPS logging.
    #[must_use]
    pub const fn with_show_fps(mut self, show_fps: bool) -> Self {
        self.show_fps = show_fps;
        self
    }

    /// Parameter set the hardware starts with.
    #[must_use]
    pub fn default_parameters(&self) -> CameraParameters {
        let mut params = CameraParameters::new();
        let (pw, ph) = self.preview_size;
        let (cw, ch) = self.picture_size;
        params.set_preview_size(pw, ph);
        params.set_preview_frame_rate(self.frame_rate);
        params.set_preview_format(PREVIEW_FORMAT_YUV422SP);
        params.set_picture_format(PICTURE_FORMAT_JPEG);
        params.set_picture_size(cw, ch);
        params.set_jpeg_quality(self.jpeg_quality);
        params.set_supported_picture_sizes(&self.picture_size_values);
        params
    }

    /// Session configuration for streaming preview frames.
    #[must_use]
    pub fn preview_capture(&self) -> CaptureConfig {
        let (width, height) = self.preview_size;
        self.capture(width, height, Some(self.frame_rate))
    }

    /// Session configuration for grabbing one still frame.
    #[must_use]
    pub fn picture_capture(&self) -> CaptureConfig {
        let (width, height) = self.picture_size;
        self.capture(width, height, None)
    }

    fn capture(&self, width: u32, height: u32, frame_rate: Option<u32>) -> CaptureConfig {
        CaptureConfig {
            device_path: self.device_path.clone(),
            width,
            height,
            fourcc: self.pixel_format,
            frame_rate,
        }
    }
}
