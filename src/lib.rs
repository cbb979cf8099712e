//! v4l2-camera-hal: a camera HAL over V4L2 streaming capture devices.
//!
//! The crate drives a webcam through the kernel's mmap streaming protocol
//! and exposes a camera-service style controller on top of it: a
//! background preview loop delivering RGB565 frames, optional YUV420
//! recording frames, synchronous JPEG still capture and a stub autofocus.
//!
//! Hardware access sits behind the [`CameraBackend`] / [`CameraDevice`] /
//! [`CaptureStream`] traits, enabling both production use with real
//! hardware and testing with mock devices.

pub mod callbacks;
pub mod config;
pub mod convert;
pub mod device;
pub mod factory;
pub mod hardware;
pub mod params;
pub mod session;
pub mod traits;
pub mod validation;

#[cfg(test)]
pub mod mock;

pub use callbacks::{
    AutoFocusCallback, Cookie, FrameHeap, JpegCallback, PreviewCallback, RawCallback,
    RecordingCallback, ShutterCallback, Slot,
};
pub use config::CameraConfig;
pub use device::{V4L2Backend, V4L2Device, V4L2Stream};
pub use factory::CameraFactory;
pub use hardware::{CameraHardware, CameraState};
pub use params::CameraParameters;
pub use session::{CaptureConfig, DeviceSession, RingState, SessionState};
pub use traits::{
    CameraBackend, CameraDevice, CameraError, CaptureStream, DeviceCapabilities, Format, FourCC,
    FrameMetadata, Result,
};
