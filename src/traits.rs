//! Core traits and types for the V4L2 capture abstraction.
//!
//! The camera HAL talks to hardware through three seams: a [`CameraBackend`]
//! that opens devices by path, the opened [`CameraDevice`], and the mapped
//! buffer ring exposed as a [`CaptureStream`]. Production code plugs in the
//! `v4l`-based implementation from [`crate::device`]; tests use the in-memory
//! mock.

use std::path::Path;
use std::time::Duration;

/// Pixel format representation (e.g., YUYV, MJPG, RGB3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Create a new `FourCC` from a 4-byte array.
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// YUYV pixel format (4:2:2 packed).
    pub const YUYV: Self = Self::new(b"YUYV");
    /// MJPEG pixel format (Motion JPEG).
    pub const MJPG: Self = Self::new(b"MJPG");
    /// RGB565 pixel format (16-bit packed RGB).
    pub const RGBP: Self = Self::new(b"RGBP");
}

impl std::fmt::Display for FourCC {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in self.0 {
            write!(f, "{}", char::from(byte))?;
        }
        Ok(())
    }
}

impl From<v4l::FourCC> for FourCC {
    fn from(fourcc: v4l::FourCC) -> Self {
        Self(fourcc.repr)
    }
}

impl From<FourCC> for v4l::FourCC {
    fn from(fourcc: FourCC) -> Self {
        Self::new(&fourcc.0)
    }
}

/// Video format specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Format {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel format.
    pub fourcc: FourCC,
    /// Bytes per line (stride).
    pub stride: u32,
    /// Total frame size in bytes.
    pub size: u32,
}

impl Format {
    /// Create a new format specification for a 4:2:2 packed format.
    #[must_use]
    pub const fn new(width: u32, height: u32, fourcc: FourCC) -> Self {
        let stride = width * 2;
        let size = stride * height;
        Self {
            width,
            height,
            fourcc,
            stride,
            size,
        }
    }

    /// Bytes needed to hold one raw frame of this format.
    #[must_use]
    pub const fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * 2
    }
}

/// Device capability flags.
#[derive(Debug, Clone, Default)]
pub struct DeviceCapabilities {
    /// Driver name.
    pub driver: String,
    /// Card/device name.
    pub card: String,
    /// Bus information.
    pub bus_info: String,
    /// Whether the device can capture video.
    pub can_capture: bool,
    /// Whether the device supports streaming.
    pub can_stream: bool,
}

/// Metadata for a dequeued frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMetadata {
    /// Frame sequence number.
    pub sequence: u32,
    /// Capture timestamp.
    pub timestamp: Duration,
    /// Actual bytes used in the frame buffer.
    pub bytes_used: u32,
}

/// A buffer handed back by the driver, borrowed until it is re-queued.
#[derive(Debug)]
pub struct DequeuedBuffer<'a> {
    /// Slot index in the buffer ring.
    pub index: usize,
    /// Filled bytes of the slot (already trimmed to `bytes_used`).
    pub data: &'a [u8],
    /// Frame metadata reported by the driver.
    pub metadata: FrameMetadata,
}

/// Error type for camera operations.
#[derive(Debug, thiserror::Error)]
pub enum CameraError {
    /// The device node could not be opened or queried.
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),
    /// The device lacks video capture or streaming I/O.
    #[error("unsupported capability: {0}")]
    UnsupportedCapability(&'static str),
    /// The driver rejected the requested format.
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    /// Requesting or mapping the buffer ring failed.
    #[error("buffer allocation failed: {0}")]
    BufferAllocationFailed(String),
    /// Taking a filled buffer from the driver failed.
    #[error("dequeue failed: {0}")]
    DequeueFailed(String),
    /// Handing a buffer back to the driver failed.
    #[error("requeue failed: {0}")]
    RequeueFailed(String),
    /// Stream on/off failed.
    #[error("stream error: {0}")]
    StreamError(String),
    /// A preview loop is already running.
    #[error("preview already running")]
    AlreadyRunning,
    /// A different callback already occupies a single-slot registration.
    #[error("operation already in progress")]
    OperationInProgress,
    /// Requested preview or picture format is not supported.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
    /// A session operation was called in the wrong state.
    #[error("invalid session state: {0}")]
    InvalidState(&'static str),
    /// The grab budget expired before the driver produced a frame.
    #[error("operation timed out")]
    Timeout,
    /// JPEG encoding failed.
    #[error("encoding failed: {0}")]
    Encoding(String),
    /// A captured frame did not contain the expected test pattern.
    #[error("frame validation failed: {0}")]
    Validation(String),
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for camera operations.
pub type Result<T> = std::result::Result<T, CameraError>;

/// Opens capture devices by path.
pub trait CameraBackend: Send + Sync + 'static {
    /// The device type produced by [`CameraBackend::open`].
    type Device: CameraDevice;

    /// Open the device node at `path`.
    fn open(&self, path: &Path) -> Result<Self::Device>;
}

/// Abstraction over an opened camera device.
pub trait CameraDevice: Send + 'static {
    /// The ring type returned by `create_stream`.
    type Stream: CaptureStream;

    /// Get device capabilities.
    fn capabilities(&self) -> &DeviceCapabilities;

    /// Get current format.
    fn format(&self) -> Result<Format>;

    /// Set capture format. Returns the actual format set by the driver.
    fn set_format(&mut self, format: &Format) -> Result<Format>;

    /// Request a capture interval of `1/fps`.
    fn set_frame_rate(&mut self, fps: u32) -> Result<()>;

    /// Request and map `buffer_count` buffers. Nothing is queued yet.
    fn create_stream(&mut self, buffer_count: u32) -> Result<Self::Stream>;
}

/// Abstraction over a mapped ring of capture buffers.
pub trait CaptureStream: Send + 'static {
    /// Number of mapped slots.
    fn buffer_count(&self) -> usize;

    /// Hand slot `index` to the driver for filling.
    fn queue(&mut self, index: usize) -> Result<()>;

    /// Block until the driver returns a filled slot.
    fn dequeue(&mut self) -> Result<DequeuedBuffer<'_>>;

    /// Take a filled slot back from the driver without reading it and
    /// return its index. Used to drain the ring before stream-off.
    fn reclaim(&mut self) -> Result<usize>;

    /// Turn streaming on.
    fn start(&mut self) -> Result<()>;

    /// Turn streaming off. The driver reclaims every queued slot.
    fn stop(&mut self) -> Result<()>;

    /// Bound how long `dequeue` may block; `None` waits forever.
    fn set_timeout(&mut self, timeout: Option<Duration>);
}
