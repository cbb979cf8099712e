//! Device session: one opened capture device and its mapped buffer ring.
//!
//! A session walks a fixed protocol:
//!
//! ```text
//! open -> Initialized -> init(n) -> Ready -> start_streaming -> Streaming
//!      <- close        <- uninit  <- Ready <- stop_streaming  <-
//! ```
//!
//! `init` maps `n` slots and queues all of them. After that the controller
//! only ever holds one slot at a time: [`DeviceSession::grab_frame`]
//! dequeues a filled slot, copies it out and hands it straight back.

use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::traits::{
    CameraBackend, CameraDevice, CameraError, CaptureStream, DeviceCapabilities, Format, FourCC,
    FrameMetadata, Result,
};

/// Per-slot budget for draining the ring when no grab timeout is set.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// What a session is opened with. Changing any field means a new session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    /// Device node, e.g. `/dev/video0`.
    pub device_path: PathBuf,
    /// Requested frame width.
    pub width: u32,
    /// Requested frame height.
    pub height: u32,
    /// Requested pixel format.
    pub fourcc: FourCC,
    /// Target frame rate, applied best-effort on open.
    pub frame_rate: Option<u32>,
}

/// Lifecycle position of an open session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Device open and format negotiated; no buffers mapped.
    Initialized,
    /// Buffers mapped and queued; streaming off.
    Ready,
    /// Streaming on.
    Streaming,
}

/// Queue/dequeue bookkeeping for the buffer ring.
///
/// Counters are cumulative over the session; the number of slots currently
/// owned by the driver is `queued - dequeued` and never exceeds `capacity`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingState {
    /// Number of mapped slots.
    pub capacity: usize,
    /// Total successful queue operations.
    pub queued: u64,
    /// Total successful dequeue operations.
    pub dequeued: u64,
}

impl RingState {
    /// Slots currently owned by the driver.
    #[must_use]
    pub const fn in_driver(&self) -> u64 {
        self.queued.saturating_sub(self.dequeued)
    }

    /// Whether the counters satisfy `dequeued <= queued` and
    /// `queued - dequeued <= capacity`.
    #[must_use]
    pub const fn is_consistent(&self) -> bool {
        self.dequeued <= self.queued && self.in_driver() <= self.capacity as u64
    }
}

/// One open capture device and its buffer ring.
pub struct DeviceSession<D: CameraDevice> {
    device: D,
    config: CaptureConfig,
    format: Format,
    stream: Option<D::Stream>,
    streaming: bool,
    timeout: Option<Duration>,
    ring: RingState,
}

impl<D: CameraDevice> DeviceSession<D> {
    /// Open the device, check it can stream-capture, and negotiate the format.
    ///
    /// The driver may adjust width and height; read them back through
    /// [`DeviceSession::format`].
    pub fn open<B>(backend: &B, config: CaptureConfig) -> Result<Self>
    where
        B: CameraBackend<Device = D>,
    {
        let mut device = backend.open(&config.device_path).map_err(|err| match err {
            CameraError::DeviceUnavailable(_) => err,
            other => CameraError::DeviceUnavailable(other.to_string()),
        })?;

        let caps = device.capabilities();
        if !caps.can_capture {
            warn!(device = %config.device_path.display(), "video capture not supported");
            return Err(CameraError::UnsupportedCapability("video capture"));
        }
        if !caps.can_stream {
            warn!(device = %config.device_path.display(), "streaming I/O not supported");
            return Err(CameraError::UnsupportedCapability("streaming I/O"));
        }

        let requested = Format::new(config.width, config.height, config.fourcc);
        let format = device.set_format(&requested).map_err(|err| match err {
            CameraError::FormatNegotiationFailed(_) => err,
            other => CameraError::FormatNegotiationFailed(other.to_string()),
        })?;

        if format.fourcc != config.fourcc {
            return Err(CameraError::FormatNegotiationFailed(format!(
                "requested {}, driver chose {}",
                config.fourcc, format.fourcc
            )));
        }
        if format.width != config.width || format.height != config.height {
            info!(
                requested_width = config.width,
                requested_height = config.height,
                width = format.width,
                height = format.height,
                "driver adjusted capture size"
            );
        }

        debug!(
            device = %config.device_path.display(),
            width = format.width,
            height = format.height,
            fourcc = %format.fourcc,
            "capture device opened"
        );

        let frame_rate = config.frame_rate;
        let mut session = Self {
            device,
            config,
            format,
            stream: None,
            streaming: false,
            timeout: None,
            ring: RingState::default(),
        };
        if let Some(fps) = frame_rate {
            session.set_frame_rate(fps);
        }
        Ok(session)
    }

    /// Request a frame rate. Many drivers have no rate control, so failure
    /// is logged and otherwise ignored.
    pub fn set_frame_rate(&mut self, fps: u32) {
        if let Err(err) = self.device.set_frame_rate(fps) {
            warn!(fps, %err, "frame rate not applied");
        }
    }

    /// Bound how long [`DeviceSession::grab_frame`] may block.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
        if let Some(stream) = self.stream.as_mut() {
            stream.set_timeout(timeout);
        }
    }

    /// Map `ring_capacity` buffers and queue every one of them.
    ///
    /// All-or-nothing: if any slot fails to map or queue, the partial ring is
    /// released and the session stays `Initialized`.
    pub fn init(&mut self, ring_capacity: u32) -> Result<()> {
        if self.stream.is_some() {
            return Err(CameraError::InvalidState("buffers already initialized"));
        }
        if ring_capacity == 0 {
            return Err(CameraError::BufferAllocationFailed(
                "ring capacity must be at least one buffer".to_owned(),
            ));
        }

        let mut stream = self
            .device
            .create_stream(ring_capacity)
            .map_err(|err| match err {
                CameraError::BufferAllocationFailed(_) => err,
                other => CameraError::BufferAllocationFailed(other.to_string()),
            })?;

        let capacity = stream.buffer_count();
        if capacity < ring_capacity as usize {
            return Err(CameraError::BufferAllocationFailed(format!(
                "driver mapped {capacity} of {ring_capacity} buffers"
            )));
        }

        let mut ring = RingState {
            capacity,
            ..RingState::default()
        };
        for index in 0..capacity {
            stream.queue(index).map_err(|err| {
                CameraError::BufferAllocationFailed(format!("queue slot {index}: {err}"))
            })?;
            ring.queued += 1;
        }

        stream.set_timeout(self.timeout);
        self.stream = Some(stream);
        self.ring = ring;
        debug!(capacity, "buffer ring mapped and queued");
        Ok(())
    }

    /// Turn streaming on. Calling it while already streaming is a no-op.
    pub fn start_streaming(&mut self) -> Result<()> {
        if self.streaming {
            return Ok(());
        }
        let stream = self
            .stream
            .as_mut()
            .ok_or(CameraError::InvalidState("buffers not initialized"))?;
        stream.start()?;
        self.streaming = true;
        Ok(())
    }

    /// Turn streaming off. Calling it while stopped is a no-op.
    pub fn stop_streaming(&mut self) -> Result<()> {
        if !self.streaming {
            return Ok(());
        }
        if let Some(stream) = self.stream.as_mut() {
            stream.stop()?;
        }
        self.streaming = false;
        Ok(())
    }

    /// Dequeue the next filled slot, copy it into `dst`, and queue the slot
    /// again.
    ///
    /// Blocks until the driver produces a frame (or the configured timeout
    /// expires). `dst` should hold `width * height * 2` bytes; a larger
    /// driver payload is truncated.
    pub fn grab_frame(&mut self, dst: &mut [u8]) -> Result<FrameMetadata> {
        if !self.streaming {
            return Err(CameraError::InvalidState("not streaming"));
        }
        let stream = self
            .stream
            .as_mut()
            .ok_or(CameraError::InvalidState("buffers not initialized"))?;

        let (index, metadata) = {
            let buffer = stream.dequeue().map_err(|err| match err {
                CameraError::DequeueFailed(_) | CameraError::Timeout => err,
                other => CameraError::DequeueFailed(other.to_string()),
            })?;
            self.ring.dequeued += 1;

            let len = buffer.data.len().min(dst.len());
            if buffer.data.len() > dst.len() {
                warn!(
                    bytes_used = buffer.data.len(),
                    capacity = dst.len(),
                    "frame larger than destination, truncating"
                );
            }
            if let (Some(out), Some(data)) = (dst.get_mut(..len), buffer.data.get(..len)) {
                out.copy_from_slice(data);
            }
            (buffer.index, buffer.metadata)
        };

        stream.queue(index).map_err(|err| match err {
            CameraError::RequeueFailed(_) => err,
            other => CameraError::RequeueFailed(other.to_string()),
        })?;
        self.ring.queued += 1;

        Ok(metadata)
    }

    /// Release the buffer ring.
    ///
    /// If the stream is still on, all but one outstanding slot are drained
    /// first without reading them. Each drain waits at most the grab timeout
    /// (half a second when none is set); failures are logged, not returned. After stream-off the
    /// driver has already reclaimed every slot. Counters reset to zero.
    pub fn uninit(&mut self) {
        let Some(mut stream) = self.stream.take() else {
            return;
        };

        if self.streaming {
            let outstanding = self.ring.in_driver().saturating_sub(1);
            stream.set_timeout(Some(self.timeout.unwrap_or(DRAIN_TIMEOUT)));
            for drained in 0..outstanding {
                match stream.reclaim() {
                    Ok(index) => {
                        self.ring.dequeued += 1;
                        debug!(index, "uninit: slot reclaimed");
                    }
                    Err(err) => warn!(%err, slot = drained, outstanding, "uninit: drain failed"),
                }
            }
            if let Err(err) = stream.stop() {
                warn!(%err, "uninit: stream off failed");
            }
            self.streaming = false;
        }

        self.ring.queued = 0;
        self.ring.dequeued = 0;
        drop(stream);
        debug!("buffer ring released");
    }

    /// Close the device, tearing down streaming and buffers first.
    pub fn close(self) {
        drop(self);
    }

    /// Negotiated format.
    pub const fn format(&self) -> &Format {
        &self.format
    }

    /// Configuration the session was opened with.
    pub const fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Device capabilities.
    pub fn capabilities(&self) -> &DeviceCapabilities {
        self.device.capabilities()
    }

    /// Ring bookkeeping snapshot.
    pub const fn ring(&self) -> RingState {
        self.ring
    }

    /// Current lifecycle position.
    pub const fn state(&self) -> SessionState {
        if self.streaming {
            SessionState::Streaming
        } else if self.stream.is_some() {
            SessionState::Ready
        } else {
            SessionState::Initialized
        }
    }
}

impl<D: CameraDevice> Drop for DeviceSession<D> {
    fn drop(&mut self) {
        if let Err(err) = self.stop_streaming() {
            warn!(%err, "close: stream off failed");
        }
        self.uninit();
        debug!(device = %self.config.device_path.display(), "capture device closed");
    }
}
