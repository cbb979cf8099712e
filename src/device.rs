//! V4L2 device implementation using the v4l crate.

use std::collections::VecDeque;
use std::io;
use std::path::Path;
use std::time::Duration;

use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::{CaptureStream as V4lCaptureStream, Stream as V4lStream};
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::Device;

use tracing::debug;

use crate::traits::{
    CameraBackend, CameraDevice, CameraError, CaptureStream, DequeuedBuffer, DeviceCapabilities,
    Format, FourCC, FrameMetadata, Result,
};

/// Opens `/dev/video*` nodes through the v4l crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct V4L2Backend;

impl CameraBackend for V4L2Backend {
    type Device = V4L2Device;

    fn open(&self, path: &Path) -> Result<V4L2Device> {
        V4L2Device::open(path)
    }
}

/// V4L2 device implementation wrapping the v4l crate.
pub struct V4L2Device {
    device: Device,
    capabilities: DeviceCapabilities,
}

impl V4L2Device {
    /// Open a V4L2 device by path (e.g. `/dev/video0`).
    pub fn open(path: &Path) -> Result<Self> {
        let device = Device::with_path(path).map_err(|err| {
            CameraError::DeviceUnavailable(format!("{}: {err}", path.display()))
        })?;

        let caps = device
            .query_caps()
            .map_err(|err| CameraError::DeviceUnavailable(err.to_string()))?;

        let capabilities = DeviceCapabilities {
            driver: caps.driver,
            card: caps.card,
            bus_info: caps.bus,
            can_capture: caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE),
            can_stream: caps.capabilities.contains(v4l::capability::Flags::STREAMING),
        };

        Ok(Self {
            device,
            capabilities,
        })
    }
}

fn format_from_v4l(fmt: &v4l::Format) -> Format {
    Format {
        width: fmt.width,
        height: fmt.height,
        fourcc: FourCC::from(fmt.fourcc),
        stride: fmt.stride,
        size: fmt.size,
    }
}

impl CameraDevice for V4L2Device {
    type Stream = V4L2Stream;

    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn format(&self) -> Result<Format> {
        let fmt = self
            .device
            .format()
            .map_err(|err| CameraError::FormatNegotiationFailed(err.to_string()))?;

        Ok(format_from_v4l(&fmt))
    }

    fn set_format(&mut self, format: &Format) -> Result<Format> {
        let mut fmt = self
            .device
            .format()
            .map_err(|err| CameraError::FormatNegotiationFailed(err.to_string()))?;

        fmt.width = format.width;
        fmt.height = format.height;
        fmt.fourcc = format.fourcc.into();

        let fmt = self
            .device
            .set_format(&fmt)
            .map_err(|err| CameraError::FormatNegotiationFailed(err.to_string()))?;

        Ok(format_from_v4l(&fmt))
    }

    fn set_frame_rate(&mut self, fps: u32) -> Result<()> {
        self.device
            .set_params(&Parameters::with_fps(fps))
            .map_err(|err| CameraError::StreamError(format!("VIDIOC_S_PARM: {err}")))?;
        Ok(())
    }

    fn create_stream(&mut self, buffer_count: u32) -> Result<V4L2Stream> {
        let stream = Stream::with_buffers(&self.device, Type::VideoCapture, buffer_count)
            .map_err(|err| CameraError::BufferAllocationFailed(err.to_string()))?;

        Ok(V4L2Stream {
            stream,
            buffer_count: buffer_count as usize,
            in_driver: VecDeque::new(),
            cursor: 0,
            cursor_state: Cursor::Client,
            streaming: false,
        })
    }
}

/// Where the slot under v4l's internal cursor currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cursor {
    /// Owned by the client and not yet released.
    Client,
    /// Released by the client; the next `next()` queues it.
    Released,
    /// Queued with the driver by a `next()` whose dequeue failed.
    Queued,
}

/// V4L2 capture ring over v4l's mmap stream.
///
/// Every queue, dequeue and stream toggle is a real ioctl, with one
/// exception. v4l keeps the mapped slots private and exposes their bytes only
/// through `next()`, which queues the slot under its internal cursor before
/// dequeuing. Queuing that one slot is therefore left to `next()`, and every
/// other slot is queued directly.
///
/// `next()` does not report which slot it dequeued. Capture drivers return
/// mmap slots in the order they were queued, so the index is taken from
/// the queue order. `reclaim` dequeues directly and reports the index the
/// driver returned.
pub struct V4L2Stream {
    stream: Stream<'static>,
    buffer_count: usize,
    in_driver: VecDeque<usize>,
    cursor: usize,
    cursor_state: Cursor,
    streaming: bool,
}

fn dequeue_error(err: &io::Error) -> CameraError {
    if err.kind() == io::ErrorKind::TimedOut {
        CameraError::Timeout
    } else {
        CameraError::DequeueFailed(err.to_string())
    }
}

impl V4L2Stream {
    /// Direct DQBUF; the slot's bytes stay out of reach.
    fn dequeue_slot(&mut self) -> Result<usize> {
        let index =
            V4lCaptureStream::dequeue(&mut self.stream).map_err(|err| dequeue_error(&err))?;
        match self.in_driver.iter().position(|&queued| queued == index) {
            Some(0) => {}
            Some(position) => {
                debug!(index, position, "driver returned a slot out of queue order");
            }
            None => debug!(index, "driver returned a slot not tracked as queued"),
        }
        self.in_driver.retain(|&queued| queued != index);
        self.cursor = index;
        self.cursor_state = Cursor::Client;
        Ok(index)
    }
}

impl CaptureStream for V4L2Stream {
    fn buffer_count(&self) -> usize {
        self.buffer_count
    }

    fn queue(&mut self, index: usize) -> Result<()> {
        if index >= self.buffer_count {
            return Err(CameraError::RequeueFailed(format!(
                "slot {index} out of range (ring of {})",
                self.buffer_count
            )));
        }
        if self.in_driver.contains(&index) {
            return Err(CameraError::RequeueFailed(format!("slot {index} already queued")));
        }

        if index == self.cursor {
            if self.cursor_state != Cursor::Client {
                return Err(CameraError::RequeueFailed(format!("slot {index} already queued")));
            }
            self.cursor_state = Cursor::Released;
            return Ok(());
        }

        // a driver that mapped fewer slots than requested rejects the index
        V4lCaptureStream::queue(&mut self.stream, index)
            .map_err(|err| CameraError::RequeueFailed(format!("VIDIOC_QBUF {index}: {err}")))?;
        self.in_driver.push_back(index);
        Ok(())
    }

    fn dequeue(&mut self) -> Result<DequeuedBuffer<'_>> {
        if !self.streaming {
            return Err(CameraError::DequeueFailed("stream is off".to_owned()));
        }

        match self.cursor_state {
            Cursor::Released => {}
            Cursor::Client => {
                return Err(CameraError::DequeueFailed(format!(
                    "slot {} is still held by the client",
                    self.cursor
                )));
            }
            Cursor::Queued => {
                // An earlier next() queued the cursor slot but failed to
                // dequeue. Take a slot back directly so next() has one to
                // queue; its frame is dropped.
                let dropped = self.dequeue_slot()?;
                debug!(index = dropped, "dropping frame to resync the ring");
                self.cursor_state = Cursor::Released;
            }
        }

        self.in_driver.push_back(self.cursor);
        self.cursor_state = Cursor::Queued;
        let (buf, meta) =
            V4lCaptureStream::next(&mut self.stream).map_err(|err| dequeue_error(&err))?;

        let index = self.in_driver.pop_front().unwrap_or(self.cursor);
        self.cursor = index;
        self.cursor_state = Cursor::Client;

        // V4L2 timestamps are always non-negative in practice
        #[allow(clippy::cast_sign_loss)]
        let secs = meta.timestamp.sec.max(0) as u64;
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        let nanos = (meta.timestamp.usec.max(0) as u32).saturating_mul(1000);

        let data = buf.get(..meta.bytesused as usize).unwrap_or(buf);

        Ok(DequeuedBuffer {
            index,
            data,
            metadata: FrameMetadata {
                sequence: meta.sequence,
                timestamp: Duration::new(secs, nanos),
                bytes_used: meta.bytesused,
            },
        })
    }

    fn reclaim(&mut self) -> Result<usize> {
        if !self.streaming {
            return Err(CameraError::DequeueFailed("stream is off".to_owned()));
        }
        self.dequeue_slot()
    }

    fn start(&mut self) -> Result<()> {
        if !self.streaming {
            V4lStream::start(&mut self.stream)
                .map_err(|err| CameraError::StreamError(format!("VIDIOC_STREAMON: {err}")))?;
            self.streaming = true;
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if self.streaming {
            V4lStream::stop(&mut self.stream)
                .map_err(|err| CameraError::StreamError(format!("VIDIOC_STREAMOFF: {err}")))?;
            self.streaming = false;
            // stream-off hands every slot back to the client
            self.in_driver.clear();
            self.cursor_state = Cursor::Client;
        }
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Option<Duration>) {
        match timeout {
            Some(duration) => self.stream.set_timeout(duration),
            None => self.stream.clear_timeout(),
        }
    }
}
