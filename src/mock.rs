//! Mock backend for testing without hardware.
//!
//! The mock keeps a literal buffer ring (slots are either queued with the
//! "driver" or held by the client) and exposes knobs to inject the failures
//! a real driver can produce. All devices and streams opened from one
//! [`MockBackend`] share its state, so tests can inspect what the code under
//! test did.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crate::traits::{
    CameraBackend, CameraDevice, CameraError, CaptureStream, DequeuedBuffer, DeviceCapabilities,
    Format, FourCC, FrameMetadata, Result,
};

/// Test pattern types for mock frame generation.
#[derive(Debug, Clone, Copy)]
pub enum TestPattern {
    /// 100% color bars pattern.
    ColorBars,
    /// Horizontal gradient from dark to light.
    Gradient,
    /// Solid color with specified Y, U, V values.
    Solid(u8, u8, u8),
}

/// Shared mock state: failure knobs plus observed activity.
#[derive(Debug)]
pub struct MockState {
    /// Capabilities reported by opened devices.
    pub capabilities: DeviceCapabilities,
    /// Pattern written into every dequeued frame.
    pub pattern: TestPattern,
    /// Driver-imposed frame size, overriding the requested one.
    pub size_override: Option<(u32, u32)>,
    /// Delay before each dequeue returns.
    pub frame_interval: Duration,
    /// `open` fails.
    pub fail_open: bool,
    /// `set_format` fails.
    pub fail_format: bool,
    /// `set_frame_rate` fails.
    pub fail_frame_rate: bool,
    /// Only this many buffers can be mapped.
    pub map_limit: Option<u32>,
    /// `dequeue` fails.
    pub fail_dequeue: bool,
    /// `queue` fails once streaming.
    pub fail_requeue: bool,
    /// `dequeue` blocks until cleared or the stream timeout expires.
    pub stalled: bool,

    opens: usize,
    open_devices: usize,
    live_streams: usize,
    stream_ons: usize,
    stream_offs: usize,
    queues: u64,
    dequeues: u64,
    reclaims: u64,
    failed_dequeues: u64,
    in_driver: VecDeque<usize>,
    with_client: usize,
    max_with_client: usize,
    streaming: bool,
    sequence: u32,
    last_frame_rate: Option<u32>,
    formats: Vec<Format>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            capabilities: DeviceCapabilities {
                driver: "mock".to_owned(),
                card: "Mock Camera".to_owned(),
                bus_info: "mock:0".to_owned(),
                can_capture: true,
                can_stream: true,
            },
            pattern: TestPattern::ColorBars,
            size_override: None,
            frame_interval: Duration::from_millis(1),
            fail_open: false,
            fail_format: false,
            fail_frame_rate: false,
            map_limit: None,
            fail_dequeue: false,
            fail_requeue: false,
            stalled: false,
            opens: 0,
            open_devices: 0,
            live_streams: 0,
            stream_ons: 0,
            stream_offs: 0,
            queues: 0,
            dequeues: 0,
            reclaims: 0,
            failed_dequeues: 0,
            in_driver: VecDeque::new(),
            with_client: 0,
            max_with_client: 0,
            streaming: false,
            sequence: 0,
            last_frame_rate: None,
            formats: Vec::new(),
        }
    }
}

/// Snapshot of what the mock has observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockStats {
    /// Successful `open` calls.
    pub opens: usize,
    /// Devices currently open.
    pub open_devices: usize,
    /// Streams (mapped rings) currently alive.
    pub live_streams: usize,
    /// Stream-on transitions.
    pub stream_ons: usize,
    /// Stream-off transitions.
    pub stream_offs: usize,
    /// Successful queue operations.
    pub queues: u64,
    /// Successful dequeue operations.
    pub dequeues: u64,
    /// Dequeues that reclaimed a slot without reading it.
    pub reclaims: u64,
    /// Dequeue attempts failed by `fail_dequeue`.
    pub failed_dequeues: u64,
    /// Slots currently queued with the driver.
    pub in_driver: usize,
    /// Most slots ever held by the client at once.
    pub max_with_client: usize,
    /// Last frame rate requested.
    pub last_frame_rate: Option<u32>,
    /// Every format negotiated, in order.
    pub formats: Vec<Format>,
}

fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Mock backend handing out devices that share one [`MockState`].
#[derive(Debug, Clone, Default)]
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
}

impl MockBackend {
    /// Create a new mock backend with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the test pattern for frame generation.
    #[must_use]
    pub fn with_pattern(self, pattern: TestPattern) -> Self {
        lock(&self.state).pattern = pattern;
        self
    }

    /// Make the driver force every negotiated format to `width x height`.
    #[must_use]
    pub fn with_size_override(self, width: u32, height: u32) -> Self {
        lock(&self.state).size_override = Some((width, height));
        self
    }

    /// Adjust the shared state.
    pub fn configure<F: FnOnce(&mut MockState)>(&self, f: F) {
        f(&mut lock(&self.state));
    }

    /// Snapshot the observed activity.
    pub fn stats(&self) -> MockStats {
        let state = lock(&self.state);
        MockStats {
            opens: state.opens,
            open_devices: state.open_devices,
            live_streams: state.live_streams,
            stream_ons: state.stream_ons,
            stream_offs: state.stream_offs,
            queues: state.queues,
            dequeues: state.dequeues,
            reclaims: state.reclaims,
            failed_dequeues: state.failed_dequeues,
            in_driver: state.in_driver.len(),
            max_with_client: state.max_with_client,
            last_frame_rate: state.last_frame_rate,
            formats: state.formats.clone(),
        }
    }
}

impl CameraBackend for MockBackend {
    type Device = MockDevice;

    fn open(&self, path: &Path) -> Result<MockDevice> {
        let mut state = lock(&self.state);
        if state.fail_open {
            return Err(CameraError::DeviceUnavailable(format!(
                "{}: no such device",
                path.display()
            )));
        }
        state.opens += 1;
        state.open_devices += 1;
        Ok(MockDevice {
            shared: Arc::clone(&self.state),
            capabilities: state.capabilities.clone(),
            format: Format::new(640, 480, FourCC::YUYV),
        })
    }
}

/// Mock device for testing without hardware.
pub struct MockDevice {
    shared: Arc<Mutex<MockState>>,
    capabilities: DeviceCapabilities,
    format: Format,
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        lock(&self.shared).open_devices -= 1;
    }
}

impl CameraDevice for MockDevice {
    type Stream = MockStream;

    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn format(&self) -> Result<Format> {
        Ok(self.format.clone())
    }

    fn set_format(&mut self, format: &Format) -> Result<Format> {
        let mut state = lock(&self.shared);
        if state.fail_format {
            return Err(CameraError::FormatNegotiationFailed(
                "mock: VIDIOC_S_FMT rejected".to_owned(),
            ));
        }
        let (width, height) = state.size_override.unwrap_or((format.width, format.height));
        self.format = Format::new(width, height, format.fourcc);
        state.formats.push(self.format.clone());
        Ok(self.format.clone())
    }

    fn set_frame_rate(&mut self, fps: u32) -> Result<()> {
        let mut state = lock(&self.shared);
        if state.fail_frame_rate {
            return Err(CameraError::StreamError(
                "mock: VIDIOC_S_PARM unsupported".to_owned(),
            ));
        }
        state.last_frame_rate = Some(fps);
        Ok(())
    }

    fn create_stream(&mut self, buffer_count: u32) -> Result<MockStream> {
        let mut state = lock(&self.shared);
        if let Some(limit) = state.map_limit {
            if buffer_count > limit {
                return Err(CameraError::BufferAllocationFailed(format!(
                    "mock: mmap failed for buffer {limit}"
                )));
            }
        }
        state.live_streams += 1;
        state.in_driver.clear();
        state.with_client = 0;

        let len = self.format.frame_len();
        Ok(MockStream {
            shared: Arc::clone(&self.shared),
            format: self.format.clone(),
            slots: vec![vec![0u8; len]; buffer_count as usize],
            timeout: None,
        })
    }
}

/// Mock capture ring for testing.
pub struct MockStream {
    shared: Arc<Mutex<MockState>>,
    format: Format,
    slots: Vec<Vec<u8>>,
    timeout: Option<Duration>,
}

impl MockStream {
    /// Wait out a stall. Returns `Err(Timeout)` once the budget is spent.
    fn wait_while_stalled(&self) -> Result<()> {
        let started = Instant::now();
        while lock(&self.shared).stalled {
            if self.timeout.is_some_and(|budget| started.elapsed() >= budget) {
                return Err(CameraError::Timeout);
            }
            thread::sleep(Duration::from_millis(1));
        }
        Ok(())
    }
}

impl Drop for MockStream {
    fn drop(&mut self) {
        let mut state = lock(&self.shared);
        if state.streaming {
            state.streaming = false;
            state.stream_offs += 1;
        }
        state.in_driver.clear();
        state.with_client = 0;
        state.live_streams -= 1;
    }
}

impl CaptureStream for MockStream {
    fn buffer_count(&self) -> usize {
        self.slots.len()
    }

    fn queue(&mut self, index: usize) -> Result<()> {
        let mut state = lock(&self.shared);
        if state.fail_requeue && state.streaming {
            return Err(CameraError::RequeueFailed("mock: VIDIOC_QBUF failed".to_owned()));
        }
        if index >= self.slots.len() || state.in_driver.contains(&index) {
            return Err(CameraError::RequeueFailed(format!(
                "mock: slot {index} cannot be queued"
            )));
        }
        state.with_client = state.with_client.saturating_sub(1);
        state.in_driver.push_back(index);
        state.queues += 1;
        Ok(())
    }

    fn dequeue(&mut self) -> Result<DequeuedBuffer<'_>> {
        self.wait_while_stalled()?;

        let interval = lock(&self.shared).frame_interval;
        if !interval.is_zero() {
            thread::sleep(interval);
        }

        let (index, sequence, pattern) = {
            let mut state = lock(&self.shared);
            if state.fail_dequeue {
                state.failed_dequeues += 1;
                return Err(CameraError::DequeueFailed("mock: VIDIOC_DQBUF failed".to_owned()));
            }
            if !state.streaming {
                return Err(CameraError::DequeueFailed("mock: stream is off".to_owned()));
            }
            let index = state.in_driver.pop_front().ok_or_else(|| {
                CameraError::DequeueFailed("mock: no buffer queued".to_owned())
            })?;
            state.with_client += 1;
            state.max_with_client = state.max_with_client.max(state.with_client);
            state.dequeues += 1;
            let sequence = state.sequence;
            state.sequence = state.sequence.wrapping_add(1);
            (index, sequence, state.pattern)
        };

        let slot = self
            .slots
            .get_mut(index)
            .ok_or_else(|| CameraError::DequeueFailed(format!("mock: bad slot {index}")))?;
        fill_test_frame(slot, self.format.width, self.format.height, pattern);

        Ok(DequeuedBuffer {
            index,
            data: slot.as_slice(),
            metadata: FrameMetadata {
                sequence,
                timestamp: Duration::from_millis(u64::from(sequence) * 33), // ~30fps
                bytes_used: self.format.size,
            },
        })
    }

    fn reclaim(&mut self) -> Result<usize> {
        self.wait_while_stalled()?;

        let mut state = lock(&self.shared);
        if state.fail_dequeue {
            state.failed_dequeues += 1;
            return Err(CameraError::DequeueFailed("mock: VIDIOC_DQBUF failed".to_owned()));
        }
        if !state.streaming {
            return Err(CameraError::DequeueFailed("mock: stream is off".to_owned()));
        }
        let index = state
            .in_driver
            .pop_front()
            .ok_or_else(|| CameraError::DequeueFailed("mock: no buffer queued".to_owned()))?;
        state.with_client += 1;
        state.max_with_client = state.max_with_client.max(state.with_client);
        state.dequeues += 1;
        state.reclaims += 1;
        Ok(index)
    }

    fn start(&mut self) -> Result<()> {
        let mut state = lock(&self.shared);
        if !state.streaming {
            state.streaming = true;
            state.stream_ons += 1;
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let mut state = lock(&self.shared);
        if state.streaming {
            state.streaming = false;
            state.stream_offs += 1;
            // the driver reclaims every queued slot on stream-off
            state.in_driver.clear();
        }
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }
}

/// Generate a YUYV test frame for `width x height`.
pub fn generate_test_frame(width: u32, height: u32, pattern: TestPattern) -> Vec<u8> {
    let mut data = vec![0u8; (width * height * 2) as usize]; // YUYV = 2 bytes/pixel
    fill_test_frame(&mut data, width, height, pattern);
    data
}

fn fill_test_frame(data: &mut [u8], width: u32, height: u32, pattern: TestPattern) {
    match pattern {
        TestPattern::ColorBars => generate_color_bars(data, width, height),
        TestPattern::Gradient => generate_gradient(data, width, height),
        TestPattern::Solid(y, u, v) => generate_solid(data, y, u, v),
    }
}

/// Generate YUYV color bars pattern.
fn generate_color_bars(data: &mut [u8], width: u32, height: u32) {
    // 8 color bars: White, Yellow, Cyan, Green, Magenta, Red, Blue, Black
    let bars: [(u8, u8, u8); 8] = [
        (235, 128, 128), // White
        (210, 16, 146),  // Yellow
        (170, 166, 16),  // Cyan
        (145, 54, 34),   // Green
        (106, 202, 222), // Magenta
        (81, 90, 240),   // Red
        (41, 240, 110),  // Blue
        (16, 128, 128),  // Black
    ];

    let bar_width = (width / 8).max(1);

    for y in 0..height {
        for x in (0..width).step_by(2) {
            let bar_idx = (x / bar_width).min(7) as usize;
            let (y_val, u_val, v_val) = bars[bar_idx];

            let offset = ((y * width + x) * 2) as usize;
            if offset + 3 < data.len() {
                data[offset] = y_val;
                data[offset + 1] = u_val;
                data[offset + 2] = y_val;
                data[offset + 3] = v_val;
            }
        }
    }
}

/// Generate YUYV horizontal gradient pattern.
fn generate_gradient(data: &mut [u8], width: u32, height: u32) {
    for y in 0..height {
        for x in (0..width).step_by(2) {
            #[allow(clippy::cast_possible_truncation)]
            let y_val = ((x * 255) / width) as u8;
            let offset = ((y * width + x) * 2) as usize;

            if offset + 3 < data.len() {
                data[offset] = y_val;
                data[offset + 1] = 128;
                data[offset + 2] = y_val;
                data[offset + 3] = 128;
            }
        }
    }
}

/// Generate solid color YUYV frame.
fn generate_solid(data: &mut [u8], y: u8, u: u8, v: u8) {
    for px in data.chunks_exact_mut(4) {
        px.copy_from_slice(&[y, u, y, v]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_device_creation() {
        let backend = MockBackend::new();
        let device = backend.open(Path::new("/dev/video0")).expect("open should succeed");
        assert_eq!(device.capabilities().driver, "mock");
        assert!(device.capabilities().can_capture);
        assert!(device.capabilities().can_stream);
        assert_eq!(backend.stats().open_devices, 1);

        drop(device);
        assert_eq!(backend.stats().open_devices, 0);
    }

    #[test]
    fn test_mock_device_format() {
        let backend = MockBackend::new();
        let mut device = backend.open(Path::new("/dev/video0")).expect("open should succeed");
        let format = device.format().expect("format should succeed");
        assert_eq!(format.width, 640);
        assert_eq!(format.height, 480);

        let new_format = Format::new(1280, 720, FourCC::YUYV);
        let actual = device.set_format(&new_format).expect("set_format should succeed");
        assert_eq!(actual.width, 1280);
        assert_eq!(actual.height, 720);
    }

    #[test]
    fn test_mock_ring_rejects_double_queue() {
        let backend = MockBackend::new();
        let mut device = backend.open(Path::new("/dev/video0")).expect("open should succeed");
        let mut stream = device.create_stream(2).expect("create_stream should succeed");

        stream.queue(0).expect("first queue should succeed");
        assert!(stream.queue(0).is_err());
        assert!(stream.queue(2).is_err());
    }

    #[test]
    fn test_mock_stream_capture() {
        let backend = MockBackend::new();
        let mut device = backend.open(Path::new("/dev/video0")).expect("open should succeed");
        let mut stream = device.create_stream(2).expect("create_stream should succeed");
        stream.queue(0).expect("queue should succeed");
        stream.queue(1).expect("queue should succeed");
        stream.start().expect("start should succeed");

        let first = stream.dequeue().expect("dequeue should succeed");
        assert_eq!(first.metadata.sequence, 0);
        assert_eq!(first.index, 0);
        assert!(!first.data.is_empty());

        let second = stream.dequeue().expect("dequeue should succeed");
        assert_eq!(second.metadata.sequence, 1);
        assert_eq!(second.index, 1);

        assert!(stream.dequeue().is_err(), "ring is empty");
        assert_eq!(backend.stats().max_with_client, 2);
    }

    #[test]
    fn test_color_bars_pattern() {
        let data = generate_test_frame(640, 480, TestPattern::ColorBars);
        assert_eq!(data.len(), (640 * 480 * 2) as usize);
        // First bar should be white (Y=235)
        assert_eq!(data[0], 235);
    }

    #[test]
    fn test_gradient_pattern() {
        let data = generate_test_frame(640, 480, TestPattern::Gradient);
        assert!(data[0] < 10);

        let last_row_start = (479 * 640 * 2) as usize;
        let last_pixel_y = data[last_row_start + 638 * 2];
        assert!(last_pixel_y > 200);
    }

    #[test]
    fn test_solid_pattern() {
        let data = generate_test_frame(64, 64, TestPattern::Solid(128, 64, 192));
        assert_eq!(data[0], 128);
        assert_eq!(data[2], 128);
        assert_eq!(data[1], 64);
        assert_eq!(data[3], 192);
    }
}
