//! Capture controller: preview loop, recording, still capture and autofocus
//! on top of one capture device.
//!
//! Locking:
//!
//! - the control lock serializes preview start/stop and still-capture setup,
//!   and stays held while the preview thread is torn down and joined;
//! - the main lock guards the parameter set and the visible state. It is
//!   only held briefly and nothing else is acquired under it;
//! - the frame lock guards the running pipeline and is held by the preview
//!   thread for one whole grab/convert/deliver step, so teardown never
//!   overlaps a frame;
//! - recording, autofocus and picture callbacks each sit behind their own
//!   lock and are cloned out before being invoked.
//!
//! Lock order is control, then frame, then main or a callback slot.
//! Callbacks run with the frame lock held (preview and recording) or with no
//! lock held (still capture and autofocus), so they may query the controller
//! and toggle recording. Preview and recording callbacks must not call
//! [`CameraHardware::stop_preview`] or [`CameraHardware::take_picture`].

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::callbacks::{
    lock, AutoFocusCallback, Cookie, FrameHeap, JpegCallback, PreviewCallback, RawCallback,
    RecordingCallback, ShutterCallback, Slot,
};
use crate::config::CameraConfig;
use crate::convert::{rgb565_len, yuv420_len, yuyv_len, yuyv_to_jpeg, yuyv_to_rgb565, yuyv_to_yuv420};
use crate::params::{CameraParameters, PICTURE_FORMAT_JPEG, PREVIEW_FORMAT_YUV422SP};
use crate::session::{CaptureConfig, DeviceSession};
use crate::traits::{CameraBackend, CameraDevice, CameraError, Result};

/// Frames between two FPS log lines.
const FPS_WINDOW: u64 = 32;

/// Pause after a failed grab before the preview loop retries.
const GRAB_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Externally visible controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraState {
    /// No session open.
    Closed,
    /// Preview loop running (recording may be on).
    Streaming,
    /// A still capture is in progress; preview is suspended.
    CapturingStill,
}

/// Camera hardware controller.
///
/// Dropping it releases the device: recording and preview are stopped and
/// the preview thread is joined.
pub struct CameraHardware<B: CameraBackend> {
    inner: Arc<Inner<B>>,
}

struct Inner<B: CameraBackend> {
    backend: B,
    config: CameraConfig,
    epoch: Instant,
    control: Mutex<()>,
    main: Mutex<MainState>,
    frame: Mutex<FrameState<B::Device>>,
    stop_requested: AtomicBool,
    recording: Mutex<Slot<RecordingCallback>>,
    autofocus: Mutex<Slot<AutoFocusCallback>>,
    picture: Mutex<PictureSlots>,
    preview_fps: Mutex<FpsCounter>,
    recording_fps: Mutex<FpsCounter>,
}

struct MainState {
    parameters: CameraParameters,
    state: CameraState,
    preview_thread: Option<JoinHandle<()>>,
    preview_heap: Option<FrameHeap>,
    raw_heap: Option<FrameHeap>,
}

struct FrameState<D: CameraDevice> {
    stopped: bool,
    callback: Slot<PreviewCallback>,
    pipeline: Option<Pipeline<D>>,
}

/// Everything the preview thread touches for one frame.
struct Pipeline<D: CameraDevice> {
    session: DeviceSession<D>,
    width: u32,
    height: u32,
    raw: FrameHeap,
    preview: FrameHeap,
    recording: Vec<u8>,
    failures: u64,
}

#[derive(Default)]
struct PictureSlots {
    shutter: Slot<ShutterCallback>,
    raw: Slot<RawCallback>,
    jpeg: Slot<JpegCallback>,
}

enum Step {
    Delivered,
    Skipped,
    Stopped,
}

struct FpsCounter {
    frames: u64,
    last_frames: u64,
    last_time: Instant,
}

impl FpsCounter {
    fn new() -> Self {
        Self {
            frames: 0,
            last_frames: 0,
            last_time: Instant::now(),
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn tick(&mut self, tag: &str) {
        self.frames += 1;
        if self.frames % FPS_WINDOW != 0 {
            return;
        }
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_time).as_secs_f64();
        if elapsed > 0.0 {
            let fps = (self.frames - self.last_frames) as f64 / elapsed;
            info!(tag, frames = self.frames, fps = format_args!("{fps:.2}"), "frame rate");
        }
        self.last_time = now;
        self.last_frames = self.frames;
    }
}

impl<D: CameraDevice> Pipeline<D> {
    fn grab(&mut self) -> Result<()> {
        let mut raw = self.raw.write();
        self.session.grab_frame(&mut raw).map(|_| ())
    }

    fn convert_preview(&self) {
        let raw = self.raw.read();
        let mut preview = self.preview.write();
        yuyv_to_rgb565(&raw, &mut preview, self.width, self.height);
    }

    fn convert_recording(&mut self) {
        let raw = self.raw.read();
        yuyv_to_yuv420(&raw, &mut self.recording, self.width, self.height);
    }

    fn teardown(self) {
        let mut session = self.session;
        session.uninit();
        session.close();
    }
}

impl<B: CameraBackend> CameraHardware<B> {
    /// Create a controller for the device described by `config`.
    ///
    /// Nothing is opened until preview or a still capture starts.
    pub fn new(backend: B, config: CameraConfig) -> Self {
        let defaults = config.default_parameters();
        let parameters = sanitize_parameters(&config, &defaults).unwrap_or_else(|err| {
            error!(%err, "default parameters rejected");
            defaults
        });
        if config.show_fps {
            debug!("FPS logging enabled");
        }

        Self {
            inner: Arc::new(Inner {
                backend,
                config,
                epoch: Instant::now(),
                control: Mutex::new(()),
                main: Mutex::new(MainState {
                    parameters,
                    state: CameraState::Closed,
                    preview_thread: None,
                    preview_heap: None,
                    raw_heap: None,
                }),
                frame: Mutex::new(FrameState {
                    stopped: true,
                    callback: Slot::Idle,
                    pipeline: None,
                }),
                stop_requested: AtomicBool::new(true),
                recording: Mutex::new(Slot::Idle),
                autofocus: Mutex::new(Slot::Idle),
                picture: Mutex::new(PictureSlots::default()),
                preview_fps: Mutex::new(FpsCounter::new()),
                recording_fps: Mutex::new(FpsCounter::new()),
            }),
        }
    }

    /// Configuration the controller was built with.
    pub fn config(&self) -> &CameraConfig {
        &self.inner.config
    }

    /// Open the device at preview size and start delivering frames to
    /// `callback` from a background thread.
    ///
    /// # Errors
    ///
    /// `AlreadyRunning` if preview is active, `OperationInProgress` during a
    /// still capture, or the session error if the device cannot be opened,
    /// configured or started. On error nothing stays open.
    pub fn start_preview(&self, callback: Arc<PreviewCallback>, cookie: Cookie) -> Result<()> {
        let inner = &self.inner;
        let _control = lock(&inner.control);
        {
            let main = lock(&inner.main);
            if main.preview_thread.is_some() {
                debug!("start_preview: already running");
                return Err(CameraError::AlreadyRunning);
            }
            if main.state == CameraState::CapturingStill {
                return Err(CameraError::OperationInProgress);
            }
        }

        let session = inner
            .open_session(inner.config.preview_capture())
            .inspect_err(|err| error!(%err, "start_preview: cannot open device"))?;

        let format = session.format();
        let (width, height) = (format.width, format.height);
        let raw = FrameHeap::new(yuyv_len(width, height));
        let preview = FrameHeap::new(rgb565_len(width, height));
        {
            let mut frame = lock(&inner.frame);
            frame.pipeline = Some(Pipeline {
                session,
                width,
                height,
                raw: raw.clone(),
                preview: preview.clone(),
                recording: vec![0; yuv420_len(width, height)],
                failures: 0,
            });
            frame.callback.register(callback, cookie);
            frame.stopped = false;
        }
        inner.stop_requested.store(false, Ordering::Release);

        let worker = Arc::clone(inner);
        let spawned = thread::Builder::new()
            .name("camera-preview".to_owned())
            .spawn(move || worker.preview_loop());

        match spawned {
            Ok(handle) => {
                let mut main = lock(&inner.main);
                main.preview_thread = Some(handle);
                main.preview_heap = Some(preview);
                main.raw_heap = Some(raw);
                main.state = CameraState::Streaming;
                info!(width, height, "preview started");
                Ok(())
            }
            Err(err) => {
                error!(%err, "start_preview: cannot spawn preview thread");
                inner.stop_requested.store(true, Ordering::Release);
                let pipeline = {
                    let mut frame = lock(&inner.frame);
                    frame.stopped = true;
                    frame.callback.clear();
                    frame.pipeline.take()
                };
                if let Some(pipeline) = pipeline {
                    pipeline.teardown();
                }
                Err(CameraError::Io(err))
            }
        }
    }

    /// Stop preview and wait for the preview thread to exit.
    ///
    /// No preview or recording callback runs after this returns. Harmless
    /// when preview is not running.
    pub fn stop_preview(&self) {
        let _control = lock(&self.inner.control);
        self.inner.shut_down_preview();
    }

    /// Whether the preview thread is running.
    pub fn preview_enabled(&self) -> bool {
        lock(&self.inner.main).preview_thread.is_some()
    }

    /// Deliver planar YUV420 frames to `callback` while preview runs.
    ///
    /// Registering the callback that is already registered is a no-op.
    ///
    /// # Errors
    ///
    /// `OperationInProgress` if a different recording callback is registered.
    pub fn start_recording(&self, callback: Arc<RecordingCallback>, cookie: Cookie) -> Result<()> {
        let mut slot = lock(&self.inner.recording);
        if slot.is_registered() {
            return if slot.holds(&callback) {
                Ok(())
            } else {
                Err(CameraError::OperationInProgress)
            };
        }
        slot.register(callback, cookie);
        debug!("recording started");
        Ok(())
    }

    /// Stop delivering recording frames. Preview keeps running.
    pub fn stop_recording(&self) {
        let mut slot = lock(&self.inner.recording);
        if slot.is_registered() {
            slot.clear();
            debug!("recording stopped");
        }
    }

    /// Whether a recording callback is registered.
    pub fn recording_enabled(&self) -> bool {
        lock(&self.inner.recording).is_registered()
    }

    /// The consumer is done with a recording frame.
    ///
    /// Recording frames are not pooled, so this only feeds FPS logging.
    pub fn release_recording_frame(&self, _frame: &[u8]) {
        if self.inner.config.show_fps {
            lock(&self.inner.recording_fps).tick("Recording");
        }
    }

    /// Start autofocus. `callback` is invoked once from a helper thread with
    /// `true`; there is no focus hardware to drive.
    ///
    /// # Errors
    ///
    /// `OperationInProgress` if a different autofocus callback is still
    /// pending; requesting again with the pending callback succeeds.
    pub fn auto_focus(&self, callback: Arc<AutoFocusCallback>, cookie: Cookie) -> Result<()> {
        {
            let mut slot = lock(&self.inner.autofocus);
            if slot.is_registered() {
                return if slot.holds(&callback) {
                    Ok(())
                } else {
                    Err(CameraError::OperationInProgress)
                };
            }
            slot.register(Arc::clone(&callback), cookie);
        }

        let worker = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name("camera-autofocus".to_owned())
            .spawn(move || worker.finish_auto_focus(&callback));

        if let Err(err) = spawned {
            error!(%err, "auto_focus: cannot spawn thread");
            lock(&self.inner.autofocus).clear();
            return Err(CameraError::Io(err));
        }
        Ok(())
    }

    /// Whether an autofocus callback is registered and not yet delivered.
    pub fn auto_focus_pending(&self) -> bool {
        lock(&self.inner.autofocus).is_registered()
    }

    /// Capture one still frame.
    ///
    /// Stops preview, then on the calling thread: invokes `shutter`, opens
    /// the device at picture size, grabs one frame, closes the device,
    /// delivers the raw frame to `raw` and its JPEG encoding to `jpeg`.
    /// Blocks until done. The device is closed even when the grab fails.
    ///
    /// # Errors
    ///
    /// `OperationInProgress` if another still capture is running, a session
    /// error if the device cannot be opened or read, or `Encoding`.
    pub fn take_picture(
        &self,
        shutter: Option<Arc<ShutterCallback>>,
        raw: Option<Arc<RawCallback>>,
        jpeg: Option<Arc<JpegCallback>>,
        cookie: Cookie,
    ) -> Result<()> {
        let inner = &self.inner;
        let quality = {
            let _control = lock(&inner.control);
            if lock(&inner.main).state == CameraState::CapturingStill {
                return Err(CameraError::OperationInProgress);
            }
            inner.shut_down_preview();
            let mut main = lock(&inner.main);
            main.state = CameraState::CapturingStill;
            main.parameters
                .jpeg_quality()
                .unwrap_or(inner.config.jpeg_quality)
        };

        {
            let mut picture = lock(&inner.picture);
            if let Some(cb) = shutter {
                picture.shutter.register(cb, cookie.clone());
            }
            if let Some(cb) = raw {
                picture.raw.register(cb, cookie.clone());
            }
            if let Some(cb) = jpeg {
                picture.jpeg.register(cb, cookie);
            }
        }

        let result = inner.capture_still(quality);
        if let Err(err) = &result {
            error!(%err, "take_picture failed");
        }

        *lock(&inner.picture) = PictureSlots::default();
        lock(&inner.main).state = CameraState::Closed;
        result
    }

    /// Drop pending still-capture callbacks. Only affects a capture running
    /// concurrently on another thread.
    pub fn cancel_picture(&self, cancel_shutter: bool, cancel_raw: bool, cancel_jpeg: bool) {
        let mut picture = lock(&self.inner.picture);
        if cancel_shutter {
            picture.shutter.clear();
        }
        if cancel_raw {
            picture.raw.clear();
        }
        if cancel_jpeg {
            picture.jpeg.clear();
        }
    }

    /// Replace the parameter set.
    ///
    /// Preview and picture sizes are forced back to the configured ones;
    /// every other key is stored as given.
    ///
    /// # Errors
    ///
    /// `UnsupportedFormat` unless the preview format is `yuv422sp` and the
    /// picture format is `jpeg`. The stored set is left unchanged.
    pub fn set_parameters(&self, params: &CameraParameters) -> Result<()> {
        let sanitized = sanitize_parameters(&self.inner.config, params)?;
        lock(&self.inner.main).parameters = sanitized;
        Ok(())
    }

    /// Copy of the current parameter set.
    pub fn get_parameters(&self) -> CameraParameters {
        lock(&self.inner.main).parameters.clone()
    }

    /// Handle to the RGB565 preview buffer while preview runs.
    pub fn preview_heap(&self) -> Option<FrameHeap> {
        lock(&self.inner.main).preview_heap.clone()
    }

    /// Handle to the raw YUYV buffer while preview runs.
    pub fn raw_heap(&self) -> Option<FrameHeap> {
        lock(&self.inner.main).raw_heap.clone()
    }

    /// Current controller state.
    pub fn state(&self) -> CameraState {
        lock(&self.inner.main).state
    }

    /// Write a human-readable state summary.
    ///
    /// # Errors
    ///
    /// `Io` if writing fails.
    pub fn dump<W: Write>(&self, out: &mut W) -> Result<()> {
        let (state, preview, parameters) = {
            let main = lock(&self.inner.main);
            (main.state, main.preview_thread.is_some(), main.parameters.flatten())
        };
        writeln!(out, "camera {}", self.inner.config.device_path.display())?;
        writeln!(out, "  state: {state:?}")?;
        writeln!(out, "  preview: {preview}")?;
        writeln!(out, "  recording: {}", self.recording_enabled())?;
        writeln!(out, "  autofocus pending: {}", self.auto_focus_pending())?;
        writeln!(out, "  parameters: {parameters}")?;
        Ok(())
    }

    /// Stop recording and preview and drop pending still callbacks.
    pub fn release(&self) {
        self.stop_recording();
        self.stop_preview();
        *lock(&self.inner.picture) = PictureSlots::default();
    }
}

impl<B: CameraBackend> Drop for CameraHardware<B> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<B: CameraBackend> Inner<B> {
    /// Open, map and start a session.
    fn open_session(&self, capture: CaptureConfig) -> Result<DeviceSession<B::Device>> {
        let mut session = DeviceSession::open(&self.backend, capture)?;
        session.set_timeout(self.config.grab_timeout);
        session.init(self.config.ring_capacity)?;
        session.start_streaming()?;
        Ok(session)
    }

    /// Stop the preview thread and release its session. The caller holds
    /// the control lock; the main lock is not held while waiting.
    fn shut_down_preview(&self) {
        self.stop_requested.store(true, Ordering::Release);
        let handle = {
            let mut main = lock(&self.main);
            main.preview_heap = None;
            main.raw_heap = None;
            if main.state == CameraState::Streaming {
                main.state = CameraState::Closed;
            }
            main.preview_thread.take()
        };

        let pipeline = {
            let mut frame = lock(&self.frame);
            frame.stopped = true;
            frame.callback.clear();
            frame.pipeline.take()
        };
        if let Some(pipeline) = pipeline {
            pipeline.teardown();
        }

        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("preview thread panicked");
            }
            info!("preview stopped");
        }
    }

    fn preview_loop(&self) {
        debug!("preview loop running");
        while !self.stop_requested.load(Ordering::Acquire) {
            match self.preview_step() {
                Step::Delivered => {}
                Step::Skipped => thread::sleep(GRAB_RETRY_DELAY),
                Step::Stopped => break,
            }
        }
        debug!("preview loop exited");
    }

    /// One grab/convert/deliver iteration under the frame lock.
    fn preview_step(&self) -> Step {
        let mut frame = lock(&self.frame);
        if frame.stopped {
            return Step::Stopped;
        }
        let FrameState {
            callback, pipeline, ..
        } = &mut *frame;
        let Some(pipeline) = pipeline.as_mut() else {
            return Step::Stopped;
        };

        if let Err(err) = pipeline.grab() {
            pipeline.failures += 1;
            if pipeline.failures == 1 {
                warn!(%err, "preview: frame grab failed");
            } else {
                debug!(%err, failures = pipeline.failures, "preview: frame grab failed");
            }
            return Step::Skipped;
        }
        if pipeline.failures > 0 {
            debug!(failures = pipeline.failures, "preview: frame grab recovered");
            pipeline.failures = 0;
        }

        let recording = lock(&self.recording).get();
        if let Some((record, cookie)) = recording {
            pipeline.convert_recording();
            record(self.timestamp_ns(), pipeline.recording.as_slice(), &cookie);
            if self.config.show_fps {
                lock(&self.recording_fps).tick("Recording");
            }
        } else if self.config.show_fps {
            lock(&self.preview_fps).tick("Preview");
        }

        pipeline.convert_preview();
        if let Some((deliver, cookie)) = callback.get() {
            let preview = pipeline.preview.read();
            deliver(preview.as_slice(), &cookie);
        }
        Step::Delivered
    }

    fn finish_auto_focus(&self, callback: &Arc<AutoFocusCallback>) {
        let cookie = match lock(&self.autofocus).get() {
            Some((_, cookie)) => cookie,
            None => return,
        };
        callback(true, &cookie);

        let mut slot = lock(&self.autofocus);
        if slot.holds(callback) {
            slot.clear();
        }
    }

    fn capture_still(&self, quality: u8) -> Result<()> {
        let shutter = lock(&self.picture).shutter.get();
        if let Some((shutter, cookie)) = shutter {
            shutter(&cookie);
        }

        let mut session = self.open_session(self.config.picture_capture())?;
        let (width, height) = (session.format().width, session.format().height);
        let mut raw = vec![0u8; session.format().frame_len()];
        let grabbed = session.grab_frame(&mut raw);
        session.uninit();
        session.close();
        let metadata = grabbed?;
        debug!(width, height, sequence = metadata.sequence, "still frame captured");

        let raw_cb = lock(&self.picture).raw.get();
        if let Some((deliver, cookie)) = raw_cb {
            deliver(raw.as_slice(), &cookie);
        }

        let jpeg_cb = lock(&self.picture).jpeg.get();
        if let Some((deliver, cookie)) = jpeg_cb {
            let encoded = yuyv_to_jpeg(&raw, width, height, quality)?;
            debug!(bytes = encoded.len(), quality, "still frame encoded");
            deliver(encoded.as_slice(), &cookie);
        }
        Ok(())
    }

    fn timestamp_ns(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}

/// Validate `params` and force the fixed sizes from `config`.
fn sanitize_parameters(config: &CameraConfig, params: &CameraParameters) -> Result<CameraParameters> {
    let preview_format = params.preview_format().unwrap_or_default();
    if preview_format != PREVIEW_FORMAT_YUV422SP {
        error!(format = preview_format, "only {PREVIEW_FORMAT_YUV422SP} preview is supported");
        return Err(CameraError::UnsupportedFormat(format!(
            "preview format {preview_format:?}"
        )));
    }
    let picture_format = params.picture_format().unwrap_or_default();
    if picture_format != PICTURE_FORMAT_JPEG {
        error!(format = picture_format, "only {PICTURE_FORMAT_JPEG} still pictures are supported");
        return Err(CameraError::UnsupportedFormat(format!(
            "picture format {picture_format:?}"
        )));
    }

    debug!(
        preview_size = ?params.preview_size(),
        frame_rate = ?params.preview_frame_rate(),
        picture_size = ?params.picture_size(),
        "parameters requested"
    );

    let mut stored = params.clone();
    let (pw, ph) = config.preview_size;
    let (cw, ch) = config.picture_size;
    stored.set_preview_size(pw, ph);
    stored.set_picture_size(cw, ch);
    Ok(stored)
}
