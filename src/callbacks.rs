//! Client callbacks and the buffers handed to them.
//!
//! Every callback role (preview, recording, shutter, raw, JPEG, autofocus)
//! is a single [`Slot`]: either `Idle` or `Registered` with a callback and
//! the client's [`Cookie`]. Callbacks run synchronously on whichever thread
//! produced the data and must not keep the slice past the call.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Preview frame: converted RGB565 buffer.
pub type PreviewCallback = dyn Fn(&[u8], &Cookie) + Send + Sync;
/// Recording frame: monotonic timestamp in nanoseconds and planar YUV420 buffer.
pub type RecordingCallback = dyn Fn(u64, &[u8], &Cookie) + Send + Sync;
/// The still frame has been exposed.
pub type ShutterCallback = dyn Fn(&Cookie) + Send + Sync;
/// Raw YUYV still frame.
pub type RawCallback = dyn Fn(&[u8], &Cookie) + Send + Sync;
/// Encoded JPEG still.
pub type JpegCallback = dyn Fn(&[u8], &Cookie) + Send + Sync;
/// Autofocus finished; `true` when focused.
pub type AutoFocusCallback = dyn Fn(bool, &Cookie) + Send + Sync;

/// Opaque client value passed back with every callback.
#[derive(Clone, Default)]
pub struct Cookie(Option<Arc<dyn Any + Send + Sync>>);

impl Cookie {
    /// Wrap a client value.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Some(Arc::new(value)))
    }

    /// Empty cookie.
    #[must_use]
    pub const fn none() -> Self {
        Self(None)
    }

    /// Borrow the wrapped value if it is a `T`.
    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.as_deref()?.downcast_ref()
    }

    /// Whether a value is wrapped.
    #[must_use]
    pub const fn is_some(&self) -> bool {
        self.0.is_some()
    }
}

impl fmt::Debug for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.0.is_some() { "Cookie(..)" } else { "Cookie(None)" })
    }
}

/// Registration state of one callback role.
pub enum Slot<C: ?Sized> {
    /// Nothing registered.
    Idle,
    /// A callback waits for its event.
    Registered {
        /// The client callback.
        callback: Arc<C>,
        /// Client cookie handed back on invocation.
        cookie: Cookie,
    },
}

impl<C: ?Sized> Default for Slot<C> {
    fn default() -> Self {
        Self::Idle
    }
}

impl<C: ?Sized> fmt::Debug for Slot<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("Idle"),
            Self::Registered { cookie, .. } => f
                .debug_struct("Registered")
                .field("cookie", cookie)
                .finish_non_exhaustive(),
        }
    }
}

impl<C: ?Sized> Slot<C> {
    /// Register `callback`, replacing whatever was there.
    pub fn register(&mut self, callback: Arc<C>, cookie: Cookie) {
        *self = Self::Registered { callback, cookie };
    }

    /// Back to `Idle`.
    pub fn clear(&mut self) {
        *self = Self::Idle;
    }

    /// Whether a callback is registered.
    #[must_use]
    pub const fn is_registered(&self) -> bool {
        matches!(self, Self::Registered { .. })
    }

    /// Whether the registered callback is the very same object as `callback`.
    #[must_use]
    pub fn holds(&self, callback: &Arc<C>) -> bool {
        match self {
            Self::Idle => false,
            Self::Registered { callback: held, .. } => {
                std::ptr::addr_eq(Arc::as_ptr(held), Arc::as_ptr(callback))
            }
        }
    }

    /// Clone out the callback and cookie so the slot lock can be released
    /// before invoking it.
    #[must_use]
    pub fn get(&self) -> Option<(Arc<C>, Cookie)> {
        match self {
            Self::Idle => None,
            Self::Registered { callback, cookie } => Some((Arc::clone(callback), cookie.clone())),
        }
    }
}

/// Shared handle to an output buffer (preview or raw frame).
///
/// Clones refer to the same memory. Contents are only meaningful while
/// preview is running.
#[derive(Clone, Default)]
pub struct FrameHeap(Arc<RwLock<Vec<u8>>>);

impl FrameHeap {
    /// Zero-filled heap of `len` bytes.
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self(Arc::new(RwLock::new(vec![0; len])))
    }

    /// Size in bytes.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether the heap holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Copy of the current contents.
    pub fn snapshot(&self) -> Vec<u8> {
        self.read().clone()
    }

    /// Whether both handles refer to the same buffer.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for FrameHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameHeap").field("len", &self.len()).finish()
    }
}

/// Lock `mutex`, taking over the data if a callback panicked while holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
