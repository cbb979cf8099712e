//! Camera parameter set.
//!
//! Parameters are plain string key/value pairs, flattened as
//! `key=value;key=value` for transport. Only a handful of keys carry meaning
//! for the hardware; everything else is stored and returned untouched.

use std::collections::BTreeMap;
use std::fmt;

use crate::traits::{CameraError, Result};

/// Preview size, `WxH`.
pub const KEY_PREVIEW_SIZE: &str = "preview-size";
/// Preview frame rate in frames per second.
pub const KEY_PREVIEW_FRAME_RATE: &str = "preview-frame-rate";
/// Preview pixel format.
pub const KEY_PREVIEW_FORMAT: &str = "preview-format";
/// Still picture size, `WxH`.
pub const KEY_PICTURE_SIZE: &str = "picture-size";
/// Still picture format.
pub const KEY_PICTURE_FORMAT: &str = "picture-format";
/// JPEG quality, 0 to 100.
pub const KEY_JPEG_QUALITY: &str = "jpeg-quality";
/// Comma-separated list of advertised picture sizes.
pub const KEY_PICTURE_SIZE_VALUES: &str = "picture-size-values";

/// The only preview format the hardware accepts.
pub const PREVIEW_FORMAT_YUV422SP: &str = "yuv422sp";
/// The only picture format the hardware accepts.
pub const PICTURE_FORMAT_JPEG: &str = "jpeg";

/// Ordered string key/value parameter set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CameraParameters {
    values: BTreeMap<String, String>,
}

impl CameraParameters {
    /// Empty parameter set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a flattened `key=value;key=value` string.
    ///
    /// Empty entries and entries without `=` are skipped.
    #[must_use]
    pub fn unflatten(flat: &str) -> Self {
        let values = flat
            .split(';')
            .filter_map(|entry| entry.split_once('='))
            .filter(|(key, _)| !key.is_empty())
            .map(|(key, value)| (key.to_owned(), value.to_owned()))
            .collect();
        Self { values }
    }

    /// Flatten to `key=value;key=value`, keys in sorted order.
    #[must_use]
    pub fn flatten(&self) -> String {
        self.to_string()
    }

    /// Store `value` under `key`.
    ///
    /// # Errors
    ///
    /// `UnsupportedFormat` if either side contains `;` or `=`, which would
    /// break the flattened form, or if the key is empty.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let reserved = |s: &str| s.contains([';', '=']);
        if key.is_empty() || reserved(key) || reserved(value) {
            return Err(CameraError::UnsupportedFormat(format!(
                "invalid parameter {key:?}={value:?}"
            )));
        }
        self.values.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    /// Raw value for `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Drop `key`.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.values.remove(key)
    }

    /// Iterate over all pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether no keys are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn get_int(&self, key: &str) -> Option<u32> {
        self.get(key)?.trim().parse().ok()
    }

    fn put(&mut self, key: &str, value: String) {
        self.values.insert(key.to_owned(), value);
    }

    /// Requested preview size.
    #[must_use]
    pub fn preview_size(&self) -> Option<(u32, u32)> {
        parse_size(self.get(KEY_PREVIEW_SIZE)?)
    }

    /// Set the preview size.
    pub fn set_preview_size(&mut self, width: u32, height: u32) {
        self.put(KEY_PREVIEW_SIZE, format!("{width}x{height}"));
    }

    /// Requested preview frame rate.
    #[must_use]
    pub fn preview_frame_rate(&self) -> Option<u32> {
        self.get_int(KEY_PREVIEW_FRAME_RATE)
    }

    /// Set the preview frame rate.
    pub fn set_preview_frame_rate(&mut self, fps: u32) {
        self.put(KEY_PREVIEW_FRAME_RATE, fps.to_string());
    }

    /// Requested preview format.
    #[must_use]
    pub fn preview_format(&self) -> Option<&str> {
        self.get(KEY_PREVIEW_FORMAT)
    }

    /// Set the preview format.
    pub fn set_preview_format(&mut self, format: &str) {
        self.put(KEY_PREVIEW_FORMAT, format.to_owned());
    }

    /// Requested picture size.
    #[must_use]
    pub fn picture_size(&self) -> Option<(u32, u32)> {
        parse_size(self.get(KEY_PICTURE_SIZE)?)
    }

    /// Set the picture size.
    pub fn set_picture_size(&mut self, width: u32, height: u32) {
        self.put(KEY_PICTURE_SIZE, format!("{width}x{height}"));
    }

    /// Requested picture format.
    #[must_use]
    pub fn picture_format(&self) -> Option<&str> {
        self.get(KEY_PICTURE_FORMAT)
    }

    /// Set the picture format.
    pub fn set_picture_format(&mut self, format: &str) {
        self.put(KEY_PICTURE_FORMAT, format.to_owned());
    }

    /// JPEG quality, clamped to 0..=100.
    #[must_use]
    pub fn jpeg_quality(&self) -> Option<u8> {
        self.get_int(KEY_JPEG_QUALITY)
            .and_then(|q| u8::try_from(q.min(100)).ok())
    }

    /// Set the JPEG quality (clamped to 100).
    pub fn set_jpeg_quality(&mut self, quality: u8) {
        self.put(KEY_JPEG_QUALITY, quality.min(100).to_string());
    }

    /// Advertised picture sizes. Malformed entries are skipped.
    #[must_use]
    pub fn supported_picture_sizes(&self) -> Vec<(u32, u32)> {
        self.get(KEY_PICTURE_SIZE_VALUES)
            .map(|list| list.split(',').filter_map(parse_size).collect())
            .unwrap_or_default()
    }

    /// Set the advertised picture sizes.
    pub fn set_supported_picture_sizes(&mut self, sizes: &[(u32, u32)]) {
        let list = sizes
            .iter()
            .map(|(w, h)| format!("{w}x{h}"))
            .collect::<Vec<_>>()
            .join(",");
        self.put(KEY_PICTURE_SIZE_VALUES, list);
    }
}

impl fmt::Display for CameraParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, value)) in self.values.iter().enumerate() {
            if i > 0 {
                f.write_str(";")?;
            }
            write!(f, "{key}={value}")?;
        }
        Ok(())
    }
}

/// Parse `WxH` into `(width, height)`.
#[must_use]
pub fn parse_size(s: &str) -> Option<(u32, u32)> {
    let (w, h) = s.trim().split_once('x')?;
    Some((w.parse().ok()?, h.parse().ok()?))
}
