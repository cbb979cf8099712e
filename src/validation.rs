//! Frame validation utilities for test pattern verification.
//!
//! These checks run on converted RGB565 preview frames, so they exercise the
//! whole grab-and-convert path. Useful for integration testing with virtual
//! cameras.

use crate::convert::unpack_rgb565;
use crate::traits::{CameraError, FrameMetadata, Result};

/// Expected RGB values for 100% color bars (8 bars) after conversion.
///
/// Colors in order: White, Yellow, Cyan, Green, Magenta, Red, Blue, Black
const COLOR_BARS: [(u8, u8, u8); 8] = [
    (255, 255, 255), // White
    (255, 255, 0),   // Yellow
    (0, 255, 255),   // Cyan
    (0, 255, 0),     // Green
    (255, 0, 255),   // Magenta
    (255, 0, 0),     // Red
    (0, 0, 255),     // Blue
    (0, 0, 0),       // Black
];

/// Tolerance for RGB color matching (covers RGB565 quantization and
/// integer conversion error).
const COLOR_TOLERANCE: i32 = 15;

/// Read the RGB value of pixel `(x, y)` from a little-endian RGB565 frame.
///
/// Returns `None` if the coordinates fall outside the buffer.
#[must_use]
pub fn pixel_at(rgb565: &[u8], x: u32, y: u32, width: u32) -> Option<(u8, u8, u8)> {
    if x >= width {
        return None;
    }
    let offset = (y as usize * width as usize + x as usize) * 2;
    let lo = *rgb565.get(offset)?;
    let hi = *rgb565.get(offset + 1)?;
    Some(unpack_rgb565(u16::from_le_bytes([lo, hi])))
}

/// Validates that a preview frame contains the 100% color bar pattern.
///
/// Samples the center of each of the 8 vertical stripes on the middle row.
///
/// # Errors
///
/// Returns `Validation` if a sample is out of bounds or any bar doesn't
/// match the expected color within tolerance.
pub fn validate_color_bars(rgb565: &[u8], width: u32, height: u32) -> Result<()> {
    let bar_width = width / 8;
    let center_y = height / 2;

    for (bar_idx, expected_rgb) in COLOR_BARS.iter().enumerate() {
        #[allow(clippy::cast_possible_truncation)]
        let sample_x = (bar_idx as u32 * bar_width) + (bar_width / 2);

        let actual_rgb = pixel_at(rgb565, sample_x, center_y, width).ok_or_else(|| {
            CameraError::Validation(format!("Failed to get pixel at ({sample_x}, {center_y})"))
        })?;

        if !colors_match(actual_rgb, *expected_rgb, COLOR_TOLERANCE) {
            return Err(CameraError::Validation(format!(
                "Color bar {bar_idx} mismatch at ({sample_x}, {center_y}): \
                 expected RGB{expected_rgb:?}, got RGB{actual_rgb:?}"
            )));
        }
    }

    Ok(())
}

/// Validates that a preview frame contains a horizontal gradient.
///
/// Luminance along the middle row must never drop (beyond rounding) and must
/// rise by at least 50 across the frame.
///
/// # Errors
///
/// Returns `Validation` if the gradient is not monotonic or too flat.
pub fn validate_gradient(rgb565: &[u8], width: u32, height: u32) -> Result<()> {
    let center_y = height / 2;
    let sample_step = 10usize;
    let mut first_luminance: Option<f32> = None;
    let mut prev_luminance: Option<f32> = None;

    for x in (0..width).step_by(sample_step) {
        let (r, g, b) = pixel_at(rgb565, x, center_y, width).ok_or_else(|| {
            CameraError::Validation(format!("Failed to get pixel at ({x}, {center_y})"))
        })?;

        // Y' in Rec. 601
        let luminance = 0.114f32.mul_add(
            f32::from(b),
            0.587f32.mul_add(f32::from(g), 0.299 * f32::from(r)),
        );

        if first_luminance.is_none() {
            first_luminance = Some(luminance);
        }

        if let Some(prev) = prev_luminance {
            // RGB565 quantization can step green down by a few units
            if luminance < prev - 4.0 {
                return Err(CameraError::Validation(format!(
                    "Gradient not monotonically increasing at x={x}: \
                     luminance {luminance} < previous {prev}"
                )));
            }
        }

        prev_luminance = Some(luminance);
    }

    if let (Some(first), Some(last)) = (first_luminance, prev_luminance) {
        let luminance_change = last - first;
        if luminance_change < 50.0 {
            return Err(CameraError::Validation(format!(
                "Insufficient luminance change for gradient: {luminance_change} \
                 (expected at least 50.0)"
            )));
        }
    }

    Ok(())
}

/// Validates that frame sequence numbers increment by 1 with no gaps.
///
/// # Errors
///
/// Returns `Validation` if the slice is empty or a gap is found.
pub fn validate_frame_sequence(frames: &[FrameMetadata]) -> Result<()> {
    if frames.is_empty() {
        return Err(CameraError::Validation(
            "Cannot validate empty frame sequence".to_owned(),
        ));
    }

    for (i, pair) in frames.windows(2).enumerate() {
        let [prev, curr] = pair else {
            continue;
        };
        if curr.sequence != prev.sequence.wrapping_add(1) {
            return Err(CameraError::Validation(format!(
                "Frame sequence gap at index {}: expected {}, got {}",
                i + 1,
                prev.sequence.wrapping_add(1),
                curr.sequence
            )));
        }
    }

    Ok(())
}

fn colors_match(actual: (u8, u8, u8), expected: (u8, u8, u8), tolerance: i32) -> bool {
    let (ar, ag, ab) = actual;
    let (er, eg, eb) = expected;

    let r_diff = i32::from(ar).abs_diff(i32::from(er));
    let g_diff = i32::from(ag).abs_diff(i32::from(eg));
    let b_diff = i32::from(ab).abs_diff(i32::from(eb));

    #[allow(clippy::cast_sign_loss)]
    let tol = tolerance as u32;

    r_diff <= tol && g_diff <= tol && b_diff <= tol
}
