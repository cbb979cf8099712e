//! Pixel format conversion from the camera's packed YUYV 4:2:2 output.
//!
//! Every function here is stateless. Callers size the buffers for the
//! declared dimensions (see the `*_len` helpers); undersized buffers are left
//! untouched rather than partially written.

use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

use crate::traits::{CameraError, Result};

/// Bytes in a packed YUYV 4:2:2 frame.
#[must_use]
pub const fn yuyv_len(width: u32, height: u32) -> usize {
    width as usize * height as usize * 2
}

/// Bytes in an RGB565 frame.
#[must_use]
pub const fn rgb565_len(width: u32, height: u32) -> usize {
    width as usize * height as usize * 2
}

/// Bytes in a planar YUV 4:2:0 frame: full Y plane plus quarter-size U and V.
#[must_use]
pub const fn yuv420_len(width: u32, height: u32) -> usize {
    let luma = width as usize * height as usize;
    let chroma = (width as usize / 2) * (height as usize / 2);
    luma + 2 * chroma
}

/// Convert one YUV sample to clamped RGB using the integer BT.601
/// approximation (studio-range luma expanded to full range).
#[must_use]
#[allow(clippy::many_single_char_names)]
pub fn yuv_to_rgb(y: u8, u: u8, v: u8) -> (u8, u8, u8) {
    let c = 1192 * (i32::from(y) - 16);
    let d = i32::from(u) - 128;
    let e = i32::from(v) - 128;

    let r = (c + 1634 * e) >> 10;
    let g = (c - 833 * e - 400 * d) >> 10;
    let b = (c + 2066 * d) >> 10;

    (clamp_channel(r), clamp_channel(g), clamp_channel(b))
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
const fn clamp_channel(value: i32) -> u8 {
    if value < 0 {
        0
    } else if value > 255 {
        255
    } else {
        value as u8
    }
}

/// Pack an RGB triple into a 16-bit RGB565 sample.
#[must_use]
pub fn pack_rgb565(r: u8, g: u8, b: u8) -> u16 {
    (u16::from(r >> 3) << 11) | (u16::from(g >> 2) << 5) | u16::from(b >> 3)
}

/// Expand an RGB565 sample back to 8-bit channels (low bits zero).
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn unpack_rgb565(pixel: u16) -> (u8, u8, u8) {
    let r = ((pixel >> 11) & 0x1f) as u8;
    let g = ((pixel >> 5) & 0x3f) as u8;
    let b = (pixel & 0x1f) as u8;
    (r << 3, g << 2, b << 3)
}

/// Convert YUYV 4:2:2 to little-endian RGB565.
///
/// Each 4-byte macropixel `[Y0 U Y1 V]` yields two output pixels sharing the
/// chroma pair. `dst` must hold [`rgb565_len`] bytes.
pub fn yuyv_to_rgb565(src: &[u8], dst: &mut [u8], width: u32, height: u32) {
    let len = yuyv_len(width, height);
    if src.len() < len || dst.len() < rgb565_len(width, height) {
        return;
    }

    for (macropixel, out) in src
        .chunks_exact(4)
        .zip(dst.chunks_exact_mut(4))
        .take(len / 4)
    {
        let (Ok(&[y0, u, y1, v]), Ok(out)) =
            (<&[u8; 4]>::try_from(macropixel), <&mut [u8; 4]>::try_from(out))
        else {
            continue;
        };
        let (r, g, b) = yuv_to_rgb(y0, u, v);
        let [a0, a1] = pack_rgb565(r, g, b).to_le_bytes();
        let (r, g, b) = yuv_to_rgb(y1, u, v);
        let [b0, b1] = pack_rgb565(r, g, b).to_le_bytes();
        *out = [a0, a1, b0, b1];
    }
}

/// Rearrange YUYV 4:2:2 into planar YUV 4:2:0 (I420 plane order).
///
/// The Y plane keeps every luma sample. Each U/V sample is the rounded
/// average of the two rows covering its 2x2 luma block. `dst` must hold
/// [`yuv420_len`] bytes.
pub fn yuyv_to_yuv420(src: &[u8], dst: &mut [u8], width: u32, height: u32) {
    if src.len() < yuyv_len(width, height) || dst.len() < yuv420_len(width, height) {
        return;
    }

    let w = width as usize;
    let h = height as usize;
    let chroma_w = w / 2;
    let chroma_len = chroma_w * (h / 2);
    let row_len = w * 2;
    if row_len == 0 || chroma_w == 0 {
        return;
    }

    let (y_plane, chroma) = dst.split_at_mut(w * h);
    let (u_plane, rest) = chroma.split_at_mut(chroma_len);
    let (v_plane, _) = rest.split_at_mut(chroma_len);

    for (row, y_row) in src.chunks_exact(row_len).zip(y_plane.chunks_exact_mut(w)) {
        for (macropixel, luma) in row.chunks_exact(4).zip(y_row.chunks_exact_mut(2)) {
            if let (Ok(&[y0, _, y1, _]), Ok(luma)) =
                (<&[u8; 4]>::try_from(macropixel), <&mut [u8; 2]>::try_from(luma))
            {
                *luma = [y0, y1];
            }
        }
    }

    let rows = src.chunks_exact(row_len * 2);
    let chroma_rows = u_plane
        .chunks_exact_mut(chroma_w)
        .zip(v_plane.chunks_exact_mut(chroma_w));
    for (pair, (u_row, v_row)) in rows.zip(chroma_rows) {
        let (top, bottom) = pair.split_at(row_len);
        let samples = top.chunks_exact(4).zip(bottom.chunks_exact(4));
        for ((upper, lower), (u, v)) in samples.zip(u_row.iter_mut().zip(v_row.iter_mut())) {
            if let (Ok(&[_, u0, _, v0]), Ok(&[_, u1, _, v1])) =
                (<&[u8; 4]>::try_from(upper), <&[u8; 4]>::try_from(lower))
            {
                *u = average(u0, u1);
                *v = average(v0, v1);
            }
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn average(a: u8, b: u8) -> u8 {
    ((a as u16 + b as u16 + 1) / 2) as u8
}

/// Convert YUYV 4:2:2 to packed RGB24 using [`yuv_to_rgb`].
#[must_use]
pub fn yuyv_to_rgb24(src: &[u8], width: u32, height: u32) -> Vec<u8> {
    let pixels = width as usize * height as usize;
    let mut rgb = Vec::with_capacity(pixels * 3);
    for macropixel in src.chunks_exact(4).take(pixels / 2) {
        if let Ok(&[y0, u, y1, v]) = <&[u8; 4]>::try_from(macropixel) {
            let (r, g, b) = yuv_to_rgb(y0, u, v);
            rgb.extend_from_slice(&[r, g, b]);
            let (r, g, b) = yuv_to_rgb(y1, u, v);
            rgb.extend_from_slice(&[r, g, b]);
        }
    }
    rgb
}

/// Encode a YUYV 4:2:2 frame as a baseline JPEG.
///
/// `quality` follows the usual 0-100 scale; 0 is treated as 1, the lowest
/// quality the encoder accepts.
pub fn yuyv_to_jpeg(src: &[u8], width: u32, height: u32, quality: u8) -> Result<Vec<u8>> {
    if src.len() < yuyv_len(width, height) {
        return Err(CameraError::Encoding(format!(
            "raw frame holds {} bytes, {width}x{height} needs {}",
            src.len(),
            yuyv_len(width, height)
        )));
    }

    let rgb = yuyv_to_rgb24(src, width, height);
    let mut jpeg = Vec::new();
    {
        let mut encoder =
            JpegEncoder::new_with_quality(Cursor::new(&mut jpeg), quality.clamp(1, 100));
        encoder
            .encode(&rgb, width, height, ExtendedColorType::Rgb8)
            .map_err(|err| CameraError::Encoding(err.to_string()))?;
    }

    Ok(jpeg)
}
