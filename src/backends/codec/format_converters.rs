// SPDX-License-Identifier: GPL-3.0-only
//! Raw frame to RGB conversion for the software encoder
//!
//! Every converter takes a packed frame whose line stride may exceed the
//! visible width (drivers pad lines) and produces tightly packed RGB24.
//! Missing trailing bytes decode as black.

use super::types::encodings;
use v4l::FourCC;

/// Bytes per pixel of a supported raw encoding
pub fn bytes_per_pixel(encoding: FourCC) -> Option<usize> {
    match encoding {
        e if e == encodings::YUYV || e == encodings::UYVY => Some(2),
        e if e == encodings::RGB24 || e == encodings::BGR24 => Some(3),
        e if e == encodings::GREY => Some(1),
        _ => None,
    }
}

/// Convert a raw frame to RGB24, `None` for unsupported encodings
///
/// `bytes_per_line` is the negotiated stride. Zero derives it from the
/// frame length, which only holds when the driver pads nothing past the
/// last line.
pub fn to_rgb(
    encoding: FourCC,
    data: &[u8],
    width: u32,
    height: u32,
    bytes_per_line: u32,
) -> Option<Vec<u8>> {
    let bpp = bytes_per_pixel(encoding)?;
    let row_bytes = width as usize * bpp;
    let stride = match bytes_per_line as usize {
        0 => line_stride(data.len(), row_bytes, height),
        stride => stride.max(row_bytes),
    };

    let mut rgb = Vec::with_capacity(width as usize * height as usize * 3);
    for row in 0..height as usize {
        let start = (row * stride).min(data.len());
        let end = (start + row_bytes).min(data.len());
        let line = &data[start..end];

        match encoding {
            e if e == encodings::YUYV => yuyv_row(line, width, &mut rgb),
            e if e == encodings::UYVY => uyvy_row(line, width, &mut rgb),
            e if e == encodings::RGB24 => rgb.extend_from_slice(line),
            e if e == encodings::BGR24 => {
                for px in line.chunks_exact(3) {
                    rgb.extend_from_slice(&[px[2], px[1], px[0]]);
                }
            }
            _ => {
                for &gray in line {
                    rgb.extend_from_slice(&[gray, gray, gray]);
                }
            }
        }

        // Pad a short line
        let expected = (row + 1) * width as usize * 3;
        rgb.resize(expected, 0);
    }

    Some(rgb)
}

/// Stride implied by the frame size, never below the packed row size
fn line_stride(len: usize, row_bytes: usize, height: u32) -> usize {
    if height == 0 {
        return row_bytes;
    }
    (len / height as usize).max(row_bytes)
}

/// BT.601 YUV to RGB
fn yuv_to_rgb(y: f32, u: f32, v: f32) -> [u8; 3] {
    let r = (y + 1.402 * v).clamp(0.0, 255.0) as u8;
    let g = (y - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8;
    let b = (y + 1.772 * u).clamp(0.0, 255.0) as u8;
    [r, g, b]
}

/// YUYV: Y0 U0 Y1 V0 - each 4-byte group encodes 2 pixels
fn yuyv_row(line: &[u8], width: u32, rgb: &mut Vec<u8>) {
    let mut emitted = 0;
    for chunk in line.chunks_exact(4) {
        let y0 = chunk[0] as f32;
        let u = chunk[1] as f32 - 128.0;
        let y1 = chunk[2] as f32;
        let v = chunk[3] as f32 - 128.0;

        for y in [y0, y1] {
            if emitted == width {
                return;
            }
            rgb.extend_from_slice(&yuv_to_rgb(y, u, v));
            emitted += 1;
        }
    }
}

/// UYVY: U0 Y0 V0 Y1 - each 4-byte group encodes 2 pixels
fn uyvy_row(line: &[u8], width: u32, rgb: &mut Vec<u8>) {
    let mut emitted = 0;
    for chunk in line.chunks_exact(4) {
        let u = chunk[0] as f32 - 128.0;
        let y0 = chunk[1] as f32;
        let v = chunk[2] as f32 - 128.0;
        let y1 = chunk[3] as f32;

        for y in [y0, y1] {
            if emitted == width {
                return;
            }
            rgb.extend_from_slice(&yuv_to_rgb(y, u, v));
            emitted += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_neutral_grey() {
        // Two pixels, Y=128, no chroma
        let data = [128, 128, 128, 128];
        let rgb = to_rgb(encodings::YUYV, &data, 2, 1, 0).unwrap();
        assert_eq!(rgb, vec![128; 6]);
    }

    #[test]
    fn test_bgr_swaps_channels() {
        let rgb = to_rgb(encodings::BGR24, &[1, 2, 3], 1, 1, 0).unwrap();
        assert_eq!(rgb, vec![3, 2, 1]);
    }

    #[test]
    fn test_padded_stride_is_skipped() {
        // 1x2 GREY with 4-byte stride
        let data = [10, 0xff, 0xff, 0xff, 20, 0xff, 0xff, 0xff];
        let rgb = to_rgb(encodings::GREY, &data, 1, 2, 0).unwrap();
        assert_eq!(rgb, vec![10, 10, 10, 20, 20, 20]);

        let rgb = to_rgb(encodings::GREY, &data, 1, 2, 4).unwrap();
        assert_eq!(rgb, vec![10, 10, 10, 20, 20, 20]);
    }

    #[test]
    fn test_negotiated_stride_ignores_trailing_padding() {
        // 4x2 GREY, tight rows, size_image padded by one extra line
        let data = [1, 1, 1, 1, 2, 2, 2, 2, 0, 0, 0, 0];
        let rgb = to_rgb(encodings::GREY, &data, 4, 2, 4).unwrap();
        let luma: Vec<u8> = rgb.chunks_exact(3).map(|px| px[0]).collect();
        assert_eq!(luma, vec![1, 1, 1, 1, 2, 2, 2, 2]);
    }

    #[test]
    fn test_negotiated_stride_with_padded_yuyv_lines() {
        // 2x2 YUYV, 8-byte stride carrying 4 bytes of line padding
        let data = [
            50, 128, 50, 128, 0xff, 0xff, 0xff, 0xff, //
            90, 128, 90, 128, 0xff, 0xff, 0xff, 0xff, //
            0, 0, 0, 0,
        ];
        let rgb = to_rgb(encodings::YUYV, &data, 2, 2, 8).unwrap();
        assert_eq!(&rgb[..6], &[50; 6]);
        assert_eq!(&rgb[6..], &[90; 6]);
    }

    #[test]
    fn test_short_frame_pads_black() {
        let rgb = to_rgb(encodings::GREY, &[7], 2, 2, 0).unwrap();
        assert_eq!(rgb.len(), 12);
        assert_eq!(&rgb[..3], &[7, 7, 7]);
        assert!(rgb[3..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_unsupported_encoding() {
        assert!(to_rgb(encodings::I420, &[0; 16], 2, 2, 0).is_none());
    }
}
