//! Snapshot frame compression
//!
//! PNG → RGB8 → JPEG at the configured quality, with an optional
//! aspect-preserving nearest-neighbour downscale. Palette, grayscale and
//! 16-bit inputs are normalized to 8-bit RGB by the decode step. On any
//! decode or encode failure the original PNG bytes pass through unchanged
//! so the wireframe is still emitted.

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{ExtendedColorType, ImageFormat};

use crate::error::Result;

/// A compressed frame and its final pixel dimensions
pub(crate) struct CompressedFrame {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Compress one PNG frame. Falls back to the input bytes (and the
/// caller-supplied dimensions) when re-encoding fails.
pub(crate) fn compress_snapshot(
    png: &[u8],
    width: u32,
    height: u32,
    quality: u8,
    max_dimension: u32,
) -> CompressedFrame {
    match reencode(png, quality, max_dimension) {
        Ok(frame) => frame,
        Err(err) => {
            tracing::debug!(error = %err, "JPEG re-encode failed, keeping PNG bytes");
            CompressedFrame {
                bytes: png.to_vec(),
                width,
                height,
            }
        }
    }
}

fn reencode(png: &[u8], quality: u8, max_dimension: u32) -> Result<CompressedFrame> {
    let decoded = image::load_from_memory_with_format(png, ImageFormat::Png)?;

    let decoded = if max_dimension > 0
        && (decoded.width() > max_dimension || decoded.height() > max_dimension)
    {
        decoded.resize(max_dimension, max_dimension, FilterType::Nearest)
    } else {
        decoded
    };

    let rgb = decoded.to_rgb8();
    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, quality.clamp(1, 100)).encode(
        rgb.as_raw(),
        rgb.width(),
        rgb.height(),
        ExtendedColorType::Rgb8,
    )?;

    Ok(CompressedFrame {
        bytes: jpeg,
        width: rgb.width(),
        height: rgb.height(),
    })
}
