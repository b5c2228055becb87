//! Generated test-pattern images.
//!
//! A synthetic stream is a one-line ASCII header:
//!
//! ```text
//! SYNTH <width> <height> [orientation]
//! ```
//!
//! Decoding produces a deterministic gradient with a 256-pixel checkerboard
//! in the blue channel, so images of any size can be explored without
//! storing pixels. Each output pixel samples the top-left source pixel of
//! its block.

use std::sync::Arc;

use bytes::Bytes;

use crate::error::DecodeError;
use crate::tile::{ExifOrientation, IntRect, IntSize, PixelFormat, Raster, RasterAllocator};

use super::decoder::{validate_region, DecoderFactory, DecoderProvider, ImageInfo, RegionDecoder};

/// Leading bytes of a synthetic stream.
pub const SYNTHETIC_MAGIC: &[u8] = b"SYNTH ";

/// Build the encoded form of a synthetic image.
pub fn encode_synthetic(width: u32, height: u32, orientation: ExifOrientation) -> Bytes {
    Bytes::from(format!(
        "SYNTH {} {} {}\n",
        width,
        height,
        orientation.to_exif()
    ))
}

/// Pixel value at a source coordinate.
pub fn synthetic_pixel(x: u32, y: u32, size: IntSize) -> [u8; 4] {
    let r = (x as u64 * 255 / size.width.max(1) as u64) as u8;
    let g = (y as u64 * 255 / size.height.max(1) as u64) as u8;
    let b = if ((x / 256) + (y / 256)) % 2 == 0 { 0 } else { 255 };
    [r, g, b, 255]
}

fn parse_header(data: &[u8]) -> Result<ImageInfo, DecodeError> {
    let line = data
        .split(|&b| b == b'\n')
        .next()
        .and_then(|line| std::str::from_utf8(line).ok())
        .ok_or_else(|| DecodeError::ProbeFailure("synthetic header is not ASCII".to_string()))?;

    let mut fields = line.split_whitespace();
    if fields.next() != Some("SYNTH") {
        return Err(DecodeError::ProbeFailure(
            "missing synthetic magic".to_string(),
        ));
    }

    let mut dimension = |name: &str| -> Result<u32, DecodeError> {
        fields
            .next()
            .and_then(|v| v.parse::<u32>().ok())
            .filter(|&v| v > 0)
            .ok_or_else(|| DecodeError::ProbeFailure(format!("invalid synthetic {}", name)))
    };
    let width = dimension("width")?;
    let height = dimension("height")?;

    let orientation = match fields.next() {
        None => ExifOrientation::Normal,
        Some(v) => v
            .parse::<u16>()
            .ok()
            .and_then(ExifOrientation::from_exif)
            .ok_or_else(|| DecodeError::ProbeFailure(format!("invalid orientation '{}'", v)))?,
    };

    Ok(ImageInfo {
        width,
        height,
        mime_type: "image/x-synthetic".to_string(),
        orientation,
    })
}

// =============================================================================
// Provider / factory / decoder
// =============================================================================

/// Claims streams starting with [`SYNTHETIC_MAGIC`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SyntheticProvider;

impl DecoderProvider for SyntheticProvider {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn supports(&self, header: &[u8]) -> bool {
        header.starts_with(SYNTHETIC_MAGIC)
    }

    fn factory(&self, data: Bytes) -> Arc<dyn DecoderFactory> {
        Arc::new(SyntheticFactory { data })
    }
}

struct SyntheticFactory {
    data: Bytes,
}

impl DecoderFactory for SyntheticFactory {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn create(&self) -> Result<Box<dyn RegionDecoder>, DecodeError> {
        Ok(Box::new(SyntheticDecoder {
            data: self.data.clone(),
            info: None,
            probed: false,
        }))
    }
}

struct SyntheticDecoder {
    data: Bytes,
    info: Option<ImageInfo>,
    probed: bool,
}

impl SyntheticDecoder {
    fn info(&mut self) -> Result<&ImageInfo, DecodeError> {
        if self.info.is_none() {
            self.info = Some(parse_header(&self.data)?);
        }
        self.info
            .as_ref()
            .ok_or_else(|| DecodeError::ProbeFailure("synthetic header unavailable".to_string()))
    }
}

impl RegionDecoder for SyntheticDecoder {
    fn probe(&mut self) -> Result<ImageInfo, DecodeError> {
        if self.probed {
            return Err(DecodeError::AlreadyProbed);
        }
        self.probed = true;
        self.info().cloned()
    }

    fn decode_region(
        &mut self,
        rect: IntRect,
        sample_size: u32,
        alloc: &dyn RasterAllocator,
    ) -> Result<Raster, DecodeError> {
        let size = self.info()?.size();
        validate_region(rect, sample_size, size)?;

        let out = rect.size().sampled(sample_size);
        let mut buffer = alloc.acquire_buffer(out.width, out.height, PixelFormat::Rgba8);
        buffer.clear();
        buffer.reserve(Raster::expected_len(out.width, out.height, PixelFormat::Rgba8));
        for oy in 0..out.height {
            let y = rect.top + oy * sample_size;
            for ox in 0..out.width {
                let x = rect.left + ox * sample_size;
                buffer.extend_from_slice(&synthetic_pixel(x, y, size));
            }
        }
        Ok(Raster::new(out.width, out.height, PixelFormat::Rgba8, buffer))
    }
}
