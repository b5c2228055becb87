//! Capability traits shared by every decoder backend.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::DecodeError;
use crate::tile::{ExifOrientation, IntRect, IntSize, PixelFormat, Raster, RasterAllocator};

// =============================================================================
// ImageInfo
// =============================================================================

/// Intrinsic properties of an image, read from its header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    /// Width in pixels, before orientation is applied
    pub width: u32,

    /// Height in pixels, before orientation is applied
    pub height: u32,

    /// MIME type, e.g. `image/jpeg`
    pub mime_type: String,

    /// Stored EXIF orientation
    pub orientation: ExifOrientation,
}

impl ImageInfo {
    /// Unrotated source size.
    pub fn size(&self) -> IntSize {
        IntSize::new(self.width, self.height)
    }

    /// Size as displayed, after orientation.
    pub fn display_size(&self) -> IntSize {
        self.orientation.display_size(self.size())
    }
}

// =============================================================================
// Traits
// =============================================================================

/// One decoder instance bound to one image.
///
/// An instance is used by one decode at a time (`&mut self`); parallelism
/// comes from pooling several instances. `probe` is called at most once per
/// instance and must not decode pixel data.
pub trait RegionDecoder: Send {
    /// Read dimensions, MIME type and orientation from the header.
    fn probe(&mut self) -> Result<ImageInfo, DecodeError>;

    /// Decode `rect` (source space) at `1 / sample_size` linear resolution.
    ///
    /// The result is `ceil(w / s) x ceil(h / s)`. Buffers should come from
    /// `alloc` so recycled memory is reused.
    fn decode_region(
        &mut self,
        rect: IntRect,
        sample_size: u32,
        alloc: &dyn RasterAllocator,
    ) -> Result<Raster, DecodeError>;
}

/// Creates decoder instances for a single image.
pub trait DecoderFactory: Send + Sync {
    /// Backend name, for logging.
    fn name(&self) -> &str;

    fn create(&self) -> Result<Box<dyn RegionDecoder>, DecodeError>;
}

/// A decoder backend that can claim images by inspecting their header.
pub trait DecoderProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Capability probe over the first bytes of the stream.
    fn supports(&self, header: &[u8]) -> bool;

    /// Build a factory for an image this provider claimed.
    fn factory(&self, data: Bytes) -> Arc<dyn DecoderFactory>;
}

// =============================================================================
// Helpers for backends
// =============================================================================

/// Reject empty or out-of-bounds rectangles and zero sample sizes.
pub fn validate_region(rect: IntRect, sample_size: u32, image: IntSize) -> Result<(), DecodeError> {
    if sample_size == 0 {
        return Err(DecodeError::InvalidSampleSize(sample_size));
    }
    if rect.is_empty() || !IntRect::from_size(image).contains(&rect) {
        return Err(DecodeError::InvalidRegion {
            rect,
            width: image.width,
            height: image.height,
        });
    }
    Ok(())
}

/// Box-filter a region of a packed RGBA8 buffer.
///
/// `pixels` is `image.width * image.height * 4` bytes, row-major. Each output
/// pixel averages the `sample_size x sample_size` block it covers, clipped at
/// the region edge.
pub fn box_downsample(
    pixels: &[u8],
    image: IntSize,
    rect: IntRect,
    sample_size: u32,
    alloc: &dyn RasterAllocator,
) -> Result<Raster, DecodeError> {
    validate_region(rect, sample_size, image)?;
    let expected = image.area() as usize * 4;
    if pixels.len() < expected {
        return Err(DecodeError::DecodeFailure(format!(
            "pixel buffer holds {} bytes, expected {}",
            pixels.len(),
            expected
        )));
    }

    let out = rect.size().sampled(sample_size);
    let mut buffer = alloc.acquire_buffer(out.width, out.height, PixelFormat::Rgba8);
    buffer.resize(Raster::expected_len(out.width, out.height, PixelFormat::Rgba8), 0);
    let stride = image.width as usize * 4;

    for oy in 0..out.height {
        let y0 = rect.top + oy * sample_size;
        let y1 = (y0 + sample_size).min(rect.bottom);
        for ox in 0..out.width {
            let x0 = rect.left + ox * sample_size;
            let x1 = (x0 + sample_size).min(rect.right);

            let mut sum = [0u64; 4];
            for y in y0..y1 {
                let row = y as usize * stride;
                for x in x0..x1 {
                    let i = row + x as usize * 4;
                    for (c, total) in sum.iter_mut().enumerate() {
                        *total += pixels[i + c] as u64;
                    }
                }
            }
            let count = ((y1 - y0) * (x1 - x0)) as u64;
            let o = (oy as usize * out.width as usize + ox as usize) * 4;
            for (c, total) in sum.iter().enumerate() {
                buffer[o + c] = (total / count) as u8;
            }
        }
    }

    Ok(Raster::new(out.width, out.height, PixelFormat::Rgba8, buffer))
}
