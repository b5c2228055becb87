//! Decoder backend built on the `image` crate.
//!
//! # Design Decisions
//!
//! - **Header-only probe**: dimensions, format and orientation come from the
//!   codec's header parser; no pixels are decoded.
//!
//! - **Shared full decode**: the codecs offer no partial decoding, so the first
//!   region request decodes the whole raster once. Every instance created by
//!   the same factory shares that raster; regions are cut and box-filtered
//!   from it. The tile engine above stays codec-agnostic.
//!
//! - **Bounded full decode**: that shared raster lives outside the tile cache
//!   budget, so images whose RGBA size exceeds `max_raster_bytes` are refused
//!   at probe time with [`DecodeError::RegionUnsupported`]. The host falls
//!   back to a plain single-bitmap display for those.
//!
//! - **Source orientation**: pixels are kept unrotated. Orientation is applied
//!   by the tile manager when mapping between display and source space.

use std::io::Cursor;
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use image::metadata::Orientation;
use image::{ImageDecoder, ImageFormat, ImageReader, RgbaImage};
use tracing::debug;

use crate::error::DecodeError;
use crate::tile::{ExifOrientation, IntRect, IntSize, Raster, RasterAllocator};

use super::decoder::{box_downsample, DecoderFactory, DecoderProvider, ImageInfo, RegionDecoder};

/// Formats this backend claims.
const SUPPORTED_FORMATS: &[ImageFormat] = &[ImageFormat::Jpeg, ImageFormat::Png];

type SharedPixels = Arc<OnceLock<Result<Arc<RgbaImage>, String>>>;

// =============================================================================
// Provider
// =============================================================================

/// Default ceiling on the shared full raster (256 MiB of RGBA).
pub const DEFAULT_MAX_RASTER_BYTES: u64 = 256 * 1024 * 1024;

/// Claims JPEG and PNG streams.
#[derive(Debug, Clone, Copy)]
pub struct ImageCrateProvider {
    max_raster_bytes: u64,
}

impl ImageCrateProvider {
    /// Provider refusing images whose decoded RGBA raster exceeds
    /// `max_raster_bytes`.
    pub fn with_max_raster_bytes(max_raster_bytes: u64) -> Self {
        Self { max_raster_bytes }
    }

    pub fn max_raster_bytes(&self) -> u64 {
        self.max_raster_bytes
    }
}

impl Default for ImageCrateProvider {
    fn default() -> Self {
        Self::with_max_raster_bytes(DEFAULT_MAX_RASTER_BYTES)
    }
}

impl DecoderProvider for ImageCrateProvider {
    fn name(&self) -> &str {
        "image"
    }

    fn supports(&self, header: &[u8]) -> bool {
        image::guess_format(header).is_ok_and(|format| SUPPORTED_FORMATS.contains(&format))
    }

    fn factory(&self, data: Bytes) -> Arc<dyn DecoderFactory> {
        Arc::new(ImageCrateFactory {
            data,
            pixels: Arc::new(OnceLock::new()),
            max_raster_bytes: self.max_raster_bytes,
        })
    }
}

// =============================================================================
// Factory
// =============================================================================

struct ImageCrateFactory {
    data: Bytes,
    pixels: SharedPixels,
    max_raster_bytes: u64,
}

impl DecoderFactory for ImageCrateFactory {
    fn name(&self) -> &str {
        "image"
    }

    fn create(&self) -> Result<Box<dyn RegionDecoder>, DecodeError> {
        Ok(Box::new(ImageCrateDecoder {
            data: self.data.clone(),
            pixels: Arc::clone(&self.pixels),
            max_raster_bytes: self.max_raster_bytes,
            probed: false,
        }))
    }
}

// =============================================================================
// Decoder
// =============================================================================

struct ImageCrateDecoder {
    data: Bytes,
    pixels: SharedPixels,
    max_raster_bytes: u64,
    probed: bool,
}

impl ImageCrateDecoder {
    fn check_raster_size(&self, width: u32, height: u32) -> Result<(), DecodeError> {
        let bytes = width as u64 * height as u64 * 4;
        if bytes > self.max_raster_bytes {
            return Err(DecodeError::RegionUnsupported {
                reason: format!(
                    "{}x{} needs {} bytes decoded, limit is {}",
                    width, height, bytes, self.max_raster_bytes
                ),
            });
        }
        Ok(())
    }

    fn full_raster(&self) -> Result<Arc<RgbaImage>, DecodeError> {
        if let Some(result) = self.pixels.get() {
            return result.clone().map_err(DecodeError::DecodeFailure);
        }
        // Unprobed instances still honor the ceiling
        let (width, height) = ImageReader::new(Cursor::new(&self.data[..]))
            .with_guessed_format()
            .map_err(|e| DecodeError::DecodeFailure(e.to_string()))?
            .into_dimensions()
            .map_err(|e| DecodeError::DecodeFailure(e.to_string()))?;
        self.check_raster_size(width, height)?;

        let result = self.pixels.get_or_init(|| {
            debug!(bytes = self.data.len(), "Decoding full raster for region access");
            image::load_from_memory(&self.data)
                .map(|img| Arc::new(img.to_rgba8()))
                .map_err(|e| e.to_string())
        });
        match result {
            Ok(pixels) => Ok(Arc::clone(pixels)),
            Err(message) => Err(DecodeError::DecodeFailure(message.clone())),
        }
    }
}

impl RegionDecoder for ImageCrateDecoder {
    fn probe(&mut self) -> Result<ImageInfo, DecodeError> {
        if self.probed {
            return Err(DecodeError::AlreadyProbed);
        }
        self.probed = true;

        let reader = ImageReader::new(Cursor::new(&self.data[..]))
            .with_guessed_format()
            .map_err(|e| DecodeError::ProbeFailure(e.to_string()))?;
        let format = reader
            .format()
            .ok_or_else(|| DecodeError::ProbeFailure("unrecognized image format".to_string()))?;
        let mut decoder = reader
            .into_decoder()
            .map_err(|e| DecodeError::ProbeFailure(e.to_string()))?;

        let (width, height) = decoder.dimensions();
        self.check_raster_size(width, height)?;
        // Missing or unreadable EXIF is not fatal
        let orientation = decoder
            .orientation()
            .map(exif_orientation)
            .unwrap_or_default();

        Ok(ImageInfo {
            width,
            height,
            mime_type: format.to_mime_type().to_string(),
            orientation,
        })
    }

    fn decode_region(
        &mut self,
        rect: IntRect,
        sample_size: u32,
        alloc: &dyn RasterAllocator,
    ) -> Result<Raster, DecodeError> {
        let pixels = self.full_raster()?;
        let size = IntSize::new(pixels.width(), pixels.height());
        box_downsample(pixels.as_raw(), size, rect, sample_size, alloc)
    }
}

#[allow(unreachable_patterns)]
fn exif_orientation(orientation: Orientation) -> ExifOrientation {
    match orientation {
        Orientation::NoTransforms => ExifOrientation::Normal,
        Orientation::FlipHorizontal => ExifOrientation::FlipHorizontal,
        Orientation::Rotate180 => ExifOrientation::Rotate180,
        Orientation::FlipVertical => ExifOrientation::FlipVertical,
        Orientation::Rotate90FlipH => ExifOrientation::Transpose,
        Orientation::Rotate90 => ExifOrientation::Rotate90,
        Orientation::Rotate270FlipH => ExifOrientation::Transverse,
        Orientation::Rotate270 => ExifOrientation::Rotate270,
        _ => ExifOrientation::Normal,
    }
}
