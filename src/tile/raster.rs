//! Decoded pixel buffers.

use std::fmt;

use serde::Serialize;

use super::geometry::IntSize;

/// Pixel layout of a decoded buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PixelFormat {
    Rgba8,
    Rgb8,
    Luma8,
}

impl PixelFormat {
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgba8 => 4,
            PixelFormat::Rgb8 => 3,
            PixelFormat::Luma8 => 1,
        }
    }
}

/// A decoded region of an image.
pub struct Raster {
    width: u32,
    height: u32,
    format: PixelFormat,
    data: Vec<u8>,
}

impl Raster {
    /// Wrap a pixel buffer.
    ///
    /// The buffer is truncated or zero-extended to exactly
    /// `width * height * bytes_per_pixel` bytes.
    pub fn new(width: u32, height: u32, format: PixelFormat, mut data: Vec<u8>) -> Self {
        data.resize(Self::expected_len(width, height, format), 0);
        Self {
            width,
            height,
            format,
            data,
        }
    }

    /// Number of bytes a buffer of this shape occupies.
    pub fn expected_len(width: u32, height: u32, format: PixelFormat) -> usize {
        width as usize * height as usize * format.bytes_per_pixel()
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn size(&self) -> IntSize {
        IntSize::new(self.width, self.height)
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn byte_size(&self) -> usize {
        self.data.len()
    }

    /// Pixel at `(x, y)` as a byte slice of `bytes_per_pixel` length.
    pub fn pixel(&self, x: u32, y: u32) -> Option<&[u8]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let bpp = self.format.bytes_per_pixel();
        let start = (y as usize * self.width as usize + x as usize) * bpp;
        self.data.get(start..start + bpp)
    }

    /// Take the backing buffer for reuse.
    pub fn into_buffer(self) -> Vec<u8> {
        self.data
    }
}

impl fmt::Debug for Raster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Raster")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Source of pixel buffers for decoders.
///
/// The tile cache implements this so decoders can draw recycled buffers of
/// the right shape instead of allocating fresh ones.
pub trait RasterAllocator: Send + Sync {
    /// A buffer of exactly `width * height * bytes_per_pixel` bytes.
    /// Contents are unspecified.
    fn acquire_buffer(&self, width: u32, height: u32, format: PixelFormat) -> Vec<u8>;
}

/// Allocator that always hands out fresh zeroed buffers.
#[derive(Debug, Clone, Copy, Default)]
pub struct FreshAllocator;

impl RasterAllocator for FreshAllocator {
    fn acquire_buffer(&self, width: u32, height: u32, format: PixelFormat) -> Vec<u8> {
        vec![0u8; Raster::expected_len(width, height, format)]
    }
}
