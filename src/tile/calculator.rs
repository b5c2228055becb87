//! Sample-size and tile-grid calculation.
//!
//! These are pure functions: given the intrinsic image size, the size of the
//! viewport and the current zoom, they decide how coarsely the image should be
//! decoded and how it is cut into tiles at that sample size.
//!
//! # Tile sizing
//!
//! Cells are sized so that their *decoded* extent is about half the viewport
//! in each dimension. Tile count therefore depends on how far the user is
//! zoomed in, not on raw image resolution.
//!
//! ```text
//! 6799x4882 image, 500x500 viewport (250x250 decoded tiles)
//!
//!   sample 16 ->  2 x  2      sample 2 -> 14 x 10
//!   sample  8 ->  4 x  3      sample 1 -> 28 x 20
//!   sample  4 ->  7 x  5
//! ```
//!
//! Grids are computed on demand per sample size; nothing is materialized for
//! the whole pyramid.

use serde::Serialize;

use super::geometry::{IntRect, IntSize};

/// Default limit for the decoded byte size of a single tile (32 MiB).
pub const DEFAULT_MAX_TILE_BYTES: usize = 32 * 1024 * 1024;

/// Bytes per decoded pixel assumed when enforcing the tile byte limit.
pub const DECODED_BYTES_PER_PIXEL: u64 = 4;

/// Upper bound on sample sizes considered by the calculator.
pub const MAX_SAMPLE_SIZE: u32 = 1 << 24;

// =============================================================================
// Tile grid
// =============================================================================

/// Column/row address of a cell in a [`TileGrid`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TileCoord {
    pub col: u32,
    pub row: u32,
}

impl TileCoord {
    pub const fn new(col: u32, row: u32) -> Self {
        Self { col, row }
    }
}

/// Partition of the image into tiles for one sample size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TileGrid {
    /// Intrinsic image size
    pub image_size: IntSize,

    /// Downsample factor the cells are decoded at
    pub sample_size: u32,

    /// Decoded extent of a full (unclipped) cell
    pub tile_size: IntSize,

    /// Number of columns
    pub cols: u32,

    /// Number of rows
    pub rows: u32,
}

impl TileGrid {
    /// Source-space extent of a full cell.
    pub fn source_tile_size(&self) -> IntSize {
        IntSize::new(
            self.tile_size.width.saturating_mul(self.sample_size),
            self.tile_size.height.saturating_mul(self.sample_size),
        )
    }

    /// Total number of cells.
    pub fn len(&self) -> usize {
        self.cols as usize * self.rows as usize
    }

    pub fn is_empty(&self) -> bool {
        self.cols == 0 || self.rows == 0
    }

    /// Source rectangle of a cell, clipped to the image bounds.
    ///
    /// Returns `None` for coordinates outside the grid.
    pub fn cell_rect(&self, coord: TileCoord) -> Option<IntRect> {
        if coord.col >= self.cols || coord.row >= self.rows {
            return None;
        }
        let step = self.source_tile_size();
        let left = coord.col.saturating_mul(step.width);
        let top = coord.row.saturating_mul(step.height);
        Some(IntRect::new(
            left,
            top,
            left.saturating_add(step.width).min(self.image_size.width),
            top.saturating_add(step.height).min(self.image_size.height),
        ))
    }

    /// Coordinates of every cell intersecting `rect`, row-major.
    pub fn cells_intersecting(&self, rect: &IntRect) -> Vec<TileCoord> {
        let Some(rect) = rect.intersection(&IntRect::from_size(self.image_size)) else {
            return Vec::new();
        };
        if self.is_empty() {
            return Vec::new();
        }
        let step = self.source_tile_size();
        let col_start = rect.left / step.width;
        let col_end = ((rect.right - 1) / step.width).min(self.cols - 1);
        let row_start = rect.top / step.height;
        let row_end = ((rect.bottom - 1) / step.height).min(self.rows - 1);

        let mut coords = Vec::new();
        for row in row_start..=row_end {
            for col in col_start..=col_end {
                coords.push(TileCoord::new(col, row));
            }
        }
        coords
    }

    /// Every cell with its source rectangle, row-major.
    pub fn cells(&self) -> Vec<(TileCoord, IntRect)> {
        let mut cells = Vec::with_capacity(self.len());
        for row in 0..self.rows {
            for col in 0..self.cols {
                let coord = TileCoord::new(col, row);
                if let Some(rect) = self.cell_rect(coord) {
                    cells.push((coord, rect));
                }
            }
        }
        cells
    }
}

// =============================================================================
// Calculator functions
// =============================================================================

/// Decoded tile extent for a viewport: half the viewport, at least one pixel.
pub fn preferred_tile_size(viewport: IntSize) -> IntSize {
    IntSize::new((viewport.width / 2).max(1), (viewport.height / 2).max(1))
}

/// True when the full-resolution image fits inside the viewport.
pub fn fits_viewport(image: IntSize, viewport: IntSize) -> bool {
    image.width <= viewport.width && image.height <= viewport.height
}

/// Build the tile grid covering `image` at `sample_size`.
///
/// Returns an empty grid (zero columns and rows) when the image or the
/// viewport has zero area, and a single whole-image cell when the image fits
/// the viewport at full resolution.
pub fn build_grid(image: IntSize, sample_size: u32, viewport: IntSize) -> TileGrid {
    let sample_size = sample_size.max(1);
    let mut tile_size = preferred_tile_size(viewport);
    if image.is_empty() || viewport.is_empty() {
        return TileGrid {
            image_size: image,
            sample_size,
            tile_size,
            cols: 0,
            rows: 0,
        };
    }
    let sampled = image.sampled(sample_size);
    if fits_viewport(image, viewport) {
        tile_size = sampled;
    }
    TileGrid {
        image_size: image,
        sample_size,
        tile_size,
        cols: sampled.width.div_ceil(tile_size.width),
        rows: sampled.height.div_ceil(tile_size.height),
    }
}

/// Sample sizes that produce a multi-tile grid, finest first.
///
/// The list runs from 1 up to the largest power of two whose grid still has
/// more than one tile. An empty list means subsampling is unnecessary: the
/// image fits inside the viewport at full resolution.
pub fn grid_sample_sizes(image: IntSize, viewport: IntSize) -> Vec<u32> {
    let mut sizes = Vec::new();
    if image.is_empty() || viewport.is_empty() || fits_viewport(image, viewport) {
        return sizes;
    }
    let mut sample_size = 1u32;
    while sample_size <= MAX_SAMPLE_SIZE {
        let grid = build_grid(image, sample_size, viewport);
        if grid.len() <= 1 {
            break;
        }
        sizes.push(sample_size);
        sample_size *= 2;
    }
    sizes
}

/// Round to the closest power of two in log2 space; ties go to the larger.
pub fn closest_power_of_two(value: f64) -> u32 {
    if !value.is_finite() || value <= 1.0 {
        return 1;
    }
    let exponent = value.log2().round().clamp(0.0, 16.0) as u32;
    1u32 << exponent
}

/// Largest decoded byte size of any tile at `sample_size`.
pub fn max_decoded_tile_bytes(image: IntSize, viewport: IntSize, sample_size: u32) -> u64 {
    let tile = build_grid(image, sample_size, viewport).tile_size;
    let sampled = image.sampled(sample_size);
    let width = tile.width.min(sampled.width) as u64;
    let height = tile.height.min(sampled.height) as u64;
    width * height * DECODED_BYTES_PER_PIXEL
}

/// Smallest sample size whose tiles respect `max_tile_bytes`.
pub fn min_safe_sample_size(image: IntSize, viewport: IntSize, max_tile_bytes: usize) -> u32 {
    let limit = (max_tile_bytes as u64).max(DECODED_BYTES_PER_PIXEL);
    let mut sample_size = 1u32;
    while sample_size < MAX_SAMPLE_SIZE
        && max_decoded_tile_bytes(image, viewport, sample_size) > limit
    {
        sample_size *= 2;
    }
    sample_size
}

/// Choose the sample size for the current zoom.
///
/// `viewport` is the size the whole image occupies on screen at scale 1
/// (the fitted content size); `scale` is the user zoom on top of that.
/// The zoom-derived factor is `image / (viewport * scale)` rounded to the
/// nearest power of two, ties preferring the coarser value. The result is
/// then raised until a single decoded tile fits `max_tile_bytes`.
pub fn choose_sample_size(
    image: IntSize,
    viewport: IntSize,
    scale: f32,
    max_tile_bytes: usize,
) -> u32 {
    if image.is_empty() || viewport.is_empty() || !scale.is_finite() || scale <= 0.0 {
        return 1;
    }
    let ratio_w = image.width as f64 / viewport.width as f64;
    let ratio_h = image.height as f64 / viewport.height as f64;
    let factor = ratio_w.min(ratio_h) / scale as f64;
    let zoom_sample = closest_power_of_two(factor);
    zoom_sample.max(min_safe_sample_size(image, viewport, max_tile_bytes))
}

/// Outcome of the calculator for one viewport state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SampleSizeDecision {
    /// Chosen sample size
    pub sample_size: u32,

    /// Grid at the chosen sample size (empty when subsampling is inactive)
    pub grid: TileGrid,

    /// Whether tiles are worth decoding at all
    pub subsampling: bool,
}

/// Run the full calculator: pick a sample size and build its grid.
///
/// `content` is the fitted on-screen size of the image at scale 1 and drives
/// the sample size; `container` is the viewport and drives tile sizing.
/// Subsampling is reported inactive for degenerate sizes, for images that fit
/// the container at full resolution, and when the chosen sample size is
/// coarser than the coarsest multi-tile grid (a single full-image decode
/// already covers it).
pub fn decide(
    image: IntSize,
    content: IntSize,
    container: IntSize,
    scale: f32,
    max_tile_bytes: usize,
) -> SampleSizeDecision {
    let zoom_sample = choose_sample_size(image, content, scale, max_tile_bytes);
    let sample_size = zoom_sample.max(min_safe_sample_size(image, container, max_tile_bytes));
    let coarsest = grid_sample_sizes(image, container).last().copied();
    match coarsest {
        Some(coarsest) if !content.is_empty() && sample_size <= coarsest => SampleSizeDecision {
            sample_size,
            grid: build_grid(image, sample_size, container),
            subsampling: true,
        },
        _ => SampleSizeDecision {
            sample_size,
            grid: build_grid(IntSize::default(), sample_size, container),
            subsampling: false,
        },
    }
}
