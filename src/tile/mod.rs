//! Tile engine layer.
//!
//! This module decides which regions of the image to decode, at which
//! sample size, and keeps the decoded results around.
//!
//! # Architecture
//!
//! ```text
//!            Viewport (scale, visible rect, gesture)
//!                      │
//!                      ▼
//! ┌─────────────────────────────────────────┐
//! │              TileManager                │
//! │  ┌──────────────┐  ┌─────────────────┐  │
//! │  │  Calculator  │  │  Foreground /   │  │
//! │  │  (sample     │  │  background     │  │
//! │  │   size, grid)│  │  tile sets      │  │
//! │  └──────────────┘  └─────────────────┘  │
//! └──────────┬──────────────────┬───────────┘
//!            │ decode           │ TileSnapshotSet
//!            ▼                  ▼
//! ┌────────────────────┐   (renderer)
//! │ DecoderPool        │
//! └─────────┬──────────┘
//!           │ Raster
//!           ▼
//! ┌─────────────────────────────────────────┐
//! │   TileCache (LRU + buffer reuse pool)   │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Components
//!
//! - [`TileManager`]: lifecycle state machine, refresh diffing and decode scheduling
//! - [`decide`] / [`build_grid`]: pure sample-size and tile-grid calculation
//! - [`TileCache`]: byte-bounded LRU of decoded tiles with display pinning
//! - [`RasterHandle`]: move-only reference to a cached raster
//! - [`TileSnapshotSet`]: immutable view published to the renderer
//! - [`ExifOrientation`]: mapping between display and source space
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use subsampling_engine::tile::{IntRect, PixelFormat, Raster, TileCache, TileCacheKey};
//!
//! let cache = TileCache::with_capacity(8 * 1024 * 1024);
//! let key = TileCacheKey::new("photo.jpg", IntRect::new(0, 0, 512, 512), 4);
//!
//! let raster = Raster::new(128, 128, PixelFormat::Rgba8, Vec::new());
//! let handle = cache.put(key.clone(), raster);
//! cache.mark_displayed(&key, true);
//! assert_eq!(handle.width(), 128);
//! assert!(cache.is_displayed(&key));
//! ```

mod cache;
mod calculator;
mod geometry;
mod manager;
mod raster;
mod snapshot;
mod viewport;

pub use cache::{
    CacheStats, RasterHandle, RasterOrigin, TileCache, TileCacheKey, DEFAULT_BUFFER_POOL_CAPACITY,
    DEFAULT_TILE_CACHE_CAPACITY,
};
pub use calculator::{
    build_grid, choose_sample_size, closest_power_of_two, decide, fits_viewport,
    grid_sample_sizes, max_decoded_tile_bytes, min_safe_sample_size, preferred_tile_size,
    SampleSizeDecision, TileCoord, TileGrid, DECODED_BYTES_PER_PIXEL, DEFAULT_MAX_TILE_BYTES,
    MAX_SAMPLE_SIZE,
};
pub use geometry::{ExifOrientation, IntRect, IntSize};
pub use manager::{DecodeOutcome, ManagerState, OutcomeStatus, RefreshSummary, TileManager};
pub use raster::{FreshAllocator, PixelFormat, Raster, RasterAllocator};
pub use snapshot::{AnimationState, LoadState, TileSnapshot, TileSnapshotSet};
pub use viewport::{fit_content, Viewport};
