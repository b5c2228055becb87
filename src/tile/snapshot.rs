//! Snapshots published to the renderer.
//!
//! The manager never hands out references into its own state. After every
//! refresh and every attached decode it builds a [`TileSnapshotSet`] and sends
//! it over a `watch` channel; the renderer paints background tiles first,
//! then foreground tiles on top.

use std::sync::Arc;

use serde::Serialize;

use super::calculator::TileCoord;
use super::cache::RasterOrigin;
use super::geometry::IntRect;
use super::raster::Raster;

/// Load progress of a single tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LoadState {
    /// Waiting for a decode slot (or paused by a gesture)
    Pending,
    /// Decode in flight
    Loading,
    /// Payload attached
    Loaded,
    /// Decode failed; not retried until the tile is recreated
    Error,
}

/// Fade-in bookkeeping for a tile.
///
/// The renderer drives the actual animation; the manager only records whether
/// one should start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AnimationState {
    /// Draw at full opacity
    None,
    /// Freshly decoded; the renderer should fade it in from transparent
    FadeIn,
}

/// Immutable view of one tile.
#[derive(Debug, Clone, Serialize)]
pub struct TileSnapshot {
    pub coordinate: TileCoord,
    pub source_rect: IntRect,
    pub sample_size: u32,
    pub load_state: LoadState,
    pub animation: AnimationState,
    /// Starting opacity, 0..=255
    pub alpha: u8,
    pub origin: Option<RasterOrigin>,
    #[serde(skip)]
    pub payload: Option<Arc<Raster>>,
}

impl TileSnapshot {
    pub fn is_loaded(&self) -> bool {
        self.load_state == LoadState::Loaded && self.payload.is_some()
    }
}

/// Everything the renderer needs for one frame.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TileSnapshotSet {
    /// Tiles at the current sample size
    pub foreground_tiles: Vec<TileSnapshot>,
    /// Tiles from previous sample sizes kept until the foreground is ready
    pub background_tiles: Vec<TileSnapshot>,
    /// Current foreground sample size (0 when inactive)
    pub sample_size: u32,
    /// Source-space region tiles are kept for
    pub image_load_rect: IntRect,
    /// Monotonic counter, bumped on every publish
    pub version: u64,
}

impl TileSnapshotSet {
    /// Tiles with an attached payload, background first.
    pub fn drawable(&self) -> impl Iterator<Item = &TileSnapshot> {
        self.background_tiles
            .iter()
            .chain(self.foreground_tiles.iter())
            .filter(|tile| tile.is_loaded())
    }

    pub fn is_empty(&self) -> bool {
        self.foreground_tiles.is_empty() && self.background_tiles.is_empty()
    }

    /// Fraction of `image_load_rect` covered by loaded tiles of one layer.
    pub fn coverage(tiles: &[TileSnapshot], load_rect: &IntRect) -> f64 {
        if load_rect.is_empty() {
            return 0.0;
        }
        let covered: u64 = tiles
            .iter()
            .filter(|tile| tile.is_loaded())
            .filter_map(|tile| tile.source_rect.intersection(load_rect))
            .map(|rect| rect.area())
            .sum();
        covered as f64 / load_rect.area() as f64
    }
}
