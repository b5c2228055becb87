//! # Subsampling Engine
//!
//! A tile engine for displaying very large raster images inside a small
//! viewport without decoding the whole image into memory.
//!
//! For a given viewport the engine decides which rectangular regions of the
//! source image to decode and at which power-of-two downsample factor,
//! schedules the decodes on a bounded decoder pool, caches the results and
//! retires work that is no longer relevant.
//!
//! ## Features
//!
//! - **Sample-size calculation**: picks the coarsest resolution that still
//!   looks sharp at the current zoom, bounded by a per-tile memory limit
//! - **Seamless transitions**: tiles of the previous resolution stay visible
//!   until the new ones cover the viewport
//! - **Bounded memory**: byte-budgeted LRU of decoded tiles plus a reuse
//!   pool for pixel buffers; tiles on screen are never evicted
//! - **EXIF orientation**: viewport regions are mapped into source space
//!   before decoding
//!
//! ## Architecture
//!
//! - [`io`] - byte sources for encoded images
//! - [`decode`] - region decoders, backend registry and decoder pool
//! - [`tile`] - calculator, cache, tile manager and renderer snapshots
//! - [`mod@core`] - actor task wiring the manager to viewport input
//! - [`config`] - engine configuration and CLI types
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use subsampling_engine::{EngineConfig, FileImageSource, SubsamplingCore, Viewport};
//! use subsampling_engine::tile::IntSize;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let core = SubsamplingCore::spawn_default(EngineConfig::default())?;
//!     let info = core
//!         .set_image(Arc::new(FileImageSource::new("photo.jpg")))
//!         .await?;
//!
//!     let viewport = Viewport::fit(IntSize::new(1080, 1920), info.display_size());
//!     core.update_viewport(viewport.zoomed(3.0))?;
//!
//!     let mut snapshots = core.snapshots();
//!     snapshots.changed().await?;
//!     println!("sample size {}", snapshots.borrow().sample_size);
//!
//!     core.destroy().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod decode;
pub mod error;
pub mod io;
pub mod tile;

// Re-export commonly used types
pub use crate::core::{CoreEvent, CoreHandle, SubsamplingCore};
pub use config::{Cli, Command, EngineConfig, GestureKind, InspectConfig, SimulateConfig};
pub use decode::{
    DecoderPool, DecoderProvider, DecoderRegistry, ImageCrateProvider, ImageInfo, RegionDecoder,
    SyntheticProvider,
};
pub use error::{DecodeError, EngineError, SourceError};
pub use io::{FileImageSource, ImageSource, MemoryImageSource};
pub use tile::{
    decide, ExifOrientation, IntRect, IntSize, ManagerState, SampleSizeDecision, TileCache,
    TileCacheKey, TileManager, TileSnapshot, TileSnapshotSet, Viewport,
};
