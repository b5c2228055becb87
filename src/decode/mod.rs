//! Region decoding layer.
//!
//! This module turns encoded image bytes into decoded tiles. Backends are
//! selected by capability probing rather than by type:
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │              TileManager                │
//! └────────────────────┬────────────────────┘
//!                      │ decode(rect, sample_size)
//!                      ▼
//! ┌─────────────────────────────────────────┐
//! │             DecoderPool                 │
//! │  (bounded, one instance per decode)     │
//! └────────────────────┬────────────────────┘
//!                      │ create()
//!                      ▼
//! ┌─────────────────────────────────────────┐
//! │    DecoderFactory (from registry)       │
//! └────────────────────┬────────────────────┘
//!          ┌───────────┴───────────┐
//!          ▼                       ▼
//! ┌─────────────────┐    ┌─────────────────────┐
//! │ ImageCrate      │    │ Synthetic           │
//! │ (JPEG, PNG)     │    │ (generated pixels)  │
//! └─────────────────┘    └─────────────────────┘
//! ```
//!
//! # Components
//!
//! - [`RegionDecoder`]: `probe` + `decode_region` on one instance
//! - [`DecoderFactory`]: creates instances for one image
//! - [`DecoderProvider`]: claims a format from its header and builds factories
//! - [`DecoderRegistry`]: ordered provider list used to resolve a source
//! - [`DecoderPool`]: bounded set of instances shared by in-flight decodes

mod decoder;
mod image_backend;
mod pool;
mod registry;
mod synthetic;

pub use decoder::{
    box_downsample, validate_region, DecoderFactory, DecoderProvider, ImageInfo, RegionDecoder,
};
pub use image_backend::{ImageCrateProvider, DEFAULT_MAX_RASTER_BYTES};
pub use pool::{CancelFlag, DecoderPool, DEFAULT_MAX_DECODERS};
pub use registry::DecoderRegistry;
pub use synthetic::{encode_synthetic, synthetic_pixel, SyntheticProvider, SYNTHETIC_MAGIC};
