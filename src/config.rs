//! Configuration for the subsampling engine and the `subsample` CLI.
//!
//! The engine itself is configured with a plain [`EngineConfig`]. The CLI
//! exposes the same knobs as flags, each of which can also be set through a
//! `SUBSAMPLE_`-prefixed environment variable:
//!
//! - `SUBSAMPLE_CACHE_SIZE` - Tile cache budget (default: 192MiB)
//! - `SUBSAMPLE_BUFFER_POOL_SIZE` - Buffer reuse pool budget (default: 32MiB)
//! - `SUBSAMPLE_MAX_DECODERS` - Decoder instances per image (default: 2)
//! - `SUBSAMPLE_PREFETCH_MARGIN` - Load-rect margin in decoded pixels
//! - `SUBSAMPLE_MAX_TILE_SIZE` - Decoded byte limit of one tile (default: 32MiB)
//! - `SUBSAMPLE_MAX_FULL_RASTER_SIZE` - Largest image the `image` backend decodes whole (default: 256MiB)
//! - `SUBSAMPLE_PAUSED_GESTURES` - Gestures that pause decoding (default: pinch,fling)
//! - `SUBSAMPLE_RESIZE_DEBOUNCE_MS` - Container resize debounce (default: 100)
//! - `SUBSAMPLE_TILE_FADE` - Fade freshly decoded tiles in (default: false)
//!
//! Sizes accept plain bytes or a unit suffix: `512KB`, `256MB`, `1GiB`.
//!
//! # Example
//!
//! ```
//! use subsampling_engine::config::{parse_byte_size, EngineConfig};
//!
//! let config = EngineConfig {
//!     cache_bytes: parse_byte_size("256MB").unwrap(),
//!     ..EngineConfig::default()
//! };
//! assert!(config.validate().is_ok());
//! ```

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};

use crate::decode::{DEFAULT_MAX_DECODERS, DEFAULT_MAX_RASTER_BYTES};
use crate::tile::{
    IntSize, DEFAULT_BUFFER_POOL_CAPACITY, DEFAULT_MAX_TILE_BYTES, DEFAULT_TILE_CACHE_CAPACITY,
};

// =============================================================================
// Default Values
// =============================================================================

/// Default debounce window for container size changes.
pub const DEFAULT_RESIZE_DEBOUNCE: Duration = Duration::from_millis(100);

/// Upper bound on decoder instances per image.
pub const MAX_DECODERS_LIMIT: usize = 16;

// =============================================================================
// Gesture kinds
// =============================================================================

/// Continuous gesture reported by the viewport engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum GestureKind {
    Pinch,
    Fling,
    Drag,
    Scroll,
    Animation,
}

// =============================================================================
// Engine configuration
// =============================================================================

/// Tunables of one engine instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Tile cache budget in bytes
    pub cache_bytes: usize,

    /// Buffer reuse pool budget in bytes
    pub buffer_pool_bytes: usize,

    /// Decoder instances per image
    pub max_decoders: usize,

    /// Load-rect margin in decoded pixels; half a tile edge when unset
    pub prefetch_margin: Option<u32>,

    /// Decoded byte limit of a single tile
    pub max_tile_bytes: usize,

    /// RGBA size above which backends without partial decoding refuse an image
    pub max_full_raster_bytes: usize,

    /// Gestures during which no decode is dispatched
    pub paused_gestures: Vec<GestureKind>,

    /// Debounce window for container size changes
    pub resize_debounce: Duration,

    /// Report freshly decoded tiles with a fade-in
    pub tile_fade: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_bytes: DEFAULT_TILE_CACHE_CAPACITY,
            buffer_pool_bytes: DEFAULT_BUFFER_POOL_CAPACITY,
            max_decoders: DEFAULT_MAX_DECODERS,
            prefetch_margin: None,
            max_tile_bytes: DEFAULT_MAX_TILE_BYTES,
            max_full_raster_bytes: DEFAULT_MAX_RASTER_BYTES as usize,
            paused_gestures: vec![GestureKind::Pinch, GestureKind::Fling],
            resize_debounce: DEFAULT_RESIZE_DEBOUNCE,
            tile_fade: false,
        }
    }
}

impl EngineConfig {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.cache_bytes == 0 {
            return Err("cache_bytes must be greater than 0".to_string());
        }
        if self.max_decoders == 0 || self.max_decoders > MAX_DECODERS_LIMIT {
            return Err(format!(
                "max_decoders must be between 1 and {}",
                MAX_DECODERS_LIMIT
            ));
        }
        // A tile must hold at least one RGBA pixel
        if self.max_tile_bytes < 4 {
            return Err("max_tile_bytes must be at least 4".to_string());
        }
        if self.max_full_raster_bytes < 4 {
            return Err("max_full_raster_bytes must be at least 4".to_string());
        }
        if self.resize_debounce > Duration::from_secs(10) {
            return Err("resize_debounce must not exceed 10s".to_string());
        }
        Ok(())
    }
}

/// Parse a byte size such as `1048576`, `512KB`, `256MB` or `1GiB`.
///
/// Decimal (`KB`, `MB`, `GB`) and binary (`KiB`, `MiB`, `GiB`) suffixes are
/// both accepted and treated as powers of 1024. Case-insensitive.
pub fn parse_byte_size(value: &str) -> Result<usize, String> {
    let trimmed = value.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, unit) = trimmed.split_at(split);
    if digits.is_empty() {
        return Err(format!("invalid size '{}': expected a number", value));
    }
    let number: usize = digits
        .parse()
        .map_err(|e| format!("invalid size '{}': {}", value, e))?;

    let multiplier: usize = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" | "kib" => 1024,
        "m" | "mb" | "mib" => 1024 * 1024,
        "g" | "gb" | "gib" => 1024 * 1024 * 1024,
        other => return Err(format!("invalid size unit '{}' in '{}'", other, value)),
    };
    number
        .checked_mul(multiplier)
        .ok_or_else(|| format!("size '{}' is too large", value))
}

/// Parse `WIDTHxHEIGHT`, e.g. `1080x1920`.
pub fn parse_dimensions(value: &str) -> Result<IntSize, String> {
    let (w, h) = value
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("invalid dimensions '{}': expected WIDTHxHEIGHT", value))?;
    let width: u32 = w
        .trim()
        .parse()
        .map_err(|_| format!("invalid width in '{}'", value))?;
    let height: u32 = h
        .trim()
        .parse()
        .map_err(|_| format!("invalid height in '{}'", value))?;
    if width == 0 || height == 0 {
        return Err(format!("dimensions must be non-zero: '{}'", value));
    }
    Ok(IntSize::new(width, height))
}

// =============================================================================
// CLI Arguments
// =============================================================================

/// subsample - explore how a large image is tiled and decoded.
#[derive(Parser, Debug, Clone)]
#[command(name = "subsample")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    pub fn into_command(self) -> Command {
        self.command
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Print image metadata and the sample-size/grid table.
    Inspect(InspectConfig),

    /// Drive a zoom sequence through the engine and log every snapshot.
    Simulate(SimulateConfig),
}

/// Output format of `inspect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Where the image comes from.
#[derive(Args, Debug, Clone)]
#[group(required = true, multiple = false)]
pub struct ImageArgs {
    /// Path to a JPEG or PNG file.
    pub path: Option<PathBuf>,

    /// Use a generated image of the given size instead of a file.
    #[arg(long, value_name = "WxH", value_parser = parse_dimensions)]
    pub synthetic: Option<IntSize>,
}

/// Engine knobs shared by the subcommands.
#[derive(Args, Debug, Clone)]
pub struct EngineArgs {
    /// Viewport (container) size.
    #[arg(long, value_name = "WxH", default_value = "1080x1920", value_parser = parse_dimensions, env = "SUBSAMPLE_VIEWPORT")]
    pub viewport: IntSize,

    /// Tile cache budget (e.g. 192MiB).
    #[arg(long, default_value = "192MiB", value_parser = parse_byte_size, env = "SUBSAMPLE_CACHE_SIZE")]
    pub cache_size: usize,

    /// Buffer reuse pool budget.
    #[arg(long, default_value = "32MiB", value_parser = parse_byte_size, env = "SUBSAMPLE_BUFFER_POOL_SIZE")]
    pub buffer_pool_size: usize,

    /// Decoder instances per image (1-16).
    #[arg(long, default_value_t = DEFAULT_MAX_DECODERS, env = "SUBSAMPLE_MAX_DECODERS")]
    pub max_decoders: usize,

    /// Load-rect margin around the visible region, in decoded pixels.
    #[arg(long, env = "SUBSAMPLE_PREFETCH_MARGIN")]
    pub prefetch_margin: Option<u32>,

    /// Decoded byte limit of a single tile.
    #[arg(long, default_value = "32MiB", value_parser = parse_byte_size, env = "SUBSAMPLE_MAX_TILE_SIZE")]
    pub max_tile_size: usize,

    /// Largest decoded image the `image` backend keeps in memory whole.
    #[arg(long, default_value = "256MiB", value_parser = parse_byte_size, env = "SUBSAMPLE_MAX_FULL_RASTER_SIZE")]
    pub max_full_raster_size: usize,

    /// Gestures that pause decoding (comma-separated).
    #[arg(long, value_enum, value_delimiter = ',', default_values = ["pinch", "fling"], env = "SUBSAMPLE_PAUSED_GESTURES")]
    pub paused_gestures: Vec<GestureKind>,

    /// Debounce window for container size changes, in milliseconds.
    #[arg(long, default_value_t = 100, env = "SUBSAMPLE_RESIZE_DEBOUNCE_MS")]
    pub resize_debounce_ms: u64,

    /// Report freshly decoded tiles with a fade-in.
    #[arg(long, default_value_t = false, env = "SUBSAMPLE_TILE_FADE")]
    pub tile_fade: bool,

    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

impl EngineArgs {
    /// Build the engine configuration from the flags.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            cache_bytes: self.cache_size,
            buffer_pool_bytes: self.buffer_pool_size,
            max_decoders: self.max_decoders,
            prefetch_margin: self.prefetch_margin,
            max_tile_bytes: self.max_tile_size,
            max_full_raster_bytes: self.max_full_raster_size,
            paused_gestures: self.paused_gestures.clone(),
            resize_debounce: Duration::from_millis(self.resize_debounce_ms),
            tile_fade: self.tile_fade,
        }
    }
}

/// Arguments of `subsample inspect`.
#[derive(Args, Debug, Clone)]
pub struct InspectConfig {
    #[command(flatten)]
    pub image: ImageArgs,

    #[command(flatten)]
    pub engine: EngineArgs,

    /// Output format.
    #[arg(long, value_enum, default_value = "text")]
    pub format: OutputFormat,
}

/// Arguments of `subsample simulate`.
#[derive(Args, Debug, Clone)]
pub struct SimulateConfig {
    #[command(flatten)]
    pub image: ImageArgs,

    #[command(flatten)]
    pub engine: EngineArgs,

    /// Number of zoom steps, each doubling the scale.
    #[arg(long, default_value_t = 5)]
    pub steps: u32,
}

// =============================================================================
// Tests
// =============================================================================
