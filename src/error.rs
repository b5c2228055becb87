use thiserror::Error;

use crate::tile::IntRect;

/// Errors raised while obtaining bytes from an image source
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    /// The resource does not exist
    #[error("Image source not found: {0}")]
    NotFound(String),

    /// Underlying read failed
    #[error("I/O error reading {key}: {message}")]
    Io { key: String, message: String },

    /// The resource exists but holds no bytes
    #[error("Image source is empty: {0}")]
    Empty(String),
}

/// Errors reported by region decoders and the decoder pool
#[derive(Debug, Clone, Error)]
pub enum DecodeError {
    /// Image bounds or orientation could not be read
    #[error("Probe failed: {0}")]
    ProbeFailure(String),

    /// The codec cannot decode sub-regions of this format
    #[error("Region decoding not supported: {reason}")]
    RegionUnsupported { reason: String },

    /// Requested rectangle is empty or lies outside the image
    #[error("Invalid region {rect} for image {width}x{height}")]
    InvalidRegion {
        rect: IntRect,
        width: u32,
        height: u32,
    },

    /// Sample size must be a positive integer
    #[error("Invalid sample size: {0}")]
    InvalidSampleSize(u32),

    /// `probe` was called a second time on the same decoder instance
    #[error("Decoder instance was already probed")]
    AlreadyProbed,

    /// Pixel decode failed for one region
    #[error("Decode failed: {0}")]
    DecodeFailure(String),

    /// The request was cancelled before its result was used
    #[error("Decode cancelled")]
    Cancelled,

    /// The decoder pool was closed
    #[error("Decoder pool is closed")]
    PoolClosed,
}

/// Errors surfaced by the tile manager and the engine lifecycle
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// The image source could not be opened
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    /// The image header could not be probed; terminal for this source
    #[error("Probe failed for {key}: {reason}")]
    Probe { key: String, reason: String },

    /// No registered decoder can region-decode this image
    #[error("Region decoding unsupported for {key}: {reason}")]
    RegionUnsupported { key: String, reason: String },

    /// Operation is not valid in the current lifecycle state
    #[error("Operation '{operation}' not allowed in state {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    /// Engine configuration was rejected
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A tokio runtime is required to dispatch decodes
    #[error("No tokio runtime available: {0}")]
    NoRuntime(String),

    /// The engine has been destroyed
    #[error("Engine destroyed")]
    Destroyed,
}

impl EngineError {
    /// Map a decoder-level failure during image setup to an engine error.
    pub fn from_setup(key: &str, err: DecodeError) -> Self {
        match err {
            DecodeError::RegionUnsupported { reason } => EngineError::RegionUnsupported {
                key: key.to_string(),
                reason,
            },
            other => EngineError::Probe {
                key: key.to_string(),
                reason: other.to_string(),
            },
        }
    }
}
