use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::SourceError;

/// Number of leading bytes decoder providers inspect to claim a format.
pub const HEADER_PROBE_LEN: usize = 64;

/// Re-openable provider of an encoded image's bytes.
///
/// The engine opens a source once per `set_image` and hands the bytes to the
/// resolved decoder backend. `key` must be stable across opens because it
/// scopes cache entries; two sources with the same key are assumed to yield
/// identical bytes.
#[async_trait]
pub trait ImageSource: Send + Sync {
    /// Stable identity of this image (path, URL, content hash...).
    fn key(&self) -> &str;

    /// Read the complete encoded stream.
    async fn open(&self) -> Result<Bytes, SourceError>;
}

// =============================================================================
// File source
// =============================================================================

/// Image stored on the local filesystem.
#[derive(Debug, Clone)]
pub struct FileImageSource {
    path: PathBuf,
    key: String,
}

impl FileImageSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let key = path.display().to_string();
        Self { path, key }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ImageSource for FileImageSource {
    fn key(&self) -> &str {
        &self.key
    }

    async fn open(&self) -> Result<Bytes, SourceError> {
        let data = tokio::fs::read(&self.path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SourceError::NotFound(self.key.clone())
            } else {
                SourceError::Io {
                    key: self.key.clone(),
                    message: e.to_string(),
                }
            }
        })?;
        if data.is_empty() {
            return Err(SourceError::Empty(self.key.clone()));
        }
        Ok(Bytes::from(data))
    }
}

// =============================================================================
// Memory source
// =============================================================================

/// Image already held in memory.
#[derive(Debug, Clone)]
pub struct MemoryImageSource {
    key: String,
    data: Bytes,
}

impl MemoryImageSource {
    pub fn new(key: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            data: data.into(),
        }
    }
}

#[async_trait]
impl ImageSource for MemoryImageSource {
    fn key(&self) -> &str {
        &self.key
    }

    async fn open(&self) -> Result<Bytes, SourceError> {
        if self.data.is_empty() {
            return Err(SourceError::Empty(self.key.clone()));
        }
        Ok(self.data.clone())
    }
}
