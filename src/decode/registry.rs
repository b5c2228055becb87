use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use crate::config::EngineConfig;
use crate::error::DecodeError;
use crate::io::HEADER_PROBE_LEN;

use super::decoder::{DecoderFactory, DecoderProvider};
use super::image_backend::ImageCrateProvider;
use super::synthetic::SyntheticProvider;

/// Ordered list of decoder backends.
///
/// Backends are chosen by asking each provider, in registration order,
/// whether it can handle the stream's leading bytes. The first provider that
/// accepts wins.
#[derive(Clone, Default)]
pub struct DecoderRegistry {
    providers: Vec<Arc<dyn DecoderProvider>>,
}

impl DecoderRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in backends: the `image` crate (JPEG, PNG)
    /// and the synthetic test-pattern generator.
    pub fn with_defaults() -> Self {
        Self::new()
            .with_provider(ImageCrateProvider::default())
            .with_provider(SyntheticProvider)
    }

    /// Built-in backends with the limits of `config` applied.
    pub fn for_config(config: &EngineConfig) -> Self {
        Self::new()
            .with_provider(ImageCrateProvider::with_max_raster_bytes(
                config.max_full_raster_bytes as u64,
            ))
            .with_provider(SyntheticProvider)
    }

    /// Append a provider, builder style.
    pub fn with_provider(mut self, provider: impl DecoderProvider + 'static) -> Self {
        self.register(Arc::new(provider));
        self
    }

    pub fn register(&mut self, provider: Arc<dyn DecoderProvider>) {
        self.providers.push(provider);
    }

    /// Names of registered providers, in probe order.
    pub fn provider_names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name().to_string()).collect()
    }

    /// Find a backend for an encoded stream.
    ///
    /// Returns [`DecodeError::RegionUnsupported`] when no provider claims it.
    pub fn resolve(&self, data: &Bytes) -> Result<Arc<dyn DecoderFactory>, DecodeError> {
        let header = &data[..data.len().min(HEADER_PROBE_LEN)];
        for provider in &self.providers {
            if provider.supports(header) {
                debug!(provider = provider.name(), "Resolved decoder backend");
                return Ok(provider.factory(data.clone()));
            }
        }
        Err(DecodeError::RegionUnsupported {
            reason: format!(
                "no region decoder for stream starting with {:02x?}",
                &header[..header.len().min(8)]
            ),
        })
    }
}

impl std::fmt::Debug for DecoderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecoderRegistry")
            .field("providers", &self.provider_names())
            .finish()
    }
}
