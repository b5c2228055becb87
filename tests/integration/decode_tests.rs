//! Real codecs behind the registry: PNG and JPEG through the `image` backend,
//! file sources, and backend resolution.

use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};

use subsampling_engine::config::EngineConfig;
use subsampling_engine::decode::{encode_synthetic, DecoderRegistry, SyntheticProvider};
use subsampling_engine::error::{DecodeError, EngineError, SourceError};
use subsampling_engine::io::FileImageSource;
use subsampling_engine::tile::{
    ExifOrientation, FreshAllocator, IntRect, IntSize, ManagerState, TileCache, TileManager,
    Viewport,
};

use super::test_utils::InstrumentedProvider;

const BLOCK: u32 = 64;

/// Flat color per 64x64 block, so any box average that stays inside one
/// block is known exactly.
fn block_color(x: u32, y: u32) -> [u8; 4] {
    let (bx, by) = (x / BLOCK, y / BLOCK);
    [
        (bx * 40 % 256) as u8,
        (by * 60 % 256) as u8,
        ((bx + by) * 25 % 256) as u8,
        255,
    ]
}

fn block_image(width: u32, height: u32) -> RgbaImage {
    RgbaImage::from_fn(width, height, |x, y| Rgba(block_color(x, y)))
}

fn encode(image: RgbaImage, format: ImageFormat) -> Bytes {
    let image = match format {
        // JPEG has no alpha channel
        ImageFormat::Jpeg => DynamicImage::ImageRgb8(DynamicImage::ImageRgba8(image).to_rgb8()),
        _ => DynamicImage::ImageRgba8(image),
    };
    let mut out = Cursor::new(Vec::new());
    image.write_to(&mut out, format).unwrap();
    Bytes::from(out.into_inner())
}

/// Temp file removed on drop.
struct TempImage(PathBuf);

impl TempImage {
    fn write(name: &str, data: &[u8]) -> Self {
        let path = std::env::temp_dir().join(format!("subsample-{}-{}", std::process::id(), name));
        std::fs::write(&path, data).unwrap();
        Self(path)
    }
}

impl Drop for TempImage {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

fn default_manager() -> (TileManager, Arc<TileCache>) {
    let cache = Arc::new(TileCache::new());
    let manager = TileManager::new(
        EngineConfig::default(),
        Arc::clone(&cache),
        Arc::new(DecoderRegistry::with_defaults()),
    );
    (manager, cache)
}

#[tokio::test]
async fn test_png_file_tiles_match_source_pixels() {
    let size = IntSize::new(1200, 800);
    let file = TempImage::write("blocks.png", &encode(block_image(size.width, size.height), ImageFormat::Png));

    let (mut manager, _cache) = default_manager();
    let info = manager
        .set_image(Arc::new(FileImageSource::new(&file.0)))
        .await
        .unwrap();
    assert_eq!(info.size(), size);
    assert_eq!(info.mime_type, "image/png");
    assert_eq!(info.orientation, ExifOrientation::Normal);

    let base = Viewport::fit(IntSize::new(200, 200), size);
    for scale in [1.5, 4.0] {
        manager.refresh(&base.zoomed(scale));
        manager.drain_outcomes().await;

        let set = manager.snapshot();
        assert!(!set.foreground_tiles.is_empty(), "scale {}", scale);
        for tile in &set.foreground_tiles {
            let raster = tile.payload.as_ref().expect("tile not loaded");
            let rect = tile.source_rect;
            let s = tile.sample_size;
            assert_eq!(raster.size(), rect.size().sampled(s));

            let mut checked = 0;
            for py in 0..raster.height() {
                let y0 = rect.top + py * s;
                let y1 = (y0 + s).min(rect.bottom) - 1;
                for px in 0..raster.width() {
                    let x0 = rect.left + px * s;
                    let x1 = (x0 + s).min(rect.right) - 1;
                    if x0 / BLOCK != x1 / BLOCK || y0 / BLOCK != y1 / BLOCK {
                        continue;
                    }
                    assert_eq!(
                        raster.pixel(px, py).unwrap(),
                        &block_color(x0, y0)[..],
                        "pixel {},{} of {} at sample size {}",
                        px,
                        py,
                        rect,
                        s
                    );
                    checked += 1;
                }
            }
            assert!(checked > 0);
        }
    }
}

#[tokio::test]
async fn test_jpeg_probe_and_region_decode() {
    let data = encode(block_image(320, 240), ImageFormat::Jpeg);
    let registry = DecoderRegistry::with_defaults();

    let factory = registry.resolve(&data).unwrap();
    assert_eq!(factory.name(), "image");

    let mut decoder = factory.create().unwrap();
    let info = decoder.probe().unwrap();
    assert_eq!(info.size(), IntSize::new(320, 240));
    assert_eq!(info.mime_type, "image/jpeg");
    assert!(matches!(decoder.probe(), Err(DecodeError::AlreadyProbed)));

    let raster = decoder
        .decode_region(IntRect::new(64, 64, 192, 128), 2, &FreshAllocator)
        .unwrap();
    assert_eq!(raster.size(), IntSize::new(64, 32));

    // Lossy, but the middle of a flat block stays close to its color
    let expected = block_color(100, 100);
    let actual = raster.pixel(18, 18).unwrap();
    for channel in 0..3 {
        let diff = (actual[channel] as i16 - expected[channel] as i16).abs();
        assert!(diff <= 8, "channel {} off by {}", channel, diff);
    }

    // Out of bounds and zero sample size are rejected per call
    assert!(matches!(
        decoder.decode_region(IntRect::new(300, 200, 400, 260), 1, &FreshAllocator),
        Err(DecodeError::InvalidRegion { .. })
    ));
    assert!(matches!(
        decoder.decode_region(IntRect::new(0, 0, 10, 10), 0, &FreshAllocator),
        Err(DecodeError::InvalidSampleSize(0))
    ));
}

#[test]
fn test_registry_resolution_order() {
    let defaults = DecoderRegistry::with_defaults();
    assert_eq!(defaults.provider_names(), vec!["image", "synthetic"]);

    // Both providers claim synthetic streams; the first registered wins
    let data = encode_synthetic(100, 100, ExifOrientation::Normal);
    let registry = DecoderRegistry::new()
        .with_provider(InstrumentedProvider::new())
        .with_provider(SyntheticProvider);
    assert_eq!(registry.resolve(&data).unwrap().name(), "instrumented");

    let gif = Bytes::from_static(b"GIF89a\x01\x00\x01\x00\x00\x00\x00");
    match defaults.resolve(&gif) {
        Err(DecodeError::RegionUnsupported { .. }) => {}
        Err(other) => panic!("Expected RegionUnsupported, got {:?}", other),
        Ok(factory) => panic!("GIF resolved to {}", factory.name()),
    }
}

#[tokio::test]
async fn test_missing_file_leaves_manager_idle() {
    let (mut manager, cache) = default_manager();
    let result = manager
        .set_image(Arc::new(FileImageSource::new("/no/such/dir/huge.jpg")))
        .await;

    match result {
        Err(EngineError::Source(SourceError::NotFound(key))) => {
            assert_eq!(key, "/no/such/dir/huge.jpg")
        }
        other => panic!("Expected NotFound, got {:?}", other),
    }
    assert_eq!(manager.state(), ManagerState::Idle);
    assert!(manager.last_error().is_some());

    // Nothing is requested for a failed source
    let summary = manager.refresh(&Viewport::fit(IntSize::new(500, 500), IntSize::new(8000, 6000)).zoomed(4.0));
    assert!(!summary.active);
    assert_eq!(summary.dispatched, 0);
    assert!(cache.is_empty());
}

#[tokio::test]
async fn test_corrupt_png_fails_probe() {
    let mut data = encode(block_image(256, 256), ImageFormat::Png).to_vec();
    // Keep the signature so the backend claims it, break everything after
    data.truncate(24);
    let file = TempImage::write("broken.png", &data);

    let (mut manager, _cache) = default_manager();
    let result = manager.set_image(Arc::new(FileImageSource::new(&file.0))).await;
    match result {
        Err(EngineError::Probe { key, .. }) => assert!(key.ends_with("broken.png")),
        other => panic!("Expected Probe error, got {:?}", other),
    }
    assert_eq!(manager.state(), ManagerState::Idle);
}

#[tokio::test]
async fn test_image_over_raster_ceiling_is_region_unsupported() {
    // 600x400 RGBA is 960_000 bytes decoded
    let file = TempImage::write("ceiling.png", &encode(block_image(600, 400), ImageFormat::Png));
    let config = EngineConfig {
        max_full_raster_bytes: 500_000,
        ..EngineConfig::default()
    };
    let cache = Arc::new(TileCache::new());
    let mut manager = TileManager::new(
        config.clone(),
        Arc::clone(&cache),
        Arc::new(DecoderRegistry::for_config(&config)),
    );

    match manager.set_image(Arc::new(FileImageSource::new(&file.0))).await {
        Err(EngineError::RegionUnsupported { key, reason }) => {
            assert!(key.ends_with("ceiling.png"));
            assert!(reason.contains("600x400"), "reason: {}", reason);
        }
        other => panic!("Expected RegionUnsupported, got {:?}", other),
    }
    assert_eq!(manager.state(), ManagerState::Idle);
    assert!(cache.is_empty());

    // The same file under a ceiling that fits is tiled normally
    let config = EngineConfig {
        max_full_raster_bytes: 960_000,
        ..EngineConfig::default()
    };
    let mut manager = TileManager::new(
        config.clone(),
        Arc::clone(&cache),
        Arc::new(DecoderRegistry::for_config(&config)),
    );
    let info = manager
        .set_image(Arc::new(FileImageSource::new(&file.0)))
        .await
        .unwrap();
    assert_eq!(info.size(), IntSize::new(600, 400));
    assert_eq!(manager.state(), ManagerState::Active);
}
