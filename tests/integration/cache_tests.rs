//! Cache sharing and buffer reuse across managers and images.

use std::sync::Arc;

use subsampling_engine::config::EngineConfig;
use subsampling_engine::tile::{
    ExifOrientation, RasterOrigin, TileCache, TileCacheKey, TileManager, Viewport,
};

use super::test_utils::{registry_with, synthetic_source, InstrumentedProvider, CONTAINER, IMAGE};

fn manager_on(cache: &Arc<TileCache>, provider: InstrumentedProvider) -> TileManager {
    TileManager::new(
        EngineConfig::default(),
        Arc::clone(cache),
        registry_with(provider),
    )
}

#[tokio::test]
async fn test_second_manager_reuses_cached_tiles() {
    let cache = Arc::new(TileCache::new());
    let provider = InstrumentedProvider::new();
    let counters = provider.counters();
    let viewport = Viewport::fit(CONTAINER, IMAGE).zoomed(4.0);

    let mut first = manager_on(&cache, provider.clone());
    first
        .set_image(synthetic_source("shared", IMAGE, ExifOrientation::Normal))
        .await
        .unwrap();
    first.refresh(&viewport);
    first.drain_outcomes().await;
    let decoded = counters.completed();
    assert_eq!(decoded, first.foreground_len());
    first.destroy();

    let mut second = manager_on(&cache, provider);
    second
        .set_image(synthetic_source("shared", IMAGE, ExifOrientation::Normal))
        .await
        .unwrap();
    let summary = second.refresh(&viewport);
    assert_eq!(summary.cache_hits, summary.created);
    assert_eq!(summary.dispatched, 0);
    assert_eq!(counters.completed(), decoded);
    assert!(second
        .snapshot()
        .foreground_tiles
        .iter()
        .all(|t| t.origin == Some(RasterOrigin::FromCache)));
}

#[tokio::test]
async fn test_images_do_not_share_entries() {
    let cache = Arc::new(TileCache::new());
    let viewport = Viewport::fit(CONTAINER, IMAGE).zoomed(4.0);

    let mut a = manager_on(&cache, InstrumentedProvider::new());
    a.set_image(synthetic_source("a", IMAGE, ExifOrientation::Normal))
        .await
        .unwrap();
    a.refresh(&viewport);
    a.drain_outcomes().await;

    let mut b = manager_on(&cache, InstrumentedProvider::new());
    b.set_image(synthetic_source("b", IMAGE, ExifOrientation::Normal))
        .await
        .unwrap();
    let summary = b.refresh(&viewport);
    assert_eq!(summary.cache_hits, 0);
    b.drain_outcomes().await;

    assert_eq!(cache.len(), a.foreground_len() + b.foreground_len());
    assert_eq!(
        cache.outstanding_handles(),
        a.foreground_len() + b.foreground_len()
    );

    // Same rect and sample size, different image
    let rect = a.snapshot().foreground_tiles[0].source_rect;
    let sample_size = a.sample_size();
    assert!(cache.is_displayed(&TileCacheKey::new("a", rect, sample_size)));
    assert!(cache.is_displayed(&TileCacheKey::new("b", rect, sample_size)));
}

#[tokio::test]
async fn test_evicted_buffers_feed_new_decodes() {
    const TILE_BYTES: usize = 250 * 250 * 4;
    let cache = Arc::new(TileCache::with_capacities(20 * TILE_BYTES, 16 * TILE_BYTES));
    let mut manager = manager_on(&cache, InstrumentedProvider::new());
    manager
        .set_image(synthetic_source("img", IMAGE, ExifOrientation::Normal))
        .await
        .unwrap();

    // Three regions at sample size 4, each overlapping the previous a little
    let base = Viewport::fit(CONTAINER, IMAGE);
    for (cx, cy) in [(150.0, 150.0), (350.0, 200.0), (150.0, 300.0)] {
        manager.refresh(&base.zoomed_at(4.0, cx, cy));
        manager.drain_outcomes().await;
        assert_eq!(manager.sample_size(), 4);
    }

    let stats = cache.stats();
    assert!(stats.evictions > 0);
    assert!(stats.recycled > 0);
    assert!(stats.reused > 0, "expected pooled buffers to be reused: {:?}", stats);
    assert!(cache.size() <= cache.capacity());

    // Nothing displayed was lost
    for tile in manager.snapshot().foreground_tiles {
        assert!(tile.is_loaded());
        let key = TileCacheKey::new("img", tile.source_rect, tile.sample_size);
        assert!(cache.is_displayed(&key), "missing {}", key);
    }
}
