//! Tile manager scheduling, cancellation and teardown.

use std::time::Duration;

use subsampling_engine::config::{EngineConfig, GestureKind};
use subsampling_engine::error::DecodeError;
use subsampling_engine::tile::{
    ExifOrientation, LoadState, ManagerState, OutcomeStatus, TileSnapshotSet, Viewport,
};

use super::test_utils::{
    instrumented_manager, synthetic_source, wait_until, Gate, InstrumentedProvider, Sweep,
    CONTAINER, IMAGE,
};

fn config_with_decoders(max_decoders: usize) -> EngineConfig {
    EngineConfig {
        max_decoders,
        ..EngineConfig::default()
    }
}

/// Fitted viewport that still wants tiles, at sample size 16.
fn fit_viewport() -> Viewport {
    Viewport {
        min_scale: 0.5,
        ..Viewport::fit(CONTAINER, IMAGE)
    }
}

fn count(statuses: &[OutcomeStatus], predicate: impl Fn(&OutcomeStatus) -> bool) -> usize {
    statuses.iter().filter(|s| predicate(s)).count()
}

// =============================================================================
// Teardown
// =============================================================================

#[tokio::test]
async fn test_destroy_with_decodes_in_flight() {
    let gate = Gate::closed();
    let _release = gate.open_on_drop();
    let provider = InstrumentedProvider::new().gated(gate.clone());
    let counters = provider.counters();
    let (mut manager, cache) = instrumented_manager(config_with_decoders(3), provider);

    manager
        .set_image(synthetic_source("img", IMAGE, ExifOrientation::Normal))
        .await
        .unwrap();
    let summary = manager.refresh(&Viewport::fit(CONTAINER, IMAGE).zoomed(4.0));
    assert_eq!(summary.sample_size, 4);
    assert_eq!(summary.dispatched, 9);

    wait_until("three running decodes", || counters.started() == 3).await;

    manager.destroy();
    assert_eq!(manager.state(), ManagerState::Destroyed);
    assert_eq!(manager.tile_count(), 0);
    assert_eq!(manager.in_flight(), 0);
    assert_eq!(cache.outstanding_handles(), 0);

    // The running decodes finish into a closed channel and hand their
    // buffers back; the queued ones never start.
    gate.open();
    wait_until("running decodes to finish", || counters.completed() == 3).await;
    wait_until("buffers to be recycled", || cache.pooled_buffers() == 3).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(counters.started(), 3);
    assert!(cache.is_empty());
    assert_eq!(cache.outstanding_handles(), 0);

    // Idempotent
    manager.destroy();
    assert_eq!(manager.state(), ManagerState::Destroyed);
}

#[tokio::test]
async fn test_dropping_manager_releases_everything() {
    let provider = InstrumentedProvider::new();
    let (mut manager, cache) = instrumented_manager(EngineConfig::default(), provider);
    manager
        .set_image(synthetic_source("img", IMAGE, ExifOrientation::Normal))
        .await
        .unwrap();
    manager.refresh(&Viewport::fit(CONTAINER, IMAGE).zoomed(4.0));
    manager.drain_outcomes().await;
    assert_eq!(cache.outstanding_handles(), manager.foreground_len());

    drop(manager);
    assert_eq!(cache.outstanding_handles(), 0);
    // Tiles stay cached for a later manager, just unpinned
    assert!(!cache.is_empty());
}

#[tokio::test]
async fn test_set_image_while_stopped_waits_for_resume() {
    let provider = InstrumentedProvider::new();
    let counters = provider.counters();
    let (mut manager, cache) = instrumented_manager(EngineConfig::default(), provider);
    let viewport = Viewport::fit(CONTAINER, IMAGE).zoomed(4.0);

    manager
        .set_image(synthetic_source("first", IMAGE, ExifOrientation::Normal))
        .await
        .unwrap();
    assert_eq!(manager.refresh(&viewport).dispatched, 9);
    manager.drain_outcomes().await;
    manager.stop().unwrap();

    let info = manager
        .set_image(synthetic_source("second", IMAGE, ExifOrientation::Normal))
        .await
        .unwrap();
    assert_eq!(info.size(), IMAGE);
    assert_eq!(manager.state(), ManagerState::Stopped);
    assert_eq!(manager.tile_count(), 0);
    assert_eq!(manager.in_flight(), 0);
    assert!(manager.snapshot().is_empty());
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(counters.started(), 9);

    // Work starts only once the host resumes, against the kept viewport
    let summary = manager.resume().unwrap();
    assert_eq!(manager.state(), ManagerState::Active);
    assert_eq!(summary.dispatched, 9);
    let statuses = manager.drain_outcomes().await;
    assert_eq!(
        count(&statuses, |s| matches!(s, OutcomeStatus::Attached { .. })),
        9
    );
    assert_eq!(counters.started(), 18);
    assert_eq!(cache.outstanding_handles(), manager.foreground_len());
}

// =============================================================================
// Scheduling
// =============================================================================

#[tokio::test]
async fn test_decoder_pool_bounds_parallelism() {
    let gate = Gate::closed();
    let _release = gate.open_on_drop();
    let provider = InstrumentedProvider::new().gated(gate.clone());
    let counters = provider.counters();
    let (mut manager, _cache) = instrumented_manager(config_with_decoders(2), provider);

    manager
        .set_image(synthetic_source("img", IMAGE, ExifOrientation::Normal))
        .await
        .unwrap();
    let summary = manager.refresh(&Viewport::fit(CONTAINER, IMAGE).zoomed(4.0));
    assert_eq!(summary.dispatched, 9);

    wait_until("two running decodes", || counters.started() == 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(counters.started(), 2);
    assert_eq!(manager.pool().map(|pool| pool.in_use()), Some(2));

    gate.open();
    let statuses = manager.drain_outcomes().await;
    assert_eq!(statuses.len(), 9);
    assert_eq!(
        count(&statuses, |s| matches!(s, OutcomeStatus::Attached { .. })),
        9
    );
    assert!(counters.peak_running() <= 2);
    assert!(counters.created() <= 2);
}

#[tokio::test]
async fn test_pan_cancels_irrelevant_decodes() {
    let gate = Gate::closed();
    let _release = gate.open_on_drop();
    let provider = InstrumentedProvider::new().gated(gate.clone());
    let counters = provider.counters();
    let (mut manager, cache) = instrumented_manager(config_with_decoders(1), provider);

    manager
        .set_image(synthetic_source("img", IMAGE, ExifOrientation::Normal))
        .await
        .unwrap();
    let base = Viewport::fit(CONTAINER, IMAGE);
    let first = manager.refresh(&base.zoomed_at(8.0, 0.0, 0.0));
    wait_until("first decode to start", || counters.started() == 1).await;

    // Jump to the opposite corner: no cell in common
    let second = manager.refresh(&base.zoomed_at(8.0, 500.0, 359.0));
    assert!(!second.transitioned);
    assert_eq!(second.released, first.dispatched);

    gate.open();
    let statuses = manager.drain_outcomes().await;
    assert_eq!(
        count(&statuses, |s| matches!(s, OutcomeStatus::Discarded)),
        first.dispatched
    );
    assert_eq!(
        count(&statuses, |s| matches!(s, OutcomeStatus::Attached { .. })),
        second.dispatched
    );
    // Queued decodes of released tiles never reached the decoder
    assert_eq!(counters.started(), 1 + second.dispatched);
    // The discarded raster went back to the reuse pool
    assert!(cache.stats().recycled >= 1);
    assert_eq!(cache.outstanding_handles(), manager.foreground_len());
}

#[tokio::test]
async fn test_paused_gesture_defers_until_it_ends() {
    let provider = InstrumentedProvider::new();
    let counters = provider.counters();
    let config = EngineConfig {
        paused_gestures: vec![GestureKind::Fling],
        ..EngineConfig::default()
    };
    let (mut manager, _cache) = instrumented_manager(config, provider);
    manager
        .set_image(synthetic_source("img", IMAGE, ExifOrientation::Normal))
        .await
        .unwrap();

    let viewport = Viewport::fit(CONTAINER, IMAGE).zoomed(4.0);
    let paused = manager.refresh(&viewport.clone().with_gesture(Some(GestureKind::Fling)));
    assert!(paused.paused);
    assert_eq!(paused.dispatched, 0);
    assert!(manager
        .snapshot()
        .foreground_tiles
        .iter()
        .all(|t| t.load_state == LoadState::Pending));

    let resumed = manager.refresh(&viewport);
    assert_eq!(resumed.created, 0);
    assert_eq!(resumed.dispatched, paused.created);
    manager.drain_outcomes().await;
    assert_eq!(counters.completed(), paused.created);
}

// =============================================================================
// Sample-size transitions
// =============================================================================

#[tokio::test]
async fn test_transition_never_drops_coverage() {
    let gate = Gate::closed();
    let _release = gate.open_on_drop();
    let provider = InstrumentedProvider::new().gated(gate.clone());
    let (mut manager, _cache) = instrumented_manager(EngineConfig::default(), provider);
    manager
        .set_image(synthetic_source("img", IMAGE, ExifOrientation::Normal))
        .await
        .unwrap();

    gate.open();
    manager.refresh(&fit_viewport());
    manager.drain_outcomes().await;
    assert_eq!(manager.sample_size(), 16);
    gate.close();

    let summary = manager.refresh(&fit_viewport().zoomed(2.0));
    assert!(summary.transitioned);
    assert_eq!(summary.sample_size, 8);

    let snapshot = manager.snapshot();
    assert_eq!(snapshot.background_tiles.len(), 4);
    assert!(snapshot.foreground_tiles.iter().all(|t| !t.is_loaded()));
    assert_eq!(snapshot.drawable().count(), 4);
    assert_eq!(
        TileSnapshotSet::coverage(&snapshot.background_tiles, &snapshot.image_load_rect),
        1.0
    );

    gate.open();
    while manager.in_flight() > 0 {
        let outcome = manager.next_outcome().await.unwrap();
        manager.apply_outcome(outcome);

        let snapshot = manager.snapshot();
        let background =
            TileSnapshotSet::coverage(&snapshot.background_tiles, &snapshot.image_load_rect);
        let foreground =
            TileSnapshotSet::coverage(&snapshot.foreground_tiles, &snapshot.image_load_rect);
        assert!(
            background >= 1.0 || foreground >= 1.0,
            "coverage regressed: background {} foreground {}",
            background,
            foreground
        );
    }

    let snapshot = manager.snapshot();
    assert!(snapshot.background_tiles.is_empty());
    assert_eq!(snapshot.sample_size, 8);
}

#[tokio::test]
async fn test_failed_tiles_do_not_hold_background() {
    let provider = InstrumentedProvider::new().failing_when(|rect, sample_size| {
        (sample_size == 8 && rect.left == 0)
            .then(|| DecodeError::DecodeFailure("corrupt scanline".to_string()))
    });
    let (mut manager, _cache) = instrumented_manager(EngineConfig::default(), provider);
    manager
        .set_image(synthetic_source("img", IMAGE, ExifOrientation::Normal))
        .await
        .unwrap();

    manager.refresh(&fit_viewport());
    manager.drain_outcomes().await;

    manager.refresh(&fit_viewport().zoomed(2.0));
    let statuses = manager.drain_outcomes().await;
    let failed = count(&statuses, |s| matches!(s, OutcomeStatus::Failed { .. }));
    let attached = count(&statuses, |s| matches!(s, OutcomeStatus::Attached { .. }));
    assert!(failed > 0);
    assert!(attached > 0);

    let snapshot = manager.snapshot();
    assert_eq!(manager.state(), ManagerState::Active);
    assert!(snapshot.background_tiles.is_empty());
    for tile in &snapshot.foreground_tiles {
        if tile.source_rect.left == 0 {
            assert_eq!(tile.load_state, LoadState::Error);
            assert!(tile.payload.is_none());
        } else {
            assert!(tile.is_loaded());
        }
    }
}

// =============================================================================
// Cache pressure
// =============================================================================

#[tokio::test]
async fn test_visible_tiles_survive_tiny_cache() {
    // Room for about one decoded tile
    let config = EngineConfig {
        cache_bytes: 300_000,
        ..EngineConfig::default()
    };
    let (mut manager, cache) = instrumented_manager(config, InstrumentedProvider::new());
    manager
        .set_image(synthetic_source("img", IMAGE, ExifOrientation::Normal))
        .await
        .unwrap();

    let base = Viewport::fit(CONTAINER, IMAGE);
    manager.refresh(&base.zoomed(4.0));
    manager.drain_outcomes().await;
    let visible = manager.foreground_len();
    assert_eq!(visible, 9);
    assert!(manager.snapshot().foreground_tiles.iter().all(|t| t.is_loaded()));
    assert_eq!(cache.len(), visible);
    assert!(cache.size() > cache.capacity());

    // Panning away unpins the old tiles, which are then evicted first
    manager.refresh(&base.zoomed_at(4.0, 500.0, 359.0));
    manager.drain_outcomes().await;
    assert!(manager.snapshot().foreground_tiles.iter().all(|t| t.is_loaded()));
    assert_eq!(cache.len(), manager.foreground_len());
    assert!(cache.stats().evictions >= visible as u64 - 1);
}

// =============================================================================
// Orientation
// =============================================================================

#[tokio::test]
async fn test_load_rect_covers_visible_region_for_every_orientation() {
    let mut sweep = Sweep::new(0x5eed);
    for orientation in ExifOrientation::ALL {
        let (mut manager, _cache) =
            instrumented_manager(EngineConfig::default(), InstrumentedProvider::new());
        let info = manager
            .set_image(synthetic_source("img", IMAGE, orientation))
            .await
            .unwrap();
        let display = info.display_size();
        let base = Viewport::fit(CONTAINER, display);

        for _ in 0..20 {
            let scale = 1.5 + sweep.range(0, 300) as f32 / 10.0;
            let cx = sweep.range(0, base.content_size.width) as f32;
            let cy = sweep.range(0, base.content_size.height) as f32;
            // Paused so nothing is decoded
            let viewport = base
                .zoomed_at(scale, cx, cy)
                .with_gesture(Some(GestureKind::Pinch));

            let summary = manager.refresh(&viewport);
            assert!(summary.active, "{:?} at scale {}", orientation, scale);

            let visible = orientation
                .display_to_source(viewport.visible_image_rect(display), info.size());
            let load_rect = manager.load_rect();
            assert!(
                load_rect.contains(&visible),
                "{:?}: load rect {} misses visible {}",
                orientation,
                load_rect,
                visible
            );

            let snapshot = manager.snapshot();
            assert!(snapshot
                .foreground_tiles
                .iter()
                .all(|t| t.source_rect.intersects(&load_rect)));
            // Cells partition the image, so they tile the load rect exactly
            let covered: u64 = snapshot
                .foreground_tiles
                .iter()
                .filter_map(|t| t.source_rect.intersection(&load_rect))
                .map(|r| r.area())
                .sum();
            assert_eq!(covered, load_rect.area());
        }
    }
}
