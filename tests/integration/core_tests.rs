//! End-to-end behavior of the core task: events, image replacement and
//! shutdown, driven only through a `CoreHandle`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};

use subsampling_engine::config::EngineConfig;
use subsampling_engine::core::{CoreEvent, CoreHandle, SubsamplingCore};
use subsampling_engine::error::{DecodeError, EngineError};
use subsampling_engine::tile::{
    ExifOrientation, LoadState, ManagerState, TileCache, TileCacheKey, TileSnapshotSet, Viewport,
};

use super::test_utils::{
    registry_with, synthetic_source, wait_until, Gate, InstrumentedProvider, CONTAINER, IMAGE,
};

const TIMEOUT: Duration = Duration::from_secs(5);

fn spawn_with(config: EngineConfig, provider: InstrumentedProvider) -> (CoreHandle, Arc<TileCache>) {
    let cache = Arc::new(TileCache::with_capacities(
        config.cache_bytes,
        config.buffer_pool_bytes,
    ));
    let core = SubsamplingCore::spawn(config, Arc::clone(&cache), registry_with(provider)).unwrap();
    (core, cache)
}

async fn next_event(
    events: &mut broadcast::Receiver<CoreEvent>,
    matches: impl Fn(&CoreEvent) -> bool,
) -> CoreEvent {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("Event channel closed"),
            }
        }
    };
    tokio::time::timeout(TIMEOUT, wait)
        .await
        .expect("Timed out waiting for core event")
}

async fn wait_for_set(
    snapshots: &mut watch::Receiver<TileSnapshotSet>,
    predicate: impl Fn(&TileSnapshotSet) -> bool,
) -> TileSnapshotSet {
    let wait = async {
        loop {
            {
                let current = snapshots.borrow_and_update();
                if predicate(&current) {
                    return current.clone();
                }
            }
            snapshots.changed().await.unwrap();
        }
    };
    tokio::time::timeout(TIMEOUT, wait)
        .await
        .expect("Timed out waiting for snapshot")
}

fn all_settled(set: &TileSnapshotSet) -> bool {
    !set.foreground_tiles.is_empty()
        && set
            .foreground_tiles
            .iter()
            .all(|t| matches!(t.load_state, LoadState::Loaded | LoadState::Error))
}

#[tokio::test]
async fn test_tile_failures_are_reported_per_tile() {
    let provider = InstrumentedProvider::new().failing_when(|_, sample_size| {
        (sample_size == 4).then(|| DecodeError::DecodeFailure("corrupt block".to_string()))
    });
    let (core, _cache) = spawn_with(EngineConfig::default(), provider);
    let mut events = core.events();

    core.set_image(synthetic_source("img", IMAGE, ExifOrientation::Normal))
        .await
        .unwrap();
    core.update_viewport(Viewport::fit(CONTAINER, IMAGE).zoomed(4.0))
        .unwrap();

    let mut snapshots = core.snapshots();
    let set = wait_for_set(&mut snapshots, all_settled).await;
    assert_eq!(set.sample_size, 4);
    assert!(set
        .foreground_tiles
        .iter()
        .all(|t| t.load_state == LoadState::Error && t.payload.is_none()));

    match next_event(&mut events, |e| matches!(e, CoreEvent::TileFailed { .. })).await {
        CoreEvent::TileFailed { error, .. } => {
            assert!(matches!(error, DecodeError::DecodeFailure(_)))
        }
        other => panic!("Expected TileFailed, got {:?}", other),
    }

    // One bad tile never takes the image down
    assert_eq!(core.state(), ManagerState::Active);
    core.destroy().await;
}

#[tokio::test]
async fn test_region_unsupported_at_decode_time_unbinds_image() {
    let provider = InstrumentedProvider::new().failing_when(|_, _| {
        Some(DecodeError::RegionUnsupported {
            reason: "progressive stream".to_string(),
        })
    });
    let (core, cache) = spawn_with(EngineConfig::default(), provider);
    let mut events = core.events();

    core.set_image(synthetic_source("img", IMAGE, ExifOrientation::Normal))
        .await
        .unwrap();
    core.update_viewport(Viewport::fit(CONTAINER, IMAGE).zoomed(4.0))
        .unwrap();

    match next_event(&mut events, |e| matches!(e, CoreEvent::ImageFailed(_))).await {
        CoreEvent::ImageFailed(EngineError::RegionUnsupported { key, reason }) => {
            assert_eq!(key, "img");
            assert!(reason.contains("progressive"));
        }
        other => panic!("Expected ImageFailed, got {:?}", other),
    }
    assert_eq!(core.state(), ManagerState::Idle);

    let mut snapshots = core.snapshots();
    wait_for_set(&mut snapshots, |set| set.is_empty()).await;
    wait_until("handles released", || cache.outstanding_handles() == 0).await;
    core.destroy().await;
}

#[tokio::test]
async fn test_set_image_replaces_previous_tiles() {
    let gate = Gate::closed();
    let _open = gate.open_on_drop();
    let provider = InstrumentedProvider::new().gated(Arc::clone(&gate));
    let counters = provider.counters();
    let (core, cache) = spawn_with(EngineConfig::default(), provider);

    core.set_image(synthetic_source("first", IMAGE, ExifOrientation::Normal))
        .await
        .unwrap();
    core.update_viewport(Viewport::fit(CONTAINER, IMAGE).zoomed(4.0))
        .unwrap();
    wait_until("first decodes started", || counters.started() >= 1).await;

    // The viewport is kept; the new image is tiled against it right away
    core.set_image(synthetic_source("second", IMAGE, ExifOrientation::Normal))
        .await
        .unwrap();
    gate.open();

    let mut snapshots = core.snapshots();
    let set = wait_for_set(&mut snapshots, |set| {
        !set.foreground_tiles.is_empty() && set.foreground_tiles.iter().all(|t| t.is_loaded())
    })
    .await;

    for tile in &set.foreground_tiles {
        let key = TileCacheKey::new("second", tile.source_rect, tile.sample_size);
        assert!(cache.is_displayed(&key), "missing {}", key);
        let stale = TileCacheKey::new("first", tile.source_rect, tile.sample_size);
        assert!(!cache.contains(&stale), "stale {}", stale);
    }
    assert_eq!(cache.len(), set.foreground_tiles.len());
    core.destroy().await;
}

#[tokio::test]
async fn test_zoom_changes_bypass_resize_debounce() {
    let config = EngineConfig {
        resize_debounce: Duration::from_secs(10),
        ..EngineConfig::default()
    };
    let (core, _cache) = spawn_with(config, InstrumentedProvider::new());
    core.set_image(synthetic_source("img", IMAGE, ExifOrientation::Normal))
        .await
        .unwrap();

    let base = Viewport::fit(CONTAINER, IMAGE);
    let mut snapshots = core.snapshots();
    core.update_viewport(base.zoomed(2.0)).unwrap();
    wait_for_set(&mut snapshots, |set| set.sample_size == 8).await;

    core.update_viewport(base.zoomed(8.0)).unwrap();
    let set = wait_for_set(&mut snapshots, |set| set.sample_size == 2).await;
    assert!(!set.foreground_tiles.is_empty());
    core.destroy().await;
}

#[tokio::test]
async fn test_dropping_handle_shuts_core_down() {
    let provider = InstrumentedProvider::new();
    let (core, cache) = spawn_with(EngineConfig::default(), provider);
    core.set_image(synthetic_source("img", IMAGE, ExifOrientation::Normal))
        .await
        .unwrap();
    core.update_viewport(Viewport::fit(CONTAINER, IMAGE).zoomed(4.0))
        .unwrap();

    let mut snapshots = core.snapshots();
    wait_for_set(&mut snapshots, |set| {
        !set.foreground_tiles.is_empty() && set.foreground_tiles.iter().all(|t| t.is_loaded())
    })
    .await;
    assert!(cache.outstanding_handles() > 0);

    drop(core);

    // The manager is dropped with the task, which closes the snapshot channel
    tokio::time::timeout(TIMEOUT, async { while snapshots.changed().await.is_ok() {} })
        .await
        .expect("Core task did not stop");
    assert_eq!(cache.outstanding_handles(), 0);
}

#[tokio::test]
async fn test_state_changes_are_broadcast_in_order() {
    let (core, _cache) = spawn_with(EngineConfig::default(), InstrumentedProvider::new());
    let mut events = core.events();

    core.set_image(synthetic_source("img", IMAGE, ExifOrientation::Normal))
        .await
        .unwrap();
    core.stop().await.unwrap();
    core.start().await.unwrap();
    core.destroy().await;

    let mut states = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let CoreEvent::StateChanged(state) = event {
            states.push(state);
        }
    }
    assert_eq!(
        states,
        vec![
            ManagerState::Active,
            ManagerState::Stopped,
            ManagerState::Active,
            ManagerState::Destroyed,
        ]
    );
}
