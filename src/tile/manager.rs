//! Tile manager: the stateful scheduler behind the engine.
//!
//! The manager owns the current tile set for one image. On every viewport
//! change it recomputes the sample size, diffs the grid cells around the
//! visible region against its tiles, and dispatches decodes for whatever is
//! missing.
//!
//! # Lifecycle
//!
//! ```text
//!            set_image            probe ok
//!   Idle ─────────────► Initializing ───────► Active ◄──┐
//!    ▲                       │                  │        │ resume
//!    └───── probe failed ────┘             stop │        │
//!                                               ▼        │
//!                                            Stopped ────┘
//!
//!   destroy: any state ──► Destroyed (terminal)
//! ```
//!
//! # Concurrency
//!
//! The manager is owned by a single task and is not shared. `refresh` is
//! synchronous: it only diffs and enqueues. Decodes run on tokio through the
//! image's [`DecoderPool`] and report back as [`DecodeOutcome`] messages on a
//! channel; the owner feeds them to [`TileManager::apply_outcome`]. Because
//! attaching happens on the owning task, a tile is never observed half
//! attached, and a decode whose tile was dropped meanwhile is discarded.
//!
//! # Sample-size transitions
//!
//! When the grid changes, loaded foreground tiles move to the background set
//! and stay visible. The background is released once every foreground tile
//! is either loaded or failed. Background tiles that match the new grid
//! exactly (zooming back) are promoted instead of being decoded again.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, GestureKind};
use crate::decode::{CancelFlag, DecoderPool, DecoderRegistry, ImageInfo};
use crate::error::{DecodeError, EngineError};
use crate::io::ImageSource;

use super::cache::{RasterHandle, RasterOrigin, TileCache, TileCacheKey};
use super::calculator::{self, SampleSizeDecision, TileCoord, TileGrid};
use super::geometry::{IntRect, IntSize};
use super::raster::{Raster, RasterAllocator};
use super::snapshot::{AnimationState, LoadState, TileSnapshot, TileSnapshotSet};
use super::viewport::Viewport;

// =============================================================================
// Public types
// =============================================================================

/// Lifecycle state of a [`TileManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ManagerState {
    /// No image bound
    Idle,
    /// Opening and probing an image
    Initializing,
    /// Serving tiles
    Active,
    /// Paused; tiles released, grid kept
    Stopped,
    /// Terminal
    Destroyed,
}

impl ManagerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ManagerState::Idle => "idle",
            ManagerState::Initializing => "initializing",
            ManagerState::Active => "active",
            ManagerState::Stopped => "stopped",
            ManagerState::Destroyed => "destroyed",
        }
    }
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a single `refresh` did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RefreshSummary {
    /// Whether tiles are being served for this viewport
    pub active: bool,
    /// Foreground sample size after the refresh (0 when inactive)
    pub sample_size: u32,
    /// Whether the grid changed and a transition started
    pub transitioned: bool,
    /// Tiles created for newly relevant cells
    pub created: usize,
    /// Of the created tiles, how many were served from the cache
    pub cache_hits: usize,
    /// Tiles released (foreground and background)
    pub released: usize,
    /// Decodes dispatched
    pub dispatched: usize,
    /// Dispatch skipped because of the current gesture
    pub paused: bool,
    /// Foreground tile count after the refresh
    pub foreground: usize,
    /// Background tile count after the refresh
    pub background: usize,
}

/// Completion message of one dispatched decode.
pub struct DecodeOutcome {
    tile_id: u64,
    coordinate: TileCoord,
    key: TileCacheKey,
    result: Result<Raster, DecodeError>,
}

impl DecodeOutcome {
    pub fn coordinate(&self) -> TileCoord {
        self.coordinate
    }

    pub fn key(&self) -> &TileCacheKey {
        &self.key
    }

    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

impl fmt::Debug for DecodeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodeOutcome")
            .field("tile_id", &self.tile_id)
            .field("key", &self.key.to_string())
            .field("ok", &self.result.is_ok())
            .finish()
    }
}

/// Effect of applying a [`DecodeOutcome`].
#[derive(Debug, Clone)]
pub enum OutcomeStatus {
    /// Payload attached to its tile
    Attached { coordinate: TileCoord, sample_size: u32 },
    /// Decode failed; the tile is marked as errored
    Failed {
        coordinate: TileCoord,
        error: DecodeError,
    },
    /// The backend cannot region-decode this image; the image was unbound
    Unsupported(EngineError),
    /// The tile is gone or the manager moved on; result dropped
    Discarded,
}

// =============================================================================
// Internal tile bookkeeping
// =============================================================================

struct Tile {
    id: u64,
    coordinate: TileCoord,
    rect: IntRect,
    sample_size: u32,
    state: LoadState,
    animation: AnimationState,
    handle: Option<RasterHandle>,
    cancel: CancelFlag,
    /// A decode of this tile already came back interrupted once
    interrupted: bool,
}

impl Tile {
    fn is_settled(&self) -> bool {
        matches!(self.state, LoadState::Loaded | LoadState::Error)
    }

    fn snapshot(&self) -> TileSnapshot {
        TileSnapshot {
            coordinate: self.coordinate,
            source_rect: self.rect,
            sample_size: self.sample_size,
            load_state: self.state,
            animation: self.animation,
            alpha: match self.animation {
                AnimationState::FadeIn => 0,
                AnimationState::None => 255,
            },
            origin: self.handle.as_ref().map(RasterHandle::origin),
            payload: self.handle.as_ref().map(RasterHandle::shared),
        }
    }
}

struct ImageBinding {
    key: Arc<str>,
    info: ImageInfo,
    pool: Arc<DecoderPool>,
}

// =============================================================================
// TileManager
// =============================================================================

/// Scheduler for the tiles of one image.
pub struct TileManager {
    config: EngineConfig,
    cache: Arc<TileCache>,
    registry: Arc<DecoderRegistry>,

    state: ManagerState,
    image: Option<ImageBinding>,
    last_error: Option<EngineError>,
    last_viewport: Option<Viewport>,

    grid: Option<TileGrid>,
    load_rect: IntRect,
    foreground: BTreeMap<TileCoord, Tile>,
    background: Vec<Tile>,
    next_tile_id: u64,
    in_flight: usize,

    outcome_tx: mpsc::UnboundedSender<DecodeOutcome>,
    outcome_rx: mpsc::UnboundedReceiver<DecodeOutcome>,
    snapshot_tx: watch::Sender<TileSnapshotSet>,
    version: u64,
}

impl TileManager {
    /// Create an idle manager sharing `cache` and resolving backends through
    /// `registry`.
    pub fn new(config: EngineConfig, cache: Arc<TileCache>, registry: Arc<DecoderRegistry>) -> Self {
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, _) = watch::channel(TileSnapshotSet::default());
        Self {
            config,
            cache,
            registry,
            state: ManagerState::Idle,
            image: None,
            last_error: None,
            last_viewport: None,
            grid: None,
            load_rect: IntRect::default(),
            foreground: BTreeMap::new(),
            background: Vec::new(),
            next_tile_id: 0,
            in_flight: 0,
            outcome_tx,
            outcome_rx,
            snapshot_tx,
            version: 0,
        }
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn state(&self) -> ManagerState {
        self.state
    }

    pub fn image_info(&self) -> Option<&ImageInfo> {
        self.image.as_ref().map(|image| &image.info)
    }

    pub fn image_key(&self) -> Option<&str> {
        self.image.as_ref().map(|image| image.key.as_ref())
    }

    /// The most recent setup or runtime failure.
    pub fn last_error(&self) -> Option<&EngineError> {
        self.last_error.as_ref()
    }

    pub fn last_viewport(&self) -> Option<&Viewport> {
        self.last_viewport.as_ref()
    }

    /// Current foreground sample size, 0 when no grid is active.
    pub fn sample_size(&self) -> u32 {
        self.grid.map_or(0, |grid| grid.sample_size)
    }

    pub fn grid(&self) -> Option<&TileGrid> {
        self.grid.as_ref()
    }

    pub fn load_rect(&self) -> IntRect {
        self.load_rect
    }

    /// Total tiles held, foreground plus background.
    pub fn tile_count(&self) -> usize {
        self.foreground.len() + self.background.len()
    }

    pub fn foreground_len(&self) -> usize {
        self.foreground.len()
    }

    pub fn background_len(&self) -> usize {
        self.background.len()
    }

    /// Decodes dispatched whose outcome has not been applied yet.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn pool(&self) -> Option<&Arc<DecoderPool>> {
        self.image.as_ref().map(|image| &image.pool)
    }

    pub fn cache(&self) -> &Arc<TileCache> {
        &self.cache
    }

    /// Replace the gesture kinds that pause decode dispatch.
    pub fn set_paused_gestures(&mut self, gestures: Vec<GestureKind>) {
        self.config.paused_gestures = gestures;
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> TileSnapshotSet {
        self.snapshot_tx.borrow().clone()
    }

    /// Receiver notified on every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<TileSnapshotSet> {
        self.snapshot_tx.subscribe()
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Bind a new image.
    ///
    /// Outstanding decodes of the previous image are cancelled and its tiles
    /// released before the new source is opened. On success the manager is
    /// `Active` and, if a viewport was seen before, refreshed against it. A
    /// stopped manager stays `Stopped` and requests nothing until
    /// [`resume`](Self::resume). A failure leaves the manager `Idle` with [`last_error`](Self::last_error)
    /// set; no tiles are requested for that source.
    pub async fn set_image(
        &mut self,
        source: Arc<dyn ImageSource>,
    ) -> Result<ImageInfo, EngineError> {
        if self.state == ManagerState::Destroyed {
            return Err(EngineError::Destroyed);
        }
        let was_stopped = self.state == ManagerState::Stopped;

        self.unbind_image();
        self.last_error = None;
        self.state = ManagerState::Initializing;
        self.publish();

        let key = source.key().to_string();
        info!(image = %key, "Probing image");

        match self.open(source.as_ref()).await {
            Ok((info, pool)) => {
                info!(
                    image = %key,
                    width = info.width,
                    height = info.height,
                    mime = %info.mime_type,
                    orientation = info.orientation.to_exif(),
                    backend = pool.backend(),
                    "Image ready"
                );
                self.image = Some(ImageBinding {
                    key: Arc::from(key.as_str()),
                    info: info.clone(),
                    pool,
                });
                if was_stopped {
                    self.state = ManagerState::Stopped;
                    self.publish();
                    return Ok(info);
                }
                self.state = ManagerState::Active;
                match self.last_viewport.clone() {
                    Some(viewport) => {
                        self.refresh(&viewport);
                    }
                    None => self.publish(),
                }
                Ok(info)
            }
            Err(err) => {
                warn!(image = %key, error = %err, "Image setup failed");
                self.state = ManagerState::Idle;
                self.last_error = Some(err.clone());
                self.publish();
                Err(err)
            }
        }
    }

    async fn open(
        &self,
        source: &dyn ImageSource,
    ) -> Result<(ImageInfo, Arc<DecoderPool>), EngineError> {
        let key = source.key();
        let data = source.open().await?;
        let factory = self
            .registry
            .resolve(&data)
            .map_err(|e| EngineError::from_setup(key, e))?;
        let pool = Arc::new(DecoderPool::new(factory, self.config.max_decoders));
        let info = match pool.probe().await {
            Ok(info) => info,
            Err(e) => {
                pool.close();
                return Err(EngineError::from_setup(key, e));
            }
        };
        if info.size().is_empty() {
            pool.close();
            return Err(EngineError::Probe {
                key: key.to_string(),
                reason: format!("image has no pixels ({})", info.size()),
            });
        }
        Ok((info, pool))
    }

    /// Pause: release every tile payload but keep the grid.
    pub fn stop(&mut self) -> Result<(), EngineError> {
        match self.state {
            ManagerState::Active => {
                let released = self.release_all_tiles();
                self.state = ManagerState::Stopped;
                info!(image = ?self.image_key(), released, "Tile manager stopped");
                self.publish();
                Ok(())
            }
            ManagerState::Stopped => Ok(()),
            ManagerState::Destroyed => Err(EngineError::Destroyed),
            state => Err(EngineError::InvalidState {
                operation: "stop",
                state: state.as_str(),
            }),
        }
    }

    /// Resume after [`stop`](Self::stop), re-requesting the tiles inside the
    /// load rect of the last viewport.
    pub fn resume(&mut self) -> Result<RefreshSummary, EngineError> {
        match self.state {
            ManagerState::Stopped => {
                self.state = ManagerState::Active;
                info!(image = ?self.image_key(), "Tile manager resumed");
                match self.last_viewport.clone() {
                    Some(viewport) => Ok(self.refresh(&viewport)),
                    None => {
                        self.publish();
                        Ok(RefreshSummary::default())
                    }
                }
            }
            ManagerState::Active => Ok(RefreshSummary {
                active: self.grid.is_some(),
                sample_size: self.sample_size(),
                foreground: self.foreground.len(),
                background: self.background.len(),
                ..RefreshSummary::default()
            }),
            ManagerState::Destroyed => Err(EngineError::Destroyed),
            state => Err(EngineError::InvalidState {
                operation: "resume",
                state: state.as_str(),
            }),
        }
    }

    /// Tear down: cancel outstanding decodes, release every raster handle and
    /// close the decoder pool. Idempotent.
    pub fn destroy(&mut self) {
        if self.state == ManagerState::Destroyed {
            return;
        }
        self.unbind_image();
        self.outcome_rx.close();
        // Results already queued hold rasters; hand their buffers back
        while let Ok(outcome) = self.outcome_rx.try_recv() {
            if let Ok(raster) = outcome.result {
                self.cache.recycle(raster);
            }
        }
        self.in_flight = 0;
        self.state = ManagerState::Destroyed;
        info!("Tile manager destroyed");
        self.publish();
    }

    // -------------------------------------------------------------------------
    // Refresh
    // -------------------------------------------------------------------------

    /// Bring the tile set in line with `viewport`.
    ///
    /// Only diffs and enqueues; never blocks on a decode. Calling it twice
    /// with the same viewport and no completions in between changes nothing.
    pub fn refresh(&mut self, viewport: &Viewport) -> RefreshSummary {
        self.last_viewport = Some(viewport.clone());
        let mut summary = RefreshSummary::default();
        if self.state != ManagerState::Active {
            return summary;
        }
        let Some(info) = self.image.as_ref().map(|image| image.info.clone()) else {
            return summary;
        };

        let decision = self.decide(viewport, &info);
        let Some(decision) = decision.filter(|d| d.subsampling && viewport.wants_tiles()) else {
            let had_grid = self.grid.take().is_some();
            summary.released = self.release_all_tiles();
            if had_grid || summary.released > 0 || !self.load_rect.is_empty() {
                self.load_rect = IntRect::default();
                debug!(image = ?self.image_key(), "Subsampling inactive for viewport");
                self.publish();
            }
            return summary;
        };
        let grid = decision.grid;
        let mut changed = false;

        if self.grid != Some(grid) {
            summary.transitioned = self.grid.is_some();
            summary.released += self.begin_transition(grid);
            changed = true;
        }

        let load_rect = self.compute_load_rect(viewport, &info, &grid);
        if load_rect != self.load_rect {
            self.load_rect = load_rect;
            changed = true;
        }

        // Foreground diff
        let needed = grid.cells_intersecting(&load_rect);
        let stale: Vec<TileCoord> = self
            .foreground
            .keys()
            .filter(|coord| !needed.contains(coord))
            .copied()
            .collect();
        for coord in stale {
            if let Some(tile) = self.foreground.remove(&coord) {
                self.release_tile(tile);
                summary.released += 1;
            }
        }
        for coord in needed {
            if self.foreground.contains_key(&coord) {
                continue;
            }
            let Some(rect) = grid.cell_rect(coord) else {
                continue;
            };
            let tile = self.create_tile(coord, rect, grid.sample_size);
            if tile.state == LoadState::Loaded {
                summary.cache_hits += 1;
            }
            self.foreground.insert(coord, tile);
            summary.created += 1;
        }

        // Background outside the load rect is no longer useful
        let background = std::mem::take(&mut self.background);
        for tile in background {
            if tile.rect.intersects(&load_rect) {
                self.background.push(tile);
            } else {
                self.release_tile(tile);
                summary.released += 1;
            }
        }
        summary.released += self.clear_background_if_covered();

        summary.paused = self.is_paused(viewport);
        if summary.paused {
            let pending = self
                .foreground
                .values()
                .filter(|tile| tile.state == LoadState::Pending)
                .count();
            if pending > 0 {
                debug!(gesture = ?viewport.gesture, pending, "Decode dispatch paused");
            }
        } else {
            summary.dispatched = self.dispatch_pending();
        }

        summary.active = true;
        summary.sample_size = grid.sample_size;
        summary.foreground = self.foreground.len();
        summary.background = self.background.len();

        if changed || summary.created > 0 || summary.released > 0 || summary.dispatched > 0 {
            self.publish();
        }
        summary
    }

    fn decide(&self, viewport: &Viewport, info: &ImageInfo) -> Option<SampleSizeDecision> {
        if !viewport.wants_tiles() {
            return None;
        }
        // The calculator works in source space; content and container are
        // display-space sizes.
        let swap = info.orientation.swaps_dimensions();
        let to_source = |size: IntSize| if swap { size.transposed() } else { size };
        Some(calculator::decide(
            info.size(),
            to_source(viewport.content_size),
            to_source(viewport.container_size),
            viewport.scale,
            self.config.max_tile_bytes,
        ))
    }

    /// Visible region in source space, grown by the prefetch margin.
    fn compute_load_rect(&self, viewport: &Viewport, info: &ImageInfo, grid: &TileGrid) -> IntRect {
        let display = viewport.visible_image_rect(info.display_size());
        let visible = info.orientation.display_to_source(display, info.size());
        let margin = self
            .config
            .prefetch_margin
            .unwrap_or_else(|| grid.tile_size.width.min(grid.tile_size.height) / 2);
        visible.expanded_within(margin.saturating_mul(grid.sample_size), info.size())
    }

    fn is_paused(&self, viewport: &Viewport) -> bool {
        viewport
            .gesture
            .is_some_and(|gesture| self.config.paused_gestures.contains(&gesture))
    }

    /// Switch to `grid`, keeping loaded tiles visible in the background.
    ///
    /// Returns the number of tiles released.
    fn begin_transition(&mut self, grid: TileGrid) -> usize {
        let mut released = 0;
        let previous = std::mem::take(&mut self.foreground);
        for (_, mut tile) in previous {
            if tile.handle.is_some() {
                tile.animation = AnimationState::None;
                self.background.push(tile);
            } else {
                self.release_tile(tile);
                released += 1;
            }
        }

        let background = std::mem::take(&mut self.background);
        for tile in background {
            let matches_grid = tile.sample_size == grid.sample_size
                && grid.cell_rect(tile.coordinate) == Some(tile.rect)
                && !self.foreground.contains_key(&tile.coordinate);
            if matches_grid {
                self.foreground.insert(tile.coordinate, tile);
            } else {
                self.background.push(tile);
            }
        }

        info!(
            image = ?self.image_key(),
            from = self.sample_size(),
            sample_size = grid.sample_size,
            cols = grid.cols,
            rows = grid.rows,
            background = self.background.len(),
            promoted = self.foreground.len(),
            "Switched tile grid"
        );
        self.grid = Some(grid);
        released
    }

    fn create_tile(&mut self, coordinate: TileCoord, rect: IntRect, sample_size: u32) -> Tile {
        self.next_tile_id += 1;
        let mut tile = Tile {
            id: self.next_tile_id,
            coordinate,
            rect,
            sample_size,
            state: LoadState::Pending,
            animation: AnimationState::None,
            handle: None,
            cancel: CancelFlag::new(),
            interrupted: false,
        };
        if let Some(image) = &self.image {
            let key = TileCacheKey::new(Arc::clone(&image.key), rect, sample_size);
            if let Some(handle) = self.cache.get_displayed(&key) {
                tile.handle = Some(handle);
                tile.state = LoadState::Loaded;
            }
        }
        tile
    }

    /// Release the background once the foreground is settled.
    fn clear_background_if_covered(&mut self) -> usize {
        if self.background.is_empty()
            || self.foreground.is_empty()
            || !self.foreground.values().all(Tile::is_settled)
        {
            return 0;
        }
        let background = std::mem::take(&mut self.background);
        let released = background.len();
        for tile in background {
            self.release_tile(tile);
        }
        debug!(
            image = ?self.image_key(),
            sample_size = self.sample_size(),
            released,
            "Foreground settled, background released"
        );
        released
    }

    fn dispatch_pending(&mut self) -> usize {
        let Some(image) = self.image.as_ref() else {
            return 0;
        };
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                warn!(error = %e, "Cannot dispatch decodes outside a tokio runtime");
                self.last_error = Some(EngineError::NoRuntime(e.to_string()));
                return 0;
            }
        };

        let mut dispatched = 0;
        for tile in self.foreground.values_mut() {
            if tile.state != LoadState::Pending {
                continue;
            }
            tile.state = LoadState::Loading;
            debug!(
                image = %image.key,
                sample_size = tile.sample_size,
                col = tile.coordinate.col,
                row = tile.coordinate.row,
                "Dispatching decode"
            );

            let pool = Arc::clone(&image.pool);
            let cache = Arc::clone(&self.cache);
            let alloc: Arc<dyn RasterAllocator> = self.cache.clone();
            let tx = self.outcome_tx.clone();
            let cancel = tile.cancel.clone();
            let key = TileCacheKey::new(Arc::clone(&image.key), tile.rect, tile.sample_size);
            let (tile_id, coordinate, rect, sample_size) =
                (tile.id, tile.coordinate, tile.rect, tile.sample_size);

            runtime.spawn(async move {
                let result = pool.decode(rect, sample_size, alloc, &cancel).await;
                let outcome = DecodeOutcome {
                    tile_id,
                    coordinate,
                    key,
                    result,
                };
                if let Err(mpsc::error::SendError(outcome)) = tx.send(outcome) {
                    if let Ok(raster) = outcome.result {
                        cache.recycle(raster);
                    }
                }
            });
            dispatched += 1;
        }
        self.in_flight += dispatched;
        dispatched
    }

    // -------------------------------------------------------------------------
    // Completion delivery
    // -------------------------------------------------------------------------

    /// Wait for the next decode completion.
    ///
    /// Returns `None` once the manager is destroyed. Pends forever when
    /// nothing is in flight, so callers select on it alongside other input.
    pub async fn next_outcome(&mut self) -> Option<DecodeOutcome> {
        self.outcome_rx.recv().await
    }

    /// Attach (or discard) one decode result.
    pub fn apply_outcome(&mut self, outcome: DecodeOutcome) -> OutcomeStatus {
        self.in_flight = self.in_flight.saturating_sub(1);
        let DecodeOutcome {
            tile_id,
            coordinate,
            key,
            result,
        } = outcome;

        let tile = match self.state {
            ManagerState::Active => self
                .foreground
                .get_mut(&coordinate)
                .filter(|tile| tile.id == tile_id && !tile.cancel.is_cancelled()),
            _ => None,
        };
        let Some(tile) = tile else {
            if let Ok(raster) = result {
                self.cache.recycle(raster);
            }
            return OutcomeStatus::Discarded;
        };

        let status = match result {
            Ok(raster) => {
                let handle = self.cache.put_displayed(key.clone(), raster);
                tile.animation = if self.config.tile_fade
                    && handle.origin() == RasterOrigin::FreshlyDecoded
                {
                    AnimationState::FadeIn
                } else {
                    AnimationState::None
                };
                tile.handle = Some(handle);
                tile.state = LoadState::Loaded;
                debug!(
                    tile = %key,
                    col = coordinate.col,
                    row = coordinate.row,
                    "Tile attached"
                );
                OutcomeStatus::Attached {
                    coordinate,
                    sample_size: tile.sample_size,
                }
            }
            Err(DecodeError::RegionUnsupported { reason }) => {
                let err = EngineError::RegionUnsupported {
                    key: key.image_key.to_string(),
                    reason,
                };
                self.fail_image(err.clone());
                return OutcomeStatus::Unsupported(err);
            }
            Err(DecodeError::Cancelled) | Err(DecodeError::PoolClosed) => {
                tile.state = LoadState::Pending;
                // Still wanted: retried once right away, after that on the next refresh
                let retry = !std::mem::replace(&mut tile.interrupted, true);
                let pool_open = self
                    .image
                    .as_ref()
                    .is_some_and(|image| !image.pool.is_closed());
                let paused = self
                    .last_viewport
                    .as_ref()
                    .is_some_and(|viewport| self.is_paused(viewport));
                if retry && pool_open && !paused {
                    let dispatched = self.dispatch_pending();
                    debug!(tile = %key, dispatched, "Re-dispatched interrupted decode");
                }
                return OutcomeStatus::Discarded;
            }
            Err(error) => {
                warn!(tile = %key, error = %error, "Tile decode failed");
                tile.state = LoadState::Error;
                OutcomeStatus::Failed { coordinate, error }
            }
        };

        self.clear_background_if_covered();
        self.publish();
        status
    }

    /// Apply outcomes until nothing is in flight.
    pub async fn drain_outcomes(&mut self) -> Vec<OutcomeStatus> {
        let mut statuses = Vec::new();
        while self.in_flight > 0 {
            match self.outcome_rx.recv().await {
                Some(outcome) => statuses.push(self.apply_outcome(outcome)),
                None => break,
            }
        }
        statuses
    }

    // -------------------------------------------------------------------------
    // Teardown helpers
    // -------------------------------------------------------------------------

    fn release_tile(&self, tile: Tile) {
        tile.cancel.cancel();
        if let Some(handle) = tile.handle {
            self.cache.release_displayed(handle);
        }
    }

    fn release_all_tiles(&mut self) -> usize {
        let foreground = std::mem::take(&mut self.foreground);
        let background = std::mem::take(&mut self.background);
        let released = foreground.len() + background.len();
        for (_, tile) in foreground {
            self.release_tile(tile);
        }
        for tile in background {
            self.release_tile(tile);
        }
        released
    }

    /// Drop the bound image: tiles, grid and decoder pool.
    fn unbind_image(&mut self) {
        self.release_all_tiles();
        self.grid = None;
        self.load_rect = IntRect::default();
        if let Some(image) = self.image.take() {
            image.pool.close();
            debug!(image = %image.key, "Unbound image");
        }
    }

    fn fail_image(&mut self, err: EngineError) {
        warn!(error = %err, "Region decoding unavailable, unbinding image");
        self.unbind_image();
        self.state = ManagerState::Idle;
        self.last_error = Some(err);
        self.publish();
    }

    fn publish(&mut self) {
        self.version += 1;
        let set = TileSnapshotSet {
            foreground_tiles: self.foreground.values().map(Tile::snapshot).collect(),
            background_tiles: self.background.iter().map(Tile::snapshot).collect(),
            sample_size: self.sample_size(),
            image_load_rect: self.load_rect,
            version: self.version,
        };
        self.snapshot_tx.send_replace(set);
    }
}

impl Drop for TileManager {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl fmt::Debug for TileManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TileManager")
            .field("state", &self.state)
            .field("image", &self.image_key())
            .field("sample_size", &self.sample_size())
            .field("foreground", &self.foreground.len())
            .field("background", &self.background.len())
            .field("in_flight", &self.in_flight)
            .finish()
    }
}
