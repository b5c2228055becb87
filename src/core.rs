//! Lifecycle shell around the tile manager.
//!
//! [`SubsamplingCore`] runs a [`TileManager`] on its own tokio task and
//! talks to the outside world only through channels:
//!
//! ```text
//!   CoreHandle ── commands (mpsc) ──────────┐
//!   CoreHandle ── viewport (watch) ───────┐ │
//!                                         ▼ ▼
//!                               ┌──────────────────┐
//!   decode outcomes (mpsc) ───► │   core task      │
//!                               │   TileManager    │
//!                               └───┬──────────┬───┘
//!                                   │          │
//!                 snapshots (watch) ▼          ▼ events (broadcast)
//! ```
//!
//! Viewport updates that only change the container size are coalesced over
//! [`EngineConfig::resize_debounce`]; every other change refreshes
//! immediately. Only the latest viewport matters, so the input is a watch
//! channel rather than a queue.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::decode::{DecoderRegistry, ImageInfo};
use crate::error::{DecodeError, EngineError};
use crate::io::ImageSource;
use crate::tile::{
    ManagerState, OutcomeStatus, TileCache, TileCoord, TileManager, TileSnapshotSet, Viewport,
};

const COMMAND_CAPACITY: usize = 32;
const EVENT_CAPACITY: usize = 256;

/// Notifications published by the core task.
#[derive(Debug, Clone)]
pub enum CoreEvent {
    /// The manager moved to a new lifecycle state
    StateChanged(ManagerState),

    /// An image was probed and bound
    ImageReady(ImageInfo),

    /// The image could not be used for tiling; the caller should fall back
    /// to a plain full-image display
    ImageFailed(EngineError),

    /// One tile failed to decode; the rest of the set is unaffected
    TileFailed {
        coordinate: TileCoord,
        error: DecodeError,
    },
}

enum CoreCommand {
    SetImage {
        source: Arc<dyn ImageSource>,
        reply: oneshot::Sender<Result<ImageInfo, EngineError>>,
    },
    Stop(oneshot::Sender<Result<(), EngineError>>),
    Start(oneshot::Sender<Result<(), EngineError>>),
    Destroy(oneshot::Sender<()>),
}

// =============================================================================
// Handle
// =============================================================================

/// Cloneable-by-reference front of a running core.
///
/// Dropping the handle shuts the task down just like [`CoreHandle::destroy`].
pub struct CoreHandle {
    commands: mpsc::Sender<CoreCommand>,
    viewport: watch::Sender<Option<Viewport>>,
    snapshots: watch::Receiver<TileSnapshotSet>,
    state: watch::Receiver<ManagerState>,
    events: broadcast::Sender<CoreEvent>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CoreHandle {
    /// Bind a new image, cancelling all work for the previous one.
    pub async fn set_image(&self, source: Arc<dyn ImageSource>) -> Result<ImageInfo, EngineError> {
        self.request(|reply| CoreCommand::SetImage { source, reply })
            .await?
    }

    /// Publish the latest viewport state. Never blocks.
    pub fn update_viewport(&self, viewport: Viewport) -> Result<(), EngineError> {
        if self.viewport.is_closed() {
            return Err(EngineError::Destroyed);
        }
        self.viewport.send_replace(Some(viewport));
        Ok(())
    }

    /// Release all tiles but keep the image bound.
    pub async fn stop(&self) -> Result<(), EngineError> {
        self.request(CoreCommand::Stop).await?
    }

    /// Resume after [`stop`](Self::stop).
    pub async fn start(&self) -> Result<(), EngineError> {
        self.request(CoreCommand::Start).await?
    }

    /// Tear the engine down and wait for the task to finish. Idempotent.
    pub async fn destroy(&self) {
        let (reply, done) = oneshot::channel();
        if self.commands.send(CoreCommand::Destroy(reply)).await.is_ok() {
            let _ = done.await;
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Core task ended abnormally");
            }
        }
    }

    /// Receiver of the renderer snapshots.
    pub fn snapshots(&self) -> watch::Receiver<TileSnapshotSet> {
        self.snapshots.clone()
    }

    /// Subscribe to lifecycle and tile failure events.
    pub fn events(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    /// Last lifecycle state published by the task.
    pub fn state(&self) -> ManagerState {
        *self.state.borrow()
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> CoreCommand,
    ) -> Result<T, EngineError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| EngineError::Destroyed)?;
        response.await.map_err(|_| EngineError::Destroyed)
    }
}

impl std::fmt::Debug for CoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreHandle")
            .field("state", &self.state())
            .finish()
    }
}

// =============================================================================
// Core task
// =============================================================================

/// The actor owning a [`TileManager`].
pub struct SubsamplingCore {
    manager: TileManager,
    config: EngineConfig,
    commands: mpsc::Receiver<CoreCommand>,
    viewport: watch::Receiver<Option<Viewport>>,
    state: watch::Sender<ManagerState>,
    events: broadcast::Sender<CoreEvent>,
    pending_resize: Option<(Viewport, Instant)>,
}

impl SubsamplingCore {
    /// Start a core task on the current tokio runtime.
    pub fn spawn(
        config: EngineConfig,
        cache: Arc<TileCache>,
        registry: Arc<DecoderRegistry>,
    ) -> Result<CoreHandle, EngineError> {
        config.validate().map_err(EngineError::InvalidConfig)?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| EngineError::NoRuntime(e.to_string()))?;

        let manager = TileManager::new(config.clone(), cache, registry);
        let snapshots = manager.subscribe();
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (viewport_tx, viewport_rx) = watch::channel(None);
        let (state_tx, state_rx) = watch::channel(manager.state());
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);

        let core = SubsamplingCore {
            manager,
            config,
            commands: command_rx,
            viewport: viewport_rx,
            state: state_tx,
            events: event_tx.clone(),
            pending_resize: None,
        };
        let task = runtime.spawn(core.run());
        info!("Subsampling core started");

        Ok(CoreHandle {
            commands: command_tx,
            viewport: viewport_tx,
            snapshots,
            state: state_rx,
            events: event_tx,
            task: Mutex::new(Some(task)),
        })
    }

    /// Start a core with its own cache sized from `config` and the default
    /// decoder backends.
    pub fn spawn_default(config: EngineConfig) -> Result<CoreHandle, EngineError> {
        let cache = Arc::new(TileCache::with_capacities(
            config.cache_bytes,
            config.buffer_pool_bytes,
        ));
        let registry = Arc::new(DecoderRegistry::for_config(&config));
        Self::spawn(config, cache, registry)
    }

    async fn run(mut self) {
        loop {
            let deadline = self.pending_resize.as_ref().map(|(_, at)| *at);

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command).await {
                            break;
                        }
                    }
                    None => {
                        debug!("All core handles dropped");
                        break;
                    }
                },
                changed = self.viewport.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let viewport = self.viewport.borrow_and_update().clone();
                    if let Some(viewport) = viewport {
                        self.on_viewport(viewport);
                    }
                }
                Some(outcome) = self.manager.next_outcome() => {
                    let status = self.manager.apply_outcome(outcome);
                    self.on_outcome(status);
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    if let Some((viewport, _)) = self.pending_resize.take() {
                        debug!(container = %viewport.container_size, "Applying debounced resize");
                        self.manager.refresh(&viewport);
                    }
                }
            }
        }

        self.manager.destroy();
        self.sync_state();
        info!("Subsampling core stopped");
    }

    /// Returns false once the task should exit.
    async fn handle_command(&mut self, command: CoreCommand) -> bool {
        match command {
            CoreCommand::SetImage { source, reply } => {
                self.pending_resize = None;
                let result = self.manager.set_image(source).await;
                self.sync_state();
                match &result {
                    Ok(info) => self.emit(CoreEvent::ImageReady(info.clone())),
                    Err(err) => self.emit(CoreEvent::ImageFailed(err.clone())),
                }
                let _ = reply.send(result);
                true
            }
            CoreCommand::Stop(reply) => {
                let result = self.manager.stop();
                self.sync_state();
                let _ = reply.send(result);
                true
            }
            CoreCommand::Start(reply) => {
                let result = self.manager.resume().map(|_| ());
                self.sync_state();
                let _ = reply.send(result);
                true
            }
            CoreCommand::Destroy(reply) => {
                self.manager.destroy();
                self.sync_state();
                let _ = reply.send(());
                false
            }
        }
    }

    fn on_viewport(&mut self, viewport: Viewport) {
        let is_resize = !self.config.resize_debounce.is_zero()
            && self
                .manager
                .last_viewport()
                .is_some_and(|last| viewport.is_resize_of(last));

        if is_resize {
            // Restart the window on every size change
            let at = Instant::now() + self.config.resize_debounce;
            self.pending_resize = Some((viewport, at));
            return;
        }

        self.pending_resize = None;
        let summary = self.manager.refresh(&viewport);
        debug!(
            active = summary.active,
            sample_size = summary.sample_size,
            dispatched = summary.dispatched,
            "Viewport refresh"
        );
        self.sync_state();
    }

    fn on_outcome(&mut self, status: OutcomeStatus) {
        match status {
            OutcomeStatus::Failed { coordinate, error } => {
                self.emit(CoreEvent::TileFailed { coordinate, error });
            }
            OutcomeStatus::Unsupported(err) => {
                self.sync_state();
                self.emit(CoreEvent::ImageFailed(err));
            }
            OutcomeStatus::Attached { .. } | OutcomeStatus::Discarded => {}
        }
    }

    fn sync_state(&mut self) {
        let state = self.manager.state();
        if *self.state.borrow() != state {
            self.state.send_replace(state);
            self.emit(CoreEvent::StateChanged(state));
        }
    }

    fn emit(&self, event: CoreEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}
