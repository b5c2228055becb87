//! Bounded pool of decoder instances.
//!
//! A [`RegionDecoder`] serializes its own work, so parallelism comes from
//! holding several instances of the same image. The pool hands out one
//! instance per in-flight decode:
//!
//! ```text
//! decode() ──► acquire permit ──► check cancel ──► check out instance
//!                 (queues when                        (idle list, or
//!                  pool exhausted)                     factory.create())
//!                                                          │
//!                                     spawn_blocking(decode_region)
//!                                                          │
//!              release permit ◄── park instance ◄──────────┘
//! ```
//!
//! Instances are created lazily up to `max_decoders`. Closing the pool wakes
//! queued requests with [`DecodeError::PoolClosed`] and drops idle instances;
//! decodes already running finish and their instance is dropped afterwards.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::error::DecodeError;
use crate::tile::{IntRect, Raster, RasterAllocator};

use super::decoder::{DecoderFactory, ImageInfo, RegionDecoder};

/// Default number of decoder instances per image.
pub const DEFAULT_MAX_DECODERS: usize = 2;

// =============================================================================
// CancelFlag
// =============================================================================

/// Cooperative cancellation token shared between a tile and its decode.
///
/// Cancellation never interrupts a running decode; it is checked before the
/// decode starts and again before its result is attached.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

// =============================================================================
// DecoderPool
// =============================================================================

/// Decrements the in-use counter when a blocking decode finishes, even if it
/// panics.
struct InUseGuard(Arc<AtomicUsize>);

impl InUseGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(counter))
    }
}

impl Drop for InUseGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Per-image pool of region decoders.
pub struct DecoderPool {
    factory: Arc<dyn DecoderFactory>,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<Box<dyn RegionDecoder>>>,
    max_decoders: usize,
    created: AtomicUsize,
    in_use: Arc<AtomicUsize>,
    closed: AtomicBool,
}

impl DecoderPool {
    /// Create a pool holding at most `max_decoders` instances (minimum 1).
    pub fn new(factory: Arc<dyn DecoderFactory>, max_decoders: usize) -> Self {
        let max_decoders = max_decoders.max(1);
        Self {
            factory,
            permits: Arc::new(Semaphore::new(max_decoders)),
            idle: Mutex::new(Vec::with_capacity(max_decoders)),
            max_decoders,
            created: AtomicUsize::new(0),
            in_use: Arc::new(AtomicUsize::new(0)),
            closed: AtomicBool::new(false),
        }
    }

    /// Backend name of the underlying factory.
    pub fn backend(&self) -> &str {
        self.factory.name()
    }

    /// Probe the image with the pool's first instance.
    ///
    /// The probed instance is parked and reused for decoding.
    pub async fn probe(self: &Arc<Self>) -> Result<ImageInfo, DecodeError> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| DecodeError::PoolClosed)?;
        let mut decoder = self.checkout()?;

        let (decoder, result) = tokio::task::spawn_blocking(move || {
            let result = decoder.probe();
            (decoder, result)
        })
        .await
        .map_err(|e| DecodeError::ProbeFailure(format!("probe task failed: {}", e)))?;

        self.park(decoder);
        drop(permit);
        result
    }

    /// Decode one region on a pooled instance.
    ///
    /// Waits for a free instance when all are busy. Returns
    /// [`DecodeError::Cancelled`] without decoding if `cancel` fired while the
    /// request was queued.
    pub async fn decode(
        self: &Arc<Self>,
        rect: IntRect,
        sample_size: u32,
        alloc: Arc<dyn RasterAllocator>,
        cancel: &CancelFlag,
    ) -> Result<Raster, DecodeError> {
        if self.is_closed() {
            return Err(DecodeError::PoolClosed);
        }
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| DecodeError::PoolClosed)?;
        if cancel.is_cancelled() {
            return Err(DecodeError::Cancelled);
        }

        let mut decoder = self.checkout()?;
        let guard = InUseGuard::enter(&self.in_use);
        let (decoder, result) = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            let result = decoder.decode_region(rect, sample_size, alloc.as_ref());
            (decoder, result)
        })
        .await
        .map_err(|e| DecodeError::DecodeFailure(format!("decode task failed: {}", e)))?;

        self.park(decoder);
        drop(permit);
        result
    }

    /// Refuse new work and drop idle instances.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.permits.close();
        let dropped = {
            let mut idle = self.idle.lock();
            let n = idle.len();
            idle.clear();
            n
        };
        debug!(
            backend = self.factory.name(),
            dropped, "Closed decoder pool"
        );
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of decodes currently running.
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    /// Number of instances created over the pool's lifetime.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::Acquire)
    }

    pub fn max_decoders(&self) -> usize {
        self.max_decoders
    }

    fn checkout(&self) -> Result<Box<dyn RegionDecoder>, DecodeError> {
        if let Some(decoder) = self.idle.lock().pop() {
            return Ok(decoder);
        }
        let decoder = self.factory.create()?;
        let created = self.created.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(backend = self.factory.name(), created, "Created decoder instance");
        Ok(decoder)
    }

    fn park(&self, decoder: Box<dyn RegionDecoder>) {
        if self.is_closed() {
            return;
        }
        self.idle.lock().push(decoder);
    }
}

impl std::fmt::Debug for DecoderPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecoderPool")
            .field("backend", &self.factory.name())
            .field("max_decoders", &self.max_decoders)
            .field("created", &self.created())
            .field("in_use", &self.in_use())
            .field("closed", &self.is_closed())
            .finish()
    }
}
