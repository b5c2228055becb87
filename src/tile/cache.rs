//! Tile bitmap cache with a buffer reuse pool.
//!
//! Decoded tiles are cached by image, source rectangle and sample size so
//! that panning back over a region, or returning to a previous zoom level,
//! does not decode again.
//!
//! # Size-Based Eviction
//!
//! The cache tracks the total byte size of cached rasters and evicts
//! least-recently-used entries when the budget is exceeded. Entries marked as
//! displayed are pinned: the evictor skips them on every pass without touching
//! their recency.
//!
//! # Buffer Reuse
//!
//! Evicted rasters that nobody else holds are not freed. Their buffers go to a
//! pool bucketed by `(width, height, format)`, and decoders draw from it via
//! [`RasterAllocator`]. Rapid zoom changes keep producing same-shaped tiles,
//! so most allocations are served from the pool.
//!
//! # Locking
//!
//! One mutex guards the index, the byte counter and the pool. It is held only
//! for map mutations; decoding never happens under it.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;

use super::geometry::IntRect;
use super::raster::{PixelFormat, Raster, RasterAllocator};

/// Default cache capacity: 192MB
pub const DEFAULT_TILE_CACHE_CAPACITY: usize = 192 * 1024 * 1024;

/// Default reuse pool capacity: 32MB
pub const DEFAULT_BUFFER_POOL_CAPACITY: usize = 32 * 1024 * 1024;

// =============================================================================
// Cache Key
// =============================================================================

/// Cache key for decoded tiles.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TileCacheKey {
    /// Identity of the image source
    pub image_key: Arc<str>,

    /// Source-space rectangle of the tile
    pub rect: IntRect,

    /// Sample size the tile was decoded at
    pub sample_size: u32,
}

impl TileCacheKey {
    /// Create a new cache key.
    pub fn new(image_key: impl Into<Arc<str>>, rect: IntRect, sample_size: u32) -> Self {
        Self {
            image_key: image_key.into(),
            rect,
            sample_size,
        }
    }
}

impl fmt::Display for TileCacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}{}", self.image_key, self.sample_size, self.rect)
    }
}

// =============================================================================
// Raster Handle
// =============================================================================

/// Where a handle's raster came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RasterOrigin {
    FreshlyDecoded,
    FromCache,
}

/// Owned reference to a cached raster.
///
/// Handles are move-only. The raster they point to cannot be recycled while
/// any handle is alive, whether or not the cache still indexes it.
pub struct RasterHandle {
    key: TileCacheKey,
    raster: Arc<Raster>,
    origin: RasterOrigin,
    live: Arc<AtomicUsize>,
}

impl RasterHandle {
    fn new(
        key: TileCacheKey,
        raster: Arc<Raster>,
        origin: RasterOrigin,
        live: &Arc<AtomicUsize>,
    ) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        Self {
            key,
            raster,
            origin,
            live: Arc::clone(live),
        }
    }

    pub fn key(&self) -> &TileCacheKey {
        &self.key
    }

    pub fn raster(&self) -> &Raster {
        &self.raster
    }

    /// Shared pointer to the raster, for renderers that outlive the handle.
    pub fn shared(&self) -> Arc<Raster> {
        Arc::clone(&self.raster)
    }

    pub fn origin(&self) -> RasterOrigin {
        self.origin
    }

    pub fn width(&self) -> u32 {
        self.raster.width()
    }

    pub fn height(&self) -> u32 {
        self.raster.height()
    }

    pub fn byte_size(&self) -> usize {
        self.raster.byte_size()
    }
}

impl Drop for RasterHandle {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl fmt::Debug for RasterHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RasterHandle")
            .field("key", &self.key)
            .field("size", &self.raster.size())
            .field("origin", &self.origin)
            .finish()
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Counters describing cache behavior since creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    /// Buffers returned to the reuse pool
    pub recycled: u64,
    /// Allocations served from the reuse pool
    pub reused: u64,
}

// =============================================================================
// Buffer Pool
// =============================================================================

type BucketKey = (u32, u32, PixelFormat);

struct BufferPool {
    buckets: HashMap<BucketKey, Vec<Vec<u8>>>,
    size: usize,
    max_size: usize,
}

impl BufferPool {
    fn new(max_size: usize) -> Self {
        Self {
            buckets: HashMap::new(),
            size: 0,
            max_size,
        }
    }

    /// Returns false when the pool is full and the buffer was dropped.
    fn give(&mut self, raster: Raster) -> bool {
        let key = (raster.width(), raster.height(), raster.format());
        let buffer = raster.into_buffer();
        if buffer.is_empty() || self.size + buffer.len() > self.max_size {
            return false;
        }
        self.size += buffer.len();
        self.buckets.entry(key).or_default().push(buffer);
        true
    }

    fn take(&mut self, key: BucketKey) -> Option<Vec<u8>> {
        let bucket = self.buckets.get_mut(&key)?;
        let buffer = bucket.pop()?;
        if bucket.is_empty() {
            self.buckets.remove(&key);
        }
        self.size = self.size.saturating_sub(buffer.len());
        Some(buffer)
    }

    fn count(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    fn clear(&mut self) {
        self.buckets.clear();
        self.size = 0;
    }
}

// =============================================================================
// Tile Cache
// =============================================================================

struct CacheEntry {
    raster: Arc<Raster>,
    /// Number of tiles currently displaying this raster
    displayed: u32,
}

struct CacheInner {
    entries: LruCache<TileCacheKey, CacheEntry>,
    current_size: usize,
    pool: BufferPool,
    stats: CacheStats,
}

impl CacheInner {
    fn recycle(&mut self, raster: Arc<Raster>) {
        if let Ok(raster) = Arc::try_unwrap(raster) {
            if self.pool.give(raster) {
                self.stats.recycled += 1;
            }
        }
    }

    fn evict_to(&mut self, max_size: usize) {
        while self.current_size > max_size {
            // Oldest entry that is not on screen. Pinned entries keep their
            // position in the recency order.
            let victim = self
                .entries
                .iter()
                .rev()
                .find(|(_, entry)| entry.displayed == 0)
                .map(|(key, _)| key.clone());
            let Some(key) = victim else {
                break;
            };
            if let Some(entry) = self.entries.pop(&key) {
                self.current_size = self.current_size.saturating_sub(entry.raster.byte_size());
                self.stats.evictions += 1;
                self.recycle(entry.raster);
            }
        }
    }
}

/// LRU cache for decoded tiles with a byte budget.
///
/// The cache is explicitly constructed and shared via `Arc`; it may serve
/// several images at once since keys carry the image identity.
///
/// # Example
///
/// ```
/// use subsampling_engine::tile::{IntRect, PixelFormat, Raster, TileCache, TileCacheKey};
///
/// let cache = TileCache::with_capacity(1024 * 1024);
/// let key = TileCacheKey::new("photo.jpg", IntRect::new(0, 0, 512, 512), 2);
///
/// let handle = cache.put(key.clone(), Raster::new(256, 256, PixelFormat::Rgba8, Vec::new()));
/// assert_eq!(handle.width(), 256);
/// assert!(cache.get(&key).is_some());
/// ```
pub struct TileCache {
    inner: Mutex<CacheInner>,

    /// Maximum total size in bytes
    max_size: usize,

    /// Number of `RasterHandle`s alive
    live_handles: Arc<AtomicUsize>,
}

impl TileCache {
    /// Create a new tile cache with default capacities.
    pub fn new() -> Self {
        Self::with_capacities(DEFAULT_TILE_CACHE_CAPACITY, DEFAULT_BUFFER_POOL_CAPACITY)
    }

    /// Create a new tile cache with the given byte budget and the default
    /// reuse pool capacity.
    pub fn with_capacity(max_size: usize) -> Self {
        Self::with_capacities(max_size, DEFAULT_BUFFER_POOL_CAPACITY)
    }

    /// Create a new tile cache with explicit budgets.
    ///
    /// # Arguments
    ///
    /// * `max_size` - Maximum total size of cached rasters in bytes
    /// * `pool_size` - Maximum total size of idle buffers kept for reuse
    pub fn with_capacities(max_size: usize, pool_size: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: LruCache::unbounded(),
                current_size: 0,
                pool: BufferPool::new(pool_size),
                stats: CacheStats::default(),
            }),
            max_size,
            live_handles: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Get a tile from the cache.
    ///
    /// This operation marks the entry as recently used.
    pub fn get(&self, key: &TileCacheKey) -> Option<RasterHandle> {
        self.lookup(key, false)
    }

    /// Get a tile and pin it as displayed under the same lock.
    ///
    /// A returned handle always owns one display mark, to be given back with
    /// [`release_displayed`](Self::release_displayed).
    pub fn get_displayed(&self, key: &TileCacheKey) -> Option<RasterHandle> {
        self.lookup(key, true)
    }

    fn lookup(&self, key: &TileCacheKey, displayed: bool) -> Option<RasterHandle> {
        let mut inner = self.inner.lock();
        let raster = inner.entries.get_mut(key).map(|entry| {
            entry.displayed += u32::from(displayed);
            Arc::clone(&entry.raster)
        });
        match raster {
            Some(raster) => {
                inner.stats.hits += 1;
                Some(RasterHandle::new(
                    key.clone(),
                    raster,
                    RasterOrigin::FromCache,
                    &self.live_handles,
                ))
            }
            None => {
                inner.stats.misses += 1;
                None
            }
        }
    }

    /// Check if a tile is cached without updating LRU order.
    pub fn contains(&self, key: &TileCacheKey) -> bool {
        self.inner.lock().entries.contains(key)
    }

    /// Store a decoded tile and return the canonical handle for it.
    ///
    /// If the key is already cached, the existing raster wins: the incoming
    /// buffer is recycled and the returned handle points at the cached one.
    /// Least-recently-used, non-displayed entries are evicted until the cache
    /// is back within budget.
    pub fn put(&self, key: TileCacheKey, raster: Raster) -> RasterHandle {
        self.insert(key, raster, false)
    }

    /// Store a decoded tile that is about to go on screen.
    ///
    /// Same as [`put`](Self::put) followed by
    /// [`mark_displayed`](Self::mark_displayed), except that the entry is
    /// pinned before eviction runs, so it survives even when every other
    /// entry is pinned too.
    pub fn put_displayed(&self, key: TileCacheKey, raster: Raster) -> RasterHandle {
        self.insert(key, raster, true)
    }

    fn insert(&self, key: TileCacheKey, raster: Raster, displayed: bool) -> RasterHandle {
        let mut inner = self.inner.lock();
        let pin = u32::from(displayed);

        let existing = inner.entries.get_mut(&key).map(|entry| {
            entry.displayed += pin;
            Arc::clone(&entry.raster)
        });
        if let Some(existing) = existing {
            if inner.pool.give(raster) {
                inner.stats.recycled += 1;
            }
            return RasterHandle::new(key, existing, RasterOrigin::FromCache, &self.live_handles);
        }

        let raster = Arc::new(raster);
        inner.current_size += raster.byte_size();
        inner.entries.put(
            key.clone(),
            CacheEntry {
                raster: Arc::clone(&raster),
                displayed: pin,
            },
        );
        inner.evict_to(self.max_size);

        RasterHandle::new(key, raster, RasterOrigin::FreshlyDecoded, &self.live_handles)
    }

    /// Mark or unmark a cached tile as on screen.
    ///
    /// Marks are counted, so two tiles sharing a raster both have to unmark it
    /// before it becomes evictable. Unmarking may trigger eviction of entries
    /// that were kept only because they were pinned. Returns false if the key
    /// is not cached.
    pub fn mark_displayed(&self, key: &TileCacheKey, displayed: bool) -> bool {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.peek_mut(key) else {
            return false;
        };
        if displayed {
            entry.displayed += 1;
        } else {
            entry.displayed = entry.displayed.saturating_sub(1);
            inner.evict_to(self.max_size);
        }
        true
    }

    /// Drop a handle obtained from [`get_displayed`](Self::get_displayed) or
    /// [`put_displayed`](Self::put_displayed) and give back its display mark.
    ///
    /// The mark is only removed if the cache still indexes the handle's own
    /// raster. An entry that was removed and re-inserted under the same key
    /// carries someone else's marks. Returns whether a mark was removed.
    pub fn release_displayed(&self, handle: RasterHandle) -> bool {
        let mut inner = self.inner.lock();
        let owned = match inner.entries.peek_mut(handle.key()) {
            Some(entry) if Arc::ptr_eq(&entry.raster, &handle.raster) => {
                entry.displayed = entry.displayed.saturating_sub(1);
                true
            }
            _ => false,
        };
        // Our reference goes first so an eviction can reclaim the buffer
        drop(handle);
        if owned {
            inner.evict_to(self.max_size);
        }
        owned
    }

    /// Whether a cached tile is currently pinned.
    pub fn is_displayed(&self, key: &TileCacheKey) -> bool {
        self.inner
            .lock()
            .entries
            .peek(key)
            .is_some_and(|entry| entry.displayed > 0)
    }

    /// Remove a tile from the cache, returning whether it was present.
    pub fn remove(&self, key: &TileCacheKey) -> bool {
        let mut inner = self.inner.lock();
        match inner.entries.pop(key) {
            Some(entry) => {
                inner.current_size = inner.current_size.saturating_sub(entry.raster.byte_size());
                inner.recycle(entry.raster);
                true
            }
            None => false,
        }
    }

    /// Return a raster that will not be cached (e.g. a cancelled decode) to
    /// the reuse pool.
    pub fn recycle(&self, raster: Raster) {
        let mut inner = self.inner.lock();
        if inner.pool.give(raster) {
            inner.stats.recycled += 1;
        }
    }

    /// Clear all entries and pooled buffers.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.current_size = 0;
        inner.pool.clear();
    }

    /// Get the current number of cached tiles.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Get the current total size of cached tiles in bytes.
    pub fn size(&self) -> usize {
        self.inner.lock().current_size
    }

    /// Get the maximum capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.max_size
    }

    /// Number of idle buffers waiting in the reuse pool.
    pub fn pooled_buffers(&self) -> usize {
        self.inner.lock().pool.count()
    }

    /// Total bytes of idle buffers in the reuse pool.
    pub fn pooled_bytes(&self) -> usize {
        self.inner.lock().pool.size
    }

    /// Number of raster handles currently alive anywhere.
    pub fn outstanding_handles(&self) -> usize {
        self.live_handles.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats
    }
}

impl Default for TileCache {
    fn default() -> Self {
        Self::new()
    }
}

impl RasterAllocator for TileCache {
    fn acquire_buffer(&self, width: u32, height: u32, format: PixelFormat) -> Vec<u8> {
        {
            let mut inner = self.inner.lock();
            if let Some(buffer) = inner.pool.take((width, height, format)) {
                inner.stats.reused += 1;
                return buffer;
            }
        }
        vec![0u8; Raster::expected_len(width, height, format)]
    }
}

// =============================================================================
// Tests
// =============================================================================
