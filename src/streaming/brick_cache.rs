/// Multi-resolution brick cache
///
/// Resident bricks are tracked in a recency ordering and evicted least recently
/// used first whenever the brick-count or memory limit is exceeded. Concurrent
/// requests for one key share a single fetch. Fetches run as spawned tasks, so a
/// caller dropping its future never strands the pending record.
///
/// Cache state sits behind a mutex that is never held across an `.await`; every
/// mutation (insert, evict, recency bump) completes inside one critical section.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use futures::future::{BoxFuture, Shared};
use futures::stream::{self, Stream, StreamExt, TryStreamExt};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use crate::config::CacheConfig;
use crate::error::{EngineError, EngineResult};
use crate::manifest::Manifest;
use crate::slice::{intersecting_bricks, stitch_slice, SliceData, SliceType};
use crate::streaming::error::StreamingErrorContext;
use crate::streaming::{Brick, BrickKey, BrickSource};

type PendingFetch = Shared<BoxFuture<'static, EngineResult<Arc<Brick>>>>;

/// Snapshot of cache counters
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Requests that joined a fetch already in flight
    pub deduplicated: u64,
    pub fetches: u64,
    pub fetch_failures: u64,
    pub evictions: u64,
    pub resident_bricks: usize,
    pub memory_bytes: usize,
    pub pending_fetches: usize,
}

#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    deduplicated: AtomicU64,
    fetches: AtomicU64,
    fetch_failures: AtomicU64,
    evictions: AtomicU64,
}

struct CacheEntry {
    brick: Arc<Brick>,
    tick: u64,
}

#[derive(Default)]
struct CacheState {
    entries: FxHashMap<BrickKey, CacheEntry>,
    /// tick -> key, oldest first
    recency: BTreeMap<u64, BrickKey>,
    next_tick: u64,
    memory_bytes: usize,
    pending: FxHashMap<BrickKey, PendingFetch>,
}

impl CacheState {
    fn bump(&mut self) -> u64 {
        let tick = self.next_tick;
        self.next_tick += 1;
        tick
    }

    fn touch(&mut self, key: &BrickKey) -> Option<Arc<Brick>> {
        let tick = self.bump();
        let entry = self.entries.get_mut(key)?;
        self.recency.remove(&entry.tick);
        entry.tick = tick;
        self.recency.insert(tick, *key);
        Some(entry.brick.clone())
    }

    fn insert(&mut self, brick: Arc<Brick>) {
        let key = brick.key();
        self.remove(&key);
        let tick = self.bump();
        self.memory_bytes += brick.byte_len();
        self.recency.insert(tick, key);
        self.entries.insert(key, CacheEntry { brick, tick });
    }

    fn remove(&mut self, key: &BrickKey) -> Option<Arc<Brick>> {
        let entry = self.entries.remove(key)?;
        self.recency.remove(&entry.tick);
        self.memory_bytes -= entry.brick.byte_len();
        Some(entry.brick)
    }

    /// Evict least recently used entries until both limits hold
    fn enforce_limits(&mut self, max_bricks: usize, max_bytes: usize) -> Vec<BrickKey> {
        let mut evicted = Vec::new();
        while self.entries.len() > max_bricks || self.memory_bytes > max_bytes {
            let Some((_, key)) = self.recency.pop_first() else {
                break;
            };
            if let Some(entry) = self.entries.remove(&key) {
                self.memory_bytes -= entry.brick.byte_len();
                evicted.push(key);
            }
        }
        evicted
    }
}

struct CacheInner {
    manifest: Arc<Manifest>,
    source: Arc<dyn BrickSource>,
    config: RwLock<CacheConfig>,
    state: Mutex<CacheState>,
    counters: CacheCounters,
}

impl CacheInner {
    async fn fetch_and_insert(self: Arc<Self>, key: BrickKey) -> EngineResult<Arc<Brick>> {
        self.counters.fetches.fetch_add(1, Ordering::Relaxed);
        let result = self.fetch_brick(key).await;

        let evicted = {
            let mut state = self.state.lock();
            state.pending.remove(&key);
            match &result {
                Ok(brick) => {
                    state.insert(brick.clone());
                    let config = self.config.read();
                    state.enforce_limits(config.max_bricks, config.max_memory_bytes())
                }
                Err(_) => Vec::new(),
            }
        };

        match &result {
            Ok(_) => {
                log::debug!("Cached brick {}", key);
                if !evicted.is_empty() {
                    self.counters
                        .evictions
                        .fetch_add(evicted.len() as u64, Ordering::Relaxed);
                    log::debug!("Evicted {} bricks after inserting {}", evicted.len(), key);
                }
            }
            Err(e) => {
                self.counters.fetch_failures.fetch_add(1, Ordering::Relaxed);
                log::warn!("{}", e);
            }
        }

        result
    }

    async fn fetch_brick(&self, key: BrickKey) -> EngineResult<Arc<Brick>> {
        let brick_size = self.manifest.level(key.level)?.brick_size;
        let bytes = self.source.fetch(&key.path()).await.brick_context(key)?;
        Ok(Arc::new(Brick::decode(key, &bytes, brick_size)?))
    }
}

/// Shared handle to the brick cache
#[derive(Clone)]
pub struct BrickCache {
    inner: Arc<CacheInner>,
}

impl BrickCache {
    pub fn new(manifest: Arc<Manifest>, source: Arc<dyn BrickSource>, config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                manifest,
                source,
                config: RwLock::new(config),
                state: Mutex::new(CacheState::default()),
                counters: CacheCounters::default(),
            }),
        }
    }

    pub fn manifest(&self) -> &Arc<Manifest> {
        &self.inner.manifest
    }

    pub fn config(&self) -> CacheConfig {
        self.inner.config.read().clone()
    }

    /// Replace the limits; shrinking takes effect immediately
    pub fn set_config(&self, config: CacheConfig) {
        let (max_bricks, max_bytes) = (config.max_bricks, config.max_memory_bytes());
        *self.inner.config.write() = config;

        let evicted = self.inner.state.lock().enforce_limits(max_bricks, max_bytes);
        if !evicted.is_empty() {
            self.inner
                .counters
                .evictions
                .fetch_add(evicted.len() as u64, Ordering::Relaxed);
            log::debug!("Evicted {} bricks after cache limits changed", evicted.len());
        }
    }

    /// Get a brick, fetching it on a miss
    ///
    /// A hit refreshes recency. A miss joins the in-flight fetch for the key if
    /// there is one, otherwise starts it. Must be called within a tokio runtime.
    pub async fn load_brick(&self, key: BrickKey) -> EngineResult<Arc<Brick>> {
        let level = self.inner.manifest.level(key.level)?;
        if !level.contains_brick(&key) {
            return Err(EngineError::brick_fetch(
                key,
                format!("outside the {:?} brick grid", level.num_bricks),
            ));
        }

        let pending = {
            let mut state = self.inner.state.lock();
            if let Some(brick) = state.touch(&key) {
                self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(brick);
            }
            match state.pending.get(&key) {
                Some(pending) => {
                    self.inner.counters.deduplicated.fetch_add(1, Ordering::Relaxed);
                    pending.clone()
                }
                None => {
                    self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
                    let pending = self.spawn_fetch(key);
                    state.pending.insert(key, pending.clone());
                    pending
                }
            }
        };

        pending.await
    }

    fn spawn_fetch(&self, key: BrickKey) -> PendingFetch {
        let inner = self.inner.clone();
        let handle = tokio::spawn(inner.clone().fetch_and_insert(key));
        async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => {
                    inner.state.lock().pending.remove(&key);
                    Err(EngineError::brick_fetch(key, format!("fetch task failed: {}", e)))
                }
            }
        }
        .boxed()
        .shared()
    }

    /// Stream every brick of a level with bounded parallelism
    ///
    /// Fetches are issued in nested `(x, y, z)` order; completion order is not
    /// specified.
    pub fn fetch_level(
        &self,
        level: u32,
    ) -> EngineResult<impl Stream<Item = EngineResult<Arc<Brick>>> + Send + 'static> {
        let keys = self.inner.manifest.brick_keys(level)?;
        let concurrency = self.config().fetch_concurrency.max(1);
        let cache = self.clone();
        Ok(stream::iter(keys)
            .map(move |key| {
                let cache = cache.clone();
                async move { cache.load_brick(key).await }
            })
            .buffer_unordered(concurrency))
    }

    /// Fetch every brick of a level, failing on the first error
    pub async fn load_level(&self, level: u32) -> EngineResult<usize> {
        let loaded = self
            .fetch_level(level)?
            .try_fold(0usize, |count, _| async move { Ok(count + 1) })
            .await?;
        log::info!("Loaded {} bricks for level {}", loaded, level);
        Ok(loaded)
    }

    /// Fetch the bricks intersecting a slice
    ///
    /// The first failure fails the whole request; bricks already gathered are
    /// discarded.
    pub async fn bricks_for_slice(
        &self,
        slice_type: SliceType,
        index: usize,
        level: u32,
    ) -> EngineResult<Vec<Arc<Brick>>> {
        let keys = intersecting_bricks(self.inner.manifest.level(level)?, slice_type, index)?;
        let concurrency = self.config().fetch_concurrency.max(1);
        stream::iter(keys)
            .map(|key| self.load_brick(key))
            .buffered(concurrency)
            .try_collect()
            .await
    }

    /// Stitch a slice from the bricks that intersect it
    pub async fn get_slice(
        &self,
        slice_type: SliceType,
        index: usize,
        level: u32,
    ) -> EngineResult<SliceData> {
        let bricks = self.bricks_for_slice(slice_type, index, level).await?;
        stitch_slice(self.inner.manifest.level(level)?, slice_type, index, &bricks)
    }

    /// Remove every resident brick of `level`, irrespective of recency
    pub fn evict_level(&self, level: u32) -> usize {
        let removed = {
            let mut state = self.inner.state.lock();
            let keys: Vec<BrickKey> = state
                .entries
                .keys()
                .filter(|key| key.level == level)
                .copied()
                .collect();
            for key in &keys {
                state.remove(key);
            }
            keys.len()
        };
        if removed > 0 {
            self.inner
                .counters
                .evictions
                .fetch_add(removed as u64, Ordering::Relaxed);
            log::debug!("Evicted {} bricks of level {}", removed, level);
        }
        removed
    }

    /// Drop every resident brick. In-flight fetches still complete and insert.
    pub fn clear(&self) {
        let mut state = self.inner.state.lock();
        state.entries.clear();
        state.recency.clear();
        state.memory_bytes = 0;
    }

    /// Resident brick without refreshing recency
    pub fn peek(&self, key: &BrickKey) -> Option<Arc<Brick>> {
        self.inner
            .state
            .lock()
            .entries
            .get(key)
            .map(|entry| entry.brick.clone())
    }

    pub fn contains(&self, key: &BrickKey) -> bool {
        self.inner.state.lock().entries.contains_key(key)
    }

    pub fn is_pending(&self, key: &BrickKey) -> bool {
        self.inner.state.lock().pending.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn memory_bytes(&self) -> usize {
        self.inner.state.lock().memory_bytes
    }

    /// Resident keys, sorted
    pub fn resident_keys(&self) -> Vec<BrickKey> {
        let mut keys: Vec<BrickKey> = self.inner.state.lock().entries.keys().copied().collect();
        keys.sort();
        keys
    }

    pub fn stats(&self) -> CacheStats {
        let (resident_bricks, memory_bytes, pending_fetches) = {
            let state = self.inner.state.lock();
            (state.entries.len(), state.memory_bytes, state.pending.len())
        };
        let counters = &self.inner.counters;
        CacheStats {
            hits: counters.hits.load(Ordering::Relaxed),
            misses: counters.misses.load(Ordering::Relaxed),
            deduplicated: counters.deduplicated.load(Ordering::Relaxed),
            fetches: counters.fetches.load(Ordering::Relaxed),
            fetch_failures: counters.fetch_failures.load(Ordering::Relaxed),
            evictions: counters.evictions.load(Ordering::Relaxed),
            resident_bricks,
            memory_bytes,
            pending_fetches,
        }
    }
}

impl std::fmt::Debug for BrickCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrickCache")
            .field("source", &self.inner.source.describe())
            .field("config", &*self.inner.config.read())
            .field("stats", &self.stats())
            .finish()
    }
}
