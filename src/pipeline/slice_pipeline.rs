/// Off-thread slice pipeline
///
/// Bricks are gathered on the async side through the brick cache, then handed to
/// the slice worker thread, which stitches and color-maps them. Finished slices
/// land in a FIFO result cache. Each satisfied request schedules best-effort
/// prefetches of its neighbors, drained one at a time by a background task.
///
/// Only the active color table (the one of the latest foreground request) may
/// fill the result cache. Prefetch jobs carry the epoch they were queued in;
/// switching tables or calling `cancel_prefetch` starts a new epoch and queued
/// jobs from older epochs are skipped.
///
/// Lock order: `results` before `pending`. Neither is held across an `.await`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, oneshot};
use crate::config::PipelineConfig;
use crate::error::{EngineError, EngineResult};
use crate::pipeline::protocol::{StitchJob, WorkerRequest, WorkerResponse};
use crate::pipeline::result_cache::SliceResultCache;
use crate::pipeline::worker::spawn_worker;
use crate::slice::{ColorLut, ColoredSlice, SliceKey, SliceType};
use crate::streaming::{Brick, BrickCache};

type PendingSlice = Shared<BoxFuture<'static, EngineResult<Arc<ColoredSlice>>>>;
type Waiters = Arc<Mutex<FxHashMap<u64, oneshot::Sender<EngineResult<ColoredSlice>>>>>;

/// Pipeline counters snapshot
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PipelineStats {
    /// Foreground `request_slice` calls
    pub requests: u64,
    pub result_hits: u64,
    /// Slices produced by the worker
    pub computed: u64,
    pub prefetch_issued: u64,
    pub prefetch_failed: u64,
    pub cached_results: usize,
    pub pending: usize,
}

#[derive(Debug, Default)]
struct PipelineCounters {
    requests: AtomicU64,
    result_hits: AtomicU64,
    computed: AtomicU64,
    prefetch_issued: AtomicU64,
    prefetch_failed: AtomicU64,
}

struct PrefetchJob {
    key: SliceKey,
    lut: Arc<ColorLut>,
    value_range: (f32, f32),
    epoch: u64,
}

/// No color table has been used yet; table ids start at 1
const NO_ACTIVE_LUT: u64 = 0;

struct PipelineInner {
    cache: BrickCache,
    config: PipelineConfig,
    requests: crossbeam_channel::Sender<WorkerRequest>,
    waiters: Waiters,
    next_request_id: AtomicU64,
    results: Mutex<SliceResultCache>,
    pending: Mutex<FxHashMap<(SliceKey, u64), PendingSlice>>,
    prefetch_tx: mpsc::UnboundedSender<PrefetchJob>,
    /// Held by the prefetch loop while a job runs
    prefetch_gate: tokio::sync::Mutex<()>,
    prefetch_epoch: AtomicU64,
    /// Id of the table results are cached for, written under `results`
    active_lut: AtomicU64,
    counters: PipelineCounters,
}

impl PipelineInner {
    /// Make `lut` the table results are cached for
    ///
    /// A different table drops every cached result and outdates queued prefetches.
    fn activate_lut(&self, lut: &ColorLut) {
        let mut results = self.results.lock();
        if self.active_lut.swap(lut.id(), Ordering::SeqCst) == lut.id() {
            return;
        }
        if !results.is_empty() {
            log::debug!("Color table changed, dropping {} cached slices", results.len());
        }
        results.invalidate();
        self.prefetch_epoch.fetch_add(1, Ordering::SeqCst);
    }

    fn is_active_lut(&self, lut_id: u64) -> bool {
        self.active_lut.load(Ordering::SeqCst) == lut_id
    }

    async fn get_or_compute(
        self: &Arc<Self>,
        key: SliceKey,
        lut: Arc<ColorLut>,
        value_range: (f32, f32),
    ) -> EngineResult<Arc<ColoredSlice>> {
        let pending = {
            let results = self.results.lock();
            if let Some(hit) = results.get(&key, lut.id()) {
                self.counters.result_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(hit);
            }

            let mut pending = self.pending.lock();
            pending
                .entry((key, lut.id()))
                .or_insert_with(|| self.spawn_compute(key, lut, value_range))
                .clone()
        };
        pending.await
    }

    fn spawn_compute(self: &Arc<Self>, key: SliceKey, lut: Arc<ColorLut>, value_range: (f32, f32)) -> PendingSlice {
        let inner = self.clone();
        let lut_id = lut.id();
        let handle = tokio::spawn(self.clone().compute(key, lut, value_range));
        async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => {
                    inner.pending.lock().remove(&(key, lut_id));
                    Err(EngineError::pipeline(format!("slice task for {} failed: {}", key, e)))
                }
            }
        }
        .boxed()
        .shared()
    }

    async fn compute(
        self: Arc<Self>,
        key: SliceKey,
        lut: Arc<ColorLut>,
        value_range: (f32, f32),
    ) -> EngineResult<Arc<ColoredSlice>> {
        let lut_id = lut.id();
        let result = match self
            .cache
            .bricks_for_slice(key.slice_type, key.index, key.level)
            .await
        {
            Ok(bricks) => self.run_job(key, bricks, lut, value_range).await,
            Err(e) => Err(e),
        };

        let mut results = self.results.lock();
        let mut pending = self.pending.lock();
        pending.remove(&(key, lut_id));
        if let Ok(slice) = &result {
            self.counters.computed.fetch_add(1, Ordering::Relaxed);
            // A newer table may have taken over while this one was in flight
            if self.is_active_lut(lut_id) {
                results.insert_for_lut(lut_id, key, slice.clone());
            }
        }
        result
    }

    async fn run_job(
        &self,
        key: SliceKey,
        bricks: Vec<Arc<Brick>>,
        lut: Arc<ColorLut>,
        value_range: (f32, f32),
    ) -> EngineResult<Arc<ColoredSlice>> {
        let level = self.cache.manifest().level(key.level)?.clone();
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(request_id, tx);

        let job = StitchJob {
            request_id,
            key,
            level,
            bricks,
            lut,
            value_range,
        };
        if self.requests.send(WorkerRequest::Stitch(job)).is_err() {
            self.waiters.lock().remove(&request_id);
            return Err(EngineError::pipeline("slice worker is not running"));
        }

        let slice = rx
            .await
            .map_err(|_| EngineError::pipeline(format!("slice worker dropped request for {}", key)))??;
        Ok(Arc::new(slice))
    }

    fn schedule_prefetch(&self, key: SliceKey, lut: &Arc<ColorLut>, value_range: (f32, f32)) {
        let radius = self.config.prefetch_radius;
        if radius == 0 || !self.is_active_lut(lut.id()) {
            return;
        }
        let epoch = self.prefetch_epoch.load(Ordering::SeqCst);
        let extent = match self.cache.manifest().level(key.level) {
            Ok(level) => level.dimensions[key.slice_type.axis()],
            Err(_) => return,
        };

        let low = key.index.saturating_sub(radius);
        let high = (key.index + radius).min(extent.saturating_sub(1));
        let results = self.results.lock();
        let pending = self.pending.lock();
        for index in (low..=high).filter(|&i| i != key.index) {
            let neighbor = SliceKey::new(key.slice_type, index, key.level);
            if results.contains(&neighbor, lut.id()) || pending.contains_key(&(neighbor, lut.id())) {
                continue;
            }
            let job = PrefetchJob {
                key: neighbor,
                lut: lut.clone(),
                value_range,
                epoch,
            };
            if self.prefetch_tx.send(job).is_ok() {
                self.counters.prefetch_issued.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Drain prefetch requests one at a time
async fn prefetch_loop(inner: Weak<PipelineInner>, mut jobs: mpsc::UnboundedReceiver<PrefetchJob>) {
    while let Some(job) = jobs.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let _running = inner.prefetch_gate.lock().await;
        let lut_id = job.lut.id();
        if job.epoch != inner.prefetch_epoch.load(Ordering::SeqCst) || !inner.is_active_lut(lut_id) {
            log::debug!("Skipping outdated prefetch of {}", job.key);
            continue;
        }
        let already_done = inner.results.lock().contains(&job.key, lut_id)
            || inner.pending.lock().contains_key(&(job.key, lut_id));
        if already_done {
            continue;
        }
        if let Err(e) = inner.get_or_compute(job.key, job.lut, job.value_range).await {
            inner.counters.prefetch_failed.fetch_add(1, Ordering::Relaxed);
            log::warn!("Prefetch of {} failed: {}", job.key, e);
        }
    }
    log::debug!("Prefetch loop stopped");
}

/// Route validated worker responses to whoever is waiting on them
async fn dispatch_responses(waiters: Waiters, mut responses: mpsc::UnboundedReceiver<WorkerResponse>) {
    while let Some(response) = responses.recv().await {
        let Some(request_id) = response.request_id() else {
            log::warn!("Slice worker sent an unexpected Ready");
            continue;
        };
        let Some(waiter) = waiters.lock().remove(&request_id) else {
            log::warn!("Dropping response for unknown request {}", request_id);
            continue;
        };
        let result = match response.validate() {
            Err(e) => Err(e),
            Ok(()) => match response {
                WorkerResponse::Slice { slice, .. } => Ok(slice),
                WorkerResponse::Failed { error, .. } => Err(error),
                WorkerResponse::Ready => continue,
            },
        };
        // The caller may have gone away
        let _ = waiter.send(result);
    }
    // Worker gone: fail everyone still waiting
    waiters.lock().clear();
}

/// Handle to a running slice pipeline
pub struct SlicePipeline {
    inner: Arc<PipelineInner>,
}

impl SlicePipeline {
    /// Start the worker and wait for its readiness handshake
    pub async fn start(cache: BrickCache, config: PipelineConfig) -> EngineResult<Self> {
        let (request_tx, request_rx) = crossbeam_channel::unbounded();
        let (response_tx, mut response_rx) = mpsc::unbounded_channel();
        spawn_worker(request_rx, response_tx)?;

        match response_rx.recv().await {
            Some(WorkerResponse::Ready) => {}
            Some(other) => {
                return Err(EngineError::pipeline(format!(
                    "expected Ready from slice worker, got {:?}",
                    other.request_id()
                )))
            }
            None => return Err(EngineError::pipeline("slice worker exited before becoming ready")),
        }

        let waiters: Waiters = Arc::new(Mutex::new(FxHashMap::default()));
        tokio::spawn(dispatch_responses(waiters.clone(), response_rx));

        let (prefetch_tx, prefetch_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(PipelineInner {
            cache,
            results: Mutex::new(SliceResultCache::new(config.result_cache_capacity)),
            config,
            requests: request_tx,
            waiters,
            next_request_id: AtomicU64::new(1),
            pending: Mutex::new(FxHashMap::default()),
            prefetch_tx,
            prefetch_gate: tokio::sync::Mutex::new(()),
            prefetch_epoch: AtomicU64::new(0),
            active_lut: AtomicU64::new(NO_ACTIVE_LUT),
            counters: PipelineCounters::default(),
        });
        tokio::spawn(prefetch_loop(Arc::downgrade(&inner), prefetch_rx));

        log::info!(
            "Slice pipeline ready (result cache {}, prefetch radius {})",
            inner.config.result_cache_capacity,
            inner.config.prefetch_radius
        );
        Ok(Self { inner })
    }

    /// Stitch and color-map a slice, then prefetch its neighbors
    ///
    /// `lut` becomes the active color table.
    pub async fn request_slice(
        &self,
        slice_type: SliceType,
        index: usize,
        level: u32,
        lut: &Arc<ColorLut>,
        value_range: (f32, f32),
    ) -> EngineResult<Arc<ColoredSlice>> {
        self.inner.counters.requests.fetch_add(1, Ordering::Relaxed);
        let key = SliceKey::new(slice_type, index, level);
        self.inner.activate_lut(lut);
        let slice = self.inner.get_or_compute(key, lut.clone(), value_range).await?;
        self.inner.schedule_prefetch(key, lut, value_range);
        Ok(slice)
    }

    /// Whether a slice made with `lut` is in the result cache
    pub fn is_cached(&self, key: &SliceKey, lut: &ColorLut) -> bool {
        self.inner.results.lock().contains(key, lut.id())
    }

    /// Switch the active color table ahead of the next request
    pub fn set_active_colormap(&self, lut: &ColorLut) {
        self.inner.activate_lut(lut);
    }

    pub fn invalidate_results(&self) {
        self.inner.results.lock().invalidate();
    }

    /// Drop every queued prefetch and wait for the one in flight, if any, to finish
    pub async fn cancel_prefetch(&self) {
        self.inner.prefetch_epoch.fetch_add(1, Ordering::SeqCst);
        let _idle = self.inner.prefetch_gate.lock().await;
    }

    pub fn cache(&self) -> &BrickCache {
        &self.inner.cache
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> PipelineStats {
        let cached_results = self.inner.results.lock().len();
        let pending = self.inner.pending.lock().len();
        let counters = &self.inner.counters;
        PipelineStats {
            requests: counters.requests.load(Ordering::Relaxed),
            result_hits: counters.result_hits.load(Ordering::Relaxed),
            computed: counters.computed.load(Ordering::Relaxed),
            prefetch_issued: counters.prefetch_issued.load(Ordering::Relaxed),
            prefetch_failed: counters.prefetch_failed.load(Ordering::Relaxed),
            cached_results,
            pending,
        }
    }
}

impl Drop for SlicePipeline {
    fn drop(&mut self) {
        let _ = self.inner.requests.send(WorkerRequest::Shutdown);
    }
}
