/// Progressive level controller
///
/// Owns the current level, slice position and color table, and orchestrates
/// level transitions on top of the brick cache: evict (optionally), load every
/// brick of the target level, then re-render the three orthogonal slices.
///
/// Loads are serialized. Under `LatestWins` every request bumps a generation
/// counter; a load checks it after each brick completes and before emitting
/// slices, and bows out as soon as a newer request exists. Under
/// `DropWhileLoading` a request arriving mid-load is ignored.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use crate::config::{CacheConfig, LevelChangePolicy, ViewerConfig};
use crate::controller::state::{
    LevelChange, LoadState, LoadingCallback, LoadingEvent, LoadingPhase, SliceSet, SlicesCallback,
};
use crate::error::{EngineError, EngineResult};
use crate::manifest::{clamp_to_dimensions, original_to_level_coords, Manifest};
use crate::pipeline::{PipelineStats, SlicePipeline};
use crate::slice::{colorize, ColorLut, ColoredSlice, SliceType};
use crate::streaming::{BrickCache, BrickSource, FileSource};

/// Per-dataset objects created by `initialize`
struct Session {
    manifest: Arc<Manifest>,
    cache: BrickCache,
    pipeline: Option<SlicePipeline>,
}

struct ViewState {
    load_state: LoadState,
    /// Last level that finished loading
    current_level: Option<u32>,
    /// Slice position in original (level 0) coordinates
    position: [usize; 3],
    opacity: f32,
}

/// Clears the loading flag when a `DropWhileLoading` load ends
struct LoadingFlag<'a>(&'a AtomicBool);

impl Drop for LoadingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Permission to run a load
enum LoadTicket<'a> {
    Latest {
        generation: u64,
        _lock: tokio::sync::MutexGuard<'a, ()>,
    },
    Exclusive {
        _flag: LoadingFlag<'a>,
    },
}

pub struct ProgressiveController {
    source: Arc<dyn BrickSource>,
    config: RwLock<ViewerConfig>,
    session: RwLock<Option<Arc<Session>>>,
    view: Mutex<ViewState>,
    lut: RwLock<Arc<ColorLut>>,
    generation: AtomicU64,
    load_lock: tokio::sync::Mutex<()>,
    loading: AtomicBool,
    loading_callbacks: RwLock<Vec<LoadingCallback>>,
    slices_callbacks: RwLock<Vec<SlicesCallback>>,
}

impl ProgressiveController {
    pub fn new(source: Arc<dyn BrickSource>, config: ViewerConfig) -> EngineResult<Self> {
        config.validate()?;
        Ok(Self {
            source,
            config: RwLock::new(config),
            session: RwLock::new(None),
            view: Mutex::new(ViewState {
                load_state: LoadState::Idle,
                current_level: None,
                position: [0; 3],
                opacity: 1.0,
            }),
            lut: RwLock::new(Arc::new(ColorLut::grayscale())),
            generation: AtomicU64::new(0),
            load_lock: tokio::sync::Mutex::new(()),
            loading: AtomicBool::new(false),
            loading_callbacks: RwLock::new(Vec::new()),
            slices_callbacks: RwLock::new(Vec::new()),
        })
    }

    /// Controller reading the dataset from `config.base_path`
    pub fn from_config(config: ViewerConfig) -> EngineResult<Self> {
        let source = Arc::new(FileSource::new(config.base_path.clone()));
        Self::new(source, config)
    }

    /// Load the manifest and the coarsest level; returns the original dimensions
    ///
    /// Holds the load ticket for the whole call, so level changes issued meanwhile
    /// run after it (or are dropped under `DropWhileLoading`).
    pub async fn initialize(&self) -> EngineResult<[usize; 3]> {
        let _ticket = self.acquire_for_initialize().await?;
        let config = self.config.read().clone();
        let manifest = Arc::new(Manifest::load(self.source.as_ref()).await?);
        let cache = BrickCache::new(manifest.clone(), self.source.clone(), config.cache.clone());
        let pipeline = if config.pipeline.enabled {
            Some(SlicePipeline::start(cache.clone(), config.pipeline.clone()).await?)
        } else {
            None
        };

        let session = Arc::new(Session {
            manifest: manifest.clone(),
            cache,
            pipeline,
        });
        *self.session.write() = Some(session.clone());

        let dimensions = manifest.original_dimensions;
        let coarsest = manifest.coarsest_level();
        {
            let mut view = self.view.lock();
            view.position = dimensions.map(|n| n / 2);
            view.current_level = None;
            view.load_state = LoadState::LoadingLevel(coarsest);
        }
        self.emit(LoadingEvent::new(LoadingPhase::Loading, coarsest).with_detail("initial load"));

        if let Err(e) = session.cache.load_level(coarsest).await {
            self.view.lock().load_state = LoadState::Idle;
            return Err(e);
        }

        {
            let mut view = self.view.lock();
            view.current_level = Some(coarsest);
            view.load_state = LoadState::Ready(coarsest);
        }
        self.emit(LoadingEvent::new(LoadingPhase::Ready, coarsest));
        log::info!(
            "Initialized {:?} volume with {} levels, ready at level {}",
            dimensions,
            manifest.num_levels(),
            coarsest
        );
        Ok(dimensions)
    }

    /// Jump straight to `target`, clamped to the available levels
    pub async fn set_level(&self, target: u32) -> EngineResult<LevelChange> {
        let session = self.session()?;
        let target = session.manifest.clamp_level(i64::from(target));

        let ticket = match self.acquire().await {
            Ok(ticket) => ticket,
            Err(change) => return Ok(change),
        };
        if self.load_state() == LoadState::Ready(target) {
            return Ok(LevelChange::Unchanged(target));
        }

        log::info!("Switching to level {}", target);
        match self.load_and_render(&session, target, &ticket, LoadingPhase::Loading).await? {
            Some(slices) => {
                self.emit(LoadingEvent::new(LoadingPhase::Ready, target));
                Ok(LevelChange::Applied {
                    level: target,
                    slices,
                })
            }
            None => Ok(LevelChange::Superseded),
        }
    }

    /// Step from the current level down to `target`, rendering every step
    ///
    /// A target that is not finer than the current level is a plain `set_level`.
    pub async fn refine_to_level(&self, target: u32) -> EngineResult<LevelChange> {
        let session = self.session()?;
        let target = session.manifest.clamp_level(i64::from(target));
        let current = self.current_level().ok_or(EngineError::NotInitialized)?;
        if target >= current {
            return self.set_level(target).await;
        }

        let ticket = match self.acquire().await {
            Ok(ticket) => ticket,
            Err(change) => return Ok(change),
        };
        // Another load may have moved the level while this one waited
        let current = self.current_level().ok_or(EngineError::NotInitialized)?;
        if target >= current {
            drop(ticket);
            return self.set_level(target).await;
        }

        log::info!("Refining from level {} to level {}", current, target);
        let mut last = None;
        for level in (target..current).rev() {
            match self.load_and_render(&session, level, &ticket, LoadingPhase::Refining).await? {
                Some(slices) => last = Some(slices),
                None => return Ok(LevelChange::Superseded),
            }
        }

        let slices = last.ok_or_else(|| EngineError::pipeline("refinement rendered no slices"))?;
        self.emit(LoadingEvent::new(LoadingPhase::Ready, target));
        Ok(LevelChange::Applied {
            level: target,
            slices,
        })
    }

    /// Move the slice position (original coordinates) and re-render at the current level
    pub async fn update_slices(
        &self,
        inline: usize,
        crossline: usize,
        time: usize,
        opacity: f32,
    ) -> EngineResult<SliceSet> {
        let session = self.session()?;
        let level = {
            let mut view = self.view.lock();
            let level = view.current_level.ok_or(EngineError::NotInitialized)?;
            view.position = clamp_to_dimensions(
                [inline, crossline, time],
                session.manifest.original_dimensions,
            );
            view.opacity = if opacity.is_nan() { 1.0 } else { opacity.clamp(0.0, 1.0) };
            level
        };
        self.render_slices(&session, level).await
    }

    /// Replace the color table; cached color slices and queued prefetches are dropped
    pub fn set_colormap(&self, lut: ColorLut) {
        let lut = Arc::new(lut);
        *self.lut.write() = lut.clone();
        if let Ok(session) = self.session() {
            if let Some(pipeline) = &session.pipeline {
                pipeline.set_active_colormap(&lut);
            }
        }
    }

    pub fn colormap(&self) -> Arc<ColorLut> {
        self.lut.read().clone()
    }

    pub fn current_level(&self) -> Option<u32> {
        self.view.lock().current_level
    }

    pub fn num_levels(&self) -> usize {
        self.session
            .read()
            .as_ref()
            .map_or(0, |session| session.manifest.num_levels())
    }

    pub fn load_state(&self) -> LoadState {
        self.view.lock().load_state
    }

    /// Slice position in original coordinates
    pub fn position(&self) -> [usize; 3] {
        self.view.lock().position
    }

    pub fn manifest(&self) -> Option<Arc<Manifest>> {
        self.session.read().as_ref().map(|session| session.manifest.clone())
    }

    pub fn cache(&self) -> Option<BrickCache> {
        self.session.read().as_ref().map(|session| session.cache.clone())
    }

    pub fn pipeline_stats(&self) -> Option<PipelineStats> {
        let session = self.session.read().clone()?;
        session.pipeline.as_ref().map(SlicePipeline::stats)
    }

    pub fn cache_config(&self) -> CacheConfig {
        self.config.read().cache.clone()
    }

    /// Replace the cache limits; applied to a live cache immediately
    pub fn set_cache_config(&self, cache: CacheConfig) -> EngineResult<()> {
        let mut candidate = self.config.read().clone();
        candidate.cache = cache.clone();
        candidate.validate()?;
        *self.config.write() = candidate;

        if let Ok(session) = self.session() {
            session.cache.set_config(cache);
        }
        Ok(())
    }

    pub fn on_loading_state(&self, callback: impl Fn(&LoadingEvent) + Send + Sync + 'static) {
        self.loading_callbacks.write().push(Box::new(callback));
    }

    /// Called with every slice set rendered by a level change, refinement steps included
    pub fn on_slices(&self, callback: impl Fn(&SliceSet) + Send + Sync + 'static) {
        self.slices_callbacks.write().push(Box::new(callback));
    }

    fn session(&self) -> EngineResult<Arc<Session>> {
        self.session.read().clone().ok_or(EngineError::NotInitialized)
    }

    fn emit(&self, event: LoadingEvent) {
        log::debug!("Loading state: {:?} level {}", event.phase, event.level);
        for callback in self.loading_callbacks.read().iter() {
            callback(&event);
        }
    }

    async fn acquire(&self) -> Result<LoadTicket<'_>, LevelChange> {
        let policy = self.config.read().level_change;
        match policy {
            LevelChangePolicy::LatestWins => {
                let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                let lock = self.load_lock.lock().await;
                if self.generation.load(Ordering::SeqCst) != generation {
                    return Err(LevelChange::Superseded);
                }
                Ok(LoadTicket::Latest {
                    generation,
                    _lock: lock,
                })
            }
            LevelChangePolicy::DropWhileLoading => {
                if self.loading.swap(true, Ordering::SeqCst) {
                    log::debug!("Level change dropped, a load is already running");
                    return Err(LevelChange::Dropped);
                }
                Ok(LoadTicket::Exclusive {
                    _flag: LoadingFlag(&self.loading),
                })
            }
        }
    }

    /// Ticket for `initialize`, which is never superseded once it holds the lock
    async fn acquire_for_initialize(&self) -> EngineResult<LoadTicket<'_>> {
        let policy = self.config.read().level_change;
        match policy {
            LevelChangePolicy::LatestWins => {
                // Supersedes loads of a previous session
                let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                let lock = self.load_lock.lock().await;
                Ok(LoadTicket::Latest {
                    generation,
                    _lock: lock,
                })
            }
            LevelChangePolicy::DropWhileLoading => {
                if self.loading.swap(true, Ordering::SeqCst) {
                    return Err(EngineError::LoadInProgress);
                }
                Ok(LoadTicket::Exclusive {
                    _flag: LoadingFlag(&self.loading),
                })
            }
        }
    }

    fn is_current(&self, ticket: &LoadTicket<'_>) -> bool {
        match ticket {
            LoadTicket::Latest { generation, .. } => {
                self.generation.load(Ordering::SeqCst) == *generation
            }
            LoadTicket::Exclusive { .. } => true,
        }
    }

    /// Load one level and render at it; `None` when superseded
    ///
    /// On failure the previous load state is restored.
    async fn load_and_render(
        &self,
        session: &Session,
        level: u32,
        ticket: &LoadTicket<'_>,
        phase: LoadingPhase,
    ) -> EngineResult<Option<SliceSet>> {
        // Neighbors of the old level's slices are no longer wanted
        if let Some(pipeline) = &session.pipeline {
            pipeline.cancel_prefetch().await;
        }
        let evict = self.config.read().cache.evict_on_level_change;
        if evict {
            let evicted = Self::evict_other_levels(session, level);
            log::debug!("Evicted {} bricks from levels other than {}", evicted, level);
        }

        let previous = {
            let mut view = self.view.lock();
            std::mem::replace(&mut view.load_state, LoadState::LoadingLevel(level))
        };
        self.emit(LoadingEvent::new(phase, level));

        match self.load_level_checked(session, level, ticket).await {
            Ok(true) => {}
            Ok(false) => return Ok(None),
            Err(e) => {
                self.view.lock().load_state = previous;
                log::warn!("Loading level {} failed: {}", level, e);
                return Err(e);
            }
        }

        if evict {
            // Stray fetches that finished during the load
            let stray = Self::evict_other_levels(session, level);
            if stray > 0 {
                log::debug!("Evicted {} stray bricks after loading level {}", stray, level);
            }
        }
        {
            let mut view = self.view.lock();
            view.current_level = Some(level);
            view.load_state = LoadState::Ready(level);
        }

        let slices = self.render_slices(session, level).await?;
        if !self.is_current(ticket) {
            return Ok(None);
        }
        for callback in self.slices_callbacks.read().iter() {
            callback(&slices);
        }
        Ok(Some(slices))
    }

    fn evict_other_levels(session: &Session, level: u32) -> usize {
        (0..session.manifest.num_levels() as u32)
            .filter(|&other| other != level)
            .map(|other| session.cache.evict_level(other))
            .sum()
    }

    /// Drive a level load, stopping early once superseded
    async fn load_level_checked(
        &self,
        session: &Session,
        level: u32,
        ticket: &LoadTicket<'_>,
    ) -> EngineResult<bool> {
        let mut bricks = session.cache.fetch_level(level)?;
        let mut loaded = 0usize;
        while let Some(brick) = bricks.next().await {
            brick?;
            loaded += 1;
            if !self.is_current(ticket) {
                log::debug!("Load of level {} superseded after {} bricks", level, loaded);
                return Ok(false);
            }
        }
        log::info!("Loaded {} bricks for level {}", loaded, level);
        Ok(true)
    }

    async fn render_slices(&self, session: &Session, level: u32) -> EngineResult<SliceSet> {
        let dimensions = session.manifest.level_dimensions(level)?;
        let (original, opacity) = {
            let view = self.view.lock();
            (view.position, view.opacity)
        };
        let position = clamp_to_dimensions(original_to_level_coords(original, level), dimensions);
        let lut = self.colormap();
        let value_range = self.config.read().value_range();

        let (inline, crossline, time) = futures::try_join!(
            self.render_one(session, SliceType::Inline, position[0], level, &lut, value_range),
            self.render_one(session, SliceType::Crossline, position[1], level, &lut, value_range),
            self.render_one(session, SliceType::Time, position[2], level, &lut, value_range),
        )?;

        Ok(SliceSet {
            level,
            position,
            opacity,
            inline,
            crossline,
            time,
        })
    }

    async fn render_one(
        &self,
        session: &Session,
        slice_type: SliceType,
        index: usize,
        level: u32,
        lut: &Arc<ColorLut>,
        value_range: (f32, f32),
    ) -> EngineResult<Arc<ColoredSlice>> {
        match &session.pipeline {
            Some(pipeline) => {
                pipeline
                    .request_slice(slice_type, index, level, lut, value_range)
                    .await
            }
            None => {
                let data = session.cache.get_slice(slice_type, index, level).await?;
                Ok(Arc::new(colorize(&data, lut, value_range)))
            }
        }
    }
}
