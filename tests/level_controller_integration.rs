use seismic_engine::bricking::{BrickedDataset, RawVolume};
use seismic_engine::slice::ColorLut;
use seismic_engine::streaming::{BrickCache, BrickKey, MemorySource};
use seismic_engine::{
    CacheConfig, EngineError, LevelChange, LevelChangePolicy, LoadState, LoadingEvent, LoadingPhase,
    ProgressiveController, ViewerConfig,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// 16^3 volume in 4^3 bricks: levels of 16^3, 8^3 and 4^3 samples
fn dataset() -> BrickedDataset {
    let _ = env_logger::builder().is_test(true).try_init();
    let volume = RawVolume::from_fn([16, 16, 16], |x, y, z| {
        ((x + y + z) as f32 / 45.0) * 2.0 - 1.0
    });
    BrickedDataset::build(&volume, [4, 4, 4], 3).expect("dataset")
}

fn config(evict: bool, pipeline: bool, policy: LevelChangePolicy) -> ViewerConfig {
    let mut config = ViewerConfig::default();
    config.cache.evict_on_level_change = evict;
    config.pipeline.enabled = pipeline;
    config.level_change = policy;
    config
}

fn controller(source: Arc<MemorySource>, config: ViewerConfig) -> Arc<ProgressiveController> {
    Arc::new(ProgressiveController::new(source, config).expect("controller"))
}

fn record_events(controller: &ProgressiveController) -> Arc<Mutex<Vec<LoadingEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    controller.on_loading_state(move |event| sink.lock().push(event.clone()));
    events
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_initialize_loads_coarsest_level() {
    let source = Arc::new(dataset().to_memory_source().expect("source"));
    let controller = controller(source.clone(), config(false, true, LevelChangePolicy::LatestWins));
    let events = record_events(&controller);

    assert_eq!(controller.load_state(), LoadState::Idle);
    let dimensions = controller.initialize().await.expect("initialize");

    assert_eq!(dimensions, [16, 16, 16]);
    assert_eq!(controller.num_levels(), 3);
    assert_eq!(controller.current_level(), Some(2));
    assert_eq!(controller.load_state(), LoadState::Ready(2));
    assert_eq!(controller.position(), [8, 8, 8]);

    let phases: Vec<_> = events.lock().iter().map(|e| (e.phase, e.level)).collect();
    assert_eq!(phases, vec![(LoadingPhase::Loading, 2), (LoadingPhase::Ready, 2)]);

    let cache = controller.cache().expect("cache");
    assert_eq!(cache.resident_keys(), vec![BrickKey::new(2, 0, 0, 0)]);
}

#[tokio::test]
async fn test_requires_initialize() {
    let source = Arc::new(dataset().to_memory_source().expect("source"));
    let controller = controller(source, config(false, false, LevelChangePolicy::LatestWins));

    assert_eq!(controller.set_level(0).await.unwrap_err(), EngineError::NotInitialized);
    assert!(matches!(
        controller.update_slices(0, 0, 0, 1.0).await,
        Err(EngineError::NotInitialized)
    ));
    assert_eq!(controller.num_levels(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_set_level_with_eviction_keeps_only_target_level() {
    let source = Arc::new(dataset().to_memory_source().expect("source"));
    let controller = controller(source, config(true, true, LevelChangePolicy::LatestWins));
    controller.initialize().await.expect("initialize");

    let change = controller.set_level(0).await.expect("set level");
    let LevelChange::Applied { level, slices } = change else {
        panic!("expected the level change to apply");
    };
    assert_eq!(level, 0);
    assert_eq!(slices.level, 0);
    assert_eq!(slices.position, [8, 8, 8]);
    assert_eq!((slices.inline.width, slices.inline.height), (16, 16));
    assert_eq!(controller.load_state(), LoadState::Ready(0));

    let cache = controller.cache().expect("cache");
    let resident = cache.resident_keys();
    assert_eq!(resident.len(), 64);
    assert!(resident.iter().all(|key| key.level == 0));
}

#[tokio::test]
async fn test_set_level_clamps_and_reports_unchanged() {
    let source = Arc::new(dataset().to_memory_source().expect("source"));
    let controller = controller(source, config(false, false, LevelChangePolicy::LatestWins));
    controller.initialize().await.expect("initialize");

    assert!(matches!(
        controller.set_level(9).await.expect("set level"),
        LevelChange::Unchanged(2)
    ));

    let change = controller.set_level(1).await.expect("set level");
    assert_eq!(change.level(), Some(1));
    assert!(change.is_applied());
}

#[tokio::test]
async fn test_refine_steps_through_every_level() {
    let source = Arc::new(dataset().to_memory_source().expect("source"));
    let controller = controller(source, config(false, false, LevelChangePolicy::LatestWins));
    controller.initialize().await.expect("initialize");

    let events = record_events(&controller);
    let rendered = Arc::new(Mutex::new(Vec::new()));
    let sink = rendered.clone();
    controller.on_slices(move |slices| sink.lock().push(slices.level));

    let change = controller.refine_to_level(0).await.expect("refine");
    assert_eq!(change.level(), Some(0));
    assert_eq!(controller.load_state(), LoadState::Ready(0));

    assert_eq!(*rendered.lock(), vec![1, 0]);
    let phases: Vec<_> = events.lock().iter().map(|e| (e.phase, e.level)).collect();
    assert_eq!(
        phases,
        vec![
            (LoadingPhase::Refining, 1),
            (LoadingPhase::Refining, 0),
            (LoadingPhase::Ready, 0)
        ]
    );
}

#[tokio::test]
async fn test_refine_to_coarser_level_is_a_direct_jump() {
    let source = Arc::new(dataset().to_memory_source().expect("source"));
    let controller = controller(source, config(false, false, LevelChangePolicy::LatestWins));
    controller.initialize().await.expect("initialize");
    controller.set_level(0).await.expect("level 0");

    let rendered = Arc::new(Mutex::new(Vec::new()));
    let sink = rendered.clone();
    controller.on_slices(move |slices| sink.lock().push(slices.level));

    let change = controller.refine_to_level(2).await.expect("refine");
    assert_eq!(change.level(), Some(2));
    assert_eq!(*rendered.lock(), vec![2]);
}

#[tokio::test]
async fn test_update_slices_maps_position_into_level_space() {
    let source = Arc::new(dataset().to_memory_source().expect("source"));
    let controller = controller(source, config(false, false, LevelChangePolicy::LatestWins));
    controller.initialize().await.expect("initialize");
    controller.set_level(1).await.expect("level 1");

    let slices = controller.update_slices(9, 4, 99, 0.25).await.expect("slices");
    // Time index 99 is clamped to 15 before mapping
    assert_eq!(slices.position, [4, 2, 7]);
    assert_eq!(slices.opacity, 0.25);
    assert_eq!((slices.time.width, slices.time.height), (8, 8));
    assert_eq!(controller.position(), [9, 4, 15]);
}

#[tokio::test]
async fn test_colormap_is_applied() {
    let source = Arc::new(dataset().to_memory_source().expect("source"));
    let controller = controller(source, config(false, true, LevelChangePolicy::LatestWins));
    controller.initialize().await.expect("initialize");

    let red = ColorLut::from_rgb(vec![[255, 0, 0]; 256]).expect("lut");
    controller.set_colormap(red);
    let slices = controller.update_slices(0, 0, 0, 1.0).await.expect("slices");
    assert_eq!(slices.inline.pixel(0, 0), Some([255, 0, 0, 255]));

    controller.set_colormap(ColorLut::grayscale());
    let slices = controller.update_slices(0, 0, 0, 1.0).await.expect("slices");
    let [r, g, b, a] = slices.inline.pixel(0, 0).expect("pixel");
    assert!(r == g && g == b && a == 255);
}

#[tokio::test]
async fn test_failed_load_restores_previous_state() {
    let source = Arc::new(dataset().to_memory_source().expect("source"));
    let controller = controller(source.clone(), config(false, false, LevelChangePolicy::LatestWins));
    controller.initialize().await.expect("initialize");

    let missing = BrickKey::new(0, 3, 1, 2);
    source.remove(&missing.path());

    let err = controller.set_level(0).await.unwrap_err();
    assert!(matches!(err, EngineError::BrickFetch { key, .. } if key == missing));
    assert_eq!(controller.load_state(), LoadState::Ready(2));
    assert_eq!(controller.current_level(), Some(2));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_latest_level_request_wins() {
    let source = Arc::new(
        dataset()
            .to_memory_source()
            .expect("source")
            .with_latency(Duration::from_millis(10)),
    );
    let mut config = config(false, false, LevelChangePolicy::LatestWins);
    config.cache.fetch_concurrency = 4;
    let controller = controller(source, config);
    controller.initialize().await.expect("initialize");

    let first = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.set_level(0).await })
    };
    tokio::time::sleep(Duration::from_millis(25)).await;
    let second = controller.set_level(1).await.expect("second");
    let first = first.await.expect("join").expect("first");

    assert!(matches!(first, LevelChange::Superseded));
    assert_eq!(second.level(), Some(1));
    assert_eq!(controller.load_state(), LoadState::Ready(1));
    assert_eq!(controller.current_level(), Some(1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_drop_while_loading_ignores_second_request() {
    let source = Arc::new(
        dataset()
            .to_memory_source()
            .expect("source")
            .with_latency(Duration::from_millis(10)),
    );
    let mut config = config(false, false, LevelChangePolicy::DropWhileLoading);
    config.cache.fetch_concurrency = 4;
    let controller = controller(source, config);
    controller.initialize().await.expect("initialize");

    let first = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.set_level(0).await })
    };
    tokio::time::sleep(Duration::from_millis(25)).await;
    let second = controller.set_level(1).await.expect("second");
    let first = first.await.expect("join").expect("first");

    assert!(matches!(second, LevelChange::Dropped));
    assert_eq!(first.level(), Some(0));
    assert_eq!(controller.load_state(), LoadState::Ready(0));
}

#[tokio::test]
async fn test_set_cache_config_applies_to_live_cache() {
    let source = Arc::new(dataset().to_memory_source().expect("source"));
    let controller = controller(source, config(false, false, LevelChangePolicy::LatestWins));
    controller.initialize().await.expect("initialize");
    controller.set_level(1).await.expect("level 1");

    let cache = controller.cache().expect("cache");
    assert_eq!(cache.len(), 1 + 8);

    controller
        .set_cache_config(CacheConfig {
            max_bricks: 4,
            ..controller.cache_config()
        })
        .expect("valid limits");
    assert_eq!(controller.cache_config().max_bricks, 4);
    assert_eq!(cache.len(), 4);

    let err = controller
        .set_cache_config(CacheConfig {
            max_bricks: 0,
            ..CacheConfig::default()
        })
        .unwrap_err();
    assert!(matches!(err, EngineError::Config { .. }));
    assert_eq!(controller.cache_config().max_bricks, 4);
}

#[tokio::test]
async fn test_from_config_reads_dataset_directory() {
    let dir = tempfile::tempdir().expect("tempdir");
    dataset().write_to_dir(dir.path()).expect("write");

    let mut viewer = config(false, false, LevelChangePolicy::LatestWins);
    viewer.base_path = dir.path().to_path_buf();
    let controller = ProgressiveController::from_config(viewer).expect("controller");

    assert_eq!(controller.initialize().await.expect("initialize"), [16, 16, 16]);
    let slices = controller.update_slices(8, 8, 8, 1.0).await.expect("slices");
    assert_eq!(slices.level, 2);
    assert_eq!(slices.position, [2, 2, 2]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_level_switch_drops_prefetches_of_old_level() {
    let source = Arc::new(
        dataset()
            .to_memory_source()
            .expect("source")
            .with_latency(Duration::from_millis(20)),
    );
    let controller = controller(source, config(true, true, LevelChangePolicy::LatestWins));
    controller.initialize().await.expect("initialize");

    // Rendering at level 1 queues neighbor prefetches for level 1
    controller.set_level(1).await.expect("level 1");
    assert!(controller.pipeline_stats().expect("pipeline").prefetch_issued > 0);

    let change = controller.set_level(0).await.expect("level 0");
    assert_eq!(change.level(), Some(0));

    let cache = controller.cache().expect("cache");
    let stray = |cache: &BrickCache| {
        cache
            .resident_keys()
            .into_iter()
            .filter(|key| key.level != 0)
            .collect::<Vec<_>>()
    };
    assert_eq!(stray(&cache), vec![]);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(stray(&cache), vec![]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_level_change_waits_for_initialize() {
    let source = Arc::new(
        dataset()
            .to_memory_source()
            .expect("source")
            .with_latency(Duration::from_millis(30)),
    );
    let controller = controller(source, config(false, false, LevelChangePolicy::LatestWins));
    let events = record_events(&controller);

    let init = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.initialize().await })
    };
    for _ in 0..500 {
        if controller.load_state() == LoadState::LoadingLevel(2) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert_eq!(controller.load_state(), LoadState::LoadingLevel(2));

    let change = controller.set_level(0).await.expect("set level");
    init.await.expect("join").expect("initialize");

    assert_eq!(change.level(), Some(0));
    assert_eq!(controller.load_state(), LoadState::Ready(0));
    let phases: Vec<_> = events.lock().iter().map(|e| (e.phase, e.level)).collect();
    assert_eq!(
        phases,
        vec![
            (LoadingPhase::Loading, 2),
            (LoadingPhase::Ready, 2),
            (LoadingPhase::Loading, 0),
            (LoadingPhase::Ready, 0)
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_level_change_during_initialize_is_dropped() {
    let source = Arc::new(
        dataset()
            .to_memory_source()
            .expect("source")
            .with_latency(Duration::from_millis(30)),
    );
    let controller = controller(source, config(false, false, LevelChangePolicy::DropWhileLoading));

    let init = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.initialize().await })
    };
    for _ in 0..500 {
        if controller.load_state() == LoadState::LoadingLevel(2) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let change = controller.set_level(0).await.expect("set level");
    assert!(matches!(change, LevelChange::Dropped));
    init.await.expect("join").expect("initialize");
    assert_eq!(controller.load_state(), LoadState::Ready(2));
}
