use seismic_engine::bricking::{BrickedDataset, RawVolume};
use seismic_engine::slice::{colorize, ColorLut, SliceKey, SliceType};
use seismic_engine::streaming::{BrickCache, BrickKey, MemorySource};
use seismic_engine::{CacheConfig, PipelineConfig, SlicePipeline};
use std::sync::Arc;
use std::time::Duration;

const RANGE: (f32, f32) = (-1.0, 1.0);

fn source_and_cache(latency: Option<Duration>) -> (Arc<MemorySource>, BrickCache) {
    let _ = env_logger::builder().is_test(true).try_init();
    let volume = RawVolume::from_fn([12, 8, 8], |x, y, z| ((x * 7 + y * 3 + z) % 17) as f32 / 8.0 - 1.0);
    let dataset = BrickedDataset::build(&volume, [4, 4, 4], 1).expect("dataset");
    let mut source = dataset.to_memory_source().expect("source");
    if let Some(latency) = latency {
        source = source.with_latency(latency);
    }
    let source = Arc::new(source);
    let cache = BrickCache::new(Arc::new(dataset.manifest), source.clone(), CacheConfig::default());
    (source, cache)
}

async fn start(cache: BrickCache, result_cache_capacity: usize, prefetch_radius: usize) -> SlicePipeline {
    let config = PipelineConfig {
        enabled: true,
        result_cache_capacity,
        prefetch_radius,
    };
    SlicePipeline::start(cache, config).await.expect("pipeline")
}

async fn wait_for(pipeline: &SlicePipeline, done: impl Fn(&SlicePipeline) -> bool) {
    for _ in 0..400 {
        if done(pipeline) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_worker_output_matches_direct_stitching() {
    let (_, cache) = source_and_cache(None);
    let pipeline = start(cache.clone(), 8, 0).await;
    let lut = Arc::new(ColorLut::grayscale());

    for (slice_type, index) in [(SliceType::Inline, 5), (SliceType::Crossline, 7), (SliceType::Time, 0)] {
        let from_worker = pipeline
            .request_slice(slice_type, index, 0, &lut, RANGE)
            .await
            .expect("pipeline slice");
        let direct = colorize(
            &cache.get_slice(slice_type, index, 0).await.expect("slice"),
            &lut,
            RANGE,
        );
        assert_eq!(*from_worker, direct);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_requests_share_one_computation() {
    let (source, cache) = source_and_cache(Some(Duration::from_millis(20)));
    let pipeline = start(cache, 8, 0).await;
    let lut = Arc::new(ColorLut::grayscale());

    let (a, b) = tokio::join!(
        pipeline.request_slice(SliceType::Time, 2, 0, &lut, RANGE),
        pipeline.request_slice(SliceType::Time, 2, 0, &lut, RANGE),
    );
    assert!(Arc::ptr_eq(&a.expect("a"), &b.expect("b")));

    let stats = pipeline.stats();
    assert_eq!(stats.requests, 2);
    assert_eq!(stats.computed, 1);
    // Time index 2 sits in the z = 0 layer: 3 x 2 bricks, each fetched once
    assert_eq!(source.total_fetches(), 6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_result_cache_is_fifo_bounded() {
    let (_, cache) = source_and_cache(None);
    let pipeline = start(cache, 2, 0).await;
    let lut = Arc::new(ColorLut::grayscale());

    for index in 0..3 {
        pipeline
            .request_slice(SliceType::Inline, index, 0, &lut, RANGE)
            .await
            .expect("slice");
    }
    assert!(!pipeline.is_cached(&SliceKey::new(SliceType::Inline, 0, 0), &lut));
    assert!(pipeline.is_cached(&SliceKey::new(SliceType::Inline, 1, 0), &lut));
    assert!(pipeline.is_cached(&SliceKey::new(SliceType::Inline, 2, 0), &lut));
    assert_eq!(pipeline.stats().cached_results, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_new_colormap_invalidates_results() {
    let (_, cache) = source_and_cache(None);
    let pipeline = start(cache, 8, 0).await;
    let gray = Arc::new(ColorLut::grayscale());
    let red = Arc::new(ColorLut::from_rgb(vec![[255, 0, 0]; 256]).expect("lut"));
    let key = SliceKey::new(SliceType::Crossline, 4, 0);

    pipeline.request_slice(SliceType::Crossline, 4, 0, &gray, RANGE).await.expect("gray");
    let colored = pipeline.request_slice(SliceType::Crossline, 4, 0, &red, RANGE).await.expect("red");

    assert_eq!(colored.pixel(0, 0), Some([255, 0, 0, 255]));
    assert!(!pipeline.is_cached(&key, &gray));
    assert!(pipeline.is_cached(&key, &red));
    assert_eq!(pipeline.stats().computed, 2);

    pipeline.invalidate_results();
    assert!(!pipeline.is_cached(&key, &red));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_prefetch_clamps_to_volume_edge() {
    let (_, cache) = source_and_cache(None);
    let pipeline = start(cache, 16, 2).await;
    let lut = Arc::new(ColorLut::grayscale());

    pipeline.request_slice(SliceType::Inline, 11, 0, &lut, RANGE).await.expect("slice");
    assert_eq!(pipeline.stats().prefetch_issued, 2);

    wait_for(&pipeline, |p| p.stats().computed == 3).await;
    for index in [9, 10, 11] {
        assert!(pipeline.is_cached(&SliceKey::new(SliceType::Inline, index, 0), &lut));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_prefetch_skips_cached_neighbors() {
    let (_, cache) = source_and_cache(None);
    let pipeline = start(cache, 16, 1).await;
    let lut = Arc::new(ColorLut::grayscale());

    pipeline.request_slice(SliceType::Time, 4, 0, &lut, RANGE).await.expect("slice");
    wait_for(&pipeline, |p| p.stats().computed == 3).await;
    assert_eq!(pipeline.stats().prefetch_issued, 2);

    // Neighbor 4 is cached already; only 2 is new
    pipeline.request_slice(SliceType::Time, 3, 0, &lut, RANGE).await.expect("slice");
    assert_eq!(pipeline.stats().result_hits, 1);
    assert_eq!(pipeline.stats().prefetch_issued, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_prefetch_failure_is_not_fatal() {
    let (source, cache) = source_and_cache(None);
    // Inline index 4 lives in the brickX = 1 layer
    source.remove(&BrickKey::new(0, 1, 0, 0).path());
    let pipeline = start(cache, 16, 1).await;
    let lut = Arc::new(ColorLut::grayscale());

    pipeline.request_slice(SliceType::Inline, 3, 0, &lut, RANGE).await.expect("foreground slice");
    wait_for(&pipeline, |p| p.stats().prefetch_failed == 1 && p.stats().computed == 2).await;

    let stats = pipeline.stats();
    assert_eq!(stats.prefetch_issued, 2);
    assert_eq!(stats.prefetch_failed, 1);
    assert!(pipeline.is_cached(&SliceKey::new(SliceType::Inline, 2, 0), &lut));
    assert!(!pipeline.is_cached(&SliceKey::new(SliceType::Inline, 4, 0), &lut));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_queued_prefetches_of_old_colormap_are_discarded() {
    let (_, cache) = source_and_cache(Some(Duration::from_millis(40)));
    let pipeline = start(cache, 16, 2).await;
    let old = Arc::new(ColorLut::grayscale());
    let new = Arc::new(ColorLut::from_rgb(vec![[0, 0, 255]; 256]).expect("lut"));

    pipeline.request_slice(SliceType::Inline, 3, 0, &old, RANGE).await.expect("old slice");
    assert_eq!(pipeline.stats().prefetch_issued, 4);
    pipeline.request_slice(SliceType::Time, 0, 0, &new, RANGE).await.expect("new slice");

    let time = |index| SliceKey::new(SliceType::Time, index, 0);
    wait_for(&pipeline, |p| p.is_cached(&time(1), &new) && p.is_cached(&time(2), &new)).await;
    // Let an old prefetch that was already running finish
    tokio::time::sleep(Duration::from_millis(300)).await;

    for index in 0..3 {
        assert!(pipeline.is_cached(&time(index), &new), "time {} not cached", index);
    }
    for index in 1..=5 {
        assert!(!pipeline.is_cached(&SliceKey::new(SliceType::Inline, index, 0), &old));
    }
    assert_eq!(pipeline.stats().cached_results, 3);

    let computed = pipeline.stats().computed;
    let hits = pipeline.stats().result_hits;
    pipeline.request_slice(SliceType::Time, 0, 0, &new, RANGE).await.expect("repeat");
    assert_eq!(pipeline.stats().computed, computed);
    assert_eq!(pipeline.stats().result_hits, hits + 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_set_active_colormap_drops_queued_prefetches() {
    let (_, cache) = source_and_cache(Some(Duration::from_millis(40)));
    let pipeline = start(cache, 16, 2).await;
    let old = Arc::new(ColorLut::grayscale());

    pipeline.request_slice(SliceType::Crossline, 4, 0, &old, RANGE).await.expect("slice");
    pipeline.set_active_colormap(&ColorLut::grayscale());
    assert_eq!(pipeline.stats().cached_results, 0);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(pipeline.stats().cached_results, 0);
    // The foreground slice plus at most the prefetch already running
    assert!(pipeline.stats().computed <= 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_prefetch_stops_queued_work() {
    let (source, cache) = source_and_cache(Some(Duration::from_millis(40)));
    let pipeline = start(cache, 16, 2).await;
    let lut = Arc::new(ColorLut::grayscale());

    pipeline.request_slice(SliceType::Inline, 6, 0, &lut, RANGE).await.expect("slice");
    assert_eq!(pipeline.stats().prefetch_issued, 4);
    pipeline.cancel_prefetch().await;

    let computed = pipeline.stats().computed;
    let fetches = source.total_fetches();
    assert!(computed <= 2);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(pipeline.stats().computed, computed);
    assert_eq!(source.total_fetches(), fetches);
}
