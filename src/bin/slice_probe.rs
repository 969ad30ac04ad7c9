use std::sync::Arc;
use std::time::Instant;
use anyhow::Context;
use seismic_engine::{LevelChange, ProgressiveController, ViewerConfig};

/// Load a bricked dataset, refine to full resolution and report timings.
///
/// usage: slice_probe [config.toml | dataset_dir]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = match std::env::args().nth(1) {
        Some(arg) if arg.ends_with(".toml") => ViewerConfig::load(&arg).context("loading config")?,
        Some(dir) => ViewerConfig {
            base_path: dir.into(),
            ..ViewerConfig::default()
        },
        None => ViewerConfig::default(),
    };

    println!("Seismic Engine - Slice Probe");
    println!("============================");
    println!("Dataset: {}", config.base_path.display());

    let controller = Arc::new(ProgressiveController::from_config(config)?);
    controller.on_loading_state(|event| {
        println!("  [{:?}] level {}", event.phase, event.level);
    });

    let start = Instant::now();
    let dimensions = controller.initialize().await.context("initializing")?;
    println!(
        "Volume {:?}, {} levels, initialized in {:?}",
        dimensions,
        controller.num_levels(),
        start.elapsed()
    );

    let slices = controller
        .update_slices(dimensions[0] / 2, dimensions[1] / 2, dimensions[2] / 2, 1.0)
        .await?;
    println!(
        "Coarse slices at level {}: inline {}x{}, crossline {}x{}, time {}x{}",
        slices.level,
        slices.inline.width,
        slices.inline.height,
        slices.crossline.width,
        slices.crossline.height,
        slices.time.width,
        slices.time.height
    );

    let start = Instant::now();
    match controller.refine_to_level(0).await? {
        LevelChange::Applied { level, slices } => println!(
            "Refined to level {} in {:?} (inline {}x{})",
            level,
            start.elapsed(),
            slices.inline.width,
            slices.inline.height
        ),
        other => println!("Refinement did not apply: {:?}", other.level()),
    }

    if let Some(cache) = controller.cache() {
        let stats = cache.stats();
        println!(
            "Cache: {} bricks, {:.1} MB, {} hits, {} misses, {} deduplicated, {} evictions",
            stats.resident_bricks,
            stats.memory_bytes as f64 / (1024.0 * 1024.0),
            stats.hits,
            stats.misses,
            stats.deduplicated,
            stats.evictions
        );
    }
    if let Some(stats) = controller.pipeline_stats() {
        println!(
            "Pipeline: {} requests, {} computed, {} result hits, {} prefetches ({} failed)",
            stats.requests, stats.computed, stats.result_hits, stats.prefetch_issued, stats.prefetch_failed
        );
    }
    Ok(())
}
