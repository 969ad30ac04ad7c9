//! Viewer configuration
//!
//! Loaded from TOML. Every section is optional and falls back to its `Default`.
//!
//! ```toml
//! base_path = "public/data/bricks"
//! level_change = "latest_wins"
//!
//! [cache]
//! max_bricks = 500
//! max_memory_mb = 512
//! evict_on_level_change = true
//!
//! [pipeline]
//! enabled = true
//! result_cache_capacity = 32
//! prefetch_radius = 2
//! ```

use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};
use crate::error::{EngineError, EngineResult};

/// Brick cache limits and level-switch policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of resident bricks
    pub max_bricks: usize,
    /// Maximum resident payload memory in MiB
    pub max_memory_mb: usize,
    /// Evict every other level before loading a new one
    pub evict_on_level_change: bool,
    /// Maximum concurrent brick fetches for bulk loads and slice assembly
    pub fetch_concurrency: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_bricks: 500,
            max_memory_mb: 512,
            evict_on_level_change: false,
            fetch_concurrency: (num_cpus::get() * 2).clamp(4, 32),
        }
    }
}

impl CacheConfig {
    /// Memory limit in bytes
    pub fn max_memory_bytes(&self) -> usize {
        self.max_memory_mb.saturating_mul(1024 * 1024)
    }
}

/// Off-thread slice pipeline settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub enabled: bool,
    /// Capacity of the FIFO cache of finished color slices
    pub result_cache_capacity: usize,
    /// Neighbor indices prefetched on each side of a satisfied request
    pub prefetch_radius: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            result_cache_capacity: 32,
            prefetch_radius: 2,
        }
    }
}

/// What happens to a level change requested while another one is loading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LevelChangePolicy {
    /// The newest request supersedes the in-flight load
    #[default]
    LatestWins,
    /// Requests arriving mid-load are dropped
    DropWhileLoading,
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    /// Directory holding `manifest.json` and the `level_N/` brick folders
    pub base_path: PathBuf,
    pub cache: CacheConfig,
    pub pipeline: PipelineConfig,
    pub level_change: LevelChangePolicy,
    /// Amplitude range mapped onto the color table
    pub value_range: [f32; 2],
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("data/bricks"),
            cache: CacheConfig::default(),
            pipeline: PipelineConfig::default(),
            level_change: LevelChangePolicy::default(),
            value_range: [-1.0, 1.0],
        }
    }
}

impl ViewerConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(source: &str) -> EngineResult<Self> {
        let config: ViewerConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| {
            EngineError::config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml_str(&source)?;
        log::info!("Loaded viewer config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.cache.max_bricks == 0 {
            return Err(EngineError::config("cache.max_bricks must be greater than 0"));
        }
        if self.cache.max_memory_mb == 0 {
            return Err(EngineError::config("cache.max_memory_mb must be greater than 0"));
        }
        if self.cache.fetch_concurrency == 0 {
            return Err(EngineError::config("cache.fetch_concurrency must be greater than 0"));
        }
        if self.pipeline.result_cache_capacity == 0 {
            return Err(EngineError::config(
                "pipeline.result_cache_capacity must be greater than 0",
            ));
        }
        let [low, high] = self.value_range;
        if !(low.is_finite() && high.is_finite() && low < high) {
            return Err(EngineError::config(format!(
                "value_range must be finite and increasing, got [{}, {}]",
                low, high
            )));
        }
        Ok(())
    }

    pub fn value_range(&self) -> (f32, f32) {
        (self.value_range[0], self.value_range[1])
    }
}
