pub mod error;
pub mod config;
pub mod manifest;
pub mod streaming;
pub mod slice;
pub mod pipeline;
pub mod controller;
pub mod bricking;

pub use error::{EngineError, EngineResult};
pub use config::{CacheConfig, LevelChangePolicy, PipelineConfig, ViewerConfig};
pub use manifest::{LevelDescriptor, Manifest};
pub use streaming::{Brick, BrickCache, BrickKey, BrickSource, CacheStats, FileSource, MemorySource};
pub use slice::{ColorLut, ColoredSlice, SliceData, SliceKey, SliceType};
pub use pipeline::{PipelineStats, SlicePipeline};
pub use controller::{LevelChange, LoadState, LoadingEvent, LoadingPhase, ProgressiveController, SliceSet};
pub use bricking::{BrickedDataset, RawVolume};
