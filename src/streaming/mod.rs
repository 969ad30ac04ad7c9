// Brick streaming: codec, transport and the multi-resolution cache
// Bricks are immutable once decoded and shared as Arc<Brick>

pub mod error;
pub mod brick;
pub mod brick_source;
pub mod brick_cache;

pub use brick::{Brick, BrickKey, BRICK_HEADER_BYTES};
pub use brick_source::{BrickSource, FileSource, MemorySource};
pub use brick_cache::{BrickCache, CacheStats};
