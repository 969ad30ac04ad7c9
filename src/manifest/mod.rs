// Dataset manifest and coordinate mapping
// Loaded once per dataset session and shared read-only

pub mod manifest;
pub mod coords;

pub use manifest::{Manifest, LevelDescriptor, BrickEntry, MANIFEST_FILE};
pub use coords::{
    original_to_level_coords, brick_for_position, local_offset, clamp_to_dimensions,
};
