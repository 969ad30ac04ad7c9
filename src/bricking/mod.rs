// Offline dataset preparation: raw volume in, bricked multi-resolution layout out

pub mod volume;
pub mod dataset;

pub use volume::{RawVolume, VOLUME_HEADER_BYTES};
pub use dataset::{BrickedDataset, MANIFEST_VERSION};
