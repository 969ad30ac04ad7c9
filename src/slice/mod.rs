// Slice model: 2D cross-sections stitched from bricks
// Pure functions only, shared by the brick cache and the off-thread pipeline

pub mod slice;
pub mod stitch;
pub mod colormap;

pub use slice::{SliceType, SliceKey, SliceData, ColoredSlice};
pub use stitch::{intersecting_bricks, slice_extent, stitch_slice};
pub use colormap::{ColorLut, LUT_SIZE, apply_colormap, color_index, colorize};
