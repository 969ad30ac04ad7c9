/// Slice stitching
///
/// A slice at `index` along one axis intersects exactly one layer of bricks:
/// `brick = index / brick_size`, `local = index % brick_size` on that axis. Each
/// brick in the layer contributes its valid sub-plane at global coordinates;
/// samples past a truncated brick's `actual_size` stay at 0.0.

use std::sync::Arc;
use crate::error::{EngineError, EngineResult};
use crate::manifest::LevelDescriptor;
use crate::slice::{SliceData, SliceKey, SliceType};
use crate::streaming::{Brick, BrickKey};

/// Output (width, height) for a slice type at a level
pub fn slice_extent(level: &LevelDescriptor, slice_type: SliceType) -> (usize, usize) {
    let (cols, rows) = slice_type.plane_axes();
    (level.dimensions[cols], level.dimensions[rows])
}

fn check_index(level: &LevelDescriptor, slice_type: SliceType, index: usize) -> EngineResult<()> {
    let extent = level.dimensions[slice_type.axis()];
    if index >= extent {
        return Err(EngineError::SliceOutOfRange {
            axis: slice_type.name(),
            index,
            extent,
        });
    }
    Ok(())
}

/// Keys of every brick intersecting the slice, in nested `(x, y, z)` order
pub fn intersecting_bricks(
    level: &LevelDescriptor,
    slice_type: SliceType,
    index: usize,
) -> EngineResult<Vec<BrickKey>> {
    check_index(level, slice_type, index)?;

    let axis = slice_type.axis();
    let (cols, rows) = slice_type.plane_axes();
    let layer = index / level.brick_size[axis];

    let mut keys = Vec::with_capacity(level.num_bricks[cols] * level.num_bricks[rows]);
    for a in 0..level.num_bricks[cols] {
        for b in 0..level.num_bricks[rows] {
            let mut grid = [0usize; 3];
            grid[axis] = layer;
            grid[cols] = a;
            grid[rows] = b;
            keys.push(BrickKey::new(
                level.level,
                grid[0] as u32,
                grid[1] as u32,
                grid[2] as u32,
            ));
        }
    }
    Ok(keys)
}

/// Assemble a slice from the bricks that intersect it
///
/// Bricks from another level or another layer are ignored. Deterministic: the
/// same bricks always produce bit-identical output.
pub fn stitch_slice(
    level: &LevelDescriptor,
    slice_type: SliceType,
    index: usize,
    bricks: &[Arc<Brick>],
) -> EngineResult<SliceData> {
    check_index(level, slice_type, index)?;

    let axis = slice_type.axis();
    let (cols, rows) = slice_type.plane_axes();
    let brick_size = level.brick_size;
    let layer = index / brick_size[axis];
    let local = index % brick_size[axis];
    let (width, height) = slice_extent(level, slice_type);

    let mut samples = vec![0.0f32; width * height];

    for brick in bricks {
        let key = brick.key();
        let grid = key.grid_index();
        if key.level != level.level || grid[axis] != layer {
            continue;
        }

        let actual = brick.actual_size();
        if local >= actual[axis] {
            continue;
        }

        let payload = brick.samples();
        for lc in 0..actual[cols] {
            let col = grid[cols] * brick_size[cols] + lc;
            if col >= width {
                break;
            }
            for lr in 0..actual[rows] {
                let row = grid[rows] * brick_size[rows] + lr;
                if row >= height {
                    break;
                }
                let mut offset = [0usize; 3];
                offset[axis] = local;
                offset[cols] = lc;
                offset[rows] = lr;
                samples[row * width + col] = payload[brick.index(offset[0], offset[1], offset[2])];
            }
        }
    }

    Ok(SliceData {
        key: SliceKey::new(slice_type, index, level.level),
        width,
        height,
        samples,
    })
}
