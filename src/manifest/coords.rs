/// Coordinate mapping between the original volume, level space and the brick grid
///
/// All functions are pure and operate per axis on `[x, y, z]` triples.

/// Map original (level 0) sample coordinates into `level` space: `floor(c / 2^level)`
pub fn original_to_level_coords(coords: [usize; 3], level: u32) -> [usize; 3] {
    coords.map(|c| c.checked_shr(level).unwrap_or(0))
}

/// Brick-grid index containing a level-space coordinate
pub fn brick_for_position(level_coords: [usize; 3], brick_size: [usize; 3]) -> [usize; 3] {
    [
        level_coords[0] / brick_size[0],
        level_coords[1] / brick_size[1],
        level_coords[2] / brick_size[2],
    ]
}

/// Offset of a level-space coordinate inside its brick
pub fn local_offset(level_coords: [usize; 3], brick_size: [usize; 3]) -> [usize; 3] {
    [
        level_coords[0] % brick_size[0],
        level_coords[1] % brick_size[1],
        level_coords[2] % brick_size[2],
    ]
}

/// Clamp coordinates to the last valid sample of `dimensions`
pub fn clamp_to_dimensions(coords: [usize; 3], dimensions: [usize; 3]) -> [usize; 3] {
    [
        coords[0].min(dimensions[0].saturating_sub(1)),
        coords[1].min(dimensions[1].saturating_sub(1)),
        coords[2].min(dimensions[2].saturating_sub(1)),
    ]
}
