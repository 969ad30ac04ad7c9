use serde::{Deserialize, Serialize};
use crate::error::{EngineError, EngineResult};
use crate::streaming::{BrickKey, BrickSource};

/// Manifest file name relative to the dataset root
pub const MANIFEST_FILE: &str = "manifest.json";

/// Per-level brick layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelDescriptor {
    pub level: u32,
    /// Always `2^level`
    pub scale_factor: u32,
    /// Samples per axis at this level
    pub dimensions: [usize; 3],
    pub brick_size: [usize; 3],
    pub num_bricks: [usize; 3],
    #[serde(default)]
    pub total_bricks: usize,
}

impl LevelDescriptor {
    /// Build the descriptor for `level` of a volume, deriving the brick grid
    ///
    /// Fails for levels whose `2^level` scale factor does not fit in a `u32`.
    pub fn new(level: u32, dimensions: [usize; 3], brick_size: [usize; 3]) -> EngineResult<Self> {
        let scale_factor = 1u32.checked_shl(level).ok_or_else(|| {
            EngineError::manifest(format!("level {} has no representable scale factor", level))
        })?;
        let num_bricks = [
            dimensions[0].div_ceil(brick_size[0]),
            dimensions[1].div_ceil(brick_size[1]),
            dimensions[2].div_ceil(brick_size[2]),
        ];
        Ok(Self {
            level,
            scale_factor,
            dimensions,
            brick_size,
            num_bricks,
            total_bricks: num_bricks.iter().product(),
        })
    }

    /// Whether a brick-grid index lies inside this level
    pub fn contains_brick(&self, key: &BrickKey) -> bool {
        key.level == self.level
            && (key.x as usize) < self.num_bricks[0]
            && (key.y as usize) < self.num_bricks[1]
            && (key.z as usize) < self.num_bricks[2]
    }

    /// Every brick key of the level in nested `(x, y, z)` order
    pub fn brick_keys(&self) -> Vec<BrickKey> {
        let mut keys = Vec::with_capacity(self.num_bricks.iter().product());
        for x in 0..self.num_bricks[0] {
            for y in 0..self.num_bricks[1] {
                for z in 0..self.num_bricks[2] {
                    keys.push(BrickKey::new(self.level, x as u32, y as u32, z as u32));
                }
            }
        }
        keys
    }

    fn validate(&self, index: usize) -> EngineResult<()> {
        if self.level as usize != index {
            return Err(EngineError::manifest(format!(
                "level entry {} declares level {}",
                index, self.level
            )));
        }
        let expected_scale = 1u64.checked_shl(self.level).unwrap_or(0);
        if u64::from(self.scale_factor) != expected_scale {
            return Err(EngineError::manifest(format!(
                "level {} has scale factor {}, expected {}",
                self.level, self.scale_factor, expected_scale
            )));
        }
        if self.brick_size.contains(&0) {
            return Err(EngineError::manifest(format!(
                "level {} has a zero brick size {:?}",
                self.level, self.brick_size
            )));
        }
        if self.dimensions.contains(&0) {
            return Err(EngineError::manifest(format!(
                "level {} has empty dimensions {:?}",
                self.level, self.dimensions
            )));
        }
        for axis in 0..3 {
            let expected = self.dimensions[axis].div_ceil(self.brick_size[axis]);
            if self.num_bricks[axis] != expected {
                return Err(EngineError::manifest(format!(
                    "level {} axis {} has {} bricks, expected {}",
                    self.level, axis, self.num_bricks[axis], expected
                )));
            }
        }
        Ok(())
    }
}

/// One brick file listed in the manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrickEntry {
    pub level: u32,
    pub x: u32,
    pub y: u32,
    pub z: u32,
    pub filename: String,
    pub byte_size: u64,
}

/// Static description of a bricked multi-resolution volume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub version: String,
    pub original_dimensions: [usize; 3],
    pub brick_size: [usize; 3],
    #[serde(default)]
    pub num_levels: usize,
    pub levels: Vec<LevelDescriptor>,
    #[serde(default)]
    pub bricks: Vec<BrickEntry>,
    #[serde(default)]
    pub total_size_bytes: u64,
}

impl Manifest {
    /// Fetch and parse `manifest.json` from a brick source
    pub async fn load(source: &dyn BrickSource) -> EngineResult<Self> {
        let bytes = source.fetch(MANIFEST_FILE).await.map_err(|e| {
            EngineError::manifest(format!("failed to fetch {}: {}", MANIFEST_FILE, e))
        })?;
        let manifest = Self::from_json(&bytes)?;
        log::info!(
            "Loaded manifest from {}: {:?} samples, {} levels, brick size {:?}",
            source.describe(),
            manifest.original_dimensions,
            manifest.num_levels(),
            manifest.brick_size
        );
        Ok(manifest)
    }

    /// Parse and validate a manifest document
    pub fn from_json(bytes: &[u8]) -> EngineResult<Self> {
        let manifest: Manifest = serde_json::from_slice(bytes)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn to_json(&self) -> EngineResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.levels.is_empty() {
            return Err(EngineError::manifest("manifest declares no levels"));
        }
        if self.num_levels != 0 && self.num_levels != self.levels.len() {
            return Err(EngineError::manifest(format!(
                "num_levels is {} but {} levels are listed",
                self.num_levels,
                self.levels.len()
            )));
        }
        if self.brick_size.contains(&0) {
            return Err(EngineError::manifest("brick_size must be non-zero"));
        }
        for (index, level) in self.levels.iter().enumerate() {
            level.validate(index)?;
        }
        Ok(())
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    /// Coarsest available level (highest index)
    pub fn coarsest_level(&self) -> u32 {
        self.levels.len().saturating_sub(1) as u32
    }

    pub fn level(&self, level: u32) -> EngineResult<&LevelDescriptor> {
        self.levels
            .get(level as usize)
            .ok_or(EngineError::LevelNotFound {
                level,
                num_levels: self.levels.len(),
            })
    }

    pub fn level_dimensions(&self, level: u32) -> EngineResult<[usize; 3]> {
        Ok(self.level(level)?.dimensions)
    }

    pub fn brick_keys(&self, level: u32) -> EngineResult<Vec<BrickKey>> {
        Ok(self.level(level)?.brick_keys())
    }

    /// Clamp a requested level into `[0, num_levels - 1]`
    pub fn clamp_level(&self, level: i64) -> u32 {
        level.clamp(0, self.coarsest_level() as i64) as u32
    }
}
