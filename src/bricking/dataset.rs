use std::path::Path;
use rayon::prelude::*;
use crate::bricking::RawVolume;
use crate::error::{EngineError, EngineResult};
use crate::manifest::{BrickEntry, LevelDescriptor, Manifest, MANIFEST_FILE};
use crate::streaming::{Brick, BrickKey, MemorySource};

pub const MANIFEST_VERSION: &str = "1.0";

/// A bricked multi-resolution dataset held in memory
///
/// `files` carries every brick file keyed by its path relative to the dataset
/// root, in manifest order.
#[derive(Debug, Clone)]
pub struct BrickedDataset {
    pub manifest: Manifest,
    pub files: Vec<(String, Vec<u8>)>,
}

impl BrickedDataset {
    /// Cut `volume` into bricks at `num_levels` resolutions
    ///
    /// Level `n` averages `2^n` blocks of the full-resolution volume. Edge bricks
    /// are padded to the full brick size with their real extent in the header.
    pub fn build(volume: &RawVolume, brick_size: [usize; 3], num_levels: usize) -> EngineResult<Self> {
        if brick_size.contains(&0) {
            return Err(EngineError::config(format!("brick size {:?} must be non-zero", brick_size)));
        }
        if num_levels == 0 {
            return Err(EngineError::config("at least one level is required"));
        }

        let mut levels = Vec::with_capacity(num_levels);
        let mut bricks = Vec::new();
        let mut files = Vec::new();

        for level in 0..num_levels as u32 {
            let factor = 1usize
                .checked_shl(level)
                .ok_or_else(|| EngineError::config(format!("level {} is too deep to downsample", level)))?;
            let data = volume.downsample(factor)?;
            let descriptor = LevelDescriptor::new(level, data.dimensions(), brick_size)?;

            let encoded = descriptor
                .brick_keys()
                .into_par_iter()
                .map(|key| extract_brick(&data, key, brick_size).map(|brick| (key, brick.encode())))
                .collect::<EngineResult<Vec<_>>>()?;

            log::info!(
                "Level {} (1/{}x): {:?} samples in {:?} = {} bricks",
                level,
                descriptor.scale_factor,
                descriptor.dimensions,
                descriptor.num_bricks,
                descriptor.total_bricks
            );

            for (key, bytes) in encoded {
                bricks.push(BrickEntry {
                    level,
                    x: key.x,
                    y: key.y,
                    z: key.z,
                    filename: key.path(),
                    byte_size: bytes.len() as u64,
                });
                files.push((key.path(), bytes));
            }
            levels.push(descriptor);
        }

        let manifest = Manifest {
            version: MANIFEST_VERSION.to_string(),
            original_dimensions: volume.dimensions(),
            brick_size,
            num_levels,
            total_size_bytes: bricks.iter().map(|b| b.byte_size).sum(),
            levels,
            bricks,
        };
        manifest.validate()?;

        Ok(Self { manifest, files })
    }

    pub fn brick_count(&self) -> usize {
        self.files.len()
    }

    /// Write `manifest.json` and every `level_N/brick_X_Y_Z.bin` under `dir`
    pub fn write_to_dir(&self, dir: impl AsRef<Path>) -> EngineResult<()> {
        let dir = dir.as_ref();
        for level in &self.manifest.levels {
            std::fs::create_dir_all(dir.join(format!("level_{}", level.level)))?;
        }
        for (path, bytes) in &self.files {
            std::fs::write(dir.join(path), bytes)?;
        }
        std::fs::write(dir.join(MANIFEST_FILE), self.manifest.to_json()?)?;

        log::info!(
            "Wrote {} bricks ({:.1} MB) to {}",
            self.files.len(),
            self.manifest.total_size_bytes as f64 / (1024.0 * 1024.0),
            dir.display()
        );
        Ok(())
    }

    /// Serve the dataset from memory, manifest included
    pub fn to_memory_source(&self) -> EngineResult<MemorySource> {
        let manifest = self.manifest.to_json()?.into_bytes();
        Ok(MemorySource::from_files(
            std::iter::once((MANIFEST_FILE.to_string(), manifest)).chain(self.files.iter().cloned()),
        ))
    }
}

/// Copy one brick out of a level volume into a zero-padded payload
fn extract_brick(data: &RawVolume, key: BrickKey, brick_size: [usize; 3]) -> EngineResult<Brick> {
    let dims = data.dimensions();
    let origin = [0, 1, 2].map(|axis| key.grid_index()[axis] * brick_size[axis]);
    let actual = [0, 1, 2].map(|axis| (dims[axis] - origin[axis]).min(brick_size[axis]));

    let mut samples = vec![0.0f32; brick_size.iter().product()];
    for lx in 0..actual[0] {
        for ly in 0..actual[1] {
            let row = (lx * brick_size[1] + ly) * brick_size[2];
            for lz in 0..actual[2] {
                samples[row + lz] = data
                    .get(origin[0] + lx, origin[1] + ly, origin[2] + lz)
                    .unwrap_or(0.0);
            }
        }
    }
    Brick::with_layout(key, actual, brick_size, samples)
}
