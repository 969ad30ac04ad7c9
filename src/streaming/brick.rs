use std::fmt;
use serde::{Deserialize, Serialize};
use crate::streaming::error::{malformed_brick, StreamingResult};

/// Size of the brick header: three little-endian i32 extents
pub const BRICK_HEADER_BYTES: usize = 12;

/// Identity of a brick: resolution level plus brick-grid indices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BrickKey {
    pub level: u32,
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl BrickKey {
    pub const fn new(level: u32, x: u32, y: u32, z: u32) -> Self {
        Self { level, x, y, z }
    }

    /// Path of the brick file relative to the dataset root
    pub fn path(&self) -> String {
        format!("level_{}/brick_{}_{}_{}.bin", self.level, self.x, self.y, self.z)
    }

    pub fn grid_index(&self) -> [usize; 3] {
        [self.x as usize, self.y as usize, self.z as usize]
    }
}

impl fmt::Display for BrickKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}({},{},{})", self.level, self.x, self.y, self.z)
    }
}

/// Immutable block of samples fetched from the dataset
///
/// `actual_size` is the valid extent; edge bricks may be truncated. `layout` is the
/// extent the payload is stored with: equal to `actual_size` for dense payloads, or
/// the full brick size for padded ones.
#[derive(Debug, Clone, PartialEq)]
pub struct Brick {
    key: BrickKey,
    actual_size: [usize; 3],
    layout: [usize; 3],
    samples: Vec<f32>,
}

impl Brick {
    /// Build a dense brick. `samples.len()` must equal the product of `actual_size`.
    pub fn new(key: BrickKey, actual_size: [usize; 3], samples: Vec<f32>) -> StreamingResult<Self> {
        Self::with_layout(key, actual_size, actual_size, samples)
    }

    /// Build a brick whose payload is stored with `layout` extents
    pub fn with_layout(
        key: BrickKey,
        actual_size: [usize; 3],
        layout: [usize; 3],
        samples: Vec<f32>,
    ) -> StreamingResult<Self> {
        if (0..3).any(|axis| actual_size[axis] > layout[axis]) {
            return Err(malformed_brick(
                key,
                format!("actual size {:?} exceeds layout {:?}", actual_size, layout),
            ));
        }
        let expected: usize = layout.iter().product();
        if samples.len() != expected {
            return Err(malformed_brick(
                key,
                format!("expected {} samples, got {}", expected, samples.len()),
            ));
        }
        Ok(Self {
            key,
            actual_size,
            layout,
            samples,
        })
    }

    /// Decode a brick file: 12-byte header then little-endian f32 samples, x-major.
    ///
    /// The payload may be dense (`ax*ay*az` samples) or padded to `brick_size`.
    pub fn decode(key: BrickKey, bytes: &[u8], brick_size: [usize; 3]) -> StreamingResult<Self> {
        if bytes.len() < BRICK_HEADER_BYTES {
            return Err(malformed_brick(
                key,
                format!("{} bytes is shorter than the header", bytes.len()),
            ));
        }

        let mut actual_size = [0usize; 3];
        for (axis, chunk) in bytes[..BRICK_HEADER_BYTES].chunks_exact(4).enumerate() {
            let extent = i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            if extent <= 0 || extent as usize > brick_size[axis] {
                return Err(malformed_brick(
                    key,
                    format!("header extent {} on axis {} outside 1..={}", extent, axis, brick_size[axis]),
                ));
            }
            actual_size[axis] = extent as usize;
        }

        let payload = &bytes[BRICK_HEADER_BYTES..];
        if payload.len() % 4 != 0 {
            return Err(malformed_brick(
                key,
                format!("payload of {} bytes is not a whole number of f32", payload.len()),
            ));
        }
        let samples: Vec<f32> = payload
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        let dense: usize = actual_size.iter().product();
        let padded: usize = brick_size.iter().product();
        let layout = if samples.len() == dense {
            actual_size
        } else if samples.len() == padded {
            brick_size
        } else {
            return Err(malformed_brick(
                key,
                format!(
                    "{} samples match neither actual size {:?} nor brick size {:?}",
                    samples.len(),
                    actual_size,
                    brick_size
                ),
            ));
        };

        Self::with_layout(key, actual_size, layout, samples)
    }

    /// Encode into the on-disk brick format
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(BRICK_HEADER_BYTES + self.samples.len() * 4);
        for extent in self.actual_size {
            bytes.extend_from_slice(&(extent as i32).to_le_bytes());
        }
        for sample in &self.samples {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        bytes
    }

    pub fn key(&self) -> BrickKey {
        self.key
    }

    pub fn actual_size(&self) -> [usize; 3] {
        self.actual_size
    }

    pub fn layout(&self) -> [usize; 3] {
        self.layout
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Payload size counted against the cache memory limit
    pub fn byte_len(&self) -> usize {
        self.samples.len() * std::mem::size_of::<f32>()
    }

    /// Sample at a local offset, `None` outside the valid extent
    pub fn sample(&self, lx: usize, ly: usize, lz: usize) -> Option<f32> {
        if lx >= self.actual_size[0] || ly >= self.actual_size[1] || lz >= self.actual_size[2] {
            return None;
        }
        self.samples.get(self.index(lx, ly, lz)).copied()
    }

    #[inline]
    pub(crate) fn index(&self, lx: usize, ly: usize, lz: usize) -> usize {
        lx * self.layout[1] * self.layout[2] + ly * self.layout[2] + lz
    }
}
