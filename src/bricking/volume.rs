use std::path::Path;
use rayon::prelude::*;
use crate::error::{EngineError, EngineResult};

/// Size of the raw volume header: three little-endian i32 dimensions
pub const VOLUME_HEADER_BYTES: usize = 12;

/// Dense full-resolution volume, x-major (`x * ny * nz + y * nz + z`)
#[derive(Debug, Clone, PartialEq)]
pub struct RawVolume {
    dimensions: [usize; 3],
    samples: Vec<f32>,
}

fn malformed_volume(reason: impl std::fmt::Display) -> EngineError {
    EngineError::Io {
        message: format!("malformed raw volume: {}", reason),
    }
}

impl RawVolume {
    pub fn new(dimensions: [usize; 3], samples: Vec<f32>) -> EngineResult<Self> {
        let expected: usize = dimensions.iter().product();
        if expected == 0 {
            return Err(malformed_volume(format!("empty dimensions {:?}", dimensions)));
        }
        if samples.len() != expected {
            return Err(malformed_volume(format!(
                "{:?} needs {} samples, got {}",
                dimensions,
                expected,
                samples.len()
            )));
        }
        Ok(Self { dimensions, samples })
    }

    /// Build a volume by evaluating `f(x, y, z)` at every sample
    pub fn from_fn(dimensions: [usize; 3], f: impl Fn(usize, usize, usize) -> f32) -> Self {
        let [nx, ny, nz] = dimensions;
        let mut samples = Vec::with_capacity(nx * ny * nz);
        for x in 0..nx {
            for y in 0..ny {
                for z in 0..nz {
                    samples.push(f(x, y, z));
                }
            }
        }
        Self { dimensions, samples }
    }

    /// Parse the raw format: `nx, ny, nz` as LE i32 then LE f32 samples
    pub fn decode(bytes: &[u8]) -> EngineResult<Self> {
        if bytes.len() < VOLUME_HEADER_BYTES {
            return Err(malformed_volume(format!("{} bytes is shorter than the header", bytes.len())));
        }
        let mut dimensions = [0usize; 3];
        for (axis, chunk) in bytes[..VOLUME_HEADER_BYTES].chunks_exact(4).enumerate() {
            let extent = i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            if extent <= 0 {
                return Err(malformed_volume(format!("dimension {} on axis {}", extent, axis)));
            }
            dimensions[axis] = extent as usize;
        }

        let payload = &bytes[VOLUME_HEADER_BYTES..];
        if payload.len() % 4 != 0 {
            return Err(malformed_volume("payload is not a whole number of f32"));
        }
        let samples = payload
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Self::new(dimensions, samples)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(VOLUME_HEADER_BYTES + self.samples.len() * 4);
        for extent in self.dimensions {
            bytes.extend_from_slice(&(extent as i32).to_le_bytes());
        }
        for sample in &self.samples {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        bytes
    }

    pub fn read(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| EngineError::Io {
            message: format!("{}: {}", path.display(), e),
        })?;
        Self::decode(&bytes)
    }

    pub fn write(&self, path: impl AsRef<Path>) -> EngineResult<()> {
        std::fs::write(path, self.encode())?;
        Ok(())
    }

    pub fn dimensions(&self) -> [usize; 3] {
        self.dimensions
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    #[inline]
    fn index(&self, x: usize, y: usize, z: usize) -> usize {
        (x * self.dimensions[1] + y) * self.dimensions[2] + z
    }

    pub fn get(&self, x: usize, y: usize, z: usize) -> Option<f32> {
        let [nx, ny, nz] = self.dimensions;
        if x >= nx || y >= ny || z >= nz {
            return None;
        }
        Some(self.samples[self.index(x, y, z)])
    }

    /// Clip to the 1st/99th percentile, then map linearly onto `[-1, 1]`
    ///
    /// Constant data maps to zeros. NaN samples are ignored for the percentiles
    /// and stay NaN.
    pub fn normalize(&self) -> Self {
        let mut sorted: Vec<f32> = self.samples.iter().copied().filter(|v| !v.is_nan()).collect();
        if sorted.is_empty() {
            return self.clone();
        }
        sorted.par_sort_unstable_by(|a, b| a.total_cmp(b));
        let (p1, p99) = (percentile(&sorted, 1.0), percentile(&sorted, 99.0));

        let clipped = |v: f32| v.clamp(p1, p99);
        let (low, high) = self
            .samples
            .iter()
            .filter(|v| !v.is_nan())
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(clipped(v)), hi.max(clipped(v)))
            });
        let span = high - low;

        let samples = self
            .samples
            .par_iter()
            .map(|&v| {
                if v.is_nan() {
                    v
                } else if span > 0.0 {
                    2.0 * (clipped(v) - low) / span - 1.0
                } else {
                    0.0
                }
            })
            .collect();
        log::debug!("Normalized volume: p1 = {}, p99 = {}", p1, p99);
        Self {
            dimensions: self.dimensions,
            samples,
        }
    }

    /// Average `factor^3` blocks, truncating each axis to a multiple of `factor`
    ///
    /// Fails when an axis is shorter than `factor`.
    pub fn downsample(&self, factor: usize) -> EngineResult<Self> {
        if factor <= 1 {
            return Ok(self.clone());
        }
        let out = self.dimensions.map(|n| n / factor);
        if out.contains(&0) {
            return Err(EngineError::config(format!(
                "cannot downsample {:?} by {}",
                self.dimensions, factor
            )));
        }

        let plane = out[1] * out[2];
        let block = (factor * factor * factor) as f64;
        let samples = (0..out.iter().product::<usize>())
            .into_par_iter()
            .map(|i| {
                let (ox, oy, oz) = (i / plane, (i % plane) / out[2], i % out[2]);
                let mut sum = 0.0f64;
                for dx in 0..factor {
                    for dy in 0..factor {
                        let base = self.index(ox * factor + dx, oy * factor + dy, oz * factor);
                        sum += self.samples[base..base + factor]
                            .iter()
                            .map(|&v| f64::from(v))
                            .sum::<f64>();
                    }
                }
                (sum / block) as f32
            })
            .collect();

        Ok(Self {
            dimensions: out,
            samples,
        })
    }
}

/// Linear-interpolated percentile of sorted data
fn percentile(sorted: &[f32], p: f64) -> f32 {
    let rank = p / 100.0 * (sorted.len() - 1) as f64;
    let (lo, hi) = (rank.floor() as usize, rank.ceil() as usize);
    let frac = rank - lo as f64;
    (f64::from(sorted[lo]) + (f64::from(sorted[hi]) - f64::from(sorted[lo])) * frac) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_round_trip() {
        let volume = RawVolume::from_fn([3, 2, 4], |x, y, z| (x * 100 + y * 10 + z) as f32);
        let decoded = RawVolume::decode(&volume.encode()).expect("decode");
        assert_eq!(decoded.dimensions(), [3, 2, 4]);
        assert_eq!(decoded.get(2, 1, 3), Some(213.0));
        assert_eq!(decoded.get(3, 0, 0), None);
    }

    #[test]
    fn test_decode_rejects_truncated_payload() {
        let mut bytes = RawVolume::from_fn([2, 2, 2], |_, _, _| 1.0).encode();
        bytes.truncate(bytes.len() - 4);
        assert!(RawVolume::decode(&bytes).is_err());
        assert!(RawVolume::decode(&[1, 0, 0]).is_err());
    }

    #[test]
    fn test_normalize_clips_outliers() {
        // 0..=99 plus one huge spike
        let mut samples: Vec<f32> = (0..100).map(|v| v as f32).collect();
        samples.push(1.0e6);
        let volume = RawVolume::new([101, 1, 1], samples).expect("volume");

        let normalized = volume.normalize();
        assert_eq!(normalized.get(0, 0, 0), Some(-1.0));
        assert_eq!(normalized.get(100, 0, 0), Some(1.0));
        assert!(normalized.samples().iter().all(|v| (-1.0..=1.0).contains(v)));
    }

    #[test]
    fn test_normalize_constant_volume() {
        let volume = RawVolume::from_fn([2, 2, 2], |_, _, _| 3.5);
        assert!(volume.normalize().samples().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_downsample_truncates_and_averages() {
        let volume = RawVolume::from_fn([5, 4, 4], |x, _, _| x as f32);
        let half = volume.downsample(2).expect("downsample");
        assert_eq!(half.dimensions(), [2, 2, 2]);
        assert_eq!(half.get(0, 1, 1), Some(0.5));
        assert_eq!(half.get(1, 0, 0), Some(2.5));

        assert!(volume.downsample(8).is_err());
    }
}
