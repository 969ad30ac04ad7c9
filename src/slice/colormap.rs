use std::sync::atomic::{AtomicU64, Ordering};
use crate::error::{EngineError, EngineResult};
use crate::slice::{ColoredSlice, SliceData};

/// Entries in a color lookup table
pub const LUT_SIZE: usize = 256;

static NEXT_LUT_ID: AtomicU64 = AtomicU64::new(1);

/// 256-entry RGB color lookup table
///
/// Each table gets a unique id on construction; caches of color-mapped output key
/// their validity on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColorLut {
    id: u64,
    entries: Vec<[u8; 3]>,
}

impl ColorLut {
    pub fn from_rgb(entries: Vec<[u8; 3]>) -> EngineResult<Self> {
        if entries.len() != LUT_SIZE {
            return Err(EngineError::config(format!(
                "color table needs {} entries, got {}",
                LUT_SIZE,
                entries.len()
            )));
        }
        Ok(Self {
            id: NEXT_LUT_ID.fetch_add(1, Ordering::Relaxed),
            entries,
        })
    }

    /// Build from packed RGB (768 bytes) or RGBA (1024 bytes, alpha ignored)
    pub fn from_bytes(bytes: &[u8]) -> EngineResult<Self> {
        let stride = match bytes.len() {
            n if n == LUT_SIZE * 3 => 3,
            n if n == LUT_SIZE * 4 => 4,
            n => {
                return Err(EngineError::config(format!(
                    "color table must be {} or {} bytes, got {}",
                    LUT_SIZE * 3,
                    LUT_SIZE * 4,
                    n
                )))
            }
        };
        Self::from_rgb(bytes.chunks_exact(stride).map(|c| [c[0], c[1], c[2]]).collect())
    }

    /// Linear black-to-white ramp
    pub fn grayscale() -> Self {
        let entries = (0..LUT_SIZE).map(|i| [i as u8; 3]).collect();
        Self {
            id: NEXT_LUT_ID.fetch_add(1, Ordering::Relaxed),
            entries,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn entries(&self) -> &[[u8; 3]] {
        &self.entries
    }

    pub fn color(&self, index: u8) -> [u8; 3] {
        self.entries[index as usize]
    }
}

/// Table index for a sample; `None` for NaN
pub fn color_index(value: f32, value_range: (f32, f32)) -> Option<u8> {
    if value.is_nan() {
        return None;
    }
    let (low, high) = value_range;
    let span = high - low;
    let t = if span > 0.0 { ((value - low) / span).clamp(0.0, 1.0) } else { 0.5 };
    Some((t * (LUT_SIZE - 1) as f32).round() as u8)
}

/// Map samples through the table into RGBA8. NaN samples become transparent.
pub fn apply_colormap(samples: &[f32], lut: &ColorLut, value_range: (f32, f32)) -> Vec<u8> {
    let mut rgba = Vec::with_capacity(samples.len() * 4);
    for &value in samples {
        match color_index(value, value_range) {
            Some(index) => {
                let [r, g, b] = lut.color(index);
                rgba.extend_from_slice(&[r, g, b, 255]);
            }
            None => rgba.extend_from_slice(&[0, 0, 0, 0]),
        }
    }
    rgba
}

pub fn colorize(slice: &SliceData, lut: &ColorLut, value_range: (f32, f32)) -> ColoredSlice {
    ColoredSlice {
        key: slice.key,
        width: slice.width,
        height: slice.height,
        rgba: apply_colormap(&slice.samples, lut, value_range),
    }
}
