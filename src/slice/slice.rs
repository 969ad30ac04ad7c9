use std::fmt;
use serde::{Deserialize, Serialize};

/// Orientation of a cross-section through the volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SliceType {
    /// Fixed x; spans crossline (width) by time (height)
    Inline,
    /// Fixed y; spans inline (width) by time (height)
    Crossline,
    /// Fixed z; spans inline (width) by crossline (height)
    Time,
}

impl SliceType {
    pub const ALL: [SliceType; 3] = [SliceType::Inline, SliceType::Crossline, SliceType::Time];

    /// Volume axis held constant by the slice
    pub fn axis(self) -> usize {
        match self {
            SliceType::Inline => 0,
            SliceType::Crossline => 1,
            SliceType::Time => 2,
        }
    }

    /// Volume axes mapped to (columns, rows) of the slice buffer
    pub fn plane_axes(self) -> (usize, usize) {
        match self {
            SliceType::Inline => (1, 2),
            SliceType::Crossline => (0, 2),
            SliceType::Time => (0, 1),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SliceType::Inline => "inline",
            SliceType::Crossline => "crossline",
            SliceType::Time => "time",
        }
    }
}

impl fmt::Display for SliceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Identity of a slice request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SliceKey {
    pub slice_type: SliceType,
    /// Index along the slice axis, in level space
    pub index: usize,
    pub level: u32,
}

impl SliceKey {
    pub fn new(slice_type: SliceType, index: usize, level: u32) -> Self {
        Self {
            slice_type,
            index,
            level,
        }
    }
}

impl fmt::Display for SliceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]@L{}", self.slice_type, self.index, self.level)
    }
}

/// Stitched amplitude samples, row-major (`row * width + col`)
#[derive(Debug, Clone, PartialEq)]
pub struct SliceData {
    pub key: SliceKey,
    pub width: usize,
    pub height: usize,
    pub samples: Vec<f32>,
}

impl SliceData {
    pub fn get(&self, col: usize, row: usize) -> Option<f32> {
        if col >= self.width || row >= self.height {
            return None;
        }
        self.samples.get(row * self.width + col).copied()
    }
}

/// Color-mapped slice, RGBA8 row-major
#[derive(Debug, Clone, PartialEq)]
pub struct ColoredSlice {
    pub key: SliceKey,
    pub width: usize,
    pub height: usize,
    pub rgba: Vec<u8>,
}

impl ColoredSlice {
    pub fn pixel(&self, col: usize, row: usize) -> Option<[u8; 4]> {
        if col >= self.width || row >= self.height {
            return None;
        }
        let offset = (row * self.width + col) * 4;
        self.rgba
            .get(offset..offset + 4)
            .map(|p| [p[0], p[1], p[2], p[3]])
    }

    /// Whether the buffer length matches the declared dimensions
    pub fn is_well_formed(&self) -> bool {
        self.rgba.len() == self.width * self.height * 4
    }
}
