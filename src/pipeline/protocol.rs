/// Worker message protocol
///
/// The slice worker only ever sees `WorkerRequest` values and only ever answers
/// with `WorkerResponse` values. Bricks cross the boundary as immutable
/// `Arc<Brick>`; finished buffers move by ownership.

use std::sync::Arc;
use crate::error::{EngineError, EngineResult};
use crate::manifest::LevelDescriptor;
use crate::slice::{ColorLut, ColoredSlice, SliceKey};
use crate::streaming::Brick;

/// Everything the worker needs to produce one color slice
#[derive(Debug, Clone)]
pub struct StitchJob {
    pub request_id: u64,
    pub key: SliceKey,
    pub level: LevelDescriptor,
    pub bricks: Vec<Arc<Brick>>,
    pub lut: Arc<ColorLut>,
    pub value_range: (f32, f32),
}

#[derive(Debug, Clone)]
pub enum WorkerRequest {
    Stitch(StitchJob),
    Shutdown,
}

#[derive(Debug, Clone)]
pub enum WorkerResponse {
    /// First message the worker sends, before it accepts any job
    Ready,
    Slice {
        request_id: u64,
        slice: ColoredSlice,
    },
    Failed {
        request_id: u64,
        error: EngineError,
    },
}

impl WorkerResponse {
    pub fn request_id(&self) -> Option<u64> {
        match self {
            WorkerResponse::Ready => None,
            WorkerResponse::Slice { request_id, .. } | WorkerResponse::Failed { request_id, .. } => {
                Some(*request_id)
            }
        }
    }

    /// Check a response before trusting its contents
    pub fn validate(&self) -> EngineResult<()> {
        if let WorkerResponse::Slice { request_id, slice } = self {
            if !slice.is_well_formed() {
                return Err(EngineError::pipeline(format!(
                    "response {} for {} carries {} bytes, expected {}x{}x4",
                    request_id,
                    slice.key,
                    slice.rgba.len(),
                    slice.width,
                    slice.height
                )));
            }
        }
        Ok(())
    }
}
