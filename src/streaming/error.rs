/// Streaming System Error Handling
///
/// Attaches brick context to transport and decode failures.

use crate::error::{EngineError, EngineResult};
use crate::streaming::BrickKey;

/// Streaming-specific result type
pub type StreamingResult<T> = EngineResult<T>;

/// Error context for brick operations
pub trait StreamingErrorContext<T> {
    fn brick_context(self, key: BrickKey) -> StreamingResult<T>;
}

impl<T, E> StreamingErrorContext<T> for Result<T, E>
where
    E: std::fmt::Display,
{
    fn brick_context(self, key: BrickKey) -> StreamingResult<T> {
        self.map_err(|e| EngineError::brick_fetch(key, e))
    }
}

/// Create a decode error for a brick payload
pub fn malformed_brick(key: BrickKey, reason: impl std::fmt::Display) -> EngineError {
    EngineError::brick_fetch(key, format!("malformed brick data: {}", reason))
}
