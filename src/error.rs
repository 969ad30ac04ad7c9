//! Engine-wide error type
//!
//! Every subsystem reports failures through [`EngineError`]. The type is `Clone`
//! so a single fetch result can be handed to every caller waiting on it.

use crate::streaming::BrickKey;

/// Result type used throughout the engine
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur while streaming a bricked volume
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    /// Manifest missing or malformed. Fatal for the dataset, never retried.
    #[error("Manifest error: {message}")]
    Manifest { message: String },

    /// A single brick could not be fetched or decoded.
    #[error("Failed to fetch brick {key}: {reason}")]
    BrickFetch { key: BrickKey, reason: String },

    /// Requested level is absent from the manifest.
    #[error("Level {level} not found (dataset has {num_levels} levels)")]
    LevelNotFound { level: u32, num_levels: usize },

    #[error("Slice index {index} out of range for {axis} axis of extent {extent}")]
    SliceOutOfRange {
        axis: &'static str,
        index: usize,
        extent: usize,
    },

    #[error("Slice pipeline error: {message}")]
    Pipeline { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("IO error: {message}")]
    Io { message: String },

    #[error("Controller not initialized")]
    NotInitialized,

    /// A level load already holds the controller and the policy drops new ones.
    #[error("A level load is already in progress")]
    LoadInProgress,
}

impl EngineError {
    pub fn manifest(message: impl Into<String>) -> Self {
        EngineError::Manifest {
            message: message.into(),
        }
    }

    pub fn brick_fetch(key: BrickKey, reason: impl std::fmt::Display) -> Self {
        EngineError::BrickFetch {
            key,
            reason: reason.to_string(),
        }
    }

    pub fn pipeline(message: impl Into<String>) -> Self {
        EngineError::Pipeline {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        EngineError::Config {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Io {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::manifest(err.to_string())
    }
}

impl From<toml::de::Error> for EngineError {
    fn from(err: toml::de::Error) -> Self {
        EngineError::config(err.to_string())
    }
}
