//! Error types shared across dataset-kurator subsystems.
//!
//! Defines the error types that cross module boundaries:
//! - Stage execution (raised by any stage implementation)
//! - Shared resource loading (model handles in the resource cache)
//!
//! Errors owned by a single component (work directories, packaging, batch
//! control, result retention, configuration) live next to that component.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by a processing stage.
///
/// The runner never inspects the variant; it only reports that the
/// stage failed and carries the message into the process log.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("Input '{0}' does not exist")]
    MissingInput(PathBuf),

    #[error("External command '{program}' failed: {reason}")]
    CommandFailed { program: String, reason: String },

    #[error("Failed to decode image '{path}': {reason}")]
    ImageDecode { path: PathBuf, reason: String },

    #[error("Failed to encode image '{path}': {reason}")]
    ImageEncode { path: PathBuf, reason: String },

    #[error("Model inference failed: {0}")]
    Inference(String),

    #[error("Invalid stage configuration: {0}")]
    InvalidConfig(String),

    #[error("Background task failed: {0}")]
    Join(String),

    #[error("{0}")]
    Other(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<tokio::task::JoinError> for StageError {
    fn from(err: tokio::task::JoinError) -> Self {
        StageError::Join(err.to_string())
    }
}

/// Errors that can occur while loading a shared resource.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResourceError {
    #[error("No loader registered for resource '{0}'")]
    NoLoader(String),

    #[error("Resource '{name}' is not configured: {reason}")]
    NotConfigured { name: String, reason: String },

    #[error("Failed to load resource '{name}': {reason}")]
    LoadFailed { name: String, reason: String },
}
