//! dataset-kurator: turns videos into captioned, classified image datasets.
//!
//! This library provides the stage chain, the per-job runner, the sequential
//! batch controller, and the storage for process logs and packaged results.

// Core modules
pub mod cli;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod resources;
pub mod scheduler;
pub mod stages;
pub mod storage;

// Re-export commonly used error types
pub use error::{ResourceError, StageError};
