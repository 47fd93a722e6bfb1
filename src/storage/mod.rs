//! File-backed storage for run outputs.
//!
//! # Overview
//!
//! - **ProcessLog**: Append-only log of stage boundaries, rotated per job
//! - **Results**: Packaged archives with optional time-to-live
//!
//! # Usage
//!
//! ```rust,ignore
//! use dataset_kurator::storage::{ProcessLog, ResultStore};
//! use std::time::Duration;
//!
//! let log = ProcessLog::new("logs");
//! log.append("Frame Extraction started").await?;
//!
//! let results = ResultStore::new("output").with_default_ttl(Duration::from_secs(3600));
//! let artifact = results.register(&archive)?;
//! let path = results.deliver(&artifact.name)?;
//! ```

pub mod process_log;
pub mod results;

// Re-export main types for convenience
pub use process_log::{ProcessLog, ProcessLogError, LOG_FILE};
pub use results::{ResultArtifact, ResultError, ResultStore};
