//! Per-job pipeline execution.
//!
//! This module turns one uploaded video into one packaged dataset archive.
//!
//! # Architecture
//!
//! - **Config**: Deployment settings (`PipelineConfig`) and per-batch stage
//!   parameters (`JobConfig`)
//! - **WorkDir**: Per-job working tree with one directory per stage
//! - **Runner**: Drives a job through the stage chain and reports progress
//! - **Packaging**: Zips the final dataset into the results directory
//!
//! # Pipeline Flow
//!
//! 1. **Frame Extraction**: Sample frames from the video with ffmpeg
//! 2. **Deduplication**: Drop near-identical frames by perceptual hash
//! 3. **Filtering**: Drop blurry and dark frames
//! 4. **Upscaling**: Enlarge frames with a super-resolution model
//! 5. **Cropping**: Crop detected faces
//! 6. **Annotation**: Write one caption per frame from predicted tags
//! 7. **Classification**: Group frames by hair and eye color
//! 8. **Packaging**: Zip the dataset as `<job>.zip`
//!
//! Stages 2 through 7 can be skipped per batch; a skipped stage passes its
//! input through unchanged.
//!
//! # Example
//!
//! ```rust,ignore
//! use dataset_kurator::pipeline::{PipelineConfig, PipelineRunner, NoopObserver};
//! use dataset_kurator::resources::{CommandLoader, ResourceCache};
//! use dataset_kurator::storage::ProcessLog;
//! use std::sync::Arc;
//!
//! let config = PipelineConfig::from_env()?;
//! let runner = PipelineRunner::new(
//!     &config,
//!     Arc::new(ResourceCache::with_shared_loader(Arc::new(
//!         CommandLoader::from_config(&config),
//!     ))),
//!     Arc::new(ProcessLog::new(&config.log_dir)),
//! );
//!
//! let outcome = runner.run(&job, &NoopObserver).await?;
//! println!("Dataset written to {}", outcome.artifact.display());
//! ```

pub mod config;
pub mod packaging;
pub mod runner;
pub mod workdir;

// Re-export main types for convenience
pub use config::{ConfigError, JobConfig, PipelineConfig};
pub use packaging::{Packager, PackagingError};
pub use runner::{
    JobOutcome, NoopObserver, PipelineRunner, ProgressObserver, RunError, StageProgress,
    PACKAGING, STARTING, TOTAL_STEPS,
};
pub use workdir::{WorkDirError, WorkDirManager, WorkTreeGuard};
