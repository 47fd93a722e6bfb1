//! Sequential batch scheduling over a directory-backed input queue.
//!
//! - **InputQueue**: Videos waiting in the input directory
//! - **Job**: One input video and its stage parameters
//! - **BatchController**: Runs a snapshot of the queue, one job at a time
//!
//! # Architecture
//!
//! ```text
//!      ┌──────────────┐
//!      │  enqueue     │  (CLI upload)
//!      └──────┬───────┘
//!             │
//!      ┌──────▼───────┐
//!      │ input dir    │
//!      └──────┬───────┘
//!             │ snapshot at start()
//!      ┌──────▼───────┐        ┌──────────────┐
//!      │ batch worker │ ─────▶ │ BatchState   │ ◀── status() readers
//!      └──────┬───────┘        └──────────────┘
//!             │ one job at a time
//!      ┌──────▼───────┐
//!      │ PipelineRunner│
//!      └──────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use dataset_kurator::pipeline::{JobConfig, PipelineConfig};
//! use dataset_kurator::scheduler::BatchController;
//!
//! let config = PipelineConfig::from_env()?;
//! let controller = BatchController::from_config(&config);
//! controller.enqueue(Path::new("episode-01.mp4")).await?;
//! controller.start(JobConfig::default())?;
//!
//! let state = controller.wait().await?;
//! println!("{}: {:?}", state.status, state.results);
//! ```
//!
//! # Failure Policy
//!
//! - **No retries**: a failed job is not retried
//! - **Abort on failure**: the first failing job ends the batch
//! - **Consumed inputs**: a job's input is deleted once it has run, whatever
//!   the outcome; later inputs stay queued for the next batch

pub mod batch;
pub mod job;
pub mod queue;

// Re-export main types for convenience
pub use batch::{BatchController, BatchError, BatchProgress, BatchState, BatchStatus, DONE};
pub use job::{job_id_for, Job, JobStatus};
pub use queue::{InputQueue, QueueError};
