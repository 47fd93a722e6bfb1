//! Batch control.
//!
//! A batch is the set of queued inputs snapshotted by one [`BatchController::start`]
//! call. Its jobs run strictly one after another on a single background task.
//! The first failing job ends the batch; the inputs behind it stay queued.
//!
//! [`BatchState`] is the only state shared with readers. The worker is its
//! single writer and replaces status and progress together under one lock,
//! so a reader's snapshot never pairs a status with a stale progress value.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::job::Job;
use super::queue::{InputQueue, QueueError};
use crate::metrics::MetricsCollector;
use crate::pipeline::{
    ConfigError, JobConfig, JobOutcome, Packager, PipelineConfig, PipelineRunner,
    ProgressObserver, RunError, StageProgress, STARTING, TOTAL_STEPS,
};
use crate::resources::{CommandLoader, ResourceCache};
use crate::storage::{ProcessLog, ResultStore};

/// Name reported once every job of a batch has completed.
pub const DONE: &str = "Done";

/// Errors returned by the batch controller.
#[derive(Debug, Error)]
pub enum BatchError {
    /// A batch is already processing.
    #[error("A batch is already running")]
    AlreadyRunning,

    /// No input is waiting.
    #[error("No input files are queued")]
    EmptyQueue,

    /// The stage parameters are invalid.
    #[error("Invalid job configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    /// The input directory could not be read or written.
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// The background task panicked.
    #[error("Batch task failed: {0}")]
    Join(String),
}

/// Overall status of the most recent batch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    #[default]
    Idle,
    Processing,
    Completed,
    Failed,
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BatchStatus::Idle => "idle",
            BatchStatus::Processing => "processing",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Batch-level progress: `step` out of `total`, where every job accounts for
/// [`TOTAL_STEPS`] steps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchProgress {
    pub step: usize,
    pub total: usize,
    /// Current stage name.
    pub name: String,
    /// Job being processed.
    #[serde(default)]
    pub job: Option<String>,
}

/// Snapshot of the batch shared with readers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchState {
    /// Identity of the most recent batch.
    #[serde(default)]
    pub batch_id: Option<Uuid>,
    pub status: BatchStatus,
    pub progress: BatchProgress,
    /// Input files not yet consumed.
    pub queue: Vec<String>,
    /// Archive names produced by this batch.
    pub results: Vec<String>,
    /// Failure message when `status` is `Failed`.
    #[serde(default)]
    pub error: Option<String>,
}

/// Runs batches of queued inputs through the pipeline.
pub struct BatchController {
    runner: Arc<PipelineRunner>,
    queue: InputQueue,
    results: ResultStore,
    state: Arc<RwLock<BatchState>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    metrics: MetricsCollector,
}

impl BatchController {
    pub fn new(runner: PipelineRunner, queue: InputQueue, results: ResultStore) -> Self {
        Self {
            runner: Arc::new(runner),
            queue,
            results,
            state: Arc::new(RwLock::new(BatchState::default())),
            worker: Mutex::new(None),
            metrics: MetricsCollector::new(),
        }
    }

    /// Builds a controller backed by the external commands and directories
    /// of `config`.
    pub fn from_config(config: &PipelineConfig) -> Self {
        let cache = ResourceCache::with_shared_loader(Arc::new(CommandLoader::from_config(config)));
        let log = ProcessLog::new(&config.log_dir);
        let runner = PipelineRunner::new(config, Arc::new(cache), Arc::new(log));

        let mut results = ResultStore::new(&config.results_dir);
        if let Some(ttl) = config.result_ttl {
            results = results.with_default_ttl(ttl);
        }
        if let Some(grace) = config.download_grace {
            results = results.with_download_grace(grace);
        }

        Self::new(runner, InputQueue::new(&config.input_dir), results)
    }

    pub fn queue(&self) -> &InputQueue {
        &self.queue
    }

    pub fn results(&self) -> &ResultStore {
        &self.results
    }

    pub fn runner(&self) -> &PipelineRunner {
        &self.runner
    }

    /// Copies an uploaded video into the input directory.
    pub async fn enqueue(&self, source: &Path) -> Result<PathBuf, BatchError> {
        let queued = self.queue.enqueue(source).await?;
        self.metrics.set_queue_depth(self.queue.pending()?.len());
        Ok(queued)
    }

    /// Snapshots the pending inputs as the job list of a new batch.
    pub fn enqueue_all(&self, config: Arc<JobConfig>) -> Result<Vec<Job>, BatchError> {
        Ok(self.queue.snapshot(config)?)
    }

    /// Starts a batch over every pending input.
    ///
    /// Rejections leave the batch state untouched. Must be called within a
    /// tokio runtime.
    pub fn start(&self, config: JobConfig) -> Result<(), BatchError> {
        if self.is_processing() {
            return Err(BatchError::AlreadyRunning);
        }

        config.validate()?;
        let jobs = self.enqueue_all(Arc::new(config))?;
        if jobs.is_empty() {
            return Err(BatchError::EmptyQueue);
        }

        // Re-checked under the write lock; the snapshot above ran unlocked.
        let mut state = self.state.write().expect("batch state lock poisoned");
        if state.status == BatchStatus::Processing {
            return Err(BatchError::AlreadyRunning);
        }

        let forgotten = self.runner.cache().reset_failed();
        if forgotten > 0 {
            info!(count = forgotten, "Retrying previously failed resources");
        }

        let batch_id = Uuid::new_v4();
        *state = BatchState {
            batch_id: Some(batch_id),
            status: BatchStatus::Processing,
            progress: BatchProgress {
                step: 0,
                total: jobs.len() * TOTAL_STEPS,
                name: STARTING.to_string(),
                job: None,
            },
            queue: jobs.iter().map(Job::input_name).collect(),
            results: Vec::new(),
            error: None,
        };
        drop(state);

        info!(batch = %batch_id, jobs = jobs.len(), "Batch started");
        self.metrics.batch_started();
        self.metrics.set_queue_depth(jobs.len());

        let worker = BatchWorker {
            runner: Arc::clone(&self.runner),
            queue: self.queue.clone(),
            results: self.results.clone(),
            state: Arc::clone(&self.state),
            metrics: self.metrics.clone(),
        };
        let handle = tokio::spawn(worker.run(jobs));
        *self.worker.lock().expect("batch worker lock poisoned") = Some(handle);
        Ok(())
    }

    fn is_processing(&self) -> bool {
        self.state.read().expect("batch state lock poisoned").status == BatchStatus::Processing
    }

    /// Current batch state.
    ///
    /// While no batch is processing, `queue` lists the inputs waiting in the
    /// input directory.
    pub fn status(&self) -> BatchState {
        let mut snapshot = self
            .state
            .read()
            .expect("batch state lock poisoned")
            .clone();

        if snapshot.status != BatchStatus::Processing {
            match self.queue.names() {
                Ok(names) => snapshot.queue = names,
                Err(e) => warn!(error = %e, "Failed to list queued inputs"),
            }
        }
        snapshot
    }

    /// Waits for the running batch, if any, and returns its final state.
    pub async fn wait(&self) -> Result<BatchState, BatchError> {
        let handle = self.worker.lock().expect("batch worker lock poisoned").take();
        if let Some(handle) = handle {
            handle.await.map_err(|e| BatchError::Join(e.to_string()))?;
        }
        Ok(self.status())
    }
}

/// The single writer of [`BatchState`] while a batch runs.
struct BatchWorker {
    runner: Arc<PipelineRunner>,
    queue: InputQueue,
    results: ResultStore,
    state: Arc<RwLock<BatchState>>,
    metrics: MetricsCollector,
}

impl BatchWorker {
    async fn run(self, jobs: Vec<Job>) {
        let total = jobs.len() * TOTAL_STEPS;

        for (index, mut job) in jobs.into_iter().enumerate() {
            job.mark_running();

            // An archive from an earlier run of the same input must not
            // outlive this one.
            let archive = Packager::archive_name(&job.id);
            match self.results.discard(&archive) {
                Ok(true) => info!(job = %job.id, result = %archive, "Removed stale result"),
                Ok(false) => {}
                Err(e) => warn!(job = %job.id, error = %e, "Failed to remove stale result"),
            }

            let result = self.run_isolated(&job, index * TOTAL_STEPS, total).await;

            // The input is consumed whatever the outcome.
            if let Err(e) = self.queue.remove(&job.input).await {
                warn!(job = %job.id, error = %e, "Failed to remove consumed input");
            }

            match result {
                Ok(outcome) => {
                    let name = match self.results.register(&outcome.artifact) {
                        Ok(artifact) => artifact.name,
                        Err(e) => {
                            warn!(job = %job.id, error = %e, "Failed to register result");
                            outcome
                                .artifact
                                .file_name()
                                .map(|n| n.to_string_lossy().to_string())
                                .unwrap_or_default()
                        }
                    };
                    job.mark_completed(outcome.artifact);

                    let mut state = self.state.write().expect("batch state lock poisoned");
                    state.results.push(name);
                    state.queue.retain(|n| *n != job.input_name());
                    self.metrics.set_queue_depth(state.queue.len());
                    drop(state);

                    self.metrics.record_job("completed");
                    info!(
                        job = %job.id,
                        duration_secs = outcome.duration.as_secs_f64(),
                        "Job finished"
                    );
                }
                Err(e) => {
                    job.mark_failed(e.to_string());
                    error!(job = %job.id, error = %e, "Job failed, stopping batch");

                    let mut state = self.state.write().expect("batch state lock poisoned");
                    state.status = BatchStatus::Failed;
                    state.error = job.error.clone();
                    state.queue.retain(|n| *n != job.input_name());
                    self.metrics.set_queue_depth(state.queue.len());
                    drop(state);

                    self.metrics.record_job("failed");
                    self.metrics.batch_finished();
                    return;
                }
            }
        }

        let mut state = self.state.write().expect("batch state lock poisoned");
        state.status = BatchStatus::Completed;
        state.progress = BatchProgress {
            step: total,
            total,
            name: DONE.to_string(),
            job: None,
        };
        drop(state);

        self.metrics.batch_finished();
        info!("Batch completed");
    }

    /// Runs one job on its own task so that a panicking stage surfaces as
    /// [`RunError::Join`] instead of killing the worker.
    async fn run_isolated(
        &self,
        job: &Job,
        offset: usize,
        total: usize,
    ) -> Result<JobOutcome, RunError> {
        let runner = Arc::clone(&self.runner);
        let task_job = job.clone();
        let observer = BatchObserver {
            state: Arc::clone(&self.state),
            offset,
            total,
        };

        match tokio::spawn(async move { runner.run(&task_job, &observer).await }).await {
            Ok(result) => result,
            Err(e) => {
                let e = RunError::from(e);
                let log = self.runner.process_log();
                log.record(&format!("Job {} aborted: {}", job.id, e)).await;
                if let Err(rotate) = log.rotate(&job.id).await {
                    warn!(job = %job.id, error = %rotate, "Failed to rotate process log");
                }
                if let Err(cleanup) = self.runner.workdirs().destroy(&job.id).await {
                    warn!(job = %job.id, error = %cleanup, "Failed to remove working root");
                }
                Err(e)
            }
        }
    }
}

/// Folds per-job progress into batch-level progress.
struct BatchObserver {
    state: Arc<RwLock<BatchState>>,
    offset: usize,
    total: usize,
}

impl ProgressObserver for BatchObserver {
    fn on_progress(&self, update: &StageProgress) {
        let step = self.offset + update.step;
        let mut state = self.state.write().expect("batch state lock poisoned");
        if step < state.progress.step {
            return;
        }
        state.progress = BatchProgress {
            step,
            total: self.total,
            name: update.name.clone(),
            job: Some(update.job.clone()),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StageError;
    use crate::stages::{Stage, StageChain, StageContext, StageKind};
    use crate::storage::ResultError;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct OneFrame;

    #[async_trait]
    impl Stage for OneFrame {
        async fn run(
            &self,
            _input: &Path,
            output: &Path,
            _ctx: &StageContext,
        ) -> Result<PathBuf, StageError> {
            std::fs::create_dir_all(output)?;
            std::fs::write(output.join("frame_0001.png"), b"frame")?;
            Ok(output.to_path_buf())
        }
    }

    struct Panics;

    #[async_trait]
    impl Stage for Panics {
        async fn run(
            &self,
            _input: &Path,
            _output: &Path,
            _ctx: &StageContext,
        ) -> Result<PathBuf, StageError> {
            panic!("filter bug");
        }
    }

    struct Fails;

    #[async_trait]
    impl Stage for Fails {
        async fn run(
            &self,
            _input: &Path,
            _output: &Path,
            _ctx: &StageContext,
        ) -> Result<PathBuf, StageError> {
            Err(StageError::Other("ffmpeg exited with status 1".to_string()))
        }
    }

    fn controller(root: &Path) -> BatchController {
        controller_with(root, |chain| chain)
    }

    fn controller_with(root: &Path, customize: impl FnOnce(StageChain) -> StageChain) -> BatchController {
        let config = PipelineConfig::new().with_root(root).with_preload(false);
        let runner = PipelineRunner::new(
            &config,
            Arc::new(ResourceCache::new()),
            Arc::new(ProcessLog::new(&config.log_dir)),
        )
        .with_chain(customize(
            StageChain::standard(&config).replace(StageKind::FrameExtraction, Arc::new(OneFrame)),
        ));
        BatchController::new(
            runner,
            InputQueue::new(&config.input_dir),
            ResultStore::new(&config.results_dir),
        )
    }

    #[tokio::test]
    async fn test_start_rejects_empty_queue() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let controller = controller(dir.path());

        assert!(matches!(
            controller.start(JobConfig::default()),
            Err(BatchError::EmptyQueue)
        ));
        assert_eq!(controller.status().status, BatchStatus::Idle);
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let controller = controller(dir.path());
        let upload = dir.path().join("clip.mp4");
        std::fs::write(&upload, b"video").expect("write");
        controller.enqueue(&upload).await.expect("enqueue");

        let config = JobConfig::default().with_frames_per_second(0);
        assert!(matches!(
            controller.start(config),
            Err(BatchError::InvalidConfig(_))
        ));

        let state = controller.status();
        assert_eq!(state.status, BatchStatus::Idle);
        assert_eq!(state.queue, vec!["clip.mp4"]);
    }

    #[tokio::test]
    async fn test_batch_completes_and_consumes_inputs() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let controller = controller(dir.path());
        for name in ["a.mp4", "b.mp4"] {
            let upload = dir.path().join(name);
            std::fs::write(&upload, b"video").expect("write");
            controller.enqueue(&upload).await.expect("enqueue");
        }

        controller
            .start(JobConfig::default().skip_all())
            .expect("start");
        let state = controller.wait().await.expect("wait");

        assert_eq!(state.status, BatchStatus::Completed);
        assert_eq!(state.results, vec!["a.zip", "b.zip"]);
        assert!(state.queue.is_empty());
        assert_eq!(state.progress.step, 16);
        assert_eq!(state.progress.total, 16);
        assert_eq!(state.progress.name, DONE);
        assert_eq!(controller.results().current().as_deref(), Some("b.zip"));
        assert!(controller.queue().pending().expect("pending").is_empty());
    }

    #[tokio::test]
    async fn test_panicking_stage_fails_batch() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let controller =
            controller_with(dir.path(), |chain| chain.replace(StageKind::Filtering, Arc::new(Panics)));
        for name in ["a.mp4", "b.mp4"] {
            let upload = dir.path().join(name);
            std::fs::write(&upload, b"video").expect("write");
            controller.enqueue(&upload).await.expect("enqueue");
        }

        let config = JobConfig {
            skip_deduplication: true,
            ..JobConfig::default()
        };
        controller.start(config).expect("start");
        let state = controller.wait().await.expect("worker survives");

        assert_eq!(state.status, BatchStatus::Failed);
        assert!(state.error.as_deref().is_some_and(|e| e.contains("panicked")));
        assert_eq!(state.queue, vec!["b.mp4"]);
        assert!(!dir.path().join("input/a.mp4").exists());
        assert!(!controller.runner().workdirs().job_root("a").exists());

        let log = controller.runner().process_log().read().await.expect("read log");
        assert!(log.contains("Job a aborted"));

        // The controller accepts the next batch.
        controller
            .start(JobConfig::default().skip_all())
            .expect("restart after failure");
        let state = controller.wait().await.expect("wait");
        assert_eq!(state.status, BatchStatus::Completed);
        assert_eq!(state.results, vec!["b.zip"]);
    }

    #[tokio::test]
    async fn test_failed_job_does_not_serve_earlier_result() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let controller = controller_with(dir.path(), |chain| {
            chain.replace(StageKind::FrameExtraction, Arc::new(Fails))
        });
        std::fs::create_dir_all(dir.path().join("output")).expect("mkdir output");
        let earlier = dir.path().join("output/clip.zip");
        std::fs::write(&earlier, b"earlier run").expect("write zip");
        controller.results().register(&earlier).expect("register");

        let upload = dir.path().join("clip.mp4");
        std::fs::write(&upload, b"video").expect("write");
        controller.enqueue(&upload).await.expect("enqueue");

        controller.start(JobConfig::default()).expect("start");
        let state = controller.wait().await.expect("wait");

        assert_eq!(state.status, BatchStatus::Failed);
        assert!(!earlier.exists());
        assert!(controller.results().current().is_none());
        assert!(matches!(
            controller.results().resolve("clip.zip"),
            Err(ResultError::NotFound(_))
        ));
    }

    #[test]
    fn test_batch_state_serializes_snake_case() {
        let state = BatchState {
            status: BatchStatus::Processing,
            ..BatchState::default()
        };
        let json = serde_json::to_string(&state).expect("serialize");
        assert!(json.contains("\"status\":\"processing\""));
    }
}
