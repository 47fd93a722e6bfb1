//! Single-job pipeline execution.
//!
//! The `PipelineRunner` drives one job through the stage chain:
//!
//! ```text
//! Starting → Frame Extraction → Deduplication → Filtering → Upscaling
//!          → Cropping → Annotation → Classification → Packaging → Done
//! ```
//!
//! Each transition is reported to a [`ProgressObserver`] before the stage
//! runs. A stage's input directory is retired once the stage has produced its
//! output. Any stage error ends the job: the working root is removed and a
//! single [`RunError`] is returned.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{error, info, warn};

use super::config::PipelineConfig;
use super::packaging::{Packager, PackagingError};
use super::workdir::{WorkDirError, WorkDirManager};
use crate::error::StageError;
use crate::metrics::{MetricsCollector, StageOutcome};
use crate::resources::{JobResources, ResourceCache};
use crate::scheduler::Job;
use crate::stages::{StageChain, StageContext, StageKind};
use crate::storage::ProcessLog;

/// Number of reported steps per job: seven stages plus packaging.
pub const TOTAL_STEPS: usize = 8;

/// Name reported for the initial step.
pub const STARTING: &str = "Starting";

/// Name reported for the packaging step.
pub const PACKAGING: &str = "Packaging";

/// Errors that end a job.
#[derive(Debug, Error)]
pub enum RunError {
    /// A stage failed.
    #[error("Stage '{stage}' failed: {source}")]
    Stage {
        stage: StageKind,
        #[source]
        source: StageError,
    },

    /// Working directory management failed.
    #[error("Working directory error: {0}")]
    WorkDir(#[from] WorkDirError),

    /// Packaging failed.
    #[error("Packaging failed: {0}")]
    Packaging(#[from] PackagingError),

    /// A background task panicked or was cancelled.
    #[error("Background task failed: {0}")]
    Join(String),
}

impl From<tokio::task::JoinError> for RunError {
    fn from(err: tokio::task::JoinError) -> Self {
        RunError::Join(err.to_string())
    }
}

/// Per-job progress update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageProgress {
    pub job: String,
    /// 0 for [`STARTING`], 1..=8 afterwards.
    pub step: usize,
    pub total: usize,
    pub name: String,
}

/// Receives progress updates synchronously from the runner.
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, update: &StageProgress);

    /// Called once when the job fails, before cleanup.
    fn on_failure(&self, _job: &str, _step: &str, _error: &str) {}
}

/// Observer that ignores every update.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl ProgressObserver for NoopObserver {
    fn on_progress(&self, _update: &StageProgress) {}
}

/// Outcome of a successful job.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub job_id: String,
    /// The packaged archive.
    pub artifact: PathBuf,
    /// Stages that were skipped by configuration.
    pub skipped: Vec<StageKind>,
    pub duration: Duration,
}

/// Executes the stage chain for one job at a time.
pub struct PipelineRunner {
    workdirs: WorkDirManager,
    packager: Packager,
    chain: StageChain,
    cache: Arc<ResourceCache>,
    log: Arc<ProcessLog>,
    preload: bool,
    metrics: MetricsCollector,
}

impl PipelineRunner {
    /// Creates a runner with the default stage implementations.
    pub fn new(config: &PipelineConfig, cache: Arc<ResourceCache>, log: Arc<ProcessLog>) -> Self {
        Self {
            workdirs: WorkDirManager::new(&config.work_dir),
            packager: Packager::new(&config.results_dir),
            chain: StageChain::standard(config),
            cache,
            log,
            preload: config.preload,
            metrics: MetricsCollector::new(),
        }
    }

    /// Builder method to replace the stage chain.
    pub fn with_chain(mut self, chain: StageChain) -> Self {
        self.chain = chain;
        self
    }

    pub fn workdirs(&self) -> &WorkDirManager {
        &self.workdirs
    }

    pub fn cache(&self) -> &Arc<ResourceCache> {
        &self.cache
    }

    pub fn process_log(&self) -> &Arc<ProcessLog> {
        &self.log
    }

    /// Runs `job` to completion.
    ///
    /// The job's working root is removed on every exit path. The input video
    /// is left in place; the caller owns it.
    pub async fn run(
        &self,
        job: &Job,
        observer: &dyn ProgressObserver,
    ) -> Result<JobOutcome, RunError> {
        let started = Instant::now();
        let report = |step: usize, name: &str| {
            observer.on_progress(&StageProgress {
                job: job.id.clone(),
                step,
                total: TOTAL_STEPS,
                name: name.to_string(),
            });
        };

        report(0, STARTING);
        self.log.record(&format!("Job {} started", job.id)).await;
        info!(job = %job.id, input = %job.input.display(), "Job started");

        let result = self.execute(job, &report).await;

        let outcome = match result {
            Ok((artifact, skipped)) => {
                self.log.record(&format!("Job {} completed", job.id)).await;
                info!(job = %job.id, artifact = %artifact.display(), "Job completed");
                Ok(JobOutcome {
                    job_id: job.id.clone(),
                    artifact,
                    skipped,
                    duration: started.elapsed(),
                })
            }
            Err((step, e)) => {
                observer.on_failure(&job.id, &step, &e.to_string());
                self.log
                    .record(&format!("Job {} failed during {}: {}", job.id, step, e))
                    .await;
                error!(job = %job.id, step = %step, error = %e, "Job failed");
                Err(e)
            }
        };

        if let Err(e) = self.workdirs.destroy(&job.id).await {
            warn!(job = %job.id, error = %e, "Failed to remove working root");
        }
        if let Err(e) = self.log.rotate(&job.id).await {
            warn!(job = %job.id, error = %e, "Failed to rotate process log");
        }

        outcome
    }

    async fn execute(
        &self,
        job: &Job,
        report: &(dyn Fn(usize, &str) + Send + Sync),
    ) -> Result<(PathBuf, Vec<StageKind>), (String, RunError)> {
        let workdir_failure = |e: WorkDirError| (STARTING.to_string(), RunError::from(e));
        let _guard = self.workdirs.create(&job.id).await.map_err(workdir_failure)?;

        let packager = self.packager.clone();
        let job_id = job.id.clone();
        let stale = tokio::task::spawn_blocking(move || packager.discard(&job_id))
            .await
            .map_err(|e| (STARTING.to_string(), RunError::from(e)))?
            .map_err(|e| (STARTING.to_string(), RunError::from(e)))?;
        if stale {
            info!(job = %job.id, "Removed archive of an earlier run");
        }

        let resources = Arc::new(JobResources::new(Arc::clone(&self.cache)));
        if self.preload {
            let kinds = self.chain.required_resources(&job.config);
            let preloaded = self.cache.preload(&kinds).await;
            for (kind, reason) in &preloaded.failed {
                self.log
                    .record(&format!("Resource {} unavailable: {}", kind, reason))
                    .await;
            }
            resources.seed(&preloaded);
        }

        let ctx = StageContext::new(job.id.clone(), Arc::clone(&job.config), resources);
        let mut current = job.input.clone();
        let mut current_is_stage_dir = false;
        let mut skipped = Vec::new();

        for (kind, stage) in self.chain.iter() {
            let name = kind.display_name();
            report(kind.ordinal(), name);

            if kind.is_skipped(&job.config) {
                self.log.record(&format!("{} skipped", name)).await;
                self.metrics.record_stage(name, StageOutcome::Skipped, 0.0);
                skipped.push(*kind);
                continue;
            }

            let output = self.workdirs.stage_dir(&job.id, kind.ordinal(), kind.slug());
            self.log.record(&format!("{} started", name)).await;
            let stage_started = Instant::now();

            let produced = match stage.run(&current, &output, &ctx).await {
                Ok(produced) => produced,
                Err(source) => {
                    self.metrics.record_stage(
                        name,
                        StageOutcome::Failed,
                        stage_started.elapsed().as_secs_f64(),
                    );
                    return Err((
                        name.to_string(),
                        RunError::Stage {
                            stage: *kind,
                            source,
                        },
                    ));
                }
            };

            self.metrics.record_stage(
                name,
                StageOutcome::Completed,
                stage_started.elapsed().as_secs_f64(),
            );
            self.log.record(&format!("{} completed", name)).await;

            if current_is_stage_dir
                && produced != current
                && current.starts_with(self.workdirs.root())
            {
                self.workdirs
                    .retire(&current)
                    .await
                    .map_err(|e| (name.to_string(), RunError::from(e)))?;
            }
            current = produced;
            current_is_stage_dir = true;
        }

        report(TOTAL_STEPS, PACKAGING);
        self.log.record(&format!("{} started", PACKAGING)).await;

        let packager = self.packager.clone();
        let source = current.clone();
        let job_id = job.id.clone();
        let artifact = tokio::task::spawn_blocking(move || packager.package(&source, &job_id))
            .await
            .map_err(|e| (PACKAGING.to_string(), RunError::from(e)))?
            .map_err(|e| (PACKAGING.to_string(), RunError::from(e)))?;

        // The archive is already published; a stage result outside the work
        // root is left to its owner.
        if current.starts_with(self.workdirs.root()) {
            if let Err(e) = self.workdirs.retire(&current).await {
                warn!(job = %job.id, error = %e, "Failed to retire packaged dataset");
            }
        }
        self.log.record(&format!("{} completed", PACKAGING)).await;

        Ok((artifact, skipped))
    }
}
