//! High-level metric recording for pipeline operations.
//!
//! The `MetricsCollector` wraps the raw Prometheus metrics so that callers do
//! not repeat label names. Recording before `init_metrics()` is a no-op.

use super::prometheus::{
    BATCHES_IN_PROGRESS, JOBS_TOTAL, QUEUE_DEPTH, RESOURCE_LOADS_TOTAL, STAGE_DURATION,
    STAGE_RUNS_TOTAL,
};

/// Outcome label for a stage execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    Completed,
    Skipped,
    Failed,
}

impl StageOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            StageOutcome::Completed => "completed",
            StageOutcome::Skipped => "skipped",
            StageOutcome::Failed => "failed",
        }
    }
}

/// Metrics collector for recording pipeline metrics.
///
/// # Example
///
/// ```ignore
/// use dataset_kurator::metrics::{init_metrics, MetricsCollector, StageOutcome};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
/// collector.record_stage("Cropping", StageOutcome::Completed, 4.2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Record one stage execution.
    pub fn record_stage(&self, stage: &str, outcome: StageOutcome, duration_secs: f64) {
        if let Some(runs) = STAGE_RUNS_TOTAL.get() {
            runs.with_label_values(&[stage, outcome.as_str()]).inc();
        }

        if outcome != StageOutcome::Skipped {
            if let Some(duration) = STAGE_DURATION.get() {
                duration.with_label_values(&[stage]).observe(duration_secs);
            }
        }

        tracing::trace!(
            stage = stage,
            outcome = outcome.as_str(),
            duration_secs = duration_secs,
            "Recorded stage metric"
        );
    }

    /// Record the final status of a job.
    pub fn record_job(&self, status: &str) {
        if let Some(jobs) = JOBS_TOTAL.get() {
            jobs.with_label_values(&[status]).inc();
        }
    }

    /// Set the number of jobs waiting in the current batch.
    pub fn set_queue_depth(&self, depth: usize) {
        if let Some(gauge) = QUEUE_DEPTH.get() {
            gauge.set(depth as f64);
        }
    }

    /// Mark a batch as started.
    pub fn batch_started(&self) {
        if let Some(gauge) = BATCHES_IN_PROGRESS.get() {
            gauge.inc();
        }
    }

    /// Mark a batch as finished.
    pub fn batch_finished(&self) {
        if let Some(gauge) = BATCHES_IN_PROGRESS.get() {
            gauge.dec();
        }
    }

    /// Record a shared resource load attempt.
    pub fn record_resource_load(&self, resource: &str, success: bool) {
        let outcome = if success { "ready" } else { "failed" };
        if let Some(loads) = RESOURCE_LOADS_TOTAL.get() {
            loads.with_label_values(&[resource, outcome]).inc();
        }
    }
}
