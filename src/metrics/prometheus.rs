//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by dataset-kurator and
//! provides functions for initializing, registering, and exporting metrics.

use prometheus::{CounterVec, Encoder, Gauge, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Global Prometheus registry for all dataset-kurator metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Stage executions, labeled by stage and outcome (completed, skipped, failed).
pub static STAGE_RUNS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Stage execution duration in seconds, labeled by stage.
pub static STAGE_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Jobs processed, labeled by final status.
pub static JOBS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Number of jobs waiting in the current batch.
pub static QUEUE_DEPTH: OnceLock<Gauge> = OnceLock::new();

/// Number of batches currently processing (0 or 1).
pub static BATCHES_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Resource loads, labeled by resource and outcome.
pub static RESOURCE_LOADS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// This function should be called once at application startup. Calling it
/// again is harmless: the first registry stays in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Stage metrics
    let stage_runs_total = CounterVec::new(
        Opts::new("kurator_stage_runs_total", "Total number of stage executions"),
        &["stage", "outcome"],
    )?;

    let stage_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "kurator_stage_duration_seconds",
            "Stage execution duration in seconds",
        )
        .buckets(vec![0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0]),
        &["stage"],
    )?;

    // Job and batch metrics
    let jobs_total = CounterVec::new(
        Opts::new("kurator_jobs_total", "Total number of jobs processed"),
        &["status"],
    )?;

    let queue_depth = Gauge::new(
        "kurator_queue_depth",
        "Number of jobs waiting in the current batch",
    )?;

    let batches_in_progress = Gauge::new(
        "kurator_batches_in_progress",
        "Number of batches currently processing",
    )?;

    // Resource metrics
    let resource_loads_total = CounterVec::new(
        Opts::new("kurator_resource_loads_total", "Total shared resource loads"),
        &["resource", "outcome"],
    )?;

    registry.register(Box::new(stage_runs_total.clone()))?;
    registry.register(Box::new(stage_duration.clone()))?;
    registry.register(Box::new(jobs_total.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(batches_in_progress.clone()))?;
    registry.register(Box::new(resource_loads_total.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = STAGE_RUNS_TOTAL.set(stage_runs_total);
    let _ = STAGE_DURATION.set(stage_duration);
    let _ = JOBS_TOTAL.set(jobs_total);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = BATCHES_IN_PROGRESS.set(batches_in_progress);
    let _ = RESOURCE_LOADS_TOTAL.set(resource_loads_total);

    tracing::debug!("Prometheus metrics initialized");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// If the registry has not been initialized or encoding fails, returns a
/// comment line describing the problem.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        let result = init_metrics();
        assert!(result.is_ok() || REGISTRY.get().is_some());
    }

    #[test]
    fn test_metrics_after_init() {
        let _ = init_metrics();

        let metrics = export_metrics();
        assert!(!metrics.is_empty());
        if REGISTRY.get().is_some() {
            assert!(!metrics.starts_with("# Error"));
        }
    }
}
