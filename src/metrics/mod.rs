//! Prometheus-based metrics for the pipeline.
//!
//! # Example
//!
//! ```ignore
//! use dataset_kurator::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//! let collector = MetricsCollector::new();
//! collector.record_job("completed");
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::{MetricsCollector, StageOutcome};
pub use prometheus::{export_metrics, init_metrics};
