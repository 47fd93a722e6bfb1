//! Job definitions for the batch scheduler.
//!
//! - `Job`: one uploaded video and everything needed to process it
//! - `JobStatus`: lifecycle state of a job

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pipeline::JobConfig;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A unit of work: one input video processed into one archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Identity derived from the uploaded file name; also names the working
    /// directory and the archive.
    pub id: String,
    /// The uploaded video.
    pub input: PathBuf,
    /// Stage parameters, shared by every job of a batch.
    pub config: Arc<JobConfig>,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// Packaged archive, once completed.
    #[serde(default)]
    pub artifact: Option<PathBuf>,
    /// Terminal error message, once failed.
    #[serde(default)]
    pub error: Option<String>,
}

impl Job {
    /// Creates a queued job for `input`.
    pub fn new(input: impl Into<PathBuf>, config: Arc<JobConfig>) -> Self {
        let input = input.into();
        Self {
            id: job_id_for(&input),
            input,
            config,
            status: JobStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            artifact: None,
            error: None,
        }
    }

    /// Builder method to override the derived identity.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// File name of the input as uploaded.
    pub fn input_name(&self) -> String {
        self.input
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.id.clone())
    }

    /// Caption label for this job.
    pub fn trigger_word(&self) -> &str {
        &self.config.trigger_word
    }

    pub fn mark_running(&mut self) {
        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_completed(&mut self, artifact: PathBuf) {
        self.status = JobStatus::Completed;
        self.finished_at = Some(Utc::now());
        self.artifact = Some(artifact);
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.finished_at = Some(Utc::now());
        self.error = Some(error.into());
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Derives a directory- and file-safe identity from an upload's file stem.
///
/// Characters other than ASCII alphanumerics, `-` and `_` become `_`.
pub fn job_id_for(input: &Path) -> String {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();

    let id: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if id.trim_matches('_').is_empty() {
        "job".to_string()
    } else {
        id
    }
}
