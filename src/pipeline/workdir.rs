//! Per-job working directories.
//!
//! Every job gets a working root `<work_dir>/<job_id>`; each stage writes to a
//! subdirectory `<ordinal>_<slug>` of it. A stage's input directory is retired
//! as soon as the next stage has produced its output, so at most two stage
//! directories exist at once. The root itself is removed when the job ends,
//! including on panic through [`WorkTreeGuard`].

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

/// Errors raised while managing working directories.
#[derive(Debug, Error)]
pub enum WorkDirError {
    /// Refused to delete a path outside the working root.
    #[error("Refusing to delete '{0}': not inside the working directory")]
    OutsideRoot(PathBuf),

    /// The job id cannot be used as a directory name.
    #[error("Invalid job id '{0}'")]
    InvalidJobId(String),

    /// Filesystem operation failed.
    #[error("IO error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Owns the layout of working directories below one root.
#[derive(Debug, Clone)]
pub struct WorkDirManager {
    root: PathBuf,
}

impl WorkDirManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Working root of `job_id`.
    pub fn job_root(&self, job_id: &str) -> PathBuf {
        self.root.join(job_id)
    }

    /// Deterministic directory for one stage of one job.
    pub fn stage_dir(&self, job_id: &str, ordinal: usize, name: &str) -> PathBuf {
        self.job_root(job_id).join(format!("{:02}_{}", ordinal, name))
    }

    /// Creates the working root of `job_id`, clearing leftovers of an earlier
    /// run, and returns a guard that removes it when dropped.
    pub async fn create(&self, job_id: &str) -> Result<WorkTreeGuard, WorkDirError> {
        if job_id.is_empty() || job_id.contains(['/', '\\']) || job_id == "." || job_id == ".." {
            return Err(WorkDirError::InvalidJobId(job_id.to_string()));
        }

        let path = self.job_root(job_id);
        remove_tree(&path).await?;
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|source| WorkDirError::Io {
                path: path.clone(),
                source,
            })?;

        debug!(path = %path.display(), "Created working root");
        Ok(WorkTreeGuard { path })
    }

    /// Deletes a consumed stage directory. A missing directory is a no-op.
    pub async fn retire(&self, path: &Path) -> Result<(), WorkDirError> {
        if !path.starts_with(&self.root) || path == self.root {
            return Err(WorkDirError::OutsideRoot(path.to_path_buf()));
        }
        remove_tree(path).await
    }

    /// Deletes the working root of `job_id`. A missing root is a no-op.
    pub async fn destroy(&self, job_id: &str) -> Result<(), WorkDirError> {
        remove_tree(&self.job_root(job_id)).await
    }

    /// Stage directories currently on disk for `job_id`.
    pub fn live_stage_dirs(&self, job_id: &str) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(self.job_root(job_id)) else {
            return Vec::new();
        };

        let mut dirs: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        dirs.sort();
        dirs
    }
}

async fn remove_tree(path: &Path) -> Result<(), WorkDirError> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(WorkDirError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Removes a job's working root when dropped.
#[derive(Debug)]
pub struct WorkTreeGuard {
    path: PathBuf,
}

impl WorkTreeGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkTreeGuard {
    fn drop(&mut self) {
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed working root"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove working root"),
        }
    }
}
