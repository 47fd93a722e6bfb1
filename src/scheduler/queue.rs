//! Directory-backed input queue.
//!
//! Uploaded videos wait in the input directory. A batch takes a snapshot of
//! the directory when it starts; files added later wait for the next batch.
//! A file leaves the queue when its job has consumed it.
//!
//! Hidden files and in-progress copies (`*.part`) are never queued.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use super::job::Job;
use crate::pipeline::JobConfig;

const PARTIAL_SUFFIX: &str = ".part";

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The source of an upload is not a regular file.
    #[error("'{0}' is not a file")]
    NotAFile(PathBuf),

    /// A file with the same name is already waiting.
    #[error("'{0}' is already queued")]
    AlreadyQueued(String),

    /// IO error on the input directory.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Videos waiting in the input directory.
#[derive(Debug, Clone)]
pub struct InputQueue {
    dir: PathBuf,
}

impl InputQueue {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Pending input files, sorted by name.
    pub fn pending(&self) -> Result<Vec<PathBuf>, QueueError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || name.ends_with(PARTIAL_SUFFIX) {
                continue;
            }
            if entry.file_type()?.is_file() {
                files.push(entry.path());
            }
        }

        files.sort();
        Ok(files)
    }

    /// File names of the pending inputs.
    pub fn names(&self) -> Result<Vec<String>, QueueError> {
        Ok(self
            .pending()?
            .iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
            .collect())
    }

    /// Creates one queued job per pending input.
    ///
    /// Inputs whose derived identities collide get a numeric suffix so that
    /// their working directories and archives stay distinct.
    pub fn snapshot(&self, config: Arc<JobConfig>) -> Result<Vec<Job>, QueueError> {
        let mut taken: HashSet<String> = HashSet::new();
        let mut jobs = Vec::new();

        for input in self.pending()? {
            let mut job = Job::new(input, Arc::clone(&config));
            if !taken.insert(job.id.clone()) {
                let base = job.id.clone();
                let mut n = 2;
                while taken.contains(&format!("{}-{}", base, n)) {
                    n += 1;
                }
                job = job.with_id(format!("{}-{}", base, n));
                taken.insert(job.id.clone());
            }
            jobs.push(job);
        }

        debug!(count = jobs.len(), "Queue snapshot taken");
        Ok(jobs)
    }

    /// Copies an uploaded file into the input directory.
    ///
    /// The copy is written under a temporary name and renamed, so a batch
    /// never picks up a half-copied file.
    pub async fn enqueue(&self, source: &Path) -> Result<PathBuf, QueueError> {
        let metadata = tokio::fs::metadata(source)
            .await
            .map_err(|_| QueueError::NotAFile(source.to_path_buf()))?;
        if !metadata.is_file() {
            return Err(QueueError::NotAFile(source.to_path_buf()));
        }

        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| QueueError::NotAFile(source.to_path_buf()))?;

        tokio::fs::create_dir_all(&self.dir).await?;
        let target = self.dir.join(&name);
        if tokio::fs::try_exists(&target).await? {
            return Err(QueueError::AlreadyQueued(name));
        }

        let partial = self.dir.join(format!(".{}{}", name, PARTIAL_SUFFIX));
        tokio::fs::copy(source, &partial).await?;
        tokio::fs::rename(&partial, &target).await?;

        info!(file = %name, "Input queued");
        Ok(target)
    }

    /// Removes a consumed input. A missing file is a no-op.
    pub async fn remove(&self, input: &Path) -> Result<(), QueueError> {
        match tokio::fs::remove_file(input).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_pending_ignores_hidden_and_partial_files() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        std::fs::write(dir.path().join("b.mp4"), b"v").expect("write");
        std::fs::write(dir.path().join("a.mp4"), b"v").expect("write");
        std::fs::write(dir.path().join(".hidden.mp4"), b"v").expect("write");
        std::fs::write(dir.path().join("c.mp4.part"), b"v").expect("write");
        std::fs::create_dir(dir.path().join("subdir")).expect("mkdir");

        let queue = InputQueue::new(dir.path());
        assert_eq!(queue.names().expect("names"), vec!["a.mp4", "b.mp4"]);
    }

    #[test]
    fn test_missing_dir_is_empty_queue() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let queue = InputQueue::new(dir.path().join("nope"));
        assert!(queue.pending().expect("pending").is_empty());
    }

    #[test]
    fn test_snapshot_disambiguates_ids() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        std::fs::write(dir.path().join("clip.mkv"), b"v").expect("write");
        std::fs::write(dir.path().join("clip.mp4"), b"v").expect("write");
        std::fs::write(dir.path().join("other.mp4"), b"v").expect("write");

        let jobs = InputQueue::new(dir.path())
            .snapshot(Arc::new(JobConfig::default()))
            .expect("snapshot");
        let ids: Vec<&str> = jobs.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["clip", "clip-2", "other"]);
    }

    #[tokio::test]
    async fn test_enqueue_copies_and_rejects_duplicates() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let upload = dir.path().join("upload.mp4");
        std::fs::write(&upload, b"video").expect("write");

        let queue = InputQueue::new(dir.path().join("input"));
        let queued = queue.enqueue(&upload).await.expect("enqueue");
        assert_eq!(queued, dir.path().join("input/upload.mp4"));
        assert!(upload.exists());
        assert_eq!(queue.names().expect("names"), vec!["upload.mp4"]);

        assert!(matches!(
            queue.enqueue(&upload).await,
            Err(QueueError::AlreadyQueued(_))
        ));
        assert!(matches!(
            queue.enqueue(dir.path()).await,
            Err(QueueError::NotAFile(_))
        ));

        queue.remove(&queued).await.expect("remove");
        queue.remove(&queued).await.expect("remove missing is a no-op");
        assert!(queue.names().expect("names").is_empty());
    }
}
