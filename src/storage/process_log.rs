//! Line-oriented process log.
//!
//! Stage boundaries and job outcomes are appended to `<log_dir>/process.log`
//! as `"<rfc3339> - DSK - <message>"` lines. When a job ends the log is
//! compressed to `<log_dir>/<job>-<timestamp>.log.gz` and a fresh file is
//! started. [`ProcessLog::read`] serves the current log, or the most recent
//! rotation when nothing has been written since.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// File name of the live log.
pub const LOG_FILE: &str = "process.log";

const LEVEL_TAG: &str = "DSK";
const ROTATED_SUFFIX: &str = ".log.gz";

/// Errors that can occur while writing or reading the process log.
#[derive(Debug, Error)]
pub enum ProcessLogError {
    /// IO error on a log file.
    #[error("Process log IO error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ProcessLogError + '_ {
    move |source| ProcessLogError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Append-only process log with per-job rotation.
#[derive(Debug)]
pub struct ProcessLog {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl ProcessLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Path of the live log file.
    pub fn path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    /// Appends one timestamped line.
    pub async fn append(&self, message: &str) -> Result<(), ProcessLogError> {
        let _guard = self.write_lock.lock().await;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(io_err(&self.dir))?;

        let path = self.path();
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(io_err(&path))?;

        let line = format_line(message);
        file.write_all(line.as_bytes())
            .await
            .map_err(io_err(&path))?;
        file.flush().await.map_err(io_err(&path))?;
        Ok(())
    }

    /// Appends a line, logging instead of failing.
    pub async fn record(&self, message: &str) {
        if let Err(e) = self.append(message).await {
            tracing::warn!(error = %e, "Failed to write process log");
        }
    }

    /// Compresses the live log to `<job>-<timestamp>.log.gz` and truncates it.
    ///
    /// Returns `None` when there is nothing to rotate.
    pub async fn rotate(&self, job: &str) -> Result<Option<PathBuf>, ProcessLogError> {
        let _guard = self.write_lock.lock().await;
        let path = self.path();

        let content = match tokio::fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(ProcessLogError::Io { path, source }),
        };
        if content.is_empty() {
            return Ok(None);
        }

        let target = self.rotation_target(job);
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&content).map_err(io_err(&target))?;
        let compressed = encoder.finish().map_err(io_err(&target))?;

        tokio::fs::write(&target, compressed)
            .await
            .map_err(io_err(&target))?;
        tokio::fs::write(&path, b"").await.map_err(io_err(&path))?;

        Ok(Some(target))
    }

    fn rotation_target(&self, job: &str) -> PathBuf {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%3f");
        let mut target = self.dir.join(format!("{}-{}{}", job, stamp, ROTATED_SUFFIX));
        let mut n = 1;
        while target.exists() {
            target = self
                .dir
                .join(format!("{}-{}-{}{}", job, stamp, n, ROTATED_SUFFIX));
            n += 1;
        }
        target
    }

    /// Rotated logs, oldest first.
    pub async fn rotated(&self) -> Result<Vec<PathBuf>, ProcessLogError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(ProcessLogError::Io {
                    path: self.dir.clone(),
                    source,
                })
            }
        };

        let mut found = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err(&self.dir))? {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.ends_with(ROTATED_SUFFIX) {
                continue;
            }
            let modified = entry.metadata().await.and_then(|m| m.modified()).ok();
            found.push((modified, entry.path()));
        }

        found.sort();
        Ok(found.into_iter().map(|(_, path)| path).collect())
    }

    /// The live log as text, or the newest rotation if the live log is empty.
    pub async fn read(&self) -> Result<String, ProcessLogError> {
        let path = self.path();
        match tokio::fs::read_to_string(&path).await {
            Ok(content) if !content.is_empty() => return Ok(content),
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => return Err(ProcessLogError::Io { path, source }),
        }

        let Some(latest) = self.rotated().await?.pop() else {
            return Ok(String::new());
        };
        let compressed = tokio::fs::read(&latest).await.map_err(io_err(&latest))?;
        let mut text = String::new();
        GzDecoder::new(compressed.as_slice())
            .read_to_string(&mut text)
            .map_err(io_err(&latest))?;
        Ok(text)
    }
}

fn format_line(message: &str) -> String {
    format!(
        "{} - {} - {}\n",
        Utc::now().to_rfc3339(),
        LEVEL_TAG,
        message.replace('\n', " ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_line_format() {
        let line = format_line("Cropping started\nsecond line");
        assert!(line.contains(" - DSK - Cropping started second line"));
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        let stamp = line.split(" - ").next().expect("timestamp");
        assert!(chrono::DateTime::parse_from_rfc3339(stamp).is_ok());
    }

    #[tokio::test]
    async fn test_append_and_read() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let log = ProcessLog::new(dir.path().join("logs"));

        assert_eq!(log.read().await.expect("read empty"), "");

        log.append("Job clip started").await.expect("append");
        log.append("Frame Extraction started").await.expect("append");

        let text = log.read().await.expect("read");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("DSK - Job clip started"));
    }

    #[tokio::test]
    async fn test_rotate_compresses_and_truncates() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let log = ProcessLog::new(dir.path());

        assert!(log.rotate("clip").await.expect("rotate empty").is_none());

        log.append("Job clip failed").await.expect("append");
        let rotated = log
            .rotate("clip")
            .await
            .expect("rotate")
            .expect("something to rotate");

        let name = rotated
            .file_name()
            .and_then(|n| n.to_str())
            .expect("file name");
        assert!(name.starts_with("clip-"));
        assert!(name.ends_with(".log.gz"));
        assert_eq!(std::fs::read(log.path()).expect("read live log").len(), 0);

        // Live log is empty, so the newest rotation is served.
        assert!(log.read().await.expect("read").contains("Job clip failed"));

        log.append("Job next started").await.expect("append");
        let text = log.read().await.expect("read");
        assert!(text.contains("Job next started"));
        assert!(!text.contains("Job clip failed"));
    }

    #[tokio::test]
    async fn test_rotations_are_listed() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let log = ProcessLog::new(dir.path());
        log.append("one").await.expect("append");
        log.rotate("a").await.expect("rotate");
        log.append("two").await.expect("append");
        log.rotate("b").await.expect("rotate");

        assert_eq!(log.rotated().await.expect("list").len(), 2);
        assert!(log.read().await.expect("read").contains("two"));
    }
}
