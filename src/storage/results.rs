//! Result artifact retention.
//!
//! Every packaged archive is registered here. An artifact may carry a
//! time-to-live; when it elapses the file is deleted and every later lookup
//! reports [`ResultError::NotFound`]. Downloading an artifact can shorten its
//! life to a grace period ("download then expire").
//!
//! # Example
//!
//! ```ignore
//! let store = ResultStore::new("output").with_default_ttl(Duration::from_secs(3600));
//! let artifact = store.register(&archive_path)?;
//! let path = store.deliver(&artifact.name)?;
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Errors returned by the result store.
#[derive(Debug, Error)]
pub enum ResultError {
    /// The artifact never existed, expired or was purged.
    #[error("Result '{0}' not found")]
    NotFound(String),

    /// The name cannot address a file in the results directory.
    #[error("Invalid result name '{0}'")]
    InvalidName(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A packaged archive known to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultArtifact {
    /// File name inside the results directory.
    pub name: String,
    /// Full path of the archive.
    pub path: PathBuf,
    /// When the archive was registered.
    pub created_at: DateTime<Utc>,
    /// When the archive will be deleted, if ever.
    pub expires_at: Option<DateTime<Utc>>,
}

struct Record {
    artifact: ResultArtifact,
    deadline: Option<Instant>,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

struct StoreInner {
    dir: PathBuf,
    default_ttl: Option<Duration>,
    download_grace: Option<Duration>,
    records: RwLock<HashMap<String, Record>>,
    current: RwLock<Option<String>>,
}

/// Tracks produced archives and their expiry.
///
/// Cloning yields another handle to the same store.
#[derive(Clone)]
pub struct ResultStore {
    inner: Arc<StoreInner>,
}

impl ResultStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                dir: dir.into(),
                default_ttl: None,
                download_grace: None,
                records: RwLock::new(HashMap::new()),
                current: RwLock::new(None),
            }),
        }
    }

    /// Builder method to arm a TTL on every registered artifact.
    ///
    /// Must be called before the store is shared.
    pub fn with_default_ttl(self, ttl: Duration) -> Self {
        self.reconfigure(|inner| inner.default_ttl = Some(ttl))
    }

    /// Builder method to expire artifacts `grace` after they are delivered.
    ///
    /// Must be called before the store is shared.
    pub fn with_download_grace(self, grace: Duration) -> Self {
        self.reconfigure(|inner| inner.download_grace = Some(grace))
    }

    fn reconfigure(self, apply: impl FnOnce(&mut StoreInner)) -> Self {
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                apply(&mut inner);
                Self {
                    inner: Arc::new(inner),
                }
            }
            Err(shared) => {
                warn!("Result store already shared, configuration change ignored");
                Self { inner: shared }
            }
        }
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Records a freshly packaged archive and makes it the current result.
    ///
    /// Arms the default TTL if one is configured. Must be called within a
    /// tokio runtime when a TTL applies.
    pub fn register(&self, path: &Path) -> Result<ResultArtifact, ResultError> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ResultError::InvalidName(path.display().to_string()))?
            .to_string();

        let artifact = ResultArtifact {
            name: name.clone(),
            path: path.to_path_buf(),
            created_at: Utc::now(),
            expires_at: None,
        };

        {
            let mut records = self.inner.records.write().expect("results lock poisoned");
            if let Some(old) = records.remove(&name) {
                if let Some(timer) = old.timer {
                    timer.abort();
                }
            }
            records.insert(
                name.clone(),
                Record {
                    artifact,
                    deadline: None,
                    generation: 0,
                    timer: None,
                },
            );
        }
        *self.inner.current.write().expect("current result lock poisoned") = Some(name.clone());

        if let Some(ttl) = self.inner.default_ttl {
            self.schedule_expiry(&name, ttl)?;
        }

        info!(result = %name, "Result registered");
        self.artifact(&name)
            .ok_or(ResultError::NotFound(name))
    }

    /// Arms a one-shot timer deleting `name` after `ttl`, replacing any
    /// earlier timer. Must be called within a tokio runtime.
    pub fn schedule_expiry(&self, name: &str, ttl: Duration) -> Result<(), ResultError> {
        let mut records = self.inner.records.write().expect("results lock poisoned");
        let record = records
            .get_mut(name)
            .ok_or_else(|| ResultError::NotFound(name.to_string()))?;

        if let Some(timer) = record.timer.take() {
            timer.abort();
        }

        let deadline = Instant::now() + ttl;
        record.generation += 1;
        record.deadline = Some(deadline);
        record.artifact.expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .map(|ttl| Utc::now() + ttl);

        let inner = Arc::clone(&self.inner);
        let key = name.to_string();
        let generation = record.generation;
        record.timer = Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            inner.expire(&key, Some(generation));
        }));

        debug!(result = %name, ttl_secs = ttl.as_secs_f64(), "Expiry scheduled");
        Ok(())
    }

    /// Time left before `name` expires; `None` if it has no TTL, is unknown or
    /// has already expired.
    pub fn remaining_ttl(&self, name: &str) -> Option<Duration> {
        let records = self.inner.records.read().expect("results lock poisoned");
        let deadline = records.get(name)?.deadline?;
        let now = Instant::now();
        (deadline > now).then(|| deadline - now)
    }

    /// Looks up a downloadable artifact.
    ///
    /// Archives left in the results directory by an earlier process are
    /// served too. Expired or purged artifacts are `NotFound`.
    pub fn resolve(&self, name: &str) -> Result<PathBuf, ResultError> {
        validate_name(name)?;

        let known = {
            let records = self.inner.records.read().expect("results lock poisoned");
            match records.get(name) {
                Some(record) if record.deadline.is_some_and(|d| d <= Instant::now()) => {
                    return Err(ResultError::NotFound(name.to_string()));
                }
                Some(record) => Some(record.artifact.path.clone()),
                None => None,
            }
        };

        let path = known.unwrap_or_else(|| self.inner.dir.join(name));
        if path.is_file() {
            Ok(path)
        } else {
            Err(ResultError::NotFound(name.to_string()))
        }
    }

    /// Resolves `name` for download and applies the download grace period.
    pub fn deliver(&self, name: &str) -> Result<PathBuf, ResultError> {
        let path = self.resolve(name)?;

        if let Some(grace) = self.inner.download_grace {
            let tracked = self
                .inner
                .records
                .read()
                .expect("results lock poisoned")
                .contains_key(name);
            if tracked {
                let shorter = self.remaining_ttl(name).map_or(true, |left| grace < left);
                if shorter {
                    self.schedule_expiry(name, grace)?;
                }
            }
        }

        info!(result = %name, "Result delivered");
        Ok(path)
    }

    /// Deletes every artifact whose deadline has passed. Returns how many
    /// were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let due: Vec<String> = self
            .inner
            .records
            .read()
            .expect("results lock poisoned")
            .iter()
            .filter(|(_, r)| r.deadline.is_some_and(|d| d <= now))
            .map(|(name, _)| name.clone())
            .collect();

        let mut removed = 0;
        for name in due {
            if self.inner.expire(&name, None) {
                removed += 1;
            }
        }
        removed
    }

    /// Forgets `name` and deletes its file, tracked or not.
    ///
    /// Returns whether a file was removed. A missing file is not an error.
    pub fn discard(&self, name: &str) -> Result<bool, ResultError> {
        validate_name(name)?;

        let record = self
            .inner
            .records
            .write()
            .expect("results lock poisoned")
            .remove(name);
        {
            let mut current = self.inner.current.write().expect("current result lock poisoned");
            if current.as_deref() == Some(name) {
                *current = None;
            }
        }

        let path = match record {
            Some(record) => {
                if let Some(timer) = record.timer {
                    timer.abort();
                }
                record.artifact.path
            }
            None => self.inner.dir.join(name),
        };

        match std::fs::remove_file(&path) {
            Ok(()) => {
                debug!(result = %name, "Result discarded");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Snapshot of one tracked artifact.
    pub fn artifact(&self, name: &str) -> Option<ResultArtifact> {
        self.inner
            .records
            .read()
            .expect("results lock poisoned")
            .get(name)
            .map(|r| r.artifact.clone())
    }

    /// Tracked artifacts sorted by name.
    pub fn list(&self) -> Vec<ResultArtifact> {
        let mut artifacts: Vec<ResultArtifact> = self
            .inner
            .records
            .read()
            .expect("results lock poisoned")
            .values()
            .map(|r| r.artifact.clone())
            .collect();
        artifacts.sort_by(|a, b| a.name.cmp(&b.name));
        artifacts
    }

    /// Name of the most recently registered artifact still alive.
    pub fn current(&self) -> Option<String> {
        self.inner
            .current
            .read()
            .expect("current result lock poisoned")
            .clone()
    }
}

impl StoreInner {
    /// Deletes an artifact. With `generation`, only if no newer expiry was
    /// scheduled since. Returns whether a record was removed.
    fn expire(&self, name: &str, generation: Option<u64>) -> bool {
        let path = {
            let mut records = self.records.write().expect("results lock poisoned");
            let matches = records
                .get(name)
                .is_some_and(|r| generation.map_or(true, |g| r.generation == g));
            if !matches {
                return false;
            }
            records.remove(name).map(|r| r.artifact.path)
        };

        {
            let mut current = self.current.write().expect("current result lock poisoned");
            if current.as_deref() == Some(name) {
                *current = None;
            }
        }

        if let Some(path) = path {
            match std::fs::remove_file(&path) {
                Ok(()) => info!(result = %name, "Result expired"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(result = %name, "Expired result already gone")
                }
                Err(e) => warn!(result = %name, error = %e, "Failed to delete expired result"),
            }
        }
        true
    }
}

fn validate_name(name: &str) -> Result<(), ResultError> {
    if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
        return Err(ResultError::InvalidName(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_archive(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, b"zip").expect("write archive");
        path
    }

    #[tokio::test]
    async fn test_register_and_resolve() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = ResultStore::new(dir.path());
        let path = write_archive(dir.path(), "clip.zip");

        let artifact = store.register(&path).expect("register");
        assert_eq!(artifact.name, "clip.zip");
        assert!(artifact.expires_at.is_none());
        assert_eq!(store.current().as_deref(), Some("clip.zip"));
        assert_eq!(store.resolve("clip.zip").expect("resolve"), path);
        assert!(store.remaining_ttl("clip.zip").is_none());
    }

    #[tokio::test]
    async fn test_unknown_and_invalid_names() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = ResultStore::new(dir.path());
        assert!(matches!(
            store.resolve("missing.zip"),
            Err(ResultError::NotFound(_))
        ));
        assert!(matches!(
            store.resolve("../etc/passwd"),
            Err(ResultError::InvalidName(_))
        ));
    }

    #[tokio::test]
    async fn test_untracked_file_on_disk_resolves() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = ResultStore::new(dir.path());
        write_archive(dir.path(), "old.zip");
        assert!(store.resolve("old.zip").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_discard_forgets_tracked_and_untracked() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = ResultStore::new(dir.path()).with_default_ttl(Duration::from_secs(60));
        let path = write_archive(dir.path(), "clip.zip");
        store.register(&path).expect("register");
        write_archive(dir.path(), "old.zip");

        assert!(store.discard("clip.zip").expect("discard tracked"));
        assert!(store.discard("old.zip").expect("discard untracked"));
        assert!(!store.discard("clip.zip").expect("discard again"));

        assert!(!path.exists());
        assert!(store.current().is_none());
        assert!(store.remaining_ttl("clip.zip").is_none());
        assert!(matches!(store.resolve("clip.zip"), Err(ResultError::NotFound(_))));
        assert!(matches!(store.resolve("old.zip"), Err(ResultError::NotFound(_))));
        assert!(matches!(
            store.discard("../clip.zip"),
            Err(ResultError::InvalidName(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_deletes_file_and_clears_current() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = ResultStore::new(dir.path()).with_default_ttl(Duration::from_secs(60));
        let path = write_archive(dir.path(), "clip.zip");

        let artifact = store.register(&path).expect("register");
        assert!(artifact.expires_at.is_some());
        let left = store.remaining_ttl("clip.zip").expect("ttl armed");
        assert!(left <= Duration::from_secs(60));

        tokio::time::sleep(Duration::from_secs(61)).await;
        tokio::task::yield_now().await;

        assert!(!path.exists());
        assert!(store.remaining_ttl("clip.zip").is_none());
        assert!(matches!(
            store.resolve("clip.zip"),
            Err(ResultError::NotFound(_))
        ));
        assert!(store.current().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_shortens_ttl() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = ResultStore::new(dir.path())
            .with_default_ttl(Duration::from_secs(3600))
            .with_download_grace(Duration::from_secs(5));
        let path = write_archive(dir.path(), "clip.zip");
        store.register(&path).expect("register");

        store.deliver("clip.zip").expect("deliver");
        let left = store.remaining_ttl("clip.zip").expect("ttl armed");
        assert!(left <= Duration::from_secs(5));

        tokio::time::sleep(Duration::from_secs(6)).await;
        tokio::task::yield_now().await;
        assert!(!path.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_file_at_expiry_is_not_an_error() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = ResultStore::new(dir.path());
        let path = write_archive(dir.path(), "clip.zip");
        store.register(&path).expect("register");
        store
            .schedule_expiry("clip.zip", Duration::from_secs(1))
            .expect("schedule");

        std::fs::remove_file(&path).expect("remove early");
        tokio::time::sleep(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;
        assert!(store.artifact("clip.zip").is_none());
    }

    #[tokio::test]
    async fn test_sweep_removes_due_records() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = ResultStore::new(dir.path());
        let path = write_archive(dir.path(), "clip.zip");
        store.register(&path).expect("register");
        store
            .schedule_expiry("clip.zip", Duration::ZERO)
            .expect("schedule");

        assert_eq!(store.sweep(), 1);
        assert_eq!(store.sweep(), 0);
        assert!(!path.exists());
        assert!(store.list().is_empty());
    }
}
