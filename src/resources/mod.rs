//! Lazily-initialized shared resources (model handles).
//!
//! Loading a super-resolution model, a face detector or a tagger is expensive,
//! so handles are created at most once per process and shared read-only by
//! every job. The [`ResourceCache`] owns the handles; stages only borrow them
//! for the duration of a call through a per-job [`JobResources`] view.
//!
//! # Lifecycle
//!
//! ```text
//! Unloaded ──load──▶ Loading ──ok──▶ Ready
//!                        │
//!                        └──err──▶ Failed ──reset_failed──▶ Unloaded
//! ```
//!
//! Failures are never fatal: a stage asking for an unavailable resource gets
//! [`Availability::Unavailable`] and switches to its documented fallback.

pub mod models;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::error::ResourceError;
use crate::metrics::MetricsCollector;

pub use models::{
    CommandDetector, CommandLoader, CommandTagger, CommandUpscaler, Detection, FaceDetector,
    Tag, Tagger, Upscaler,
};

/// Names of the shared resources known to the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Super-resolution model used by the upscaling stage.
    Upscaler,
    /// Face detector used by the cropping stage.
    Detector,
    /// Image tagger used by annotation and classification.
    Tagger,
}

impl ResourceKind {
    /// Every resource kind, in load order.
    pub const ALL: [ResourceKind; 3] = [
        ResourceKind::Upscaler,
        ResourceKind::Detector,
        ResourceKind::Tagger,
    ];

    /// Stable name used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Upscaler => "upscaler",
            ResourceKind::Detector => "detector",
            ResourceKind::Tagger => "tagger",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A loaded resource handle.
#[derive(Clone)]
pub enum Resource {
    Upscaler(Arc<dyn Upscaler>),
    Detector(Arc<dyn FaceDetector>),
    Tagger(Arc<dyn Tagger>),
}

impl Resource {
    /// The kind of this handle.
    pub fn kind(&self) -> ResourceKind {
        match self {
            Resource::Upscaler(_) => ResourceKind::Upscaler,
            Resource::Detector(_) => ResourceKind::Detector,
            Resource::Tagger(_) => ResourceKind::Tagger,
        }
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Resource({})", self.kind())
    }
}

/// Outcome of resolving a resource for one job.
#[derive(Debug, Clone)]
pub enum Availability<T> {
    /// The handle is loaded and may be used.
    Ready(T),
    /// The handle could not be loaded; the consumer must fall back.
    Unavailable(String),
}

impl<T> Availability<T> {
    /// Returns the handle if ready.
    pub fn ready(&self) -> Option<&T> {
        match self {
            Availability::Ready(handle) => Some(handle),
            Availability::Unavailable(_) => None,
        }
    }

    /// Whether the handle is ready.
    pub fn is_ready(&self) -> bool {
        matches!(self, Availability::Ready(_))
    }

    /// Reason the handle is unavailable, if it is.
    pub fn reason(&self) -> Option<&str> {
        match self {
            Availability::Ready(_) => None,
            Availability::Unavailable(reason) => Some(reason),
        }
    }
}

/// Initialization state of one cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryState {
    Unloaded,
    Loading,
    Ready,
    Failed,
}

/// Creates resource handles on demand.
#[async_trait]
pub trait ResourceLoader: Send + Sync {
    /// Loads the handle for `kind`. Called at most once per cache entry.
    async fn load(&self, kind: ResourceKind) -> Result<Resource, ResourceError>;
}

/// One cache entry. The cell guarantees a single initialization even under
/// concurrent first use.
#[derive(Default)]
struct Slot {
    cell: OnceCell<Result<Resource, ResourceError>>,
    loading: AtomicBool,
}

/// Summary of a [`ResourceCache::preload`] call.
#[derive(Debug, Clone, Default)]
pub struct PreloadReport {
    /// Resources that are ready.
    pub ready: Vec<ResourceKind>,
    /// Resources that failed, with the failure reason.
    pub failed: Vec<(ResourceKind, String)>,
}

impl PreloadReport {
    /// Whether every requested resource loaded.
    pub fn all_ready(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Process-wide cache of shared resource handles.
pub struct ResourceCache {
    loaders: HashMap<ResourceKind, Arc<dyn ResourceLoader>>,
    slots: RwLock<HashMap<ResourceKind, Arc<Slot>>>,
    load_counts: HashMap<ResourceKind, AtomicUsize>,
    metrics: MetricsCollector,
}

impl Default for ResourceCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceCache {
    /// Creates an empty cache with no loaders registered.
    pub fn new() -> Self {
        Self {
            loaders: HashMap::new(),
            slots: RwLock::new(HashMap::new()),
            load_counts: ResourceKind::ALL
                .iter()
                .map(|kind| (*kind, AtomicUsize::new(0)))
                .collect(),
            metrics: MetricsCollector::new(),
        }
    }

    /// Creates a cache using one loader for every resource kind.
    pub fn with_shared_loader(loader: Arc<dyn ResourceLoader>) -> Self {
        ResourceKind::ALL
            .iter()
            .fold(Self::new(), |cache, kind| {
                cache.with_loader(*kind, Arc::clone(&loader))
            })
    }

    /// Registers the loader for a resource kind.
    pub fn with_loader(mut self, kind: ResourceKind, loader: Arc<dyn ResourceLoader>) -> Self {
        self.loaders.insert(kind, loader);
        self
    }

    /// Returns the entry for `kind`, creating it if needed.
    fn slot(&self, kind: ResourceKind) -> Arc<Slot> {
        if let Some(slot) = self
            .slots
            .read()
            .expect("resource slots read lock poisoned")
            .get(&kind)
        {
            return Arc::clone(slot);
        }

        let mut slots = self.slots.write().expect("resource slots write lock poisoned");
        Arc::clone(slots.entry(kind).or_default())
    }

    fn existing_slot(&self, kind: ResourceKind) -> Option<Arc<Slot>> {
        self.slots
            .read()
            .expect("resource slots read lock poisoned")
            .get(&kind)
            .cloned()
    }

    /// Loads `kind` if it has not been loaded yet and returns the outcome.
    ///
    /// Concurrent callers for the same kind wait for a single load. A failed
    /// load is remembered until [`ResourceCache::reset_failed`].
    pub async fn load(&self, kind: ResourceKind) -> Result<Resource, ResourceError> {
        let Some(loader) = self.loaders.get(&kind).cloned() else {
            return Err(ResourceError::NoLoader(kind.to_string()));
        };

        let slot = self.slot(kind);
        let result = slot
            .cell
            .get_or_init(|| async {
                slot.loading.store(true, Ordering::SeqCst);
                if let Some(counter) = self.load_counts.get(&kind) {
                    counter.fetch_add(1, Ordering::SeqCst);
                }

                let result = loader.load(kind).await;
                match &result {
                    Ok(_) => {
                        info!(resource = %kind, "Resource loaded");
                        self.metrics.record_resource_load(kind.as_str(), true);
                    }
                    Err(e) => {
                        warn!(resource = %kind, error = %e, "Resource unavailable");
                        self.metrics.record_resource_load(kind.as_str(), false);
                    }
                }

                slot.loading.store(false, Ordering::SeqCst);
                result
            })
            .await;

        result.clone()
    }

    /// Eagerly loads every named resource.
    ///
    /// A failure for one resource never prevents loading the others.
    pub async fn preload(&self, kinds: &[ResourceKind]) -> PreloadReport {
        let mut report = PreloadReport::default();
        for kind in kinds {
            match self.load(*kind).await {
                Ok(_) => report.ready.push(*kind),
                Err(e) => report.failed.push((*kind, e.to_string())),
            }
        }
        report
    }

    /// Non-blocking lookup of a ready handle.
    ///
    /// Returns `None` if the resource was never requested, is still loading,
    /// or failed to load.
    pub fn get(&self, kind: ResourceKind) -> Option<Resource> {
        self.existing_slot(kind)
            .and_then(|slot| slot.cell.get().and_then(|r| r.as_ref().ok().cloned()))
    }

    /// Current initialization state of `kind`.
    pub fn state(&self, kind: ResourceKind) -> EntryState {
        let Some(slot) = self.existing_slot(kind) else {
            return EntryState::Unloaded;
        };

        match slot.cell.get() {
            Some(Ok(_)) => EntryState::Ready,
            Some(Err(_)) => EntryState::Failed,
            None if slot.loading.load(Ordering::SeqCst) => EntryState::Loading,
            None => EntryState::Unloaded,
        }
    }

    /// Number of times the loader for `kind` actually ran.
    pub fn load_count(&self, kind: ResourceKind) -> usize {
        self.load_counts
            .get(&kind)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Forgets failed entries so the next request retries them.
    ///
    /// Ready handles are kept.
    pub fn reset_failed(&self) -> usize {
        let mut slots = self.slots.write().expect("resource slots write lock poisoned");
        let before = slots.len();
        slots.retain(|_, slot| !matches!(slot.cell.get(), Some(Err(_))));
        before - slots.len()
    }
}

/// Per-job view of the resource cache.
///
/// Each resource is resolved at most once per job; later lookups within the
/// same job reuse the first answer.
pub struct JobResources {
    cache: Arc<ResourceCache>,
    resolved: Mutex<HashMap<ResourceKind, Availability<Resource>>>,
}

impl JobResources {
    /// Creates an unresolved view over `cache`.
    pub fn new(cache: Arc<ResourceCache>) -> Self {
        Self {
            cache,
            resolved: Mutex::new(HashMap::new()),
        }
    }

    /// Records the availability of every kind in a preload report.
    pub fn seed(&self, report: &PreloadReport) {
        let mut resolved = self.resolved.lock().expect("job resources lock poisoned");
        for kind in &report.ready {
            if let Some(resource) = self.cache.get(*kind) {
                resolved.insert(*kind, Availability::Ready(resource));
            }
        }
        for (kind, reason) in &report.failed {
            resolved.insert(*kind, Availability::Unavailable(reason.clone()));
        }
    }

    /// Resolves `kind`, loading it on first use.
    pub async fn resolve(&self, kind: ResourceKind) -> Availability<Resource> {
        if let Some(found) = self
            .resolved
            .lock()
            .expect("job resources lock poisoned")
            .get(&kind)
            .cloned()
        {
            return found;
        }

        let availability = match self.cache.load(kind).await {
            Ok(resource) => Availability::Ready(resource),
            Err(e) => Availability::Unavailable(e.to_string()),
        };

        self.resolved
            .lock()
            .expect("job resources lock poisoned")
            .insert(kind, availability.clone());
        availability
    }

    /// The upscaler handle for this job.
    pub async fn upscaler(&self) -> Availability<Arc<dyn Upscaler>> {
        match self.resolve(ResourceKind::Upscaler).await {
            Availability::Ready(Resource::Upscaler(handle)) => Availability::Ready(handle),
            Availability::Ready(other) => mismatched(ResourceKind::Upscaler, &other),
            Availability::Unavailable(reason) => Availability::Unavailable(reason),
        }
    }

    /// The face detector handle for this job.
    pub async fn detector(&self) -> Availability<Arc<dyn FaceDetector>> {
        match self.resolve(ResourceKind::Detector).await {
            Availability::Ready(Resource::Detector(handle)) => Availability::Ready(handle),
            Availability::Ready(other) => mismatched(ResourceKind::Detector, &other),
            Availability::Unavailable(reason) => Availability::Unavailable(reason),
        }
    }

    /// The tagger handle for this job.
    pub async fn tagger(&self) -> Availability<Arc<dyn Tagger>> {
        match self.resolve(ResourceKind::Tagger).await {
            Availability::Ready(Resource::Tagger(handle)) => Availability::Ready(handle),
            Availability::Ready(other) => mismatched(ResourceKind::Tagger, &other),
            Availability::Unavailable(reason) => Availability::Unavailable(reason),
        }
    }
}

fn mismatched<T>(expected: ResourceKind, got: &Resource) -> Availability<T> {
    Availability::Unavailable(format!(
        "loader for '{}' returned a '{}' handle",
        expected,
        got.kind()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StageError;
    use std::path::Path;
    use std::time::Duration;

    struct NoopTagger;

    impl Tagger for NoopTagger {
        fn tag(&self, _image: &Path) -> Result<Vec<Tag>, StageError> {
            Ok(Vec::new())
        }
    }

    struct SlowLoader {
        fail: bool,
    }

    #[async_trait]
    impl ResourceLoader for SlowLoader {
        async fn load(&self, kind: ResourceKind) -> Result<Resource, ResourceError> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.fail {
                return Err(ResourceError::LoadFailed {
                    name: kind.to_string(),
                    reason: "weights missing".to_string(),
                });
            }
            Ok(Resource::Tagger(Arc::new(NoopTagger)))
        }
    }

    #[test]
    fn test_resource_kind_names() {
        assert_eq!(ResourceKind::Upscaler.as_str(), "upscaler");
        assert_eq!(ResourceKind::Detector.to_string(), "detector");
        assert_eq!(ResourceKind::ALL.len(), 3);
    }

    #[tokio::test]
    async fn test_get_before_load_is_absent() {
        let cache = ResourceCache::new()
            .with_loader(ResourceKind::Tagger, Arc::new(SlowLoader { fail: false }));
        assert!(cache.get(ResourceKind::Tagger).is_none());
        assert_eq!(cache.state(ResourceKind::Tagger), EntryState::Unloaded);
    }

    #[tokio::test]
    async fn test_concurrent_first_use_loads_once() {
        let cache = Arc::new(
            ResourceCache::new()
                .with_loader(ResourceKind::Tagger, Arc::new(SlowLoader { fail: false })),
        );

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                cache.load(ResourceKind::Tagger).await.is_ok()
            }));
        }
        for handle in handles {
            assert!(handle.await.expect("task should not panic"));
        }

        assert_eq!(cache.load_count(ResourceKind::Tagger), 1);
        assert_eq!(cache.state(ResourceKind::Tagger), EntryState::Ready);
        assert!(cache.get(ResourceKind::Tagger).is_some());
    }

    #[tokio::test]
    async fn test_preload_failure_does_not_abort_others() {
        let cache = ResourceCache::new()
            .with_loader(ResourceKind::Upscaler, Arc::new(SlowLoader { fail: true }))
            .with_loader(ResourceKind::Tagger, Arc::new(SlowLoader { fail: false }));

        let report = cache
            .preload(&[
                ResourceKind::Upscaler,
                ResourceKind::Detector,
                ResourceKind::Tagger,
            ])
            .await;

        assert!(!report.all_ready());
        assert_eq!(report.ready, vec![ResourceKind::Tagger]);
        assert_eq!(report.failed.len(), 2);
        assert_eq!(cache.state(ResourceKind::Upscaler), EntryState::Failed);
        assert!(cache.get(ResourceKind::Upscaler).is_none());
        assert!(cache.get(ResourceKind::Tagger).is_some());
    }

    #[tokio::test]
    async fn test_failed_load_is_remembered_until_reset() {
        let cache = ResourceCache::new()
            .with_loader(ResourceKind::Detector, Arc::new(SlowLoader { fail: true }));

        assert!(cache.load(ResourceKind::Detector).await.is_err());
        assert!(cache.load(ResourceKind::Detector).await.is_err());
        assert_eq!(cache.load_count(ResourceKind::Detector), 1);

        assert_eq!(cache.reset_failed(), 1);
        assert_eq!(cache.state(ResourceKind::Detector), EntryState::Unloaded);

        assert!(cache.load(ResourceKind::Detector).await.is_err());
        assert_eq!(cache.load_count(ResourceKind::Detector), 2);
    }

    #[tokio::test]
    async fn test_job_resources_resolve_once_and_report_fallback() {
        let cache = Arc::new(
            ResourceCache::new()
                .with_loader(ResourceKind::Tagger, Arc::new(SlowLoader { fail: false })),
        );
        let resources = JobResources::new(Arc::clone(&cache));

        assert!(resources.tagger().await.is_ready());
        assert!(resources.tagger().await.is_ready());
        assert_eq!(cache.load_count(ResourceKind::Tagger), 1);

        let upscaler = resources.upscaler().await;
        assert!(!upscaler.is_ready());
        assert!(upscaler
            .reason()
            .expect("unavailable reason")
            .contains("No loader"));
    }

    #[tokio::test]
    async fn test_job_resources_detects_mismatched_handle() {
        let cache = Arc::new(
            ResourceCache::new()
                .with_loader(ResourceKind::Detector, Arc::new(SlowLoader { fail: false })),
        );
        let resources = JobResources::new(cache);
        let detector = resources.detector().await;
        assert!(!detector.is_ready());
        assert!(detector.reason().expect("reason").contains("tagger"));
    }
}
