//! Processing stages.
//!
//! Every stage implements the same contract: read an input (a video file for
//! frame extraction, a directory of frames for everything after it), write a
//! populated output directory, and never modify the input. The runner
//! knows stages only through the [`Stage`] trait and iterates a [`StageChain`]
//! of `(kind, stage)` pairs, so any implementation can be replaced.
//!
//! # Architecture
//!
//! ```text
//! video ─▶ FrameExtraction ─▶ Deduplication ─▶ Filtering ─▶ Upscaling
//!                                                              │
//!            Classification ◀─ Annotation ◀─ Cropping ◀────────┘
//! ```

pub mod annotation;
pub mod classification;
pub mod cropping;
pub mod deduplication;
pub mod filtering;
pub mod frame_extraction;
pub mod images;
pub mod upscaling;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StageError;
use crate::pipeline::{JobConfig, PipelineConfig};
use crate::resources::{JobResources, ResourceKind};

pub use annotation::AnnotationStage;
pub use classification::ClassificationStage;
pub use cropping::CroppingStage;
pub use deduplication::DeduplicationStage;
pub use filtering::FilteringStage;
pub use frame_extraction::FrameExtractionStage;
pub use upscaling::UpscalingStage;

/// Everything a stage may read besides its input.
pub struct StageContext {
    /// Identity of the job being processed.
    pub job_id: String,
    /// Stage parameters for the current batch.
    pub config: Arc<JobConfig>,
    /// Per-job view of the shared resources.
    pub resources: Arc<JobResources>,
}

impl StageContext {
    pub fn new(
        job_id: impl Into<String>,
        config: Arc<JobConfig>,
        resources: Arc<JobResources>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            config,
            resources,
        }
    }
}

/// A unit of work in the processing chain.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Consumes `input` and populates `output`, returning the output path.
    ///
    /// `output` is created if absent. An empty output is valid.
    async fn run(
        &self,
        input: &Path,
        output: &Path,
        ctx: &StageContext,
    ) -> Result<PathBuf, StageError>;
}

/// The stages of the fixed processing sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StageKind {
    FrameExtraction,
    Deduplication,
    Filtering,
    Upscaling,
    Cropping,
    Annotation,
    Classification,
}

impl StageKind {
    /// All stages in execution order.
    pub const ORDER: [StageKind; 7] = [
        StageKind::FrameExtraction,
        StageKind::Deduplication,
        StageKind::Filtering,
        StageKind::Upscaling,
        StageKind::Cropping,
        StageKind::Annotation,
        StageKind::Classification,
    ];

    /// 1-based position in the processing sequence.
    pub fn ordinal(&self) -> usize {
        match self {
            StageKind::FrameExtraction => 1,
            StageKind::Deduplication => 2,
            StageKind::Filtering => 3,
            StageKind::Upscaling => 4,
            StageKind::Cropping => 5,
            StageKind::Annotation => 6,
            StageKind::Classification => 7,
        }
    }

    /// Human-readable name reported in progress updates.
    pub fn display_name(&self) -> &'static str {
        match self {
            StageKind::FrameExtraction => "Frame Extraction",
            StageKind::Deduplication => "Deduplication",
            StageKind::Filtering => "Filtering",
            StageKind::Upscaling => "Upscaling",
            StageKind::Cropping => "Cropping",
            StageKind::Annotation => "Annotation",
            StageKind::Classification => "Classification",
        }
    }

    /// Directory-safe name.
    pub fn slug(&self) -> &'static str {
        match self {
            StageKind::FrameExtraction => "frames",
            StageKind::Deduplication => "dedup",
            StageKind::Filtering => "filtered",
            StageKind::Upscaling => "upscaled",
            StageKind::Cropping => "cropped",
            StageKind::Annotation => "annotated",
            StageKind::Classification => "classified",
        }
    }

    /// Whether the job configuration asks to skip this stage.
    ///
    /// Frame extraction cannot be skipped.
    pub fn is_skipped(&self, config: &JobConfig) -> bool {
        match self {
            StageKind::FrameExtraction => false,
            StageKind::Deduplication => config.skip_deduplication,
            StageKind::Filtering => config.skip_filtering,
            StageKind::Upscaling => config.skip_upscaling,
            StageKind::Cropping => config.skip_cropping,
            StageKind::Annotation => config.skip_annotation,
            StageKind::Classification => config.skip_classification,
        }
    }

    /// Shared resource the default implementation of this stage consumes.
    pub fn resource(&self) -> Option<ResourceKind> {
        match self {
            StageKind::Upscaling => Some(ResourceKind::Upscaler),
            StageKind::Cropping => Some(ResourceKind::Detector),
            StageKind::Annotation | StageKind::Classification => Some(ResourceKind::Tagger),
            _ => None,
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Ordered list of stages executed for every job.
#[derive(Clone)]
pub struct StageChain {
    stages: Vec<(StageKind, Arc<dyn Stage>)>,
}

impl StageChain {
    /// The default implementation of every stage.
    pub fn standard(config: &PipelineConfig) -> Self {
        Self {
            stages: vec![
                (
                    StageKind::FrameExtraction,
                    Arc::new(FrameExtractionStage::new(config.ffmpeg_bin.clone())),
                ),
                (StageKind::Deduplication, Arc::new(DeduplicationStage)),
                (StageKind::Filtering, Arc::new(FilteringStage)),
                (StageKind::Upscaling, Arc::new(UpscalingStage)),
                (StageKind::Cropping, Arc::new(CroppingStage)),
                (StageKind::Annotation, Arc::new(AnnotationStage)),
                (StageKind::Classification, Arc::new(ClassificationStage)),
            ],
        }
    }

    /// Replaces the implementation of one stage.
    pub fn replace(mut self, kind: StageKind, stage: Arc<dyn Stage>) -> Self {
        if let Some(entry) = self.stages.iter_mut().find(|(k, _)| *k == kind) {
            entry.1 = stage;
        }
        self
    }

    /// Stages in execution order.
    pub fn iter(&self) -> impl Iterator<Item = &(StageKind, Arc<dyn Stage>)> {
        self.stages.iter()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Resources needed by the stages that will actually run under `config`.
    pub fn required_resources(&self, config: &JobConfig) -> Vec<ResourceKind> {
        let mut kinds = Vec::new();
        for (kind, _) in &self.stages {
            if kind.is_skipped(config) {
                continue;
            }
            if let Some(resource) = kind.resource() {
                if !kinds.contains(&resource) {
                    kinds.push(resource);
                }
            }
        }
        kinds
    }
}

impl fmt::Debug for StageChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.stages.iter().map(|(kind, _)| kind))
            .finish()
    }
}
