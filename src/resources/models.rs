//! Resource handle traits and their command-backed implementations.
//!
//! The handles are synchronous: stages call them from
//! `tokio::task::spawn_blocking`. Each default implementation drives an
//! external program configured through [`PipelineConfig`].

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Resource, ResourceKind, ResourceLoader};
use crate::error::{ResourceError, StageError};
use crate::pipeline::PipelineConfig;

/// A super-resolution model.
pub trait Upscaler: Send + Sync {
    /// Writes `input` enlarged by `factor` to `output`.
    fn upscale(&self, input: &Path, output: &Path, factor: u32) -> Result<(), StageError>;
}

/// A face detector operating on batches of images.
pub trait FaceDetector: Send + Sync {
    /// Returns one list of detections per input image, in input order.
    fn detect_batch(&self, images: &[PathBuf]) -> Result<Vec<Vec<Detection>>, StageError>;
}

/// An image tagger producing scored labels.
pub trait Tagger: Send + Sync {
    fn tag(&self, image: &Path) -> Result<Vec<Tag>, StageError>;
}

/// A detected face bounding box in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub confidence: f64,
}

/// A scored label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
    pub score: f64,
}

impl Tag {
    pub fn new(name: impl Into<String>, score: f64) -> Self {
        Self {
            name: name.into(),
            score,
        }
    }
}

/// Runs a command to completion and returns its stdout.
fn run_command(mut command: Command, program: &Path) -> Result<String, StageError> {
    let output = command.output().map_err(|e| StageError::CommandFailed {
        program: program.display().to_string(),
        reason: e.to_string(),
    })?;

    if !output.status.success() {
        return Err(StageError::CommandFailed {
            program: program.display().to_string(),
            reason: format!(
                "{}: {}",
                output.status,
                stderr_tail(&String::from_utf8_lossy(&output.stderr))
            ),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Last few lines of a command's stderr.
pub(crate) fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(5);
    lines[start..].join("\n")
}

/// Super-resolution through a `realesrgan-ncnn-vulkan` style command.
///
/// Invoked as `<program> -i <input> -o <output> -s <factor> -n <model>`.
#[derive(Debug, Clone)]
pub struct CommandUpscaler {
    program: PathBuf,
    model: String,
}

impl CommandUpscaler {
    pub fn new(program: impl Into<PathBuf>, model: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            model: model.into(),
        }
    }
}

impl Upscaler for CommandUpscaler {
    fn upscale(&self, input: &Path, output: &Path, factor: u32) -> Result<(), StageError> {
        let mut command = Command::new(&self.program);
        command
            .arg("-i")
            .arg(input)
            .arg("-o")
            .arg(output)
            .arg("-s")
            .arg(factor.to_string())
            .arg("-n")
            .arg(&self.model);

        run_command(command, &self.program)?;

        if !output.exists() {
            return Err(StageError::Inference(format!(
                "upscaler produced no output for '{}'",
                input.display()
            )));
        }
        Ok(())
    }
}

/// Face detection through an external command.
///
/// Invoked as `<program> <image>...`; prints one JSON array of detections per
/// input image, one line each, in argument order.
#[derive(Debug, Clone)]
pub struct CommandDetector {
    program: PathBuf,
}

impl CommandDetector {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl FaceDetector for CommandDetector {
    fn detect_batch(&self, images: &[PathBuf]) -> Result<Vec<Vec<Detection>>, StageError> {
        if images.is_empty() {
            return Ok(Vec::new());
        }

        let mut command = Command::new(&self.program);
        command.args(images);
        let stdout = run_command(command, &self.program)?;

        let detections = stdout
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(serde_json::from_str::<Vec<Detection>>)
            .collect::<Result<Vec<_>, _>>()?;

        if detections.len() != images.len() {
            return Err(StageError::Inference(format!(
                "detector returned {} results for {} images",
                detections.len(),
                images.len()
            )));
        }
        Ok(detections)
    }
}

/// Image tagging through an external command.
///
/// Invoked as `<program> <image>`; prints a JSON array of `{name, score}`.
#[derive(Debug, Clone)]
pub struct CommandTagger {
    program: PathBuf,
}

impl CommandTagger {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Tagger for CommandTagger {
    fn tag(&self, image: &Path) -> Result<Vec<Tag>, StageError> {
        let mut command = Command::new(&self.program);
        command.arg(image);
        let stdout = run_command(command, &self.program)?;
        Ok(serde_json::from_str(stdout.trim())?)
    }
}

/// Loads command-backed handles from the runtime configuration.
#[derive(Debug, Clone)]
pub struct CommandLoader {
    upscaler_cmd: Option<PathBuf>,
    upscaler_model: String,
    detector_cmd: Option<PathBuf>,
    tagger_cmd: Option<PathBuf>,
}

impl CommandLoader {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            upscaler_cmd: config.upscaler_cmd.clone(),
            upscaler_model: config.upscaler_model.clone(),
            detector_cmd: config.detector_cmd.clone(),
            tagger_cmd: config.tagger_cmd.clone(),
        }
    }

    fn command_for(&self, kind: ResourceKind) -> Result<PathBuf, ResourceError> {
        let (configured, variable) = match kind {
            ResourceKind::Upscaler => (&self.upscaler_cmd, "DSK_UPSCALER_CMD"),
            ResourceKind::Detector => (&self.detector_cmd, "DSK_DETECTOR_CMD"),
            ResourceKind::Tagger => (&self.tagger_cmd, "DSK_TAGGER_CMD"),
        };

        let program = configured.as_ref().ok_or_else(|| ResourceError::NotConfigured {
            name: kind.to_string(),
            reason: format!("{} is not set", variable),
        })?;

        locate_program(program).ok_or_else(|| ResourceError::LoadFailed {
            name: kind.to_string(),
            reason: format!("'{}' not found", program.display()),
        })
    }
}

#[async_trait]
impl ResourceLoader for CommandLoader {
    async fn load(&self, kind: ResourceKind) -> Result<Resource, ResourceError> {
        let program = self.command_for(kind)?;
        debug!(resource = %kind, program = %program.display(), "Using external command");

        Ok(match kind {
            ResourceKind::Upscaler => Resource::Upscaler(Arc::new(CommandUpscaler::new(
                program,
                self.upscaler_model.clone(),
            ))),
            ResourceKind::Detector => Resource::Detector(Arc::new(CommandDetector::new(program))),
            ResourceKind::Tagger => Resource::Tagger(Arc::new(CommandTagger::new(program))),
        })
    }
}

/// Resolves a program path, searching `PATH` for bare names.
fn locate_program(program: &Path) -> Option<PathBuf> {
    if program.components().count() > 1 {
        return program.is_file().then(|| program.to_path_buf());
    }

    std::env::var_os("PATH").and_then(|paths| {
        std::env::split_paths(&paths)
            .map(|dir| dir.join(program))
            .find(|candidate| candidate.is_file())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_stderr_tail_keeps_last_lines() {
        let stderr = (1..=8).map(|i| format!("line {}", i)).collect::<Vec<_>>().join("\n");
        let tail = stderr_tail(&stderr);
        assert!(tail.starts_with("line 4"));
        assert!(tail.ends_with("line 8"));
    }

    #[test]
    fn test_detection_deserializes() {
        let parsed: Vec<Detection> = serde_json::from_str(
            r#"[{"x": 10, "y": 20, "width": 30, "height": 40, "confidence": 0.9}]"#,
        )
        .expect("valid detection json");
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].width, 30);
    }

    #[tokio::test]
    async fn test_loader_not_configured() {
        let loader = CommandLoader::from_config(&PipelineConfig::default());
        let err = loader
            .load(ResourceKind::Tagger)
            .await
            .expect_err("tagger is not configured");
        assert!(matches!(err, ResourceError::NotConfigured { .. }));
        assert!(err.to_string().contains("DSK_TAGGER_CMD"));
    }

    #[tokio::test]
    async fn test_loader_missing_program() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut config = PipelineConfig::default();
        config.detector_cmd = Some(dir.path().join("no-such-detector"));

        let loader = CommandLoader::from_config(&config);
        let err = loader
            .load(ResourceKind::Detector)
            .await
            .expect_err("program does not exist");
        assert!(matches!(err, ResourceError::LoadFailed { .. }));
    }

    #[tokio::test]
    async fn test_loader_existing_program() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let program = dir.path().join("upscale");
        std::fs::write(&program, "#!/bin/sh\n").expect("write program");

        let mut config = PipelineConfig::default();
        config.upscaler_cmd = Some(program);

        let loader = CommandLoader::from_config(&config);
        let resource = loader
            .load(ResourceKind::Upscaler)
            .await
            .expect("program exists");
        assert_eq!(resource.kind(), ResourceKind::Upscaler);
    }
}
