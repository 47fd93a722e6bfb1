//! Frame extraction via ffmpeg.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use super::{Stage, StageContext};
use crate::error::StageError;
use crate::resources::models::stderr_tail;

/// Samples frames from a video at `frames_per_second`.
///
/// Runs `ffmpeg -i <video> -vf fps=<n> <out>/frame_%04d.png`.
#[derive(Debug, Clone)]
pub struct FrameExtractionStage {
    ffmpeg_bin: String,
}

impl FrameExtractionStage {
    pub fn new(ffmpeg_bin: impl Into<String>) -> Self {
        Self {
            ffmpeg_bin: ffmpeg_bin.into(),
        }
    }
}

impl Default for FrameExtractionStage {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

#[async_trait]
impl Stage for FrameExtractionStage {
    async fn run(
        &self,
        input: &Path,
        output: &Path,
        ctx: &StageContext,
    ) -> Result<PathBuf, StageError> {
        if !input.is_file() {
            return Err(StageError::MissingInput(input.to_path_buf()));
        }
        tokio::fs::create_dir_all(output).await?;

        let fps = ctx.config.frames_per_second;
        debug!(video = %input.display(), fps = fps, "Running ffmpeg");

        let result = Command::new(&self.ffmpeg_bin)
            .arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-i")
            .arg(input)
            .arg("-vf")
            .arg(format!("fps={}", fps))
            .arg(output.join("frame_%04d.png"))
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| StageError::CommandFailed {
                program: self.ffmpeg_bin.clone(),
                reason: e.to_string(),
            })?;

        if !result.status.success() {
            return Err(StageError::CommandFailed {
                program: self.ffmpeg_bin.clone(),
                reason: format!(
                    "{}: {}",
                    result.status,
                    stderr_tail(&String::from_utf8_lossy(&result.stderr))
                ),
            });
        }

        let mut count = 0usize;
        let mut entries = tokio::fs::read_dir(output).await?;
        while entries.next_entry().await?.is_some() {
            count += 1;
        }
        info!(job = %ctx.job_id, frames = count, "Frames extracted");

        Ok(output.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::JobConfig;
    use crate::resources::{JobResources, ResourceCache};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn context() -> StageContext {
        StageContext::new(
            "clip",
            Arc::new(JobConfig::default()),
            Arc::new(JobResources::new(Arc::new(ResourceCache::new()))),
        )
    }

    #[tokio::test]
    async fn test_missing_video() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let stage = FrameExtractionStage::default();
        let result = stage
            .run(&dir.path().join("nope.mp4"), &dir.path().join("out"), &context())
            .await;
        assert!(matches!(result, Err(StageError::MissingInput(_))));
    }

    #[tokio::test]
    async fn test_missing_ffmpeg_binary() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let video = dir.path().join("clip.mp4");
        std::fs::write(&video, b"not a video").expect("write video");

        let stage = FrameExtractionStage::new(
            dir.path().join("no-ffmpeg").to_string_lossy().to_string(),
        );
        let result = stage.run(&video, &dir.path().join("out"), &context()).await;
        assert!(matches!(result, Err(StageError::CommandFailed { .. })));
    }

    #[cfg(unix)]
    fn write_script(path: &Path, body: &str) {
        use std::os::unix::fs::PermissionsExt;
        std::fs::write(path, format!("#!/bin/sh\n{}\n", body)).expect("write script");
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
            .expect("chmod script");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_ffmpeg_failure_carries_stderr() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let video = dir.path().join("clip.mp4");
        std::fs::write(&video, b"x").expect("write video");
        let script = dir.path().join("ffmpeg");
        write_script(&script, "echo 'Invalid data found' >&2\nexit 1");

        let stage = FrameExtractionStage::new(script.to_string_lossy().to_string());
        let err = stage
            .run(&video, &dir.path().join("out"), &context())
            .await
            .expect_err("ffmpeg exits non-zero");
        assert!(err.to_string().contains("Invalid data found"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_ffmpeg_success_populates_output() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let video = dir.path().join("clip.mp4");
        std::fs::write(&video, b"x").expect("write video");
        let script = dir.path().join("ffmpeg");
        write_script(
            &script,
            "for last; do :; done\nout=$(dirname \"$last\")\nprintf x > \"$out/frame_0001.png\"",
        );

        let out = dir.path().join("out");
        let stage = FrameExtractionStage::new(script.to_string_lossy().to_string());
        let produced = stage
            .run(&video, &out, &context())
            .await
            .expect("fake ffmpeg succeeds");
        assert_eq!(produced, out);
        assert!(out.join("frame_0001.png").exists());
        assert!(video.exists());
    }
}
