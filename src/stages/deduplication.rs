//! Near-duplicate frame removal using a gradient perceptual hash.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use image_hasher::{HashAlg, Hasher, HasherConfig, ImageHash};
use tracing::info;

use super::images::{copy_as_png, ensure_input, list_frames, load_image, png_name};
use super::{Stage, StageContext};
use crate::error::StageError;

/// Hash edge length; 8x8 gives a 64-bit hash.
const HASH_SIZE: u32 = 8;

/// Keeps the first frame of every group of visually similar frames.
///
/// Frames are visited in name order. A frame whose hash is within
/// `dedup_threshold` bits of any kept frame is dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeduplicationStage;

#[async_trait]
impl Stage for DeduplicationStage {
    async fn run(
        &self,
        input: &Path,
        output: &Path,
        ctx: &StageContext,
    ) -> Result<PathBuf, StageError> {
        ensure_input(input)?;
        let src = input.to_path_buf();
        let dest = output.to_path_buf();
        let threshold = ctx.config.dedup_threshold;

        let (kept, dropped) =
            tokio::task::spawn_blocking(move || deduplicate(&src, &dest, threshold)).await??;

        info!(job = %ctx.job_id, kept = kept, dropped = dropped, "Deduplication finished");
        Ok(output.to_path_buf())
    }
}

/// Gradient (difference) hasher shared by every frame of a run.
pub fn frame_hasher() -> Hasher {
    HasherConfig::new()
        .hash_alg(HashAlg::Gradient)
        .hash_size(HASH_SIZE, HASH_SIZE)
        .to_hasher()
}

fn deduplicate(input: &Path, output: &Path, threshold: u32) -> Result<(usize, usize), StageError> {
    std::fs::create_dir_all(output)?;

    let hasher = frame_hasher();
    let mut kept_hashes: Vec<ImageHash> = Vec::new();
    let mut dropped = 0usize;

    for frame in list_frames(input)? {
        let hash = hasher.hash_image(&load_image(&frame.path)?);
        if kept_hashes.iter().any(|kept| kept.dist(&hash) <= threshold) {
            dropped += 1;
            continue;
        }

        copy_as_png(&frame.path, &output.join(png_name(frame.stem())))?;
        kept_hashes.push(hash);
    }

    Ok((kept_hashes.len(), dropped))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::JobConfig;
    use crate::resources::{JobResources, ResourceCache};
    use crate::stages::images::fixtures::{textured, Pattern};
    use image::DynamicImage;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn context(config: JobConfig) -> StageContext {
        StageContext::new(
            "clip",
            Arc::new(config),
            Arc::new(JobResources::new(Arc::new(ResourceCache::new()))),
        )
    }

    #[test]
    fn test_hash_separates_patterns() {
        let hasher = frame_hasher();
        let hash = |pattern, width, height| {
            hasher.hash_image(&DynamicImage::ImageRgb8(textured(pattern, width, height)))
        };
        let rising = hash(Pattern::Rising, 180, 160);
        let falling = hash(Pattern::Falling, 180, 160);
        let rising_large = hash(Pattern::Rising, 360, 320);

        assert_eq!(rising.as_bytes().len() * 8, 64);
        assert!(rising.dist(&falling) > 32);
        assert!(rising.dist(&rising_large) <= 8);
    }

    #[tokio::test]
    async fn test_duplicates_are_dropped() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let input = dir.path().join("frames");
        std::fs::create_dir(&input).expect("mkdir");

        textured(Pattern::Rising, 180, 160)
            .save(input.join("frame_0001.png"))
            .expect("write frame");
        textured(Pattern::Rising, 180, 160)
            .save(input.join("frame_0002.png"))
            .expect("write frame");
        textured(Pattern::Falling, 180, 160)
            .save(input.join("frame_0003.png"))
            .expect("write frame");

        let output = dir.path().join("dedup");
        let produced = DeduplicationStage
            .run(&input, &output, &context(JobConfig::default()))
            .await
            .expect("dedup succeeds");

        assert_eq!(produced, output);
        assert!(output.join("frame_0001.png").exists());
        assert!(!output.join("frame_0002.png").exists());
        assert!(output.join("frame_0003.png").exists());
        // Input untouched
        assert_eq!(std::fs::read_dir(&input).expect("read input").count(), 3);
    }

    #[tokio::test]
    async fn test_empty_input_yields_empty_output() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let input = dir.path().join("frames");
        std::fs::create_dir(&input).expect("mkdir");

        let output = dir.path().join("dedup");
        DeduplicationStage
            .run(&input, &output, &context(JobConfig::default()))
            .await
            .expect("empty input is valid");
        assert!(output.is_dir());
        assert_eq!(std::fs::read_dir(&output).expect("read output").count(), 0);
    }
}
