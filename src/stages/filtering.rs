//! Quality filtering of blurry or underexposed frames.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use image::GrayImage;
use tracing::{debug, info};

use super::images::{copy_as_png, ensure_input, list_frames, load_image, png_name};
use super::{Stage, StageContext};
use crate::error::StageError;

/// Drops frames that are too blurry or too dark. Nested input directories are
/// flattened into the output.
#[derive(Debug, Clone, Copy, Default)]
pub struct FilteringStage;

/// Quality measurements of one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameQuality {
    /// Variance of the 4-neighbour Laplacian; low values mean blur.
    pub sharpness: f64,
    /// Mean luma in `0.0..=255.0`.
    pub brightness: f64,
}

impl FrameQuality {
    pub fn measure(gray: &GrayImage) -> Self {
        Self {
            sharpness: laplacian_variance(gray),
            brightness: mean_luma(gray),
        }
    }

    pub fn passes(&self, blur_variance_min: f64, brightness_min: f64) -> bool {
        self.sharpness >= blur_variance_min && self.brightness >= brightness_min
    }
}

#[async_trait]
impl Stage for FilteringStage {
    async fn run(
        &self,
        input: &Path,
        output: &Path,
        ctx: &StageContext,
    ) -> Result<PathBuf, StageError> {
        ensure_input(input)?;
        let src = input.to_path_buf();
        let dest = output.to_path_buf();
        let blur_min = ctx.config.blur_variance_min;
        let brightness_min = ctx.config.brightness_min;

        let (kept, dropped) = tokio::task::spawn_blocking(move || {
            filter_frames(&src, &dest, blur_min, brightness_min)
        })
        .await??;

        info!(job = %ctx.job_id, kept = kept, dropped = dropped, "Filtering finished");
        Ok(output.to_path_buf())
    }
}

fn filter_frames(
    input: &Path,
    output: &Path,
    blur_min: f64,
    brightness_min: f64,
) -> Result<(usize, usize), StageError> {
    std::fs::create_dir_all(output)?;
    let mut kept = 0usize;
    let mut dropped = 0usize;

    for frame in list_frames(input)? {
        let quality = FrameQuality::measure(&load_image(&frame.path)?.to_luma8());
        if !quality.passes(blur_min, brightness_min) {
            debug!(
                frame = %frame.flat_name,
                sharpness = quality.sharpness,
                brightness = quality.brightness,
                "Frame rejected"
            );
            dropped += 1;
            continue;
        }

        copy_as_png(&frame.path, &output.join(png_name(frame.stem())))?;
        kept += 1;
    }

    Ok((kept, dropped))
}

/// Variance of the Laplacian over interior pixels.
pub fn laplacian_variance(gray: &GrayImage) -> f64 {
    let (width, height) = gray.dimensions();
    if width < 3 || height < 3 {
        return 0.0;
    }

    let px = |x: u32, y: u32| f64::from(gray.get_pixel(x, y)[0]);
    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    let mut count = 0.0;

    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let lap = px(x - 1, y) + px(x + 1, y) + px(x, y - 1) + px(x, y + 1) - 4.0 * px(x, y);
            sum += lap;
            sum_sq += lap * lap;
            count += 1.0;
        }
    }

    let mean = sum / count;
    sum_sq / count - mean * mean
}

pub fn mean_luma(gray: &GrayImage) -> f64 {
    let pixels = gray.as_raw();
    if pixels.is_empty() {
        return 0.0;
    }
    pixels.iter().map(|p| f64::from(*p)).sum::<f64>() / pixels.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::JobConfig;
    use crate::resources::{JobResources, ResourceCache};
    use crate::stages::images::fixtures::{flat, textured, Pattern};
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
    fn test_quality_of_textured_frame() {
        let gray = DynamicImage::ImageRgb8(textured(Pattern::Rising, 90, 80)).to_luma8();
        let quality = FrameQuality::measure(&gray);
        assert!(quality.sharpness > 1000.0);
        assert!(quality.brightness > 100.0);
        assert!(quality.passes(100.0, 40.0));
    }

    #[test]
    fn test_quality_of_flat_frame() {
        let gray = DynamicImage::ImageRgb8(flat(128, 32, 32)).to_luma8();
        let quality = FrameQuality::measure(&gray);
        assert!(quality.sharpness.abs() < f64::EPSILON);
        assert!((quality.brightness - 128.0).abs() < f64::EPSILON);
        assert!(!quality.passes(100.0, 40.0));
    }

    #[test]
    fn test_tiny_image_has_no_sharpness() {
        let gray = DynamicImage::ImageRgb8(flat(200, 2, 2)).to_luma8();
        assert_eq!(laplacian_variance(&gray), 0.0);
    }

    #[tokio::test]
    async fn test_filtering_drops_blurry_and_dark_frames() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let input = dir.path().join("dedup");
        std::fs::create_dir_all(input.join("nested")).expect("mkdir");

        textured(Pattern::Rising, 90, 80)
            .save(input.join("frame_0001.png"))
            .expect("write frame");
        flat(128, 90, 80)
            .save(input.join("frame_0002.png"))
            .expect("write frame");
        textured(Pattern::Falling, 90, 80)
            .save(input.join("nested").join("frame_0003.png"))
            .expect("write frame");

        let output = dir.path().join("filtered");
        FilteringStage
            .run(&input, &output, &context(JobConfig::default()))
            .await
            .expect("filtering succeeds");

        assert!(output.join("frame_0001.png").exists());
        assert!(!output.join("frame_0002.png").exists());
        assert!(output.join("nested_frame_0003.png").exists());
        assert!(!output.join("nested").exists());
    }

    #[tokio::test]
    async fn test_brightness_threshold() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let input = dir.path().join("dedup");
        std::fs::create_dir(&input).expect("mkdir");
        flat(10, 32, 32)
            .save(input.join("dark.png"))
            .expect("write frame");
        flat(90, 32, 32)
            .save(input.join("bright.png"))
            .expect("write frame");

        let config = JobConfig {
            blur_variance_min: 0.0,
            ..JobConfig::default()
        };
        let output = dir.path().join("filtered");
        FilteringStage
            .run(&input, &output, &context(config))
            .await
            .expect("filtering succeeds");

        assert!(!output.join("dark.png").exists());
        assert!(output.join("bright.png").exists());
    }
}
