//! Super-resolution upscaling with a resize fallback.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use image::imageops::FilterType;
use tracing::{info, warn};

use super::images::{ensure_input, list_frames, load_image, png_name, save_png};
use super::{Stage, StageContext};
use crate::error::StageError;
use crate::resources::{Availability, Upscaler};

/// Enlarges every frame by `upscale_factor`.
///
/// Uses the shared upscaler when it is ready, a Lanczos3 resize otherwise.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpscalingStage;

#[async_trait]
impl Stage for UpscalingStage {
    async fn run(
        &self,
        input: &Path,
        output: &Path,
        ctx: &StageContext,
    ) -> Result<PathBuf, StageError> {
        ensure_input(input)?;

        let model = match ctx.resources.upscaler().await {
            Availability::Ready(model) => Some(model),
            Availability::Unavailable(reason) => {
                warn!(job = %ctx.job_id, reason = %reason, "Upscaler unavailable, using resize");
                None
            }
        };

        let src = input.to_path_buf();
        let dest = output.to_path_buf();
        let factor = ctx.config.upscale_factor;
        let used_model = model.is_some();

        let count =
            tokio::task::spawn_blocking(move || upscale_frames(&src, &dest, factor, model))
                .await??;

        info!(
            job = %ctx.job_id,
            frames = count,
            factor = factor,
            model = used_model,
            "Upscaling finished"
        );
        Ok(output.to_path_buf())
    }
}

fn upscale_frames(
    input: &Path,
    output: &Path,
    factor: u32,
    model: Option<Arc<dyn Upscaler>>,
) -> Result<usize, StageError> {
    std::fs::create_dir_all(output)?;
    let frames = list_frames(input)?;

    for frame in &frames {
        let dest = output.join(png_name(frame.stem()));
        match &model {
            Some(model) => model.upscale(&frame.path, &dest, factor)?,
            None => {
                let image = load_image(&frame.path)?;
                let resized = image.resize_exact(
                    image.width() * factor,
                    image.height() * factor,
                    FilterType::Lanczos3,
                );
                save_png(&resized, &dest)?;
            }
        }
    }

    Ok(frames.len())
}
