//! Face cropping.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use image::DynamicImage;
use tracing::{debug, info, warn};

use super::images::{copy_as_png, ensure_input, list_frames, load_image, save_png, Frame};
use super::{Stage, StageContext};
use crate::error::StageError;
use crate::resources::{Availability, Detection, FaceDetector};

/// Crops every detected face, with a margin, into its own image.
///
/// Frames without a usable detection, or every frame when the detector is
/// unavailable, are copied through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct CroppingStage;

#[derive(Debug, Clone, Copy)]
struct CropParams {
    margin: f64,
    confidence_min: f64,
    batch_size: usize,
}

#[async_trait]
impl Stage for CroppingStage {
    async fn run(
        &self,
        input: &Path,
        output: &Path,
        ctx: &StageContext,
    ) -> Result<PathBuf, StageError> {
        ensure_input(input)?;

        let detector = match ctx.resources.detector().await {
            Availability::Ready(detector) => Some(detector),
            Availability::Unavailable(reason) => {
                warn!(job = %ctx.job_id, reason = %reason, "Face detector unavailable, copying frames through");
                None
            }
        };

        let params = CropParams {
            margin: ctx.config.crop_margin_fraction,
            confidence_min: ctx.config.detection_confidence_min,
            batch_size: ctx.config.detection_batch_size.max(1),
        };
        let src = input.to_path_buf();
        let dest = output.to_path_buf();

        let (crops, passed) =
            tokio::task::spawn_blocking(move || crop_frames(&src, &dest, detector, params))
                .await??;

        info!(job = %ctx.job_id, crops = crops, passed_through = passed, "Cropping finished");
        Ok(output.to_path_buf())
    }
}

fn crop_frames(
    input: &Path,
    output: &Path,
    detector: Option<Arc<dyn FaceDetector>>,
    params: CropParams,
) -> Result<(usize, usize), StageError> {
    std::fs::create_dir_all(output)?;
    let frames = list_frames(input)?;
    let mut crops = 0usize;
    let mut passed = 0usize;

    let Some(detector) = detector else {
        for frame in &frames {
            pass_through(frame, output)?;
        }
        return Ok((0, frames.len()));
    };

    for batch in frames.chunks(params.batch_size) {
        let paths: Vec<PathBuf> = batch.iter().map(|f| f.path.clone()).collect();
        let detections = detector.detect_batch(&paths)?;
        if detections.len() != batch.len() {
            return Err(StageError::Inference(format!(
                "detector returned {} results for {} images",
                detections.len(),
                batch.len()
            )));
        }

        for (frame, found) in batch.iter().zip(detections) {
            let boxes: Vec<Detection> = found
                .into_iter()
                .filter(|d| d.confidence >= params.confidence_min)
                .collect();

            let cropped: Vec<DynamicImage> = if boxes.is_empty() {
                Vec::new()
            } else {
                let image = load_image(&frame.path)?;
                boxes
                    .iter()
                    .filter_map(|d| crop_with_margin(&image, d, params.margin))
                    .collect()
            };

            if cropped.is_empty() {
                debug!(frame = %frame.flat_name, "No usable face detected");
                pass_through(frame, output)?;
                passed += 1;
                continue;
            }

            for (idx, crop) in cropped.iter().enumerate() {
                save_png(crop, &output.join(crop_name(frame.stem(), idx, cropped.len())))?;
            }
            crops += cropped.len();
        }
    }

    Ok((crops, passed))
}

fn pass_through(frame: &Frame, output: &Path) -> Result<(), StageError> {
    copy_as_png(&frame.path, &output.join(format!("{}.png", frame.stem())))
}

/// Output name for crop `idx` of `total` taken from `stem`.
pub fn crop_name(stem: &str, idx: usize, total: usize) -> String {
    if total > 1 {
        format!("{}_{:02}.png", stem, idx)
    } else {
        format!("{}.png", stem)
    }
}

/// Crops `detection` grown by `margin / 2` of its size on every side,
/// clamped to the image bounds. `None` when nothing of the box lies inside
/// the image.
pub fn crop_with_margin(
    image: &DynamicImage,
    detection: &Detection,
    margin: f64,
) -> Option<DynamicImage> {
    let (width, height) = (image.width(), image.height());
    let margin_w = (f64::from(detection.width) * margin / 2.0) as u32;
    let margin_h = (f64::from(detection.height) * margin / 2.0) as u32;

    let x0 = detection.x.saturating_sub(margin_w).min(width);
    let y0 = detection.y.saturating_sub(margin_h).min(height);
    let x1 = detection
        .x
        .saturating_add(detection.width)
        .saturating_add(margin_w)
        .min(width);
    let y1 = detection
        .y
        .saturating_add(detection.height)
        .saturating_add(margin_h)
        .min(height);

    let (crop_w, crop_h) = (x1.saturating_sub(x0), y1.saturating_sub(y0));
    if crop_w == 0 || crop_h == 0 {
        return None;
    }
    Some(image.crop_imm(x0, y0, crop_w, crop_h))
}
