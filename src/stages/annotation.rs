//! Caption generation.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::images::{copy_as_png, ensure_input, image_root, list_frames, CAPTIONS_DIR, IMAGES_DIR};
use super::{Stage, StageContext};
use crate::error::StageError;
use crate::resources::{Availability, Tag, Tagger};

/// Tag appended to the trigger word when no tagger is available.
pub const FALLBACK_TAG: &str = "anime_style";

/// Writes one caption per frame.
///
/// Output layout: `images/<frame>.png` and `captions/<frame>.txt`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnnotationStage;

#[async_trait]
impl Stage for AnnotationStage {
    async fn run(
        &self,
        input: &Path,
        output: &Path,
        ctx: &StageContext,
    ) -> Result<PathBuf, StageError> {
        ensure_input(input)?;

        let tagger = match ctx.resources.tagger().await {
            Availability::Ready(tagger) => Some(tagger),
            Availability::Unavailable(reason) => {
                warn!(job = %ctx.job_id, reason = %reason, "Tagger unavailable, using fallback captions");
                None
            }
        };

        let src = image_root(input);
        let dest = output.to_path_buf();
        let trigger = ctx.config.trigger_word.clone();
        let threshold = ctx.config.tag_threshold;

        let count = tokio::task::spawn_blocking(move || {
            annotate(&src, &dest, &trigger, threshold, tagger)
        })
        .await??;

        info!(job = %ctx.job_id, captions = count, "Annotation finished");
        Ok(output.to_path_buf())
    }
}

fn annotate(
    input: &Path,
    output: &Path,
    trigger: &str,
    threshold: f64,
    tagger: Option<Arc<dyn Tagger>>,
) -> Result<usize, StageError> {
    let images_dir = output.join(IMAGES_DIR);
    let captions_dir = output.join(CAPTIONS_DIR);
    std::fs::create_dir_all(&images_dir)?;
    std::fs::create_dir_all(&captions_dir)?;

    let frames = list_frames(input)?;
    let total = frames.len();

    for (idx, frame) in frames.iter().enumerate() {
        let caption = match &tagger {
            Some(tagger) => build_caption(trigger, &tagger.tag(&frame.path)?, threshold),
            None => fallback_caption(trigger),
        };

        copy_as_png(&frame.path, &images_dir.join(format!("{}.png", frame.stem())))?;
        std::fs::write(captions_dir.join(format!("{}.txt", frame.stem())), &caption)?;
        debug!(frame = %frame.flat_name, progress = idx + 1, total = total, "Captioned");
    }

    Ok(total)
}

/// `"<trigger>, tag, tag"` for tags scoring above `threshold`, or just the
/// trigger when none qualifies.
pub fn build_caption(trigger: &str, tags: &[Tag], threshold: f64) -> String {
    let selected: Vec<&str> = tags
        .iter()
        .filter(|t| t.score > threshold)
        .map(|t| t.name.as_str())
        .collect();

    if selected.is_empty() {
        trigger.to_string()
    } else {
        format!("{}, {}", trigger, selected.join(", "))
    }
}

pub fn fallback_caption(trigger: &str) -> String {
    format!("{}, {}", trigger, FALLBACK_TAG)
}
